use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::resolve;
use crate::sweep::is_unique_violation;
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const WEEKDAY_NAMES: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

pub fn weekday_name(weekday: i64) -> &'static str {
    WEEKDAY_NAMES
        .get(weekday as usize)
        .copied()
        .unwrap_or("Monday")
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn required_weekday(req: &Request) -> Result<i64, serde_json::Value> {
    let raw = required_str(req, "weekday")?;
    WEEKDAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(&raw))
        .map(|i| i as i64)
        .ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("unknown weekday '{}'", raw),
                None,
            )
        })
}

pub fn required_date(req: &Request, key: &str) -> Result<NaiveDate, serde_json::Value> {
    let raw = required_str(req, key)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|_| {
        err(
            &req.id,
            "bad_params",
            format!("{} must be YYYY-MM-DD", key),
            None,
        )
    })
}

fn ensure_exists(
    conn: &Connection,
    req: &Request,
    table: &str,
    id: &str,
    what: &str,
) -> Result<(), serde_json::Value> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ? LIMIT 1", table);
    let found = conn
        .query_row(&sql, [id], |_r| Ok(()))
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if found.is_none() {
        return Err(err(
            &req.id,
            "not_found",
            format!("{} not found", what),
            None,
        ));
    }
    Ok(())
}

fn ensure_schedulable(
    conn: &Connection,
    req: &Request,
    time_slot_id: &str,
) -> Result<(), serde_json::Value> {
    let schedulable: Option<i64> = conn
        .query_row(
            "SELECT is_schedulable FROM time_slots WHERE id = ?",
            [time_slot_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    match schedulable {
        None => Err(err(&req.id, "not_found", "time slot not found", None)),
        Some(0) => Err(err(
            &req.id,
            "bad_params",
            "time slot is not schedulable",
            None,
        )),
        Some(_) => Ok(()),
    }
}

/// Double-booking guard for the weekly template. Returns the colliding slot id
/// so the caller can surface it.
fn find_slot_conflict(
    conn: &Connection,
    req: &Request,
    weekday: i64,
    time_slot_id: &str,
    column: &str,
    value: &str,
    exclude_slot: Option<&str>,
) -> Result<Option<String>, serde_json::Value> {
    let sql = format!(
        "SELECT id FROM schedule_slots WHERE weekday = ? AND time_slot_id = ? AND {} = ?",
        column
    );
    let found: Option<String> = conn
        .query_row(&sql, (weekday, time_slot_id, value), |r| r.get(0))
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    Ok(found.filter(|id| exclude_slot != Some(id.as_str())))
}

fn handle_create_slot(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let group_id = match required_str(req, "groupId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let faculty_id = match required_str(req, "facultyId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let time_slot_id = match required_str(req, "timeSlotId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let weekday = match required_weekday(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    for (table, id, what) in [
        ("student_groups", &group_id, "group"),
        ("subjects", &subject_id, "subject"),
        ("faculty", &faculty_id, "faculty"),
    ] {
        if let Err(e) = ensure_exists(conn, req, table, id, what) {
            return e;
        }
    }
    if let Err(e) = ensure_schedulable(conn, req, &time_slot_id) {
        return e;
    }

    match find_slot_conflict(conn, req, weekday, &time_slot_id, "faculty_id", &faculty_id, None) {
        Ok(Some(other)) => {
            return err(
                &req.id,
                "conflict",
                "faculty member already teaches in this period",
                Some(json!({ "slotId": other })),
            )
        }
        Ok(None) => {}
        Err(e) => return e,
    }
    match find_slot_conflict(conn, req, weekday, &time_slot_id, "group_id", &group_id, None) {
        Ok(Some(other)) => {
            return err(
                &req.id,
                "conflict",
                "group already has a class in this period",
                Some(json!({ "slotId": other })),
            )
        }
        Ok(None) => {}
        Err(e) => return e,
    }

    let slot_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO schedule_slots(id, group_id, subject_id, faculty_id, weekday, time_slot_id)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&slot_id, &group_id, &subject_id, &faculty_id, weekday, &time_slot_id),
    ) {
        Ok(_) => ok(&req.id, json!({ "slotId": slot_id })),
        // The schema-level UNIQUE pair is the authority; a race past the
        // pre-check still comes back as a conflict, not a 500.
        Err(e) if is_unique_violation(&e) => {
            err(&req.id, "conflict", "period is already booked", None)
        }
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_update_slot(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let slot_id = match required_str(req, "slotId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let row: Option<(String, String, i64, String)> = match conn
        .query_row(
            "SELECT faculty_id, subject_id, weekday, time_slot_id FROM schedule_slots WHERE id = ?",
            [&slot_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((old_faculty, old_subject, weekday, time_slot_id)) = row else {
        return err(&req.id, "not_found", "slot not found", None);
    };

    let new_faculty = req
        .params
        .get("facultyId")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| old_faculty.clone());
    let new_subject = req
        .params
        .get("subjectId")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| old_subject.clone());

    if new_faculty != old_faculty {
        if let Err(e) = ensure_exists(conn, req, "faculty", &new_faculty, "faculty") {
            return e;
        }
        match find_slot_conflict(
            conn,
            req,
            weekday,
            &time_slot_id,
            "faculty_id",
            &new_faculty,
            Some(&slot_id),
        ) {
            Ok(Some(other)) => {
                return err(
                    &req.id,
                    "conflict",
                    "faculty member already teaches in this period",
                    Some(json!({ "slotId": other })),
                )
            }
            Ok(None) => {}
            Err(e) => return e,
        }
    }
    if new_subject != old_subject {
        if let Err(e) = ensure_exists(conn, req, "subjects", &new_subject, "subject") {
            return e;
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE schedule_slots SET faculty_id = ?, subject_id = ? WHERE id = ?",
        (&new_faculty, &new_subject, &slot_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_delete_slot(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let slot_id = match required_str(req, "slotId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = ensure_exists(conn, req, "schedule_slots", &slot_id, "slot") {
        return e;
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    // Dependents first; the slot's history goes with it.
    for (sql, table) in [
        ("DELETE FROM attendance_records WHERE slot_id = ?", "attendance_records"),
        ("DELETE FROM substitutions WHERE slot_id = ?", "substitutions"),
        ("DELETE FROM cancellations WHERE slot_id = ?", "cancellations"),
        ("DELETE FROM schedule_slots WHERE id = ?", "schedule_slots"),
    ] {
        if let Err(e) = tx.execute(sql, [&slot_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_list_slots(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let group_filter = req
        .params
        .get("groupId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let faculty_filter = req
        .params
        .get("facultyId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut sql = String::from(
        "SELECT ss.id, ss.weekday, ss.group_id, g.name, ss.subject_id, subj.name,
                ss.faculty_id, f.name, ss.time_slot_id, ts.start_time, ts.end_time
         FROM schedule_slots ss
         JOIN student_groups g ON g.id = ss.group_id
         JOIN subjects subj ON subj.id = ss.subject_id
         JOIN faculty f ON f.id = ss.faculty_id
         JOIN time_slots ts ON ts.id = ss.time_slot_id",
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(g) = &group_filter {
        sql.push_str(" WHERE ss.group_id = ?");
        binds.push(g.clone());
    } else if let Some(f) = &faculty_filter {
        sql.push_str(" WHERE ss.faculty_id = ?");
        binds.push(f.clone());
    }
    sql.push_str(" ORDER BY ss.weekday, ts.start_time, g.name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            let weekday: i64 = r.get(1)?;
            Ok(json!({
                "slotId": r.get::<_, String>(0)?,
                "weekday": weekday_name(weekday),
                "groupId": r.get::<_, String>(2)?,
                "groupName": r.get::<_, String>(3)?,
                "subjectId": r.get::<_, String>(4)?,
                "subjectName": r.get::<_, String>(5)?,
                "facultyId": r.get::<_, String>(6)?,
                "facultyName": r.get::<_, String>(7)?,
                "timeSlotId": r.get::<_, String>(8)?,
                "startTime": r.get::<_, String>(9)?,
                "endTime": r.get::<_, String>(10)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(slots) => ok(&req.id, json!({ "slots": slots })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_resolve_day(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let date = match required_date(req, "date") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match resolve::resolve_day(conn, date) {
        Ok(sessions) => match serde_json::to_value(&sessions) {
            Ok(v) => ok(
                &req.id,
                json!({
                    "date": date.format("%Y-%m-%d").to_string(),
                    "weekday": weekday_name(
                        chrono::Datelike::weekday(&date).num_days_from_monday() as i64
                    ),
                    "sessions": v
                }),
            ),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Err(e) => err(&req.id, &e.code, e.message, None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schedule.createSlot" => Some(handle_create_slot(state, req)),
        "schedule.updateSlot" => Some(handle_update_slot(state, req)),
        "schedule.deleteSlot" => Some(handle_delete_slot(state, req)),
        "schedule.listSlots" => Some(handle_list_slots(state, req)),
        "schedule.resolveDay" => Some(handle_resolve_day(state, req)),
        _ => None,
    }
}
