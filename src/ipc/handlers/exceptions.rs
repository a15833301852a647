use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::sweep::is_unique_violation;
use chrono::{Datelike, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn with_details(code: &'static str, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn db_err(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_query_failed", e.to_string())
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn get_required_date(params: &serde_json::Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = get_required_str(params, key)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map_err(|_| HandlerErr::new("bad_params", format!("{} must be YYYY-MM-DD", key)))
}

struct SlotRow {
    group_id: String,
    subject_id: String,
    faculty_id: String,
    weekday: i64,
    time_slot_id: String,
}

fn load_slot(conn: &Connection, slot_id: &str) -> Result<SlotRow, HandlerErr> {
    conn.query_row(
        "SELECT group_id, subject_id, faculty_id, weekday, time_slot_id
         FROM schedule_slots WHERE id = ?",
        [slot_id],
        |r| {
            Ok(SlotRow {
                group_id: r.get(0)?,
                subject_id: r.get(1)?,
                faculty_id: r.get(2)?,
                weekday: r.get(3)?,
                time_slot_id: r.get(4)?,
            })
        },
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| HandlerErr::new("not_found", "slot not found"))
}

fn ensure_faculty(conn: &Connection, faculty_id: &str) -> Result<(), HandlerErr> {
    let found = conn
        .query_row("SELECT 1 FROM faculty WHERE id = ?", [faculty_id], |_r| Ok(()))
        .optional()
        .map_err(db_err)?;
    if found.is_none() {
        return Err(HandlerErr::new("not_found", "faculty not found"));
    }
    Ok(())
}

fn ensure_date_matches_slot(slot: &SlotRow, date: NaiveDate) -> Result<(), HandlerErr> {
    let weekday = date.weekday().num_days_from_monday() as i64;
    if weekday != slot.weekday {
        return Err(HandlerErr::new(
            "bad_params",
            "slot does not meet on that date",
        ));
    }
    Ok(())
}

fn records_exist_for_slot(conn: &Connection, slot_id: &str, date: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM attendance_records WHERE slot_id = ? AND date = ? LIMIT 1",
        (slot_id, date),
        |_r| Ok(()),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(db_err)
}

fn cancel_slot(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let slot_id = get_required_str(params, "slotId")?;
    let date = get_required_date(params, "date")?;
    let date_str = date.format("%Y-%m-%d").to_string();
    let cancelled_by = match params.get("cancelledBy").and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => {
            let id = s.trim().to_string();
            ensure_faculty(conn, &id)?;
            Some(id)
        }
        _ => None,
    };

    let slot = load_slot(conn, &slot_id)?;
    ensure_date_matches_slot(&slot, date)?;

    // A cancellation asserts the class did not happen; recorded attendance
    // says it did. The two cannot coexist for one (slot, date).
    if records_exist_for_slot(conn, &slot_id, &date_str)? {
        return Err(HandlerErr::new(
            "conflict",
            "attendance is already recorded for this session",
        ));
    }

    let cancellation_id = Uuid::new_v4().to_string();
    let insert = conn.execute(
        "INSERT INTO cancellations(id, slot_id, date, cancelled_by, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &cancellation_id,
            &slot_id,
            &date_str,
            &cancelled_by,
            Utc::now().to_rfc3339(),
        ),
    );
    match insert {
        Ok(_) => Ok(json!({ "cancellationId": cancellation_id })),
        Err(e) if is_unique_violation(&e) => Err(HandlerErr::new(
            "conflict",
            "session is already cancelled on that date",
        )),
        Err(e) => Err(HandlerErr::new("db_insert_failed", e.to_string())),
    }
}

fn uncancel_slot(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let slot_id = get_required_str(params, "slotId")?;
    let date = get_required_date(params, "date")?;
    let date_str = date.format("%Y-%m-%d").to_string();

    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT id, cancelled_by FROM cancellations WHERE slot_id = ? AND date = ?",
            (&slot_id, &date_str),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((cancellation_id, cancelled_by)) = row else {
        return Err(HandlerErr::new("not_found", "no cancellation on that date"));
    };
    if cancelled_by.is_none() {
        // System rows mark a lapsed marking window; the next sweep would just
        // recreate them.
        return Err(HandlerErr::new(
            "conflict",
            "system cancellations cannot be withdrawn",
        ));
    }

    conn.execute("DELETE FROM cancellations WHERE id = ?", [&cancellation_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn substitute_slot(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let slot_id = get_required_str(params, "slotId")?;
    let date = get_required_date(params, "date")?;
    let substitute_id = get_required_str(params, "substituteFacultyId")?;
    let date_str = date.format("%Y-%m-%d").to_string();

    let slot = load_slot(conn, &slot_id)?;
    ensure_date_matches_slot(&slot, date)?;
    ensure_faculty(conn, &substitute_id)?;
    if substitute_id == slot.faculty_id {
        return Err(HandlerErr::new(
            "bad_params",
            "substitute is already the scheduled faculty",
        ));
    }

    conn.execute(
        "INSERT INTO substitutions(id, slot_id, date, substitute_faculty_id)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(slot_id, date) DO UPDATE SET
           substitute_faculty_id = excluded.substitute_faculty_id",
        (Uuid::new_v4().to_string(), &slot_id, &date_str, &substitute_id),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    let substitute_name: String = conn
        .query_row("SELECT name FROM faculty WHERE id = ?", [&substitute_id], |r| r.get(0))
        .map_err(db_err)?;

    // The caller owns delivery; this only builds the payload.
    Ok(json!({
        "ok": true,
        "notification": {
            "substituteFacultyId": substitute_id,
            "substituteName": substitute_name,
            "date": date_str,
            "groupId": slot.group_id,
            "subjectId": slot.subject_id,
            "timeSlotId": slot.time_slot_id,
        }
    }))
}

fn list_for_date(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let date = get_required_date(params, "date")?;
    let date_str = date.format("%Y-%m-%d").to_string();

    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.slot_id, c.cancelled_by, c.created_at, subj.name, g.name
             FROM cancellations c
             JOIN schedule_slots ss ON ss.id = c.slot_id
             JOIN subjects subj ON subj.id = ss.subject_id
             JOIN student_groups g ON g.id = ss.group_id
             WHERE c.date = ?
             ORDER BY g.name, subj.name",
        )
        .map_err(db_err)?;
    let cancellations = stmt
        .query_map([&date_str], |r| {
            let cancelled_by: Option<String> = r.get(2)?;
            Ok(json!({
                "cancellationId": r.get::<_, String>(0)?,
                "slotId": r.get::<_, String>(1)?,
                "system": cancelled_by.is_none(),
                "cancelledBy": cancelled_by,
                "createdAt": r.get::<_, String>(3)?,
                "subjectName": r.get::<_, String>(4)?,
                "groupName": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.slot_id, s.substitute_faculty_id, f.name, subj.name, g.name
             FROM substitutions s
             JOIN schedule_slots ss ON ss.id = s.slot_id
             JOIN faculty f ON f.id = s.substitute_faculty_id
             JOIN subjects subj ON subj.id = ss.subject_id
             JOIN student_groups g ON g.id = ss.group_id
             WHERE s.date = ?
             ORDER BY g.name, subj.name",
        )
        .map_err(db_err)?;
    let substitutions = stmt
        .query_map([&date_str], |r| {
            Ok(json!({
                "substitutionId": r.get::<_, String>(0)?,
                "slotId": r.get::<_, String>(1)?,
                "substituteFacultyId": r.get::<_, String>(2)?,
                "substituteName": r.get::<_, String>(3)?,
                "subjectName": r.get::<_, String>(4)?,
                "groupName": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    Ok(json!({
        "date": date_str,
        "cancellations": cancellations,
        "substitutions": substitutions,
    }))
}

fn create_extra_class(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let faculty_id = get_required_str(params, "facultyId")?;
    let group_id = get_required_str(params, "groupId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let time_slot_id = get_required_str(params, "timeSlotId")?;
    let date = get_required_date(params, "date")?;
    let date_str = date.format("%Y-%m-%d").to_string();
    let weekday = date.weekday().num_days_from_monday() as i64;

    ensure_faculty(conn, &faculty_id)?;
    for (sql, what) in [
        ("SELECT 1 FROM student_groups WHERE id = ?", "group"),
        ("SELECT 1 FROM subjects WHERE id = ?", "subject"),
    ] {
        let id = if what == "group" { &group_id } else { &subject_id };
        let found = conn
            .query_row(sql, [id], |_r| Ok(()))
            .optional()
            .map_err(db_err)?;
        if found.is_none() {
            return Err(HandlerErr::new("not_found", format!("{} not found", what)));
        }
    }
    let schedulable: Option<i64> = conn
        .query_row(
            "SELECT is_schedulable FROM time_slots WHERE id = ?",
            [&time_slot_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    match schedulable {
        None => return Err(HandlerErr::new("not_found", "time slot not found")),
        Some(0) => {
            return Err(HandlerErr::new("bad_params", "time slot is not schedulable"))
        }
        Some(_) => {}
    }

    // An extra class must not collide with the weekly template that resolves
    // on the same date, for either the teacher or the group.
    for (column, value, message) in [
        ("faculty_id", &faculty_id, "faculty member already teaches in this period"),
        ("group_id", &group_id, "group already has a class in this period"),
    ] {
        let sql = format!(
            "SELECT id FROM schedule_slots WHERE weekday = ? AND time_slot_id = ? AND {} = ?",
            column
        );
        let clash: Option<String> = conn
            .query_row(&sql, (weekday, &time_slot_id, value), |r| r.get(0))
            .optional()
            .map_err(db_err)?;
        if let Some(slot_id) = clash {
            return Err(HandlerErr::with_details(
                "conflict",
                message,
                json!({ "slotId": slot_id }),
            ));
        }
    }

    let extra_class_id = Uuid::new_v4().to_string();
    let insert = conn.execute(
        "INSERT INTO extra_classes(id, faculty_id, group_id, subject_id, date, time_slot_id, status)
         VALUES(?, ?, ?, ?, ?, ?, 'scheduled')",
        (&extra_class_id, &faculty_id, &group_id, &subject_id, &date_str, &time_slot_id),
    );
    match insert {
        Ok(_) => Ok(json!({ "extraClassId": extra_class_id })),
        Err(e) if is_unique_violation(&e) => Err(HandlerErr::new(
            "conflict",
            "an extra class is already booked in this period",
        )),
        Err(e) => Err(HandlerErr::new("db_insert_failed", e.to_string())),
    }
}

fn cancel_extra_class(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let extra_class_id = get_required_str(params, "extraClassId")?;
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM extra_classes WHERE id = ?",
            [&extra_class_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    let Some(status) = status else {
        return Err(HandlerErr::new("not_found", "extra class not found"));
    };
    if status == "cancelled" {
        return Err(HandlerErr::new("conflict", "extra class is already cancelled"));
    }
    let has_records: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM attendance_records WHERE extra_class_id = ? LIMIT 1",
            [&extra_class_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(db_err)?;
    if has_records.is_some() {
        return Err(HandlerErr::new(
            "conflict",
            "attendance is already recorded for this extra class",
        ));
    }
    conn.execute(
        "UPDATE extra_classes SET status = 'cancelled' WHERE id = ?",
        [&extra_class_id],
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "ok": true }))
}

fn list_extra_classes(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let group_filter = params
        .get("groupId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let from = params
        .get("from")
        .and_then(|v| v.as_str())
        .unwrap_or("0001-01-01")
        .to_string();
    let to = params
        .get("to")
        .and_then(|v| v.as_str())
        .unwrap_or("9999-12-31")
        .to_string();

    let mut sql = String::from(
        "SELECT ec.id, ec.date, ec.status, ec.group_id, g.name, ec.subject_id, subj.name,
                ec.faculty_id, f.name, ec.time_slot_id, ts.start_time, ts.end_time
         FROM extra_classes ec
         JOIN student_groups g ON g.id = ec.group_id
         JOIN subjects subj ON subj.id = ec.subject_id
         JOIN faculty f ON f.id = ec.faculty_id
         JOIN time_slots ts ON ts.id = ec.time_slot_id
         WHERE ec.date BETWEEN ? AND ?",
    );
    let mut binds: Vec<String> = vec![from, to];
    if let Some(g) = group_filter {
        sql.push_str(" AND ec.group_id = ?");
        binds.push(g);
    }
    sql.push_str(" ORDER BY ec.date, ts.start_time, g.name");

    let mut stmt = conn.prepare(&sql).map_err(db_err)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            Ok(json!({
                "extraClassId": r.get::<_, String>(0)?,
                "date": r.get::<_, String>(1)?,
                "status": r.get::<_, String>(2)?,
                "groupId": r.get::<_, String>(3)?,
                "groupName": r.get::<_, String>(4)?,
                "subjectId": r.get::<_, String>(5)?,
                "subjectName": r.get::<_, String>(6)?,
                "facultyId": r.get::<_, String>(7)?,
                "facultyName": r.get::<_, String>(8)?,
                "timeSlotId": r.get::<_, String>(9)?,
                "startTime": r.get::<_, String>(10)?,
                "endTime": r.get::<_, String>(11)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;
    Ok(json!({ "extraClasses": rows }))
}

fn dispatch(
    state: &mut AppState,
    req: &Request,
    f: impl Fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exceptions.cancel" => Some(dispatch(state, req, cancel_slot)),
        "exceptions.uncancel" => Some(dispatch(state, req, uncancel_slot)),
        "exceptions.substitute" => Some(dispatch(state, req, substitute_slot)),
        "exceptions.listForDate" => Some(dispatch(state, req, list_for_date)),
        "extraclasses.create" => Some(dispatch(state, req, create_extra_class)),
        "extraclasses.cancel" => Some(dispatch(state, req, cancel_extra_class)),
        "extraclasses.list" => Some(dispatch(state, req, list_extra_classes)),
        _ => None,
    }
}
