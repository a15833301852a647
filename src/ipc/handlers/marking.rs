use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::sweep::is_unique_violation;
use chrono::{Datelike, Duration, NaiveDate, Utc};
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

/// Optional clock override so schedulers and tests can pin "today".
fn get_now_date(params: &serde_json::Value) -> Result<NaiveDate, HandlerErr> {
    match params.get("now").and_then(|v| v.as_str()) {
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map_err(|_| HandlerErr::new("bad_params", "now must be YYYY-MM-DD")),
        None => Ok(Utc::now().date_naive()),
    }
}

/// The XOR session reference from the wire: exactly one of slotId and
/// extraClassId, enforced before anything touches the store.
enum SessionKey {
    Slot(String),
    Extra(String),
}

fn session_key(params: &serde_json::Value) -> Result<SessionKey, HandlerErr> {
    let slot = params
        .get("slotId")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let extra = params
        .get("extraClassId")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    match (slot, extra) {
        (Some(s), None) => Ok(SessionKey::Slot(s)),
        (None, Some(e)) => Ok(SessionKey::Extra(e)),
        _ => Err(HandlerErr::new(
            "invalid_reference",
            "exactly one of slotId or extraClassId is required",
        )),
    }
}

struct SessionCtx {
    key: SessionKey,
    group_id: String,
    subject_id: String,
    date: String,
}

/// Pin the session reference to a concrete date: the slot must meet on that
/// weekday (or the extra class must be scheduled exactly there), and a
/// cancelled session is not markable.
fn load_session(
    conn: &Connection,
    key: SessionKey,
    date: NaiveDate,
    allow_cancelled: bool,
) -> Result<SessionCtx, HandlerErr> {
    let date_str = date.format("%Y-%m-%d").to_string();
    match key {
        SessionKey::Slot(slot_id) => {
            let row: Option<(String, String, i64)> = conn
                .query_row(
                    "SELECT group_id, subject_id, weekday FROM schedule_slots WHERE id = ?",
                    [&slot_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
                )
                .optional()
                .map_err(db_err)?;
            let Some((group_id, subject_id, weekday)) = row else {
                return Err(HandlerErr::new("not_found", "slot not found"));
            };
            if weekday != date.weekday().num_days_from_monday() as i64 {
                return Err(HandlerErr::new("not_found", "slot does not meet on that date"));
            }
            if !allow_cancelled {
                let cancelled: Option<i64> = conn
                    .query_row(
                        "SELECT 1 FROM cancellations WHERE slot_id = ? AND date = ? LIMIT 1",
                        (&slot_id, &date_str),
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(db_err)?;
                if cancelled.is_some() {
                    return Err(HandlerErr::new(
                        "conflict",
                        "session is cancelled on that date",
                    ));
                }
            }
            Ok(SessionCtx {
                key: SessionKey::Slot(slot_id),
                group_id,
                subject_id,
                date: date_str,
            })
        }
        SessionKey::Extra(extra_id) => {
            let row: Option<(String, String, String, String)> = conn
                .query_row(
                    "SELECT group_id, subject_id, date, status FROM extra_classes WHERE id = ?",
                    [&extra_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                )
                .optional()
                .map_err(db_err)?;
            let Some((group_id, subject_id, extra_date, status)) = row else {
                return Err(HandlerErr::new("not_found", "extra class not found"));
            };
            if extra_date != date_str {
                return Err(HandlerErr::new(
                    "not_found",
                    "extra class is not scheduled on that date",
                ));
            }
            if !allow_cancelled && status == "cancelled" {
                return Err(HandlerErr::new("conflict", "extra class is cancelled"));
            }
            Ok(SessionCtx {
                key: SessionKey::Extra(extra_id),
                group_id,
                subject_id,
                date: date_str,
            })
        }
    }
}

fn session_columns(key: &SessionKey) -> (Option<&str>, Option<&str>) {
    match key {
        SessionKey::Slot(id) => (Some(id.as_str()), None),
        SessionKey::Extra(id) => (None, Some(id.as_str())),
    }
}

fn load_settings(conn: &Connection) -> Result<db::Settings, HandlerErr> {
    db::load_settings(conn).map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

struct Entry {
    student_id: String,
    status: String,
    is_late: bool,
}

fn parse_entries(params: &serde_json::Value) -> Result<Vec<Entry>, HandlerErr> {
    let Some(raw) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing entries"));
    };
    if raw.is_empty() {
        return Err(HandlerErr::new("bad_params", "entries must not be empty"));
    }
    let mut seen = std::collections::HashSet::new();
    let mut entries = Vec::with_capacity(raw.len());
    for item in raw {
        let student_id = item
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerErr::new("bad_params", "entry missing studentId"))?;
        if !seen.insert(student_id.clone()) {
            return Err(HandlerErr::with_details(
                "bad_params",
                "duplicate studentId in entries",
                json!({ "studentId": student_id }),
            ));
        }
        let status = item
            .get("status")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .ok_or_else(|| HandlerErr::new("bad_params", "entry missing status"))?;
        if status != "Present" && status != "Absent" {
            return Err(HandlerErr::new(
                "bad_params",
                "status must be 'Present' or 'Absent'",
            ));
        }
        let is_late = item.get("isLate").and_then(|v| v.as_bool()).unwrap_or(false);
        entries.push(Entry {
            student_id,
            status,
            is_late,
        });
    }
    Ok(entries)
}

fn mark_session(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let date = get_required_date(params, "date")?;
    let now = get_now_date(params)?;
    let marked_by = get_required_str(params, "markedBy")?;
    let key = session_key(params)?;
    let entries = parse_entries(params)?;

    let marker_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM faculty WHERE id = ?", [&marked_by], |r| r.get(0))
        .optional()
        .map_err(db_err)?;
    if marker_exists.is_none() {
        return Err(HandlerErr::new("not_found", "marking faculty not found"));
    }

    let settings = load_settings(conn)?;
    let deadline = date + Duration::days(settings.mark_deadline_days);
    if now > deadline {
        return Err(HandlerErr::with_details(
            "deadline_exceeded",
            "marking window for this session has closed",
            json!({ "deadline": deadline.format("%Y-%m-%d").to_string() }),
        ));
    }

    let session = load_session(conn, key, date, false)?;

    for entry in &entries {
        let in_group: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM students WHERE id = ? AND group_id = ?",
                (&entry.student_id, &session.group_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if in_group.is_none() {
            return Err(HandlerErr::with_details(
                "bad_params",
                "student is not in this session's group",
                json!({ "studentId": entry.student_id }),
            ));
        }
    }

    let (slot_id, extra_class_id) = session_columns(&session.key);
    for entry in &entries {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM attendance_records
                 WHERE student_id = ? AND date = ?
                   AND ((?3 IS NOT NULL AND slot_id = ?3)
                     OR (?4 IS NOT NULL AND extra_class_id = ?4))
                 LIMIT 1",
                (&entry.student_id, &session.date, slot_id, extra_class_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if existing.is_some() {
            return Err(HandlerErr::with_details(
                "conflict",
                "attendance already marked for student",
                json!({ "studentId": entry.student_id }),
            ));
        }
    }

    // Whole roster or nothing: a half-written sheet is worse than no sheet.
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let now_ts = Utc::now().to_rfc3339();
    for entry in &entries {
        let insert = tx.execute(
            "INSERT INTO attendance_records(id, student_id, slot_id, extra_class_id, date,
                                            status, is_late, marked_by, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &entry.student_id,
                slot_id,
                extra_class_id,
                &session.date,
                &entry.status,
                entry.is_late as i64,
                &marked_by,
                &now_ts,
                &now_ts,
            ),
        );
        if let Err(e) = insert {
            let _ = tx.rollback();
            if is_unique_violation(&e) {
                return Err(HandlerErr::with_details(
                    "conflict",
                    "attendance already marked for student",
                    json!({ "studentId": entry.student_id }),
                ));
            }
            return Err(HandlerErr::new("db_insert_failed", e.to_string()));
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "marked": entries.len() }))
}

fn edit_record(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let record_id = get_required_str(params, "recordId")?;
    let marked_by = get_required_str(params, "markedBy")?;
    let now = get_now_date(params)?;

    let marker_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM faculty WHERE id = ?", [&marked_by], |r| r.get(0))
        .optional()
        .map_err(db_err)?;
    if marker_exists.is_none() {
        return Err(HandlerErr::new("not_found", "marking faculty not found"));
    }

    let row: Option<(String, String, i64)> = conn
        .query_row(
            "SELECT created_at, status, is_late FROM attendance_records WHERE id = ?",
            [&record_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(db_err)?;
    let Some((created_at, old_status, old_is_late)) = row else {
        return Err(HandlerErr::new("not_found", "record not found"));
    };

    // The edit window runs from the day the record was first marked, not from
    // the session date.
    let created_date = NaiveDate::parse_from_str(&created_at[..10.min(created_at.len())], "%Y-%m-%d")
        .map_err(|_| HandlerErr::new("invalid_timestamp", "record has a malformed created_at"))?;
    let settings = load_settings(conn)?;
    let deadline = created_date + Duration::days(settings.edit_deadline_days);
    if now > deadline {
        return Err(HandlerErr::with_details(
            "deadline_exceeded",
            "edit window for this record has closed",
            json!({ "deadline": deadline.format("%Y-%m-%d").to_string() }),
        ));
    }

    let status = match params.get("status").and_then(|v| v.as_str()) {
        Some(s) if s == "Present" || s == "Absent" => s.to_string(),
        Some(_) => {
            return Err(HandlerErr::new(
                "bad_params",
                "status must be 'Present' or 'Absent'",
            ))
        }
        None => old_status,
    };
    let is_late = params
        .get("isLate")
        .and_then(|v| v.as_bool())
        .unwrap_or(old_is_late != 0);

    conn.execute(
        "UPDATE attendance_records
         SET status = ?, is_late = ?, marked_by = ?, updated_at = ?
         WHERE id = ?",
        (
            &status,
            is_late as i64,
            &marked_by,
            Utc::now().to_rfc3339(),
            &record_id,
        ),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    Ok(json!({ "ok": true, "status": status, "isLate": is_late }))
}

fn session_sheet(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let date = get_required_date(params, "date")?;
    let key = session_key(params)?;
    let session = load_session(conn, key, date, false)?;
    let (slot_id, extra_class_id) = session_columns(&session.key);

    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.last_name, s.first_name, s.sort_order, s.active,
                    ar.id, ar.status, ar.is_late
             FROM students s
             LEFT JOIN attendance_records ar
               ON ar.student_id = s.id AND ar.date = ?2
              AND ((?3 IS NOT NULL AND ar.slot_id = ?3)
                OR (?4 IS NOT NULL AND ar.extra_class_id = ?4))
             WHERE s.group_id = ?1
             ORDER BY s.sort_order",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map(
            (&session.group_id, &session.date, slot_id, extra_class_id),
            |r| {
                let last: String = r.get(1)?;
                let first: String = r.get(2)?;
                Ok(json!({
                    "studentId": r.get::<_, String>(0)?,
                    "displayName": format!("{}, {}", last, first),
                    "sortOrder": r.get::<_, i64>(3)?,
                    "active": r.get::<_, i64>(4)? != 0,
                    "recordId": r.get::<_, Option<String>>(5)?,
                    "status": r.get::<_, Option<String>>(6)?,
                    "isLate": r.get::<_, Option<i64>>(7)?.map(|v| v != 0),
                }))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    Ok(json!({
        "date": session.date,
        "groupId": session.group_id,
        "subjectId": session.subject_id,
        "roster": rows,
    }))
}

fn list_for_session(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let date = get_required_date(params, "date")?;
    let key = session_key(params)?;
    let session = load_session(conn, key, date, true)?;
    let (slot_id, extra_class_id) = session_columns(&session.key);

    let mut stmt = conn
        .prepare(
            "SELECT ar.id, ar.student_id, s.last_name, s.first_name, ar.status, ar.is_late,
                    ar.marked_by, ar.created_at, ar.updated_at
             FROM attendance_records ar
             JOIN students s ON s.id = ar.student_id
             WHERE ar.date = ?1
               AND ((?2 IS NOT NULL AND ar.slot_id = ?2)
                 OR (?3 IS NOT NULL AND ar.extra_class_id = ?3))
             ORDER BY s.sort_order",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map((&session.date, slot_id, extra_class_id), |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok(json!({
                "recordId": r.get::<_, String>(0)?,
                "studentId": r.get::<_, String>(1)?,
                "displayName": format!("{}, {}", last, first),
                "status": r.get::<_, String>(4)?,
                "isLate": r.get::<_, i64>(5)? != 0,
                "markedBy": r.get::<_, Option<String>>(6)?,
                "createdAt": r.get::<_, String>(7)?,
                "updatedAt": r.get::<_, String>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err)?;

    Ok(json!({ "date": session.date, "records": rows }))
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
        "attendance.mark" => Some(dispatch(state, req, mark_session)),
        "attendance.edit" => Some(dispatch(state, req, edit_record)),
        "attendance.sessionSheet" => Some(dispatch(state, req, session_sheet)),
        "attendance.listForSession" => Some(dispatch(state, req, list_for_session)),
        _ => None,
    }
}
