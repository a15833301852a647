use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::sweep;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;

use super::reports;

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

fn optional_timestamp(
    req: &Request,
    key: &str,
) -> Result<Option<DateTime<Utc>>, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(raw) => DateTime::parse_from_rfc3339(raw.trim())
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| {
                err(
                    &req.id,
                    "bad_params",
                    format!("{} must be an RFC 3339 timestamp", key),
                    None,
                )
            }),
        None => Ok(None),
    }
}

fn handle_should_notify(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let now = match optional_timestamp(req, "now") {
        Ok(v) => v.unwrap_or_else(Utc::now),
        Err(e) => return e,
    };
    let period = match reports::parse_period(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let settings = match db::load_settings(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match sweep::should_notify(conn, &student_id, &subject_id, now, period, &settings) {
        Ok(decision) => match serde_json::to_value(&decision) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Err(e) => err(&req.id, &e.code, e.message, None),
    }
}

fn handle_record_sent(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(percentage) = req.params.get("percentage").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing percentage", None);
    };
    if !(0.0..=100.0).contains(&percentage) {
        return err(
            &req.id,
            "bad_params",
            "percentage must be between 0 and 100",
            None,
        );
    }
    let sent_at = match optional_timestamp(req, "sentAt") {
        Ok(v) => v.unwrap_or_else(Utc::now),
        Err(e) => return e,
    };

    match sweep::record_sent(conn, &student_id, &subject_id, percentage, sent_at) {
        Ok(id) => ok(
            &req.id,
            json!({ "notificationId": id, "sentAt": sent_at.to_rfc3339() }),
        ),
        Err(e) => err(&req.id, &e.code, e.message, None),
    }
}

fn handle_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, sent_at, percentage FROM low_attendance_notifications
         WHERE student_id = ? AND subject_id = ?
         ORDER BY sent_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&student_id, &subject_id), |r| {
            Ok(json!({
                "notificationId": r.get::<_, String>(0)?,
                "sentAt": r.get::<_, String>(1)?,
                "percentage": r.get::<_, f64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(history) => ok(&req.id, json!({ "notifications": history })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.shouldNotify" => Some(handle_should_notify(state, req)),
        "notifications.recordSent" => Some(handle_record_sent(state, req)),
        "notifications.history" => Some(handle_history(state, req)),
        _ => None,
    }
}
