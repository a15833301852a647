use crate::aggregate::{self, Period};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;

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

/// from/to default to the whole record when omitted.
pub fn parse_period(req: &Request) -> Result<Period, serde_json::Value> {
    let mut period = Period::all_time();
    if let Some(raw) = req.params.get("from").and_then(|v| v.as_str()) {
        period.from = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map_err(|_| err(&req.id, "bad_params", "from must be YYYY-MM-DD", None))?;
    }
    if let Some(raw) = req.params.get("to").and_then(|v| v.as_str()) {
        period.to = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map_err(|_| err(&req.id, "bad_params", "to must be YYYY-MM-DD", None))?;
    }
    if period.from > period.to {
        return Err(err(&req.id, "bad_params", "from must not be after to", None));
    }
    Ok(period)
}

fn handle_subject_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let period = match parse_period(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match aggregate::subject_summary(conn, &student_id, &subject_id, period) {
        Ok(summary) => match serde_json::to_value(&summary) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Err(e) => err(&req.id, &e.code, e.message, None),
    }
}

fn handle_student_overview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period = match parse_period(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match aggregate::student_overview(conn, &student_id, period) {
        Ok(lines) => match serde_json::to_value(&lines) {
            Ok(v) => ok(&req.id, json!({ "subjects": v })),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Err(e) => err(&req.id, &e.code, e.message, None),
    }
}

fn handle_group_sheet(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let period = match parse_period(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    match aggregate::group_sheet(conn, &group_id, &subject_id, period) {
        Ok(rows) => match serde_json::to_value(&rows) {
            Ok(v) => ok(&req.id, json!({ "rows": v })),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Err(e) => err(&req.id, &e.code, e.message, None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.subjectSummary" => Some(handle_subject_summary(state, req)),
        "reports.studentOverview" => Some(handle_student_overview(state, req)),
        "reports.groupSheet" => Some(handle_group_sheet(state, req)),
        _ => None,
    }
}
