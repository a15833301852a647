use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::sweep;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::Connection;

use super::reports;

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn optional_date(req: &Request, key: &str) -> Result<Option<NaiveDate>, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
            .map(Some)
            .map_err(|_| err(&req.id, "bad_params", format!("{} must be YYYY-MM-DD", key), None)),
        None => Ok(None),
    }
}

fn optional_timestamp(req: &Request, key: &str) -> Result<Option<DateTime<Utc>>, serde_json::Value> {
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

fn handle_deadline_sweep(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let today = match optional_date(req, "today") {
        Ok(v) => v.unwrap_or_else(|| Utc::now().date_naive()),
        Err(e) => return e,
    };
    let window_days = match req.params.get("windowDays") {
        None => 4,
        Some(v) if v.is_null() => 4,
        Some(v) => match v.as_i64() {
            Some(n) if (1..=31).contains(&n) => n,
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "windowDays must be between 1 and 31",
                    None,
                )
            }
        },
    };
    let settings = match db::load_settings(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match sweep::run_deadline_sweep(conn, today, window_days, &settings) {
        Ok(outcome) => {
            log::info!(
                "deadline sweep for {}: {} cancelled, {} already handled, {} errors",
                today.format("%Y-%m-%d"),
                outcome.cancelled.len(),
                outcome.already_handled,
                outcome.errors.len()
            );
            match serde_json::to_value(&outcome) {
                Ok(v) => ok(&req.id, v),
                Err(e) => err(&req.id, "internal", e.to_string(), None),
            }
        }
        Err(e) => err(&req.id, &e.code, e.message, None),
    }
}

fn handle_low_attendance_check(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
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

    match sweep::run_low_attendance_check(conn, now, period, &settings) {
        Ok(outcome) => {
            log::info!(
                "low attendance check: {} notified, {} in cooldown, {} errors",
                outcome.notified.len(),
                outcome.skipped_cooldown,
                outcome.errors.len()
            );
            match serde_json::to_value(&outcome) {
                Ok(v) => ok(&req.id, v),
                Err(e) => err(&req.id, "internal", e.to_string(), None),
            }
        }
        Err(e) => err(&req.id, &e.code, e.message, None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "jobs.deadlineSweep" => Some(handle_deadline_sweep(state, req)),
        "jobs.lowAttendanceCheck" => Some(handle_low_attendance_check(state, req)),
        _ => None,
    }
}
