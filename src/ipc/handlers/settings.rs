use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match db::load_settings(conn) {
        Ok(settings) => match serde_json::to_value(&settings) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn parse_update_field(
    params: &serde_json::Value,
    key: &str,
    min: i64,
    max: i64,
) -> Result<Option<i64>, String> {
    let Some(v) = params.get(key) else {
        return Ok(None);
    };
    if v.is_null() {
        return Ok(None);
    }
    let Some(n) = v.as_i64() else {
        return Err(format!("{} must be an integer", key));
    };
    if n < min || n > max {
        return Err(format!("{} must be between {} and {}", key, min, max));
    }
    Ok(Some(n))
}

fn handle_settings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut current = match db::load_settings(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let fields: [(&str, i64, i64, &mut i64); 5] = [
        ("requiredPercentage", 0, 100, &mut current.required_percentage),
        ("markDeadlineDays", 0, 365, &mut current.mark_deadline_days),
        ("editDeadlineDays", 0, 365, &mut current.edit_deadline_days),
        (
            "cancellationThresholdHours",
            0,
            720,
            &mut current.cancellation_threshold_hours,
        ),
        (
            "notificationCooldownDays",
            1,
            365,
            &mut current.notification_cooldown_days,
        ),
    ];
    for (key, min, max, target) in fields {
        match parse_update_field(&req.params, key, min, max) {
            Ok(Some(n)) => *target = n,
            Ok(None) => {}
            Err(m) => return err(&req.id, "bad_params", m, None),
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE settings SET required_percentage = ?, mark_deadline_days = ?,
                             edit_deadline_days = ?, cancellation_threshold_hours = ?,
                             notification_cooldown_days = ?
         WHERE id = 1",
        (
            current.required_percentage,
            current.mark_deadline_days,
            current.edit_deadline_days,
            current.cancellation_threshold_hours,
            current.notification_cooldown_days,
        ),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    match serde_json::to_value(&current) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "internal", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.get" => Some(handle_settings_get(state, req)),
        "settings.update" => Some(handle_settings_update(state, req)),
        _ => None,
    }
}
