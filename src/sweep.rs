use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use uuid::Uuid;

use crate::aggregate::{self, Period};
use crate::db::Settings;

#[derive(Debug, Clone, Serialize)]
pub struct SweepError {
    pub code: String,
    pub message: String,
}

impl SweepError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// One digest line for the notification collaborator: a session the sweep
/// auto-cancelled this run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledSession {
    pub date: String,
    pub slot_id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub group_id: String,
    pub group_name: String,
    pub faculty_id: String,
    pub faculty_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepFailure {
    pub slot_id: String,
    pub date: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepOutcome {
    pub cancelled: Vec<CancelledSession>,
    pub already_handled: i64,
    pub errors: Vec<SweepFailure>,
}

struct SweepSlot {
    slot_id: String,
    subject_id: String,
    subject_name: String,
    group_id: String,
    group_name: String,
    faculty_id: String,
    faculty_name: String,
}

/// Auto-cancel unmarked past sessions whose marking window has lapsed.
///
/// Walks the trailing `window_days` days; for each (slot, day) past its
/// deadline with neither a record nor a cancellation, writes a system
/// cancellation (cancelled_by NULL). The UNIQUE(slot_id, date) constraint is
/// the lock: a racing duplicate insert counts as already handled, so the job
/// can run under at-least-once scheduling. Per-slot failures are logged and
/// collected; they never abort the rest of the sweep. Only rows written THIS
/// run land in `cancelled`, so re-running emits no duplicate digest entries.
pub fn run_deadline_sweep(
    conn: &Connection,
    today: NaiveDate,
    window_days: i64,
    settings: &Settings,
) -> Result<SweepOutcome, SweepError> {
    let mut outcome = SweepOutcome {
        cancelled: Vec::new(),
        already_handled: 0,
        errors: Vec::new(),
    };

    for offset in 1..=window_days.max(0) {
        let day = today - Duration::days(offset);
        let deadline = day + Duration::days(settings.mark_deadline_days);
        if today <= deadline {
            continue;
        }
        let date_str = day.format("%Y-%m-%d").to_string();
        let weekday = day.weekday().num_days_from_monday() as i64;

        let mut stmt = conn
            .prepare(
                "SELECT ss.id, ss.subject_id, subj.name, ss.group_id, g.name, ss.faculty_id, f.name
                 FROM schedule_slots ss
                 JOIN subjects subj ON subj.id = ss.subject_id
                 JOIN student_groups g ON g.id = ss.group_id
                 JOIN faculty f ON f.id = ss.faculty_id
                 WHERE ss.weekday = ?
                 ORDER BY ss.id",
            )
            .map_err(|e| SweepError::new("db_query_failed", e.to_string()))?;
        let slots: Vec<SweepSlot> = stmt
            .query_map([weekday], |r| {
                Ok(SweepSlot {
                    slot_id: r.get(0)?,
                    subject_id: r.get(1)?,
                    subject_name: r.get(2)?,
                    group_id: r.get(3)?,
                    group_name: r.get(4)?,
                    faculty_id: r.get(5)?,
                    faculty_name: r.get(6)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| SweepError::new("db_query_failed", e.to_string()))?;

        for slot in slots {
            match sweep_one(conn, &slot.slot_id, &date_str) {
                Ok(SweepAction::Cancelled) => outcome.cancelled.push(CancelledSession {
                    date: date_str.clone(),
                    slot_id: slot.slot_id,
                    subject_id: slot.subject_id,
                    subject_name: slot.subject_name,
                    group_id: slot.group_id,
                    group_name: slot.group_name,
                    faculty_id: slot.faculty_id,
                    faculty_name: slot.faculty_name,
                }),
                Ok(SweepAction::AlreadyHandled) => outcome.already_handled += 1,
                Ok(SweepAction::Conducted) => {}
                Err(message) => {
                    log::warn!(
                        "deadline sweep: slot {} on {}: {}",
                        slot.slot_id,
                        date_str,
                        message
                    );
                    outcome.errors.push(SweepFailure {
                        slot_id: slot.slot_id,
                        date: date_str.clone(),
                        message,
                    });
                }
            }
        }
    }

    Ok(outcome)
}

enum SweepAction {
    Cancelled,
    AlreadyHandled,
    Conducted,
}

fn sweep_one(conn: &Connection, slot_id: &str, date: &str) -> Result<SweepAction, String> {
    let has_record: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM attendance_records WHERE slot_id = ? AND date = ? LIMIT 1",
            (slot_id, date),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| e.to_string())?;
    if has_record.is_some() {
        // Conducted is terminal; nothing to reconcile.
        return Ok(SweepAction::Conducted);
    }

    let has_cancellation: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM cancellations WHERE slot_id = ? AND date = ? LIMIT 1",
            (slot_id, date),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| e.to_string())?;
    if has_cancellation.is_some() {
        return Ok(SweepAction::AlreadyHandled);
    }

    let insert = conn.execute(
        "INSERT INTO cancellations(id, slot_id, date, cancelled_by, created_at)
         VALUES(?, ?, ?, NULL, ?)",
        (
            Uuid::new_v4().to_string(),
            slot_id,
            date,
            Utc::now().to_rfc3339(),
        ),
    );
    match insert {
        Ok(_) => Ok(SweepAction::Cancelled),
        // A concurrent sweep got there first; the row exists, which is all
        // the state machine requires.
        Err(e) if is_unique_violation(&e) => Ok(SweepAction::AlreadyHandled),
        Err(e) => Err(e.to_string()),
    }
}

pub fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyDecision {
    pub notify: bool,
    pub percentage: f64,
    pub held: i64,
    pub required_percentage: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sent_at: Option<String>,
}

/// Cooldown rule: warn only when the percentage is under the floor AND the
/// last warning for this (student, subject) is older than the cooldown (or
/// none was ever sent). A subject with no held sessions never warns; its 0%
/// means "nothing happened yet", not "missed everything".
pub fn should_notify(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    now: DateTime<Utc>,
    period: Period,
    settings: &Settings,
) -> Result<NotifyDecision, SweepError> {
    let summary = aggregate::subject_summary(conn, student_id, subject_id, period)
        .map_err(|e| SweepError::new(&e.code, e.message))?;

    let last_sent_at: Option<String> = conn
        .query_row(
            "SELECT sent_at FROM low_attendance_notifications
             WHERE student_id = ? AND subject_id = ?
             ORDER BY sent_at DESC LIMIT 1",
            (student_id, subject_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| SweepError::new("db_query_failed", e.to_string()))?;

    let cooldown_open = match &last_sent_at {
        None => true,
        Some(raw) => {
            let sent = DateTime::parse_from_rfc3339(raw)
                .map_err(|e| SweepError::new("invalid_timestamp", e.to_string()))?
                .with_timezone(&Utc);
            now.signed_duration_since(sent) > Duration::days(settings.notification_cooldown_days)
        }
    };

    let below_floor =
        summary.held > 0 && summary.percentage < settings.required_percentage as f64;

    Ok(NotifyDecision {
        notify: below_floor && cooldown_open,
        percentage: summary.percentage,
        held: summary.held,
        required_percentage: settings.required_percentage,
        last_sent_at,
    })
}

/// Append a send-log row. History is never updated in place, so the log
/// stays auditable; the cooldown only ever consults the newest row.
pub fn record_sent(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    percentage: f64,
    sent_at: DateTime<Utc>,
) -> Result<String, SweepError> {
    let student_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| SweepError::new("db_query_failed", e.to_string()))?;
    if student_exists.is_none() {
        return Err(SweepError::new("not_found", "student not found"));
    }
    let subject_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| SweepError::new("db_query_failed", e.to_string()))?;
    if subject_exists.is_none() {
        return Err(SweepError::new("not_found", "subject not found"));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO low_attendance_notifications(id, student_id, subject_id, sent_at, percentage)
         VALUES(?, ?, ?, ?, ?)",
        (&id, student_id, subject_id, sent_at.to_rfc3339(), percentage),
    )
    .map_err(|e| SweepError::new("db_insert_failed", e.to_string()))?;
    Ok(id)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LowAttendancePayload {
    pub student_id: String,
    pub student_name: String,
    pub subject_id: String,
    pub subject_name: String,
    pub percentage: f64,
    pub held: i64,
    pub required_percentage: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckFailure {
    pub student_id: String,
    pub subject_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LowAttendanceOutcome {
    pub notified: Vec<LowAttendancePayload>,
    pub skipped_cooldown: i64,
    pub errors: Vec<CheckFailure>,
}

/// The periodic low-attendance pass: every active student, every subject
/// taught to their group. Pairs that warrant a warning are logged as sent and
/// returned as payloads for the external mailer. Per-pair failures are
/// collected, not fatal.
pub fn run_low_attendance_check(
    conn: &Connection,
    now: DateTime<Utc>,
    period: Period,
    settings: &Settings,
) -> Result<LowAttendanceOutcome, SweepError> {
    let mut outcome = LowAttendanceOutcome {
        notified: Vec::new(),
        skipped_cooldown: 0,
        errors: Vec::new(),
    };

    let mut stmt = conn
        .prepare(
            "SELECT id, group_id, last_name, first_name FROM students
             WHERE active = 1 ORDER BY group_id, sort_order",
        )
        .map_err(|e| SweepError::new("db_query_failed", e.to_string()))?;
    let students: Vec<(String, String, String)> = stmt
        .query_map([], |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                format!("{}, {}", last, first),
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| SweepError::new("db_query_failed", e.to_string()))?;

    for (student_id, group_id, student_name) in students {
        let subjects = match aggregate::subjects_for_group(conn, &group_id) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("low attendance check: student {}: {}", student_id, e.message);
                outcome.errors.push(CheckFailure {
                    student_id,
                    subject_id: String::new(),
                    message: e.message,
                });
                continue;
            }
        };

        for (subject_id, _code, subject_name) in subjects {
            let decision =
                match should_notify(conn, &student_id, &subject_id, now, period, settings) {
                    Ok(d) => d,
                    Err(e) => {
                        log::warn!(
                            "low attendance check: student {} subject {}: {}",
                            student_id,
                            subject_id,
                            e.message
                        );
                        outcome.errors.push(CheckFailure {
                            student_id: student_id.clone(),
                            subject_id,
                            message: e.message,
                        });
                        continue;
                    }
                };

            if decision.notify {
                if let Err(e) =
                    record_sent(conn, &student_id, &subject_id, decision.percentage, now)
                {
                    outcome.errors.push(CheckFailure {
                        student_id: student_id.clone(),
                        subject_id,
                        message: e.message,
                    });
                    continue;
                }
                outcome.notified.push(LowAttendancePayload {
                    student_id: student_id.clone(),
                    student_name: student_name.clone(),
                    subject_id,
                    subject_name,
                    percentage: decision.percentage,
                    held: decision.held,
                    required_percentage: decision.required_percentage,
                });
            } else if decision.held > 0
                && decision.percentage < settings.required_percentage as f64
            {
                outcome.skipped_cooldown += 1;
            }
        }
    }

    Ok(outcome)
}
