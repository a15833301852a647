use chrono::{Datelike, NaiveDate};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// Which concrete thing a session (or an attendance record) points at:
/// a recurring weekly slot or a one-off extra class, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "id")]
pub enum SessionRef {
    Slot(String),
    Extra(String),
}

impl SessionRef {
    pub fn id(&self) -> &str {
        match self {
            SessionRef::Slot(id) => id,
            SessionRef::Extra(id) => id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Scheduled,
    Cancelled,
}

/// A concrete, dated occurrence derived from the template and the day's
/// exceptions. Never stored; recomputed on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSession {
    pub source: SessionRef,
    pub date: String,
    pub group_id: String,
    pub group_name: String,
    pub subject_id: String,
    pub subject_name: String,
    pub scheduled_faculty_id: String,
    pub effective_faculty_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub substitute_faculty_id: Option<String>,
    pub time_slot_id: String,
    pub start_time: String,
    pub end_time: String,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolveError {
    pub code: String,
    pub message: String,
}

impl ResolveError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Merge the weekly template with the date's exceptions into the ordered
/// session list for that date. Read-only and deterministic: the same store
/// state and date always produce the same list.
///
/// A slot carrying both a substitution and a cancellation stays cancelled;
/// the substitute is kept as metadata on the session.
pub fn resolve_day(conn: &Connection, date: NaiveDate) -> Result<Vec<ResolvedSession>, ResolveError> {
    let weekday = date.weekday().num_days_from_monday() as i64;
    let date_str = date.format("%Y-%m-%d").to_string();

    let mut substitutes: HashMap<String, String> = HashMap::new();
    {
        let mut stmt = conn
            .prepare("SELECT slot_id, substitute_faculty_id FROM substitutions WHERE date = ?")
            .map_err(|e| ResolveError::new("db_query_failed", e.to_string()))?;
        let rows = stmt
            .query_map([&date_str], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| ResolveError::new("db_query_failed", e.to_string()))?;
        for (slot_id, faculty_id) in rows {
            substitutes.insert(slot_id, faculty_id);
        }
    }

    let mut cancelled_slots: HashSet<String> = HashSet::new();
    {
        let mut stmt = conn
            .prepare("SELECT slot_id FROM cancellations WHERE date = ?")
            .map_err(|e| ResolveError::new("db_query_failed", e.to_string()))?;
        let rows = stmt
            .query_map([&date_str], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| ResolveError::new("db_query_failed", e.to_string()))?;
        cancelled_slots.extend(rows);
    }

    let mut sessions: Vec<ResolvedSession> = Vec::new();

    let mut slot_stmt = conn
        .prepare(
            "SELECT ss.id, ss.group_id, g.name, ss.subject_id, subj.name,
                    ss.faculty_id, ss.time_slot_id, ts.start_time, ts.end_time
             FROM schedule_slots ss
             JOIN student_groups g ON g.id = ss.group_id
             JOIN subjects subj ON subj.id = ss.subject_id
             JOIN time_slots ts ON ts.id = ss.time_slot_id
             WHERE ss.weekday = ?",
        )
        .map_err(|e| ResolveError::new("db_query_failed", e.to_string()))?;
    let slot_rows = slot_stmt
        .query_map([weekday], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, String>(7)?,
                r.get::<_, String>(8)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| ResolveError::new("db_query_failed", e.to_string()))?;

    for (slot_id, group_id, group_name, subject_id, subject_name, faculty_id, time_slot_id, start_time, end_time) in
        slot_rows
    {
        let substitute = substitutes.get(&slot_id).cloned();
        let status = if cancelled_slots.contains(&slot_id) {
            SessionStatus::Cancelled
        } else {
            SessionStatus::Scheduled
        };
        let effective = substitute.clone().unwrap_or_else(|| faculty_id.clone());
        sessions.push(ResolvedSession {
            source: SessionRef::Slot(slot_id),
            date: date_str.clone(),
            group_id,
            group_name,
            subject_id,
            subject_name,
            scheduled_faculty_id: faculty_id,
            effective_faculty_id: effective,
            substitute_faculty_id: substitute,
            time_slot_id,
            start_time,
            end_time,
            status,
        });
    }

    let mut extra_stmt = conn
        .prepare(
            "SELECT ec.id, ec.group_id, g.name, ec.subject_id, subj.name,
                    ec.faculty_id, ec.time_slot_id, ts.start_time, ts.end_time, ec.status
             FROM extra_classes ec
             JOIN student_groups g ON g.id = ec.group_id
             JOIN subjects subj ON subj.id = ec.subject_id
             JOIN time_slots ts ON ts.id = ec.time_slot_id
             WHERE ec.date = ?",
        )
        .map_err(|e| ResolveError::new("db_query_failed", e.to_string()))?;
    let extra_rows = extra_stmt
        .query_map([&date_str], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, String>(7)?,
                r.get::<_, String>(8)?,
                r.get::<_, String>(9)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| ResolveError::new("db_query_failed", e.to_string()))?;

    for (extra_id, group_id, group_name, subject_id, subject_name, faculty_id, time_slot_id, start_time, end_time, raw_status) in
        extra_rows
    {
        let status = if raw_status == "cancelled" {
            SessionStatus::Cancelled
        } else {
            SessionStatus::Scheduled
        };
        sessions.push(ResolvedSession {
            source: SessionRef::Extra(extra_id),
            date: date_str.clone(),
            group_id,
            group_name,
            subject_id,
            subject_name,
            scheduled_faculty_id: faculty_id.clone(),
            effective_faculty_id: faculty_id,
            substitute_faculty_id: None,
            time_slot_id,
            start_time,
            end_time,
            status,
        });
    }

    // Period start first; group name breaks ties so two groups meeting in the
    // same period always come out in the same order. Source id is the final
    // tiebreak to keep the sort total.
    sessions.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then_with(|| a.group_name.cmp(&b.group_name))
            .then_with(|| a.source.id().cmp(b.source.id()))
    });

    Ok(sessions)
}
