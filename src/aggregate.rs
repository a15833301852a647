use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

/// Inclusive date window an aggregation runs over.
#[derive(Debug, Clone, Copy)]
pub struct Period {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl Period {
    /// Wide-open window for callers that want "everything on record".
    pub fn all_time() -> Self {
        Self {
            from: NaiveDate::from_ymd_opt(1, 1, 1).expect("valid date"),
            to: NaiveDate::from_ymd_opt(9999, 12, 31).expect("valid date"),
        }
    }

    fn from_str(&self) -> String {
        self.from.format("%Y-%m-%d").to_string()
    }

    fn to_str(&self) -> String {
        self.to.format("%Y-%m-%d").to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSummary {
    pub held: i64,
    pub attended: i64,
    pub percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectLine {
    pub subject_id: String,
    pub subject_code: String,
    pub subject_name: String,
    #[serde(flatten)]
    pub summary: SubjectSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSheetRow {
    pub student_id: String,
    pub display_name: String,
    pub sort_order: i64,
    pub active: bool,
    #[serde(flatten)]
    pub summary: SubjectSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateError {
    pub code: String,
    pub message: String,
}

impl AggregateError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Held/attended/percentage for one student in one subject over a period.
///
/// Held unions two disjoint sources: distinct (slot, date) pairs among the
/// group's template-linked records, plus the group's scheduled extra classes.
/// A session contributes one held unit no matter how many roster records hang
/// off it. Attended is the student's own Present rows across both sources
/// (late is a flag on Present, so it counts). held == 0 is not an error: the
/// percentage is 0 and the caller can tell the two zeroes apart by `held`.
pub fn subject_summary(
    conn: &Connection,
    student_id: &str,
    subject_id: &str,
    period: Period,
) -> Result<SubjectSummary, AggregateError> {
    let group_id: Option<String> = conn
        .query_row(
            "SELECT group_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| AggregateError::new("db_query_failed", e.to_string()))?;
    let Some(group_id) = group_id else {
        return Err(AggregateError::new("not_found", "student not found"));
    };

    let subject_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| AggregateError::new("db_query_failed", e.to_string()))?;
    if subject_exists.is_none() {
        return Err(AggregateError::new("not_found", "subject not found"));
    }

    summary_for_group(conn, &group_id, student_id, subject_id, period)
}

fn summary_for_group(
    conn: &Connection,
    group_id: &str,
    student_id: &str,
    subject_id: &str,
    period: Period,
) -> Result<SubjectSummary, AggregateError> {
    let from = period.from_str();
    let to = period.to_str();

    let held_template: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM (
               SELECT DISTINCT ar.slot_id, ar.date
               FROM attendance_records ar
               JOIN schedule_slots ss ON ss.id = ar.slot_id
               WHERE ss.subject_id = ? AND ss.group_id = ?
                 AND ar.date BETWEEN ? AND ?
             )",
            (subject_id, group_id, &from, &to),
            |r| r.get(0),
        )
        .map_err(|e| AggregateError::new("db_query_failed", e.to_string()))?;

    let held_extra: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM extra_classes
             WHERE subject_id = ? AND group_id = ? AND status = 'scheduled'
               AND date BETWEEN ? AND ?",
            (subject_id, group_id, &from, &to),
            |r| r.get(0),
        )
        .map_err(|e| AggregateError::new("db_query_failed", e.to_string()))?;

    // The two sources cannot overlap (an extra class is never a slot), so a
    // plain sum never double-counts a date.
    let held = held_template + held_extra;

    let attended: i64 = conn
        .query_row(
            "SELECT COUNT(*)
             FROM attendance_records ar
             LEFT JOIN schedule_slots ss ON ss.id = ar.slot_id
             LEFT JOIN extra_classes ec ON ec.id = ar.extra_class_id
             WHERE ar.student_id = ? AND ar.status = 'Present'
               AND COALESCE(ss.subject_id, ec.subject_id) = ?
               AND ar.date BETWEEN ? AND ?",
            (student_id, subject_id, &from, &to),
            |r| r.get(0),
        )
        .map_err(|e| AggregateError::new("db_query_failed", e.to_string()))?;

    let percentage = if held == 0 {
        0.0
    } else {
        round2(attended as f64 / held as f64 * 100.0)
    };

    Ok(SubjectSummary {
        held,
        attended,
        percentage,
    })
}

/// Every subject taught to a group: whatever appears in its weekly template or
/// its extra classes. Ordered by subject name for stable output.
pub fn subjects_for_group(
    conn: &Connection,
    group_id: &str,
) -> Result<Vec<(String, String, String)>, AggregateError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, code, name FROM subjects
             WHERE id IN (SELECT subject_id FROM schedule_slots WHERE group_id = ?1
                          UNION
                          SELECT subject_id FROM extra_classes WHERE group_id = ?1)
             ORDER BY name, code",
        )
        .map_err(|e| AggregateError::new("db_query_failed", e.to_string()))?;
    stmt.query_map([group_id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
        ))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| AggregateError::new("db_query_failed", e.to_string()))
}

/// One summary line per subject taught to the student's group.
pub fn student_overview(
    conn: &Connection,
    student_id: &str,
    period: Period,
) -> Result<Vec<SubjectLine>, AggregateError> {
    let group_id: Option<String> = conn
        .query_row(
            "SELECT group_id FROM students WHERE id = ?",
            [student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| AggregateError::new("db_query_failed", e.to_string()))?;
    let Some(group_id) = group_id else {
        return Err(AggregateError::new("not_found", "student not found"));
    };

    let mut lines = Vec::new();
    for (subject_id, subject_code, subject_name) in subjects_for_group(conn, &group_id)? {
        let summary = summary_for_group(conn, &group_id, student_id, &subject_id, period)?;
        lines.push(SubjectLine {
            subject_id,
            subject_code,
            subject_name,
            summary,
        });
    }
    Ok(lines)
}

/// Per-student summaries for one subject across a whole group: the rows behind
/// an attendance sheet or export.
pub fn group_sheet(
    conn: &Connection,
    group_id: &str,
    subject_id: &str,
    period: Period,
) -> Result<Vec<GroupSheetRow>, AggregateError> {
    let group_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM student_groups WHERE id = ?", [group_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| AggregateError::new("db_query_failed", e.to_string()))?;
    if group_exists.is_none() {
        return Err(AggregateError::new("not_found", "group not found"));
    }

    let mut stmt = conn
        .prepare(
            "SELECT id, last_name, first_name, sort_order, active
             FROM students WHERE group_id = ? ORDER BY sort_order",
        )
        .map_err(|e| AggregateError::new("db_query_failed", e.to_string()))?;
    let students = stmt
        .query_map([group_id], |r| {
            let last: String = r.get(1)?;
            let first: String = r.get(2)?;
            Ok((
                r.get::<_, String>(0)?,
                format!("{}, {}", last, first),
                r.get::<_, i64>(3)?,
                r.get::<_, i64>(4)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| AggregateError::new("db_query_failed", e.to_string()))?;

    let mut rows = Vec::new();
    for (student_id, display_name, sort_order, active) in students {
        let summary = summary_for_group(conn, group_id, &student_id, subject_id, period)?;
        rows.push(GroupSheetRow {
            student_id,
            display_name,
            sort_order,
            active,
            summary,
        });
    }
    Ok(rows)
}
