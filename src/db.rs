use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("rollbook.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Idempotent schema setup. Also used by unit tests against in-memory
/// connections, so it must not touch the filesystem.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_groups(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS faculty(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(group_id) REFERENCES student_groups(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_group ON students(group_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS time_slots(
            id TEXT PRIMARY KEY,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            label TEXT,
            is_schedulable INTEGER NOT NULL DEFAULT 1,
            CHECK(start_time < end_time)
        )",
        [],
    )?;

    // The weekly template. Weekday is 0=Monday..6=Sunday. The two UNIQUE
    // constraints are the no-double-booking invariants: a faculty member and a
    // group can each hold at most one slot per (weekday, period).
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schedule_slots(
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            faculty_id TEXT NOT NULL,
            weekday INTEGER NOT NULL CHECK(weekday BETWEEN 0 AND 6),
            time_slot_id TEXT NOT NULL,
            FOREIGN KEY(group_id) REFERENCES student_groups(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(faculty_id) REFERENCES faculty(id),
            FOREIGN KEY(time_slot_id) REFERENCES time_slots(id),
            UNIQUE(weekday, time_slot_id, faculty_id),
            UNIQUE(weekday, time_slot_id, group_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedule_slots_weekday ON schedule_slots(weekday)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedule_slots_group ON schedule_slots(group_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_schedule_slots_faculty ON schedule_slots(faculty_id)",
        [],
    )?;

    // cancelled_by NULL means the deadline sweep wrote the row. The UNIQUE
    // pair doubles as the optimistic lock for concurrent sweeps.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS cancellations(
            id TEXT PRIMARY KEY,
            slot_id TEXT NOT NULL,
            date TEXT NOT NULL,
            cancelled_by TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(slot_id) REFERENCES schedule_slots(id),
            FOREIGN KEY(cancelled_by) REFERENCES faculty(id),
            UNIQUE(slot_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_cancellations_date ON cancellations(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS substitutions(
            id TEXT PRIMARY KEY,
            slot_id TEXT NOT NULL,
            date TEXT NOT NULL,
            substitute_faculty_id TEXT NOT NULL,
            FOREIGN KEY(slot_id) REFERENCES schedule_slots(id),
            FOREIGN KEY(substitute_faculty_id) REFERENCES faculty(id),
            UNIQUE(slot_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_substitutions_date ON substitutions(date)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS extra_classes(
            id TEXT PRIMARY KEY,
            faculty_id TEXT NOT NULL,
            group_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            date TEXT NOT NULL,
            time_slot_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'scheduled',
            FOREIGN KEY(faculty_id) REFERENCES faculty(id),
            FOREIGN KEY(group_id) REFERENCES student_groups(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(time_slot_id) REFERENCES time_slots(id),
            UNIQUE(faculty_id, date, time_slot_id),
            UNIQUE(group_id, date, time_slot_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_extra_classes_date ON extra_classes(date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_extra_classes_group ON extra_classes(group_id)",
        [],
    )?;

    // One row per student per session. The CHECK keeps the slot/extra-class
    // reference an exclusive-or; SQLite treats NULLs as distinct in UNIQUE, so
    // each pair constrains only the rows where its column is set.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_records(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            slot_id TEXT,
            extra_class_id TEXT,
            date TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('Present', 'Absent')),
            is_late INTEGER NOT NULL DEFAULT 0,
            marked_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(slot_id) REFERENCES schedule_slots(id),
            FOREIGN KEY(extra_class_id) REFERENCES extra_classes(id),
            FOREIGN KEY(marked_by) REFERENCES faculty(id),
            CHECK((slot_id IS NOT NULL AND extra_class_id IS NULL)
               OR (slot_id IS NULL AND extra_class_id IS NOT NULL)),
            UNIQUE(student_id, slot_id, date),
            UNIQUE(student_id, extra_class_id, date)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_student ON attendance_records(student_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_slot ON attendance_records(slot_id, date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_records_extra ON attendance_records(extra_class_id, date)",
        [],
    )?;

    // Append-only send log; the cooldown check reads the latest row only.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS low_attendance_notifications(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            sent_at TEXT NOT NULL,
            percentage REAL NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_low_attendance_pair
         ON low_attendance_notifications(student_id, subject_id, sent_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            id INTEGER PRIMARY KEY CHECK(id = 1),
            required_percentage INTEGER NOT NULL DEFAULT 75,
            mark_deadline_days INTEGER NOT NULL DEFAULT 1,
            edit_deadline_days INTEGER NOT NULL DEFAULT 3,
            cancellation_threshold_hours INTEGER NOT NULL DEFAULT 2,
            notification_cooldown_days INTEGER NOT NULL DEFAULT 30
        )",
        [],
    )?;

    // Workspaces created before the cooldown became configurable lack the
    // column. Add it with the old fixed value as the default.
    ensure_settings_notification_cooldown(conn)?;

    Ok(())
}

fn ensure_settings_notification_cooldown(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "settings", "notification_cooldown_days")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE settings ADD COLUMN notification_cooldown_days INTEGER NOT NULL DEFAULT 30",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub required_percentage: i64,
    pub mark_deadline_days: i64,
    pub edit_deadline_days: i64,
    pub cancellation_threshold_hours: i64,
    pub notification_cooldown_days: i64,
}

/// Singleton loader: creates the defaults row on first use, then reads it.
/// Settings are re-read per request so edits apply without a restart.
pub fn load_settings(conn: &Connection) -> anyhow::Result<Settings> {
    conn.execute("INSERT OR IGNORE INTO settings(id) VALUES(1)", [])?;
    let settings = conn
        .query_row(
            "SELECT required_percentage, mark_deadline_days, edit_deadline_days,
                    cancellation_threshold_hours, notification_cooldown_days
             FROM settings WHERE id = 1",
            [],
            |r| {
                Ok(Settings {
                    required_percentage: r.get(0)?,
                    mark_deadline_days: r.get(1)?,
                    edit_deadline_days: r.get(2)?,
                    cancellation_threshold_hours: r.get(3)?,
                    notification_cooldown_days: r.get(4)?,
                })
            },
        )
        .optional()?;
    settings.ok_or_else(|| anyhow::anyhow!("settings row missing after insert"))
}
