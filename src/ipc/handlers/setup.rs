use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::sweep::is_unique_violation;
use chrono::NaiveTime;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

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

fn query_count(
    conn: &Connection,
    req: &Request,
    sql: &str,
    id: &str,
) -> Result<i64, serde_json::Value> {
    conn.query_row(sql, [id], |r| r.get(0))
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

fn handle_groups_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT g.id, g.name,
                (SELECT COUNT(*) FROM students s WHERE s.group_id = g.id) AS student_count
         FROM student_groups g
         ORDER BY g.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "studentCount": row.get::<_, i64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(groups) => ok(&req.id, json!({ "groups": groups })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_groups_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let group_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO student_groups(id, name) VALUES(?, ?)",
        (&group_id, &name),
    ) {
        Ok(_) => ok(&req.id, json!({ "groupId": group_id, "name": name })),
        Err(e) if is_unique_violation(&e) => err(
            &req.id,
            "conflict",
            format!("a group named '{}' already exists", name),
            None,
        ),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_groups_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let group_id = match required_str(req, "groupId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM student_groups WHERE id = ?", [&group_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "group not found", None);
    }
    for (sql, what) in [
        ("SELECT COUNT(*) FROM students WHERE group_id = ?", "students"),
        ("SELECT COUNT(*) FROM schedule_slots WHERE group_id = ?", "schedule slots"),
        ("SELECT COUNT(*) FROM extra_classes WHERE group_id = ?", "extra classes"),
    ] {
        let n = match query_count(conn, req, sql, &group_id) {
            Ok(n) => n,
            Err(e) => return e,
        };
        if n > 0 {
            return err(
                &req.id,
                "conflict",
                format!("group still has {}", what),
                Some(json!({ "count": n })),
            );
        }
    }
    if let Err(e) = conn.execute("DELETE FROM student_groups WHERE id = ?", [&group_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare("SELECT id, code, name FROM subjects ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "code": row.get::<_, String>(1)?,
                "name": row.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = Uuid::new_v4().to_string();
    match conn.execute(
        "INSERT INTO subjects(id, code, name) VALUES(?, ?, ?)",
        (&subject_id, &code, &name),
    ) {
        Ok(_) => ok(&req.id, json!({ "subjectId": subject_id, "code": code, "name": name })),
        Err(e) if is_unique_violation(&e) => err(
            &req.id,
            "conflict",
            format!("subject code '{}' already exists", code),
            None,
        ),
        Err(e) => err(&req.id, "db_insert_failed", e.to_string(), None),
    }
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }
    for (sql, what) in [
        ("SELECT COUNT(*) FROM schedule_slots WHERE subject_id = ?", "schedule slots"),
        ("SELECT COUNT(*) FROM extra_classes WHERE subject_id = ?", "extra classes"),
    ] {
        let n = match query_count(conn, req, sql, &subject_id) {
            Ok(n) => n,
            Err(e) => return e,
        };
        if n > 0 {
            return err(
                &req.id,
                "conflict",
                format!("subject is still used by {}", what),
                Some(json!({ "count": n })),
            );
        }
    }
    if let Err(e) = conn.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_faculty_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare("SELECT id, name FROM faculty ORDER BY name") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(faculty) => ok(&req.id, json!({ "faculty": faculty })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_faculty_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let faculty_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO faculty(id, name) VALUES(?, ?)",
        (&faculty_id, &name),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "facultyId": faculty_id, "name": name }))
}

fn handle_faculty_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let faculty_id = match required_str(req, "facultyId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM faculty WHERE id = ?", [&faculty_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "faculty not found", None);
    }
    for (sql, what) in [
        ("SELECT COUNT(*) FROM schedule_slots WHERE faculty_id = ?", "schedule slots"),
        (
            "SELECT COUNT(*) FROM substitutions WHERE substitute_faculty_id = ?",
            "substitutions",
        ),
        ("SELECT COUNT(*) FROM extra_classes WHERE faculty_id = ?", "extra classes"),
    ] {
        let n = match query_count(conn, req, sql, &faculty_id) {
            Ok(n) => n,
            Err(e) => return e,
        };
        if n > 0 {
            return err(
                &req.id,
                "conflict",
                format!("faculty member still teaches {}", what),
                Some(json!({ "count": n })),
            );
        }
    }
    if let Err(e) = conn.execute("DELETE FROM faculty WHERE id = ?", [&faculty_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let group_id = match required_str(req, "groupId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, last_name, first_name, active, sort_order
         FROM students WHERE group_id = ? ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&group_id], |row| {
            let last: String = row.get(1)?;
            let first: String = row.get(2)?;
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "displayName": format!("{}, {}", last, first),
                "lastName": last,
                "firstName": first,
                "active": row.get::<_, i64>(3)? != 0,
                "sortOrder": row.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let group_id = match required_str(req, "groupId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let group_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM student_groups WHERE id = ?", [&group_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if group_exists.is_none() {
        return err(&req.id, "not_found", "group not found", None);
    }
    let next_sort: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE group_id = ?",
        [&group_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, group_id, last_name, first_name, active, sort_order)
         VALUES(?, ?, ?, ?, 1, ?)",
        (&student_id, &group_id, &last_name, &first_name, next_sort),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "studentId": student_id, "sortOrder": next_sort }))
}

fn handle_students_set_active(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let Some(active) = req.params.get("active").and_then(|v| v.as_bool()) else {
        return err(&req.id, "bad_params", "missing active", None);
    };
    let updated = match conn.execute(
        "UPDATE students SET active = ? WHERE id = ?",
        (active as i64, &student_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if updated == 0 {
        return err(&req.id, "not_found", "student not found", None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }
    let records = match query_count(
        conn,
        req,
        "SELECT COUNT(*) FROM attendance_records WHERE student_id = ?",
        &student_id,
    ) {
        Ok(n) => n,
        Err(e) => return e,
    };
    if records > 0 {
        return err(
            &req.id,
            "conflict",
            "student has attendance history; deactivate instead",
            Some(json!({ "count": records })),
        );
    }
    if let Err(e) = conn.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_timeslots_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let mut stmt = match conn.prepare(
        "SELECT id, start_time, end_time, label, is_schedulable
         FROM time_slots ORDER BY start_time",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "startTime": row.get::<_, String>(1)?,
                "endTime": row.get::<_, String>(2)?,
                "label": row.get::<_, Option<String>>(3)?,
                "isSchedulable": row.get::<_, i64>(4)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(slots) => ok(&req.id, json!({ "timeSlots": slots })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn parse_wall_time(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    let raw = required_str(req, key)?;
    if NaiveTime::parse_from_str(&raw, "%H:%M").is_err() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be HH:MM", key),
            None,
        ));
    }
    Ok(raw)
}

fn handle_timeslots_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let start_time = match parse_wall_time(req, "startTime") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let end_time = match parse_wall_time(req, "endTime") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if start_time >= end_time {
        return err(&req.id, "bad_params", "startTime must be before endTime", None);
    }
    let label = req
        .params
        .get("label")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let is_schedulable = req
        .params
        .get("isSchedulable")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let time_slot_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO time_slots(id, start_time, end_time, label, is_schedulable)
         VALUES(?, ?, ?, ?, ?)",
        (&time_slot_id, &start_time, &end_time, &label, is_schedulable as i64),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "timeSlotId": time_slot_id }))
}

fn handle_timeslots_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(e) => return e,
    };
    let time_slot_id = match required_str(req, "timeSlotId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM time_slots WHERE id = ?", [&time_slot_id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "time slot not found", None);
    }
    for (sql, what) in [
        ("SELECT COUNT(*) FROM schedule_slots WHERE time_slot_id = ?", "schedule slots"),
        ("SELECT COUNT(*) FROM extra_classes WHERE time_slot_id = ?", "extra classes"),
    ] {
        let n = match query_count(conn, req, sql, &time_slot_id) {
            Ok(n) => n,
            Err(e) => return e,
        };
        if n > 0 {
            return err(
                &req.id,
                "conflict",
                format!("time slot is still used by {}", what),
                Some(json!({ "count": n })),
            );
        }
    }
    if let Err(e) = conn.execute("DELETE FROM time_slots WHERE id = ?", [&time_slot_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "groups.list" => Some(handle_groups_list(state, req)),
        "groups.create" => Some(handle_groups_create(state, req)),
        "groups.delete" => Some(handle_groups_delete(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        "faculty.list" => Some(handle_faculty_list(state, req)),
        "faculty.create" => Some(handle_faculty_create(state, req)),
        "faculty.delete" => Some(handle_faculty_delete(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.setActive" => Some(handle_students_set_active(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        "timeslots.list" => Some(handle_timeslots_list(state, req)),
        "timeslots.create" => Some(handle_timeslots_create(state, req)),
        "timeslots.delete" => Some(handle_timeslots_delete(state, req)),
        _ => None,
    }
}
