use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_rollbookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rollbookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct Seeded {
    group: String,
    math: String,
    phy: String,
    faculty: String,
    ts_morning: String,
    slot_math: String,
    maya: String,
    ben: String,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seeded {
    let take = |r: serde_json::Value, key: &str| {
        r.get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| panic!("missing {} in {}", key, r))
            .to_string()
    };

    let group = take(
        request_ok(stdin, reader, "s1", "groups.create", json!({ "name": "BCA Section A" })),
        "groupId",
    );
    let math = take(
        request_ok(
            stdin,
            reader,
            "s2",
            "subjects.create",
            json!({ "code": "MAT101", "name": "Mathematics" }),
        ),
        "subjectId",
    );
    let phy = take(
        request_ok(
            stdin,
            reader,
            "s3",
            "subjects.create",
            json!({ "code": "PHY101", "name": "Physics" }),
        ),
        "subjectId",
    );
    let faculty = take(
        request_ok(stdin, reader, "s4", "faculty.create", json!({ "name": "A. Rao" })),
        "facultyId",
    );
    let ts_morning = take(
        request_ok(
            stdin,
            reader,
            "s5",
            "timeslots.create",
            json!({ "startTime": "09:00", "endTime": "10:00" }),
        ),
        "timeSlotId",
    );
    let slot_math = take(
        request_ok(
            stdin,
            reader,
            "s6",
            "schedule.createSlot",
            json!({
                "groupId": group, "subjectId": math, "facultyId": faculty,
                "weekday": "Monday", "timeSlotId": ts_morning
            }),
        ),
        "slotId",
    );
    // Physics meets Tuesdays but is never marked, so it stays at zero held.
    let _ = request_ok(
        stdin,
        reader,
        "s7",
        "schedule.createSlot",
        json!({
            "groupId": group, "subjectId": phy, "facultyId": faculty,
            "weekday": "Tuesday", "timeSlotId": ts_morning
        }),
    );
    let maya = take(
        request_ok(
            stdin,
            reader,
            "s8",
            "students.create",
            json!({ "groupId": group, "lastName": "Xavier", "firstName": "Maya" }),
        ),
        "studentId",
    );
    let ben = take(
        request_ok(
            stdin,
            reader,
            "s9",
            "students.create",
            json!({ "groupId": group, "lastName": "Young", "firstName": "Ben" }),
        ),
        "studentId",
    );

    Seeded {
        group,
        math,
        phy,
        faculty,
        ts_morning,
        slot_math,
        maya,
        ben,
    }
}

/// Five marked Mondays plus three extra classes: Maya attends six of the
/// eight (one of them late), Ben attends none.
fn seed_term(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, ids: &Seeded) {
    let mondays = ["2024-03-04", "2024-03-11", "2024-03-18", "2024-03-25", "2024-04-01"];
    for (i, date) in mondays.iter().enumerate() {
        let maya_status = if i < 4 { "Present" } else { "Absent" };
        let _ = request_ok(
            stdin,
            reader,
            &format!("m{}", i),
            "attendance.mark",
            json!({
                "date": date, "slotId": ids.slot_math, "markedBy": ids.faculty, "now": date,
                "entries": [
                    { "studentId": ids.maya, "status": maya_status, "isLate": i == 1 },
                    { "studentId": ids.ben, "status": "Absent" }
                ]
            }),
        );
    }

    let wednesdays = ["2024-03-06", "2024-03-13", "2024-03-20"];
    for (i, date) in wednesdays.iter().enumerate() {
        let extra = request_ok(
            stdin,
            reader,
            &format!("e{}", i),
            "extraclasses.create",
            json!({
                "facultyId": ids.faculty, "groupId": ids.group, "subjectId": ids.math,
                "date": date, "timeSlotId": ids.ts_morning
            }),
        );
        let extra_id = extra
            .get("extraClassId")
            .and_then(|v| v.as_str())
            .expect("extraClassId")
            .to_string();
        let maya_status = if i < 2 { "Present" } else { "Absent" };
        let _ = request_ok(
            stdin,
            reader,
            &format!("em{}", i),
            "attendance.mark",
            json!({
                "date": date, "extraClassId": extra_id, "markedBy": ids.faculty, "now": date,
                "entries": [
                    { "studentId": ids.maya, "status": maya_status },
                    { "studentId": ids.ben, "status": "Absent" }
                ]
            }),
        );
    }
}

#[test]
fn held_and_attended_union_both_session_sources() {
    let workspace = temp_dir("rollbook-summary");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let ids = seed(&mut stdin, &mut reader);
    seed_term(&mut stdin, &mut reader, &ids);

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.subjectSummary",
        json!({
            "studentId": ids.maya, "subjectId": ids.math,
            "from": "2024-03-01", "to": "2024-04-30"
        }),
    );
    assert_eq!(summary.get("held").and_then(|v| v.as_i64()), Some(8));
    assert_eq!(summary.get("attended").and_then(|v| v.as_i64()), Some(6));
    assert_eq!(summary.get("percentage").and_then(|v| v.as_f64()), Some(75.0));

    // Recomputing yields the same numbers.
    let summary2 = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.subjectSummary",
        json!({
            "studentId": ids.maya, "subjectId": ids.math,
            "from": "2024-03-01", "to": "2024-04-30"
        }),
    );
    assert_eq!(summary, summary2);

    // Trimming the period to March drops the April Monday.
    let march = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "reports.subjectSummary",
        json!({
            "studentId": ids.maya, "subjectId": ids.math,
            "from": "2024-03-01", "to": "2024-03-31"
        }),
    );
    assert_eq!(march.get("held").and_then(|v| v.as_i64()), Some(7));
    assert_eq!(march.get("attended").and_then(|v| v.as_i64()), Some(6));
}

#[test]
fn zero_held_reports_zero_percent_with_held_count() {
    let workspace = temp_dir("rollbook-summary-zero");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let ids = seed(&mut stdin, &mut reader);

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.subjectSummary",
        json!({ "studentId": ids.maya, "subjectId": ids.phy }),
    );
    assert_eq!(summary.get("held").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(summary.get("attended").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(summary.get("percentage").and_then(|v| v.as_f64()), Some(0.0));
}

#[test]
fn group_sheet_and_student_overview_align_with_summaries() {
    let workspace = temp_dir("rollbook-summary-views");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let ids = seed(&mut stdin, &mut reader);
    seed_term(&mut stdin, &mut reader, &ids);

    let sheet = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "reports.groupSheet",
        json!({
            "groupId": ids.group, "subjectId": ids.math,
            "from": "2024-03-01", "to": "2024-04-30"
        }),
    );
    let rows = sheet.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert_eq!(rows.len(), 2);
    let maya_row = rows
        .iter()
        .find(|r| r.get("studentId").and_then(|v| v.as_str()) == Some(ids.maya.as_str()))
        .expect("maya row");
    assert_eq!(maya_row.get("percentage").and_then(|v| v.as_f64()), Some(75.0));
    let ben_row = rows
        .iter()
        .find(|r| r.get("studentId").and_then(|v| v.as_str()) == Some(ids.ben.as_str()))
        .expect("ben row");
    assert_eq!(ben_row.get("held").and_then(|v| v.as_i64()), Some(8));
    assert_eq!(ben_row.get("attended").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(ben_row.get("percentage").and_then(|v| v.as_f64()), Some(0.0));

    let overview = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.studentOverview",
        json!({ "studentId": ids.maya, "from": "2024-03-01", "to": "2024-04-30" }),
    );
    let subjects = overview.get("subjects").and_then(|v| v.as_array()).expect("subjects");
    // Both timetabled subjects appear, Physics at zero held.
    assert_eq!(subjects.len(), 2);
    let math_line = subjects
        .iter()
        .find(|s| s.get("subjectId").and_then(|v| v.as_str()) == Some(ids.math.as_str()))
        .expect("math line");
    assert_eq!(math_line.get("held").and_then(|v| v.as_i64()), Some(8));
    let phy_line = subjects
        .iter()
        .find(|s| s.get("subjectId").and_then(|v| v.as_str()) == Some(ids.phy.as_str()))
        .expect("physics line");
    assert_eq!(phy_line.get("held").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(phy_line.get("percentage").and_then(|v| v.as_f64()), Some(0.0));
}
