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
    slot: String,
    faculty: String,
    student: String,
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
    let subject = take(
        request_ok(
            stdin,
            reader,
            "s2",
            "subjects.create",
            json!({ "code": "MAT101", "name": "Mathematics" }),
        ),
        "subjectId",
    );
    let faculty = take(
        request_ok(stdin, reader, "s3", "faculty.create", json!({ "name": "A. Rao" })),
        "facultyId",
    );
    let ts = take(
        request_ok(
            stdin,
            reader,
            "s4",
            "timeslots.create",
            json!({ "startTime": "09:00", "endTime": "10:00" }),
        ),
        "timeSlotId",
    );
    let slot = take(
        request_ok(
            stdin,
            reader,
            "s5",
            "schedule.createSlot",
            json!({
                "groupId": group, "subjectId": subject, "facultyId": faculty,
                "weekday": "Monday", "timeSlotId": ts
            }),
        ),
        "slotId",
    );
    let student = take(
        request_ok(
            stdin,
            reader,
            "s6",
            "students.create",
            json!({ "groupId": group, "lastName": "Xavier", "firstName": "Maya" }),
        ),
        "studentId",
    );

    Seeded {
        slot,
        faculty,
        student,
    }
}

#[test]
fn sweep_cancels_once_and_reruns_are_noops() {
    let workspace = temp_dir("rollbook-sweep");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let ids = seed(&mut stdin, &mut reader);

    // Monday 2024-03-04 unmarked, markDeadlineDays = 1: lapsed on the 6th.
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "jobs.deadlineSweep",
        json!({ "today": "2024-03-06" }),
    );
    let cancelled = first.get("cancelled").and_then(|v| v.as_array()).expect("cancelled");
    assert_eq!(cancelled.len(), 1);
    let digest = &cancelled[0];
    assert_eq!(digest.get("date").and_then(|v| v.as_str()), Some("2024-03-04"));
    assert_eq!(digest.get("slotId").and_then(|v| v.as_str()), Some(ids.slot.as_str()));
    assert_eq!(digest.get("subjectName").and_then(|v| v.as_str()), Some("Mathematics"));
    assert_eq!(digest.get("groupName").and_then(|v| v.as_str()), Some("BCA Section A"));
    assert_eq!(digest.get("facultyName").and_then(|v| v.as_str()), Some("A. Rao"));
    assert_eq!(first.get("alreadyHandled").and_then(|v| v.as_i64()), Some(0));
    assert!(first.get("errors").and_then(|v| v.as_array()).expect("errors").is_empty());

    // The next day's run sees the lapsed date again but emits nothing new.
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "jobs.deadlineSweep",
        json!({ "today": "2024-03-07" }),
    );
    assert!(second
        .get("cancelled")
        .and_then(|v| v.as_array())
        .expect("cancelled")
        .is_empty());
    assert_eq!(second.get("alreadyHandled").and_then(|v| v.as_i64()), Some(1));

    // The sweep's row is system-authored.
    let day = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "exceptions.listForDate",
        json!({ "date": "2024-03-04" }),
    );
    let cancellations = day
        .get("cancellations")
        .and_then(|v| v.as_array())
        .expect("cancellations");
    assert_eq!(cancellations.len(), 1);
    assert_eq!(cancellations[0].get("system").and_then(|v| v.as_bool()), Some(true));
    assert!(cancellations[0]
        .get("cancelledBy")
        .map(|v| v.is_null())
        .unwrap_or(false));

    // A system cancellation cannot be withdrawn.
    let refused = request(
        &mut stdin,
        &mut reader,
        "4",
        "exceptions.uncancel",
        json!({ "slotId": ids.slot, "date": "2024-03-04" }),
    );
    assert_eq!(
        refused.get("error").and_then(|e| e.get("code")).and_then(|v| v.as_str()),
        Some("conflict")
    );

    // And no attendance can ever be recorded under it.
    let refused = request(
        &mut stdin,
        &mut reader,
        "5",
        "attendance.mark",
        json!({
            "date": "2024-03-04", "slotId": ids.slot, "markedBy": ids.faculty,
            "now": "2024-03-04",
            "entries": [{ "studentId": ids.student, "status": "Present" }]
        }),
    );
    assert_eq!(
        refused.get("error").and_then(|e| e.get("code")).and_then(|v| v.as_str()),
        Some("conflict")
    );
}

#[test]
fn marked_sessions_survive_the_sweep() {
    let workspace = temp_dir("rollbook-sweep-marked");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let ids = seed(&mut stdin, &mut reader);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.mark",
        json!({
            "date": "2024-03-11", "slotId": ids.slot, "markedBy": ids.faculty,
            "now": "2024-03-11",
            "entries": [{ "studentId": ids.student, "status": "Absent" }]
        }),
    );

    let outcome = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "jobs.deadlineSweep",
        json!({ "today": "2024-03-13" }),
    );
    assert!(outcome
        .get("cancelled")
        .and_then(|v| v.as_array())
        .expect("cancelled")
        .is_empty());
    assert_eq!(outcome.get("alreadyHandled").and_then(|v| v.as_i64()), Some(0));

    let day = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "exceptions.listForDate",
        json!({ "date": "2024-03-11" }),
    );
    assert!(day
        .get("cancellations")
        .and_then(|v| v.as_array())
        .expect("cancellations")
        .is_empty());
}

#[test]
fn sweep_only_walks_its_trailing_window() {
    let workspace = temp_dir("rollbook-sweep-window");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ids = seed(&mut stdin, &mut reader);

    // 2024-03-04 lies outside a four-day window ending 2024-04-01; the sweep
    // must not reach back to it.
    let outcome = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "jobs.deadlineSweep",
        json!({ "today": "2024-04-01", "windowDays": 4 }),
    );
    assert!(outcome
        .get("cancelled")
        .and_then(|v| v.as_array())
        .expect("cancelled")
        .is_empty());

    // A wider window reaches the two lapsed Mondays inside it.
    let outcome = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "jobs.deadlineSweep",
        json!({ "today": "2024-04-01", "windowDays": 14 }),
    );
    let cancelled = outcome.get("cancelled").and_then(|v| v.as_array()).expect("cancelled");
    let dates: Vec<&str> = cancelled
        .iter()
        .map(|c| c.get("date").and_then(|v| v.as_str()).expect("date"))
        .collect();
    assert_eq!(dates, vec!["2024-03-25", "2024-03-18"]);
}
