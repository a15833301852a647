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

struct Ids {
    g1: String,
    g2: String,
    math: String,
    phy: String,
    f1: String,
    f2: String,
    f3: String,
    ts1: String,
    ts2: String,
    slot_a: String,
    slot_b: String,
    slot_c: String,
}

/// Monday template: 09:00 G-A Math (f1) and G-B Physics (f2); 10:00 G-A
/// Physics (f2).
fn seed_week(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Ids {
    let mut seq = 0;
    let mut next = || {
        seq += 1;
        format!("seed-{}", seq)
    };
    let take = |r: serde_json::Value, key: &str| {
        r.get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| panic!("missing {} in {}", key, r))
            .to_string()
    };

    let g1 = take(
        request_ok(stdin, reader, &next(), "groups.create", json!({ "name": "BCA Section A" })),
        "groupId",
    );
    let g2 = take(
        request_ok(stdin, reader, &next(), "groups.create", json!({ "name": "BCA Section B" })),
        "groupId",
    );
    let math = take(
        request_ok(
            stdin,
            reader,
            &next(),
            "subjects.create",
            json!({ "code": "MAT101", "name": "Mathematics" }),
        ),
        "subjectId",
    );
    let phy = take(
        request_ok(
            stdin,
            reader,
            &next(),
            "subjects.create",
            json!({ "code": "PHY101", "name": "Physics" }),
        ),
        "subjectId",
    );
    let f1 = take(
        request_ok(stdin, reader, &next(), "faculty.create", json!({ "name": "A. Rao" })),
        "facultyId",
    );
    let f2 = take(
        request_ok(stdin, reader, &next(), "faculty.create", json!({ "name": "B. Iyer" })),
        "facultyId",
    );
    let f3 = take(
        request_ok(stdin, reader, &next(), "faculty.create", json!({ "name": "C. Das" })),
        "facultyId",
    );
    let ts1 = take(
        request_ok(
            stdin,
            reader,
            &next(),
            "timeslots.create",
            json!({ "startTime": "09:00", "endTime": "10:00" }),
        ),
        "timeSlotId",
    );
    let ts2 = take(
        request_ok(
            stdin,
            reader,
            &next(),
            "timeslots.create",
            json!({ "startTime": "10:00", "endTime": "11:00" }),
        ),
        "timeSlotId",
    );

    let slot_a = take(
        request_ok(
            stdin,
            reader,
            &next(),
            "schedule.createSlot",
            json!({
                "groupId": g1, "subjectId": math, "facultyId": f1,
                "weekday": "Monday", "timeSlotId": ts1
            }),
        ),
        "slotId",
    );
    let slot_b = take(
        request_ok(
            stdin,
            reader,
            &next(),
            "schedule.createSlot",
            json!({
                "groupId": g2, "subjectId": phy, "facultyId": f2,
                "weekday": "Monday", "timeSlotId": ts1
            }),
        ),
        "slotId",
    );
    let slot_c = take(
        request_ok(
            stdin,
            reader,
            &next(),
            "schedule.createSlot",
            json!({
                "groupId": g1, "subjectId": phy, "facultyId": f2,
                "weekday": "Monday", "timeSlotId": ts2
            }),
        ),
        "slotId",
    );

    Ids {
        g1,
        g2,
        math,
        phy,
        f1,
        f2,
        f3,
        ts1,
        ts2,
        slot_a,
        slot_b,
        slot_c,
    }
}

fn sessions_of(result: &serde_json::Value) -> Vec<serde_json::Value> {
    result
        .get("sessions")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("sessions array")
}

#[test]
fn resolves_template_exceptions_and_extras_in_order() {
    let workspace = temp_dir("rollbook-resolve-day");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let ids = seed_week(&mut stdin, &mut reader);

    // Monday 2024-03-04: f3 covers slot-a, slot-b is cancelled, and G-B gets
    // an extra Math class at 10:00.
    let substituted = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "exceptions.substitute",
        json!({ "slotId": ids.slot_a, "date": "2024-03-04", "substituteFacultyId": ids.f3 }),
    );
    let payload = substituted.get("notification").expect("notification payload");
    assert_eq!(
        payload.get("substituteFacultyId").and_then(|v| v.as_str()),
        Some(ids.f3.as_str())
    );
    assert_eq!(payload.get("groupId").and_then(|v| v.as_str()), Some(ids.g1.as_str()));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "exceptions.cancel",
        json!({ "slotId": ids.slot_b, "date": "2024-03-04", "cancelledBy": ids.f2 }),
    );
    let extra = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "extraclasses.create",
        json!({
            "facultyId": ids.f3, "groupId": ids.g2, "subjectId": ids.math,
            "date": "2024-03-04", "timeSlotId": ids.ts2
        }),
    );
    let extra_id = extra
        .get("extraClassId")
        .and_then(|v| v.as_str())
        .expect("extraClassId")
        .to_string();

    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "schedule.resolveDay",
        json!({ "date": "2024-03-04" }),
    );
    assert_eq!(resolved.get("weekday").and_then(|v| v.as_str()), Some("Monday"));
    let sessions = sessions_of(&resolved);
    assert_eq!(sessions.len(), 4);

    // 09:00 A before 09:00 B, then the two 10:00 sessions by group name.
    let order: Vec<&str> = sessions
        .iter()
        .map(|s| {
            s.get("source")
                .and_then(|r| r.get("id"))
                .and_then(|v| v.as_str())
                .expect("source id")
        })
        .collect();
    assert_eq!(
        order,
        vec![
            ids.slot_a.as_str(),
            ids.slot_b.as_str(),
            ids.slot_c.as_str(),
            extra_id.as_str()
        ]
    );

    // Substitution changes the effective teacher and nothing else.
    let covered = &sessions[0];
    assert_eq!(
        covered.get("scheduledFacultyId").and_then(|v| v.as_str()),
        Some(ids.f1.as_str())
    );
    assert_eq!(
        covered.get("effectiveFacultyId").and_then(|v| v.as_str()),
        Some(ids.f3.as_str())
    );
    assert_eq!(covered.get("subjectId").and_then(|v| v.as_str()), Some(ids.math.as_str()));
    assert_eq!(covered.get("timeSlotId").and_then(|v| v.as_str()), Some(ids.ts1.as_str()));
    assert_eq!(covered.get("status").and_then(|v| v.as_str()), Some("scheduled"));

    let cancelled = &sessions[1];
    assert_eq!(cancelled.get("status").and_then(|v| v.as_str()), Some("cancelled"));

    let extra_session = &sessions[3];
    assert_eq!(
        extra_session.get("source").and_then(|r| r.get("kind")).and_then(|v| v.as_str()),
        Some("extra")
    );
    assert_eq!(
        extra_session.get("effectiveFacultyId").and_then(|v| v.as_str()),
        Some(ids.f3.as_str())
    );

    // No session shares (group, period).
    let mut seen = std::collections::HashSet::new();
    for s in &sessions {
        let key = (
            s.get("groupId").and_then(|v| v.as_str()).expect("groupId").to_string(),
            s.get("timeSlotId").and_then(|v| v.as_str()).expect("timeSlotId").to_string(),
        );
        assert!(seen.insert(key), "duplicate (group, period) in {}", resolved);
    }

    // Another Monday has the template but none of the exceptions.
    let plain = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "schedule.resolveDay",
        json!({ "date": "2024-03-11" }),
    );
    let plain_sessions = sessions_of(&plain);
    assert_eq!(plain_sessions.len(), 3);
    assert!(plain_sessions
        .iter()
        .all(|s| s.get("status").and_then(|v| v.as_str()) == Some("scheduled")));

    // A Tuesday resolves to nothing.
    let tuesday = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "schedule.resolveDay",
        json!({ "date": "2024-03-05" }),
    );
    assert!(sessions_of(&tuesday).is_empty());
}

#[test]
fn cancelled_slot_with_substitution_keeps_substitute_as_metadata() {
    let workspace = temp_dir("rollbook-cancel-plus-sub");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let ids = seed_week(&mut stdin, &mut reader);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "exceptions.substitute",
        json!({ "slotId": ids.slot_a, "date": "2024-03-04", "substituteFacultyId": ids.f3 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "exceptions.cancel",
        json!({ "slotId": ids.slot_a, "date": "2024-03-04", "cancelledBy": ids.f1 }),
    );

    let resolved = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "schedule.resolveDay",
        json!({ "date": "2024-03-04" }),
    );
    let sessions = sessions_of(&resolved);
    let session = sessions
        .iter()
        .find(|s| {
            s.get("source").and_then(|r| r.get("id")).and_then(|v| v.as_str())
                == Some(ids.slot_a.as_str())
        })
        .expect("slot-a session");
    assert_eq!(session.get("status").and_then(|v| v.as_str()), Some("cancelled"));
    assert_eq!(
        session.get("substituteFacultyId").and_then(|v| v.as_str()),
        Some(ids.f3.as_str())
    );

    // Duplicate cancellation for the same (slot, date) is refused.
    let dup = request(
        &mut stdin,
        &mut reader,
        "4",
        "exceptions.cancel",
        json!({ "slotId": ids.slot_a, "date": "2024-03-04", "cancelledBy": ids.f1 }),
    );
    assert_eq!(
        dup.get("error").and_then(|e| e.get("code")).and_then(|v| v.as_str()),
        Some("conflict")
    );
}

#[test]
fn substituting_the_scheduled_teacher_is_rejected() {
    let workspace = temp_dir("rollbook-self-sub");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let ids = seed_week(&mut stdin, &mut reader);

    let refused = request(
        &mut stdin,
        &mut reader,
        "1",
        "exceptions.substitute",
        json!({ "slotId": ids.slot_a, "date": "2024-03-04", "substituteFacultyId": ids.f1 }),
    );
    assert_eq!(
        refused.get("error").and_then(|e| e.get("code")).and_then(|v| v.as_str()),
        Some("bad_params")
    );

    // Wrong weekday for the slot is also rejected.
    let refused = request(
        &mut stdin,
        &mut reader,
        "2",
        "exceptions.substitute",
        json!({ "slotId": ids.slot_a, "date": "2024-03-05", "substituteFacultyId": ids.f3 }),
    );
    assert_eq!(
        refused.get("error").and_then(|e| e.get("code")).and_then(|v| v.as_str()),
        Some("bad_params")
    );
}

#[test]
fn extra_class_cannot_collide_with_the_template() {
    let workspace = temp_dir("rollbook-extra-collision");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let ids = seed_week(&mut stdin, &mut reader);

    // f1 already teaches G-A Math on Monday 09:00.
    let refused = request(
        &mut stdin,
        &mut reader,
        "1",
        "extraclasses.create",
        json!({
            "facultyId": ids.f1, "groupId": ids.g2, "subjectId": ids.math,
            "date": "2024-03-04", "timeSlotId": ids.ts1
        }),
    );
    assert_eq!(
        refused.get("error").and_then(|e| e.get("code")).and_then(|v| v.as_str()),
        Some("conflict")
    );

    // The same booking on a free weekday works.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "extraclasses.create",
        json!({
            "facultyId": ids.f1, "groupId": ids.g2, "subjectId": ids.math,
            "date": "2024-03-06", "timeSlotId": ids.ts1
        }),
    );

    // And a second extra class for the same group/period that day is refused.
    let refused = request(
        &mut stdin,
        &mut reader,
        "3",
        "extraclasses.create",
        json!({
            "facultyId": ids.f2, "groupId": ids.g2, "subjectId": ids.phy,
            "date": "2024-03-06", "timeSlotId": ids.ts1
        }),
    );
    assert_eq!(
        refused.get("error").and_then(|e| e.get("code")).and_then(|v| v.as_str()),
        Some("conflict")
    );
}
