#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static TEMP_SEQ: AtomicUsize = AtomicUsize::new(0);

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos(),
        TEMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn send_line(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, line: &str) -> serde_json::Value {
    writeln!(stdin, "{}", line).expect("write line");
    stdin.flush().expect("flush line");
    let mut out = String::new();
    reader.read_line(&mut out).expect("read response line");
    serde_json::from_str(out.trim()).expect("parse response json")
}

pub fn request(
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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
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

/// Expects a failure and returns the `error` object.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or_else(|| json!({}))
}

pub fn error_code(error: &serde_json::Value) -> &str {
    error.get("code").and_then(|v| v.as_str()).unwrap_or("")
}

pub fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

/// One subject with a single competency chain and one activity out of 100:
/// semester > subject > competency (100%) > criterion > evidence > activity.
pub struct SeededSubject {
    pub semester_id: String,
    pub subject_id: String,
    pub competency_id: String,
    pub criterion_id: String,
    pub evidence_id: String,
    pub activity_id: String,
}

pub fn seed_subject(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> SeededSubject {
    let sem = request_ok(
        stdin,
        reader,
        "seed-sem",
        "semesters.create",
        json!({ "name": "2026-1", "startDate": "2026-02-01", "endDate": "2026-06-30" }),
    );
    let semester_id = str_field(&sem, "semesterId");
    let sub = request_ok(
        stdin,
        reader,
        "seed-sub",
        "subjects.create",
        json!({ "semesterId": semester_id, "code": "MAT-101", "name": "Mathematics" }),
    );
    let subject_id = str_field(&sub, "subjectId");
    let comp = request_ok(
        stdin,
        reader,
        "seed-comp",
        "competencies.create",
        json!({ "subjectId": subject_id, "name": "Problem solving", "percentage": 100 }),
    );
    let competency_id = str_field(&comp, "competencyId");
    let crit = request_ok(
        stdin,
        reader,
        "seed-crit",
        "criteria.create",
        json!({ "competencyId": competency_id, "name": "Accuracy" }),
    );
    let criterion_id = str_field(&crit, "criterionId");
    let ev = request_ok(
        stdin,
        reader,
        "seed-ev",
        "evidences.create",
        json!({ "criterionId": criterion_id, "name": "Written test" }),
    );
    let evidence_id = str_field(&ev, "evidenceId");
    let act = request_ok(
        stdin,
        reader,
        "seed-act",
        "activities.create",
        json!({ "evidenceId": evidence_id, "title": "Test 1" }),
    );
    let activity_id = str_field(&act, "activityId");

    SeededSubject {
        semester_id,
        subject_id,
        competency_id,
        criterion_id,
        evidence_id,
        activity_id,
    }
}

pub fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    last: &str,
    first: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        &format!("student-{}", last),
        "students.create",
        json!({ "lastName": last, "firstName": first }),
    );
    str_field(&res, "studentId")
}
