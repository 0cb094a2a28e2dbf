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
    let exe = env!("CARGO_BIN_EXE_rosterd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn rosterd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn mutations_append_audit_rows_with_actor_attribution() {
    let workspace = temp_dir("rosterd-audit");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "w",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let student_id = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "students.create",
        json!({ "lastName": "Voss", "firstName": "Mara", "actor": "jmorales" }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    let class_id = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "classes.create",
        json!({ "name": "History" }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "e1",
        "enrollment.set",
        json!({ "classId": class_id, "studentIds": [student_id] }),
    );

    let all = request_ok(&mut stdin, &mut reader, "l1", "audit.list", json!({}));
    let entries = all["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 3);
    // Newest first.
    assert_eq!(entries[0]["method"], json!("enrollment.set"));
    assert_eq!(entries[2]["method"], json!("students.create"));
    assert_eq!(entries[2]["actor"], json!("jmorales"));
    assert_eq!(entries[1]["actor"], json!("system"));

    // Reads never add rows.
    let _ = request_ok(&mut stdin, &mut reader, "r1", "students.list", json!({}));
    let again = request_ok(&mut stdin, &mut reader, "l2", "audit.list", json!({}));
    assert_eq!(again["entries"].as_array().expect("entries").len(), 3);

    // Entity filters narrow the listing.
    let students_only = request_ok(
        &mut stdin,
        &mut reader,
        "l3",
        "audit.list",
        json!({ "entityType": "student" }),
    );
    let students_entries = students_only["entries"].as_array().expect("entries");
    assert_eq!(students_entries.len(), 1);
    assert_eq!(
        students_entries[0]["entityId"].as_str(),
        Some(student_id.as_str())
    );

    drop(stdin);
    let _ = child.wait();
}
