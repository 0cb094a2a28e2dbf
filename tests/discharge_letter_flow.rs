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
    serde_json::from_str(line.trim()).expect("parse response json")
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

#[test]
fn discharge_letter_reflects_grades_and_testing() {
    let workspace = temp_dir("rosterd-letter");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "w",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "st",
        "settings.set",
        json!({ "key": "letterhead", "value": { "schoolName": "Hillside Academy" } }),
    );

    let student_id = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "students.create",
        json!({
            "lastName": "Rivera",
            "firstName": "Dana",
            "studentNo": "1042",
            "admittedOn": "2024-09-03"
        }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();

    let class_id = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "classes.create",
        json!({ "name": "English 10" }),
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
    let cats = request_ok(
        &mut stdin,
        &mut reader,
        "cat",
        "categories.save",
        json!({ "classId": class_id, "categories": [{ "name": "Essays", "weight": 100 }] }),
    );
    let cat_id = cats["categories"][0]["categoryId"]
        .as_str()
        .expect("categoryId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "assignments.create",
        json!({ "classId": class_id, "title": "Essay 1", "outOf": 20, "categoryId": cat_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "u1",
        "grid.updateCell",
        json!({ "classId": class_id, "row": 0, "col": 0, "value": 17.5 }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "k1",
        "ktea.record",
        json!({
            "studentId": student_id,
            "administeredOn": "2026-05-20",
            "form": "A",
            "scores": [
                { "subtest": "LWR", "standardScore": 84 },
                { "subtest": "RC", "standardScore": 88 }
            ]
        }),
    );

    // Preview works before discharge and carries the letterhead.
    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "letters.discharge.preview",
        json!({ "studentId": student_id }),
    );
    let body = preview["body"].as_str().expect("body");
    assert!(body.contains("Hillside Academy"));
    assert!(body.contains("Dana Rivera (student no. 1042)"));
    assert!(body.contains("is currently enrolled"));

    // Generation requires a discharge date on file.
    let early = request(
        &mut stdin,
        &mut reader,
        "g0",
        "letters.discharge.generate",
        json!({ "studentId": student_id }),
    );
    assert_eq!(early["ok"], json!(false));
    assert_eq!(early["error"]["code"], json!("conflict"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "d1",
        "students.discharge",
        json!({ "studentId": student_id, "dischargedOn": "2026-06-12" }),
    );

    let generated = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "letters.discharge.generate",
        json!({ "studentId": student_id }),
    );
    let path = PathBuf::from(generated["path"].as_str().expect("path"));
    assert!(path.is_file(), "letter file written");

    let written = std::fs::read_to_string(&path).expect("read letter");
    assert!(written.contains("until discharge on June 12, 2026"));
    // 17.5 / 20 with a single full-weight category.
    assert!(written.contains("English 10: 87.5%"));
    assert!(written.contains("Reading: mean standard score 86.0"));

    let listing = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "letters.list",
        json!({ "studentId": student_id }),
    );
    let letters = listing["letters"].as_array().expect("letters");
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0]["body"].as_str(), Some(written.as_str()));

    drop(stdin);
    let _ = child.wait();
}
