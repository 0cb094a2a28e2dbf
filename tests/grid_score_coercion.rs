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

fn cell(grid: &serde_json::Value, row: usize, col: usize) -> Option<f64> {
    grid["cells"][row][col].as_f64()
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let workspace = temp_dir("rosterd-coerce");
    let _ = request_ok(
        stdin,
        reader,
        "w",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let student = request_ok(
        stdin,
        reader,
        "s1",
        "students.create",
        json!({ "lastName": "Okafor", "firstName": "Sam" }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    let class_id = request_ok(
        stdin,
        reader,
        "c1",
        "classes.create",
        json!({ "name": "Biology" }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        "e1",
        "enrollment.set",
        json!({ "classId": class_id, "studentIds": [student] }),
    );
    let cats = request_ok(
        stdin,
        reader,
        "cat",
        "categories.save",
        json!({ "classId": class_id, "categories": [{ "name": "Labs", "weight": 100 }] }),
    );
    let cat_id = cats["categories"][0]["categoryId"]
        .as_str()
        .expect("categoryId")
        .to_string();
    for i in 0..2 {
        let _ = request_ok(
            stdin,
            reader,
            &format!("a{}", i),
            "assignments.create",
            json!({
                "classId": class_id,
                "title": format!("Lab {}", i + 1),
                "outOf": 10,
                "categoryId": cat_id
            }),
        );
    }
    class_id
}

#[test]
fn form_strings_coerce_to_points_or_ungraded() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let class_id = seed(&mut stdin, &mut reader);

    // Numeric string is a mark.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "u1",
        "grid.updateCell",
        json!({ "classId": class_id, "row": 0, "col": 0, "value": " 7.5 " }),
    );
    // Non-numeric text and blank both mean "not graded", never zero.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "u2",
        "grid.updateCell",
        json!({ "classId": class_id, "row": 0, "col": 1, "value": "abc" }),
    );

    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "grid.get",
        json!({ "classId": class_id }),
    );
    assert_eq!(cell(&grid, 0, 0), Some(7.5));
    assert_eq!(cell(&grid, 0, 1), None);

    // Blanking an existing mark clears it back to ungraded.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "u3",
        "grid.updateCell",
        json!({ "classId": class_id, "row": 0, "col": 0, "value": "" }),
    );
    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "g2",
        "grid.get",
        json!({ "classId": class_id }),
    );
    assert_eq!(cell(&grid, 0, 0), None);

    // Negative input is rejected outright.
    let resp = request(
        &mut stdin,
        &mut reader,
        "u4",
        "grid.updateCell",
        json!({ "classId": class_id, "row": 0, "col": 0, "value": -3 }),
    );
    assert_eq!(resp["ok"], json!(false));
    assert_eq!(resp["error"]["code"], json!("bad_params"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn bulk_update_collects_per_edit_errors() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let class_id = seed(&mut stdin, &mut reader);

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "b1",
        "grid.bulkUpdate",
        json!({
            "classId": class_id,
            "edits": [
                { "row": 0, "col": 0, "value": "9" },
                { "row": 0, "col": 1, "value": null },
                { "row": 5, "col": 0, "value": 3 },
                { "row": 0, "col": 0, "value": -1 }
            ]
        }),
    );
    assert_eq!(result["updated"], json!(2));
    assert_eq!(result["rejected"], json!(2));
    let errors = result["errors"].as_array().expect("errors");
    assert_eq!(errors.len(), 2);
    assert!(errors
        .iter()
        .any(|e| e["code"] == json!("not_found") && e["row"] == json!(5)));
    assert!(errors.iter().any(|e| e["code"] == json!("bad_params")));

    let grid = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "grid.get",
        json!({ "classId": class_id }),
    );
    assert_eq!(cell(&grid, 0, 0), Some(9.0));
    assert_eq!(cell(&grid, 0, 1), None);

    drop(stdin);
    let _ = child.wait();
}
