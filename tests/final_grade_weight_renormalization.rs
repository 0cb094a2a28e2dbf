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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn final_percent(summary: &serde_json::Value, student_id: &str) -> Option<f64> {
    let row = summary
        .get("perStudent")
        .and_then(|v| v.as_array())
        .and_then(|arr| {
            arr.iter()
                .find(|s| s.get("studentId").and_then(|v| v.as_str()) == Some(student_id))
        })
        .expect("student row");
    row.get("finalPercent").and_then(|v| v.as_f64())
}

struct Fixture {
    class_id: String,
    alice: String,
    bob: String,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Fixture {
    let workspace = temp_dir("rosterd-renorm");
    let _ = request_ok(
        stdin,
        reader,
        "w",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let alice = request_ok(
        stdin,
        reader,
        "s1",
        "students.create",
        json!({ "lastName": "Aoki", "firstName": "Rin" }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();
    let bob = request_ok(
        stdin,
        reader,
        "s2",
        "students.create",
        json!({ "lastName": "Baker", "firstName": "Theo" }),
    )["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();

    let class_id = request_ok(
        stdin,
        reader,
        "c1",
        "classes.create",
        json!({ "name": "Algebra II" }),
    )["classId"]
        .as_str()
        .expect("classId")
        .to_string();
    let _ = request_ok(
        stdin,
        reader,
        "e1",
        "enrollment.set",
        json!({ "classId": class_id, "studentIds": [alice, bob] }),
    );

    let cats = request_ok(
        stdin,
        reader,
        "cat1",
        "categories.save",
        json!({
            "classId": class_id,
            "categories": [
                { "name": "Homework", "weight": 20 },
                { "name": "Quizzes", "weight": 30 },
                { "name": "Tests", "weight": 50 }
            ]
        }),
    );
    let cat_ids: Vec<String> = cats["categories"]
        .as_array()
        .expect("categories")
        .iter()
        .map(|c| c["categoryId"].as_str().expect("id").to_string())
        .collect();

    for (i, (title, out_of, cat)) in [
        ("HW 1", 10.0, &cat_ids[0]),
        ("Quiz 1", 25.0, &cat_ids[1]),
        ("Unit Test", 100.0, &cat_ids[2]),
    ]
    .iter()
    .enumerate()
    {
        let _ = request_ok(
            stdin,
            reader,
            &format!("a{}", i),
            "assignments.create",
            json!({
                "classId": class_id,
                "title": title,
                "outOf": out_of,
                "categoryId": cat
            }),
        );
    }

    Fixture {
        class_id,
        alice,
        bob,
    }
}

#[test]
fn ungraded_categories_renormalize_and_empty_grade_is_null() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed(&mut stdin, &mut reader);

    // Nothing graded yet: every student is null, not zero.
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "g0",
        "grades.classSummary",
        json!({ "classId": fx.class_id }),
    );
    assert_eq!(final_percent(&summary, &fx.alice), None);
    assert_eq!(final_percent(&summary, &fx.bob), None);

    // Alice: only the Tests category graded, 80/100. Weight renormalizes
    // over the attempted 50 points, so her final is 80, not 40.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "u1",
        "grid.updateCell",
        json!({ "classId": fx.class_id, "row": 0, "col": 2, "value": 80 }),
    );

    // Bob: perfect scores everywhere.
    for (i, (col, value)) in [(0, 10.0), (1, 25.0), (2, 100.0)].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("u2-{}", i),
            "grid.updateCell",
            json!({ "classId": fx.class_id, "row": 1, "col": col, "value": value }),
        );
    }

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "grades.classSummary",
        json!({ "classId": fx.class_id }),
    );
    assert_eq!(final_percent(&summary, &fx.alice), Some(80.0));
    assert_eq!(final_percent(&summary, &fx.bob), Some(100.0));

    // Recomputing with unchanged scores yields the same result.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "g2",
        "grades.classSummary",
        json!({ "classId": fx.class_id }),
    );
    assert_eq!(final_percent(&again, &fx.alice), Some(80.0));
    assert_eq!(final_percent(&again, &fx.bob), Some(100.0));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn zero_weight_category_does_not_move_final_grades() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed(&mut stdin, &mut reader);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "u1",
        "grid.updateCell",
        json!({ "classId": fx.class_id, "row": 0, "col": 2, "value": 80 }),
    );
    let before = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "grades.classSummary",
        json!({ "classId": fx.class_id }),
    );
    assert_eq!(final_percent(&before, &fx.alice), Some(80.0));

    // Re-save the scheme with an extra zero-weight category and grade an
    // assignment inside it.
    let cats = request_ok(
        &mut stdin,
        &mut reader,
        "cat2",
        "categories.save",
        json!({
            "classId": fx.class_id,
            "categories": [
                { "name": "Homework", "weight": 20 },
                { "name": "Quizzes", "weight": 30 },
                { "name": "Tests", "weight": 50 },
                { "name": "Participation", "weight": 0 }
            ]
        }),
    );
    let participation_id = cats["categories"]
        .as_array()
        .expect("categories")
        .iter()
        .find(|c| c["name"] == "Participation")
        .and_then(|c| c["categoryId"].as_str())
        .expect("participation id")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "a4",
        "assignments.create",
        json!({
            "classId": fx.class_id,
            "title": "Discussion",
            "outOf": 10,
            "categoryId": participation_id
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "u2",
        "grid.updateCell",
        json!({ "classId": fx.class_id, "row": 0, "col": 3, "value": 10 }),
    );

    let after = request_ok(
        &mut stdin,
        &mut reader,
        "g2",
        "grades.classSummary",
        json!({ "classId": fx.class_id }),
    );
    assert_eq!(final_percent(&after, &fx.alice), Some(80.0));
    assert_eq!(final_percent(&after, &fx.bob), None);

    drop(stdin);
    let _ = child.wait();
}
