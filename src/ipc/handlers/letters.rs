use chrono::Utc;
use rusqlite::OptionalExtension;
use serde_json::json;
use std::path::PathBuf;
use uuid::Uuid;

use crate::audit;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::letters;

use super::{grades, ktea};

struct StudentRow {
    last_name: String,
    first_name: String,
    student_no: Option<String>,
    admitted_on: Option<String>,
    discharged_on: Option<String>,
}

fn load_student(
    state: &AppState,
    req: &Request,
    student_id: &str,
) -> Result<StudentRow, serde_json::Value> {
    let conn = db_conn(state, req)?;
    let row: Option<StudentRow> = conn
        .query_row(
            "SELECT last_name, first_name, student_no, admitted_on, discharged_on
             FROM students WHERE id = ?",
            [student_id],
            |r| {
                Ok(StudentRow {
                    last_name: r.get(0)?,
                    first_name: r.get(1)?,
                    student_no: r.get(2)?,
                    admitted_on: r.get(3)?,
                    discharged_on: r.get(4)?,
                })
            },
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    row.ok_or_else(|| err(&req.id, "not_found", "student not found", None))
}

fn school_name(state: &AppState) -> String {
    let fallback = "The School".to_string();
    let Some(conn) = state.db.as_ref() else {
        return fallback;
    };
    match db::settings_get_json(conn, "letterhead") {
        Ok(Some(v)) => v
            .get("schoolName")
            .and_then(|s| s.as_str())
            .map(str::to_string)
            .unwrap_or(fallback),
        _ => fallback,
    }
}

/// Assembles the letter body by delegating to the grades and KTEA models,
/// so the letter always matches what those screens report.
fn build_letter_input(
    state: &mut AppState,
    req: &Request,
    student_id: &str,
) -> Result<letters::LetterInput, serde_json::Value> {
    let student = load_student(state, req, student_id)?;
    let school = school_name(state);

    let grades_req = Request {
        id: format!("{}:grades", req.id),
        method: "grades.studentSummary".to_string(),
        params: json!({ "studentId": student_id }),
    };
    let grades_resp = grades::try_handle(state, &grades_req)
        .unwrap_or_else(|| err(&grades_req.id, "not_implemented", "no grades handler", None));
    if grades_resp.get("ok").and_then(|v| v.as_bool()) != Some(true) {
        return Err(grades_resp);
    }
    let class_lines: Vec<letters::ClassLine> = grades_resp
        .get("result")
        .and_then(|r| r.get("classes"))
        .and_then(|c| c.as_array())
        .map(|arr| {
            arr.iter()
                .map(|c| letters::ClassLine {
                    class_name: c
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    final_percent: c.get("finalPercent").and_then(|v| v.as_f64()),
                })
                .collect()
        })
        .unwrap_or_default();

    let ktea_req = Request {
        id: format!("{}:ktea", req.id),
        method: "ktea.report".to_string(),
        params: json!({ "studentId": student_id }),
    };
    let ktea_resp = ktea::try_handle(state, &ktea_req)
        .unwrap_or_else(|| err(&ktea_req.id, "not_implemented", "no ktea handler", None));
    if ktea_resp.get("ok").and_then(|v| v.as_bool()) != Some(true) {
        return Err(ktea_resp);
    }
    let ktea_result = ktea_resp.get("result").cloned().unwrap_or(json!({}));
    let ktea_administered_on = ktea_result
        .get("administrations")
        .and_then(|a| a.as_array())
        .and_then(|arr| arr.last())
        .and_then(|a| a.get("administeredOn"))
        .and_then(|v| v.as_str())
        .map(str::to_string);
    let ktea_lines: Vec<letters::CompositeLine> = ktea_result
        .get("composites")
        .and_then(|c| c.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|c| {
                    let mean = c.get("latestMeanStandard").and_then(|v| v.as_f64())?;
                    Some(letters::CompositeLine {
                        composite: c
                            .get("composite")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string(),
                        mean_standard: mean,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(letters::LetterInput {
        school_name: school,
        first_name: student.first_name,
        last_name: student.last_name,
        student_no: student.student_no,
        admitted_on: student.admitted_on,
        discharged_on: student.discharged_on,
        class_lines,
        ktea_administered_on,
        ktea_lines,
    })
}

fn handle_discharge_preview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let input = match build_letter_input(state, req, &student_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let body = letters::render_discharge_letter(&input, Utc::now().date_naive());
    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "dischargedOn": input.discharged_on,
            "body": body,
        }),
    )
}

fn handle_discharge_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let input = match build_letter_input(state, req, &student_id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(discharged_on) = input.discharged_on.clone() else {
        return err(
            &req.id,
            "conflict",
            "student has no discharge date on file",
            None,
        );
    };

    let out_path = match opt_str(req, "outPath") {
        Some(p) => PathBuf::from(p),
        None => {
            let Some(workspace) = state.workspace.as_ref() else {
                return err(&req.id, "no_workspace", "select a workspace first", None);
            };
            let stem: String = input
                .last_name
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_lowercase();
            workspace
                .join("letters")
                .join(format!("discharge-{}-{}.txt", stem, discharged_on))
        }
    };

    let body = letters::render_discharge_letter(&input, Utc::now().date_naive());

    if let Some(parent) = out_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(&req.id, "io_failed", e.to_string(), None);
        }
    }
    if let Err(e) = std::fs::write(&out_path, &body) {
        return err(&req.id, "io_failed", e.to_string(), None);
    }

    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let letter_id = Uuid::new_v4().to_string();
    let generated_at = Utc::now().to_rfc3339();
    let out_path_text = out_path.to_string_lossy().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO discharge_letters(id, student_id, generated_at, body, output_path)
         VALUES(?, ?, ?, ?, ?)",
        (&letter_id, &student_id, &generated_at, &body, &out_path_text),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "discharge_letters" })),
        );
    }

    audit::record(
        conn,
        audit::AuditEntry {
            actor: &audit::actor_from(&req.params),
            method: "letters.discharge.generate",
            entity_type: "discharge_letter",
            entity_id: Some(&letter_id),
            detail: json!({
                "studentId": student_id,
                "path": out_path_text,
            }),
        },
    );

    ok(
        &req.id,
        json!({
            "letterId": letter_id,
            "path": out_path_text,
            "generatedAt": generated_at,
        }),
    )
}

fn handle_letters_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, generated_at, output_path, body
         FROM discharge_letters
         WHERE student_id = ?
         ORDER BY generated_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&student_id], |row| {
            Ok(json!({
                "letterId": row.get::<_, String>(0)?,
                "generatedAt": row.get::<_, String>(1)?,
                "outputPath": row.get::<_, Option<String>>(2)?,
                "body": row.get::<_, String>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(letters) => ok(&req.id, json!({ "letters": letters })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "letters.discharge.preview" => Some(handle_discharge_preview(state, req)),
        "letters.discharge.generate" => Some(handle_discharge_generate(state, req)),
        "letters.list" => Some(handle_letters_list(state, req)),
        _ => None,
    }
}
