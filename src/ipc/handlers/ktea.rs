use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::audit;
use crate::export;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::ktea;

struct HandlerErr {
    code: &'static str,
    message: String,
}

impl HandlerErr {
    fn db(e: rusqlite::Error) -> Self {
        Self {
            code: "db_query_failed",
            message: e.to_string(),
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, None)
    }
}

fn catalog_position(code: &str) -> usize {
    ktea::SUBTESTS
        .iter()
        .position(|d| d.code.eq_ignore_ascii_case(code))
        .unwrap_or(usize::MAX)
}

fn load_administrations(
    conn: &Connection,
    student_id: &str,
) -> Result<Vec<ktea::Administration>, HandlerErr> {
    let mut admin_stmt = conn
        .prepare(
            "SELECT id, administered_on, form, examiner
             FROM ktea_administrations
             WHERE student_id = ?
             ORDER BY administered_on, id",
        )
        .map_err(HandlerErr::db)?;
    let mut admins: Vec<ktea::Administration> = admin_stmt
        .query_map([student_id], |r| {
            Ok(ktea::Administration {
                id: r.get(0)?,
                administered_on: r.get(1)?,
                form: r.get(2)?,
                examiner: r.get(3)?,
                scores: Vec::new(),
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut score_stmt = conn
        .prepare(
            "SELECT subtest_code, raw_score, standard_score, grade_equivalent, percentile
             FROM ktea_subtest_scores
             WHERE administration_id = ?",
        )
        .map_err(HandlerErr::db)?;
    for admin in &mut admins {
        let mut scores: Vec<ktea::SubtestScore> = score_stmt
            .query_map([&admin.id], |r| {
                Ok(ktea::SubtestScore {
                    code: r.get(0)?,
                    raw_score: r.get(1)?,
                    standard_score: r.get(2)?,
                    grade_equivalent: r.get(3)?,
                    percentile: r.get(4)?,
                })
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::db)?;
        scores.sort_by_key(|s| catalog_position(&s.code));
        admin.scores = scores;
    }

    Ok(admins)
}

fn student_exists(
    conn: &Connection,
    req: &Request,
    student_id: &str,
) -> Result<(), serde_json::Value> {
    let found: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if found.is_none() {
        return Err(err(&req.id, "not_found", "student not found", None));
    }
    Ok(())
}

fn handle_ktea_subtests(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let subtests: Vec<serde_json::Value> = ktea::SUBTESTS
        .iter()
        .map(|d| {
            json!({
                "code": d.code,
                "label": d.label,
                "composite": d.composite,
            })
        })
        .collect();
    ok(
        &req.id,
        json!({ "subtests": subtests, "composites": ktea::COMPOSITES }),
    )
}

fn handle_ktea_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = student_exists(conn, req, &student_id) {
        return resp;
    }

    let admins = match load_administrations(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let out: Vec<serde_json::Value> = admins
        .iter()
        .map(|a| {
            json!({
                "administrationId": a.id,
                "administeredOn": a.administered_on,
                "form": a.form,
                "examiner": a.examiner,
                "scores": a.scores.iter().map(|s| json!({
                    "subtest": s.code,
                    "rawScore": s.raw_score,
                    "standardScore": s.standard_score,
                    "gradeEquivalent": s.grade_equivalent,
                    "percentile": s.percentile,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();

    ok(&req.id, json!({ "administrations": out }))
}

fn handle_ktea_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = student_exists(conn, req, &student_id) {
        return resp;
    }
    let administered_on = match required_str(req, "administeredOn") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if NaiveDate::parse_from_str(&administered_on, "%Y-%m-%d").is_err() {
        return err(
            &req.id,
            "bad_params",
            "administeredOn must be an ISO date (YYYY-MM-DD)",
            Some(json!({ "administeredOn": administered_on })),
        );
    }
    let form = opt_str(req, "form");
    let examiner = opt_str(req, "examiner");

    let Some(rows) = req.params.get("scores").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing scores[]", None);
    };
    if rows.is_empty() {
        return err(&req.id, "bad_params", "scores[] must not be empty", None);
    }

    let mut parsed: Vec<ktea::SubtestScore> = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let Some(obj) = row.as_object() else {
            return err(
                &req.id,
                "bad_params",
                format!("score at index {} must be an object", i),
                None,
            );
        };
        let code_raw = obj
            .get("subtest")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .unwrap_or("");
        let Some(def) = ktea::subtest(code_raw) else {
            return err(
                &req.id,
                "bad_params",
                "unknown subtest code",
                Some(json!({ "subtest": code_raw })),
            );
        };
        if parsed.iter().any(|p| p.code == def.code) {
            return err(
                &req.id,
                "bad_params",
                "duplicate subtest code",
                Some(json!({ "subtest": def.code })),
            );
        }
        let percentile = obj.get("percentile").and_then(|v| v.as_f64());
        if let Some(p) = percentile {
            if !(0.0..=100.0).contains(&p) {
                return err(
                    &req.id,
                    "bad_params",
                    "percentile must be between 0 and 100",
                    Some(json!({ "subtest": def.code, "percentile": p })),
                );
            }
        }
        parsed.push(ktea::SubtestScore {
            code: def.code.to_string(),
            raw_score: obj.get("rawScore").and_then(|v| v.as_f64()),
            standard_score: obj.get("standardScore").and_then(|v| v.as_f64()),
            grade_equivalent: obj
                .get("gradeEquivalent")
                .and_then(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            percentile,
        });
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let administration_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO ktea_administrations(id, student_id, administered_on, form, examiner)
         VALUES(?, ?, ?, ?, ?)",
        (
            &administration_id,
            &student_id,
            &administered_on,
            &form,
            &examiner,
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "ktea_administrations" })),
        );
    }
    for s in &parsed {
        if let Err(e) = tx.execute(
            "INSERT INTO ktea_subtest_scores(
                 id, administration_id, subtest_code, raw_score, standard_score,
                 grade_equivalent, percentile)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &administration_id,
                &s.code,
                s.raw_score,
                s.standard_score,
                &s.grade_equivalent,
                s.percentile,
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "ktea_subtest_scores" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    audit::record(
        conn,
        audit::AuditEntry {
            actor: &audit::actor_from(&req.params),
            method: "ktea.record",
            entity_type: "ktea_administration",
            entity_id: Some(&administration_id),
            detail: json!({
                "studentId": student_id,
                "administeredOn": administered_on,
                "subtestCount": parsed.len(),
            }),
        },
    );

    ok(
        &req.id,
        json!({
            "administrationId": administration_id,
            "subtests": parsed.len()
        }),
    )
}

fn handle_ktea_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let administration_id = match required_str(req, "administrationId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM ktea_administrations WHERE id = ?",
            [&administration_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "administration not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM ktea_subtest_scores WHERE administration_id = ?",
        [&administration_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "ktea_subtest_scores" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM ktea_administrations WHERE id = ?",
        [&administration_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "ktea_administrations" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    audit::record(
        conn,
        audit::AuditEntry {
            actor: &audit::actor_from(&req.params),
            method: "ktea.delete",
            entity_type: "ktea_administration",
            entity_id: Some(&administration_id),
            detail: json!({}),
        },
    );

    ok(&req.id, json!({ "ok": true }))
}

fn handle_ktea_report(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = student_exists(conn, req, &student_id) {
        return resp;
    }

    let admins = match load_administrations(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let report = ktea::build_report(&admins);

    match serde_json::to_value(&report) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "io_failed", e.to_string(), None),
    }
}

fn handle_ktea_export_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = student_exists(conn, req, &student_id) {
        return resp;
    }
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(resp) => return resp,
    };

    let admins = match load_administrations(conn, &student_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let report = ktea::build_report(&admins);

    let form_by_admin: HashMap<&str, &str> = admins
        .iter()
        .map(|a| (a.id.as_str(), a.form.as_deref().unwrap_or("")))
        .collect();

    let mut rows: Vec<export::KteaCsvRow> = Vec::new();
    for composite in &report.composites {
        for subtest in &composite.subtests {
            for entry in &subtest.entries {
                rows.push(export::KteaCsvRow {
                    administered_on: entry.administered_on.clone(),
                    form: form_by_admin
                        .get(entry.administration_id.as_str())
                        .unwrap_or(&"")
                        .to_string(),
                    composite: composite.composite.clone(),
                    subtest_code: subtest.code.clone(),
                    subtest_label: subtest.label.clone(),
                    raw_score: entry.raw_score,
                    standard_score: entry.standard_score,
                    grade_equivalent: entry.grade_equivalent.clone().unwrap_or_default(),
                    percentile: entry.percentile,
                });
            }
        }
    }

    match export::write_ktea_csv(&out_path, &rows) {
        Ok(n) => ok(
            &req.id,
            json!({
                "ok": true,
                "path": out_path.to_string_lossy(),
                "rows": n
            }),
        ),
        Err(e) => err(&req.id, "io_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "ktea.subtests" => Some(handle_ktea_subtests(state, req)),
        "ktea.list" => Some(handle_ktea_list(state, req)),
        "ktea.record" => Some(handle_ktea_record(state, req)),
        "ktea.delete" => Some(handle_ktea_delete(state, req)),
        "ktea.report" => Some(handle_ktea_report(state, req)),
        "ktea.exportCsv" => Some(handle_ktea_export_csv(state, req)),
        _ => None,
    }
}
