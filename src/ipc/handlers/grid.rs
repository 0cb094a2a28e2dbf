use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use crate::audit;
use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};

const GRID_GET_MAX_ROWS: i64 = 2000;
const GRID_GET_MAX_COLS: i64 = 256;
const GRID_BULK_UPDATE_MAX_EDITS: usize = 5000;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

/// Form input arrives as whatever the cell widget held. The calc-layer rule
/// applies: blank or non-numeric means "not graded", never zero.
fn resolve_points(value: Option<&serde_json::Value>) -> Result<Option<f64>, HandlerErr> {
    calc::parse_score_entry(value).map_err(|e| HandlerErr {
        code: "bad_params",
        message: e.message,
        details: e.details,
    })
}

fn resolve_student_id_by_row(
    conn: &Connection,
    class_id: &str,
    row: i64,
) -> Result<String, HandlerErr> {
    let student_id: Option<String> = conn
        .query_row(
            "SELECT student_id FROM enrollments WHERE class_id = ? AND sort_order = ?",
            (class_id, row),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    student_id.ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "no enrolled student at this row".to_string(),
        details: Some(json!({ "row": row })),
    })
}

fn resolve_assignment_id_by_col(
    conn: &Connection,
    class_id: &str,
    col: i64,
) -> Result<String, HandlerErr> {
    let assignment_id: Option<String> = conn
        .query_row(
            "SELECT id FROM assignments WHERE class_id = ? AND idx = ?",
            (class_id, col),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    assignment_id.ok_or_else(|| HandlerErr {
        code: "not_found",
        message: "assignment not found".to_string(),
        details: Some(json!({ "col": col })),
    })
}

fn upsert_score(
    conn: &Connection,
    assignment_id: &str,
    student_id: &str,
    points: Option<f64>,
) -> Result<(), HandlerErr> {
    let score_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO scores(id, assignment_id, student_id, points, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(assignment_id, student_id) DO UPDATE SET
           points = excluded.points,
           updated_at = excluded.updated_at",
        (
            &score_id,
            assignment_id,
            student_id,
            points,
            Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "scores" })),
    })?;
    Ok(())
}

fn handle_grid_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let row_start = req
        .params
        .get("rowStart")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let row_count_req = req
        .params
        .get("rowCount")
        .and_then(|v| v.as_i64())
        .unwrap_or(GRID_GET_MAX_ROWS);
    let col_start = req
        .params
        .get("colStart")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let col_count_req = req
        .params
        .get("colCount")
        .and_then(|v| v.as_i64())
        .unwrap_or(GRID_GET_MAX_COLS);

    if row_start < 0 || col_start < 0 {
        return err(
            &req.id,
            "bad_params",
            "rowStart/colStart must be >= 0",
            Some(json!({ "rowStart": row_start, "colStart": col_start })),
        );
    }
    if row_count_req < 0 || col_count_req < 0 {
        return err(
            &req.id,
            "bad_params",
            "rowCount/colCount must be >= 0",
            Some(json!({ "rowCount": row_count_req, "colCount": col_count_req })),
        );
    }
    if row_count_req > GRID_GET_MAX_ROWS || col_count_req > GRID_GET_MAX_COLS {
        return err(
            &req.id,
            "bad_params",
            "requested grid range is too large",
            Some(json!({
                "rowCount": row_count_req,
                "colCount": col_count_req,
                "maxRows": GRID_GET_MAX_ROWS,
                "maxCols": GRID_GET_MAX_COLS
            })),
        );
    }

    let mut student_stmt = match conn.prepare(
        "SELECT student_id FROM enrollments
         WHERE class_id = ? ORDER BY sort_order LIMIT ? OFFSET ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let student_ids = match student_stmt
        .query_map((&class_id, row_count_req, row_start), |row| {
            row.get::<_, String>(0)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut assess_stmt = match conn.prepare(
        "SELECT id FROM assignments WHERE class_id = ? ORDER BY idx LIMIT ? OFFSET ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let assignment_ids = match assess_stmt
        .query_map((&class_id, col_count_req, col_start), |row| {
            row.get::<_, String>(0)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let row_count = student_ids.len();
    let col_count = assignment_ids.len();
    let mut cells: Vec<Vec<Option<f64>>> = vec![vec![None; col_count]; row_count];

    if row_count > 0 && col_count > 0 {
        let assess_placeholders = std::iter::repeat("?")
            .take(col_count)
            .collect::<Vec<_>>()
            .join(",");
        let stud_placeholders = std::iter::repeat("?")
            .take(row_count)
            .collect::<Vec<_>>()
            .join(",");

        let sql = format!(
            "SELECT assignment_id, student_id, points FROM scores
             WHERE assignment_id IN ({}) AND student_id IN ({})",
            assess_placeholders, stud_placeholders
        );

        let mut bind_values: Vec<Value> = Vec::with_capacity(col_count + row_count);
        for id in &assignment_ids {
            bind_values.push(Value::Text(id.clone()));
        }
        for id in &student_ids {
            bind_values.push(Value::Text(id.clone()));
        }

        let mut score_stmt = match conn.prepare(&sql) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        let student_index: HashMap<&str, usize> = student_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let assignment_index: HashMap<&str, usize> = assignment_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let score_rows = score_stmt.query_map(params_from_iter(bind_values), |row| {
            let assignment_id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let points: Option<f64> = row.get(2)?;
            Ok((assignment_id, student_id, points))
        });

        match score_rows {
            Ok(it) => {
                for r in it.flatten() {
                    let Some(&r_i) = student_index.get(r.1.as_str()) else {
                        continue;
                    };
                    let Some(&c_i) = assignment_index.get(r.0.as_str()) else {
                        continue;
                    };
                    cells[r_i][c_i] = r.2;
                }
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    ok(
        &req.id,
        json!({
            "rowStart": row_start,
            "rowCount": row_count,
            "colStart": col_start,
            "colCount": col_count,
            "cells": cells
        }),
    )
}

fn handle_grid_update_cell(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let row = match req.params.get("row").and_then(|v| v.as_i64()) {
        Some(v) if v >= 0 => v,
        _ => return err(&req.id, "bad_params", "missing/invalid row", None),
    };
    let col = match req.params.get("col").and_then(|v| v.as_i64()) {
        Some(v) if v >= 0 => v,
        _ => return err(&req.id, "bad_params", "missing/invalid col", None),
    };

    let points = match resolve_points(req.params.get("value")) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let student_id = match resolve_student_id_by_row(conn, &class_id, row) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let assignment_id = match resolve_assignment_id_by_col(conn, &class_id, col) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    if let Err(e) = upsert_score(conn, &assignment_id, &student_id, points) {
        return e.response(&req.id);
    }

    audit::record(
        conn,
        audit::AuditEntry {
            actor: &audit::actor_from(&req.params),
            method: "grid.updateCell",
            entity_type: "score",
            entity_id: Some(&assignment_id),
            detail: json!({
                "studentId": student_id,
                "points": points,
            }),
        },
    );

    ok(&req.id, json!({ "ok": true, "points": points }))
}

fn handle_grid_bulk_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(edits_arr) = req.params.get("edits").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing edits[]", None);
    };

    if edits_arr.len() > GRID_BULK_UPDATE_MAX_EDITS {
        let rejected = edits_arr.len();
        return ok(
            &req.id,
            json!({
                "ok": true,
                "updated": 0,
                "rejected": rejected,
                "limitExceeded": true,
                "errors": [{
                    "row": -1,
                    "col": -1,
                    "code": "too_many_edits",
                    "message": format!(
                        "bulk payload exceeds max edits: {} > {}",
                        rejected, GRID_BULK_UPDATE_MAX_EDITS
                    )
                }]
            }),
        );
    }

    let mut updated: usize = 0;
    let mut errors: Vec<serde_json::Value> = Vec::new();

    for (i, edit) in edits_arr.iter().enumerate() {
        let Some(obj) = edit.as_object() else {
            errors.push(json!({
                "row": -1,
                "col": -1,
                "code": "bad_params",
                "message": format!("edit at index {} must be an object", i),
            }));
            continue;
        };

        let row = match obj.get("row").and_then(|v| v.as_i64()) {
            Some(v) if v >= 0 => v,
            _ => {
                errors.push(json!({
                    "row": -1,
                    "col": -1,
                    "code": "bad_params",
                    "message": format!("edit at index {} missing/invalid row", i),
                }));
                continue;
            }
        };
        let col = match obj.get("col").and_then(|v| v.as_i64()) {
            Some(v) if v >= 0 => v,
            _ => {
                errors.push(json!({
                    "row": row,
                    "col": -1,
                    "code": "bad_params",
                    "message": format!("edit at index {} missing/invalid col", i),
                }));
                continue;
            }
        };

        let points = match resolve_points(obj.get("value")) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({
                    "row": row,
                    "col": col,
                    "code": e.code,
                    "message": e.message,
                }));
                continue;
            }
        };

        let student_id = match resolve_student_id_by_row(conn, &class_id, row) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({
                    "row": row,
                    "col": col,
                    "code": e.code,
                    "message": e.message,
                }));
                continue;
            }
        };
        let assignment_id = match resolve_assignment_id_by_col(conn, &class_id, col) {
            Ok(v) => v,
            Err(e) => {
                errors.push(json!({
                    "row": row,
                    "col": col,
                    "code": e.code,
                    "message": e.message,
                }));
                continue;
            }
        };

        match upsert_score(conn, &assignment_id, &student_id, points) {
            Ok(()) => updated += 1,
            Err(e) => errors.push(json!({
                "row": row,
                "col": col,
                "code": e.code,
                "message": e.message,
            })),
        }
    }

    if updated > 0 {
        audit::record(
            conn,
            audit::AuditEntry {
                actor: &audit::actor_from(&req.params),
                method: "grid.bulkUpdate",
                entity_type: "class",
                entity_id: Some(&class_id),
                detail: json!({ "updated": updated, "rejected": errors.len() }),
            },
        );
    }

    let rejected = errors.len();
    let mut result = json!({ "ok": true, "updated": updated });
    if rejected > 0 {
        let obj = result.as_object_mut().expect("result should be object");
        obj.insert("rejected".into(), json!(rejected));
        obj.insert("errors".into(), json!(errors));
    }

    ok(&req.id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grid.get" => Some(handle_grid_get(state, req)),
        "grid.updateCell" => Some(handle_grid_update_cell(state, req)),
        "grid.bulkUpdate" => Some(handle_grid_bulk_update(state, req)),
        _ => None,
    }
}
