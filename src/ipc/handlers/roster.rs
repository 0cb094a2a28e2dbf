use chrono::{NaiveDate, Utc};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_bool, opt_str, required_str};
use crate::ipc::types::{AppState, Request};

fn validate_iso_date(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    let Some(raw) = opt_str(req, key) else {
        return Ok(None);
    };
    if NaiveDate::parse_from_str(&raw, "%Y-%m-%d").is_err() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be an ISO date (YYYY-MM-DD)", key),
            Some(json!({ key: raw })),
        ));
    }
    Ok(Some(raw))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };
    let include_discharged = opt_bool(req, "includeDischarged").unwrap_or(false);

    let sql = if include_discharged {
        "SELECT id, last_name, first_name, student_no, birth_date, admitted_on,
                discharged_on, active, sort_order
         FROM students ORDER BY sort_order"
    } else {
        "SELECT id, last_name, first_name, student_no, birth_date, admitted_on,
                discharged_on, active, sort_order
         FROM students WHERE active = 1 ORDER BY sort_order"
    };

    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let last: String = row.get(1)?;
            let first: String = row.get(2)?;
            Ok(json!({
                "studentId": row.get::<_, String>(0)?,
                "lastName": last.clone(),
                "firstName": first.clone(),
                "displayName": format!("{}, {}", last, first),
                "studentNo": row.get::<_, Option<String>>(3)?,
                "birthDate": row.get::<_, Option<String>>(4)?,
                "admittedOn": row.get::<_, Option<String>>(5)?,
                "dischargedOn": row.get::<_, Option<String>>(6)?,
                "active": row.get::<_, i64>(7)? != 0,
                "sortOrder": row.get::<_, i64>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_no = opt_str(req, "studentNo");
    let birth_date = match validate_iso_date(req, "birthDate") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let admitted_on = match validate_iso_date(req, "admittedOn") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let next_sort: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, last_name, first_name, student_no, birth_date,
                              admitted_on, active, sort_order, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &student_id,
            &last_name,
            &first_name,
            &student_no,
            &birth_date,
            &admitted_on,
            next_sort,
            Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    audit::record(
        conn,
        audit::AuditEntry {
            actor: &audit::actor_from(&req.params),
            method: "students.create",
            entity_type: "student",
            entity_id: Some(&student_id),
            detail: json!({ "lastName": last_name, "firstName": first_name }),
        },
    );

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let existing: Option<(String, String, Option<String>, Option<String>, Option<String>)> = match conn
        .query_row(
            "SELECT last_name, first_name, student_no, birth_date, admitted_on
             FROM students WHERE id = ?",
            [&student_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((last0, first0, no0, birth0, adm0)) = existing else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let last_name = opt_str(req, "lastName").unwrap_or(last0);
    let first_name = opt_str(req, "firstName").unwrap_or(first0);
    let student_no = match opt_str(req, "studentNo") {
        Some(v) => Some(v),
        None => no0,
    };
    let birth_date = match validate_iso_date(req, "birthDate") {
        Ok(Some(v)) => Some(v),
        Ok(None) => birth0,
        Err(resp) => return resp,
    };
    let admitted_on = match validate_iso_date(req, "admittedOn") {
        Ok(Some(v)) => Some(v),
        Ok(None) => adm0,
        Err(resp) => return resp,
    };

    if let Err(e) = conn.execute(
        "UPDATE students
         SET last_name = ?, first_name = ?, student_no = ?, birth_date = ?,
             admitted_on = ?, updated_at = ?
         WHERE id = ?",
        (
            &last_name,
            &first_name,
            &student_no,
            &birth_date,
            &admitted_on,
            Utc::now().to_rfc3339(),
            &student_id,
        ),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    audit::record(
        conn,
        audit::AuditEntry {
            actor: &audit::actor_from(&req.params),
            method: "students.update",
            entity_type: "student",
            entity_id: Some(&student_id),
            detail: json!({ "lastName": last_name, "firstName": first_name }),
        },
    );

    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_discharge(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let discharged_on = match validate_iso_date(req, "dischargedOn") {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "bad_params", "missing dischargedOn", None),
        Err(resp) => return resp,
    };

    let updated = match conn.execute(
        "UPDATE students SET discharged_on = ?, active = 0, updated_at = ? WHERE id = ?",
        (&discharged_on, Utc::now().to_rfc3339(), &student_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if updated == 0 {
        return err(&req.id, "not_found", "student not found", None);
    }

    audit::record(
        conn,
        audit::AuditEntry {
            actor: &audit::actor_from(&req.params),
            method: "students.discharge",
            entity_type: "student",
            entity_id: Some(&student_id),
            detail: json!({ "dischargedOn": discharged_on }),
        },
    );

    ok(&req.id, json!({ "ok": true, "dischargedOn": discharged_on }))
}

fn handle_students_reorder(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(ordered) = req.params.get("orderedIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing orderedIds[]", None);
    };
    let ids: Vec<String> = ordered
        .iter()
        .filter_map(|v| v.as_str())
        .map(str::to_string)
        .collect();
    if ids.len() != ordered.len() {
        return err(&req.id, "bad_params", "orderedIds must be strings", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (i, id) in ids.iter().enumerate() {
        let updated = match tx.execute(
            "UPDATE students SET sort_order = ? WHERE id = ?",
            (i as i64, id),
        ) {
            Ok(n) => n,
            Err(e) => {
                let _ = tx.rollback();
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        };
        if updated == 0 {
            let _ = tx.rollback();
            return err(
                &req.id,
                "not_found",
                "student not found",
                Some(json!({ "studentId": id })),
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
            method: "students.reorder",
            entity_type: "student",
            entity_id: None,
            detail: json!({ "count": ids.len() }),
        },
    );

    ok(&req.id, json!({ "ok": true, "reordered": ids.len() }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    // History-bearing rows block deletion; discharge instead.
    let counts: Result<(i64, i64, i64), rusqlite::Error> = conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM scores WHERE student_id = ?1),
           (SELECT COUNT(*) FROM ktea_administrations WHERE student_id = ?1),
           (SELECT COUNT(*) FROM discharge_letters WHERE student_id = ?1)",
        [&student_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    );
    let (score_count, ktea_count, letter_count) = match counts {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if score_count > 0 || ktea_count > 0 || letter_count > 0 {
        return err(
            &req.id,
            "conflict",
            "student has recorded history; discharge instead of deleting",
            Some(json!({
                "scores": score_count,
                "kteaAdministrations": ktea_count,
                "dischargeLetters": letter_count
            })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM enrollments WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    audit::record(
        conn,
        audit::AuditEntry {
            actor: &audit::actor_from(&req.params),
            method: "students.delete",
            entity_type: "student",
            entity_id: Some(&student_id),
            detail: json!({}),
        },
    );

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.discharge" => Some(handle_students_discharge(state, req)),
        "students.reorder" => Some(handle_students_reorder(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
