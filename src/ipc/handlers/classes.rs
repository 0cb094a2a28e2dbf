use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_str, required_str};
use crate::ipc::types::{AppState, Request};

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "classes": [] }));
    };

    // Correlated subqueries keep the counts join-free.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.subject,
           c.instructor,
           (SELECT COUNT(*) FROM enrollments e WHERE e.class_id = c.id) AS enrolled_count,
           (SELECT COUNT(*) FROM assignments a WHERE a.class_id = c.id) AS assignment_count
         FROM classes c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "classId": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "subject": row.get::<_, Option<String>>(2)?,
                "instructor": row.get::<_, Option<String>>(3)?,
                "enrolledCount": row.get::<_, i64>(4)?,
                "assignmentCount": row.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let subject = opt_str(req, "subject");
    let instructor = opt_str(req, "instructor");

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, subject, instructor) VALUES(?, ?, ?, ?)",
        (&class_id, &name, &subject, &instructor),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    audit::record(
        conn,
        audit::AuditEntry {
            actor: &audit::actor_from(&req.params),
            method: "classes.create",
            entity_type: "class",
            entity_id: Some(&class_id),
            detail: json!({ "name": name }),
        },
    );

    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let existing: Option<(String, Option<String>, Option<String>)> = match conn
        .query_row(
            "SELECT name, subject, instructor FROM classes WHERE id = ?",
            [&class_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((name0, subject0, instructor0)) = existing else {
        return err(&req.id, "not_found", "class not found", None);
    };

    let name = opt_str(req, "name").unwrap_or(name0);
    let subject = opt_str(req, "subject").or(subject0);
    let instructor = opt_str(req, "instructor").or(instructor0);

    if let Err(e) = conn.execute(
        "UPDATE classes SET name = ?, subject = ?, instructor = ? WHERE id = ?",
        (&name, &subject, &instructor, &class_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    audit::record(
        conn,
        audit::AuditEntry {
            actor: &audit::actor_from(&req.params),
            method: "classes.update",
            entity_type: "class",
            entity_id: Some(&class_id),
            detail: json!({ "name": name }),
        },
    );

    ok(&req.id, json!({ "ok": true }))
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicit dependency order; no ON DELETE CASCADE in the schema.
    if let Err(e) = tx.execute(
        "DELETE FROM scores
         WHERE assignment_id IN (SELECT id FROM assignments WHERE class_id = ?)",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "scores" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM assignments WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM categories WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "categories" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM enrollments WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM classes WHERE id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    audit::record(
        conn,
        audit::AuditEntry {
            actor: &audit::actor_from(&req.params),
            method: "classes.delete",
            entity_type: "class",
            entity_id: Some(&class_id),
            detail: json!({}),
        },
    );

    ok(&req.id, json!({ "ok": true }))
}

fn handle_enrollment_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.last_name, s.first_name, s.active, e.sort_order
         FROM enrollments e
         JOIN students s ON s.id = e.student_id
         WHERE e.class_id = ?
         ORDER BY e.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&class_id], |row| {
            let last: String = row.get(1)?;
            let first: String = row.get(2)?;
            Ok(json!({
                "studentId": row.get::<_, String>(0)?,
                "displayName": format!("{}, {}", last, first),
                "active": row.get::<_, i64>(3)? != 0,
                "sortOrder": row.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_enrollment_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(raw_ids) = req.params.get("studentIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing studentIds[]", None);
    };
    let student_ids: Vec<String> = raw_ids
        .iter()
        .filter_map(|v| v.as_str())
        .map(str::to_string)
        .collect();
    if student_ids.len() != raw_ids.len() {
        return err(&req.id, "bad_params", "studentIds must be strings", None);
    }

    let class_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if class_exists.is_none() {
        return err(&req.id, "not_found", "class not found", None);
    }

    for sid in &student_ids {
        let exists: Option<i64> = match conn
            .query_row("SELECT 1 FROM students WHERE id = ?", [sid], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if exists.is_none() {
            return err(
                &req.id,
                "not_found",
                "student not found",
                Some(json!({ "studentId": sid })),
            );
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    // Replace-set membership. Scores are keyed by (assignment, student), so a
    // re-added student keeps graded history.
    if let Err(e) = tx.execute("DELETE FROM enrollments WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    for (i, sid) in student_ids.iter().enumerate() {
        if let Err(e) = tx.execute(
            "INSERT INTO enrollments(class_id, student_id, sort_order, active)
             VALUES(?, ?, ?, 1)",
            (&class_id, sid, i as i64),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "enrollments" })),
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
            method: "enrollment.set",
            entity_type: "class",
            entity_id: Some(&class_id),
            detail: json!({ "studentCount": student_ids.len() }),
        },
    );

    ok(&req.id, json!({ "ok": true, "enrolled": student_ids.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        "enrollment.list" => Some(handle_enrollment_list(state, req)),
        "enrollment.set" => Some(handle_enrollment_set(state, req)),
        _ => None,
    }
}
