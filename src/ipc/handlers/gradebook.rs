use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_str, required_str};
use crate::ipc::types::{AppState, Request};

fn class_exists(
    conn: &rusqlite::Connection,
    req: &Request,
    class_id: &str,
) -> Result<(), serde_json::Value> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if exists.is_none() {
        return Err(err(&req.id, "not_found", "class not found", None));
    }
    Ok(())
}

fn handle_categories_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, weight, sort_order
         FROM categories WHERE class_id = ? ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&class_id], |row| {
            Ok(json!({
                "categoryId": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "weight": row.get::<_, f64>(2)?,
                "sortOrder": row.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(categories) => ok(&req.id, json!({ "categories": categories })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Replace-set of a class's weighting scheme. Categories are matched by name
/// so surviving ones keep their id and therefore their assignment links;
/// removed categories detach (not delete) their assignments.
fn handle_categories_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = class_exists(conn, req, &class_id) {
        return resp;
    }
    let Some(raw) = req.params.get("categories").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing categories[]", None);
    };

    let mut incoming: Vec<(String, f64)> = Vec::with_capacity(raw.len());
    for (i, item) in raw.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            return err(
                &req.id,
                "bad_params",
                format!("category at index {} must be an object", i),
                None,
            );
        };
        let name = match obj.get("name").and_then(|v| v.as_str()).map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("category at index {} missing name", i),
                    None,
                )
            }
        };
        let weight = obj.get("weight").and_then(|v| v.as_f64()).unwrap_or(0.0);
        if !weight.is_finite() || weight < 0.0 {
            return err(
                &req.id,
                "bad_params",
                "category weight must be >= 0",
                Some(json!({ "name": name, "weight": weight })),
            );
        }
        if incoming.iter().any(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            return err(
                &req.id,
                "bad_params",
                "duplicate category name",
                Some(json!({ "name": name })),
            );
        }
        incoming.push((name, weight));
    }

    let mut existing_stmt = match conn.prepare("SELECT id, name FROM categories WHERE class_id = ?")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let existing: Vec<(String, String)> = match existing_stmt
        .query_map([&class_id], |row| Ok((row.get(0)?, row.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    drop(existing_stmt);

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Drop categories that are no longer named; their assignments survive
    // uncategorized and stay out of final marks until re-linked.
    for (cat_id, name) in &existing {
        if incoming.iter().any(|(n, _)| n.eq_ignore_ascii_case(name)) {
            continue;
        }
        if let Err(e) = tx.execute(
            "UPDATE assignments SET category_id = NULL WHERE category_id = ?",
            [cat_id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
        if let Err(e) = tx.execute("DELETE FROM categories WHERE id = ?", [cat_id]) {
            let _ = tx.rollback();
            return err(&req.id, "db_delete_failed", e.to_string(), None);
        }
    }

    let mut saved = Vec::with_capacity(incoming.len());
    for (i, (name, weight)) in incoming.iter().enumerate() {
        let existing_id = existing
            .iter()
            .find(|(_, n)| n.eq_ignore_ascii_case(name))
            .map(|(id, _)| id.clone());
        let cat_id = match existing_id {
            Some(id) => {
                if let Err(e) = tx.execute(
                    "UPDATE categories SET name = ?, weight = ?, sort_order = ? WHERE id = ?",
                    (name, weight, i as i64, &id),
                ) {
                    let _ = tx.rollback();
                    return err(&req.id, "db_update_failed", e.to_string(), None);
                }
                id
            }
            None => {
                let id = Uuid::new_v4().to_string();
                if let Err(e) = tx.execute(
                    "INSERT INTO categories(id, class_id, name, weight, sort_order)
                     VALUES(?, ?, ?, ?, ?)",
                    (&id, &class_id, name, weight, i as i64),
                ) {
                    let _ = tx.rollback();
                    return err(
                        &req.id,
                        "db_insert_failed",
                        e.to_string(),
                        Some(json!({ "table": "categories" })),
                    );
                }
                id
            }
        };
        saved.push(json!({ "categoryId": cat_id, "name": name, "weight": weight }));
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    audit::record(
        conn,
        audit::AuditEntry {
            actor: &audit::actor_from(&req.params),
            method: "categories.save",
            entity_type: "class",
            entity_id: Some(&class_id),
            detail: json!({ "categoryCount": saved.len() }),
        },
    );

    ok(&req.id, json!({ "categories": saved }))
}

fn handle_assignments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut stmt = match conn.prepare(
        "SELECT a.id, a.idx, a.title, a.date, a.out_of, a.category_id, c.name
         FROM assignments a
         LEFT JOIN categories c ON c.id = a.category_id
         WHERE a.class_id = ?
         ORDER BY a.idx",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&class_id], |row| {
            Ok(json!({
                "assignmentId": row.get::<_, String>(0)?,
                "idx": row.get::<_, i64>(1)?,
                "title": row.get::<_, String>(2)?,
                "date": row.get::<_, Option<String>>(3)?,
                "outOf": row.get::<_, f64>(4)?,
                "categoryId": row.get::<_, Option<String>>(5)?,
                "categoryName": row.get::<_, Option<String>>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(assignments) => ok(&req.id, json!({ "assignments": assignments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn resolve_category_for_class(
    conn: &rusqlite::Connection,
    req: &Request,
    class_id: &str,
    category_id: &str,
) -> Result<(), serde_json::Value> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM categories WHERE id = ? AND class_id = ?",
            (category_id, class_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if found.is_none() {
        return Err(err(
            &req.id,
            "not_found",
            "category not found in this class",
            Some(json!({ "categoryId": category_id })),
        ));
    }
    Ok(())
}

fn handle_assignments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(resp) = class_exists(conn, req, &class_id) {
        return resp;
    }
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let date = opt_str(req, "date");
    let out_of = req.params.get("outOf").and_then(|v| v.as_f64()).unwrap_or(0.0);
    if !out_of.is_finite() || out_of < 0.0 {
        return err(
            &req.id,
            "bad_params",
            "outOf must be >= 0",
            Some(json!({ "outOf": out_of })),
        );
    }
    let category_id = opt_str(req, "categoryId");
    if let Some(cat) = category_id.as_deref() {
        if let Err(resp) = resolve_category_for_class(conn, req, &class_id, cat) {
            return resp;
        }
    }

    let next_idx: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(idx) + 1, 0) FROM assignments WHERE class_id = ?",
        [&class_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let assignment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO assignments(id, class_id, category_id, title, date, out_of, idx)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &assignment_id,
            &class_id,
            &category_id,
            &title,
            &date,
            out_of,
            next_idx,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }

    audit::record(
        conn,
        audit::AuditEntry {
            actor: &audit::actor_from(&req.params),
            method: "assignments.create",
            entity_type: "assignment",
            entity_id: Some(&assignment_id),
            detail: json!({ "classId": class_id, "title": title }),
        },
    );

    ok(
        &req.id,
        json!({ "assignmentId": assignment_id, "idx": next_idx }),
    )
}

fn handle_assignments_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let existing: Option<(String, String, Option<String>, Option<String>, f64)> = match conn
        .query_row(
            "SELECT class_id, title, date, category_id, out_of
             FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((class_id, title0, date0, category0, out_of0)) = existing else {
        return err(&req.id, "not_found", "assignment not found", None);
    };

    let title = opt_str(req, "title").unwrap_or(title0);
    let date = opt_str(req, "date").or(date0);
    let out_of = match req.params.get("outOf") {
        None => out_of0,
        Some(v) => match v.as_f64() {
            Some(n) if n.is_finite() && n >= 0.0 => n,
            _ => {
                return err(
                    &req.id,
                    "bad_params",
                    "outOf must be >= 0",
                    Some(json!({ "outOf": v })),
                )
            }
        },
    };
    // Explicit null detaches; a missing key keeps the current link.
    let category_id = match req.params.get("categoryId") {
        None => category0,
        Some(serde_json::Value::Null) => None,
        Some(v) => match v.as_str().map(str::trim).filter(|s| !s.is_empty()) {
            Some(cat) => {
                if let Err(resp) = resolve_category_for_class(conn, req, &class_id, cat) {
                    return resp;
                }
                Some(cat.to_string())
            }
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "categoryId must be a string or null",
                    None,
                )
            }
        },
    };

    if let Err(e) = conn.execute(
        "UPDATE assignments SET title = ?, date = ?, category_id = ?, out_of = ? WHERE id = ?",
        (&title, &date, &category_id, out_of, &assignment_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    audit::record(
        conn,
        audit::AuditEntry {
            actor: &audit::actor_from(&req.params),
            method: "assignments.update",
            entity_type: "assignment",
            entity_id: Some(&assignment_id),
            detail: json!({ "title": title }),
        },
    );

    ok(&req.id, json!({ "ok": true }))
}

fn handle_assignments_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assignment_id = match required_str(req, "assignmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "assignment not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM scores WHERE assignment_id = ?", [&assignment_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "scores" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM assignments WHERE id = ?", [&assignment_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    audit::record(
        conn,
        audit::AuditEntry {
            actor: &audit::actor_from(&req.params),
            method: "assignments.delete",
            entity_type: "assignment",
            entity_id: Some(&assignment_id),
            detail: json!({}),
        },
    );

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "categories.list" => Some(handle_categories_list(state, req)),
        "categories.save" => Some(handle_categories_save(state, req)),
        "assignments.list" => Some(handle_assignments_list(state, req)),
        "assignments.create" => Some(handle_assignments_create(state, req)),
        "assignments.update" => Some(handle_assignments_update(state, req)),
        "assignments.delete" => Some(handle_assignments_delete(state, req)),
        _ => None,
    }
}
