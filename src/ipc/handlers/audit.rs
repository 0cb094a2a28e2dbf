use rusqlite::types::Value;
use rusqlite::params_from_iter;
use serde_json::json;

use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, opt_i64, opt_str};
use crate::ipc::types::{AppState, Request};

const AUDIT_LIST_MAX_LIMIT: i64 = 1000;
const AUDIT_LIST_DEFAULT_LIMIT: i64 = 100;

fn handle_audit_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let entity_type = opt_str(req, "entityType");
    let entity_id = opt_str(req, "entityId");
    let since = opt_str(req, "since");
    let limit = opt_i64(req, "limit").unwrap_or(AUDIT_LIST_DEFAULT_LIMIT);
    if limit <= 0 || limit > AUDIT_LIST_MAX_LIMIT {
        return err(
            &req.id,
            "bad_params",
            format!("limit must be between 1 and {}", AUDIT_LIST_MAX_LIMIT),
            Some(json!({ "limit": limit })),
        );
    }

    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(t) = &entity_type {
        clauses.push("entity_type = ?");
        binds.push(Value::Text(t.clone()));
    }
    if let Some(i) = &entity_id {
        clauses.push("entity_id = ?");
        binds.push(Value::Text(i.clone()));
    }
    if let Some(s) = &since {
        // RFC 3339 timestamps compare correctly as text.
        clauses.push("at >= ?");
        binds.push(Value::Text(s.clone()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    binds.push(Value::Integer(limit));

    let sql = format!(
        "SELECT id, at, actor, method, entity_type, entity_id, detail
         FROM audit_log {} ORDER BY at DESC, id LIMIT ?",
        where_sql
    );

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(binds), |row| {
            let detail_raw: Option<String> = row.get(6)?;
            let detail = detail_raw
                .and_then(|t| serde_json::from_str::<serde_json::Value>(&t).ok())
                .unwrap_or(serde_json::Value::Null);
            Ok(json!({
                "auditId": row.get::<_, String>(0)?,
                "at": row.get::<_, String>(1)?,
                "actor": row.get::<_, String>(2)?,
                "method": row.get::<_, String>(3)?,
                "entityType": row.get::<_, String>(4)?,
                "entityId": row.get::<_, Option<String>>(5)?,
                "detail": detail,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(entries) => ok(&req.id, json!({ "entries": entries })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "audit.list" => Some(handle_audit_list(state, req)),
        _ => None,
    }
}
