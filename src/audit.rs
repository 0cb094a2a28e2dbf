use chrono::Utc;
use rusqlite::Connection;
use uuid::Uuid;

/// One audit-trail row. `detail` is stored as compact JSON text.
#[derive(Debug)]
pub struct AuditEntry<'a> {
    pub actor: &'a str,
    pub method: &'a str,
    pub entity_type: &'a str,
    pub entity_id: Option<&'a str>,
    pub detail: serde_json::Value,
}

/// Appends one audit row. Best-effort: the audit trail is an administrative
/// record, so a failed insert is logged and swallowed rather than failing
/// the operation that produced it.
pub fn record(conn: &Connection, entry: AuditEntry<'_>) {
    if let Err(e) = try_record(conn, &entry) {
        tracing::warn!(
            method = entry.method,
            entity_type = entry.entity_type,
            error = %e,
            "audit insert failed"
        );
    }
}

fn try_record(conn: &Connection, entry: &AuditEntry<'_>) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO audit_log(id, at, actor, method, entity_type, entity_id, detail)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            Utc::now().to_rfc3339(),
            entry.actor,
            entry.method,
            entry.entity_type,
            entry.entity_id,
            entry.detail.to_string(),
        ),
    )?;
    Ok(())
}

/// Actor attribution for a mutating request. The UI passes the signed-in
/// staff member as `params.actor`; anything else is recorded as "system".
pub fn actor_from(params: &serde_json::Value) -> String {
    params
        .get("actor")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("system")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_defaults_to_system() {
        assert_eq!(actor_from(&serde_json::json!({})), "system");
        assert_eq!(actor_from(&serde_json::json!({ "actor": "  " })), "system");
        assert_eq!(
            actor_from(&serde_json::json!({ "actor": "jmorales" })),
            "jmorales"
        );
    }
}
