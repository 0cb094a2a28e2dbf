use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE: &str = "rosterd.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            student_no TEXT,
            birth_date TEXT,
            admitted_on TEXT,
            discharged_on TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    // Workspaces created before discharge tracking lack these two columns.
    ensure_students_discharge_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_sort ON students(sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            subject TEXT,
            instructor TEXT
        )",
        [],
    )?;
    ensure_classes_instructor(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            class_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY(class_id, student_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_class ON enrollments(class_id, sort_order)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS categories(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            weight REAL NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(class_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_categories_class ON categories(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            category_id TEXT,
            title TEXT NOT NULL,
            date TEXT,
            out_of REAL NOT NULL DEFAULT 0,
            idx INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(category_id) REFERENCES categories(id),
            UNIQUE(class_id, idx)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_class ON assignments(class_id, idx)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_category ON assignments(category_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scores(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            points REAL,
            updated_at TEXT,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(assignment_id, student_id)
        )",
        [],
    )?;
    ensure_scores_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_assignment ON scores(assignment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_student ON scores(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ktea_administrations(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            administered_on TEXT NOT NULL,
            form TEXT,
            examiner TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ktea_admin_student
         ON ktea_administrations(student_id, administered_on)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS ktea_subtest_scores(
            id TEXT PRIMARY KEY,
            administration_id TEXT NOT NULL,
            subtest_code TEXT NOT NULL,
            raw_score REAL,
            standard_score REAL,
            grade_equivalent TEXT,
            percentile REAL,
            FOREIGN KEY(administration_id) REFERENCES ktea_administrations(id),
            UNIQUE(administration_id, subtest_code)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_ktea_scores_admin
         ON ktea_subtest_scores(administration_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_log(
            id TEXT PRIMARY KEY,
            at TEXT NOT NULL,
            actor TEXT NOT NULL,
            method TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT,
            detail TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_log_at ON audit_log(at)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_audit_log_entity ON audit_log(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS discharge_letters(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            generated_at TEXT NOT NULL,
            body TEXT NOT NULL,
            output_path TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_discharge_letters_student
         ON discharge_letters(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

fn ensure_students_discharge_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "students", "admitted_on")? {
        conn.execute("ALTER TABLE students ADD COLUMN admitted_on TEXT", [])?;
    }
    if !table_has_column(conn, "students", "discharged_on")? {
        conn.execute("ALTER TABLE students ADD COLUMN discharged_on TEXT", [])?;
    }
    Ok(())
}

fn ensure_classes_instructor(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "classes", "instructor")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE classes ADD COLUMN instructor TEXT", [])?;
    Ok(())
}

fn ensure_scores_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "scores", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE scores ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_workspace(prefix: &str) -> std::path::PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn open_db_is_idempotent() {
        let ws = temp_workspace("rosterd-db-idem");
        let first = open_db(&ws).expect("first open");
        drop(first);
        let second = open_db(&ws).expect("second open");
        let n: i64 = second
            .query_row("SELECT COUNT(*) FROM students", [], |r| r.get(0))
            .expect("count");
        assert_eq!(n, 0);
    }

    #[test]
    fn settings_roundtrip() {
        let ws = temp_workspace("rosterd-db-settings");
        let conn = open_db(&ws).expect("open");
        let value = serde_json::json!({ "schoolName": "Hillside Academy" });
        settings_set_json(&conn, "letterhead", &value).expect("set");
        let got = settings_get_json(&conn, "letterhead").expect("get");
        assert_eq!(got, Some(value));
        assert_eq!(settings_get_json(&conn, "missing").expect("get"), None);
    }

    #[test]
    fn migration_adds_discharge_columns() {
        let ws = temp_workspace("rosterd-db-migrate");
        // Seed a pre-discharge-tracking schema by hand.
        let conn = Connection::open(ws.join(DB_FILE)).expect("open raw");
        conn.execute(
            "CREATE TABLE students(
                id TEXT PRIMARY KEY,
                last_name TEXT NOT NULL,
                first_name TEXT NOT NULL,
                student_no TEXT,
                birth_date TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                sort_order INTEGER NOT NULL,
                updated_at TEXT
            )",
            [],
        )
        .expect("create old schema");
        conn.execute(
            "INSERT INTO students(id, last_name, first_name, sort_order)
             VALUES('s1', 'Rivera', 'Dana', 0)",
            [],
        )
        .expect("seed");
        drop(conn);

        let conn = open_db(&ws).expect("reopen with migrations");
        let discharged: Option<String> = conn
            .query_row(
                "SELECT discharged_on FROM students WHERE id = 's1'",
                [],
                |r| r.get(0),
            )
            .expect("migrated column");
        assert_eq!(discharged, None);
    }
}
