use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("assignd.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            course_name TEXT NOT NULL UNIQUE,
            base_course TEXT NOT NULL,
            term_start_date TEXT NOT NULL,
            lti_version TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            base_course TEXT NOT NULL,
            chapter TEXT,
            subchapter TEXT,
            question_type TEXT NOT NULL,
            autograde TEXT,
            optional INTEGER NOT NULL DEFAULT 0,
            from_source INTEGER NOT NULL DEFAULT 0,
            source TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_name ON questions(name)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_chapter ON questions(base_course, chapter, subchapter)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS competencies(
            question_id TEXT NOT NULL,
            competency TEXT NOT NULL,
            is_primary INTEGER NOT NULL,
            PRIMARY KEY(question_id, competency),
            FOREIGN KEY(question_id) REFERENCES questions(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_competencies_tag ON competencies(competency)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT,
            points INTEGER NOT NULL DEFAULT 0,
            due_date TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'Regular',
            released INTEGER NOT NULL DEFAULT 0,
            enforce_due INTEGER NOT NULL DEFAULT 0,
            visible INTEGER NOT NULL DEFAULT 0,
            from_source INTEGER NOT NULL DEFAULT 0,
            time_limit INTEGER,
            nofeedback INTEGER NOT NULL DEFAULT 0,
            nopause INTEGER NOT NULL DEFAULT 0,
            threshold_pct REAL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            UNIQUE(course_id, name)
        )",
        [],
    )?;
    ensure_assignments_threshold_pct(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_course ON assignments(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignment_questions(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            question_id TEXT NOT NULL,
            points INTEGER NOT NULL DEFAULT 0,
            autograde TEXT,
            which_to_grade TEXT,
            sorting_priority INTEGER NOT NULL,
            reading_assignment INTEGER NOT NULL DEFAULT 0,
            activities_required INTEGER,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id) ON DELETE CASCADE,
            FOREIGN KEY(question_id) REFERENCES questions(id),
            UNIQUE(assignment_id, question_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignment_questions_assignment ON assignment_questions(assignment_id, reading_assignment, sorting_priority)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS lti_keys(
            id TEXT PRIMARY KEY,
            consumer TEXT NOT NULL UNIQUE,
            secret TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_lti_map(
            course_id TEXT NOT NULL,
            lti_id TEXT NOT NULL,
            PRIMARY KEY(course_id, lti_id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(lti_id) REFERENCES lti_keys(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scores(
            assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            score REAL NOT NULL,
            PRIMARY KEY(assignment_id, student_id),
            FOREIGN KEY(assignment_id) REFERENCES assignments(id) ON DELETE CASCADE
        )",
        [],
    )?;

    Ok(())
}

// Workspaces created before thresholds were tracked lack the column.
fn ensure_assignments_threshold_pct(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "assignments", "threshold_pct")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE assignments ADD COLUMN threshold_pct REAL", [])?;
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

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

#[cfg(test)]
pub fn open_memory() -> Connection {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    init_schema(&conn).expect("init schema");
    conn
}
