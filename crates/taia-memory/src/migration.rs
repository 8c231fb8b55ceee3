//! SQLite schema creation and migration.
//!
//! Creates all tables needed by the record store on first boot.

use rusqlite::Connection;

/// Current schema version.
const SCHEMA_VERSION: u32 = 2;

/// Run all migrations to bring the database up to date.
pub fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Get the current schema version from the database.
fn get_schema_version(conn: &Connection) -> u32 {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0)
}

/// Check if a column exists in a table (SQLite has no ADD COLUMN IF NOT EXISTS).
fn column_exists(conn: &Connection, table: &str, column: &str) -> bool {
    let sql = format!("PRAGMA table_info({})", table);
    let Ok(mut stmt) = conn.prepare(&sql) else {
        return false;
    };
    let Ok(rows) = stmt.query_map([], |row| row.get::<_, String>(1)) else {
        return false;
    };
    let names: Vec<String> = rows.filter_map(|r| r.ok()).collect();
    names.iter().any(|n| n == column)
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "user_version", version)
}

/// Version 1: registry, task queue, archive, responses, approvals.
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        -- Agent identities
        CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            token TEXT NOT NULL,
            record TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Skill catalogue
        CREATE TABLE IF NOT EXISTS skills (
            id TEXT PRIMARY KEY,
            record TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        -- Permission grants (agent, skill) -> state
        CREATE TABLE IF NOT EXISTS skill_grants (
            agent_id TEXT NOT NULL,
            skill_id TEXT NOT NULL,
            state TEXT NOT NULL,
            critical INTEGER NOT NULL DEFAULT 0,
            granted_at TEXT NOT NULL,
            revoked_at TEXT,
            PRIMARY KEY (agent_id, skill_id)
        );

        -- Active task queue (non-terminal tasks)
        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            target TEXT NOT NULL,
            status TEXT NOT NULL,
            created_us INTEGER NOT NULL,
            record TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_target_status ON tasks(target, status, created_us);

        -- Settled tasks, moved here from the queue
        CREATE TABLE IF NOT EXISTS task_archive (
            id TEXT PRIMARY KEY,
            target TEXT NOT NULL,
            status TEXT NOT NULL,
            created_us INTEGER NOT NULL,
            archived_at TEXT NOT NULL,
            record TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_archive_status ON task_archive(status);

        -- One response per task
        CREATE TABLE IF NOT EXISTS responses (
            request_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            record TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- Review task -> original task
        CREATE TABLE IF NOT EXISTS review_links (
            qa_request_id TEXT PRIMARY KEY,
            original_request_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        -- Human decisions
        CREATE TABLE IF NOT EXISTS approvals (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            created_us INTEGER NOT NULL,
            record TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_approvals_status ON approvals(status);

        -- Migration tracking
        CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL,
            description TEXT
        );

        INSERT OR IGNORE INTO migrations (version, applied_at, description)
        VALUES (1, datetime('now'), 'Initial federation schema');
        ",
    )?;
    Ok(())
}

/// Version 2: batch bookkeeping and the parent correlation column on tasks.
fn migrate_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS batches (
            id TEXT PRIMARY KEY,
            parent TEXT NOT NULL,
            created_at TEXT NOT NULL,
            record TEXT NOT NULL
        );
        ",
    )?;
    if !column_exists(conn, "tasks", "parent") {
        conn.execute("ALTER TABLE tasks ADD COLUMN parent TEXT", [])?;
    }
    conn.execute(
        "INSERT OR IGNORE INTO migrations (version, applied_at, description) VALUES (2, datetime('now'), 'Add batches and task parent column')",
        [],
    )?;
    Ok(())
}
