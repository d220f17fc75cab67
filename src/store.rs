use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create runtime directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

/// Durable, process-local, transactional state for features, config, sessions
/// and architecture blobs. Backed by a single SQLite file in WAL mode: one
/// writer connection behind a mutex, short-lived read-only connections for
/// concurrent snapshots.
pub struct Store {
    path: PathBuf,
    writer: Mutex<Connection>,
}

impl Store {
    /// Open (creating if absent) the store under `<root>/.pipewright/pipewright.db`.
    /// Idempotent: safe to call on every process start.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let dir = root.join(".pipewright");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("pipewright.db");

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&conn)?;

        Ok(Self {
            path,
            writer: Mutex::new(conn),
        })
    }

    /// Run `f` against the single writer connection under an exclusive
    /// transaction, committing on success and rolling back on error.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.writer.lock().expect("store writer mutex poisoned");
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Open a fresh read-only connection for a non-blocking snapshot read.
    /// Never contends with the writer mutex; callers should treat a failure
    /// here as "try again next tick", not as fatal.
    pub fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = Connection::open(&self.path)?;
        f(&conn)
    }
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS schema_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS features (
            id TEXT PRIMARY KEY,
            category TEXT NOT NULL DEFAULT '',
            description TEXT NOT NULL,
            notes TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'pending',
            depends_on TEXT NOT NULL DEFAULT '[]',
            requirements TEXT NOT NULL DEFAULT '[]',
            architecture_compliance TEXT NOT NULL DEFAULT '[]',
            verification_steps TEXT NOT NULL DEFAULT '[]',
            assigned_to TEXT NOT NULL DEFAULT '',
            reviewed_by TEXT NOT NULL DEFAULT '',
            tested_by TEXT NOT NULL DEFAULT '',
            passes INTEGER NOT NULL DEFAULT 0,
            openspec_change_id TEXT NOT NULL DEFAULT '',
            openspec_task_group INTEGER NOT NULL DEFAULT 0,
            openspec_reference TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_features_openspec_key
            ON features (openspec_change_id, openspec_task_group)
            WHERE openspec_change_id != '';

        CREATE TABLE IF NOT EXISTS config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pipeline_sessions (
            session_number INTEGER NOT NULL,
            agent_role TEXT NOT NULL,
            feature_id TEXT NOT NULL,
            outcome TEXT NOT NULL,
            notes TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS architecture_blobs (
            kind TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        ",
    )?;

    let current: Option<i64> = conn
        .query_row(
            "SELECT value FROM schema_meta WHERE key = 'schema_version'",
            [],
            |row| row.get::<_, String>(0),
        )
        .ok()
        .and_then(|v| v.parse().ok());

    if current.is_none() {
        conn.execute(
            "INSERT INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
            [SCHEMA_VERSION.to_string()],
        )?;
        seed_default_config(conn)?;
    }

    Ok(())
}

fn seed_default_config(conn: &Connection) -> Result<(), StoreError> {
    let defaults: &[(&str, &str)] = &[
        ("execution_mode", "orchestrator"),
        ("model", "default"),
        ("max_retries", "3"),
        ("max_agent_turns", "30"),
        ("features_per_lead_session", "1"),
        ("auto_merge", "false"),
        ("safe_mode", "true"),
        ("openspec_auto_archive", "true"),
        ("openspec_auto_import", "false"),
    ];
    for (key, value) in defaults {
        conn.execute(
            "INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)",
            [key, value],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        drop(store);
        let store2 = Store::open(dir.path()).unwrap();
        let seeded: String = store2
            .read(|conn| {
                conn.query_row(
                    "SELECT value FROM config WHERE key = 'max_retries'",
                    [],
                    |row| row.get(0),
                )
                .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(seeded, "3");
    }

    #[test]
    fn db_file_created_under_runtime_dir() {
        let dir = tempfile::tempdir().unwrap();
        Store::open(dir.path()).unwrap();
        assert!(dir.path().join(".pipewright/pipewright.db").exists());
    }

    #[test]
    fn write_rolls_back_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let result: Result<(), StoreError> = store.write(|tx| {
            tx.execute(
                "INSERT INTO config (key, value) VALUES ('scratch', '1')",
                [],
            )?;
            Err(StoreError::Db(rusqlite::Error::QueryReturnedNoRows))
        });
        assert!(result.is_err());
        let found: i64 = store
            .read(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM config WHERE key = 'scratch'",
                    [],
                    |row| row.get(0),
                )
                .map_err(StoreError::from)
            })
            .unwrap();
        assert_eq!(found, 0);
    }
}
