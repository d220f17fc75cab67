use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SessionOutcome {
    Approved,
    Rejected,
    Passed,
    Failed,
    Merged,
    SpawnFailed,
    Stalled,
}

impl SessionOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Approved => "approved",
            SessionOutcome::Rejected => "rejected",
            SessionOutcome::Passed => "passed",
            SessionOutcome::Failed => "failed",
            SessionOutcome::Merged => "merged",
            SessionOutcome::SpawnFailed => "spawn-failed",
            SessionOutcome::Stalled => "stalled",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "approved" => SessionOutcome::Approved,
            "rejected" => SessionOutcome::Rejected,
            "passed" => SessionOutcome::Passed,
            "failed" => SessionOutcome::Failed,
            "merged" => SessionOutcome::Merged,
            "spawn-failed" => SessionOutcome::SpawnFailed,
            _ => SessionOutcome::Stalled,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_number: i64,
    pub agent_role: String,
    pub feature_id: String,
    pub outcome: SessionOutcome,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

/// Append-only log of every agent run the Autoplay Controller executed,
/// keyed by feature id. Never mutated after insert.
pub struct SessionLog<'a> {
    store: &'a Store,
}

impl<'a> SessionLog<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn append(
        &self,
        agent_role: &str,
        feature_id: &str,
        outcome: SessionOutcome,
        notes: &str,
    ) -> Result<(), SessionError> {
        let agent_role = agent_role.to_string();
        let feature_id = feature_id.to_string();
        let notes = notes.to_string();
        self.store.write(|tx| {
            let next: i64 = tx
                .query_row("SELECT COALESCE(MAX(session_number), 0) + 1 FROM pipeline_sessions", [], |row| {
                    row.get(0)
                })?;
            tx.execute(
                "INSERT INTO pipeline_sessions
                    (session_number, agent_role, feature_id, outcome, notes, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    next,
                    agent_role,
                    feature_id,
                    outcome.as_str(),
                    notes,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// All recorded sessions for one feature, oldest first.
    pub fn history(&self, feature_id: &str) -> Result<Vec<SessionRecord>, SessionError> {
        let feature_id = feature_id.to_string();
        Ok(self.store.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_number, agent_role, feature_id, outcome, notes, created_at
                 FROM pipeline_sessions WHERE feature_id = ?1 ORDER BY session_number ASC",
            )?;
            let rows = stmt
                .query_map([&feature_id], |row| {
                    let outcome: String = row.get(3)?;
                    let created_at: String = row.get(5)?;
                    Ok(SessionRecord {
                        session_number: row.get(0)?,
                        agent_role: row.get(1)?,
                        feature_id: row.get(2)?,
                        outcome: SessionOutcome::from_str(&outcome),
                        notes: row.get(4)?,
                        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_history_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let log = SessionLog::new(&store);
        log.append("dev", "FEAT-001", SessionOutcome::Failed, "stalled on compile error")
            .unwrap();
        log.append("dev", "FEAT-001", SessionOutcome::Passed, "")
            .unwrap();
        let history = log.history("FEAT-001").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].session_number, 1);
        assert_eq!(history[1].outcome, SessionOutcome::Passed);
    }

    #[test]
    fn history_is_empty_for_unknown_feature() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let log = SessionLog::new(&store);
        assert!(log.history("FEAT-999").unwrap().is_empty());
    }

    #[test]
    fn session_numbers_are_global_and_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let log = SessionLog::new(&store);
        log.append("dev", "FEAT-001", SessionOutcome::Passed, "").unwrap();
        log.append("review", "FEAT-002", SessionOutcome::Approved, "").unwrap();
        let h2 = log.history("FEAT-002").unwrap();
        assert_eq!(h2[0].session_number, 2);
    }
}
