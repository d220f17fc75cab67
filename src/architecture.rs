use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ArchitectureError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("unrecognized architecture kind: {0}")]
    UnrecognizedKind(String),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub const RECOGNIZED_KINDS: &[&str] = &["principles", "patterns", "standards"];

/// Opaque JSON blobs describing the project's architecture. Agents read
/// these for context; the framework never interprets their contents.
pub struct ArchitectureStore<'a> {
    store: &'a Store,
}

impl<'a> ArchitectureStore<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn import(&self, kind: &str, content: Value) -> Result<(), ArchitectureError> {
        if !RECOGNIZED_KINDS.contains(&kind) {
            return Err(ArchitectureError::UnrecognizedKind(kind.to_string()));
        }
        let kind = kind.to_string();
        let serialized = serde_json::to_string(&content)?;
        self.store.write(|tx| {
            tx.execute(
                "INSERT INTO architecture_blobs (kind, content, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(kind) DO UPDATE SET content = excluded.content, updated_at = excluded.updated_at",
                rusqlite::params![kind, serialized, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn export(&self, kind: &str) -> Result<Option<Value>, ArchitectureError> {
        let kind = kind.to_string();
        let raw: Option<String> = self.store.read(move |conn| {
            conn.query_row(
                "SELECT content FROM architecture_blobs WHERE kind = ?1",
                [&kind],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::Db(other)),
            })
        })?;
        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }

    /// All three recognized kinds, each `null` when never imported. Agents
    /// consume this as the feature's `architecture_compliance` context.
    pub fn snapshot(&self) -> Result<std::collections::BTreeMap<String, Value>, ArchitectureError> {
        let mut out = std::collections::BTreeMap::new();
        for kind in RECOGNIZED_KINDS {
            out.insert(kind.to_string(), self.export(kind)?.unwrap_or(Value::Null));
        }
        Ok(out)
    }

    pub fn last_updated(&self, kind: &str) -> Result<Option<DateTime<Utc>>, ArchitectureError> {
        let kind = kind.to_string();
        let raw: Option<String> = self.store.read(move |conn| {
            conn.query_row(
                "SELECT updated_at FROM architecture_blobs WHERE kind = ?1",
                [&kind],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::Db(other)),
            })
        })?;
        Ok(raw.and_then(|r| r.parse().ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn import_rejects_unrecognized_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let arch = ArchitectureStore::new(&store);
        let result = arch.import("bogus", json!({}));
        assert!(matches!(result, Err(ArchitectureError::UnrecognizedKind(_))));
    }

    #[test]
    fn import_export_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let arch = ArchitectureStore::new(&store);
        arch.import("principles", json!({"layering": "strict"})).unwrap();
        let exported = arch.export("principles").unwrap().unwrap();
        assert_eq!(exported["layering"], "strict");
    }

    #[test]
    fn export_missing_kind_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let arch = ArchitectureStore::new(&store);
        assert!(arch.export("patterns").unwrap().is_none());
    }

    #[test]
    fn snapshot_includes_all_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let arch = ArchitectureStore::new(&store);
        arch.import("standards", json!(["no-unwrap"])).unwrap();
        let snap = arch.snapshot().unwrap();
        assert_eq!(snap.len(), 3);
        assert_eq!(snap["patterns"], Value::Null);
    }
}
