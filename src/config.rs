use std::collections::BTreeMap;

use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("unrecognized config key: {0}")]
    UnrecognizedKey(String),
}

pub const RECOGNIZED_KEYS: &[&str] = &[
    "execution_mode",
    "model",
    "max_retries",
    "max_agent_turns",
    "features_per_lead_session",
    "auto_merge",
    "safe_mode",
    "openspec_auto_archive",
    "openspec_auto_import",
];

/// Project configuration, stored as a key-value table in the Store (not a
/// project-root file — see the divergence note in SPEC_FULL.md §10.3).
pub struct Config<'a> {
    store: &'a Store,
}

impl<'a> Config<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let key = key.to_string();
        Ok(self.store.read(move |conn| {
            conn.query_row("SELECT value FROM config WHERE key = ?1", [&key], |row| {
                row.get::<_, String>(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::Db(other)),
            })
        })?)
    }

    pub fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        if !RECOGNIZED_KEYS.contains(&key) {
            return Err(ConfigError::UnrecognizedKey(key.to_string()));
        }
        self.store.write(|tx| {
            tx.execute(
                "INSERT INTO config (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                [key, value],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn snapshot(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        Ok(self.store.read(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM config ORDER BY key")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            Ok(rows)
        })?)
    }

    pub fn max_retries(&self) -> Result<u32, ConfigError> {
        Ok(self
            .get("max_retries")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(3))
    }

    pub fn max_agent_turns(&self) -> Result<u32, ConfigError> {
        Ok(self
            .get("max_agent_turns")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(30))
    }

    pub fn auto_merge(&self) -> Result<bool, ConfigError> {
        Ok(self.get("auto_merge")?.as_deref() == Some("true"))
    }

    pub fn safe_mode(&self) -> Result<bool, ConfigError> {
        Ok(self.get("safe_mode")?.as_deref() != Some("false"))
    }

    pub fn openspec_auto_archive(&self) -> Result<bool, ConfigError> {
        Ok(self.get("openspec_auto_archive")?.as_deref() != Some("false"))
    }

    pub fn openspec_auto_import(&self) -> Result<bool, ConfigError> {
        Ok(self.get("openspec_auto_import")?.as_deref() == Some("true"))
    }

    pub fn features_per_lead_session(&self) -> Result<usize, ConfigError> {
        Ok(self
            .get("features_per_lead_session")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(1))
    }

    pub fn model(&self) -> Result<String, ConfigError> {
        Ok(self.get("model")?.unwrap_or_else(|| "default".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn defaults_seeded_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let config = Config::new(&store);
        assert_eq!(config.max_retries().unwrap(), 3);
        assert!(!config.auto_merge().unwrap());
        assert!(config.safe_mode().unwrap());
        assert_eq!(config.features_per_lead_session().unwrap(), 1);
    }

    #[test]
    fn set_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let config = Config::new(&store);
        config.set("max_retries", "5").unwrap();
        assert_eq!(config.max_retries().unwrap(), 5);
    }

    #[test]
    fn set_rejects_unrecognized_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let config = Config::new(&store);
        let result = config.set("bogus_key", "1");
        assert!(matches!(result, Err(ConfigError::UnrecognizedKey(_))));
    }

    #[test]
    fn snapshot_contains_all_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let config = Config::new(&store);
        let snap = config.snapshot().unwrap();
        for key in RECOGNIZED_KEYS {
            assert!(snap.contains_key(*key), "missing default for {key}");
        }
    }
}
