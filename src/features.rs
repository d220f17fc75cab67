use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureStatus {
    Pending,
    InDev,
    ReadyForReview,
    Approved,
    NeedsRevision,
    QaTesting,
    PrOpen,
    Complete,
}

impl FeatureStatus {
    fn as_str(&self) -> &'static str {
        match self {
            FeatureStatus::Pending => "pending",
            FeatureStatus::InDev => "in-dev",
            FeatureStatus::ReadyForReview => "ready-for-review",
            FeatureStatus::Approved => "approved",
            FeatureStatus::NeedsRevision => "needs-revision",
            FeatureStatus::QaTesting => "qa-testing",
            FeatureStatus::PrOpen => "pr-open",
            FeatureStatus::Complete => "complete",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "in-dev" => FeatureStatus::InDev,
            "ready-for-review" => FeatureStatus::ReadyForReview,
            "approved" => FeatureStatus::Approved,
            "needs-revision" => FeatureStatus::NeedsRevision,
            "qa-testing" => FeatureStatus::QaTesting,
            "pr-open" => FeatureStatus::PrOpen,
            "complete" => FeatureStatus::Complete,
            _ => FeatureStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    pub id: String,
    #[serde(default)]
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub notes: String,
    pub status: FeatureStatus,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub architecture_compliance: Vec<String>,
    #[serde(default)]
    pub verification_steps: Vec<String>,
    #[serde(default)]
    pub assigned_to: String,
    #[serde(default)]
    pub reviewed_by: String,
    #[serde(default)]
    pub tested_by: String,
    #[serde(default)]
    pub passes: bool,
    #[serde(default)]
    pub openspec_change_id: String,
    #[serde(default)]
    pub openspec_task_group: i64,
    #[serde(default)]
    pub openspec_reference: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields a caller may set through `update`; everything else (id, timestamps,
/// openspec key) is immutable or system-managed.
#[derive(Debug, Default, Clone)]
pub struct FeatureUpdate {
    pub category: Option<String>,
    pub description: Option<String>,
    pub notes: Option<String>,
    pub status: Option<FeatureStatus>,
    pub depends_on: Option<Vec<String>>,
    pub requirements: Option<Vec<String>>,
    pub architecture_compliance: Option<Vec<String>>,
    pub verification_steps: Option<Vec<String>>,
    pub assigned_to: Option<String>,
    pub reviewed_by: Option<String>,
    pub tested_by: Option<String>,
    pub passes: Option<bool>,
    pub openspec_reference: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct FeatureFilter {
    pub status: Option<FeatureStatus>,
    pub assigned_to: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FeatureError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("feature not found: {0}")]
    NotFound(String),
    #[error("Circular dependency: {0}")]
    Cycle(String),
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

pub struct FeatureModel<'a> {
    store: &'a Store,
}

impl<'a> FeatureModel<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Allocate the next strictly monotonic `FEAT-NNN` id.
    pub fn next_id(&self) -> Result<String, FeatureError> {
        let max: Option<String> = self.store.read(|conn| {
            let result: rusqlite::Result<String> = conn.query_row(
                "SELECT id FROM features ORDER BY id DESC LIMIT 1",
                [],
                |row| row.get(0),
            );
            match result {
                Ok(id) => Ok(Some(id)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(StoreError::Db(e)),
            }
        })?;

        let next_n = match max {
            Some(id) => {
                let n: u32 = id.trim_start_matches("FEAT-").parse().unwrap_or(0);
                n + 1
            }
            None => 1,
        };
        Ok(format!("FEAT-{next_n:03}"))
    }

    pub fn create(
        &self,
        description: String,
        category: String,
        depends_on: Vec<String>,
        requirements: Vec<String>,
        architecture_compliance: Vec<String>,
        verification_steps: Vec<String>,
        openspec_change_id: String,
        openspec_task_group: i64,
        openspec_reference: String,
    ) -> Result<Feature, FeatureError> {
        let id = self.next_id()?;
        let ts = now();
        let feature = Feature {
            id: id.clone(),
            category,
            description,
            notes: String::new(),
            status: FeatureStatus::Pending,
            depends_on,
            requirements,
            architecture_compliance,
            verification_steps,
            assigned_to: String::new(),
            reviewed_by: String::new(),
            tested_by: String::new(),
            passes: false,
            openspec_change_id,
            openspec_task_group,
            openspec_reference,
            created_at: ts,
            updated_at: ts,
        };
        self.insert(&feature)?;
        Ok(feature)
    }

    /// Insert a fully-formed `Feature` as-is, preserving its id. Used by the
    /// export/import round trip, where ids must survive unchanged. Errors if
    /// the id already exists.
    pub fn restore(&self, feature: &Feature) -> Result<(), FeatureError> {
        self.insert(feature)
    }

    fn insert(&self, f: &Feature) -> Result<(), FeatureError> {
        self.store.write(|tx| {
            tx.execute(
                "INSERT INTO features (
                    id, category, description, notes, status, depends_on, requirements,
                    architecture_compliance, verification_steps, assigned_to, reviewed_by,
                    tested_by, passes, openspec_change_id, openspec_task_group,
                    openspec_reference, created_at, updated_at
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
                rusqlite::params![
                    f.id,
                    f.category,
                    f.description,
                    f.notes,
                    f.status.as_str(),
                    serde_json::to_string(&f.depends_on).unwrap(),
                    serde_json::to_string(&f.requirements).unwrap(),
                    serde_json::to_string(&f.architecture_compliance).unwrap(),
                    serde_json::to_string(&f.verification_steps).unwrap(),
                    f.assigned_to,
                    f.reviewed_by,
                    f.tested_by,
                    f.passes as i64,
                    f.openspec_change_id,
                    f.openspec_task_group,
                    f.openspec_reference,
                    f.created_at.to_rfc3339(),
                    f.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Feature, FeatureError> {
        let id = id.to_string();
        self.store
            .read(|conn| row_to_feature(conn, &id))?
            .ok_or_else(|| FeatureError::NotFound(id))
            .map_err(|e| e)
    }

    pub fn find_by_openspec_key(
        &self,
        change_id: &str,
        task_group: i64,
    ) -> Result<Option<Feature>, FeatureError> {
        let change_id = change_id.to_string();
        Ok(self.store.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM features WHERE openspec_change_id = ?1 AND openspec_task_group = ?2",
            )?;
            let id: Option<String> = stmt
                .query_row(rusqlite::params![change_id, task_group], |row| row.get(0))
                .ok();
            match id {
                Some(id) => row_to_feature(conn, &id),
                None => Ok(None),
            }
        })?)
    }

    pub fn list(&self, filter: &FeatureFilter) -> Result<Vec<Feature>, FeatureError> {
        let filter = filter.clone();
        Ok(self.store.read(move |conn| {
            let mut stmt = conn.prepare("SELECT id FROM features ORDER BY id ASC")?;
            let ids: Vec<String> = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?;
            let mut out = Vec::new();
            for id in ids {
                if let Some(f) = row_to_feature(conn, &id)? {
                    if let Some(ref status) = filter.status {
                        if f.status != *status {
                            continue;
                        }
                    }
                    if let Some(ref assigned) = filter.assigned_to {
                        if &f.assigned_to != assigned {
                            continue;
                        }
                    }
                    out.push(f);
                }
            }
            Ok(out)
        })?)
    }

    pub fn update(&self, id: &str, update: FeatureUpdate) -> Result<Feature, FeatureError> {
        let mut feature = self.get(id)?;

        if let Some(v) = update.category {
            feature.category = v;
        }
        if let Some(v) = update.description {
            feature.description = v;
        }
        if let Some(v) = update.notes {
            feature.notes = v;
        }
        if let Some(v) = update.status {
            feature.status = v;
        }
        if let Some(v) = update.depends_on {
            feature.depends_on = v;
        }
        if let Some(v) = update.requirements {
            feature.requirements = v;
        }
        if let Some(v) = update.architecture_compliance {
            feature.architecture_compliance = v;
        }
        if let Some(v) = update.verification_steps {
            feature.verification_steps = v;
        }
        if let Some(v) = update.assigned_to {
            feature.assigned_to = v;
        }
        if let Some(v) = update.reviewed_by {
            feature.reviewed_by = v;
        }
        if let Some(v) = update.tested_by {
            feature.tested_by = v;
        }
        if let Some(v) = update.passes {
            feature.passes = v;
        }
        if let Some(v) = update.openspec_reference {
            feature.openspec_reference = v;
        }
        feature.updated_at = now();

        self.store.write(|tx| {
            tx.execute(
                "UPDATE features SET category=?2, description=?3, notes=?4, status=?5,
                    depends_on=?6, requirements=?7, architecture_compliance=?8,
                    verification_steps=?9, assigned_to=?10, reviewed_by=?11, tested_by=?12,
                    passes=?13, openspec_reference=?14, updated_at=?15
                 WHERE id=?1",
                rusqlite::params![
                    feature.id,
                    feature.category,
                    feature.description,
                    feature.notes,
                    feature.status.as_str(),
                    serde_json::to_string(&feature.depends_on).unwrap(),
                    serde_json::to_string(&feature.requirements).unwrap(),
                    serde_json::to_string(&feature.architecture_compliance).unwrap(),
                    serde_json::to_string(&feature.verification_steps).unwrap(),
                    feature.assigned_to,
                    feature.reviewed_by,
                    feature.tested_by,
                    feature.passes as i64,
                    feature.openspec_reference,
                    feature.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;
        Ok(feature)
    }

    pub fn remove(&self, id: &str) -> Result<(), FeatureError> {
        let id = id.to_string();
        let changed = self
            .store
            .write(|tx| Ok(tx.execute("DELETE FROM features WHERE id = ?1", [&id])?))?;
        if changed == 0 {
            return Err(FeatureError::NotFound(id));
        }
        Ok(())
    }

    /// True iff every dependency exists and is `complete`. Missing
    /// dependencies count as unmet (never silently ignored).
    pub fn deps_are_met(&self, feature: &Feature) -> Result<bool, FeatureError> {
        for dep in &feature.depends_on {
            match self.get(dep) {
                Ok(d) if d.status == FeatureStatus::Complete => continue,
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Depth-first topological order over all features' `depends_on` edges.
    /// Raises on the first cycle found, naming the offending id.
    pub fn resolve_order(&self) -> Result<Vec<Feature>, FeatureError> {
        let all = self.list(&FeatureFilter::default())?;
        let by_id: std::collections::HashMap<&str, &Feature> =
            all.iter().map(|f| (f.id.as_str(), f)).collect();

        let mut order: Vec<String> = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut visiting: HashSet<&str> = HashSet::new();

        fn visit<'b>(
            id: &'b str,
            by_id: &std::collections::HashMap<&'b str, &'b Feature>,
            visited: &mut HashSet<&'b str>,
            visiting: &mut HashSet<&'b str>,
            order: &mut Vec<String>,
        ) -> Result<(), FeatureError> {
            if visited.contains(id) {
                return Ok(());
            }
            if visiting.contains(id) {
                return Err(FeatureError::Cycle(id.to_string()));
            }
            visiting.insert(id);
            if let Some(f) = by_id.get(id) {
                for dep in &f.depends_on {
                    visit(dep.as_str(), by_id, visited, visiting, order)?;
                }
            }
            visiting.remove(id);
            visited.insert(id);
            order.push(id.to_string());
            Ok(())
        }

        for f in &all {
            visit(f.id.as_str(), &by_id, &mut visited, &mut visiting, &mut order)?;
        }

        Ok(order
            .into_iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|f| (*f).clone()))
            .collect())
    }
}

fn row_to_feature(conn: &rusqlite::Connection, id: &str) -> Result<Option<Feature>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, category, description, notes, status, depends_on, requirements,
                architecture_compliance, verification_steps, assigned_to, reviewed_by,
                tested_by, passes, openspec_change_id, openspec_task_group,
                openspec_reference, created_at, updated_at
         FROM features WHERE id = ?1",
    )?;
    let result = stmt.query_row([id], |row| {
        let status: String = row.get(4)?;
        let depends_on: String = row.get(5)?;
        let requirements: String = row.get(6)?;
        let architecture_compliance: String = row.get(7)?;
        let verification_steps: String = row.get(8)?;
        let passes: i64 = row.get(12)?;
        let created_at: String = row.get(16)?;
        let updated_at: String = row.get(17)?;
        Ok(Feature {
            id: row.get(0)?,
            category: row.get(1)?,
            description: row.get(2)?,
            notes: row.get(3)?,
            status: FeatureStatus::from_str(&status),
            depends_on: serde_json::from_str(&depends_on).unwrap_or_default(),
            requirements: serde_json::from_str(&requirements).unwrap_or_default(),
            architecture_compliance: serde_json::from_str(&architecture_compliance)
                .unwrap_or_default(),
            verification_steps: serde_json::from_str(&verification_steps).unwrap_or_default(),
            assigned_to: row.get(9)?,
            reviewed_by: row.get(10)?,
            tested_by: row.get(11)?,
            passes: passes != 0,
            openspec_change_id: row.get(13)?,
            openspec_task_group: row.get(14)?,
            openspec_reference: row.get(15)?,
            created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
            updated_at: updated_at.parse().unwrap_or_else(|_| Utc::now()),
        })
    });

    match result {
        Ok(f) => Ok(Some(f)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(StoreError::Db(e)),
    }
}
