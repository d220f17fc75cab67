use std::collections::HashSet;

use crate::features::{Feature, FeatureModel, FeatureStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Dev,
    Review,
    Qa,
    Pr,
    Merge,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("feature error: {0}")]
    Feature(#[from] crate::features::FeatureError),
}

/// Map a single feature's current state to its next action, honoring the
/// `passes=true` short-circuit: a QA-passed feature always routes to `pr`
/// next, regardless of its status, unless it is already `complete`.
fn action_for(feature: &Feature) -> Option<Action> {
    if feature.status == FeatureStatus::Complete {
        return None;
    }
    if feature.passes {
        return Some(Action::Pr);
    }
    match feature.status {
        FeatureStatus::Pending | FeatureStatus::NeedsRevision => Some(Action::Dev),
        FeatureStatus::ReadyForReview => Some(Action::Review),
        FeatureStatus::Approved | FeatureStatus::QaTesting => Some(Action::Qa),
        FeatureStatus::PrOpen => Some(Action::Merge),
        FeatureStatus::Complete => None,
        _ => Some(Action::Dev),
    }
}

/// Stateless: given the full feature set (in topological order) and the
/// current escalation set, return the first actionable (feature, action)
/// pair, skipping completed, escalated, and dependency-blocked features.
pub fn next_action<'a>(
    fm: &FeatureModel,
    ordered: &'a [Feature],
    escalated: &HashSet<String>,
) -> Result<Option<(&'a Feature, Action)>, SchedulerError> {
    for feature in ordered {
        if feature.status == FeatureStatus::Complete {
            continue;
        }
        if escalated.contains(&feature.id) {
            continue;
        }
        if !fm.deps_are_met(feature)? {
            continue;
        }
        if let Some(action) = action_for(feature) {
            return Ok(Some((feature, action)));
        }
    }
    Ok(None)
}

/// Same traversal as `next_action`, but collects up to `limit` actionable
/// pairs instead of stopping at the first. Purely read-only — used by team
/// mode to print a batch of steps for a human-driven multi-agent tool
/// instead of spawning any subprocess.
pub fn next_actions<'a>(
    fm: &FeatureModel,
    ordered: &'a [Feature],
    escalated: &HashSet<String>,
    limit: usize,
) -> Result<Vec<(&'a Feature, Action)>, SchedulerError> {
    let mut out = Vec::new();
    for feature in ordered {
        if out.len() >= limit {
            break;
        }
        if feature.status == FeatureStatus::Complete {
            continue;
        }
        if escalated.contains(&feature.id) {
            continue;
        }
        if !fm.deps_are_met(feature)? {
            continue;
        }
        if let Some(action) = action_for(feature) {
            out.push((feature, action));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn passes_short_circuits_to_pr() {
        let mut feature = make("FEAT-001", FeatureStatus::ReadyForReview);
        feature.passes = true;
        assert_eq!(action_for(&feature), Some(Action::Pr));
    }

    #[test]
    fn complete_has_no_action_even_with_passes() {
        let mut feature = make("FEAT-001", FeatureStatus::Complete);
        feature.passes = true;
        assert_eq!(action_for(&feature), None);
    }

    #[test]
    fn pending_maps_to_dev() {
        assert_eq!(action_for(&make("FEAT-001", FeatureStatus::Pending)), Some(Action::Dev));
    }

    #[test]
    fn needs_revision_maps_to_dev() {
        assert_eq!(
            action_for(&make("FEAT-001", FeatureStatus::NeedsRevision)),
            Some(Action::Dev)
        );
    }

    #[test]
    fn pr_open_maps_to_merge() {
        assert_eq!(action_for(&make("FEAT-001", FeatureStatus::PrOpen)), Some(Action::Merge));
    }

    #[test]
    fn next_action_skips_blocked_dependency() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let fm = FeatureModel::new(&store);
        let a = fm
            .create("A".into(), "core".into(), vec![], vec![], vec![], vec![], String::new(), 0, String::new())
            .unwrap();
        let b = fm
            .create(
                "B".into(),
                "core".into(),
                vec![a.id.clone()],
                vec![],
                vec![],
                vec![],
                String::new(),
                0,
                String::new(),
            )
            .unwrap();
        let ordered = fm.resolve_order().unwrap();
        let escalated = HashSet::new();
        let (next, action) = next_action(&fm, &ordered, &escalated).unwrap().unwrap();
        assert_eq!(next.id, a.id);
        assert_eq!(action, Action::Dev);
        let _ = b;
    }

    #[test]
    fn next_action_skips_escalated() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let fm = FeatureModel::new(&store);
        let a = fm
            .create("A".into(), "core".into(), vec![], vec![], vec![], vec![], String::new(), 0, String::new())
            .unwrap();
        let ordered = fm.resolve_order().unwrap();
        let mut escalated = HashSet::new();
        escalated.insert(a.id.clone());
        assert!(next_action(&fm, &ordered, &escalated).unwrap().is_none());
    }

    #[test]
    fn next_actions_respects_limit_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let fm = FeatureModel::new(&store);
        let a = fm
            .create("A".into(), "core".into(), vec![], vec![], vec![], vec![], String::new(), 0, String::new())
            .unwrap();
        let b = fm
            .create("B".into(), "core".into(), vec![], vec![], vec![], vec![], String::new(), 0, String::new())
            .unwrap();
        fm.create("C".into(), "core".into(), vec![], vec![], vec![], vec![], String::new(), 0, String::new())
            .unwrap();
        let ordered = fm.resolve_order().unwrap();
        let escalated = HashSet::new();
        let picked = next_actions(&fm, &ordered, &escalated, 2).unwrap();
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].0.id, a.id);
        assert_eq!(picked[1].0.id, b.id);
    }

    fn make(id: &str, status: FeatureStatus) -> Feature {
        let ts = chrono::Utc::now();
        Feature {
            id: id.into(),
            category: String::new(),
            description: String::new(),
            notes: String::new(),
            status,
            depends_on: vec![],
            requirements: vec![],
            architecture_compliance: vec![],
            verification_steps: vec![],
            assigned_to: String::new(),
            reviewed_by: String::new(),
            tested_by: String::new(),
            passes: false,
            openspec_change_id: String::new(),
            openspec_task_group: 0,
            openspec_reference: String::new(),
            created_at: ts,
            updated_at: ts,
        }
    }
}
