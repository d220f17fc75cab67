use std::path::{Path, PathBuf};
use std::process::Command;

use regex::Regex;

use crate::features::{FeatureModel, FeatureUpdate};

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("feature error: {0}")]
    Feature(#[from] crate::features::FeatureError),
    #[error("change not found: {0}")]
    ChangeNotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
struct TaskGroup {
    title: String,
    steps: Vec<String>,
}

/// Parse `tasks.md` content into task groups. A top-level numbered item
/// ("1." / "1)") starts a group; indented bullets under it are steps with
/// checkbox markers stripped. A file with no parseable groups becomes a
/// single group named after the change.
fn parse_tasks(content: &str, change_name: &str) -> Vec<TaskGroup> {
    let top_level = Regex::new(r"^\s{0,3}\d+[.)]\s+(.*)$").unwrap();
    let bullet = Regex::new(r"^\s+[-*]\s+(.*)$").unwrap();
    let checkbox = Regex::new(r"^\[[ xX]\]\s*").unwrap();

    let mut groups: Vec<TaskGroup> = Vec::new();
    for line in content.lines() {
        if let Some(caps) = top_level.captures(line) {
            groups.push(TaskGroup {
                title: caps[1].trim().to_string(),
                steps: Vec::new(),
            });
        } else if let Some(caps) = bullet.captures(line) {
            if let Some(group) = groups.last_mut() {
                let step = checkbox.replace(caps[1].trim(), "").trim().to_string();
                group.steps.push(step);
            }
        }
    }

    if groups.is_empty() {
        groups.push(TaskGroup {
            title: change_name.to_string(),
            steps: Vec::new(),
        });
    }
    groups
}

#[derive(Debug, Default, Clone)]
struct SpecContent {
    requirements: Vec<String>,
    verification_steps: Vec<String>,
}

/// Parse aggregated spec content: `### Requirement:` headers produce
/// requirements, GIVEN/WHEN/THEN/AND bullets each produce a verification
/// step of the form "{scenario text} verified".
fn parse_spec(content: &str) -> SpecContent {
    let requirement_header = Regex::new(r"(?i)^###\s*Requirement:\s*(.*)$").unwrap();
    let scenario_line = Regex::new(r"(?i)^\s*[-*]?\s*(GIVEN|WHEN|THEN|AND)\b.*$").unwrap();

    let mut out = SpecContent::default();
    for line in content.lines() {
        if let Some(caps) = requirement_header.captures(line) {
            out.requirements.push(caps[1].trim().to_string());
        } else if scenario_line.is_match(line) {
            out.verification_steps
                .push(format!("{} verified", line.trim()));
        }
    }
    out
}

fn changes_dir(project_dir: &Path) -> PathBuf {
    project_dir.join("openspec/changes")
}

fn read_change_artifacts(project_dir: &Path, change: &str) -> Result<(String, String), ImportError> {
    let dir = changes_dir(project_dir).join(change);
    if !dir.is_dir() {
        return Err(ImportError::ChangeNotFound(change.to_string()));
    }

    let tasks = std::fs::read_to_string(dir.join("tasks.md")).unwrap_or_default();

    let mut spec_content = String::new();
    for candidate in ["proposal.md", "design.md"] {
        if let Ok(content) = std::fs::read_to_string(dir.join(candidate)) {
            spec_content.push_str(&content);
            spec_content.push('\n');
        }
    }
    let specs_dir = dir.join("specs");
    if specs_dir.is_dir() {
        collect_spec_files(&specs_dir, &mut spec_content)?;
    }

    Ok((tasks, spec_content))
}

fn collect_spec_files(dir: &Path, out: &mut String) -> Result<(), ImportError> {
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_spec_files(&path, out)?;
        } else if path.file_name().and_then(|n| n.to_str()) == Some("spec.md") {
            out.push_str(&std::fs::read_to_string(&path)?);
            out.push('\n');
        }
    }
    Ok(())
}

/// Try the external CLI first; fall back to reading the change's markdown
/// files directly from disk.
fn fetch_change_content(project_dir: &Path, change: &str) -> Result<(String, String), ImportError> {
    let cli_output = Command::new("openspec")
        .args(["show", change, "--json"])
        .current_dir(project_dir)
        .output();

    if let Ok(output) = cli_output {
        if output.status.success() && !output.stdout.is_empty() {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&output.stdout) {
                let tasks = value
                    .get("tasks")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let spec = value
                    .get("spec")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                if !tasks.is_empty() || !spec.is_empty() {
                    return Ok((tasks, spec));
                }
            }
        }
    }

    read_change_artifacts(project_dir, change)
}

/// Upsert the features for one change. Returns the ids created or updated,
/// in task-group order.
pub fn import_change(
    project_dir: &Path,
    fm: &FeatureModel,
    change: &str,
) -> Result<Vec<String>, ImportError> {
    let (tasks_content, spec_content) = fetch_change_content(project_dir, change)?;
    let groups = parse_tasks(&tasks_content, change);
    let spec = parse_spec(&spec_content);

    let mut ids = Vec::new();
    let mut previous_id: Option<String> = None;

    for (idx, group) in groups.iter().enumerate() {
        let task_group = (idx + 1) as i64;
        let reference = changes_dir(project_dir)
            .join(change)
            .to_string_lossy()
            .to_string();

        let existing = fm.find_by_openspec_key(change, task_group)?;
        let feature = match existing {
            Some(f) => fm.update(
                &f.id,
                FeatureUpdate {
                    category: Some(change.to_string()),
                    description: Some(group.title.clone()),
                    notes: Some(String::new()),
                    requirements: Some(spec.requirements.clone()),
                    verification_steps: Some(
                        group
                            .steps
                            .iter()
                            .cloned()
                            .chain(spec.verification_steps.clone())
                            .collect(),
                    ),
                    openspec_reference: Some(reference.clone()),
                    ..Default::default()
                },
            )?,
            None => {
                let mut depends_on = Vec::new();
                if let Some(prev) = &previous_id {
                    depends_on.push(prev.clone());
                }
                fm.create(
                    group.title.clone(),
                    change.to_string(),
                    depends_on,
                    spec.requirements.clone(),
                    Vec::new(),
                    group
                        .steps
                        .iter()
                        .cloned()
                        .chain(spec.verification_steps.clone())
                        .collect(),
                    change.to_string(),
                    task_group,
                    reference,
                )?
            }
        };

        // Sequential dependency wiring even when updating an existing feature
        // whose manual depends_on didn't yet include the predecessor.
        if let Some(prev) = &previous_id {
            if !feature.depends_on.contains(prev) {
                let mut deps = feature.depends_on.clone();
                deps.push(prev.clone());
                fm.update(
                    &feature.id,
                    FeatureUpdate {
                        depends_on: Some(deps),
                        ..Default::default()
                    },
                )?;
            }
        }

        previous_id = Some(feature.id.clone());
        ids.push(feature.id);
    }

    Ok(ids)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PreviewGroup {
    pub task_group: i64,
    pub title: String,
    pub upsert_key: (String, i64),
}

/// Dry-run preview of what `import_change` would create/update: the task
/// group titles and the `(openspec_change_id, openspec_task_group)` key each
/// would upsert against. Read-only — shares the parsing path, skips the
/// write step entirely.
pub fn preview_change(project_dir: &Path, change: &str) -> Result<Vec<PreviewGroup>, ImportError> {
    let (tasks_content, _) = fetch_change_content(project_dir, change)?;
    let groups = parse_tasks(&tasks_content, change);
    Ok(groups
        .into_iter()
        .enumerate()
        .map(|(idx, group)| PreviewGroup {
            task_group: (idx + 1) as i64,
            title: group.title,
            upsert_key: (change.to_string(), (idx + 1) as i64),
        })
        .collect())
}

/// After a feature completes, archive its change if every sibling feature is
/// also complete. Non-fatal on archive failure.
pub fn maybe_archive(
    project_dir: &Path,
    fm: &FeatureModel,
    feature_id: &str,
) -> Result<(), ImportError> {
    let feature = fm.get(feature_id)?;
    if feature.openspec_change_id.is_empty() {
        return Ok(());
    }
    let siblings = fm.list(&crate::features::FeatureFilter::default())?;
    let all_complete = siblings
        .iter()
        .filter(|f| f.openspec_change_id == feature.openspec_change_id)
        .all(|f| f.status == crate::features::FeatureStatus::Complete);

    if all_complete {
        let result = Command::new("openspec")
            .args(["archive", &feature.openspec_change_id])
            .current_dir(project_dir)
            .output();
        if let Ok(output) = result {
            if !output.status.success() {
                tracing::warn!(change = %feature.openspec_change_id, "archive failed (non-fatal)");
            }
        } else {
            tracing::warn!(change = %feature.openspec_change_id, "openspec CLI not available for archive");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn parse_tasks_splits_groups_and_steps() {
        let content = "1. Set up schema\n   - create table\n   - [x] add index\n2. Wire API\n   - add route\n";
        let groups = parse_tasks(content, "my-change");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].title, "Set up schema");
        assert_eq!(groups[0].steps, vec!["create table", "add index"]);
        assert_eq!(groups[1].title, "Wire API");
    }

    #[test]
    fn parse_tasks_empty_falls_back_to_change_name() {
        let groups = parse_tasks("", "my-change");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].title, "my-change");
        assert!(groups[0].steps.is_empty());
    }

    #[test]
    fn parse_spec_extracts_requirements_and_scenarios() {
        let content = "### Requirement: Users can log in\nGIVEN a valid account\nWHEN they submit credentials\nTHEN they are authenticated\n";
        let spec = parse_spec(content);
        assert_eq!(spec.requirements, vec!["Users can log in"]);
        assert_eq!(spec.verification_steps.len(), 3);
        assert!(spec.verification_steps[0].ends_with("verified"));
    }

    fn write_change(dir: &Path, name: &str, tasks: &str) {
        let change_dir = dir.join("openspec/changes").join(name);
        std::fs::create_dir_all(&change_dir).unwrap();
        std::fs::write(change_dir.join("tasks.md"), tasks).unwrap();
    }

    #[test]
    fn import_creates_sequential_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        write_change(
            dir.path(),
            "add-auth",
            "1. Schema\n   - create users table\n2. Endpoint\n   - add /login\n",
        );
        let store = Store::open(dir.path()).unwrap();
        let fm = FeatureModel::new(&store);
        let ids = import_change(dir.path(), &fm, "add-auth").unwrap();
        assert_eq!(ids.len(), 2);
        let second = fm.get(&ids[1]).unwrap();
        assert_eq!(second.depends_on, vec![ids[0].clone()]);
    }

    #[test]
    fn import_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write_change(
            dir.path(),
            "add-auth",
            "1. Schema\n   - create users table\n2. Endpoint\n   - add /login\n",
        );
        let store = Store::open(dir.path()).unwrap();
        let fm = FeatureModel::new(&store);
        let first = import_change(dir.path(), &fm, "add-auth").unwrap();
        let second = import_change(dir.path(), &fm, "add-auth").unwrap();
        assert_eq!(first, second);
        let all = fm.list(&crate::features::FeatureFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn reimport_refreshes_notes_and_reference() {
        let dir = tempfile::tempdir().unwrap();
        write_change(dir.path(), "add-auth", "1. Schema\n   - create users table\n");
        let store = Store::open(dir.path()).unwrap();
        let fm = FeatureModel::new(&store);
        let ids = import_change(dir.path(), &fm, "add-auth").unwrap();

        fm.update(
            &ids[0],
            FeatureUpdate {
                notes: Some("rejected: missing migration".into()),
                ..Default::default()
            },
        )
        .unwrap();

        import_change(dir.path(), &fm, "add-auth").unwrap();
        let refreshed = fm.get(&ids[0]).unwrap();
        assert_eq!(refreshed.notes, "");
        assert!(refreshed.openspec_reference.ends_with("add-auth"));
    }

    #[test]
    fn import_missing_change_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let fm = FeatureModel::new(&store);
        let result = import_change(dir.path(), &fm, "nope");
        assert!(matches!(result, Err(ImportError::ChangeNotFound(_))));
    }
}
