use std::path::Path;
use std::process::Command;

use crate::features::{Feature, FeatureModel, FeatureStatus, FeatureUpdate};

#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("git command failed: {0}")]
    Git(String),
    #[error("feature error: {0}")]
    Feature(#[from] crate::features::FeatureError),
}

/// Check if directory is inside a git work tree.
pub fn is_git_repo(dir: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(dir)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Check if the repo has a remote configured.
pub fn has_remote(dir: &Path) -> bool {
    Command::new("git")
        .args(["remote"])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success() && !o.stdout.is_empty())
        .unwrap_or(false)
}

/// Check if the `gh`-style PR CLI is available.
pub fn has_pr_cli() -> bool {
    Command::new("gh")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn branch_name(feature_id: &str) -> String {
    format!("feature/{}", feature_id.to_lowercase())
}

fn current_branch(dir: &Path) -> Option<String> {
    Command::new("git")
        .args(["rev-parse", "--abbrev-ref", "HEAD"])
        .current_dir(dir)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
}

/// Default branch, determined via the remote's symbolic HEAD, falling back
/// to "main" when no remote is configured or the lookup fails.
pub fn default_branch(dir: &Path) -> String {
    Command::new("git")
        .args(["symbolic-ref", "refs/remotes/origin/HEAD"])
        .current_dir(dir)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| {
            String::from_utf8_lossy(&o.stdout)
                .trim()
                .trim_start_matches("refs/remotes/origin/")
                .to_string()
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "main".to_string())
}

fn checkout_branch(dir: &Path, branch: &str) -> Result<(), VcsError> {
    let exists = Command::new("git")
        .args(["rev-parse", "--verify", branch])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);

    let args: Vec<&str> = if exists {
        vec!["checkout", branch]
    } else {
        vec!["checkout", "-b", branch]
    };
    let output = Command::new("git")
        .args(&args)
        .current_dir(dir)
        .output()
        .map_err(|e| VcsError::Git(format!("checkout {branch} failed: {e}")))?;
    if !output.status.success() {
        return Err(VcsError::Git(format!(
            "checkout {branch} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

fn push_branch(dir: &Path, branch: &str) -> bool {
    if !has_remote(dir) {
        return false;
    }
    Command::new("git")
        .args(["push", "-u", "origin", branch])
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Create (or ensure) the feature branch, push it if a remote exists, and
/// open a PR via the `gh`-style CLI when present. Degrades to a manual
/// instruction printed to stdout when the CLI is absent. Transitions the
/// feature to `pr-open` either way.
pub fn create_pr(dir: &Path, fm: &FeatureModel, feature: &Feature) -> Result<Feature, VcsError> {
    let branch = branch_name(&feature.id);
    if current_branch(dir).as_deref() != Some(branch.as_str()) {
        checkout_branch(dir, &branch)?;
    }

    let pushed = push_branch(dir, &branch);
    if !pushed && has_remote(dir) {
        tracing::warn!(feature = %feature.id, "push failed, continuing local-only");
    }

    if has_pr_cli() {
        let title = format!("{}: {}", feature.id, feature.description);
        let body = format!(
            "Architecture compliance:\n{}",
            feature.architecture_compliance.join("\n")
        );
        let output = Command::new("gh")
            .args([
                "pr",
                "create",
                "--title",
                &title,
                "--body",
                &body,
                "--base",
                &default_branch(dir),
                "--head",
                &branch,
            ])
            .current_dir(dir)
            .output();
        match output {
            Ok(o) if o.status.success() => {
                tracing::info!(feature = %feature.id, "PR created");
            }
            Ok(o) => {
                tracing::warn!(
                    feature = %feature.id,
                    stderr = %String::from_utf8_lossy(&o.stderr),
                    "gh pr create failed, leaving feature pr-open for manual follow-up"
                );
            }
            Err(e) => {
                tracing::warn!(feature = %feature.id, error = %e, "gh pr create could not run");
            }
        }
    } else {
        println!(
            "No PR CLI found. Open a PR manually for branch '{branch}' targeting '{}'.",
            default_branch(dir)
        );
    }

    Ok(fm.update(
        &feature.id,
        FeatureUpdate {
            status: Some(FeatureStatus::PrOpen),
            ..Default::default()
        },
    )?)
}

pub enum MergeOutcome {
    Merged(Feature),
    SkippedSafeMode,
}

/// Merge the feature's PR. Skips (without transitioning) when `safe_mode` or
/// `!auto_merge`. Prefers the PR CLI's merge-and-delete-branch; falls back to
/// a local merge into the default branch.
pub fn merge_pr(
    dir: &Path,
    fm: &FeatureModel,
    feature: &Feature,
    safe_mode: bool,
    auto_merge: bool,
) -> Result<MergeOutcome, VcsError> {
    if safe_mode || !auto_merge {
        return Ok(MergeOutcome::SkippedSafeMode);
    }

    let branch = branch_name(&feature.id);

    if has_pr_cli() {
        let output = Command::new("gh")
            .args(["pr", "merge", &branch, "--merge", "--delete-branch"])
            .current_dir(dir)
            .output();
        if let Ok(o) = output {
            if o.status.success() {
                let updated = fm.update(
                    &feature.id,
                    FeatureUpdate {
                        status: Some(FeatureStatus::Complete),
                        ..Default::default()
                    },
                )?;
                return Ok(MergeOutcome::Merged(updated));
            }
        }
    }

    let default = default_branch(dir);
    checkout_branch(dir, &default)?;
    let output = Command::new("git")
        .args(["merge", "--no-ff", &branch, "--no-edit"])
        .current_dir(dir)
        .output()
        .map_err(|e| VcsError::Git(format!("merge failed: {e}")))?;
    if !output.status.success() {
        let _ = Command::new("git")
            .args(["merge", "--abort"])
            .current_dir(dir)
            .output();
        return Err(VcsError::Git(format!(
            "merge conflict on {branch}: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let updated = fm.update(
        &feature.id,
        FeatureUpdate {
            status: Some(FeatureStatus::Complete),
            ..Default::default()
        },
    )?;
    Ok(MergeOutcome::Merged(updated))
}
