use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use crate::features::Feature;

#[derive(Debug)]
pub enum AgentOutcome {
    Exited { success: bool },
    SpawnError(std::io::Error),
}

/// The three roles the Agent Runner can dispatch a session as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Dev,
    Review,
    Qa,
}

impl Role {
    fn directive(self) -> &'static str {
        match self {
            Role::Dev => {
                "Implement this feature with full architecture compliance. \
                 When done, set its status to ready-for-review."
            }
            Role::Review => {
                "Execute every verification step against every listed architecture \
                 principle. Approve the feature (status=approved) or reject it \
                 (status=needs-revision) with evidence in notes."
            }
            Role::Qa => {
                "Execute every verification step. On success set passes=true — do NOT \
                 set status=complete yourself, the VCS bridge does that after merge. \
                 On failure set status=needs-revision with evidence in notes."
            }
        }
    }
}

/// Build the prompt for a role-specific session on `feature`.
pub fn build_agent_prompt(feature: &Feature, role: Role) -> String {
    let mut prompt = format!(
        "You are a pipeline agent. Your assigned feature is {}: {}\n\n{}\n\n\
         Full feature record:\n{}",
        feature.id,
        feature.description,
        role.directive(),
        serde_json::to_string_pretty(feature).unwrap_or_default(),
    );

    if role == Role::Dev && feature.status == crate::features::FeatureStatus::NeedsRevision {
        prompt.push_str(
            "\n\nThis feature was previously rejected. Consult the notes field and any \
             version-control history for the rejection feedback before re-implementing.",
        );
    }

    prompt
}

/// Spawn the agent subprocess for `prompt`, stream its stdout line by line
/// via `on_line`, and wait for it to exit. The subprocess is treated as an
/// opaque effect: its output is never parsed for state, only displayed.
pub fn run_agent(
    project_dir: &Path,
    prompt: &str,
    model: &str,
    max_turns: u32,
    mut on_line: impl FnMut(&str),
) -> AgentOutcome {
    match spawn_agent(project_dir, prompt, model, max_turns) {
        Ok(mut child) => {
            if let Some(stdout) = child.stdout.take() {
                let reader = BufReader::new(stdout);
                for line in reader.lines() {
                    match line {
                        Ok(line) => on_line(&line),
                        Err(_) => break,
                    }
                }
            }
            match child.wait() {
                Ok(status) => AgentOutcome::Exited {
                    success: status.success(),
                },
                Err(e) => AgentOutcome::SpawnError(e),
            }
        }
        Err(e) => AgentOutcome::SpawnError(e),
    }
}

fn spawn_agent(
    project_dir: &Path,
    prompt: &str,
    model: &str,
    max_turns: u32,
) -> Result<Child, std::io::Error> {
    Command::new("agent")
        .args([
            "--print",
            "--model",
            model,
            "--max-turns",
            &max_turns.to_string(),
            prompt,
        ])
        .current_dir(project_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureStatus;
    use chrono::Utc;

    fn sample_feature() -> Feature {
        let ts = Utc::now();
        Feature {
            id: "FEAT-001".into(),
            category: "core".into(),
            description: "Add login endpoint".into(),
            notes: String::new(),
            status: FeatureStatus::Pending,
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

    #[test]
    fn dev_prompt_mentions_feature_id() {
        let feature = sample_feature();
        let prompt = build_agent_prompt(&feature, Role::Dev);
        assert!(prompt.contains("FEAT-001"));
        assert!(prompt.contains("ready-for-review"));
    }

    #[test]
    fn needs_revision_prompt_adds_rejection_note() {
        let mut feature = sample_feature();
        feature.status = FeatureStatus::NeedsRevision;
        let prompt = build_agent_prompt(&feature, Role::Dev);
        assert!(prompt.contains("previously rejected"));
    }

    #[test]
    fn qa_prompt_never_asks_to_set_complete() {
        let feature = sample_feature();
        let prompt = build_agent_prompt(&feature, Role::Qa);
        assert!(prompt.contains("passes=true"));
        assert!(prompt.contains("do NOT"));
    }
}
