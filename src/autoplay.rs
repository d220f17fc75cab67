use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::agent_runner::{build_agent_prompt, run_agent, Role};
use crate::config::Config;
use crate::features::{FeatureError, FeatureModel, FeatureStatus};
use crate::scheduler::{next_action, Action, SchedulerError};
use crate::session::{SessionLog, SessionOutcome};
use crate::store::Store;
use crate::vcs::{self, MergeOutcome, VcsError};

#[derive(Debug, thiserror::Error)]
pub enum AutoplayError {
    #[error("feature error: {0}")]
    Feature(#[from] FeatureError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("vcs error: {0}")]
    Vcs(#[from] VcsError),
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("session error: {0}")]
    Session(#[from] crate::session::SessionError),
}

/// What a single iteration of the loop did, for the CLI to report on exit.
#[derive(Debug)]
pub enum StepOutcome {
    RanAgent { feature_id: String, role: Role },
    CreatedPr { feature_id: String },
    Merged { feature_id: String },
    EscalatedRetryLimit { feature_id: String },
    EscalatedSafeMode { feature_id: String },
}

fn role_for(action: Action) -> Option<Role> {
    match action {
        Action::Dev => Some(Role::Dev),
        Action::Review => Some(Role::Review),
        Action::Qa => Some(Role::Qa),
        Action::Pr | Action::Merge => None,
    }
}

/// The loop's per-run, in-memory state. Never persisted: a fresh run starts
/// every feature unescalated with a zero retry count.
pub struct AutoplayController<'a> {
    store: &'a Store,
    project_dir: &'a Path,
    retries: HashMap<String, u32>,
    escalated: HashSet<String>,
}

impl<'a> AutoplayController<'a> {
    pub fn new(store: &'a Store, project_dir: &'a Path) -> Self {
        Self {
            store,
            project_dir,
            retries: HashMap::new(),
            escalated: HashSet::new(),
        }
    }

    pub fn escalated_ids(&self) -> &HashSet<String> {
        &self.escalated
    }

    fn record_retry(&mut self, id: &str, max_retries: u32) -> bool {
        let count = self.retries.entry(id.to_string()).or_insert(0);
        *count += 1;
        if *count > max_retries {
            self.escalated.insert(id.to_string());
            true
        } else {
            false
        }
    }

    /// Run a single iteration. Returns `None` once the Scheduler has nothing
    /// left to do — the caller should stop looping at that point.
    pub fn run_iteration(&mut self) -> Result<Option<StepOutcome>, AutoplayError> {
        let fm = FeatureModel::new(self.store);
        let config = Config::new(self.store);
        let log = SessionLog::new(self.store);

        let ordered = fm.resolve_order()?;
        let chosen = next_action(&fm, &ordered, &self.escalated)?;

        let (feature, action) = match chosen {
            Some((f, a)) => (f.clone(), a),
            None => return Ok(None),
        };

        match action {
            Action::Pr => {
                vcs::create_pr(self.project_dir, &fm, &feature)?;
                log.append("vcs", &feature.id, SessionOutcome::Passed, "pr created")?;
                return Ok(Some(StepOutcome::CreatedPr {
                    feature_id: feature.id,
                }));
            }
            Action::Merge => {
                let safe_mode = config.safe_mode()?;
                let auto_merge = config.auto_merge()?;
                match vcs::merge_pr(self.project_dir, &fm, &feature, safe_mode, auto_merge)? {
                    MergeOutcome::Merged(_) => {
                        log.append("vcs", &feature.id, SessionOutcome::Merged, "")?;
                        crate::importer::maybe_archive(self.project_dir, &fm, &feature.id).ok();
                        return Ok(Some(StepOutcome::Merged {
                            feature_id: feature.id,
                        }));
                    }
                    MergeOutcome::SkippedSafeMode => {
                        self.escalated.insert(feature.id.clone());
                        log.append(
                            "vcs",
                            &feature.id,
                            SessionOutcome::Stalled,
                            "merge skipped: safe mode or auto-merge disabled",
                        )?;
                        return Ok(Some(StepOutcome::EscalatedSafeMode {
                            feature_id: feature.id,
                        }));
                    }
                }
            }
            Action::Dev | Action::Review | Action::Qa => {
                let max_retries = config.max_retries()?;

                if action == Action::Dev && feature.status == FeatureStatus::NeedsRevision {
                    if self.record_retry(&feature.id, max_retries) {
                        log.append(
                            "dev",
                            &feature.id,
                            SessionOutcome::Stalled,
                            "escalated: max retries exceeded on rejection cycle",
                        )?;
                        return Ok(Some(StepOutcome::EscalatedRetryLimit {
                            feature_id: feature.id,
                        }));
                    }
                }

                let role = role_for(action).expect("dev/review/qa always map to a role");
                let status_before = feature.status.clone();
                let prompt = build_agent_prompt(&feature, role);
                let model = config.model()?;
                let max_turns = config.max_agent_turns()?;

                let outcome = run_agent(self.project_dir, &prompt, &model, max_turns, |line| {
                    tracing::info!(feature = %feature.id, %line, "agent output");
                });

                let reloaded = fm.get(&feature.id)?;

                match outcome {
                    crate::agent_runner::AgentOutcome::SpawnError(e) => {
                        log.append(
                            role_label(role),
                            &feature.id,
                            SessionOutcome::SpawnFailed,
                            &e.to_string(),
                        )?;
                        if self.record_retry(&feature.id, max_retries) {
                            return Ok(Some(StepOutcome::EscalatedRetryLimit {
                                feature_id: feature.id,
                            }));
                        }
                    }
                    crate::agent_runner::AgentOutcome::Exited { success } => {
                        if reloaded.status == status_before {
                            log.append(
                                role_label(role),
                                &feature.id,
                                SessionOutcome::Stalled,
                                "status unchanged after agent session",
                            )?;
                            if self.record_retry(&feature.id, max_retries) {
                                return Ok(Some(StepOutcome::EscalatedRetryLimit {
                                    feature_id: feature.id,
                                }));
                            }
                        } else {
                            let session_outcome = if success {
                                SessionOutcome::Passed
                            } else {
                                SessionOutcome::Failed
                            };
                            log.append(role_label(role), &feature.id, session_outcome, "")?;
                        }
                    }
                }

                Ok(Some(StepOutcome::RanAgent {
                    feature_id: feature.id,
                    role,
                }))
            }
        }
    }

    /// Run the loop to completion (Scheduler returns none). Returns whether
    /// any feature was escalated during the run.
    pub fn run(&mut self) -> Result<bool, AutoplayError> {
        loop {
            match self.run_iteration()? {
                Some(_) => continue,
                None => return Ok(!self.escalated.is_empty()),
            }
        }
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::Dev => "dev",
        Role::Review => "review",
        Role::Qa => "qa",
    }
}
