mod agent_runner;
mod architecture;
mod autoplay;
mod config;
mod export;
mod features;
mod importer;
mod scheduler;
mod server;
mod session;
mod store;
mod vcs;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use autoplay::{AutoplayController, StepOutcome};
use config::Config;
use export::{default_export_path, export_features, import_features};
use features::{Feature, FeatureFilter, FeatureModel, FeatureStatus, FeatureUpdate};
use session::SessionLog;
use store::Store;

#[derive(Parser)]
#[command(name = "pipewright", version, about = "Drive a feature backlog through dev/review/QA agents to merged PRs")]
struct Cli {
    /// Project directory (default: current directory, or $FRAMEWORK_PROJECT_ROOT)
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Feature backlog operations
    Feature {
        #[command(subcommand)]
        action: FeatureCommand,
    },
    /// Print pipeline status with counts
    Status,
    /// Print next-step instructions for a human driver
    Guided,
    /// Run the pipeline until drained or escalated
    Autoplay {
        #[arg(long, default_value = "orchestrator")]
        mode: String,
        #[arg(long)]
        auto_merge: bool,
    },
    /// Architecture blob operations
    Arch {
        #[command(subcommand)]
        action: ArchCommand,
    },
    /// Start the Read-Model Server
    Dashboard {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Spec-importer operations
    Openspec {
        #[command(subcommand)]
        action: OpenspecCommand,
    },
    /// Project configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum FeatureCommand {
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        assigned: Option<String>,
    },
    Get {
        id: String,
    },
    Create {
        #[arg(short, long)]
        description: String,
        #[arg(short, long, default_value = "")]
        category: String,
        #[arg(long, value_delimiter = ',')]
        depends: Vec<String>,
        #[arg(long, default_value = "")]
        openspec: String,
        #[arg(long, value_delimiter = ',')]
        compliance: Vec<String>,
    },
    Update {
        id: String,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        passes: Option<bool>,
        #[arg(long)]
        notes: Option<String>,
    },
    Remove {
        id: String,
    },
    History {
        id: String,
    },
    Export {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    Import {
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ArchCommand {
    Import { kind: String, path: PathBuf },
    Export { kind: String, path: PathBuf },
}

#[derive(Subcommand)]
enum OpenspecCommand {
    Install,
    Refresh,
    Status,
    Import {
        change: Option<String>,
        #[arg(long)]
        all: bool,
    },
    Archive {
        feature_id: String,
    },
    Diff {
        change: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    Get { key: String },
    Set { key: String, value: String },
}

fn init_tracing() {
    let filter = std::env::var("FRAMEWORK_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_target(false)
        .init();
}

fn project_root(cli: &Cli) -> PathBuf {
    cli.project.clone().unwrap_or_else(|| {
        std::env::var("FRAMEWORK_PROJECT_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
    })
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    let root = project_root(&cli);

    let store = match Store::open(&root) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error opening store: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Feature { action } => cmd_feature(&store, &root, action),
        Commands::Status => cmd_status(&store),
        Commands::Guided => cmd_guided(&store),
        Commands::Autoplay { mode, auto_merge } => cmd_autoplay(&store, &root, &mode, auto_merge),
        Commands::Arch { action } => cmd_arch(&store, action),
        Commands::Dashboard { port } => cmd_dashboard(store, port),
        Commands::Openspec { action } => cmd_openspec(&store, &root, action),
        Commands::Config { action } => cmd_config(&store, action),
    }
}

fn parse_status(s: &str) -> FeatureStatus {
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

fn status_icon(status: &FeatureStatus) -> &'static str {
    match status {
        FeatureStatus::Pending => "○",
        FeatureStatus::InDev => "●",
        FeatureStatus::ReadyForReview => "◐",
        FeatureStatus::Approved => "◑",
        FeatureStatus::NeedsRevision => "✗",
        FeatureStatus::QaTesting => "◒",
        FeatureStatus::PrOpen => "◓",
        FeatureStatus::Complete => "✔",
    }
}

fn print_feature_line(f: &Feature) {
    let deps = if f.depends_on.is_empty() {
        String::new()
    } else {
        format!(" deps=[{}]", f.depends_on.join(","))
    };
    println!(
        "{} {}  {}  [{}]{}",
        status_icon(&f.status),
        f.id,
        f.description,
        feature_status_label(&f.status),
        deps
    );
}

fn feature_status_label(status: &FeatureStatus) -> &'static str {
    match status {
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

fn cmd_feature(store: &Store, root: &std::path::Path, action: FeatureCommand) -> ExitCode {
    let fm = FeatureModel::new(store);
    match action {
        FeatureCommand::List { status, assigned } => {
            let filter = FeatureFilter {
                status: status.as_deref().map(parse_status),
                assigned_to: assigned,
            };
            match fm.list(&filter) {
                Ok(features) => {
                    if features.is_empty() {
                        println!("No features.");
                    }
                    for f in &features {
                        print_feature_line(f);
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => fail(e),
            }
        }
        FeatureCommand::Get { id } => match fm.get(&id) {
            Ok(f) => {
                println!("{}", serde_json::to_string_pretty(&f).unwrap());
                ExitCode::SUCCESS
            }
            Err(e) => fail(e),
        },
        FeatureCommand::Create {
            description,
            category,
            depends,
            openspec,
            compliance,
        } => match fm.create(description, category, depends, vec![], compliance, vec![], String::new(), 0, openspec) {
            Ok(f) => {
                println!("Created {}", f.id);
                ExitCode::SUCCESS
            }
            Err(e) => fail(e),
        },
        FeatureCommand::Update {
            id,
            status,
            passes,
            notes,
        } => {
            let update = FeatureUpdate {
                status: status.as_deref().map(parse_status),
                passes,
                notes,
                ..Default::default()
            };
            match fm.update(&id, update) {
                Ok(f) => {
                    println!("Updated {}", f.id);
                    ExitCode::SUCCESS
                }
                Err(e) => fail(e),
            }
        }
        FeatureCommand::Remove { id } => match fm.remove(&id) {
            Ok(()) => {
                println!("Removed {id}");
                ExitCode::SUCCESS
            }
            Err(e) => fail(e),
        },
        FeatureCommand::History { id } => {
            let log = SessionLog::new(store);
            match log.history(&id) {
                Ok(records) => {
                    if records.is_empty() {
                        println!("No sessions recorded for {id}.");
                    }
                    for r in records {
                        println!(
                            "#{} {} {} {} {}",
                            r.session_number,
                            r.created_at.to_rfc3339(),
                            r.agent_role,
                            r.feature_id,
                            serde_json::to_string(&r.outcome).unwrap()
                        );
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        FeatureCommand::Export { output } => {
            let path = output.unwrap_or_else(|| default_export_path(root));
            match export_features(&fm, &path) {
                Ok(n) => {
                    println!("Exported {n} feature(s) to {}", path.display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        FeatureCommand::Import { input } => {
            let path = input.unwrap_or_else(|| default_export_path(root));
            match import_features(&fm, &path) {
                Ok(n) => {
                    println!("Imported {n} feature(s) from {}", path.display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn cmd_status(store: &Store) -> ExitCode {
    let fm = FeatureModel::new(store);
    match fm.list(&FeatureFilter::default()) {
        Ok(features) => {
            let mut counts: std::collections::BTreeMap<&'static str, usize> = std::collections::BTreeMap::new();
            for f in &features {
                *counts.entry(feature_status_label(&f.status)).or_insert(0) += 1;
            }
            println!("Total: {}", features.len());
            for (status, count) in &counts {
                println!("  {status}: {count}");
            }
            ExitCode::SUCCESS
        }
        Err(e) => fail(e),
    }
}

fn cmd_guided(store: &Store) -> ExitCode {
    let fm = FeatureModel::new(store);
    let ordered = match fm.resolve_order() {
        Ok(o) => o,
        Err(e) => return fail(e),
    };
    let escalated = std::collections::HashSet::new();
    match scheduler::next_action(&fm, &ordered, &escalated) {
        Ok(Some((feature, action))) => {
            println!("Next: {:?} on {} — {}", action, feature.id, feature.description);
            ExitCode::SUCCESS
        }
        Ok(None) => {
            println!("Nothing actionable. All features are complete or blocked.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_autoplay(store: &Store, root: &std::path::Path, mode: &str, auto_merge_flag: bool) -> ExitCode {
    let config = Config::new(store);
    if auto_merge_flag {
        if let Err(e) = config.set("auto_merge", "true") {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    }
    println!("autoplay: mode={mode}");

    if config.openspec_auto_import().unwrap_or(false) {
        let fm = FeatureModel::new(store);
        for change in discover_changes(root) {
            match importer::import_change(root, &fm, &change) {
                Ok(ids) => tracing::info!(%change, count = ids.len(), "openspec_auto_import: imported"),
                Err(e) => tracing::warn!(%change, error = %e, "openspec_auto_import: import failed"),
            }
        }
    }

    match mode {
        "team" => cmd_autoplay_team(store),
        _ => cmd_autoplay_orchestrator(store, root),
    }
}

/// `team` mode never spawns a subprocess: it prints the next
/// `features_per_lead_session` actionable steps as text for a human driving
/// a multi-agent tool by hand, then exits.
fn cmd_autoplay_team(store: &Store) -> ExitCode {
    let fm = FeatureModel::new(store);
    let config = Config::new(store);
    let batch_size = match config.features_per_lead_session() {
        Ok(n) => n,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let ordered = match fm.resolve_order() {
        Ok(o) => o,
        Err(e) => return fail(e),
    };
    let escalated = std::collections::HashSet::new();
    match scheduler::next_actions(&fm, &ordered, &escalated, batch_size) {
        Ok(steps) if steps.is_empty() => {
            println!("Nothing actionable. All features are complete or blocked.");
            ExitCode::SUCCESS
        }
        Ok(steps) => {
            for (feature, action) in steps {
                println!("{:?} {} — {}", action, feature.id, feature.description);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_autoplay_orchestrator(store: &Store, root: &std::path::Path) -> ExitCode {
    let mut controller = AutoplayController::new(store, root);
    loop {
        match controller.run_iteration() {
            Ok(Some(step)) => report_step(&step),
            Ok(None) => break,
            Err(e) => {
                eprintln!("Error: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    let escalated = controller.escalated_ids();
    if escalated.is_empty() {
        println!("autoplay: drained, no escalations.");
        ExitCode::SUCCESS
    } else {
        println!("autoplay: escalated {} feature(s): {}", escalated.len(), escalated.iter().cloned().collect::<Vec<_>>().join(", "));
        ExitCode::FAILURE
    }
}

fn report_step(step: &StepOutcome) {
    match step {
        StepOutcome::RanAgent { feature_id, role } => {
            println!("ran {role:?} agent on {feature_id}")
        }
        StepOutcome::CreatedPr { feature_id } => println!("opened PR for {feature_id}"),
        StepOutcome::Merged { feature_id } => println!("merged {feature_id}"),
        StepOutcome::EscalatedRetryLimit { feature_id } => {
            println!("escalated {feature_id}: retry limit exceeded")
        }
        StepOutcome::EscalatedSafeMode { feature_id } => {
            println!("escalated {feature_id}: merge blocked by safe mode")
        }
    }
}

fn cmd_arch(store: &Store, action: ArchCommand) -> ExitCode {
    let arch = architecture::ArchitectureStore::new(store);
    match action {
        ArchCommand::Import { kind, path } => {
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Error reading {}: {e}", path.display());
                    return ExitCode::FAILURE;
                }
            };
            let value: serde_json::Value = match serde_json::from_str(&content) {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("Error parsing {}: {e}", path.display());
                    return ExitCode::FAILURE;
                }
            };
            match arch.import(&kind, value) {
                Ok(()) => {
                    println!("Imported {kind} from {}", path.display());
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        ArchCommand::Export { kind, path } => match arch.export(&kind) {
            Ok(Some(value)) => {
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                match std::fs::write(&path, serde_json::to_string_pretty(&value).unwrap()) {
                    Ok(()) => {
                        println!("Exported {kind} to {}", path.display());
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("Error writing {}: {e}", path.display());
                        ExitCode::FAILURE
                    }
                }
            }
            Ok(None) => {
                eprintln!("No {kind} blob stored.");
                ExitCode::FAILURE
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

fn cmd_dashboard(store: Store, port: Option<u16>) -> ExitCode {
    let port = port
        .or_else(|| std::env::var("FRAMEWORK_PORT").ok().and_then(|p| p.parse().ok()))
        .unwrap_or(4190);
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error creating async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    let store = std::sync::Arc::new(store);
    match rt.block_on(server::serve(store, port)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_openspec(store: &Store, root: &std::path::Path, action: OpenspecCommand) -> ExitCode {
    let fm = FeatureModel::new(store);
    match action {
        OpenspecCommand::Install => run_openspec(&["init"]),
        OpenspecCommand::Refresh => run_openspec(&["update"]),
        OpenspecCommand::Status => run_openspec(&["list"]),
        OpenspecCommand::Import { change, all } => {
            if all {
                let changes = discover_changes(root);
                if changes.is_empty() {
                    println!("No active changes found under openspec/changes/.");
                }
                for change in changes {
                    match importer::import_change(root, &fm, &change) {
                        Ok(ids) => println!("{change}: {} feature(s)", ids.len()),
                        Err(e) => eprintln!("Error importing {change}: {e}"),
                    }
                }
                ExitCode::SUCCESS
            } else {
                let Some(change) = change else {
                    eprintln!("Error: specify a change or --all");
                    return ExitCode::FAILURE;
                };
                match importer::import_change(root, &fm, &change) {
                    Ok(ids) => {
                        println!("{change}: {} feature(s)", ids.len());
                        ExitCode::SUCCESS
                    }
                    Err(e) => {
                        eprintln!("Error: {e}");
                        ExitCode::FAILURE
                    }
                }
            }
        }
        OpenspecCommand::Archive { feature_id } => match importer::maybe_archive(root, &fm, &feature_id) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        },
        OpenspecCommand::Diff { change } => match importer::preview_change(root, &change) {
            Ok(groups) => {
                if groups.is_empty() {
                    println!("No task groups found for {change}.");
                }
                for g in groups {
                    println!(
                        "group {}: \"{}\" -> upserts ({}, {})",
                        g.task_group, g.title, g.upsert_key.0, g.upsert_key.1
                    );
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

fn discover_changes(root: &std::path::Path) -> Vec<String> {
    let dir = root.join("openspec/changes");
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect()
}

fn run_openspec(args: &[&str]) -> ExitCode {
    match std::process::Command::new("openspec").args(args).status() {
        Ok(status) if status.success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("openspec CLI not available: {e}");
            ExitCode::FAILURE
        }
    }
}

fn cmd_config(store: &Store, action: ConfigCommand) -> ExitCode {
    let config = Config::new(store);
    match action {
        ConfigCommand::Get { key } => match config.get(&key) {
            Ok(Some(value)) => {
                println!("{value}");
                ExitCode::SUCCESS
            }
            Ok(None) => {
                eprintln!("No value set for {key}");
                ExitCode::FAILURE
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        },
        ConfigCommand::Set { key, value } => match config.set(&key, &value) {
            Ok(()) => {
                println!("{key} = {value}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

fn fail(e: impl std::fmt::Display) -> ExitCode {
    eprintln!("Error: {e}");
    ExitCode::FAILURE
}
