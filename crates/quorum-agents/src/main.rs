use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;
use coordination::ensemble::{Coordinator, SessionOutcome};
use coordination::events::{CoordinationEvent, EventFilter, FilteredStream};
use coordination::state::FsArtifactStore;
use coordination::workspace::WorkspaceManager;
use quorum_agents::config::RunConfig;
use tracing::{error, info, warn};

/// Exit code for configuration and validation failures.
const EXIT_INVALID: u8 = 1;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run file describing agents, limits and storage
    #[arg(long)]
    config: PathBuf,

    /// Task text
    #[arg(long, conflicts_with = "task_file")]
    task: Option<String>,

    /// Read the task from a file
    #[arg(long)]
    task_file: Option<PathBuf>,

    /// Directory for answers, status and event logs (overrides [storage].state_dir)
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Base directory for agent workspaces (overrides [storage].workspace_root)
    #[arg(long)]
    workspace_root: Option<PathBuf>,

    /// Do not log per-agent progress
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

impl Args {
    fn read_task(&self) -> Result<String> {
        match (&self.task, &self.task_file) {
            (Some(task), _) => Ok(task.clone()),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read task file {}", path.display())),
            (None, None) => bail!("one of --task or --task-file is required"),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_INVALID)
        }
    }
}

async fn run(args: Args) -> Result<u8> {
    let task = args.read_task()?;
    let config = RunConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?
        .with_state_dir(args.state_dir.clone())
        .with_workspace_root(args.workspace_root.clone())
        .with_env_overrides();

    let store = FsArtifactStore::open(&config.storage.state_dir)
        .with_context(|| format!("Failed to open state dir {}", config.storage.state_dir.display()))?
        .shared();
    let workspaces = config
        .storage
        .workspace_root
        .clone()
        .map(WorkspaceManager::new)
        .unwrap_or_else(WorkspaceManager::in_temp_dir)
        .shared();
    let agents = quorum_agents::build_agents(&config)?;

    info!(
        agents = agents.len(),
        state_dir = %config.storage.state_dir.display(),
        "Quorum starting"
    );

    let coordinator = Coordinator::new(config.coordination.clone(), store.clone(), workspaces)
        .with_event_sink(store.clone());

    let handle = match coordinator.launch(task, agents).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("{e}");
            return Ok(exit_byte(e.exit_code()));
        }
    };

    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling session");
            cancel.cancel();
        }
    });

    if !args.quiet {
        let filter = EventFilter::new().types(vec![
            "phase_changed",
            "answer_submitted",
            "vote_cast",
            "agent_failed",
            "votes_tallied",
            "restart_requested",
            "warning",
        ]);
        let stream = coordinator.events().subscribe_filtered(handle.id(), filter)?;
        tokio::spawn(log_progress(stream));
    }

    let outcome = handle.wait().await;
    report(&outcome, &store);
    Ok(exit_byte(outcome.exit_code()))
}

async fn log_progress(mut stream: FilteredStream) {
    while let Some(event) = stream.recv().await {
        let agent = event.agent_id.as_deref().unwrap_or("-");
        match &event.event {
            CoordinationEvent::PhaseChanged { to, round, .. } => {
                info!(round, "Phase: {}", to)
            }
            CoordinationEvent::AnswerSubmitted { answer, .. } => {
                info!(agent, chars = answer.chars().count(), "Answer submitted")
            }
            CoordinationEvent::VoteCast { target, .. } => info!(agent, "Voted for {}", target),
            CoordinationEvent::AgentFailed { error, .. } => warn!(agent, "Agent failed: {}", error),
            CoordinationEvent::VotesTallied { winner, .. } => {
                info!(winner = ?winner, "Votes tallied")
            }
            CoordinationEvent::RestartRequested { restart_count, .. } => {
                info!(restart_count, "Restart requested")
            }
            CoordinationEvent::Warning { message } => warn!("{}", message),
            _ => {}
        }
    }
}

fn report(outcome: &SessionOutcome, store: &FsArtifactStore) {
    let status = store
        .status_path(&outcome.session_id)
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    match (&outcome.answer, outcome.is_success()) {
        (Some(answer), true) => {
            info!(
                session_id = %outcome.session_id,
                winner = ?outcome.winner,
                rounds = outcome.rounds,
                status = %status,
                "Session completed"
            );
            println!("{answer}");
        }
        _ => {
            let reason = outcome
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no winner".to_string());
            error!(session_id = %outcome.session_id, status = %status, "Session failed: {}", reason);
            if outcome.error.as_ref().is_some_and(|e| e.is_timeout()) {
                warn!("Raise coordination_timeout_secs or session_timeout_secs for slower backends");
            }
        }
    }
}

fn exit_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(EXIT_INVALID)
}
