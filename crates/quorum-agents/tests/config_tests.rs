//! Run-file parsing and dry runs through the scripted backend.

use std::path::PathBuf;

use coordination::ensemble::Coordinator;
use coordination::state::{FsArtifactStore, Phase};
use coordination::workspace::WorkspaceManager;
use quorum_agents::config::{BackendConfig, RunConfig};

fn demo_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("demos/dry-run.toml")
}

#[test]
fn test_demo_run_file_parses() {
    let config = RunConfig::load(&demo_path()).unwrap();

    assert_eq!(config.coordination.max_restarts, 1);
    assert_eq!(config.coordination.designated_agent.as_deref(), Some("planner"));
    assert_eq!(config.coordination.rate_limits["scripted"].max_starts, 2);
    assert_eq!(config.coordination.rate_limits["scripted"].window_secs, 1);

    let ids: Vec<_> = config.agents.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["planner", "checker", "skeptic"]);
    assert!(matches!(
        config.agents[0].backend,
        BackendConfig::Scripted { chunk_delay_ms: 50, .. }
    ));
}

#[test]
fn test_openai_defaults() {
    let config = RunConfig::from_toml(
        r#"
        [[agents]]
        id = "gpt"
        backend = { type = "openai_compatible", base_url = "http://localhost:8000/v1", model = "gpt-4o" }
        "#,
    )
    .unwrap();

    match &config.agents[0].backend {
        BackendConfig::OpenaiCompatible {
            temperature,
            max_tokens,
            timeout_secs,
            api_key_env,
            ..
        } => {
            assert_eq!(*max_tokens, 2048);
            assert_eq!(*timeout_secs, 300);
            assert!((temperature - 0.3).abs() < f32::EPSILON);
            assert!(api_key_env.is_none());
        }
        other => panic!("unexpected backend {other:?}"),
    }
    assert_eq!(config.agents[0].backend_key(), "gpt-4o");
}

#[test]
fn test_unknown_backend_type_rejected() {
    let err = RunConfig::from_toml(
        r#"
        [[agents]]
        id = "x"
        backend = { type = "carrier_pigeon" }
        "#,
    );
    assert!(err.is_err());
}

#[test]
fn test_missing_file() {
    assert!(RunConfig::load(&PathBuf::from("/definitely/not/here.toml")).is_err());
}

#[tokio::test]
async fn test_dry_run_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config = RunConfig::load(&demo_path())
        .unwrap()
        .with_state_dir(Some(dir.path().join("state")))
        .with_workspace_root(Some(dir.path().join("ws")));

    let store = FsArtifactStore::open(&config.storage.state_dir).unwrap().shared();
    let workspaces = WorkspaceManager::new(dir.path().join("ws")).shared();
    let agents = quorum_agents::build_agents(&config).unwrap();
    let coordinator = Coordinator::new(config.coordination.clone(), store.clone(), workspaces)
        .with_event_sink(store.clone());

    let outcome = coordinator.run("What is 6 * 7?", agents).await.unwrap();

    assert_eq!(outcome.phase, Phase::Completed);
    assert_eq!(outcome.winner.as_deref(), Some("planner"));
    assert_eq!(outcome.answer.as_deref(), Some("6 * 7 = 42"));
    assert_eq!(outcome.exit_code(), 0);
    assert!(store
        .final_answer_path(&outcome.session_id, "planner")
        .unwrap()
        .is_file());
}
