//! agentd — local control-plane server multiplexing AI-CLI agent processes.
//!
//! Split into a library (this file) plus a thin `main.rs` binary so that
//! `tests/` integration tests can drive the real HTTP surface end to end,
//! the same separation `agtrace` uses in the retrieval pack.
//!
//! Architecture:
//! - Event Bus: process-wide pub/sub fan-out ([`bus`])
//! - Transcript Store: read-only access + file-watching over on-disk
//!   per-session transcripts ([`transcript`])
//! - Agent Process / Supervisor: owns and routes live child CLI invocations
//!   ([`process`], [`supervisor`])
//! - Session View: composed read model clients actually consume ([`session_view`])
//! - Local Transport: HTTP + SSE + `/ws` frame transport ([`http`], [`frame`])
//! - Auth & Crypto: cookie auth and relay zero-knowledge handshake ([`auth`])

pub mod auth;
pub mod bus;
pub mod cli;
pub mod config;
pub mod error;
pub mod frame;
pub mod http;
pub mod logging;
pub mod model;
pub mod process;
pub mod push;
pub mod relay;
pub mod session_view;
pub mod settings;
pub mod supervisor;
pub mod transcript;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use config::Config;

/// Background reap interval: how often the Supervisor's idle-reap pass
/// runs. Independent of `idle_timeout`, which decides how long a process
/// must have been idle before a given pass reaps it.
pub const IDLE_REAP_INTERVAL: Duration = Duration::from_secs(30);

/// How often a `heartbeat` event is published on the bus, keeping every SSE
/// connection and frame-transport subscription alive (spec.md §4.F/§6).
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Everything `main()` (or a test harness) needs to run one agentd instance:
/// the bound HTTP state plus the background tasks/handles it depends on.
/// Dropping this stops the watcher/idle-reaper/heartbeat background tasks.
pub struct Runtime {
    pub config: Config,
    pub state: http::AppState,
    pub supervisor: Arc<supervisor::Supervisor>,
    _watch_handle: transcript::WatchHandle,
    _idle_reaper: tokio::task::JoinHandle<()>,
    _heartbeat_task: tokio::task::JoinHandle<()>,
    _relay_task: Option<tokio::task::JoinHandle<()>>,
}

/// Build one agentd runtime from a resolved `Config`: creates the projects/data
/// directories, wires the Event Bus through the Transcript Store/Supervisor/
/// Session View, and loads persisted auth/settings state. Does not bind the
/// HTTP listener — call [`http::serve`] with the returned `state` for that.
pub async fn build_runtime(config: Config) -> Result<Runtime> {
    tokio::fs::create_dir_all(&config.projects_dir)
        .await
        .with_context(|| format!("creating projects dir {:?}", config.projects_dir))?;
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("creating data dir {:?}", config.data_dir))?;

    let event_bus = bus::EventBus::new(config.event_queue_capacity);

    let transcript = Arc::new(transcript::TranscriptStore::new(config.projects_dir.clone()));
    let watch_handle = transcript
        .watch(event_bus.clone(), config.watch_debounce.as_millis() as u64)
        .context("starting transcript file watcher")?;

    let producer = if config.agent_is_mock {
        process::ProducerKind::Mock
    } else {
        process::ProducerKind::Authoritative
    };
    let supervisor = supervisor::Supervisor::new(
        event_bus.clone(),
        config.agent_command.clone(),
        config.agent_args.clone(),
        config.idle_timeout,
        producer,
    );
    let idle_reaper = supervisor::spawn_idle_reaper(supervisor.clone(), IDLE_REAP_INTERVAL);

    let settings = settings::SettingsStore::load(&config.data_dir)
        .await
        .context("loading session settings")?;
    let push = push::PushStore::new(&config.data_dir);

    let session_view = Arc::new(
        session_view::SessionView::new(transcript.clone(), supervisor.clone(), settings.clone())
            .with_external_threshold(config.external_threshold),
    );

    let auth = auth::AuthState::load(&config.data_dir)
        .await
        .context("loading auth state")?;

    let heartbeat_bus = event_bus.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            heartbeat_bus.publish(bus::Event::Heartbeat).await;
        }
    });

    let uploads_dir = config.data_dir.join("uploads");
    tokio::fs::create_dir_all(&uploads_dir)
        .await
        .with_context(|| format!("creating uploads dir {uploads_dir:?}"))?;

    let state = http::AppState {
        bus: event_bus,
        transcript,
        supervisor: supervisor.clone(),
        session_view,
        settings,
        push,
        auth,
        started_at: Instant::now(),
        uploads_dir,
        max_upload_bytes: config.max_upload_bytes,
    };

    // The relay client runs independently of the Local Transport listener:
    // it dials out rather than accepting connections, so it starts as soon
    // as the state it needs to serve requests against exists.
    let relay_task = config.relay_url.clone().map(|relay_url| {
        let relay_state = state.clone();
        tokio::spawn(async move { relay::run(relay_url, relay_state).await })
    });

    Ok(Runtime {
        config,
        state,
        supervisor,
        _watch_handle: watch_handle,
        _idle_reaper: idle_reaper,
        _heartbeat_task: heartbeat_task,
        _relay_task: relay_task,
    })
}
