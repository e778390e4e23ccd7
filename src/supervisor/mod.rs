//! Supervisor (component D) — owns the registry of live Agent Processes,
//! enforces at-most-one-owner-per-session, and reaps idle processes.
//!
//! Grounded on `365a8d8f_clawde-io-apps__daemon-src-session-mod.rs`'s
//! `SessionManager`: `RwLock<HashMap<...>>` registries, atomic claim to
//! avoid TOCTOU races between two callers starting the same session, and a
//! graceful `drain()` that gives each process a bounded window to stop
//! cleanly before the server exits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::bus::EventBus;
use crate::model::{InputResponse, PermissionMode, ProcessState};
use crate::process::{AgentProcess, ProducerKind, QueuedMessage, SharedAgentProcess};

/// Default window a process gets to stop cleanly during graceful shutdown.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default idle-reap timeout: a process sitting in `Idle` this long with no
/// new activity is dropped from the registry. Never applied to a process
/// that is `Streaming` or `WaitingInput` — idle reaping exists to free
/// memory for processes nobody is using, not to interrupt work in flight.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub struct Supervisor {
    bus: EventBus,
    command: String,
    args: Vec<String>,
    idle_timeout: Duration,
    producer: ProducerKind,
    by_session: RwLock<HashMap<String, SharedAgentProcess>>,
    by_process: RwLock<HashMap<String, SharedAgentProcess>>,
}

/// Outcome of `Supervisor::resume`: either a fresh process was spawned to
/// own the session, or (spec.md §4.D) the session was already owned and the
/// message was queued onto the existing process instead of erroring.
pub enum ResumeOutcome {
    Spawned(SharedAgentProcess),
    Queued { position: usize },
}

/// Snapshot entry returned by `list()`; `last_activity_at` backs the
/// activity stream's worker-activity reporting (SPEC_FULL §3 supplement).
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSnapshot {
    pub process_id: String,
    pub session_id: String,
    pub state: ProcessState,
    pub mode: PermissionMode,
    pub last_activity_at: chrono::DateTime<chrono::Utc>,
}

impl Supervisor {
    pub fn new(
        bus: EventBus,
        command: String,
        args: Vec<String>,
        idle_timeout: Duration,
        producer: ProducerKind,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            command,
            args,
            idle_timeout,
            producer,
            by_session: RwLock::new(HashMap::new()),
            by_process: RwLock::new(HashMap::new()),
        })
    }

    /// Start a brand-new Agent Process for a session. Fails with a conflict
    /// if the session already has an owning process — at most one owner per
    /// session, enforced by checking-then-inserting under the same write
    /// lock so two concurrent `start()` calls can't both win.
    pub async fn start(&self, session_id: String, first_message: String) -> Result<SharedAgentProcess> {
        let mut by_session = self.by_session.write().await;
        if by_session.contains_key(&session_id) {
            anyhow::bail!("session {session_id} already has an owning process");
        }

        let process_id = uuid::Uuid::new_v4().to_string();
        let process = AgentProcess::new(
            process_id.clone(),
            session_id.clone(),
            self.command.clone(),
            self.args.clone(),
            None,
            self.bus.clone(),
            self.producer,
        );
        process.start(first_message).await?;

        by_session.insert(session_id, process.clone());
        self.by_process.write().await.insert(process_id, process.clone());
        Ok(process)
    }

    /// Resume a session. If the session already has an owning process (it
    /// was never external — another client, or this same client reconnecting
    /// while its process is still alive) the message is queued onto that
    /// process instead of erroring (spec.md §4.D: only an *external* session
    /// yields a conflict). Otherwise a fresh process is spawned, handing the
    /// AI CLI its own resume token so it can reconstruct conversational
    /// state.
    pub async fn resume(
        &self,
        session_id: String,
        resume_token: String,
        message: String,
        temp_id: String,
    ) -> Result<ResumeOutcome> {
        if let Some(process) = self.get_by_session(&session_id).await {
            let position = process
                .queue_message(QueuedMessage { temp_id, content: message })
                .await?;
            return Ok(ResumeOutcome::Queued { position });
        }

        let mut by_session = self.by_session.write().await;
        if let Some(process) = by_session.get(&session_id).cloned() {
            drop(by_session);
            let position = process
                .queue_message(QueuedMessage { temp_id, content: message })
                .await?;
            return Ok(ResumeOutcome::Queued { position });
        }

        let process_id = uuid::Uuid::new_v4().to_string();
        let process = AgentProcess::new(
            process_id.clone(),
            session_id.clone(),
            self.command.clone(),
            self.args.clone(),
            Some(resume_token),
            self.bus.clone(),
            self.producer,
        );
        process.start(message).await?;

        by_session.insert(session_id, process.clone());
        self.by_process.write().await.insert(process_id, process.clone());
        Ok(ResumeOutcome::Spawned(process))
    }

    pub async fn queue(&self, session_id: &str, msg: QueuedMessage) -> Result<usize> {
        let process = self.get_by_session(session_id).await.context("no process for session")?;
        process.queue_message(msg).await
    }

    pub async fn abort(&self, process_id: &str) -> Result<()> {
        let process = self.get_by_process(process_id).await.context("unknown process")?;
        process.abort().await
    }

    pub async fn respond_to_input(&self, process_id: &str, response: InputResponse) -> Result<()> {
        let process = self.get_by_process(process_id).await.context("unknown process")?;
        process.handle_tool_approval(response).await
    }

    pub async fn set_permission_mode(&self, process_id: &str, mode: PermissionMode) -> Result<u32> {
        let process = self.get_by_process(process_id).await.context("unknown process")?;
        Ok(process.set_permission_mode(mode).await)
    }

    pub async fn set_hold(&self, process_id: &str, hold: bool) -> Result<()> {
        let process = self.get_by_process(process_id).await.context("unknown process")?;
        process.set_hold(hold);
        Ok(())
    }

    pub async fn get_by_session(&self, session_id: &str) -> Option<SharedAgentProcess> {
        self.by_session.read().await.get(session_id).cloned()
    }

    pub async fn get_by_process(&self, process_id: &str) -> Option<SharedAgentProcess> {
        self.by_process.read().await.get(process_id).cloned()
    }

    pub async fn list(&self) -> Vec<ProcessSnapshot> {
        let by_process = self.by_process.read().await;
        let mut out = Vec::with_capacity(by_process.len());
        for process in by_process.values() {
            out.push(ProcessSnapshot {
                process_id: process.process_id.clone(),
                session_id: process.session_id.clone(),
                state: process.state().await,
                mode: process.permission_mode().await,
                last_activity_at: process.last_activity().await,
            });
        }
        out
    }

    pub async fn active_count(&self) -> usize {
        let by_process = self.by_process.read().await;
        let mut count = 0;
        for process in by_process.values() {
            if matches!(
                process.state().await,
                ProcessState::Streaming | ProcessState::WaitingInput
            ) {
                count += 1;
            }
        }
        count
    }

    /// Drop the registry entry for a process — called once its state has
    /// settled into `Idle`/`Aborted` and nothing references it anymore by
    /// session id, so a later `start()` for the same session can succeed.
    async fn forget(&self, process_id: &str, session_id: &str) {
        self.by_process.write().await.remove(process_id);
        self.by_session.write().await.remove(session_id);
    }

    /// Background idle-reaping pass: never touches a process that is
    /// streaming or waiting on operator input, only ones that have been
    /// sitting `Idle` past the configured timeout.
    pub async fn reap_idle(&self) {
        let snapshot = self.list().await;
        let now = chrono::Utc::now();
        for entry in snapshot {
            if entry.state != ProcessState::Idle {
                continue;
            }
            let elapsed = now.signed_duration_since(entry.last_activity_at);
            if elapsed
                .to_std()
                .map(|d| d >= self.idle_timeout)
                .unwrap_or(false)
            {
                self.forget(&entry.process_id, &entry.session_id).await;
            }
        }
    }

    /// Graceful shutdown: give every live process up to `DRAIN_TIMEOUT` to
    /// stop cleanly, logging (not failing) on timeout so the rest of
    /// shutdown still proceeds.
    pub async fn drain(&self) {
        let processes: Vec<SharedAgentProcess> = self.by_process.read().await.values().cloned().collect();
        for process in processes {
            let process_id = process.process_id.clone();
            match timeout(DRAIN_TIMEOUT, process.abort()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(process_id, error = %e, "error aborting process during drain"),
                Err(_) => tracing::warn!(process_id, "process did not stop within drain timeout"),
            }
        }
    }
}

/// Spawn the background idle-reap loop; runs until the server shuts down.
pub fn spawn_idle_reaper(supervisor: Arc<Supervisor>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            supervisor.reap_idle().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> String {
        std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(name)
            .to_string_lossy()
            .into_owned()
    }

    fn supervisor_with(agent_script: &str, idle_timeout: Duration) -> Arc<Supervisor> {
        Supervisor::new(
            EventBus::new(16),
            fixture(agent_script),
            Vec::new(),
            idle_timeout,
            ProducerKind::Mock,
        )
    }

    // Property 1 — at most one Agent Process per session: a second start()
    // for a session that already has an owning process is rejected, not
    // silently replaced.
    #[tokio::test]
    async fn starting_same_session_twice_conflicts() {
        let supervisor = supervisor_with("mock_agent_slow.sh", DEFAULT_IDLE_TIMEOUT);

        supervisor
            .start("sess-1".to_string(), "hello".to_string())
            .await
            .expect("first start succeeds");

        let second = supervisor.start("sess-1".to_string(), "hello again".to_string()).await;
        assert!(second.is_err(), "second start on the same session must conflict");

        // Clean up the still-running process so the test doesn't leak it.
        supervisor.drain().await;
    }

    #[tokio::test]
    async fn resume_after_forgetting_a_session_succeeds() {
        let supervisor = supervisor_with("mock_agent_cli.sh", Duration::from_millis(0));

        let process = supervisor
            .start("sess-1".to_string(), "hello".to_string())
            .await
            .unwrap();
        let process_id = process.process_id.clone();

        // Let the mock CLI run to completion and settle into Idle.
        for _ in 0..100 {
            if process.state().await == ProcessState::Idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(process.state().await, ProcessState::Idle);

        supervisor.reap_idle().await;
        assert!(supervisor.get_by_session("sess-1").await.is_none());
        assert!(supervisor.get_by_process(&process_id).await.is_none());

        // Now that the session has been forgotten, starting it again (as
        // `resume()` would after a client reconnect) must succeed.
        let outcome = supervisor
            .resume(
                "sess-1".to_string(),
                "resume-token".to_string(),
                "hi again".to_string(),
                "t1".to_string(),
            )
            .await
            .expect("resume succeeds once the prior process is forgotten");
        assert!(matches!(outcome, ResumeOutcome::Spawned(_)));
    }

    // spec.md §4.D — resuming a session that's still owned queues the
    // message instead of erroring; only an external session is a conflict.
    #[tokio::test]
    async fn resume_on_an_owned_session_queues_instead_of_erroring() {
        let supervisor = supervisor_with("mock_agent_slow.sh", DEFAULT_IDLE_TIMEOUT);

        supervisor
            .start("sess-1".to_string(), "hello".to_string())
            .await
            .unwrap();

        let outcome = supervisor
            .resume(
                "sess-1".to_string(),
                "resume-token".to_string(),
                "another message".to_string(),
                "t1".to_string(),
            )
            .await
            .expect("resume on an owned session queues rather than conflicts");
        assert!(matches!(outcome, ResumeOutcome::Queued { position: 1 }));

        supervisor.drain().await;
    }

    // Idle reaping must never touch a process that is Streaming or
    // WaitingInput, even past the configured timeout.
    #[tokio::test]
    async fn reap_idle_never_touches_a_streaming_process() {
        let supervisor = supervisor_with("mock_agent_slow.sh", Duration::from_millis(0));

        let process = supervisor
            .start("sess-1".to_string(), "hello".to_string())
            .await
            .unwrap();
        assert_eq!(process.state().await, ProcessState::Streaming);

        supervisor.reap_idle().await;
        assert!(
            supervisor.get_by_session("sess-1").await.is_some(),
            "a streaming process must survive idle reaping regardless of timeout"
        );

        supervisor.drain().await;
    }

    #[tokio::test]
    async fn active_count_reflects_streaming_and_waiting_input_only() {
        let supervisor = supervisor_with("mock_agent_slow.sh", DEFAULT_IDLE_TIMEOUT);
        assert_eq!(supervisor.active_count().await, 0);

        supervisor
            .start("sess-1".to_string(), "hello".to_string())
            .await
            .unwrap();
        assert_eq!(supervisor.active_count().await, 1);

        supervisor.drain().await;
    }

    #[tokio::test]
    async fn drain_aborts_every_tracked_process() {
        let supervisor = supervisor_with("mock_agent_slow.sh", DEFAULT_IDLE_TIMEOUT);
        let process = supervisor
            .start("sess-1".to_string(), "hello".to_string())
            .await
            .unwrap();

        supervisor.drain().await;
        assert_eq!(process.state().await, ProcessState::Aborted);
    }
}
