//! Agent Process (component C) — owns one child AI-CLI subprocess: its
//! stdin queue, its state machine, its tool-approval one-shot channel, and
//! the translation of its stdout into transcript-shaped events.
//!
//! Grounded on `84c4b4ca_clawde-io-apps__daemon-src-session-claude.rs`'s
//! `ClaudeCodeRunner`: tagged stdout event parsing, atomic pause/cancel
//! flags, Unix SIGSTOP/SIGCONT pause/resume, and the "exited without a
//! terminal event and wasn't cancelled -> mark aborted" safety net. Unlike
//! that reference (which auto-approves every tool call because it always
//! runs with permissions bypassed), this Agent Process blocks on operator
//! input in `default` mode per SPEC_FULL §4.C's policy table.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::bus::{Event, EventBus};
use crate::model::{InputRequest, InputResponse, PermissionMode, ProcessState};

/// One line of the AI CLI's `stream-json`-style stdout protocol. The
/// `Unknown` arm keeps this forward compatible with tool versions that add
/// event kinds we don't understand yet (same rule as `TranscriptRecord`).
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CliEvent {
    Assistant {
        message: serde_json::Value,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
    },
    Result {
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

/// Pending operator decision keyed by the one-shot channel waiting on it.
struct PendingApproval {
    tool_use_id: String,
    tool_name: String,
    input: serde_json::Value,
    responder: oneshot::Sender<InputResponse>,
}

/// Dispatches a resolved permission-mode policy for a tool call: whether to
/// ask the operator, or decide immediately. Mirrors SPEC_FULL §4.C's policy
/// table for default/acceptEdits/bypassPermissions/plan.
fn policy_for(mode: PermissionMode, tool_name: &str) -> Policy {
    let is_edit = matches!(tool_name, "edit" | "write" | "multi_edit" | "apply_patch");
    match mode {
        PermissionMode::Default => Policy::AskOperator,
        PermissionMode::AcceptEdits if is_edit => Policy::AutoApprove,
        PermissionMode::AcceptEdits => Policy::AskOperator,
        PermissionMode::BypassPermissions => Policy::AutoApprove,
        PermissionMode::Plan => Policy::AutoDeny,
    }
}

enum Policy {
    AskOperator,
    AutoApprove,
    AutoDeny,
}

/// Queued user message awaiting delivery to the subprocess's stdin. Keyed by
/// a client-supplied `temp_id` so retried sends are idempotent.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub temp_id: String,
    pub content: String,
}

/// Whether this process's backing CLI is the authoritative writer of the
/// session's transcript file, or a test/mock fixture that never writes one.
///
/// spec.md §4.C: user-input messages are never mirrored into in-memory
/// history for the real CLI, since its own transcript writes will surface
/// them on the next disk read; a mock producer writes nothing to disk, so
/// its user-input messages must be mirrored into `live_messages` or they're
/// lost entirely, and its `result` event must not clear that buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerKind {
    Authoritative,
    Mock,
}

pub struct AgentProcess {
    pub process_id: String,
    pub session_id: String,
    command: String,
    args: Vec<String>,
    resume_token: Option<String>,
    bus: EventBus,
    producer: ProducerKind,

    state: RwLock<ProcessState>,
    mode: RwLock<PermissionMode>,
    mode_version: AtomicU32,
    hold: AtomicBool,
    cancelled: Arc<AtomicBool>,
    child_pid: Arc<AtomicU32>,
    current_child: Arc<Mutex<Option<Child>>>,
    pending: Mutex<Option<PendingApproval>>,
    /// Queue position assigned to each `temp_id` seen so far, so a retried
    /// send with the same id returns its original position instead of
    /// being assigned a new one.
    positions: Mutex<std::collections::HashMap<String, usize>>,
    next_position: AtomicUsize,
    last_activity: RwLock<chrono::DateTime<chrono::Utc>>,
    /// Assistant content this process has emitted but the backing CLI
    /// hasn't flushed to the transcript file yet. The Session View overlays
    /// these onto the disk-backed projection (disk wins once the same id
    /// shows up there), per spec.md §4.E's "live-only additions" rule.
    /// Cleared once a `result` record lands, since every live message has
    /// had a chance to reach disk by then.
    live_messages: RwLock<Vec<crate::model::Message>>,
}

impl AgentProcess {
    pub fn new(
        process_id: String,
        session_id: String,
        command: String,
        args: Vec<String>,
        resume_token: Option<String>,
        bus: EventBus,
        producer: ProducerKind,
    ) -> Arc<Self> {
        Arc::new(Self {
            process_id,
            session_id,
            command,
            args,
            resume_token,
            bus,
            producer,
            state: RwLock::new(ProcessState::Starting),
            mode: RwLock::new(PermissionMode::Default),
            mode_version: AtomicU32::new(0),
            hold: AtomicBool::new(false),
            cancelled: Arc::new(AtomicBool::new(false)),
            child_pid: Arc::new(AtomicU32::new(0)),
            current_child: Arc::new(Mutex::new(None)),
            pending: Mutex::new(None),
            positions: Mutex::new(std::collections::HashMap::new()),
            next_position: AtomicUsize::new(0),
            last_activity: RwLock::new(chrono::Utc::now()),
            live_messages: RwLock::new(Vec::new()),
        })
    }

    /// Push a user-input message into the live-message overlay. Only called
    /// for a `Mock` producer (spec.md §4.C) — the real CLI's own transcript
    /// writes already surface user input on the next disk read, so mirroring
    /// it here too would duplicate it once disk and live are merged.
    async fn mirror_user_message(&self, content: String) {
        let id = format!("live-user-{}", self.next_position.load(Ordering::SeqCst));
        self.live_messages.write().await.push(crate::model::Message {
            id,
            role: crate::model::MessageRole::User,
            content: serde_json::Value::String(content),
            timestamp: chrono::Utc::now(),
            source: crate::model::MessageSource::Live,
            streaming: false,
            parent_session_id: None,
        });
    }

    /// Assistant content not yet observed on disk, for the Session View to
    /// overlay onto its transcript-backed projection.
    pub async fn live_messages(&self) -> Vec<crate::model::Message> {
        self.live_messages.read().await.clone()
    }

    pub async fn state(&self) -> ProcessState {
        *self.state.read().await
    }

    pub async fn last_activity(&self) -> chrono::DateTime<chrono::Utc> {
        *self.last_activity.read().await
    }

    async fn set_state(&self, state: ProcessState) {
        *self.state.write().await = state;
        *self.last_activity.write().await = chrono::Utc::now();
        self.bus
            .publish(Event::ProcessStateChanged {
                process_id: self.process_id.clone(),
                session_id: self.session_id.clone(),
                state,
            })
            .await;
    }

    /// Spawn the subprocess and start its event loop in the background.
    /// `queueMessage`'s first call to a fresh `AgentProcess` implicitly
    /// starts it; `resume()` at the Supervisor layer calls this with a
    /// `resume_token` carried from construction.
    pub async fn start(self: &Arc<Self>, first_message: String) -> Result<()> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg("--output-format")
            .arg("stream-json")
            .arg("-p")
            .arg(&first_message)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(token) = &self.resume_token {
            cmd.arg("--resume").arg(token);
        }

        let mut child = cmd.spawn().context("spawning agent CLI subprocess")?;
        if let Some(pid) = child.id() {
            self.child_pid.store(pid, Ordering::SeqCst);
        }

        let stdout = child
            .stdout
            .take()
            .context("agent CLI subprocess missing stdout pipe")?;

        *self.current_child.lock().await = Some(child);
        self.set_state(ProcessState::Streaming).await;

        if self.producer == ProducerKind::Mock {
            self.mirror_user_message(first_message).await;
        }

        let this = self.clone();
        tokio::spawn(async move {
            this.event_loop(stdout).await;
        });

        Ok(())
    }

    /// Queue a follow-up message for an already-running process. Idempotent
    /// on `temp_id`: a retried send with the same id returns the same queue
    /// position instead of being sent (or counted) twice. Returns the
    /// 1-based position assigned to this message (spec.md §4.C).
    pub async fn queue_message(&self, msg: QueuedMessage) -> Result<usize> {
        let position = {
            let mut positions = self.positions.lock().await;
            if let Some(&existing) = positions.get(&msg.temp_id) {
                return Ok(existing);
            }
            let position = self.next_position.fetch_add(1, Ordering::SeqCst) + 1;
            positions.insert(msg.temp_id.clone(), position);
            position
        };

        if matches!(self.state().await, ProcessState::Aborted) {
            anyhow::bail!("cannot queue a message on an aborted process");
        }

        let mut guard = self.current_child.lock().await;
        let child = guard.as_mut().context("process has no live subprocess")?;
        let stdin = child
            .stdin
            .as_mut()
            .context("agent CLI subprocess missing stdin pipe")?;
        stdin
            .write_all(format!("{}\n", msg.content).as_bytes())
            .await
            .context("writing to agent CLI stdin")?;
        drop(guard);

        if self.producer == ProducerKind::Mock {
            self.mirror_user_message(msg.content).await;
        }

        Ok(position)
    }

    pub async fn set_permission_mode(&self, mode: PermissionMode) -> u32 {
        *self.mode.write().await = mode;
        let version = self.mode_version.fetch_add(1, Ordering::SeqCst) + 1;
        self.bus
            .publish(Event::ModeChanged {
                session_id: self.session_id.clone(),
                mode,
                mode_version: version as u64,
            })
            .await;
        version
    }

    pub async fn permission_mode(&self) -> PermissionMode {
        *self.mode.read().await
    }

    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    pub fn is_held(&self) -> bool {
        self.hold.load(Ordering::SeqCst)
    }

    /// Resolve the currently pending tool-approval request, if any.
    pub async fn handle_tool_approval(&self, response: InputResponse) -> Result<()> {
        let pending = self.pending.lock().await.take();
        match pending {
            Some(p) => {
                let _ = p.responder.send(response);
                Ok(())
            }
            None => anyhow::bail!("no pending tool approval for this process"),
        }
    }

    pub async fn pending_input_request(&self) -> Option<InputRequest> {
        let pending = self.pending.lock().await;
        pending.as_ref().map(|p| InputRequest {
            tool_use_id: p.tool_use_id.clone(),
            tool_name: p.tool_name.clone(),
            input: p.input.clone(),
            requested_at: chrono::Utc::now(),
        })
    }

    /// Request abort: marks cancelled first (so the event loop's safety net
    /// doesn't race it into `Aborted` a second time via a different path),
    /// wakes the process if it's paused so a kill signal can land, then
    /// kills and reaps the child so no zombie is left behind.
    pub async fn abort(&self) -> Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);

        #[cfg(unix)]
        {
            let pid = self.child_pid.load(Ordering::SeqCst);
            if pid != 0 {
                unsafe {
                    libc::kill(pid as i32, libc::SIGCONT);
                }
            }
        }

        let mut guard = self.current_child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.kill().await;
            let _ = child.wait().await;
        }
        *guard = None;

        self.set_state(ProcessState::Aborted).await;
        Ok(())
    }

    #[cfg(unix)]
    pub fn pause(&self) {
        let pid = self.child_pid.load(Ordering::SeqCst);
        if pid != 0 {
            unsafe {
                libc::kill(pid as i32, libc::SIGSTOP);
            }
        }
    }

    #[cfg(unix)]
    pub fn resume_signal(&self) {
        let pid = self.child_pid.load(Ordering::SeqCst);
        if pid != 0 {
            unsafe {
                libc::kill(pid as i32, libc::SIGCONT);
            }
        }
    }

    async fn event_loop(self: Arc<Self>, stdout: tokio::process::ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        let mut saw_result = false;

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let event: CliEvent = match serde_json::from_str(&line) {
                        Ok(e) => e,
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping malformed agent CLI stdout line");
                            continue;
                        }
                    };
                    self.handle_cli_event(event, &mut saw_result).await;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "error reading agent CLI stdout");
                    break;
                }
            }
        }

        let mut guard = self.current_child.lock().await;
        if let Some(child) = guard.as_mut() {
            let _ = child.wait().await;
        }
        *guard = None;
        drop(guard);

        // Safety net: the subprocess exited without ever emitting a
        // terminal `Result` event, and nobody explicitly cancelled it.
        // Treat this the same as a crash.
        if !saw_result && !self.cancelled.load(Ordering::SeqCst) {
            self.set_state(ProcessState::Aborted).await;
        } else if !matches!(self.state().await, ProcessState::Aborted) {
            self.set_state(ProcessState::Idle).await;
        }
    }

    async fn handle_cli_event(&self, event: CliEvent, saw_result: &mut bool) {
        match event {
            CliEvent::Assistant { message } => {
                let message_id = message
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();

                // Buffered until a `result` record confirms the CLI has
                // finished flushing this turn to disk; the Session View
                // dedups against the disk projection by id once it lands
                // there, so this never double-counts.
                self.live_messages.write().await.push(crate::model::Message {
                    id: message_id.clone(),
                    role: crate::model::MessageRole::Assistant,
                    content: message
                        .get("content")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null),
                    timestamp: chrono::Utc::now(),
                    source: crate::model::MessageSource::Live,
                    streaming: true,
                    parent_session_id: None,
                });

                self.bus
                    .publish(Event::Message {
                        session_id: self.session_id.clone(),
                        message_id,
                    })
                    .await;
            }
            CliEvent::ToolUse { id, name, input } => {
                self.dispatch_tool_use(id, name, input).await;
            }
            CliEvent::ToolResult { .. } => {
                self.bus
                    .publish(Event::WorkerActivity {
                        process_id: self.process_id.clone(),
                        active: true,
                    })
                    .await;
            }
            CliEvent::Result { is_error } => {
                *saw_result = true;
                // Every live message has now had its chance to reach disk
                // via the CLI's own transcript writes; stop overlaying them
                // so a resumed/re-read session doesn't see stale duplicates
                // if the id scheme ever drifts between the two paths. A
                // mock producer never writes a transcript file, so nothing
                // has "reached disk" — clearing here would just lose history.
                if self.producer == ProducerKind::Authoritative {
                    self.live_messages.write().await.clear();
                }
                self.set_state(if is_error {
                    ProcessState::Aborted
                } else {
                    ProcessState::Idle
                })
                .await;
            }
            CliEvent::Unknown => {}
        }
    }

    async fn dispatch_tool_use(&self, tool_use_id: String, tool_name: String, input: serde_json::Value) {
        let mode = self.permission_mode().await;
        match policy_for(mode, &tool_name) {
            Policy::AutoApprove => {
                // Approved without blocking; nothing further to do here —
                // the subprocess itself executes the tool and reports the
                // result via a subsequent ToolResult event.
            }
            Policy::AutoDeny => {
                // Plan mode: tool calls are never executed. We still do not
                // block the process waiting on input; the subprocess is
                // expected to receive the denial out-of-band via its own
                // plan-mode handling of stdin, which is opaque to us.
            }
            Policy::AskOperator => {
                let (tx, rx) = oneshot::channel();
                *self.pending.lock().await = Some(PendingApproval {
                    tool_use_id: tool_use_id.clone(),
                    tool_name: tool_name.clone(),
                    input,
                    responder: tx,
                });
                self.set_state(ProcessState::WaitingInput).await;
                // Block this event loop task (not the whole server) until
                // the operator responds via handle_tool_approval().
                let _ = rx.await;
                self.set_state(ProcessState::Streaming).await;
            }
        }
    }
}

pub type SharedAgentProcess = Arc<AgentProcess>;

#[cfg(test)]
mod tests {
    use super::*;

    // S4 — mode policy table (spec.md §8).
    #[test]
    fn plan_mode_denies_every_tool() {
        assert!(matches!(policy_for(PermissionMode::Plan, "edit"), Policy::AutoDeny));
        assert!(matches!(policy_for(PermissionMode::Plan, "bash"), Policy::AutoDeny));
    }

    #[test]
    fn bypass_permissions_allows_every_tool() {
        assert!(matches!(
            policy_for(PermissionMode::BypassPermissions, "edit"),
            Policy::AutoApprove
        ));
        assert!(matches!(
            policy_for(PermissionMode::BypassPermissions, "bash"),
            Policy::AutoApprove
        ));
    }

    #[test]
    fn accept_edits_auto_approves_edit_like_tools_only() {
        assert!(matches!(
            policy_for(PermissionMode::AcceptEdits, "edit"),
            Policy::AutoApprove
        ));
        assert!(matches!(
            policy_for(PermissionMode::AcceptEdits, "write"),
            Policy::AutoApprove
        ));
        assert!(matches!(
            policy_for(PermissionMode::AcceptEdits, "bash"),
            Policy::AskOperator
        ));
    }

    #[test]
    fn default_mode_always_asks_the_operator() {
        assert!(matches!(policy_for(PermissionMode::Default, "edit"), Policy::AskOperator));
        assert!(matches!(policy_for(PermissionMode::Default, "bash"), Policy::AskOperator));
    }

    fn test_process() -> Arc<AgentProcess> {
        AgentProcess::new(
            "proc-1".to_string(),
            "sess-1".to_string(),
            "true".to_string(),
            Vec::new(),
            None,
            EventBus::new(16),
            ProducerKind::Mock,
        )
    }

    // S3 — input request & approval: a default-mode tool call blocks the
    // event loop in `WaitingInput` until `handle_tool_approval` resolves it,
    // then the process returns to `Streaming`.
    #[tokio::test]
    async fn tool_approval_blocks_until_responded_then_resumes_streaming() {
        let process = test_process();
        *process.state.write().await = ProcessState::Streaming;

        let dispatcher = process.clone();
        let handle = tokio::spawn(async move {
            dispatcher
                .dispatch_tool_use("tool-1".to_string(), "bash".to_string(), serde_json::json!({}))
                .await;
        });

        // Give the dispatch task a chance to register the pending approval
        // and flip to WaitingInput before we respond.
        for _ in 0..50 {
            if process.state().await == ProcessState::WaitingInput {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(process.state().await, ProcessState::WaitingInput);

        let pending = process.pending_input_request().await.unwrap();
        assert_eq!(pending.tool_use_id, "tool-1");
        assert_eq!(pending.tool_name, "bash");

        process
            .handle_tool_approval(InputResponse::Approve)
            .await
            .unwrap();
        handle.await.unwrap();

        assert_eq!(process.state().await, ProcessState::Streaming);
        assert!(process.pending_input_request().await.is_none());
    }

    #[tokio::test]
    async fn responding_with_no_pending_approval_errors() {
        let process = test_process();
        let result = process.handle_tool_approval(InputResponse::Approve).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn queue_message_is_idempotent_by_temp_id() {
        let process = test_process();
        // No live subprocess is wired up in this unit test, but idempotency
        // is checked before the stdin write is attempted, so the second call
        // with the same temp_id must short-circuit as Ok(()) rather than
        // failing on the missing child.
        let first = process
            .queue_message(QueuedMessage {
                temp_id: "t1".to_string(),
                content: "hello".to_string(),
            })
            .await;
        assert!(first.is_err(), "first call reaches the missing-subprocess check");

        let second = process
            .queue_message(QueuedMessage {
                temp_id: "t1".to_string(),
                content: "hello again".to_string(),
            })
            .await;
        assert!(second.is_ok(), "duplicate temp_id short-circuits before touching stdin");
    }
}
