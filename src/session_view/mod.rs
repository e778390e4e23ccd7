//! Session View (component E) — composes the Transcript Store and the
//! Supervisor into the merged view clients actually consume: metadata,
//! deduplicated messages, derived status, and any pending input request.
//!
//! Grounded on `365a8d8f_clawde-io-apps__daemon-src-session-mod.rs`'s
//! `SessionView`/`MessageView` projection types — same idea of never
//! exposing the raw registry or raw transcript directly, always through a
//! composed read model.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::model::{derive_title, InputRequest, Message, SessionStatus, SessionSummary};
use crate::settings::SettingsStore;
use crate::supervisor::Supervisor;
use crate::transcript::TranscriptStore;

/// Default external-activity threshold, overridden by
/// `Config::external_threshold` (`AGENTD_EXTERNAL_THRESHOLD_SECS`); kept
/// here only as the value `SessionView::new` falls back to if a caller
/// skips `with_external_threshold`.
pub const DEFAULT_EXTERNAL_ACTIVITY_THRESHOLD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub messages: Vec<Message>,
    pub pending_input_request: Option<InputRequest>,
}

pub struct SessionView {
    transcript: Arc<TranscriptStore>,
    supervisor: Arc<Supervisor>,
    settings: SettingsStore,
    external_threshold: Duration,
}

impl SessionView {
    pub fn new(transcript: Arc<TranscriptStore>, supervisor: Arc<Supervisor>, settings: SettingsStore) -> Self {
        Self {
            transcript,
            supervisor,
            settings,
            external_threshold: DEFAULT_EXTERNAL_ACTIVITY_THRESHOLD,
        }
    }

    pub fn with_external_threshold(mut self, threshold: Duration) -> Self {
        self.external_threshold = threshold;
        self
    }

    /// Build the composed view of one session, merging on-disk transcript
    /// records with anything the live process hasn't flushed to disk yet.
    /// Disk wins ties: deduplication is by message id and a disk-sourced
    /// message for an id already seen from the process is discarded.
    pub async fn snapshot(
        &self,
        project_id: &str,
        session_id: &str,
        after_message_id: Option<&str>,
    ) -> Result<SessionSnapshot> {
        let mut messages = self
            .transcript
            .read_session(project_id, session_id, after_message_id)?;

        let owner = self.supervisor.get_by_session(session_id).await;

        let status = self.derive_status(project_id, session_id, owner.is_some()).await;

        let pending_input_request = match &owner {
            Some(process) => process.pending_input_request().await,
            None => None,
        };

        // Overlay the owning process's in-memory content it hasn't flushed
        // to disk yet; disk wins for any id that shows up in both (spec.md
        // §4.E step 3).
        if let Some(process) = &owner {
            let seen: std::collections::HashSet<&str> = messages.iter().map(|m| m.id.as_str()).collect();
            for live in process.live_messages().await {
                if !seen.contains(live.id.as_str()) {
                    messages.push(live);
                }
            }
        }

        Ok(SessionSnapshot {
            session_id: session_id.to_string(),
            status,
            messages,
            pending_input_request,
        })
    }

    /// Lazily expand a sub-agent: look up the child session id a parent's
    /// `Task` tool-use record points at, then compose that child session's
    /// own snapshot the same way a top-level session would be read
    /// (spec.md §3 Sub-agent, §4.E's "lazy" expansion — the parent
    /// snapshot never eagerly reads every child transcript).
    pub async fn expand_sub_agent(
        &self,
        project_id: &str,
        session_id: &str,
        tool_use_id: &str,
    ) -> Result<Option<SessionSnapshot>> {
        let map = crate::transcript::sub_agent_map(&self.transcript, project_id, session_id)?;
        let Some(agent_session_id) = map.get(tool_use_id) else {
            return Ok(None);
        };
        let mut snapshot = self.snapshot(project_id, agent_session_id, None).await?;
        for message in &mut snapshot.messages {
            message.parent_session_id = Some(session_id.to_string());
        }
        Ok(Some(snapshot))
    }

    /// Lightweight per-project listing (SPEC_FULL §3 supplement): avoids
    /// materializing every session's full transcript, only its derived
    /// title, message count, and operator overrides.
    pub async fn list_summaries(&self, project_id: &str) -> Result<Vec<SessionSummary>> {
        let mut out = Vec::new();
        for (session_id, mtime) in self.transcript.session_files(project_id)? {
            let messages = self.transcript.read_session(project_id, &session_id, None)?;
            let derived_title = messages
                .iter()
                .find(|m| matches!(m.role, crate::model::MessageRole::User))
                .and_then(|m| derive_title(&m.content));

            let owned = self.supervisor.get_by_session(&session_id).await.is_some();
            let status = self.status_from_mtime(owned, mtime);

            let overrides = self.settings.get(&session_id).await;
            out.push(SessionSummary {
                session_id,
                title: overrides.title.or(derived_title),
                starred: overrides.starred,
                archived: overrides.archived,
                last_seen_at: chrono::DateTime::<chrono::Utc>::from(mtime),
                message_count: messages.len(),
                status,
            });
        }
        Ok(out)
    }

    async fn derive_status(&self, project_id: &str, session_id: &str, owned: bool) -> SessionStatus {
        if owned {
            return SessionStatus::Owned;
        }

        let mtime = self
            .transcript_path_mtime(project_id, session_id)
            .unwrap_or(None);

        match mtime {
            Some(mtime) => self.status_from_mtime(false, mtime),
            None => SessionStatus::Idle,
        }
    }

    /// A future-dated mtime (clock skew, a misbehaving writer) is treated
    /// as "now" rather than producing a negative age that would read as
    /// ancient (SPEC_FULL §9 design note).
    fn status_from_mtime(&self, owned: bool, mtime: std::time::SystemTime) -> SessionStatus {
        if owned {
            return SessionStatus::Owned;
        }
        let now = std::time::SystemTime::now();
        let age = now.duration_since(mtime).unwrap_or_default();
        if age <= self.external_threshold {
            SessionStatus::External
        } else {
            SessionStatus::Idle
        }
    }

    fn transcript_path_mtime(
        &self,
        project_id: &str,
        session_id: &str,
    ) -> Result<Option<std::time::SystemTime>> {
        let path = self
            .transcript
            .enumerate_projects()?
            .into_iter()
            .find(|p| p.id == project_id)
            .map(|p| p.path.join(format!("{session_id}.jsonl")));

        match path {
            Some(path) if path.exists() => Ok(Some(std::fs::metadata(path)?.modified()?)),
            _ => Ok(None),
        }
    }
}
