//! Transcript Store (component B) — read-only access to the append-only
//! JSON-lines transcript files the AI CLI writes per session, plus a
//! file-watcher that turns filesystem changes into Event Bus notifications.
//!
//! Grounded on `storage/mod.rs`'s JSONL-append idiom (inverted here into
//! tail/parse), with the watcher mechanism grounded in the `notify` +
//! `notify-debouncer-mini` combination (see DESIGN.md). This store never
//! writes to a transcript file — only the external AI CLI process does
//! that.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify_debouncer_mini::{new_debouncer, DebounceEventResult};
use tokio::sync::mpsc;

use crate::bus::{Event, EventBus};
use crate::model::{canonical_id, Message, MessageRole, MessageSource, Project, TranscriptRecord};

/// Default debounce window for coalescing rapid successive writes to one
/// transcript file into a single file-change notification (SPEC_FULL §9).
pub const DEFAULT_WATCH_DEBOUNCE_MS: u64 = 100;

#[derive(Clone)]
pub struct TranscriptStore {
    projects_root: PathBuf,
}

impl TranscriptStore {
    pub fn new(projects_root: PathBuf) -> Self {
        Self { projects_root }
    }

    /// Enumerate every project directory under the root, each holding zero
    /// or more `*.jsonl` session transcript files.
    pub fn enumerate_projects(&self) -> Result<Vec<Project>> {
        let mut projects = Vec::new();
        if !self.projects_root.exists() {
            return Ok(projects);
        }

        for entry in std::fs::read_dir(&self.projects_root)
            .with_context(|| format!("reading projects root {:?}", self.projects_root))?
        {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path();
            let session_count = std::fs::read_dir(&path)
                .map(|rd| {
                    rd.filter_map(|e| e.ok())
                        .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
                        .count()
                })
                .unwrap_or(0);
            projects.push(Project {
                id: entry.file_name().to_string_lossy().into_owned(),
                path,
                session_count,
            });
        }
        Ok(projects)
    }

    fn session_path(&self, project_id: &str, session_id: &str) -> PathBuf {
        self.projects_root
            .join(project_id)
            .join(format!("{session_id}.jsonl"))
    }

    /// List the session ids (transcript file stems) under one project,
    /// alongside each file's mtime — the cheap per-session facts the
    /// session-summary projection (SPEC_FULL §3) needs without
    /// materializing every message.
    pub fn session_files(&self, project_id: &str) -> Result<Vec<(String, std::time::SystemTime)>> {
        let dir = self.projects_root.join(project_id);
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e).with_context(|| format!("reading project dir {dir:?}")),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "jsonl") {
                continue;
            }
            let Some(session_id) = path.file_stem().map(|s| s.to_string_lossy().into_owned())
            else {
                continue;
            };
            let mtime = entry.metadata()?.modified()?;
            out.push((session_id, mtime));
        }
        Ok(out)
    }

    /// Read every record of a session's transcript, optionally only those
    /// strictly after `after_uuid` (for incremental client resync).
    pub fn read_session(
        &self,
        project_id: &str,
        session_id: &str,
        after_uuid: Option<&str>,
    ) -> Result<Vec<Message>> {
        let path = self.session_path(project_id, session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::File::open(&path)
            .with_context(|| format!("opening transcript {path:?}"))?;
        let reader = BufReader::new(file);

        // Buffer the full projection and locate the cut point afterward
        // rather than filtering inline: spec.md §8 property 3 requires the
        // *full* list when `after_uuid` is supplied but never matches, which
        // an inline "skip until seen" filter can't distinguish from "matched
        // at the very end, suffix is empty".
        let mut messages = Vec::new();
        let mut cut_index = None;

        for (index, line) in reader.lines().enumerate() {
            let line = line.with_context(|| format!("reading line {index} of {path:?}"))?;
            if line.trim().is_empty() {
                continue;
            }
            let record: TranscriptRecord = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(path = ?path, line = index, error = %e, "skipping malformed transcript line");
                    continue;
                }
            };

            let (uuid, message) = match record_to_message(session_id, index, record) {
                Some(pair) => pair,
                None => continue,
            };

            if cut_index.is_none() && Some(uuid.as_str()) == after_uuid {
                cut_index = Some(messages.len() + 1);
            }
            messages.push(message);
        }

        match (after_uuid, cut_index) {
            (None, _) => Ok(messages),
            (Some(_), Some(cut)) => Ok(messages.split_off(cut)),
            (Some(_), None) => Ok(messages),
        }
    }

    /// Spawn a filesystem watcher over the projects root. Every debounced
    /// batch of filesystem events is translated into one `Event::FileChange`
    /// per affected session and published on `bus`. The watcher itself runs
    /// on a dedicated blocking thread (notify's API is synchronous).
    pub fn watch(&self, bus: EventBus, debounce_ms: u64) -> Result<WatchHandle> {
        let (tx, mut rx) = mpsc::channel::<PathBuf>(1024);
        let projects_root = self.projects_root.clone();

        let mut debouncer = new_debouncer(
            Duration::from_millis(debounce_ms.max(1)),
            move |res: DebounceEventResult| {
                if let Ok(events) = res {
                    for event in events {
                        let _ = tx.blocking_send(event.path);
                    }
                }
            },
        )
        .context("creating transcript file watcher")?;

        debouncer
            .watcher()
            .watch(&projects_root, notify::RecursiveMode::Recursive)
            .with_context(|| format!("watching {projects_root:?}"))?;

        let forward_task = tokio::spawn(async move {
            let mut last: HashMap<(String, String), ()> = HashMap::new();
            while let Some(path) = rx.recv().await {
                if let Some((project_id, session_id)) = path_to_session(&path) {
                    last.insert((project_id.clone(), session_id.clone()), ());
                    bus.publish(Event::FileChange {
                        project_id,
                        session_id,
                    })
                    .await;
                }
            }
        });

        Ok(WatchHandle {
            _debouncer: debouncer,
            forward_task,
        })
    }
}

/// Keeps the debouncer and its forwarding task alive; dropping this stops
/// watching.
pub struct WatchHandle {
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    forward_task: tokio::task::JoinHandle<()>,
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.forward_task.abort();
    }
}

fn path_to_session(path: &Path) -> Option<(String, String)> {
    if path.extension().is_none_or(|ext| ext != "jsonl") {
        return None;
    }
    let session_id = path.file_stem()?.to_string_lossy().into_owned();
    let project_id = path.parent()?.file_name()?.to_string_lossy().into_owned();
    Some((project_id, session_id))
}

fn record_to_message(
    session_id: &str,
    index: usize,
    record: TranscriptRecord,
) -> Option<(String, Message)> {
    match record {
        TranscriptRecord::User {
            uuid,
            message,
            timestamp,
            ..
        } => {
            let id = canonical_id(session_id, index, uuid.as_deref());
            Some((
                id.clone(),
                Message {
                    id,
                    role: message.role.unwrap_or(MessageRole::User),
                    content: message.content,
                    timestamp,
                    source: MessageSource::Disk,
                    streaming: false,
                    parent_session_id: None,
                },
            ))
        }
        TranscriptRecord::Assistant {
            uuid,
            message,
            timestamp,
            ..
        } => {
            let id = canonical_id(session_id, index, uuid.as_deref());
            Some((
                id.clone(),
                Message {
                    id,
                    role: message.role.unwrap_or(MessageRole::Assistant),
                    content: message.content,
                    timestamp,
                    source: MessageSource::Disk,
                    streaming: false,
                    parent_session_id: None,
                },
            ))
        }
        TranscriptRecord::ToolUse {
            uuid,
            tool_use_id,
            tool_name,
            input,
            timestamp,
        } => {
            let id = canonical_id(session_id, index, uuid.as_deref());
            Some((
                id.clone(),
                Message {
                    id,
                    role: MessageRole::Assistant,
                    content: serde_json::json!({
                        "toolUseId": tool_use_id,
                        "toolName": tool_name,
                        "input": input,
                    }),
                    timestamp,
                    source: MessageSource::Disk,
                    streaming: false,
                    parent_session_id: None,
                },
            ))
        }
        TranscriptRecord::ToolResult {
            uuid,
            tool_use_id,
            content,
            is_error,
            timestamp,
        } => {
            let id = canonical_id(session_id, index, uuid.as_deref());
            Some((
                id.clone(),
                Message {
                    id,
                    role: MessageRole::User,
                    content: serde_json::json!({
                        "toolUseId": tool_use_id,
                        "content": content,
                        "isError": is_error,
                    }),
                    timestamp,
                    source: MessageSource::Disk,
                    streaming: false,
                    parent_session_id: None,
                },
            ))
        }
        // system/result/queue-op/snapshot/internal are known record types
        // (spec.md §3's closed set) but none of them is conversation
        // content — system carries input-request bookkeeping the Agent
        // Process's own live state already exposes, result only marks
        // completion, and queue-op/snapshot/internal are never
        // user-visible.
        TranscriptRecord::System { .. }
        | TranscriptRecord::Result { .. }
        | TranscriptRecord::QueueOp { .. }
        | TranscriptRecord::Snapshot { .. }
        | TranscriptRecord::Internal { .. }
        | TranscriptRecord::Unknown => None,
    }
}

/// Build the `{toolUseId -> agentSessionId}` map a session's `Task`
/// tool-use records carry (spec.md §3 Sub-agent), used by the Session View
/// to lazily expand a child session on demand rather than eagerly reading
/// every sub-agent transcript up front.
pub fn sub_agent_map(
    store: &TranscriptStore,
    project_id: &str,
    session_id: &str,
) -> Result<HashMap<String, String>> {
    let path = store.session_path(project_id, session_id);
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let file = std::fs::File::open(&path).with_context(|| format!("opening transcript {path:?}"))?;
    let reader = BufReader::new(file);
    let mut map = HashMap::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(TranscriptRecord::ToolUse {
            tool_use_id,
            tool_name,
            input,
            ..
        }) = serde_json::from_str::<TranscriptRecord>(&line)
        {
            if tool_name != "Task" {
                continue;
            }
            if let Some(agent_session_id) = input.get("agentSessionId").and_then(|v| v.as_str()) {
                map.insert(tool_use_id, agent_session_id.to_string());
            }
        }
    }
    Ok(map)
}

pub type SharedTranscriptStore = Arc<TranscriptStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_session_after_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("proj1");
        std::fs::create_dir_all(&project_dir).unwrap();
        let session_path = project_dir.join("sess1.jsonl");
        let mut file = std::fs::File::create(&session_path).unwrap();
        writeln!(
            file,
            r#"{{"type":"user","uuid":"m1","message":{{"content":"hi"}},"timestamp":"2024-01-01T00:00:00Z"}}"#
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"type":"assistant","uuid":"m2","message":{{"content":"hello"}},"timestamp":"2024-01-01T00:00:01Z"}}"#
        )
        .unwrap();

        let store = TranscriptStore::new(dir.path().to_path_buf());
        let all = store.read_session("proj1", "sess1", None).unwrap();
        assert_eq!(all.len(), 2);

        let after = store.read_session("proj1", "sess1", Some("m1")).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, "m2");

        // afterUuid of the very last message: empty suffix, not "not found".
        let after_last = store.read_session("proj1", "sess1", Some("m2")).unwrap();
        assert!(after_last.is_empty());

        // afterUuid that never appears: the full projection, per spec.md
        // §8 property 3 ("if X does not appear, the full projection is
        // returned") — not an empty list.
        let after_unknown = store.read_session("proj1", "sess1", Some("nope")).unwrap();
        assert_eq!(after_unknown.len(), 2);
    }

    #[test]
    fn missing_session_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path().to_path_buf());
        assert!(store.read_session("proj1", "nope", None).unwrap().is_empty());
    }
}
