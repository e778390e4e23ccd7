//! Shared data model: projects, sessions, transcript records, messages.
//!
//! These types are the vocabulary every other module speaks. The Transcript
//! Store reads them off disk, the Agent Process produces them live, the
//! Session View merges the two, and the transports serialize them verbatim.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A directory on disk containing one or more sessions' transcript files.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub path: PathBuf,
    pub session_count: usize,
}

/// Permission mode governing how tool-use requests are approved.
///
/// `default` blocks on operator input for every tool call; `acceptEdits`
/// auto-approves file edits but blocks on everything else; `bypassPermissions`
/// auto-approves everything; `plan` blocks all tool calls and only allows the
/// model to describe a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl Default for PermissionMode {
    fn default() -> Self {
        Self::Default
    }
}

/// Lifecycle state of one Agent Process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessState {
    Starting,
    Streaming,
    WaitingInput,
    Hold,
    Idle,
    Aborted,
}

/// A pending tool-approval request blocking an Agent Process in `WaitingInput`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub requested_at: chrono::DateTime<chrono::Utc>,
}

/// Operator's decision on a pending `InputRequest`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum InputResponse {
    Approve,
    Deny { reason: Option<String> },
}

/// The `message` object nested inside a `user`/`assistant` transcript record
/// (spec.md §6: "`type=user` carries `cwd`+`message.content`", "`type=assistant`
/// carries `message.content`+`message.role`"). `role` is optional because a
/// `user` record's role is implied by its own `type` tag; when present it's
/// trusted over the implied role (so an assistant record's `message.role`
/// still wins if a producer ever sets it explicitly).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(default)]
    pub role: Option<MessageRole>,
    pub content: serde_json::Value,
}

/// One line of a session's append-only transcript file, after parsing.
///
/// The record-type set is closed (spec.md §3): `user`, `assistant`, `system`,
/// `tool-use`, `tool-result`, `result`, `queue-op`, `snapshot`, `internal`.
/// Every one of those tags has its own variant here rather than falling
/// through to `Unknown`; only a tag outside that set round-trips via
/// `Unknown`, matching the same forward-compatibility rule the Frame
/// Transport uses for frame types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TranscriptRecord {
    #[serde(rename_all = "camelCase")]
    User {
        uuid: Option<String>,
        #[serde(default)]
        parent_uuid: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
        message: MessagePayload,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename_all = "camelCase")]
    Assistant {
        uuid: Option<String>,
        #[serde(default)]
        parent_uuid: Option<String>,
        message: MessagePayload,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// Carries `subtype`/`input_request` when `subtype == "input_request"`
    /// (spec.md §6); not surfaced as a `Message` — system records are
    /// bookkeeping the Agent Process's own live event stream already
    /// exposes (e.g. `waiting-input`), not conversation content.
    #[serde(rename_all = "camelCase")]
    System {
        uuid: Option<String>,
        #[serde(default)]
        parent_uuid: Option<String>,
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        input_request: Option<serde_json::Value>,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ToolUse {
        uuid: Option<String>,
        tool_use_id: String,
        tool_name: String,
        input: serde_json::Value,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        uuid: Option<String>,
        tool_use_id: String,
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// Marks completion of a turn (spec.md §6: "`type=result` marks
    /// completion"); not surfaced as a `Message`.
    #[serde(rename_all = "camelCase")]
    Result {
        uuid: Option<String>,
        #[serde(default)]
        is_error: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    /// An operator queue action (queue/abort/etc.) logged for history;
    /// not surfaced as a `Message`.
    QueueOp {
        uuid: Option<String>,
    },
    /// A periodic transcript snapshot marker; not surfaced as a `Message`.
    Snapshot {
        uuid: Option<String>,
    },
    /// Server-internal bookkeeping filtered from the user-visible
    /// projection (spec.md §3: "the transcript's user-visible projection
    /// after filtering internal records").
    Internal {
        uuid: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// The canonical id for a transcript-derived entity: `uuid` is fixed as
/// canonical (see DESIGN.md open questions); when absent, an id is
/// synthesized as `synth-{sessionId}-{index}`, stable because append order
/// in a transcript file never changes.
pub fn canonical_id(session_id: &str, index: usize, uuid: Option<&str>) -> String {
    match uuid {
        Some(u) if !u.is_empty() => u.to_string(),
        _ => format!("synth-{session_id}-{index}"),
    }
}

/// Where a `Message` in a merged `SessionSnapshot` actually came from:
/// a flushed transcript line, or an Agent Process's in-memory buffer of
/// content it hasn't written to disk yet (spec.md §3's `_source` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    Disk,
    Live,
}

/// A message in the merged view exposed to clients: one transcript record or
/// live event, normalized to a common shape regardless of origin.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: serde_json::Value,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub source: MessageSource,
    /// Set on a live message still being assembled (an assistant turn the
    /// CLI hasn't finished emitting yet); always `false` for disk-sourced
    /// messages, which are only ever read once fully flushed.
    pub streaming: bool,
    /// Set when this message belongs to a sub-agent session spawned by a
    /// parent's `Task` tool-use, pointing back at that parent session.
    pub parent_session_id: Option<String>,
}

/// Derived status of a session as seen by the Session View: `owned` means a
/// live Agent Process backs it in this server instance, `external` means the
/// transcript file was written to recently by something else (another
/// client, a crashed process we never adopted), `idle` means neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Owned,
    External,
    Idle,
}

/// Lightweight session listing entry (DATA MODEL supplement, SPEC_FULL §3).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub title: Option<String>,
    pub starred: bool,
    pub archived: bool,
    pub last_seen_at: chrono::DateTime<chrono::Utc>,
    pub message_count: usize,
    pub status: SessionStatus,
}

/// In-memory-only projection of a tool call's current disposition, derived
/// from transcript `ToolUse`/`ToolResult` records plus live approval state.
/// Not a transcript record type in its own right (SPEC_FULL §3).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub tool_use_id: String,
    pub tool_name: String,
    pub status: ToolCallStatus,
    pub result_summary: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Approved,
    Denied,
    AutoApproved,
}

/// Maximum length, in bytes, of a derived session title (spec.md §3:
/// "first user message, truncated").
pub const DERIVED_TITLE_MAX_BYTES: usize = 80;

/// Derive a session's title from its first user message, truncated at a
/// UTF-8 character boundary so multi-byte text never splits mid-codepoint.
pub fn derive_title(first_user_content: &serde_json::Value) -> Option<String> {
    let text = match first_user_content {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(" "),
        _ => return None,
    };
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(truncate_utf8_safe(text, DERIVED_TITLE_MAX_BYTES).to_string())
}

/// Truncate a string to at most `max_bytes`, respecting UTF-8 character
/// boundaries (never splits a multi-byte codepoint).
fn truncate_utf8_safe(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod title_tests {
    use super::*;

    #[test]
    fn derive_title_truncates_at_char_boundary() {
        let long = "a".repeat(100);
        let title = derive_title(&serde_json::Value::String(long)).unwrap();
        assert_eq!(title.len(), DERIVED_TITLE_MAX_BYTES);
    }

    #[test]
    fn derive_title_handles_content_blocks() {
        let content = serde_json::json!([{"type": "text", "text": "hello there"}]);
        assert_eq!(derive_title(&content).as_deref(), Some("hello there"));
    }

    #[test]
    fn derive_title_none_for_empty() {
        assert!(derive_title(&serde_json::Value::String("   ".to_string())).is_none());
    }
}
