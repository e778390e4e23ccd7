//! Frame Transport (component G) — the multiplexed bidirectional protocol
//! carried over a single WebSocket connection at `GET /ws` (or, relayed,
//! over the same codec inside the AEAD envelope from [`crate::auth::crypto`]).
//!
//! Frame format and constants grounded on
//! `82368339_shranto27-WRAITH-Protocol__crates-wraith-core-src-lib.rs`'s
//! crate-level protocol-constant style (`PROTOCOL_VERSION`, header sizes);
//! the WebSocket carrier itself grounded on the `zeroclaw-labs-zeroclaw`
//! manifest's axum `ws` feature + `tokio-tungstenite` combination.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::http::AppState;

/// First byte of every frame on the wire identifies its payload kind.
pub const FORMAT_JSON: u8 = 0x01;
pub const FORMAT_BINARY_UPLOAD: u8 = 0x02;

/// Close code used when a frame's format byte is 0x00 or otherwise invalid.
pub const CLOSE_INVALID_FORMAT: u16 = 4002;

/// Upload chunk header: `[uploadId:16][offset:u64 BE][bytes...]`.
pub const UPLOAD_HEADER_LEN: usize = 16 + 8;

/// Progress is reported roughly every 64KiB of an upload, not on every
/// chunk, to keep the event volume reasonable for large uploads.
pub const UPLOAD_PROGRESS_INTERVAL: u64 = 64 * 1024;

/// `request`/`response` frames mirror a full HTTP call (§4.G): the Frame
/// Transport's `request` is dispatched against the same axum `Router` the
/// Local Transport serves, so a client reaches an identical API surface
/// whether it talks HTTP+SSE or the multiplexed frame protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JsonFrame {
    Request {
        id: String,
        method: String,
        path: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<serde_json::Value>,
    },
    Response {
        id: String,
        status: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: Option<serde_json::Value>,
    },
    Event {
        subscription_id: String,
        event_type: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    Subscribe {
        subscription_id: String,
        channel: String,
    },
    Unsubscribe {
        subscription_id: String,
    },
    UploadStart {
        upload_id: String,
        project_id: String,
        session_id: String,
        filename: String,
        size: u64,
        #[serde(default)]
        mime_type: Option<String>,
    },
    UploadProgress {
        upload_id: String,
        received_bytes: u64,
    },
    UploadComplete {
        upload_id: String,
        file: UploadedFile,
    },
    UploadError {
        upload_id: String,
        message: String,
    },
    UploadEnd {
        upload_id: String,
    },
    #[serde(other)]
    Unknown,
}

/// The `file-descriptor` an `upload_complete` frame carries (spec.md §4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadedFile {
    pub size: u64,
    pub original_name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    pub path: String,
}

/// Parse the first byte of a raw frame and split it from its payload.
/// Returns `Err` (caller should close with `CLOSE_INVALID_FORMAT`) for an
/// empty or reserved/unrecognized leading byte.
pub fn split_frame(raw: &[u8]) -> Result<(u8, &[u8]), ()> {
    match raw.first() {
        Some(&FORMAT_JSON) => Ok((FORMAT_JSON, &raw[1..])),
        Some(&FORMAT_BINARY_UPLOAD) => Ok((FORMAT_BINARY_UPLOAD, &raw[1..])),
        _ => Err(()),
    }
}

#[derive(Debug)]
pub struct UploadChunk {
    pub upload_id: [u8; 16],
    pub offset: u64,
    pub bytes: Vec<u8>,
}

/// Parse a binary-upload payload (the bytes after the format byte).
pub fn parse_upload_chunk(payload: &[u8]) -> Result<UploadChunk, ()> {
    if payload.len() < UPLOAD_HEADER_LEN {
        return Err(());
    }
    let mut upload_id = [0u8; 16];
    upload_id.copy_from_slice(&payload[0..16]);
    let offset = u64::from_be_bytes(payload[16..24].try_into().map_err(|_| ())?);
    let bytes = payload[24..].to_vec();
    Ok(UploadChunk {
        upload_id,
        offset,
        bytes,
    })
}

/// Per-connection upload slot tracking strict offset monotonicity: a chunk
/// whose offset doesn't match the bytes received so far is rejected rather
/// than silently reordered, since the wire protocol has no reassembly
/// buffer of its own. Chunks are written straight through to `file` as they
/// arrive — the slot never buffers a whole upload in memory.
pub struct UploadSlot {
    pub total_bytes: u64,
    pub received: u64,
    pub last_progress_at: u64,
    pub path: std::path::PathBuf,
    pub original_name: String,
    pub mime_type: Option<String>,
    file: tokio::fs::File,
}

impl UploadSlot {
    fn new(
        total_bytes: u64,
        path: std::path::PathBuf,
        original_name: String,
        mime_type: Option<String>,
        file: tokio::fs::File,
    ) -> Self {
        Self {
            total_bytes,
            received: 0,
            last_progress_at: 0,
            path,
            original_name,
            mime_type,
            file,
        }
    }

    /// Accept a chunk if its offset matches the current write position,
    /// then append its bytes to the backing file. Returns whether a
    /// progress event is now due (every `UPLOAD_PROGRESS_INTERVAL` bytes).
    ///
    /// The error string for an offset mismatch is the literal text
    /// spec.md §8 scenario S5 requires clients to match on: `"Invalid offset"`.
    pub async fn accept(&mut self, offset: u64, bytes: &[u8]) -> Result<bool, String> {
        if offset != self.received {
            return Err("Invalid offset".to_string());
        }
        let len = bytes.len() as u64;
        if self.received + len > self.total_bytes {
            return Err("upload exceeded declared size".to_string());
        }

        use tokio::io::AsyncWriteExt;
        self.file
            .write_all(bytes)
            .await
            .map_err(|e| format!("failed to write upload chunk: {e}"))?;

        self.received += len;
        let due = self.received - self.last_progress_at >= UPLOAD_PROGRESS_INTERVAL
            || self.received == self.total_bytes;
        if due {
            self.last_progress_at = self.received;
        }
        Ok(due)
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.total_bytes
    }
}

/// Tracks in-flight request/response correlation and active subscriptions
/// for one frame-transport connection. A duplicate `id` on a new request
/// while one is already in flight is a protocol error (bad_request).
#[derive(Default)]
pub struct ConnectionState {
    in_flight: HashMap<String, ()>,
    subscriptions: HashMap<String, String>,
    uploads: HashMap<[u8; 16], UploadSlot>,
}

impl ConnectionState {
    pub fn begin_request(&mut self, id: &str) -> Result<(), ()> {
        if self.in_flight.contains_key(id) {
            return Err(());
        }
        self.in_flight.insert(id.to_string(), ());
        Ok(())
    }

    pub fn end_request(&mut self, id: &str) {
        self.in_flight.remove(id);
    }

    pub fn subscribe(&mut self, id: String, channel: String) {
        self.subscriptions.insert(id, channel);
    }

    pub fn unsubscribe(&mut self, id: &str) -> Option<String> {
        self.subscriptions.remove(id)
    }

    /// `(subscriptionId, channel)` pairs currently active on this
    /// connection, used to decide which live bus events to forward and
    /// under which subscription id to tag them.
    pub fn subscriptions(&self) -> impl Iterator<Item = (&String, &String)> {
        self.subscriptions.iter()
    }

    pub fn has_upload(&self, id: &[u8; 16]) -> bool {
        self.uploads.contains_key(id)
    }

    /// Opens the backing file and registers a new slot. Fails (without
    /// touching `self.uploads`) if the file can't be created; the caller
    /// reports that as an `upload_error`, not a protocol-level close.
    pub async fn start_upload(
        &mut self,
        id: [u8; 16],
        total_bytes: u64,
        path: std::path::PathBuf,
        original_name: String,
        mime_type: Option<String>,
    ) -> std::io::Result<()> {
        let file = tokio::fs::File::create(&path).await?;
        self.uploads.insert(
            id,
            UploadSlot::new(total_bytes, path, original_name, mime_type, file),
        );
        Ok(())
    }

    pub fn upload_mut(&mut self, id: &[u8; 16]) -> Option<&mut UploadSlot> {
        self.uploads.get_mut(id)
    }

    pub fn finish_upload(&mut self, id: &[u8; 16]) {
        self.uploads.remove(id);
    }

    /// Removes and returns the slot only if it has received every declared
    /// byte; otherwise leaves it in place for the caller to decide whether
    /// to drop it (an `upload_end` on an incomplete upload is an error, not
    /// a silent no-op — the slot is still removed by the caller in that
    /// case via [`Self::finish_upload`]).
    pub fn take_upload_if_complete(&mut self, id: &[u8; 16]) -> Option<UploadSlot> {
        if self.uploads.get(id).is_some_and(UploadSlot::is_complete) {
            self.uploads.remove(id)
        } else {
            None
        }
    }
}

pub type SharedConnectionState = Arc<Mutex<ConnectionState>>;

/// A channel only ever matches its own session, or (for `"activity"`) the
/// cross-session events the `/api/activity/stream` SSE endpoint also
/// serves — the same taxonomy, just reachable over either carrier.
pub fn channel_matches(channel: &str, event: &crate::bus::Event) -> bool {
    use crate::bus::Event;
    if channel == "activity" {
        return matches!(
            event,
            Event::WorkerActivity { .. }
                | Event::ProcessStateChanged { .. }
                | Event::BackendReloaded
                | Event::Heartbeat
        );
    }
    if let Some(session_id) = channel.strip_prefix("session:") {
        return match event {
            Event::FileChange { session_id: s, .. }
            | Event::SessionStatusChanged { session_id: s, .. }
            | Event::ProcessStateChanged { session_id: s, .. }
            | Event::Message { session_id: s, .. }
            | Event::StreamPartial { session_id: s, .. }
            | Event::ModeChanged { session_id: s, .. } => s == session_id,
            Event::Heartbeat => true,
            _ => false,
        };
    }
    false
}

fn channel_is_known(channel: &str) -> bool {
    channel == "activity" || channel.starts_with("session:")
}

fn encode_json(frame: &JsonFrame) -> Vec<u8> {
    let mut out = vec![FORMAT_JSON];
    out.extend_from_slice(serde_json::to_string(frame).unwrap_or_default().as_bytes());
    out
}

/// Upload ids travel in JSON frames as plain strings (not the 16 raw bytes
/// the binary chunk header uses); this is the crate-internal convention
/// bridging the two, not a wire-level encoding spec.md prescribes.
pub fn encode_upload_id(id: &[u8; 16]) -> String {
    id.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn decode_upload_id(s: &str) -> Result<[u8; 16], ()> {
    if s.len() != 32 {
        return Err(());
    }
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| ())?;
    }
    Ok(out)
}

/// Dispatch one already-unwrapped raw frame (format byte + payload) against
/// this connection's state, returning zero or more complete outbound frames
/// to send back (each already prefixed with its own format byte).
///
/// Transport-agnostic: the caller owns actually writing the returned bytes,
/// and, on the relay path, wrapping/unwrapping the AEAD envelope around them
/// ([`crate::auth::crypto`]). This is what lets the local `/ws` route and
/// the relay client ([`crate::relay`]) share one protocol implementation.
pub async fn dispatch(raw: &[u8], conn: &mut ConnectionState, state: &AppState) -> Result<Vec<Vec<u8>>, ()> {
    let (format, payload) = split_frame(raw)?;
    match format {
        FORMAT_JSON => dispatch_json(payload, conn, state).await,
        FORMAT_BINARY_UPLOAD => dispatch_upload_chunk(payload, conn).await,
        _ => Err(()),
    }
}

async fn dispatch_json(payload: &[u8], conn: &mut ConnectionState, state: &AppState) -> Result<Vec<Vec<u8>>, ()> {
    let parsed: JsonFrame = serde_json::from_slice(payload).map_err(|_| ())?;
    let mut out = Vec::new();

    match parsed {
        JsonFrame::Request {
            id,
            method,
            path,
            headers,
            body,
        } => {
            if conn.begin_request(&id).is_err() {
                // Duplicate in-flight id: a protocol-level 400, not a
                // connection close (spec.md §4.G).
                out.push(encode_json(&JsonFrame::Response {
                    id,
                    status: 400,
                    headers: HashMap::new(),
                    body: Some(serde_json::json!({ "error": "duplicate request id" })),
                }));
                return Ok(out);
            }

            out.push(encode_json(&dispatch_http_request(id.clone(), method, path, headers, body, state).await));
            conn.end_request(&id);
        }
        JsonFrame::Subscribe {
            subscription_id,
            channel,
        } => {
            if !channel_is_known(&channel) {
                out.push(encode_json(&JsonFrame::Response {
                    id: subscription_id,
                    status: 400,
                    headers: HashMap::new(),
                    body: Some(serde_json::json!({ "error": "unknown channel" })),
                }));
            } else {
                conn.subscribe(subscription_id.clone(), channel);
                // First event on a fresh subscription is synthetically
                // "connected" (spec.md §4.G).
                out.push(encode_json(&JsonFrame::Event {
                    subscription_id,
                    event_type: "connected".to_string(),
                    payload: serde_json::Value::Null,
                }));
            }
        }
        JsonFrame::Unsubscribe { subscription_id } => {
            conn.unsubscribe(&subscription_id);
        }
        JsonFrame::UploadStart {
            upload_id,
            project_id,
            session_id,
            filename,
            size,
            mime_type,
        } => {
            if let Some(frame) =
                start_upload(upload_id, project_id, session_id, filename, size, mime_type, conn, state).await
            {
                out.push(encode_json(&frame));
            }
        }
        JsonFrame::UploadEnd { upload_id } => {
            if let Ok(bytes) = decode_upload_id(&upload_id) {
                let frame = match conn.take_upload_if_complete(&bytes) {
                    Some(slot) => JsonFrame::UploadComplete {
                        upload_id,
                        file: UploadedFile {
                            size: slot.received,
                            original_name: slot.original_name,
                            mime_type: slot.mime_type,
                            path: slot.path.display().to_string(),
                        },
                    },
                    None => {
                        conn.finish_upload(&bytes);
                        JsonFrame::UploadError {
                            upload_id,
                            message: "upload ended before all declared bytes were received".to_string(),
                        }
                    }
                };
                out.push(encode_json(&frame));
            }
        }
        _ => {}
    }

    Ok(out)
}

/// Strips any path components from an operator-supplied name so it can be
/// safely joined onto the uploads directory — a `filename`/`projectId`/
/// `sessionId` of `"../../etc/passwd"` becomes just `"passwd"`.
fn sanitize_path_component(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or("");
    if base.is_empty() || base == "." || base == ".." {
        "_".to_string()
    } else {
        base.to_string()
    }
}

/// Handle `upload_start`: validate the declared size against the configured
/// cap, reject a re-used in-flight `uploadId`, then open the backing file
/// under `{dataDir}/uploads/{projectId}/{sessionId}/`.
#[allow(clippy::too_many_arguments)]
async fn start_upload(
    upload_id: String,
    project_id: String,
    session_id: String,
    filename: String,
    size: u64,
    mime_type: Option<String>,
    conn: &mut ConnectionState,
    state: &AppState,
) -> Option<JsonFrame> {
    let error = |message: String| {
        Some(JsonFrame::UploadError {
            upload_id: upload_id.clone(),
            message,
        })
    };

    let Ok(id_bytes) = decode_upload_id(&upload_id) else {
        return error("invalid uploadId".to_string());
    };

    // Re-using an uploadId that's still in flight (no prior upload_end) is
    // a protocol error per spec.md §4.G/§8 scenario S5, not a silent reset.
    if conn.has_upload(&id_bytes) {
        return error("already in use".to_string());
    }

    if size > state.max_upload_bytes {
        return error(format!(
            "upload of {size} bytes exceeds the maximum of {} bytes",
            state.max_upload_bytes
        ));
    }

    let dir = state
        .uploads_dir
        .join(sanitize_path_component(&project_id))
        .join(sanitize_path_component(&session_id));
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        return error(format!("failed to prepare upload directory: {e}"));
    }

    let sanitized_name = sanitize_path_component(&filename);
    let path = dir.join(format!("{upload_id}_{sanitized_name}"));

    match conn
        .start_upload(id_bytes, size, path, filename, mime_type)
        .await
    {
        Ok(()) => None,
        Err(e) => error(format!("failed to open upload file: {e}")),
    }
}

/// Translate a `request` frame's `{method, path, headers, body}` into a real
/// axum `Request` and run it through the same `Router` the Local Transport
/// serves, so the two carriers answer the API identically.
async fn dispatch_http_request(
    id: String,
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Option<serde_json::Value>,
    state: &AppState,
) -> JsonFrame {
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    let body_bytes = body.as_ref().map(|v| v.to_string()).unwrap_or_default();

    let mut builder = Request::builder().method(method.as_str()).uri(path);
    for (k, v) in &headers {
        builder = builder.header(k, v);
    }
    let request = match builder.body(Body::from(body_bytes)) {
        Ok(r) => r,
        Err(_) => {
            return JsonFrame::Response {
                id,
                status: 400,
                headers: HashMap::new(),
                body: Some(serde_json::json!({ "error": "malformed request frame" })),
            }
        }
    };

    let router = crate::http::router(state.clone());
    let response = match router.oneshot(request).await {
        Ok(r) => r,
        Err(_) => {
            return JsonFrame::Response {
                id,
                status: 500,
                headers: HashMap::new(),
                body: Some(serde_json::json!({ "error": "internal error" })),
            }
        }
    };

    let status = response.status().as_u16();
    let response_headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();

    let bytes = response
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();
    let body = serde_json::from_slice(&bytes).ok();

    JsonFrame::Response {
        id,
        status,
        headers: response_headers,
        body,
    }
}

/// An unknown `uploadId` on a binary chunk (no prior `upload_start`, or one
/// already completed) is a protocol error — the caller closes the
/// connection rather than guessing what file the bytes belonged to.
async fn dispatch_upload_chunk(payload: &[u8], conn: &mut ConnectionState) -> Result<Vec<Vec<u8>>, ()> {
    let chunk = parse_upload_chunk(payload)?;
    let upload_id = encode_upload_id(&chunk.upload_id);
    let slot = conn.upload_mut(&chunk.upload_id).ok_or(())?;
    let mut out = Vec::new();
    match slot.accept(chunk.offset, &chunk.bytes).await {
        Ok(due) => {
            if due {
                out.push(encode_json(&JsonFrame::UploadProgress {
                    upload_id,
                    received_bytes: slot.received,
                }));
            }
        }
        Err(message) => {
            out.push(encode_json(&JsonFrame::UploadError { upload_id, message }));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_upload_slot(total_bytes: u64) -> (UploadSlot, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.bin");
        let file = tokio::fs::File::create(&path).await.unwrap();
        (
            UploadSlot::new(total_bytes, path, "upload.bin".to_string(), None, file),
            dir,
        )
    }

    #[tokio::test]
    async fn rejects_out_of_order_upload_chunks() {
        let (mut slot, _dir) = test_upload_slot(100).await;
        assert!(slot.accept(0, &[0u8; 50]).await.is_ok());
        let err = slot.accept(60, &[0u8; 10]).await.unwrap_err();
        assert_eq!(err, "Invalid offset");
        assert!(slot.accept(50, &[0u8; 50]).await.is_ok());
        assert!(slot.is_complete());
    }

    #[test]
    fn duplicate_request_id_rejected() {
        let mut state = ConnectionState::default();
        assert!(state.begin_request("req-1").is_ok());
        assert!(state.begin_request("req-1").is_err());
        state.end_request("req-1");
        assert!(state.begin_request("req-1").is_ok());
    }

    #[test]
    fn invalid_format_byte_rejected() {
        assert!(split_frame(&[0x00, 1, 2, 3]).is_err());
        assert!(split_frame(&[]).is_err());
        assert!(split_frame(&[FORMAT_JSON, b'{', b'}']).is_ok());
    }

    #[test]
    fn upload_id_round_trips_through_hex() {
        let id = [7u8; 16];
        let encoded = encode_upload_id(&id);
        assert_eq!(encoded.len(), 32);
        assert_eq!(decode_upload_id(&encoded).unwrap(), id);
        assert!(decode_upload_id("not-hex").is_err());
    }

    async fn test_state() -> AppState {
        let data_dir = tempfile::tempdir().unwrap();
        let projects_dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::Config::default();
        config.data_dir = data_dir.path().to_path_buf();
        config.projects_dir = projects_dir.path().to_path_buf();
        // Leaked so the tempdirs outlive the returned state for the
        // duration of the test process; acceptable in a short-lived test.
        std::mem::forget(data_dir);
        std::mem::forget(projects_dir);
        crate::build_runtime(config).await.unwrap().state
    }

    fn json_request_frame(id: &str, method: &str, path: &str) -> Vec<u8> {
        let frame = JsonFrame::Request {
            id: id.to_string(),
            method: method.to_string(),
            path: path.to_string(),
            headers: HashMap::new(),
            body: None,
        };
        encode_json(&frame)
    }

    #[tokio::test]
    async fn dispatch_runs_a_request_frame_through_the_real_router() {
        let state = test_state().await;
        let mut conn = ConnectionState::default();

        let raw = json_request_frame("req-1", "GET", "/api/health");
        let out = dispatch(&raw, &mut conn, &state).await.unwrap();
        assert_eq!(out.len(), 1);

        let (format, payload) = split_frame(&out[0]).unwrap();
        assert_eq!(format, FORMAT_JSON);
        let response: JsonFrame = serde_json::from_slice(payload).unwrap();
        match response {
            JsonFrame::Response { id, status, body, .. } => {
                assert_eq!(id, "req-1");
                assert_eq!(status, 200);
                assert_eq!(body.unwrap()["status"], "ok");
            }
            other => panic!("expected a response frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_rejects_duplicate_in_flight_request_id_with_a_400_not_a_close() {
        let state = test_state().await;
        let mut conn = ConnectionState::default();
        conn.begin_request("dupe").unwrap();

        let raw = json_request_frame("dupe", "GET", "/api/health");
        let out = dispatch(&raw, &mut conn, &state).await.unwrap();
        assert_eq!(out.len(), 1);
        let (_, payload) = split_frame(&out[0]).unwrap();
        let response: JsonFrame = serde_json::from_slice(payload).unwrap();
        match response {
            JsonFrame::Response { status, .. } => assert_eq!(status, 400),
            other => panic!("expected a response frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_answers_subscribe_with_a_synthetic_connected_event() {
        let state = test_state().await;
        let mut conn = ConnectionState::default();

        let frame = JsonFrame::Subscribe {
            subscription_id: "sub-1".to_string(),
            channel: "session:abc".to_string(),
        };
        let out = dispatch(&encode_json(&frame), &mut conn, &state).await.unwrap();
        assert_eq!(out.len(), 1);
        let (_, payload) = split_frame(&out[0]).unwrap();
        let response: JsonFrame = serde_json::from_slice(payload).unwrap();
        match response {
            JsonFrame::Event {
                subscription_id,
                event_type,
                ..
            } => {
                assert_eq!(subscription_id, "sub-1");
                assert_eq!(event_type, "connected");
            }
            other => panic!("expected an event frame, got {other:?}"),
        }
        assert_eq!(conn.subscriptions().count(), 1);
    }

    #[tokio::test]
    async fn dispatch_rejects_subscribe_to_an_unknown_channel() {
        let state = test_state().await;
        let mut conn = ConnectionState::default();

        let frame = JsonFrame::Subscribe {
            subscription_id: "sub-1".to_string(),
            channel: "not-a-real-channel".to_string(),
        };
        let out = dispatch(&encode_json(&frame), &mut conn, &state).await.unwrap();
        let (_, payload) = split_frame(&out[0]).unwrap();
        let response: JsonFrame = serde_json::from_slice(payload).unwrap();
        match response {
            JsonFrame::Response { status, .. } => assert_eq!(status, 400),
            other => panic!("expected a response frame, got {other:?}"),
        }
        assert_eq!(conn.subscriptions().count(), 0);
    }

    fn upload_start_frame(upload_id: &str, size: u64) -> Vec<u8> {
        encode_json(&JsonFrame::UploadStart {
            upload_id: upload_id.to_string(),
            project_id: "proj".to_string(),
            session_id: "sess".to_string(),
            filename: "test.txt".to_string(),
            size,
            mime_type: Some("text/plain".to_string()),
        })
    }

    fn binary_chunk_frame(id: &[u8; 16], offset: u64, data: &[u8]) -> Vec<u8> {
        let mut out = vec![FORMAT_BINARY_UPLOAD];
        out.extend_from_slice(id);
        out.extend_from_slice(&offset.to_be_bytes());
        out.extend_from_slice(data);
        out
    }

    fn first_response(out: &[Vec<u8>]) -> JsonFrame {
        let (_, payload) = split_frame(&out[0]).unwrap();
        serde_json::from_slice(payload).unwrap()
    }

    /// spec.md §8 scenario S5: open a frame transport, upload a 13-byte
    /// file in one chunk, and seal it — expect an `upload_complete` whose
    /// file descriptor reports the right size and original name.
    #[tokio::test]
    async fn upload_round_trip_matches_scenario_s5() {
        let state = test_state().await;
        let mut conn = ConnectionState::default();
        let id = [0x42u8; 16];
        let upload_id = encode_upload_id(&id);

        let start_out = dispatch(&upload_start_frame(&upload_id, 13), &mut conn, &state)
            .await
            .unwrap();
        assert!(start_out.is_empty(), "a clean upload_start sends no frame back");

        let chunk_out = dispatch(&binary_chunk_frame(&id, 0, b"Hello, World!"), &mut conn, &state)
            .await
            .unwrap();
        assert_eq!(chunk_out.len(), 1, "13 bytes should cross the progress threshold at completion");

        let end_out = dispatch(&encode_json(&JsonFrame::UploadEnd { upload_id: upload_id.clone() }), &mut conn, &state)
            .await
            .unwrap();
        match first_response(&end_out) {
            JsonFrame::UploadComplete { upload_id: id_out, file } => {
                assert_eq!(id_out, upload_id);
                assert_eq!(file.size, 13);
                assert_eq!(file.original_name, "test.txt");
                let on_disk = tokio::fs::read(&file.path).await.unwrap();
                assert_eq!(on_disk, b"Hello, World!");
            }
            other => panic!("expected upload_complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reusing_an_in_flight_upload_id_is_rejected() {
        let state = test_state().await;
        let mut conn = ConnectionState::default();
        let id = [0x7fu8; 16];
        let upload_id = encode_upload_id(&id);

        let first = dispatch(&upload_start_frame(&upload_id, 10), &mut conn, &state)
            .await
            .unwrap();
        assert!(first.is_empty());

        let second = dispatch(&upload_start_frame(&upload_id, 10), &mut conn, &state)
            .await
            .unwrap();
        match first_response(&second) {
            JsonFrame::UploadError { message, .. } => assert_eq!(message, "already in use"),
            other => panic!("expected upload_error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn chunk_at_wrong_offset_reports_invalid_offset_and_does_not_advance() {
        let state = test_state().await;
        let mut conn = ConnectionState::default();
        let id = [0x11u8; 16];
        let upload_id = encode_upload_id(&id);

        dispatch(&upload_start_frame(&upload_id, 100), &mut conn, &state)
            .await
            .unwrap();

        let bad = dispatch(&binary_chunk_frame(&id, 50, b"x"), &mut conn, &state)
            .await
            .unwrap();
        match first_response(&bad) {
            JsonFrame::UploadError { message, .. } => assert_eq!(message, "Invalid offset"),
            other => panic!("expected upload_error, got {other:?}"),
        }
        assert_eq!(conn.upload_mut(&id).unwrap().received, 0);
    }
}
