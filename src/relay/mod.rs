//! Relay client (part of component H, Auth & Crypto, §4.H) — dials an
//! external rendezvous when `relay_url` is configured and carries the same
//! Frame Transport the local `/ws` route serves, wrapped in the per-frame
//! AEAD envelope from [`crate::auth::crypto`].
//!
//! Connection grounded on `tokio_tungstenite::connect_async`, the same
//! client-dial idiom the `nwiizo-ccswarm` `ai-session` crate's
//! `HttpTransport` uses for its own WebSocket leg (see DESIGN.md); the
//! reconnect-with-backoff loop is grounded on the `tokio::time::sleep`-based
//! retry idiom also used by `src/demo.rs` and `src/pipeline/
//! embedding_indexer.rs`, generalized from a fixed delay to a capped
//! exponential backoff since an unreachable rendezvous should not busy-loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::crypto;
use crate::auth::{AuthState, RelayHandshake};
use crate::frame::{self, SharedConnectionState};
use crate::http::AppState;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Handshake messages exchanged *before* a session key exists, so these
/// travel as plain JSON text frames rather than the binary envelope every
/// later frame uses.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HandshakeMessage {
    /// Sent by the remote peer (relayed by the rendezvous) to start the
    /// zero-knowledge verifier protocol.
    ClientHello {
        password_attempt: String,
        public_key: String,
    },
    /// Our reply: the other half of the balanced PAKE exchange.
    ServerHello { public_key: String },
}

fn encode_public_key(key: &x25519_dalek::PublicKey) -> String {
    key.as_bytes().iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_public_key(s: &str) -> Result<x25519_dalek::PublicKey> {
    if s.len() != 64 {
        anyhow::bail!("public key must be 32 bytes hex-encoded");
    }
    let mut bytes = [0u8; 32];
    for i in 0..32 {
        bytes[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).context("invalid hex in public key")?;
    }
    Ok(x25519_dalek::PublicKey::from(bytes))
}

/// Runs forever (until the process exits), dialing `relay_url` and serving
/// one relayed Frame Transport connection at a time. Reconnects with
/// exponential backoff on any failure — a dropped rendezvous connection is
/// expected during normal operation (network blips, rendezvous restarts),
/// not a fatal condition for the rest of the server.
pub async fn run(relay_url: String, state: AppState) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        tracing::info!(%relay_url, "connecting to relay rendezvous");
        match run_once(&relay_url, &state).await {
            Ok(()) => {
                tracing::info!("relay connection closed cleanly, reconnecting");
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                tracing::warn!(error = %e, "relay connection failed");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

async fn run_once(relay_url: &str, state: &AppState) -> Result<()> {
    let (ws, _response) = tokio_tungstenite::connect_async(relay_url)
        .await
        .context("dialing relay rendezvous")?;
    let (mut sink, mut stream) = ws.split();

    let session_key = perform_handshake(&state.auth, &mut sink, &mut stream)
        .await
        .context("relay handshake")?;

    tracing::info!("relay handshake complete, serving frame transport");
    serve_encrypted_frames(session_key, sink, stream, state).await
}

/// Waits for the peer's `ClientHello`, verifies their password attempt
/// against our stored verifier, and replies with our half of the exchange.
/// Per SPEC_FULL §9's resolved open question, this always runs fresh — a
/// rekey is a brand new connection, never an in-place re-association.
async fn perform_handshake<S, T>(auth: &AuthState, sink: &mut S, stream: &mut T) -> Result<[u8; 32]>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
    T: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let Some(msg) = stream.next().await else {
        anyhow::bail!("relay connection closed before handshake began");
    };
    let text = match msg? {
        Message::Text(t) => t,
        Message::Binary(b) => String::from_utf8(b).context("handshake frame was not UTF-8")?,
        other => anyhow::bail!("unexpected message during handshake: {other:?}"),
    };

    let HandshakeMessage::ClientHello {
        password_attempt,
        public_key,
    } = serde_json::from_str(&text).context("parsing ClientHello")?
    else {
        anyhow::bail!("expected ClientHello as the first relay message");
    };

    let peer_public = decode_public_key(&public_key)?;
    let pending = RelayHandshake::begin(auth, &password_attempt)
        .await
        .map_err(|e| anyhow::anyhow!("relay auth rejected: {e}"))?;

    let reply = HandshakeMessage::ServerHello {
        public_key: encode_public_key(&pending.public_key()),
    };
    sink.send(Message::Text(serde_json::to_string(&reply)?))
        .await
        .map_err(|e| anyhow::anyhow!("sending ServerHello: {e}"))?;

    Ok(pending.finish(&peer_public))
}

/// Main relayed-connection loop: every inbound binary message is an AEAD
/// envelope wrapping one Frame Transport frame; decrypt, dispatch against
/// the same router/state the local `/ws` route uses, re-encrypt, and send
/// the response frames back. Live bus events are forwarded the same way.
///
/// A decryption failure is fatal to the *connection* (SPEC_FULL §4.H): we
/// close rather than try to resynchronize, and the caller's reconnect loop
/// establishes a fresh handshake (and thus a fresh key) on the next attempt.
async fn serve_encrypted_frames<S, T>(session_key: [u8; 32], mut sink: S, mut stream: T, state: &AppState) -> Result<()>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
    T: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let connection: SharedConnectionState = Arc::new(Mutex::new(Default::default()));
    let (sub_id, mut sub) = state.bus.subscribe().await;

    let result = loop {
        tokio::select! {
            incoming = stream.next() => {
                let Some(incoming) = incoming else { break Ok(()) };
                let msg = match incoming {
                    Ok(m) => m,
                    Err(e) => break Err(anyhow::anyhow!("relay read error: {e}")),
                };
                let envelope = match msg {
                    Message::Binary(b) => b,
                    Message::Close(_) => break Ok(()),
                    Message::Ping(_) | Message::Pong(_) => continue,
                    other => break Err(anyhow::anyhow!("unexpected relay message: {other:?}")),
                };

                let plaintext = match crypto::decrypt_envelope(&session_key, &envelope) {
                    Ok(p) => p,
                    Err(_) => break Err(anyhow::anyhow!("envelope decryption failed, closing connection")),
                };

                let mut conn = connection.lock().await;
                let outgoing = match frame::dispatch(&plaintext, &mut conn, state).await {
                    Ok(frames) => frames,
                    Err(()) => break Err(anyhow::anyhow!("invalid frame received over relay")),
                };
                drop(conn);

                let mut send_failed = None;
                for frame_bytes in outgoing {
                    if let Err(e) = send_envelope(&mut sink, &session_key, &frame_bytes).await {
                        send_failed = Some(e);
                        break;
                    }
                }
                if let Some(e) = send_failed {
                    break Err(e);
                }
            }
            event = sub.recv() => {
                let Some(event) = event else { break Ok(()) };
                let matches: Vec<String> = connection
                    .lock()
                    .await
                    .subscriptions()
                    .filter(|(_, channel)| frame::channel_matches(channel, &event))
                    .map(|(id, _)| id.clone())
                    .collect();
                let mut send_failed = None;
                for subscription_id in matches {
                    let json_frame = frame::JsonFrame::Event {
                        subscription_id,
                        event_type: event_type_name(&event).to_string(),
                        payload: serde_json::to_value(&event).unwrap_or_default(),
                    };
                    let mut raw = vec![frame::FORMAT_JSON];
                    raw.extend_from_slice(serde_json::to_string(&json_frame).unwrap_or_default().as_bytes());
                    if let Err(e) = send_envelope(&mut sink, &session_key, &raw).await {
                        send_failed = Some(e);
                        break;
                    }
                }
                if let Some(e) = send_failed {
                    break Err(e);
                }
            }
        }
    };

    state.bus.unsubscribe(sub_id).await;
    result
}

async fn send_envelope<S>(sink: &mut S, key: &[u8; 32], frame_bytes: &[u8]) -> Result<()>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let envelope = crypto::encrypt_envelope(key, frame_bytes)?;
    sink.send(Message::Binary(envelope))
        .await
        .map_err(|e| anyhow::anyhow!("sending relay frame: {e}"))?;
    Ok(())
}

fn event_type_name(event: &crate::bus::Event) -> &'static str {
    use crate::bus::Event;
    match event {
        Event::FileChange { .. } => "fileChange",
        Event::SessionStatusChanged { .. } => "sessionStatusChanged",
        Event::ProcessStateChanged { .. } => "processStateChanged",
        Event::Message { .. } => "message",
        Event::StreamPartial { .. } => "streamPartial",
        Event::ModeChanged { .. } => "modeChanged",
        Event::WorkerActivity { .. } => "workerActivity",
        Event::BackendReloaded => "backendReloaded",
        Event::Heartbeat => "heartbeat",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_round_trips_through_hex() {
        let secret = x25519_dalek::EphemeralSecret::random_from_rng(rand_core::OsRng);
        let public = x25519_dalek::PublicKey::from(&secret);
        let encoded = encode_public_key(&public);
        assert_eq!(encoded.len(), 64);
        let decoded = decode_public_key(&encoded).unwrap();
        assert_eq!(decoded.as_bytes(), public.as_bytes());
    }

    #[test]
    fn rejects_malformed_public_key_hex() {
        assert!(decode_public_key("not-hex").is_err());
        assert!(decode_public_key("abcd").is_err());
    }
}
