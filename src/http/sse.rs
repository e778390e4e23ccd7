//! Server-sent event stream construction for the Local Transport.
//!
//! Grounded on `3155f5b1_adlio-mixtape__mixtape-server-src-agui-handler.rs`'s
//! SSE idiom: mpsc channel -> `ReceiverStream` -> `Event::default().data(json)`
//! -> `Sse::new(stream).keep_alive(...)`.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::bus::EventBus;

/// Heartbeat interval so intermediary proxies don't time out an idle SSE
/// connection (SPEC_FULL §6).
pub const SSE_HEARTBEAT_SECS: u64 = 20;

/// Build an SSE stream over the Event Bus for one client connection, tagging
/// every emitted event with a monotonic per-connection id. There is no
/// server-side replay buffer: a client that misses events resyncs by
/// re-requesting with `afterMessageId`/`afterUuid` against the Session View
/// or Transcript Store instead.
pub fn event_stream(
    bus: EventBus,
    filter: impl Fn(&crate::bus::Event) -> bool + Send + Sync + 'static,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (tx, rx) = tokio::sync::mpsc::channel(256);

    tokio::spawn(async move {
        let (sub_id, mut sub) = bus.subscribe().await;
        while let Some(event) = sub.recv().await {
            if !filter(&event) {
                continue;
            }
            if tx.send(event).await.is_err() {
                break;
            }
        }
        bus.unsubscribe(sub_id).await;
    });

    let next_id = AtomicU64::new(0);
    let stream = ReceiverStream::new(rx).map(move |event| {
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let json = serde_json::to_string(&event).unwrap_or_else(|_| "null".to_string());
        Ok(SseEvent::default().id(id.to_string()).data(json))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(SSE_HEARTBEAT_SECS))
            .text("heartbeat"),
    )
}
