//! Local Transport (component F) — the HTTP+SSE carrier of this crate's one
//! logical request/event protocol.
//!
//! Router construction and graceful-shutdown wiring grounded on
//! `src/proxy/server.rs`'s pattern (one big `Router`, `with_state`,
//! `axum::serve(...).with_graceful_shutdown(...)`); SSE emission is its own
//! module ([`sse`]).

pub mod sse;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{any, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::net::TcpListener;

use crate::auth::AuthState;
use crate::bus::{Event, EventBus};
use crate::error::{AppError, AppResult};
use crate::frame;
use crate::model::{InputResponse, PermissionMode};
use crate::process::QueuedMessage;
use crate::push::{PushStore, PushSubscription};
use crate::session_view::SessionView;
use crate::settings::SettingsStore;
use crate::supervisor::{ResumeOutcome, Supervisor};
use crate::transcript::TranscriptStore;

#[derive(Clone)]
pub struct AppState {
    pub bus: EventBus,
    pub transcript: Arc<TranscriptStore>,
    pub supervisor: Arc<Supervisor>,
    pub session_view: Arc<SessionView>,
    pub settings: SettingsStore,
    pub push: PushStore,
    pub auth: AuthState,
    pub started_at: std::time::Instant,
    /// `{dataDir}/uploads/` — the Frame Transport's upload manager writes
    /// completed files here (spec.md §6's persisted state layout).
    pub uploads_dir: std::path::PathBuf,
    /// Largest upload the Frame Transport will accept before answering
    /// `upload_start` with a `TooLarge`-flavored `upload_error`.
    pub max_upload_bytes: u64,
}

pub async fn serve(bind_addr: SocketAddr, state: AppState, shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
    let app = router(state);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind local transport listener")?;

    tracing::info!(%bind_addr, "local transport listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await.ok();
        })
        .await
        .context("local transport server error")?;

    tracing::info!("local transport shut down gracefully");
    Ok(())
}

pub fn router(state: AppState) -> Router {
    // Everything but health and the auth endpoints themselves requires a
    // valid bearer credential once auth has been enabled (SPEC_FULL §7's
    // Unauthorized kind). `route_layer` only wraps routes already added to
    // this sub-router, so it can't accidentally shadow the public ones.
    let protected = Router::new()
        .route("/api/projects", get(list_projects))
        .route("/api/projects/:project_id", get(get_project))
        .route(
            "/api/projects/:project_id/sessions",
            post(create_session),
        )
        .route(
            "/api/projects/:project_id/sessions/:session_id",
            get(get_session),
        )
        .route(
            "/api/projects/:project_id/sessions/:session_id/subagents/:tool_use_id",
            get(get_sub_agent_session),
        )
        .route(
            "/api/projects/:project_id/sessions/:session_id/resume",
            post(resume_session),
        )
        .route(
            "/api/sessions/:session_id/messages",
            post(queue_message),
        )
        .route("/api/sessions/:session_id/input", post(respond_input))
        .route("/api/sessions/:session_id/mode", put(set_mode))
        .route(
            "/api/sessions/:session_id/settings",
            put(update_session_settings),
        )
        .route(
            "/api/processes/:process_id/abort",
            post(abort_process),
        )
        .route("/api/processes", get(list_processes))
        .route(
            "/api/projects/:project_id/sessions/:session_id/stream",
            get(session_stream),
        )
        .route("/api/activity/stream", get(activity_stream))
        .route("/ws", any(ws_upgrade))
        .route("/api/push/subscribe", post(push_subscribe))
        .route(
            "/api/push/unsubscribe/:browser_profile_id",
            post(push_unsubscribe),
        )
        .route("/api/push/subscriptions", get(push_list))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/enable", post(auth_enable))
        .route("/api/auth/login", post(auth_login))
        .route("/api/auth/change-password", post(auth_change_password))
        .route("/api/auth/disable", post(auth_disable))
        .route("/api/auth/logout", post(auth_logout))
        .merge(protected)
        .with_state(state)
}

/// Rejects requests with `Unauthorized` when auth is enabled and the caller
/// didn't present the bearer credential `login()` issued. A no-op while auth
/// is disabled, which is the server's default state.
async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if !state.auth.is_enabled().await {
        return Ok(next.run(request).await);
    }

    let credential = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match credential {
        Some(token) if state.auth.verify_cookie(token) => Ok(next.run(request).await),
        _ => Err(AppError::Unauthorized("missing or invalid credential".into())),
    }
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "activeProcesses": state.supervisor.active_count().await,
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

async fn list_projects(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let projects = state.transcript.enumerate_projects().map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "projects": projects })))
}

async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    let projects = state.transcript.enumerate_projects().map_err(AppError::internal)?;
    let project = projects
        .into_iter()
        .find(|p| p.id == project_id)
        .ok_or_else(|| AppError::NotFound(format!("project {project_id} not found")))?;
    let sessions = state
        .session_view
        .list_summaries(&project_id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({
        "project": project,
        "sessions": sessions,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionBody {
    session_id: String,
    message: String,
}

async fn create_session(
    State(state): State<AppState>,
    Path(_project_id): Path<String>,
    Json(body): Json<CreateSessionBody>,
) -> AppResult<Json<serde_json::Value>> {
    let process = state
        .supervisor
        .start(body.session_id, body.message)
        .await
        .map_err(|e| AppError::Conflict(e.to_string()))?;
    Ok(Json(serde_json::json!({ "processId": process.process_id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeSessionBody {
    resume_token: String,
    message: String,
    #[serde(default)]
    temp_id: Option<String>,
}

/// spec.md §4.D: resuming a session that's still owned queues the message
/// onto the existing process (`{position}`) rather than erroring; only a
/// genuinely external session spawns a fresh one (`{processId}`).
async fn resume_session(
    State(state): State<AppState>,
    Path((_project_id, session_id)): Path<(String, String)>,
    Json(body): Json<ResumeSessionBody>,
) -> AppResult<Json<serde_json::Value>> {
    let temp_id = body.temp_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let outcome = state
        .supervisor
        .resume(session_id, body.resume_token, body.message, temp_id)
        .await
        .map_err(|e| AppError::Conflict(e.to_string()))?;
    Ok(Json(match outcome {
        ResumeOutcome::Spawned(process) => serde_json::json!({ "processId": process.process_id }),
        ResumeOutcome::Queued { position } => serde_json::json!({ "position": position }),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionQuery {
    after_message_id: Option<String>,
}

async fn get_session(
    State(state): State<AppState>,
    Path((project_id, session_id)): Path<(String, String)>,
    Query(query): Query<SessionQuery>,
) -> AppResult<Json<serde_json::Value>> {
    let snapshot = state
        .session_view
        .snapshot(&project_id, &session_id, query.after_message_id.as_deref())
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!(snapshot)))
}

/// Lazily resolve a sub-agent spawned by the parent session's `Task`
/// tool-use record (spec.md §3 Sub-agent, §4.E): `NotFound` if the tool-use
/// id isn't a known `Task` invocation in this session's transcript.
async fn get_sub_agent_session(
    State(state): State<AppState>,
    Path((project_id, session_id, tool_use_id)): Path<(String, String, String)>,
) -> AppResult<Json<serde_json::Value>> {
    let snapshot = state
        .session_view
        .expand_sub_agent(&project_id, &session_id, &tool_use_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::NotFound(format!("no sub-agent for tool use {tool_use_id}")))?;
    Ok(Json(serde_json::json!(snapshot)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueMessageBody {
    temp_id: String,
    content: String,
}

async fn queue_message(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<QueueMessageBody>,
) -> AppResult<Json<serde_json::Value>> {
    let position = state
        .supervisor
        .queue(
            &session_id,
            QueuedMessage {
                temp_id: body.temp_id,
                content: body.content,
            },
        )
        .await
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    Ok(Json(serde_json::json!({ "position": position })))
}

/// Wire shape for `POST .../input` (spec.md §8 S3): `{requestId, response}`,
/// not the internal `InputResponse` decision enum directly — `requestId`
/// must match the session's currently pending `InputRequest` before the
/// decision is applied, so a stale or mistargeted approval can't land.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InputResponseBody {
    request_id: String,
    response: String,
    #[serde(default)]
    message: Option<String>,
}

async fn respond_input(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<InputResponseBody>,
) -> AppResult<Json<serde_json::Value>> {
    let process = state
        .supervisor
        .get_by_session(&session_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("no process owns session {session_id}")))?;

    let pending = process
        .pending_input_request()
        .await
        .ok_or_else(|| AppError::Gone(format!("no pending input request for session {session_id}")))?;
    if pending.tool_use_id != body.request_id {
        return Err(AppError::BadRequest(format!(
            "requestId {} does not match the pending request {}",
            body.request_id, pending.tool_use_id
        )));
    }

    let decision = match body.response.as_str() {
        "approve" => InputResponse::Approve,
        "deny" => InputResponse::Deny { reason: body.message },
        other => return Err(AppError::BadRequest(format!("unknown input response {other:?}"))),
    };

    state
        .supervisor
        .respond_to_input(&process.process_id, decision)
        .await
        .map_err(|e| AppError::Conflict(e.to_string()))?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetModeBody {
    mode: PermissionMode,
}

async fn set_mode(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<SetModeBody>,
) -> AppResult<Json<serde_json::Value>> {
    let process = state
        .supervisor
        .get_by_session(&session_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("no process owns session {session_id}")))?;
    let version = state
        .supervisor
        .set_permission_mode(&process.process_id, body.mode)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "modeVersion": version })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSessionSettingsBody {
    #[serde(default, deserialize_with = "deserialize_double_option")]
    title: Option<Option<String>>,
    starred: Option<bool>,
    archived: Option<bool>,
}

/// Distinguishes "field omitted" from "field explicitly set to null" so a
/// `PUT .../settings` body can clear a title (`"title": null`) without also
/// clearing it whenever the client merely omits the field.
fn deserialize_double_option<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Some(Option::deserialize(deserializer)?))
}

async fn update_session_settings(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<UpdateSessionSettingsBody>,
) -> AppResult<Json<serde_json::Value>> {
    let updated = state
        .settings
        .update(&session_id, body.title, body.starred, body.archived)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!(updated)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushSubscribeBody {
    browser_profile_id: String,
    endpoint: String,
    keys: serde_json::Value,
    device_name: Option<String>,
}

async fn push_subscribe(
    State(state): State<AppState>,
    Json(body): Json<PushSubscribeBody>,
) -> AppResult<Json<serde_json::Value>> {
    state
        .push
        .subscribe(PushSubscription {
            browser_profile_id: body.browser_profile_id,
            endpoint: body.endpoint,
            keys: body.keys,
            device_name: body.device_name,
            created_at: chrono::Utc::now(),
        })
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn push_unsubscribe(
    State(state): State<AppState>,
    Path(browser_profile_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    state
        .push
        .unsubscribe(&browser_profile_id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn push_list(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    let subs = state.push.list().await.map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "subscriptions": subs })))
}

async fn abort_process(
    State(state): State<AppState>,
    Path(process_id): Path<String>,
) -> AppResult<Json<serde_json::Value>> {
    state
        .supervisor
        .abort(&process_id)
        .await
        .map_err(|e| AppError::NotFound(e.to_string()))?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn list_processes(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "processes": state.supervisor.list().await }))
}

async fn session_stream(
    State(state): State<AppState>,
    Path((_project_id, session_id)): Path<(String, String)>,
) -> impl axum::response::IntoResponse {
    sse::event_stream(state.bus, move |event| match event {
        Event::FileChange { session_id: s, .. }
        | Event::SessionStatusChanged { session_id: s, .. }
        | Event::Message { session_id: s, .. }
        | Event::StreamPartial { session_id: s, .. }
        | Event::ModeChanged { session_id: s, .. } => s == &session_id,
        Event::Heartbeat => true,
        _ => false,
    })
}

async fn activity_stream(State(state): State<AppState>) -> impl axum::response::IntoResponse {
    sse::event_stream(state.bus, |event| {
        matches!(
            event,
            Event::WorkerActivity { .. } | Event::ProcessStateChanged { .. } | Event::Heartbeat
        )
    })
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl axum::response::IntoResponse {
    ws.on_upgrade(move |socket| handle_frame_socket(socket, state))
}

async fn handle_frame_socket(mut socket: axum::extract::ws::WebSocket, state: AppState) {
    use axum::extract::ws::Message;

    let connection: frame::SharedConnectionState = Arc::new(tokio::sync::Mutex::new(Default::default()));
    let (sub_id, mut sub) = state.bus.subscribe().await;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        let mut conn = connection.lock().await;
                        match frame::dispatch(&data, &mut conn, &state).await {
                            Ok(outgoing) => {
                                drop(conn);
                                for frame_bytes in outgoing {
                                    if socket.send(Message::Binary(frame_bytes)).await.is_err() {
                                        return state.bus.unsubscribe(sub_id).await;
                                    }
                                }
                            }
                            Err(()) => {
                                drop(conn);
                                let _ = socket.close().await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            event = sub.recv() => {
                let Some(event) = event else { break };
                let matches: Vec<String> = connection
                    .lock()
                    .await
                    .subscriptions()
                    .filter(|(_, channel)| frame::channel_matches(channel, &event))
                    .map(|(id, _)| id.clone())
                    .collect();
                for subscription_id in matches {
                    let frame = frame::JsonFrame::Event {
                        subscription_id,
                        event_type: event_type_name(&event).to_string(),
                        payload: serde_json::to_value(&event).unwrap_or_default(),
                    };
                    let mut out = vec![frame::FORMAT_JSON];
                    out.extend_from_slice(serde_json::to_string(&frame).unwrap_or_default().as_bytes());
                    if socket.send(Message::Binary(out)).await.is_err() {
                        state.bus.unsubscribe(sub_id).await;
                        return;
                    }
                }
            }
        }
    }

    state.bus.unsubscribe(sub_id).await;
}

/// Short tag for the `eventType` field of a forwarded `event` frame; the
/// full event still rides along in `payload`, this just spares clients a
/// `serde(tag = "type")` round trip to find out what kind it got.
fn event_type_name(event: &Event) -> &'static str {
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

#[derive(Deserialize)]
struct PasswordBody {
    password: String,
}

async fn auth_enable(State(state): State<AppState>, Json(body): Json<PasswordBody>) -> AppResult<Json<serde_json::Value>> {
    state.auth.enable(&body.password).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn auth_login(State(state): State<AppState>, Json(body): Json<PasswordBody>) -> AppResult<Json<serde_json::Value>> {
    let cookie = state.auth.login(&body.password).await?;
    Ok(Json(serde_json::json!({ "cookie": cookie })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordBody {
    old_password: String,
    new_password: String,
}

async fn auth_change_password(
    State(state): State<AppState>,
    Json(body): Json<ChangePasswordBody>,
) -> AppResult<Json<serde_json::Value>> {
    state
        .auth
        .change_password(&body.old_password, &body.new_password)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn auth_disable(State(state): State<AppState>) -> AppResult<Json<serde_json::Value>> {
    state.auth.disable().await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn auth_logout(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.auth.logout();
    Json(serde_json::json!({ "ok": true }))
}
