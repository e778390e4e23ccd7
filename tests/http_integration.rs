//! Integration tests exercising the Local Transport HTTP surface end to end
//! against a real `Supervisor`/`Transcript Store`/`Session View`, using a
//! `MockAgentCli` fixture script in place of the real AI CLI (SPEC_FULL §10's
//! "Test tooling" section).

use std::path::PathBuf;
use std::time::Duration;

use agentd::config::Config;
use agentd::http;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

fn fixture(name: &str) -> String {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
        .to_string_lossy()
        .into_owned()
}

async fn test_config(data_dir: &std::path::Path, projects_dir: &std::path::Path, agent_script: &str) -> Config {
    let mut config = Config::default();
    config.data_dir = data_dir.to_path_buf();
    config.projects_dir = projects_dir.to_path_buf();
    config.agent_command = fixture(agent_script);
    config.agent_args = Vec::new();
    config.agent_is_mock = true;
    config
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_reports_ok_and_uptime() {
    let data_dir = tempfile::tempdir().unwrap();
    let projects_dir = tempfile::tempdir().unwrap();
    let config = test_config(data_dir.path(), projects_dir.path(), "mock_agent_cli.sh").await;
    let runtime = agentd::build_runtime(config).await.unwrap();
    let router = http::router(runtime.state);

    let response = router.oneshot(get_request("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["activeProcesses"], 0);
}

#[tokio::test]
async fn start_session_runs_mock_cli_to_completion() {
    let data_dir = tempfile::tempdir().unwrap();
    let projects_dir = tempfile::tempdir().unwrap();
    let config = test_config(data_dir.path(), projects_dir.path(), "mock_agent_cli.sh").await;
    let runtime = agentd::build_runtime(config).await.unwrap();
    let router = http::router(runtime.state);

    let response = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/projects/proj1/sessions",
            serde_json::json!({ "sessionId": "sess-1", "message": "hi" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert!(body["processId"].is_string());

    // The mock CLI exits almost immediately; poll briefly for the process to
    // leave the registry's "streaming" window and settle.
    let mut settled = false;
    for _ in 0..20 {
        let response = router
            .clone()
            .oneshot(get_request("/api/processes"))
            .await
            .unwrap();
        let body = body_json(response).await;
        let processes = body["processes"].as_array().unwrap();
        if processes.iter().any(|p| p["state"] == "idle") {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(settled, "mock agent process never reached idle state");
}

#[tokio::test]
async fn starting_a_session_twice_conflicts_while_owned() {
    let data_dir = tempfile::tempdir().unwrap();
    let projects_dir = tempfile::tempdir().unwrap();
    let config = test_config(data_dir.path(), projects_dir.path(), "mock_agent_slow.sh").await;
    let runtime = agentd::build_runtime(config).await.unwrap();
    let router = http::router(runtime.state);

    let first = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/projects/proj1/sessions",
            serde_json::json!({ "sessionId": "sess-conflict", "message": "hi" }),
        ))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    // The slow mock is still sleeping, so the session is still owned.
    let second = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/projects/proj1/sessions",
            serde_json::json!({ "sessionId": "sess-conflict", "message": "hi again" }),
        ))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn mode_change_bumps_mode_version() {
    let data_dir = tempfile::tempdir().unwrap();
    let projects_dir = tempfile::tempdir().unwrap();
    let config = test_config(data_dir.path(), projects_dir.path(), "mock_agent_slow.sh").await;
    let runtime = agentd::build_runtime(config).await.unwrap();
    let router = http::router(runtime.state);

    router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/projects/proj1/sessions",
            serde_json::json!({ "sessionId": "sess-mode", "message": "hi" }),
        ))
        .await
        .unwrap();

    let response = router
        .clone()
        .oneshot(json_request(
            "PUT",
            "/api/sessions/sess-mode/mode",
            serde_json::json!({ "mode": "acceptEdits" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["modeVersion"], 1);

    let response = router
        .oneshot(json_request(
            "PUT",
            "/api/sessions/sess-mode/mode",
            serde_json::json!({ "mode": "bypassPermissions" }),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["modeVersion"], 2);
}

#[tokio::test]
async fn project_summary_lists_derived_title_from_transcript() {
    let data_dir = tempfile::tempdir().unwrap();
    let projects_dir = tempfile::tempdir().unwrap();
    let project_dir = projects_dir.path().join("proj1");
    tokio::fs::create_dir_all(&project_dir).await.unwrap();
    tokio::fs::write(
        project_dir.join("sess-a.jsonl"),
        concat!(
            r#"{"type":"user","uuid":"m1","message":{"content":"What does this function do?"},"timestamp":"2024-01-01T00:00:00Z"}"#, "\n",
            r#"{"type":"assistant","uuid":"m2","message":{"content":"It parses transcripts."},"timestamp":"2024-01-01T00:00:01Z"}"#, "\n",
        ),
    )
    .await
    .unwrap();

    let config = test_config(data_dir.path(), projects_dir.path(), "mock_agent_cli.sh").await;
    let runtime = agentd::build_runtime(config).await.unwrap();
    let router = http::router(runtime.state);

    let response = router.oneshot(get_request("/api/projects/proj1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let sessions = body["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["sessionId"], "sess-a");
    assert_eq!(sessions[0]["title"], "What does this function do?");
    assert_eq!(sessions[0]["messageCount"], 2);
}

#[tokio::test]
async fn session_settings_update_overrides_derived_title() {
    let data_dir = tempfile::tempdir().unwrap();
    let projects_dir = tempfile::tempdir().unwrap();
    let project_dir = projects_dir.path().join("proj1");
    tokio::fs::create_dir_all(&project_dir).await.unwrap();
    tokio::fs::write(
        project_dir.join("sess-b.jsonl"),
        concat!(
            r#"{"type":"user","uuid":"m1","message":{"content":"original title text"},"timestamp":"2024-01-01T00:00:00Z"}"#, "\n"
        ),
    )
    .await
    .unwrap();

    let config = test_config(data_dir.path(), projects_dir.path(), "mock_agent_cli.sh").await;
    let runtime = agentd::build_runtime(config).await.unwrap();
    let router = http::router(runtime.state);

    let response = router
        .clone()
        .oneshot(json_request(
            "PUT",
            "/api/sessions/sess-b/settings",
            serde_json::json!({ "title": "Operator-assigned title", "starred": true }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router.oneshot(get_request("/api/projects/proj1")).await.unwrap();
    let body = body_json(response).await;
    let sessions = body["sessions"].as_array().unwrap();
    let session = sessions.iter().find(|s| s["sessionId"] == "sess-b").unwrap();
    assert_eq!(session["title"], "Operator-assigned title");
    assert_eq!(session["starred"], true);
}

#[tokio::test]
async fn sub_agent_session_expands_from_a_task_tool_use_record() {
    let data_dir = tempfile::tempdir().unwrap();
    let projects_dir = tempfile::tempdir().unwrap();
    let project_dir = projects_dir.path().join("proj1");
    tokio::fs::create_dir_all(&project_dir).await.unwrap();
    tokio::fs::write(
        project_dir.join("sess-parent.jsonl"),
        concat!(
            r#"{"type":"user","uuid":"m1","message":{"content":"delegate this"},"timestamp":"2024-01-01T00:00:00Z"}"#, "\n",
            r#"{"type":"tool-use","uuid":"s1","toolUseId":"tool-1","toolName":"Task","input":{"agentSessionId":"sess-child"},"timestamp":"2024-01-01T00:00:01Z"}"#, "\n",
        ),
    )
    .await
    .unwrap();
    tokio::fs::write(
        project_dir.join("sess-child.jsonl"),
        r#"{"type":"assistant","uuid":"c1","message":{"content":"child result"},"timestamp":"2024-01-01T00:00:02Z"}"#,
    )
    .await
    .unwrap();

    let config = test_config(data_dir.path(), projects_dir.path(), "mock_agent_cli.sh").await;
    let runtime = agentd::build_runtime(config).await.unwrap();
    let router = http::router(runtime.state);

    let response = router
        .clone()
        .oneshot(get_request(
            "/api/projects/proj1/sessions/sess-parent/subagents/tool-1",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["sessionId"], "sess-child");
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["content"], "child result");
    assert_eq!(messages[0]["parentSessionId"], "sess-parent");

    let missing = router
        .oneshot(get_request(
            "/api/projects/proj1/sessions/sess-parent/subagents/no-such-tool",
        ))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn push_subscription_round_trips() {
    let data_dir = tempfile::tempdir().unwrap();
    let projects_dir = tempfile::tempdir().unwrap();
    let config = test_config(data_dir.path(), projects_dir.path(), "mock_agent_cli.sh").await;
    let runtime = agentd::build_runtime(config).await.unwrap();
    let router = http::router(runtime.state);

    let response = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/push/subscribe",
            serde_json::json!({
                "browserProfileId": "profile-1",
                "endpoint": "https://push.example/ep",
                "keys": {"p256dh": "abc", "auth": "def"},
                "deviceName": "laptop",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(get_request("/api/push/subscriptions"))
        .await
        .unwrap();
    let body = body_json(response).await;
    let subs = body["subscriptions"].as_array().unwrap();
    assert_eq!(subs.len(), 1);
    assert_eq!(subs[0]["browserProfileId"], "profile-1");

    let response = router
        .oneshot(json_request(
            "POST",
            "/api/push/unsubscribe/profile-1",
            serde_json::json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn protected_routes_require_a_bearer_cookie_once_auth_is_enabled() {
    let data_dir = tempfile::tempdir().unwrap();
    let projects_dir = tempfile::tempdir().unwrap();
    let config = test_config(data_dir.path(), projects_dir.path(), "mock_agent_cli.sh").await;
    let runtime = agentd::build_runtime(config).await.unwrap();
    let router = http::router(runtime.state);

    let enable = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/auth/enable",
            serde_json::json!({ "password": "correct horse" }),
        ))
        .await
        .unwrap();
    assert_eq!(enable.status(), StatusCode::OK);

    // Health stays public even with auth enabled.
    let health = router.clone().oneshot(get_request("/api/health")).await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    // A protected route with no credential is rejected.
    let unauthenticated = router.clone().oneshot(get_request("/api/projects")).await.unwrap();
    assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

    let login = router
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/auth/login",
            serde_json::json!({ "password": "correct horse" }),
        ))
        .await
        .unwrap();
    assert_eq!(login.status(), StatusCode::OK);
    let cookie = body_json(login).await["cookie"].as_str().unwrap().to_string();

    let authenticated = router
        .oneshot(
            Request::builder()
                .uri("/api/projects")
                .header("authorization", format!("Bearer {cookie}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(authenticated.status(), StatusCode::OK);
}
