//! Router-level tests for login, lockout, sessions, tools, and the dispatcher.

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use termgate::auth::{CredentialStore, Credentials};
use termgate::binaries::{Binaries, Capability};
use termgate::config::{GatewayConfig, PortRange};
use termgate::http_server::router;
use termgate::state::AppState;
use tower::ServiceExt;

const USERNAME: &str = "admin";
const PASSWORD: &str = "correct horse battery";

struct Gateway {
    app: Router,
    state: AppState,
    dir: TempDir,
}

async fn gateway_with_limit(api_rate_limit: u32) -> Gateway {
    let dir = tempfile::tempdir().unwrap();
    let config = GatewayConfig {
        host: "127.0.0.1".to_string(),
        port: 7680,
        terminal_ports: PortRange::new(49681, 49700),
        editor_ports: PortRange::new(49800, 49820),
        session_expiry: Duration::from_secs(3600),
        secure_cookies: false,
        state_dir: dir.path().to_path_buf(),
        api_rate_limit,
        api_rate_window: Duration::from_secs(60),
        trust_proxy_headers: true,
        ready_timeout: Duration::from_millis(200),
    };
    let credentials =
        CredentialStore::from_record(Credentials::create(USERNAME, PASSWORD).unwrap()).unwrap();
    let missing = || Capability::Unavailable("not installed in tests".to_string());
    let binaries = Binaries::new(missing(), missing(), missing(), missing());
    let state = AppState::new(config, credentials, Arc::new(binaries)).await.unwrap();
    Gateway {
        app: router(state.clone()),
        state,
        dir,
    }
}

async fn gateway() -> Gateway {
    gateway_with_limit(60).await
}

impl Gateway {
    async fn send(&self, req: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(req).await.unwrap()
    }

    async fn login(&self, ip: &str, password: &str) -> Response<Body> {
        self.send(
            Request::builder()
                .method("POST")
                .uri("/login")
                .header("x-real-ip", ip)
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(format!("username={USERNAME}&password={}", password.replace(' ', "+"))))
                .unwrap(),
        )
        .await
    }

    /// Log in and return the session cookie pair.
    async fn cookie(&self) -> String {
        let response = self.login("10.0.0.1", PASSWORD).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        set_cookie(&response).split(';').next().unwrap().to_string()
    }

    async fn api(&self, method: &str, path: &str, cookie: &str, body: Option<Value>) -> Response<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(path)
            .header("x-real-ip", "10.0.0.1")
            .header(header::COOKIE, cookie);
        let req = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        };
        self.send(req.unwrap()).await
    }
}

fn set_cookie(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::SET_COOKIE)
        .expect("set-cookie")
        .to_str()
        .unwrap()
        .to_string()
}

async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_login_issues_expiring_session_cookie() {
    let gw = gateway().await;
    let response = gw.login("10.0.0.1", PASSWORD).await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers()[header::LOCATION], "/");

    let cookie = set_cookie(&response);
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Strict"));
    assert!(!cookie.contains("Secure"));

    let token = cookie.split(';').next().unwrap().split_once('=').unwrap().1;
    assert!(gw.state.auth_sessions.validate(token));
    let expires = gw.state.auth_sessions.expires_at(token).unwrap();
    let remaining = expires - chrono::Utc::now();
    assert!(remaining.num_seconds() > 3500 && remaining.num_seconds() <= 3600);
}

#[tokio::test]
async fn test_lockout_after_five_failures() {
    let gw = gateway().await;
    for attempt in 1..=4 {
        let response = gw.login("10.0.0.9", "wrong password").await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "attempt {attempt}");
    }
    // The fifth failure starts the lockout.
    assert_eq!(gw.login("10.0.0.9", "wrong password").await.status(), StatusCode::TOO_MANY_REQUESTS);

    let response = gw.login("10.0.0.9", PASSWORD).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "60");

    // Other addresses are unaffected.
    assert_eq!(gw.login("10.0.0.10", PASSWORD).await.status(), StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn test_successful_login_resets_failures() {
    let gw = gateway().await;
    for _ in 0..3 {
        gw.login("10.0.0.2", "nope nope").await;
    }
    assert_eq!(gw.state.login_limiter.failures("10.0.0.2"), 3);
    assert_eq!(gw.login("10.0.0.2", PASSWORD).await.status(), StatusCode::SEE_OTHER);
    assert_eq!(gw.state.login_limiter.failures("10.0.0.2"), 0);
}

#[tokio::test]
async fn test_logout_revokes_token() {
    let gw = gateway().await;
    let cookie = gw.cookie().await;
    let token = cookie.split_once('=').unwrap().1.to_string();

    let response = gw
        .send(
            Request::builder()
                .uri("/logout")
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert!(set_cookie(&response).contains("Max-Age=0"));
    assert!(!gw.state.auth_sessions.validate(&token));

    let response = gw.api("GET", "/api/sessions", &cookie, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unauthenticated_requests_by_route_class() {
    let gw = gateway().await;

    let response = gw.api("GET", "/api/sessions", "", None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let csp = response.headers()[header::CONTENT_SECURITY_POLICY].to_str().unwrap().to_string();
    assert!(csp.contains("script-src 'nonce-"));
    assert_eq!(json_body(response).await["code"], "UNAUTHORIZED");

    let response = gw
        .send(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(response.headers()[header::LOCATION], "/login");

    let response = gw
        .send(Request::builder().uri("/login").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let csp = response.headers()[header::CONTENT_SECURITY_POLICY].to_str().unwrap().to_string();
    let nonce = csp.split("'nonce-").nth(1).unwrap().split('\'').next().unwrap().to_string();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains(&format!("nonce=\"{nonce}\"")));
}

#[tokio::test]
async fn test_each_response_gets_a_fresh_nonce() {
    let gw = gateway().await;
    let csp = |r: &Response<Body>| r.headers()[header::CONTENT_SECURITY_POLICY].to_str().unwrap().to_string();
    let a = gw.send(Request::builder().uri("/login").body(Body::empty()).unwrap()).await;
    let b = gw.send(Request::builder().uri("/login").body(Body::empty()).unwrap()).await;
    assert_ne!(csp(&a), csp(&b));
}

#[tokio::test]
async fn test_create_session_with_missing_folder_is_rejected() {
    let gw = gateway().await;
    let cookie = gw.cookie().await;
    let before = gw.state.registry.list().await.unwrap();

    let response = gw
        .api(
            "POST",
            "/api/sessions",
            &cookie,
            Some(json!({ "name": "work", "folder": "/definitely/not/a/folder" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "FOLDER_NOT_FOUND");
    assert_eq!(gw.state.registry.list().await.unwrap(), before);
}

#[tokio::test]
async fn test_session_lifecycle() {
    let gw = gateway().await;
    let cookie = gw.cookie().await;
    let folder = gw.dir.path().join("proj");
    std::fs::create_dir(&folder).unwrap();

    let response = gw
        .api(
            "POST",
            "/api/sessions",
            &cookie,
            Some(json!({ "name": "work", "folder": folder, "toolId": "claude" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = json_body(response).await["session"].clone();
    assert_eq!(created["name"], "work");
    assert_eq!(created["folder"], folder.to_string_lossy().as_ref());
    assert_eq!(created["toolId"], "claude");
    assert_eq!(created["type"], "tool");
    // No terminal backend in the test environment: persisted but inactive.
    assert_eq!(created["active"], false);
    let id = created["id"].as_str().unwrap().to_string();

    let listed = json_body(gw.api("GET", "/api/sessions", &cookie, None).await).await;
    let sessions = listed["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], id.as_str());

    let response = gw.api("DELETE", &format!("/api/sessions/{id}"), &cookie, None).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let listed = json_body(gw.api("GET", "/api/sessions", &cookie, None).await).await;
    assert!(listed["sessions"].as_array().unwrap().is_empty());

    let response = gw
        .send(
            Request::builder()
                .uri(format!("/terminal/{id}/ws"))
                .header(header::COOKIE, &cookie)
                .header(header::CONNECTION, "Upgrade")
                .header(header::UPGRADE, "websocket")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_unknown_session_is_not_found() {
    let gw = gateway().await;
    let cookie = gw.cookie().await;
    let response = gw.api("DELETE", "/api/sessions/unknown-id", &cookie, None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], "Session not found");
}

#[tokio::test]
async fn test_unknown_tool_is_rejected() {
    let gw = gateway().await;
    let cookie = gw.cookie().await;
    let folder: PathBuf = gw.dir.path().to_path_buf();
    let response = gw
        .api(
            "POST",
            "/api/sessions",
            &cookie,
            Some(json!({ "name": "work", "folder": folder, "toolId": "nope" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "UNKNOWN_TOOL");
}

#[tokio::test]
async fn test_custom_tools() {
    let gw = gateway().await;
    let cookie = gw.cookie().await;

    let response = gw
        .api(
            "POST",
            "/api/tools",
            &cookie,
            Some(json!({ "id": "agent", "name": "Agent", "command": "npx agent --fast" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = gw
        .api(
            "POST",
            "/api/tools",
            &cookie,
            Some(json!({ "id": "evil", "name": "Evil", "command": "sh -c 'id; id'" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let tools = json_body(gw.api("GET", "/api/tools", &cookie, None).await).await;
    let ids: Vec<&str> = tools["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"shell") && ids.contains(&"agent"));

    let response = gw.api("DELETE", "/api/tools/shell", &cookie, None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let response = gw.api("DELETE", "/api/tools/agent", &cookie, None).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_write_api_throttle() {
    let gw = gateway_with_limit(2).await;
    let cookie = gw.cookie().await;
    for _ in 0..2 {
        let response = gw.api("DELETE", "/api/tools/missing", &cookie, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
    let response = gw.api("DELETE", "/api/tools/missing", &cookie, None).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));

    // Reads are not throttled.
    let response = gw.api("GET", "/api/tools", &cookie, None).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let gw = gateway().await;
    let cookie = gw.cookie().await;
    let huge = "x".repeat(2 * 1024 * 1024);
    let response = gw
        .api(
            "POST",
            "/api/tools",
            &cookie,
            Some(json!({ "id": "big", "name": huge, "command": "ls" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_unmatched_path_without_routing_cookie_is_not_found() {
    let gw = gateway().await;
    let cookie = gw.cookie().await;
    let response = gw.api("GET", "/static/out/vs/loader.js", &cookie, None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(response.headers().contains_key(header::CONTENT_SECURITY_POLICY));
}

#[tokio::test]
async fn test_editor_status_lists_nothing_when_idle() {
    let gw = gateway().await;
    let cookie = gw.cookie().await;
    let status = json_body(gw.api("GET", "/api/code-server/status", &cookie, None).await).await;
    assert_eq!(status["installed"], false);
    assert!(status["editors"].as_array().unwrap().is_empty());

    let response = gw
        .api(
            "POST",
            "/api/code-server/start",
            &cookie,
            Some(json!({ "folder": gw.dir.path() })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "EDITOR_NOT_INSTALLED");
}
