//! HTTP surface: request classification, the auth gate, security headers, and handlers.

use crate::auth::{self, SESSION_COOKIE};
use crate::error::{GatewayError, Result};
use crate::fs_api;
use crate::pages;
use crate::proxy::{self, Proxied, ROUTING_COOKIE};
use crate::rate_limit::retry_after_secs;
use crate::registry::{Session, SessionKind};
use crate::state::AppState;
use crate::tools::{NewTool, SHELL_TOOL_ID};
use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, DefaultBodyLimit, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{any, delete, get, post},
    Extension, Form, Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Request body cap for gateway handlers.
pub const BODY_LIMIT: usize = 1024 * 1024;
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How the dispatcher treats a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Login and logout
    PublicPage,
    /// Dashboard, session, and folder views; unauthenticated visitors are redirected
    ProtectedPage,
    /// JSON API; `write` requests are throttled
    ProtectedApi { write: bool },
    /// Backend traffic; the proxy handlers authenticate on their own
    Passthrough,
    /// Anything else, handled by the cookie-directed fallback
    Unmatched,
}

pub fn classify(method: &Method, path: &str) -> RouteClass {
    if path.starts_with("/terminal/") || path.starts_with("/code/") {
        return RouteClass::Passthrough;
    }
    if path == "/api" || path.starts_with("/api/") {
        let write = matches!(
            *method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        );
        return RouteClass::ProtectedApi { write };
    }
    match path {
        "/login" | "/logout" => RouteClass::PublicPage,
        "/" | "/folder" => RouteClass::ProtectedPage,
        p if p.starts_with("/session/") => RouteClass::ProtectedPage,
        _ => RouteClass::Unmatched,
    }
}

/// Per-request script nonce, whitelisted by the CSP on the response.
#[derive(Debug, Clone)]
pub struct CspNonce(pub String);

/// Resolved client address used as the rate-limit key.
#[derive(Debug, Clone)]
pub struct ClientAddr(pub String);

fn generate_nonce() -> String {
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    STANDARD.encode(raw)
}

fn content_security_policy(nonce: &str) -> String {
    format!(
        "default-src 'self'; script-src 'nonce-{nonce}'; style-src 'self' 'nonce-{nonce}'; \
         img-src 'self' data:; connect-src 'self'; frame-src 'self'; frame-ancestors 'self'; \
         object-src 'none'; base-uri 'none'; form-action 'self'"
    )
}

fn apply_security_headers(response: &mut Response, nonce: &str) {
    let headers = response.headers_mut();
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"));
    headers.insert(header::REFERRER_POLICY, HeaderValue::from_static("no-referrer"));
    if let Ok(csp) = HeaderValue::from_str(&content_security_policy(nonce)) {
        headers.insert(header::CONTENT_SECURITY_POLICY, csp);
    }
}

/// Top-level middleware: classify, gate, throttle, then decorate gateway-owned responses.
async fn dispatch(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let class = classify(req.method(), req.uri().path());
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = auth::client_address(req.headers(), peer, state.config.trust_proxy_headers);
    let nonce = generate_nonce();
    req.extensions_mut().insert(CspNonce(nonce.clone()));
    req.extensions_mut().insert(ClientAddr(client.clone()));

    let authenticated = matches!(
        class,
        RouteClass::ProtectedPage | RouteClass::ProtectedApi { .. }
    ) && auth::authenticated_token(req.headers(), &state.auth_sessions).is_some();

    let mut response = match class {
        RouteClass::Passthrough | RouteClass::PublicPage | RouteClass::Unmatched => {
            next.run(req).await
        }
        RouteClass::ProtectedPage if !authenticated => Redirect::to("/login").into_response(),
        RouteClass::ProtectedApi { .. } if !authenticated => {
            GatewayError::Unauthorized.into_response()
        }
        RouteClass::ProtectedApi { write: true } => {
            match state.api_limiter.check(&client, Instant::now()) {
                Ok(()) => next.run(req).await,
                Err(wait) => {
                    warn!(%client, "API write throttled");
                    GatewayError::RateLimited {
                        retry_after_secs: retry_after_secs(wait),
                    }
                    .into_response()
                }
            }
        }
        RouteClass::ProtectedPage | RouteClass::ProtectedApi { write: false } => {
            next.run(req).await
        }
    };

    if response.extensions().get::<Proxied>().is_none() {
        apply_security_headers(&mut response, &nonce);
    }
    response
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(detail, "Handler panicked");
    GatewayError::Internal(detail.to_string()).into_response()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Pages
        .route("/login", get(login_page).post(login_submit))
        .route("/logout", get(logout))
        .route("/", get(dashboard))
        .route("/session/:id", get(session_page))
        .route("/folder", get(folder_page))
        // Sessions
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/:id", delete(delete_session))
        .route("/api/sessions/:id/start", post(start_session))
        // Tools
        .route("/api/tools", get(list_tools).post(create_tool))
        .route("/api/tools/:id", delete(delete_tool))
        // Filesystem
        .route("/api/browse", get(browse))
        .route("/api/autocomplete", get(autocomplete))
        .route("/api/diff", get(diff))
        // Editor lifecycle
        .route("/api/code-server/install", post(install_editor))
        .route("/api/code-server/installed", get(editor_installed))
        .route("/api/code-server/start", post(start_editor))
        .route("/api/code-server/stop", post(stop_editor))
        .route("/api/code-server/status", get(editor_status))
        // Backends
        .route("/terminal/:id", any(terminal_proxy))
        .route("/terminal/:id/*rest", any(terminal_proxy))
        .route("/code/:folder", any(editor_proxy))
        .route("/code/:folder/*rest", any(editor_proxy))
        .fallback(fallback)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn_with_state(state.clone(), dispatch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until Ctrl+C or SIGTERM, then stop every backend.
pub async fn run_server(state: AppState) -> anyhow::Result<()> {
    spawn_sweeper(state.clone());

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Gateway listening on http://{}", addr);

    let app = router(state.clone()).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Shutting down; stopping backends");
    state.processes.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

fn spawn_sweeper(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let now = Instant::now();
            let expired = match state.auth_sessions.sweep().await {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "Auth session sweep failed");
                    0
                }
            };
            let logins = state.login_limiter.sweep(now);
            let writes = state.api_limiter.sweep(now);
            debug!(expired, logins, writes, "Periodic sweep");
        }
    });
}

// ============================================================================
// Pages
// ============================================================================

#[derive(Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

async fn login_page(
    State(state): State<AppState>,
    Extension(CspNonce(nonce)): Extension<CspNonce>,
    headers: HeaderMap,
) -> Response {
    if auth::authenticated_token(&headers, &state.auth_sessions).is_some() {
        return Redirect::to("/").into_response();
    }
    Html(pages::login(&nonce, None)).into_response()
}

fn locked_out(nonce: &str, wait: Duration) -> Response {
    let secs = retry_after_secs(wait);
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, secs.to_string())],
        Html(pages::login(
            nonce,
            Some(&format!("Too many attempts. Try again in {secs} seconds.")),
        )),
    )
        .into_response()
}

async fn login_submit(
    State(state): State<AppState>,
    Extension(CspNonce(nonce)): Extension<CspNonce>,
    Extension(ClientAddr(client)): Extension<ClientAddr>,
    Form(form): Form<LoginForm>,
) -> Result<Response> {
    let now = Instant::now();
    if let Some(wait) = state.login_limiter.retry_after(&client, now) {
        warn!(%client, "Login rejected during lockout");
        return Ok(locked_out(&nonce, wait));
    }

    if state.credentials.verify(&form.username, &form.password).await {
        state.login_limiter.clear(&client);
        let (token, expires_at) = state.auth_sessions.issue().await?;
        info!(%client, "Login succeeded");
        let cookie = auth::session_cookie(&token, expires_at, state.config.secure_cookies);
        return Ok((
            StatusCode::SEE_OTHER,
            [(header::LOCATION, "/".to_string()), (header::SET_COOKIE, cookie)],
        )
            .into_response());
    }

    let lockout = state.login_limiter.record_failure(&client, now);
    warn!(%client, failures = state.login_limiter.failures(&client), "Login failed");
    Ok(match lockout {
        Some(wait) => locked_out(&nonce, wait),
        None => (
            StatusCode::UNAUTHORIZED,
            Html(pages::login(&nonce, Some("Invalid username or password"))),
        )
            .into_response(),
    })
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    if let Some(token) = auth::cookie_from_headers(&headers, SESSION_COOKIE) {
        state.auth_sessions.revoke(&token).await?;
        info!("Logged out");
    }
    Ok((
        StatusCode::SEE_OTHER,
        [
            (header::LOCATION, "/login".to_string()),
            (header::SET_COOKIE, auth::clear_session_cookie(state.config.secure_cookies)),
        ],
    )
        .into_response())
}

async fn dashboard(Extension(CspNonce(nonce)): Extension<CspNonce>) -> Html<String> {
    Html(pages::dashboard(&nonce))
}

async fn session_page(
    State(state): State<AppState>,
    Extension(CspNonce(nonce)): Extension<CspNonce>,
    Path(id): Path<String>,
) -> Result<Html<String>> {
    let session = state
        .registry
        .get(&id)
        .await?
        .ok_or_else(|| GatewayError::NotFound("Session not found".to_string()))?;
    let encoded = proxy::encode_folder(&session.folder);
    Ok(Html(pages::session(&nonce, &session, &encoded)))
}

#[derive(Deserialize)]
struct PathQuery {
    #[serde(default)]
    path: Option<String>,
}

async fn folder_page(
    State(state): State<AppState>,
    Extension(CspNonce(nonce)): Extension<CspNonce>,
    Query(query): Query<PathQuery>,
) -> Result<Html<String>> {
    let folder = fs_api::resolve_folder(query.path.as_deref().unwrap_or_default())?;
    let sessions: Vec<Session> = state
        .registry
        .list()
        .await?
        .into_iter()
        .filter(|s| s.folder == folder)
        .collect();
    Ok(Html(pages::folder(&nonce, &folder.to_string_lossy(), &sessions)))
}

// ============================================================================
// Sessions API
// ============================================================================

fn json_body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            Err(GatewayError::BodyTooLarge)
        }
        Err(rejection) => Err(GatewayError::validation("INVALID_BODY", rejection.body_text())),
    }
}

/// A session as listed by the API: the descriptor plus live backend state.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionView {
    #[serde(flatten)]
    session: Session,
    active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
}

impl SessionView {
    fn new(state: &AppState, session: Session) -> Self {
        let port = state.processes.terminal_port(&session.id);
        Self {
            session,
            active: port.is_some(),
            port,
        }
    }
}

async fn list_sessions(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let sessions: Vec<SessionView> = state
        .registry
        .list()
        .await?
        .into_iter()
        .map(|s| SessionView::new(&state, s))
        .collect();
    Ok(Json(json!({ "sessions": sessions })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    name: String,
    folder: String,
    #[serde(default)]
    tool_id: Option<String>,
}

async fn create_session(
    State(state): State<AppState>,
    payload: std::result::Result<Json<CreateSessionRequest>, JsonRejection>,
) -> Result<Response> {
    let req = json_body(payload)?;
    let name = req.name.trim();
    if name.is_empty() || name.chars().count() > 100 {
        return Err(GatewayError::validation(
            "INVALID_NAME",
            "Name must be 1 to 100 characters",
        ));
    }
    let folder = fs_api::resolve_folder(&req.folder)?;
    let tool_id = req.tool_id.as_deref().unwrap_or(SHELL_TOOL_ID);
    let tool = state.tools.get(tool_id).await?.ok_or_else(|| {
        GatewayError::validation("UNKNOWN_TOOL", format!("Unknown tool '{tool_id}'"))
    })?;

    let session = Session {
        id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        folder,
        kind: if tool.id == SHELL_TOOL_ID {
            SessionKind::Shell
        } else {
            SessionKind::Tool
        },
        tool_id: tool.id,
        created_at: chrono::Utc::now(),
    };
    state.registry.insert(session.clone()).await?;

    // The descriptor stays even if the backend fails to start.
    if let Err(e) = state.processes.spawn_terminal(&session, &state.tools, &state.registry).await {
        warn!(session = %session.short_id(), error = %e, "Session created without a running backend");
    }
    let view = SessionView::new(&state, session);
    Ok((StatusCode::CREATED, Json(json!({ "session": view }))).into_response())
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    let session = state
        .registry
        .remove(&id)
        .await?
        .ok_or_else(|| GatewayError::NotFound("Session not found".to_string()))?;
    state.processes.kill_terminal(&id).await;
    state.processes.kill_persistence(&session).await;
    info!(session = %session.short_id(), "Deleted session");
    Ok(StatusCode::NO_CONTENT)
}

async fn start_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let session = state
        .registry
        .get(&id)
        .await?
        .ok_or_else(|| GatewayError::NotFound("Session not found".to_string()))?;
    state.processes.spawn_terminal(&session, &state.tools, &state.registry).await?;
    Ok(Json(json!({ "session": SessionView::new(&state, session) })))
}

// ============================================================================
// Tools API
// ============================================================================

async fn list_tools(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    Ok(Json(json!({ "tools": state.tools.list().await? })))
}

async fn create_tool(
    State(state): State<AppState>,
    payload: std::result::Result<Json<NewTool>, JsonRejection>,
) -> Result<Response> {
    let tool = state.tools.add(json_body(payload)?).await?;
    Ok((StatusCode::CREATED, Json(json!({ "tool": tool }))).into_response())
}

async fn delete_tool(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    state.tools.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Filesystem API
// ============================================================================

async fn browse(Query(query): Query<PathQuery>) -> Result<Json<fs_api::Listing>> {
    Ok(Json(fs_api::browse(query.path.as_deref()).await?))
}

async fn autocomplete(Query(query): Query<PathQuery>) -> Result<Json<serde_json::Value>> {
    let suggestions = fs_api::autocomplete(query.path.as_deref().unwrap_or_default()).await?;
    Ok(Json(json!({ "suggestions": suggestions })))
}

#[derive(Deserialize)]
struct FolderQuery {
    #[serde(default)]
    folder: Option<String>,
}

async fn diff(
    State(state): State<AppState>,
    Query(query): Query<FolderQuery>,
) -> Result<Json<fs_api::DiffResult>> {
    let folder = query.folder.unwrap_or_default();
    Ok(Json(fs_api::diff(&state.processes.binaries().git, &folder).await?))
}

// ============================================================================
// Editor lifecycle API
// ============================================================================

#[derive(Deserialize)]
struct FolderBody {
    folder: String,
}

fn editor_url(folder: &std::path::Path) -> String {
    format!("/code/{}/", proxy::encode_folder(folder))
}

async fn install_editor(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let capability = state
        .processes
        .binaries()
        .install_editor()
        .await
        .map_err(|reason| GatewayError::Internal(format!("code-server install failed: {reason}")))?;
    Ok(Json(json!({
        "installed": true,
        "path": capability.path().map(|p| p.to_string_lossy().to_string()),
    })))
}

async fn editor_installed(State(state): State<AppState>) -> Json<serde_json::Value> {
    let capability = state.processes.binaries().editor();
    Json(json!({
        "installed": capability.is_available(),
        "path": capability.path().map(|p| p.to_string_lossy().to_string()),
    }))
}

async fn start_editor(
    State(state): State<AppState>,
    payload: std::result::Result<Json<FolderBody>, JsonRejection>,
) -> Result<Json<serde_json::Value>> {
    let folder = fs_api::resolve_folder(&json_body(payload)?.folder)?;
    let port = state.processes.spawn_editor(&folder).await?;
    Ok(Json(json!({
        "folder": folder,
        "port": port,
        "url": editor_url(&folder),
    })))
}

async fn stop_editor(
    State(state): State<AppState>,
    payload: std::result::Result<Json<FolderBody>, JsonRejection>,
) -> Result<StatusCode> {
    let folder = fs_api::normalize_folder(&json_body(payload)?.folder)?;
    if !state.processes.kill_editor(&folder.to_string_lossy()).await {
        return Err(GatewayError::NotFound("Editor not running for this folder".to_string()));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn editor_status(
    State(state): State<AppState>,
    Query(query): Query<FolderQuery>,
) -> Result<Json<serde_json::Value>> {
    let installed = state.processes.binaries().editor().is_available();
    if let Some(raw) = query.folder.filter(|f| !f.trim().is_empty()) {
        let folder = fs_api::normalize_folder(&raw)?;
        let port = state.processes.editor_port(&folder.to_string_lossy());
        return Ok(Json(json!({
            "installed": installed,
            "folder": folder,
            "running": port.is_some(),
            "port": port,
            "url": editor_url(&folder),
        })));
    }
    let editors: Vec<_> = state
        .processes
        .running_editors()
        .into_iter()
        .map(|(folder, port, uptime)| {
            json!({
                "url": editor_url(std::path::Path::new(&folder)),
                "folder": folder,
                "port": port,
                "uptimeSecs": uptime.as_secs(),
            })
        })
        .collect();
    Ok(Json(json!({ "installed": installed, "editors": editors })))
}

// ============================================================================
// Proxy
// ============================================================================

/// Auth for backend traffic: page loads are sent to the login form, everything
/// else (WebSocket upgrades included) is refused before a backend is dialled.
fn require_proxy_auth(state: &AppState, req: &Request) -> std::result::Result<(), Response> {
    if auth::authenticated_token(req.headers(), &state.auth_sessions).is_some() {
        return Ok(());
    }
    if req.method() == Method::GET && !proxy::is_websocket_upgrade(req.headers()) {
        return Err(Redirect::to("/login").into_response());
    }
    debug!(path = %req.uri().path(), "Unauthenticated backend request refused");
    Err(GatewayError::Unauthorized.into_response())
}

#[derive(Deserialize)]
struct TerminalParams {
    id: String,
}

async fn terminal_proxy(
    State(state): State<AppState>,
    Path(params): Path<TerminalParams>,
    req: Request,
) -> Result<Response> {
    if let Err(response) = require_proxy_auth(&state, &req) {
        return Ok(response);
    }
    let target = proxy::terminal_target(&state.processes, &params.id, req.uri())?;
    proxy::proxy(&state.http_client, target, req).await
}

/// The backend path is cut from the raw URI, so percent-escapes reach the editor untouched.
async fn editor_proxy(State(state): State<AppState>, req: Request) -> Result<Response> {
    if let Err(response) = require_proxy_auth(&state, &req) {
        return Ok(response);
    }
    let current = auth::cookie_from_headers(req.headers(), ROUTING_COOKIE);
    let target = proxy::editor_target(&state.processes, req.uri(), current.as_deref())?;
    proxy::proxy(&state.http_client, target, req).await
}

/// Editor assets requested at absolute paths are routed by the routing cookie.
async fn fallback(State(state): State<AppState>, req: Request) -> Result<Response> {
    if auth::authenticated_token(req.headers(), &state.auth_sessions).is_some() {
        if let Some(encoded) = auth::cookie_from_headers(req.headers(), ROUTING_COOKIE) {
            if let Ok(target) = proxy::cookie_target(&state.processes, &encoded, req.uri()) {
                return proxy::proxy(&state.http_client, target, req).await;
            }
        }
    }
    Err(GatewayError::NotFound("Not found".to_string()))
}
