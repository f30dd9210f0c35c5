//! Shared application state.

use crate::auth::{AuthSessionStore, CredentialStore};
use crate::binaries::Binaries;
use crate::config::GatewayConfig;
use crate::process::ProcessManager;
use crate::rate_limit::{ApiLimiter, LoginLimiter};
use crate::registry::SessionRegistry;
use crate::tools::ToolRegistry;
use std::sync::Arc;

/// Handle cloned into every request; all components behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub credentials: Arc<CredentialStore>,
    pub auth_sessions: Arc<AuthSessionStore>,
    pub login_limiter: Arc<LoginLimiter>,
    pub api_limiter: Arc<ApiLimiter>,
    pub registry: Arc<SessionRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub processes: Arc<ProcessManager>,
    /// Outbound client for plain proxied requests
    pub http_client: reqwest::Client,
}

impl AppState {
    /// Wire components from config. Credentials are loaded by the caller
    /// because a missing record is fatal before anything else starts.
    pub async fn new(
        config: GatewayConfig,
        credentials: CredentialStore,
        binaries: Arc<Binaries>,
    ) -> anyhow::Result<Self> {
        let auth_sessions =
            AuthSessionStore::load(config.auth_sessions_path(), config.session_expiry).await?;
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            credentials: Arc::new(credentials),
            auth_sessions: Arc::new(auth_sessions),
            login_limiter: Arc::new(LoginLimiter::default()),
            api_limiter: Arc::new(ApiLimiter::new(config.api_rate_limit, config.api_rate_window)),
            registry: Arc::new(SessionRegistry::new(config.sessions_path())),
            tools: Arc::new(ToolRegistry::new(config.tools_path())),
            processes: Arc::new(ProcessManager::new(&config, binaries)),
            http_client,
            config: Arc::new(config),
        })
    }
}
