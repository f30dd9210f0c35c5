//! Credential record, password verification, and the auth-session table behind the session cookie.

use crate::error::{GatewayError, Result};
use crate::persist;
use axum::http::{header, HeaderMap};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

pub const SESSION_COOKIE: &str = "termgate_session";

const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;
const HASH_LEN: usize = 64;
const SALT_LEN: usize = 16;
const TOKEN_BYTES: usize = 32;

/// The single username / password-hash record, hex encoded on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub salt: String,
    pub hash: String,
}

impl Credentials {
    /// Derive a fresh record with a random salt.
    pub fn create(username: &str, password: &str) -> anyhow::Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let hash = derive(password.as_bytes(), &salt)?;
        Ok(Self {
            username: username.to_string(),
            salt: hex::encode(salt),
            hash: hex::encode(hash),
        })
    }
}

fn derive(password: &[u8], salt: &[u8]) -> anyhow::Result<Vec<u8>> {
    let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, HASH_LEN)
        .map_err(|e| anyhow::anyhow!("scrypt params: {e}"))?;
    let mut out = vec![0u8; HASH_LEN];
    scrypt::scrypt(password, salt, &params, &mut out)
        .map_err(|e| anyhow::anyhow!("scrypt: {e}"))?;
    Ok(out)
}

/// Loaded credential record. Loading failure is fatal at startup.
#[derive(Debug)]
pub struct CredentialStore {
    username: String,
    salt: Vec<u8>,
    hash: Vec<u8>,
}

impl CredentialStore {
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let creds: Credentials = persist::read_json(path)
            .await?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "no credentials at {}; run `termgate set-password` first",
                    path.display()
                )
            })?;
        Self::from_record(creds)
    }

    pub fn from_record(creds: Credentials) -> anyhow::Result<Self> {
        let salt = hex::decode(&creds.salt)?;
        let hash = hex::decode(&creds.hash)?;
        if creds.username.is_empty() || salt.is_empty() || hash.len() != HASH_LEN {
            anyhow::bail!("credential record is malformed");
        }
        Ok(Self {
            username: creds.username,
            salt,
            hash,
        })
    }

    /// Recompute the scrypt hash and compare in constant time.
    ///
    /// Runs on the blocking pool since scrypt is deliberately slow.
    pub async fn verify(&self, username: &str, password: &str) -> bool {
        let salt = self.salt.clone();
        let password = password.as_bytes().to_vec();
        let computed = match tokio::task::spawn_blocking(move || derive(&password, &salt)).await {
            Ok(Ok(hash)) => hash,
            Ok(Err(e)) => {
                warn!(error = %e, "password derivation failed");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "password derivation task failed");
                return false;
            }
        };
        let user_ok = username.as_bytes().ct_eq(self.username.as_bytes());
        let hash_ok = computed.as_slice().ct_eq(self.hash.as_slice());
        bool::from(user_ok & hash_ok)
    }
}

/// Token → expiry table, persisted so logins survive gateway restarts.
#[derive(Debug)]
pub struct AuthSessionStore {
    path: PathBuf,
    ttl: Duration,
    tokens: Mutex<HashMap<String, DateTime<Utc>>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl AuthSessionStore {
    pub async fn load(path: PathBuf, ttl: Duration) -> Result<Self> {
        let stored: HashMap<String, DateTime<Utc>> =
            persist::read_json(&path).await?.unwrap_or_default();
        let now = Utc::now();
        let tokens: HashMap<_, _> = stored.into_iter().filter(|(_, exp)| *exp > now).collect();
        info!(count = tokens.len(), "Loaded auth sessions");
        Ok(Self {
            path,
            ttl,
            tokens: Mutex::new(tokens),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Issue a new token expiring at `now + ttl` and persist the table.
    pub async fn issue(&self) -> Result<(String, DateTime<Utc>)> {
        let mut raw = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut raw);
        let token = hex::encode(raw);
        let ttl = ChronoDuration::from_std(self.ttl)
            .map_err(|e| GatewayError::Internal(format!("session ttl: {e}")))?;
        let expires_at = Utc::now() + ttl;
        self.lock().insert(token.clone(), expires_at);
        self.persist().await?;
        Ok((token, expires_at))
    }

    /// True when the token exists and has not expired. Expired entries are dropped on sight.
    pub fn validate(&self, token: &str) -> bool {
        self.validate_at(token, Utc::now())
    }

    fn validate_at(&self, token: &str, now: DateTime<Utc>) -> bool {
        let mut tokens = self.lock();
        match tokens.get(token) {
            Some(exp) if *exp > now => true,
            Some(_) => {
                tokens.remove(token);
                debug!("Dropped expired auth session");
                false
            }
            None => false,
        }
    }

    pub fn expires_at(&self, token: &str) -> Option<DateTime<Utc>> {
        self.lock().get(token).copied()
    }

    pub async fn revoke(&self, token: &str) -> Result<()> {
        let removed = self.lock().remove(token).is_some();
        if removed {
            self.persist().await?;
        }
        Ok(())
    }

    /// Drop every expired entry; persists only when something was removed.
    pub async fn sweep(&self) -> Result<usize> {
        let now = Utc::now();
        let removed = {
            let mut tokens = self.lock();
            let before = tokens.len();
            tokens.retain(|_, exp| *exp > now);
            before - tokens.len()
        };
        if removed > 0 {
            self.persist().await?;
        }
        Ok(removed)
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = self.lock().clone();
        persist::write_json(&self.path, &snapshot).await?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.tokens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Find a named cookie in a `Cookie` header.
pub fn cookie_value<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    for part in cookie_header.split(';') {
        let trimmed = part.trim();
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        if key == name {
            return Some(value);
        }
    }
    None
}

pub fn cookie_from_headers(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|raw| cookie_value(raw, name).map(str::to_string))
}

/// Token from the session cookie, if it names a live auth session.
pub fn authenticated_token(headers: &HeaderMap, store: &AuthSessionStore) -> Option<String> {
    let token = cookie_from_headers(headers, SESSION_COOKIE)?;
    store.validate(&token).then_some(token)
}

pub fn session_cookie(token: &str, expires_at: DateTime<Utc>, secure: bool) -> String {
    let mut cookie = format!(
        "{SESSION_COOKIE}={token}; HttpOnly; SameSite=Strict; Path=/; Expires={}",
        expires_at.format("%a, %d %b %Y %H:%M:%S GMT")
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn clear_session_cookie(secure: bool) -> String {
    let mut cookie = format!("{SESSION_COOKIE}=; HttpOnly; SameSite=Strict; Path=/; Max-Age=0");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Client address for rate limiting: trusted proxy headers first, then the peer address.
pub fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        for name in ["cf-connecting-ip", "x-real-ip"] {
            if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = forwarded.split(',').next() {
                let trimmed = first.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_verify_accepts_matching_password() {
        let store = CredentialStore::from_record(Credentials::create("admin", "hunter22").unwrap())
            .unwrap();
        assert!(store.verify("admin", "hunter22").await);
        assert!(!store.verify("admin", "hunter23").await);
        assert!(!store.verify("root", "hunter22").await);
    }

    #[test]
    fn test_malformed_record_rejected() {
        let creds = Credentials {
            username: "admin".into(),
            salt: "zz".into(),
            hash: "00".into(),
        };
        assert!(CredentialStore::from_record(creds).is_err());
    }

    #[tokio::test]
    async fn test_missing_credentials_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CredentialStore::load(&dir.path().join("credentials.json")).await.is_err());
    }

    #[tokio::test]
    async fn test_issue_validate_revoke() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth_sessions.json");
        let store = AuthSessionStore::load(path.clone(), Duration::from_secs(3600))
            .await
            .unwrap();
        let before = Utc::now();
        let (token, expires_at) = store.issue().await.unwrap();
        assert!(store.validate(&token));
        assert!(expires_at >= before + ChronoDuration::seconds(3600));
        assert!(expires_at <= Utc::now() + ChronoDuration::seconds(3600));

        store.revoke(&token).await.unwrap();
        assert!(!store.validate(&token));
    }

    #[tokio::test]
    async fn test_sessions_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth_sessions.json");
        let store = AuthSessionStore::load(path.clone(), Duration::from_secs(3600))
            .await
            .unwrap();
        let (token, _) = store.issue().await.unwrap();

        let reloaded = AuthSessionStore::load(path, Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(reloaded.validate(&token));
    }

    #[tokio::test]
    async fn test_expired_token_removed_on_access() {
        let dir = tempfile::tempdir().unwrap();
        let store = AuthSessionStore::load(dir.path().join("a.json"), Duration::from_secs(10))
            .await
            .unwrap();
        let (token, expires_at) = store.issue().await.unwrap();
        assert!(!store.validate_at(&token, expires_at + ChronoDuration::seconds(1)));
        assert!(store.expires_at(&token).is_none());
    }

    #[test]
    fn test_cookie_value_found() {
        let value = cookie_value("foo=1; termgate_session=abc123; bar=2", SESSION_COOKIE);
        assert_eq!(value, Some("abc123"));
    }

    #[test]
    fn test_cookie_value_missing() {
        assert_eq!(cookie_value("foo=1; bar=2", SESSION_COOKIE), None);
    }

    #[test]
    fn test_session_cookie_attributes() {
        let exp = Utc::now();
        let cookie = session_cookie("tok", exp, true);
        assert!(cookie.starts_with("termgate_session=tok;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Expires="));
        assert!(cookie.ends_with("; Secure"));
        assert!(!session_cookie("tok", exp, false).contains("Secure"));
    }

    #[test]
    fn test_client_address_prefers_proxy_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.8, 10.0.0.1".parse().unwrap());
        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        assert_eq!(client_address(&headers, Some(peer), true), "203.0.113.8");
        assert_eq!(client_address(&headers, Some(peer), false), "127.0.0.1");
    }

    #[test]
    fn test_client_address_without_peer() {
        assert_eq!(client_address(&HeaderMap::new(), None, true), "unknown");
    }
}
