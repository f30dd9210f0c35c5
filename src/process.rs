//! Backend process lifecycle: terminal backends per session, editor backends per folder.
//!
//! Every live backend owns exactly one port from its kind's range. A handle is
//! removed, and its port released, either by an explicit kill or by the
//! watcher task when the child exits on its own; whichever runs second is a
//! no-op.

use crate::binaries::{Binaries, Capability};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::ports::{self, PortAllocator, Readiness};
use crate::registry::{Session, SessionRegistry};
use crate::tools::ToolRegistry;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

const PING_INTERVAL_SECS: &str = "30";
const PERSISTENCE_TIMEOUT: Duration = Duration::from_secs(5);
const TMUX_SESSION_NAME: &str = "termgate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Terminal,
    Editor,
}

impl BackendKind {
    fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Terminal => "terminal",
            BackendKind::Editor => "editor",
        }
    }
}

#[derive(Debug, Clone)]
struct BackendHandle {
    port: u16,
    pid: Option<u32>,
    generation: u64,
    started_at: Instant,
}

/// Live handles of one backend kind plus the port range they draw from.
#[derive(Debug)]
struct Pool {
    kind: BackendKind,
    ports: PortAllocator,
    handles: Mutex<HashMap<String, BackendHandle>>,
    /// Serializes check-spawn-insert and kill for this kind.
    spawn_lock: tokio::sync::Mutex<()>,
}

impl Pool {
    fn new(kind: BackendKind, ports: PortAllocator) -> Self {
        Self {
            kind,
            ports,
            handles: Mutex::new(HashMap::new()),
            spawn_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BackendHandle>> {
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn port_of(&self, key: &str) -> Option<u16> {
        self.lock().get(key).map(|h| h.port)
    }

    fn is_current(&self, key: &str, generation: u64) -> bool {
        self.lock().get(key).is_some_and(|h| h.generation == generation)
    }

    /// Exit-path cleanup; only removes the handle it was started for.
    async fn on_exit(&self, key: &str, generation: u64) -> bool {
        let removed = {
            let mut handles = self.lock();
            match handles.get(key) {
                Some(h) if h.generation == generation => handles.remove(key),
                _ => None,
            }
        };
        match removed {
            Some(handle) => {
                self.ports.release(handle.port).await;
                true
            }
            None => false,
        }
    }
}

/// Owns the mapping from session/folder to a live backend process and its port.
#[derive(Debug)]
pub struct ProcessManager {
    terminals: Arc<Pool>,
    editors: Arc<Pool>,
    binaries: Arc<Binaries>,
    editors_dir: PathBuf,
    ready_timeout: Duration,
    next_generation: AtomicU64,
}

impl ProcessManager {
    pub fn new(config: &GatewayConfig, binaries: Arc<Binaries>) -> Self {
        Self {
            terminals: Arc::new(Pool::new(
                BackendKind::Terminal,
                PortAllocator::new(config.terminal_ports),
            )),
            editors: Arc::new(Pool::new(
                BackendKind::Editor,
                PortAllocator::new(config.editor_ports),
            )),
            binaries,
            editors_dir: config.editors_dir(),
            ready_timeout: config.ready_timeout,
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn binaries(&self) -> &Binaries {
        &self.binaries
    }

    pub fn terminal_port(&self, session_id: &str) -> Option<u16> {
        self.terminals.port_of(session_id)
    }

    pub fn editor_port(&self, folder: &str) -> Option<u16> {
        self.editors.port_of(folder)
    }

    /// Running editor backends as `(folder, port, uptime)`.
    pub fn running_editors(&self) -> Vec<(String, u16, Duration)> {
        let mut out: Vec<_> = self
            .editors
            .lock()
            .iter()
            .map(|(folder, h)| (folder.clone(), h.port, h.started_at.elapsed()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Start (or return) the terminal backend for a session.
    ///
    /// The session must still be in `registry` once the spawn lock is held, so
    /// a delete racing with creation never leaves an orphaned backend.
    pub async fn spawn_terminal(
        &self,
        session: &Session,
        tools: &ToolRegistry,
        registry: &SessionRegistry,
    ) -> Result<u16> {
        if let Some(port) = self.terminal_port(&session.id) {
            return Ok(port);
        }
        let tool = tools.get(&session.tool_id).await?.ok_or_else(|| {
            GatewayError::validation(
                "UNKNOWN_TOOL",
                format!("Unknown tool '{}'", session.tool_id),
            )
        })?;
        let ttyd = match &self.binaries.ttyd {
            Capability::Available(path) => path.clone(),
            Capability::Unavailable(reason) => {
                return Err(GatewayError::Internal(format!("terminal backend unavailable: {reason}")))
            }
        };
        let downstream = downstream_command(session, &tool.command, &self.binaries.tmux);
        let base_path = format!("/terminal/{}", session.id);
        let folder = session.folder.clone();
        let still_registered = async {
            match registry.get(&session.id).await? {
                Some(_) => Ok(()),
                None => Err(GatewayError::NotFound("Session not found".to_string())),
            }
        };

        self.spawn_with(
            &self.terminals,
            session.id.clone(),
            session.short_id().to_string(),
            still_registered,
            move |port| {
                let mut cmd = Command::new(&ttyd);
                cmd.args(["-p", &port.to_string(), "-i", "127.0.0.1"])
                    .args(["-W", "-P", PING_INTERVAL_SECS, "-m", "0"])
                    .args(["-b", &base_path])
                    .args(&downstream)
                    .current_dir(&folder)
                    .env("TERM", "xterm-256color");
                cmd
            },
        )
        .await
    }

    /// Start (or return) the editor backend for a folder.
    pub async fn spawn_editor(&self, folder: &Path) -> Result<u16> {
        let key = folder.to_string_lossy().to_string();
        if let Some(port) = self.editor_port(&key) {
            return Ok(port);
        }
        let editor = match self.binaries.editor() {
            Capability::Available(path) => path,
            Capability::Unavailable(reason) => {
                return Err(GatewayError::validation(
                    "EDITOR_NOT_INSTALLED",
                    format!("code-server is not installed: {reason}"),
                ))
            }
        };
        let hash = folder_hash(folder);
        let data_dir = self.editors_dir.join(&hash);
        tokio::fs::create_dir_all(&data_dir).await?;
        let folder = folder.to_path_buf();

        let tag = format!("code:{}", &hash[..8]);
        self.spawn_with(&self.editors, key, tag, std::future::ready(Ok(())), move |port| {
            let mut cmd = Command::new(&editor);
            cmd.args(["--bind-addr", &format!("127.0.0.1:{port}")])
                .args(["--auth", "none", "--disable-telemetry", "--disable-update-check"])
                .arg("--user-data-dir")
                .arg(&data_dir)
                .arg(&folder)
                .current_dir(&folder);
            cmd
        })
        .await
    }

    /// Spawn a backend built by `build` on a freshly reserved port.
    ///
    /// Idempotent per key: a live handle's port is returned unchanged.
    /// `precheck` runs under the spawn lock and can veto the spawn.
    async fn spawn_with<F, P>(
        &self,
        pool: &Arc<Pool>,
        key: String,
        tag: String,
        precheck: P,
        build: F,
    ) -> Result<u16>
    where
        F: FnOnce(u16) -> Command,
        P: Future<Output = Result<()>>,
    {
        let spawn_guard = pool.spawn_lock.lock().await;
        if let Some(port) = pool.port_of(&key) {
            return Ok(port);
        }
        precheck.await?;

        let port = pool.ports.reserve().await?;
        let mut cmd = build(port);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                pool.ports.release(port).await;
                return Err(GatewayError::Internal(format!(
                    "failed to spawn {} backend: {e}",
                    pool.kind.as_str()
                )));
            }
        };

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();
        pool.lock().insert(
            key.clone(),
            BackendHandle {
                port,
                pid,
                generation,
                started_at: Instant::now(),
            },
        );
        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, tag.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, tag.clone(), "stderr");
        }
        tokio::spawn(watch_exit(pool.clone(), key.clone(), generation, child, tag.clone()));
        drop(spawn_guard);

        info!(kind = pool.kind.as_str(), backend = %tag, port, ?pid, "Spawned backend");

        let alive = || pool.is_current(&key, generation);
        match ports::wait_until_listening(port, self.ready_timeout, alive).await {
            Readiness::Listening => {
                debug!(backend = %tag, port, "Backend accepting connections");
                Ok(port)
            }
            Readiness::Exited => Err(GatewayError::UpstreamUnavailable(format!(
                "{} backend {tag} exited during startup",
                pool.kind.as_str()
            ))),
            Readiness::TimedOut => {
                warn!(backend = %tag, port, "Backend not accepting connections yet");
                Ok(port)
            }
        }
    }

    /// Track an already-listening terminal backend without spawning one.
    #[cfg(test)]
    pub(crate) fn adopt_terminal(&self, session_id: &str, port: u16) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.terminals.lock().insert(
            session_id.to_string(),
            BackendHandle {
                port,
                pid: None,
                generation,
                started_at: Instant::now(),
            },
        );
    }

    /// Track an already-listening editor backend without spawning one.
    #[cfg(test)]
    pub(crate) fn adopt_editor(&self, folder: &str, port: u16) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        self.editors.lock().insert(
            folder.to_string(),
            BackendHandle {
                port,
                pid: None,
                generation,
                started_at: Instant::now(),
            },
        );
    }

    pub async fn kill_terminal(&self, session_id: &str) -> bool {
        kill_backend(&self.terminals, session_id).await
    }

    pub async fn kill_editor(&self, folder: &str) -> bool {
        kill_backend(&self.editors, folder).await
    }

    /// Tear down the pane-persistence server so a later spawn starts fresh.
    pub async fn kill_persistence(&self, session: &Session) {
        let Capability::Available(tmux) = &self.binaries.tmux else {
            return;
        };
        let run = Command::new(tmux)
            .args(["-L", &socket_name(session), "kill-server"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status();
        match tokio::time::timeout(PERSISTENCE_TIMEOUT, run).await {
            Ok(Ok(status)) => debug!(session = %session.short_id(), %status, "Persistence server stopped"),
            Ok(Err(e)) => warn!(session = %session.short_id(), error = %e, "Failed to stop persistence server"),
            Err(_) => warn!(session = %session.short_id(), "Timed out stopping persistence server"),
        }
    }

    /// Re-spawn a terminal backend for every registered session.
    ///
    /// Backends are children of the gateway and never outlive it, so this runs
    /// on every start. One failure does not stop the rest.
    pub async fn recover(&self, registry: &SessionRegistry, tools: &ToolRegistry) -> usize {
        let sessions = match registry.list().await {
            Ok(sessions) => sessions,
            Err(e) => {
                error!(error = %e, "Could not read session registry for recovery");
                return 0;
            }
        };
        let total = sessions.len();
        let results = futures_util::future::join_all(sessions.iter().map(|session| async move {
            match self.spawn_terminal(session, tools, registry).await {
                Ok(port) => {
                    info!(session = %session.short_id(), port, "Recovered session");
                    true
                }
                Err(e) => {
                    warn!(session = %session.short_id(), error = %e, "Failed to recover session");
                    false
                }
            }
        }))
        .await;
        let recovered = results.into_iter().filter(|ok| *ok).count();
        info!(recovered, total, "Session recovery finished");
        recovered
    }

    /// Terminate every tracked backend.
    pub async fn shutdown(&self) {
        for pool in [&self.terminals, &self.editors] {
            let keys: Vec<String> = pool.lock().keys().cloned().collect();
            for key in keys {
                kill_backend(pool, &key).await;
            }
        }
        info!("All backends stopped");
    }
}

/// Signal the backend and drop its bookkeeping without waiting for exit.
async fn kill_backend(pool: &Pool, key: &str) -> bool {
    let _spawn_guard = pool.spawn_lock.lock().await;
    let removed = pool.lock().remove(key);
    let Some(handle) = removed else {
        return false;
    };
    pool.ports.release(handle.port).await;
    if let Some(pid) = handle.pid {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!(kind = pool.kind.as_str(), pid, error = %e, "Failed to signal backend");
        }
    }
    info!(kind = pool.kind.as_str(), port = handle.port, "Stopped backend");
    true
}

async fn watch_exit(pool: Arc<Pool>, key: String, generation: u64, mut child: Child, tag: String) {
    match child.wait().await {
        Ok(status) => info!(kind = pool.kind.as_str(), backend = %tag, %status, "Backend exited"),
        Err(e) => error!(kind = pool.kind.as_str(), backend = %tag, error = %e, "Failed waiting on backend"),
    }
    if pool.on_exit(&key, generation).await {
        debug!(backend = %tag, "Released resources of exited backend");
    }
}

fn forward_output<R>(stream: R, tag: String, channel: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "termgate::backend", backend = %tag, channel, "{line}");
        }
    });
}

/// Pane-persistence socket name, stable for a session across restarts.
pub fn socket_name(session: &Session) -> String {
    let id: String = session.id.chars().filter(|c| c.is_ascii_alphanumeric()).take(12).collect();
    format!("termgate-{}-{id}", session.kind.as_str())
}

/// Command ttyd runs for a session: wrapped in tmux when available.
fn downstream_command(session: &Session, tool_command: &str, tmux: &Capability) -> Vec<String> {
    let words: Vec<String> = tool_command.split_whitespace().map(str::to_string).collect();
    match tmux {
        Capability::Available(tmux) => {
            let mut cmd = vec![
                tmux.to_string_lossy().to_string(),
                "-L".to_string(),
                socket_name(session),
                "new-session".to_string(),
                "-A".to_string(),
                "-s".to_string(),
                TMUX_SESSION_NAME.to_string(),
                "-c".to_string(),
                session.folder.to_string_lossy().to_string(),
            ];
            cmd.extend(words);
            cmd
        }
        Capability::Unavailable(_) => words,
    }
}

/// Stable per-folder identifier for editor data directories.
pub fn folder_hash(folder: &Path) -> String {
    let digest = Sha256::digest(folder.to_string_lossy().as_bytes());
    hex::encode(digest)[..16].to_string()
}
