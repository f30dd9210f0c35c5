//! External programs the gateway drives, resolved once at startup.
//!
//! Each lookup produces a typed [`Capability`]; callers match on it instead of
//! probing install paths at request time.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::RwLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

const INSTALL_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const EDITOR_INSTALL_SCRIPT: &str =
    "curl -fsSL https://code-server.dev/install.sh | sh -s -- --method=standalone";

/// Whether an external program can be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Available(PathBuf),
    Unavailable(String),
}

impl Capability {
    pub fn path(&self) -> Option<&Path> {
        match self {
            Capability::Available(path) => Some(path),
            Capability::Unavailable(_) => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available(_))
    }
}

/// Resolve `program`: explicit env override, then PATH, then well-known install dirs.
pub fn resolve(program: &str, env_override: &str, extra_dirs: &[PathBuf]) -> Capability {
    if let Ok(p) = std::env::var(env_override) {
        let p = p.trim();
        if !p.is_empty() {
            let path = PathBuf::from(p);
            if path.exists() {
                return Capability::Available(path);
            }
            return Capability::Unavailable(format!("{env_override}={p} does not exist"));
        }
    }

    if let Ok(p) = which::which(program) {
        return Capability::Available(p);
    }

    for dir in extra_dirs {
        let candidate = dir.join(program);
        if candidate.is_file() {
            return Capability::Available(candidate);
        }
    }

    Capability::Unavailable(format!("{program} not found on PATH"))
}

fn common_install_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(".local").join("bin"));
    }
    dirs.push(PathBuf::from("/usr/local/bin"));
    dirs.push(PathBuf::from("/opt/homebrew/bin"));
    dirs.push(PathBuf::from("/usr/bin"));
    dirs
}

/// Resolved external programs.
#[derive(Debug)]
pub struct Binaries {
    /// Terminal-to-WebSocket backend
    pub ttyd: Capability,
    /// Pane-persistence utility
    pub tmux: Capability,
    /// Used by the diff endpoint
    pub git: Capability,
    /// Browser editor backend; re-resolved after an install
    editor: RwLock<Capability>,
}

impl Binaries {
    pub fn discover() -> Self {
        let extra = common_install_dirs();
        let binaries = Self {
            ttyd: resolve("ttyd", "TERMGATE_TTYD", &extra),
            tmux: resolve("tmux", "TERMGATE_TMUX", &extra),
            git: resolve("git", "TERMGATE_GIT", &extra),
            editor: RwLock::new(resolve("code-server", "TERMGATE_CODE_SERVER", &extra)),
        };
        binaries.log_summary();
        binaries
    }

    pub fn new(ttyd: Capability, tmux: Capability, git: Capability, editor: Capability) -> Self {
        Self {
            ttyd,
            tmux,
            git,
            editor: RwLock::new(editor),
        }
    }

    pub fn editor(&self) -> Capability {
        self.editor
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn set_editor(&self, capability: Capability) {
        *self
            .editor
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = capability;
    }

    fn log_summary(&self) {
        let editor = self.editor();
        for (name, cap) in [
            ("ttyd", &self.ttyd),
            ("tmux", &self.tmux),
            ("git", &self.git),
            ("code-server", &editor),
        ] {
            match cap {
                Capability::Available(path) => info!(program = name, path = %path.display(), "Found"),
                Capability::Unavailable(reason) => warn!(program = name, %reason, "Unavailable"),
            }
        }
    }

    /// Run the upstream editor installer, then re-resolve the editor capability.
    pub async fn install_editor(&self) -> Result<Capability, String> {
        if let Capability::Available(path) = self.editor() {
            return Ok(Capability::Available(path));
        }
        info!("Installing code-server");
        let run = Command::new("sh")
            .args(["-c", EDITOR_INSTALL_SCRIPT])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(INSTALL_TIMEOUT, run).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(format!("failed to start installer: {e}")),
            Err(_) => return Err("installer timed out".to_string()),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().join("\n");
            return Err(format!("installer exited with {}: {tail}", output.status));
        }
        let capability = resolve("code-server", "TERMGATE_CODE_SERVER", &common_install_dirs());
        self.set_editor(capability.clone());
        match &capability {
            Capability::Available(path) => {
                info!(path = %path.display(), "code-server installed");
                Ok(capability)
            }
            Capability::Unavailable(reason) => Err(reason.clone()),
        }
    }
}
