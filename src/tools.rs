//! Invokable backend commands: immutable builtins plus persisted custom entries.

use crate::error::{GatewayError, Result};
use crate::persist;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::sync::Mutex;
use tracing::info;

pub const SHELL_TOOL_ID: &str = "shell";

/// A command a session can run inside its terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub id: String,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub builtin: bool,
}

fn builtin_tools() -> Vec<Tool> {
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    [
        (SHELL_TOOL_ID, "Shell", shell.as_str()),
        ("claude", "Claude", "claude"),
        ("codex", "Codex", "codex"),
        ("aider", "Aider", "aider"),
    ]
    .into_iter()
    .map(|(id, name, command)| Tool {
        id: id.to_string(),
        name: name.to_string(),
        command: command.to_string(),
        builtin: true,
    })
    .collect()
}

fn id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,31}$").expect("static regex"))
}

fn metachar_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[;&|`$<>(){}\\\n\r!*?\[\]#~]").expect("static regex"))
}

/// Payload for a new custom tool.
#[derive(Debug, Deserialize)]
pub struct NewTool {
    pub id: String,
    pub name: String,
    pub command: String,
}

impl NewTool {
    pub fn validate(&self) -> Result<Tool> {
        let id = self.id.trim();
        if !id_pattern().is_match(id) {
            return Err(GatewayError::validation(
                "INVALID_TOOL_ID",
                "Tool id must be 1-32 lowercase letters, digits, '-' or '_'",
            ));
        }
        let name = self.name.trim();
        if name.is_empty() || name.chars().count() > 64 {
            return Err(GatewayError::validation(
                "INVALID_TOOL_NAME",
                "Tool name must be 1-64 characters",
            ));
        }
        let command = self.command.trim();
        if command.is_empty() || command.len() > 512 {
            return Err(GatewayError::validation(
                "INVALID_TOOL_COMMAND",
                "Tool command must be 1-512 characters",
            ));
        }
        if metachar_pattern().is_match(command) {
            return Err(GatewayError::validation(
                "INVALID_TOOL_COMMAND",
                "Tool command must not contain shell metacharacters",
            ));
        }
        Ok(Tool {
            id: id.to_string(),
            name: name.to_string(),
            command: command.to_string(),
            builtin: false,
        })
    }
}

/// Builtin + custom tools; custom entries persisted to `tools.json`.
#[derive(Debug)]
pub struct ToolRegistry {
    path: PathBuf,
    builtins: Vec<Tool>,
    guard: Mutex<()>,
}

impl ToolRegistry {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            builtins: builtin_tools(),
            guard: Mutex::new(()),
        }
    }

    async fn load_custom(&self) -> Result<Vec<Tool>> {
        let mut custom: Vec<Tool> = persist::read_json(&self.path).await?.unwrap_or_default();
        for tool in &mut custom {
            tool.builtin = false;
        }
        Ok(custom)
    }

    pub async fn list(&self) -> Result<Vec<Tool>> {
        let mut all = self.builtins.clone();
        all.extend(self.load_custom().await?);
        Ok(all)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Tool>> {
        if let Some(tool) = self.builtins.iter().find(|t| t.id == id) {
            return Ok(Some(tool.clone()));
        }
        Ok(self.load_custom().await?.into_iter().find(|t| t.id == id))
    }

    pub async fn add(&self, new: NewTool) -> Result<Tool> {
        let tool = new.validate()?;
        let _guard = self.guard.lock().await;
        let mut custom = self.load_custom().await?;
        if self.builtins.iter().any(|t| t.id == tool.id) || custom.iter().any(|t| t.id == tool.id) {
            return Err(GatewayError::validation(
                "DUPLICATE_TOOL_ID",
                format!("Tool '{}' already exists", tool.id),
            ));
        }
        custom.push(tool.clone());
        persist::write_json(&self.path, &custom).await?;
        info!(tool = %tool.id, "Added custom tool");
        Ok(tool)
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        if self.builtins.iter().any(|t| t.id == id) {
            return Err(GatewayError::validation(
                "BUILTIN_TOOL",
                "Builtin tools cannot be removed",
            ));
        }
        let _guard = self.guard.lock().await;
        let mut custom = self.load_custom().await?;
        let before = custom.len();
        custom.retain(|t| t.id != id);
        if custom.len() == before {
            return Err(GatewayError::NotFound("Tool not found".to_string()));
        }
        persist::write_json(&self.path, &custom).await?;
        info!(tool = %id, "Removed custom tool");
        Ok(())
    }
}
