//! Local filesystem helpers behind `/api/browse`, `/api/autocomplete`, and `/api/diff`.

use crate::binaries::Capability;
use crate::error::{GatewayError, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const DIFF_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_SUGGESTIONS: usize = 20;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
}

#[derive(Debug, Serialize)]
pub struct Listing {
    pub path: String,
    pub parent: Option<String>,
    pub entries: Vec<DirEntry>,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FileDiff {
    pub path: String,
    pub additions: usize,
    pub deletions: usize,
}

#[derive(Debug, Serialize)]
pub struct DiffResult {
    pub folder: String,
    pub files: Vec<FileDiff>,
    pub diff: String,
}

fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => dirs::home_dir()
            .map(|home| home.join(rest.trim_start_matches('/')))
            .unwrap_or_else(|| PathBuf::from(raw)),
        _ => PathBuf::from(raw),
    }
}

/// Normalize a user-supplied working directory. It must exist and be a directory.
pub fn resolve_folder(raw: &str) -> Result<PathBuf> {
    let path = normalize_folder(raw)?;
    if !path.is_dir() {
        return Err(GatewayError::validation(
            "FOLDER_NOT_FOUND",
            format!("Folder does not exist: {}", path.display()),
        ));
    }
    Ok(path)
}

/// Canonical spelling of a folder key without touching the filesystem: `~`
/// expanded, absolute, no trailing slash.
pub fn normalize_folder(raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(GatewayError::validation("FOLDER_REQUIRED", "Folder is required"));
    }
    let path = expand_home(raw);
    if !path.is_absolute() {
        return Err(GatewayError::validation(
            "FOLDER_NOT_ABSOLUTE",
            "Folder must be an absolute path",
        ));
    }
    let text = path.to_string_lossy();
    let trimmed = text.trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(PathBuf::from("/"));
    }
    Ok(PathBuf::from(trimmed))
}

/// List a directory, directories first, dotfiles hidden.
pub async fn browse(raw: Option<&str>) -> Result<Listing> {
    let path = match raw.filter(|p| !p.trim().is_empty()) {
        Some(raw) => resolve_folder(raw)?,
        None => dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
    };

    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(&path).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let is_dir = tokio::fs::metadata(entry.path())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        entries.push(DirEntry {
            path: entry.path().to_string_lossy().to_string(),
            name,
            is_dir,
        });
    }
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));

    Ok(Listing {
        parent: path.parent().map(|p| p.to_string_lossy().to_string()),
        path: path.to_string_lossy().to_string(),
        entries,
    })
}

/// Directory completions for a partially typed path.
pub async fn autocomplete(partial: &str) -> Result<Vec<String>> {
    if partial.trim().is_empty() {
        return Ok(Vec::new());
    }
    let expanded = expand_home(partial.trim());
    let text = expanded.to_string_lossy().to_string();
    let (dir, prefix) = if text.ends_with('/') {
        (PathBuf::from(&text), String::new())
    } else {
        let parent = expanded.parent().map(Path::to_path_buf).unwrap_or_default();
        let prefix = expanded
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        (parent, prefix)
    };
    if !dir.is_absolute() {
        return Ok(Vec::new());
    }

    let mut read_dir = match tokio::fs::read_dir(&dir).await {
        Ok(read_dir) => read_dir,
        Err(_) => return Ok(Vec::new()),
    };
    let show_hidden = prefix.starts_with('.');
    let mut out = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with(&prefix) || (name.starts_with('.') && !show_hidden) {
            continue;
        }
        if tokio::fs::metadata(entry.path()).await.is_ok_and(|m| m.is_dir()) {
            out.push(entry.path().to_string_lossy().to_string());
        }
    }
    out.sort();
    out.truncate(MAX_SUGGESTIONS);
    Ok(out)
}

/// Working-tree diff of `folder` via git.
pub async fn diff(git: &Capability, raw_folder: &str) -> Result<DiffResult> {
    let folder = resolve_folder(raw_folder)?;
    let Capability::Available(git) = git else {
        return Err(GatewayError::Internal("git is not available".to_string()));
    };
    let run = Command::new(git)
        .arg("-C")
        .arg(&folder)
        .args(["diff", "--no-color", "--no-ext-diff"])
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = tokio::time::timeout(DIFF_TIMEOUT, run)
        .await
        .map_err(|_| GatewayError::Internal("git diff timed out".to_string()))??;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GatewayError::validation(
            "NOT_A_REPOSITORY",
            stderr.lines().next().unwrap_or("git diff failed").to_string(),
        ));
    }
    let diff = String::from_utf8_lossy(&output.stdout).to_string();
    Ok(DiffResult {
        folder: folder.to_string_lossy().to_string(),
        files: summarize(&diff),
        diff,
    })
}

/// Per-file added/removed line counts from unified diff text.
fn summarize(diff: &str) -> Vec<FileDiff> {
    let mut files: Vec<FileDiff> = Vec::new();
    for line in diff.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            let path = rest
                .split_once(" b/")
                .map(|(_, b)| b)
                .unwrap_or(rest)
                .to_string();
            files.push(FileDiff {
                path,
                additions: 0,
                deletions: 0,
            });
            continue;
        }
        let Some(current) = files.last_mut() else {
            continue;
        };
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if line.starts_with('+') {
            current.additions += 1;
        } else if line.starts_with('-') {
            current.deletions += 1;
        }
    }
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_folder_rules() {
        let dir = tempfile::tempdir().unwrap();
        let with_slash = format!("{}/", dir.path().display());
        assert_eq!(resolve_folder(&with_slash).unwrap(), dir.path());
        assert!(matches!(
            resolve_folder("relative/path"),
            Err(GatewayError::Validation { code: "FOLDER_NOT_ABSOLUTE", .. })
        ));
        assert!(matches!(
            resolve_folder("/definitely/not/here"),
            Err(GatewayError::Validation { code: "FOLDER_NOT_FOUND", .. })
        ));
        assert_eq!(resolve_folder("/").unwrap(), PathBuf::from("/"));
    }

    #[test]
    fn test_normalize_folder_skips_existence_check() {
        assert_eq!(
            normalize_folder("  /gone/project//  ").unwrap(),
            PathBuf::from("/gone/project")
        );
        assert_eq!(normalize_folder("///").unwrap(), PathBuf::from("/"));
        assert!(matches!(
            normalize_folder(""),
            Err(GatewayError::Validation { code: "FOLDER_REQUIRED", .. })
        ));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(normalize_folder("~/src/").unwrap(), home.join("src"));
        }
    }

    #[tokio::test]
    async fn test_browse_orders_dirs_first_and_hides_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("zeta")).unwrap();
        std::fs::write(dir.path().join("alpha.txt"), b"").unwrap();
        std::fs::write(dir.path().join(".hidden"), b"").unwrap();

        let listing = browse(Some(&dir.path().to_string_lossy())).await.unwrap();
        let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha.txt"]);
        assert!(listing.entries[0].is_dir);
    }

    #[tokio::test]
    async fn test_autocomplete_matches_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("project-a")).unwrap();
        std::fs::create_dir(dir.path().join("project-b")).unwrap();
        std::fs::write(dir.path().join("project-file"), b"").unwrap();
        std::fs::create_dir(dir.path().join("other")).unwrap();

        let partial = format!("{}/proj", dir.path().display());
        let out = autocomplete(&partial).await.unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].ends_with("project-a"));

        assert!(autocomplete("").await.unwrap().is_empty());
        assert!(autocomplete("relative").await.unwrap().is_empty());
    }

    #[test]
    fn test_summarize_counts_lines() {
        let diff = "diff --git a/src/lib.rs b/src/lib.rs\n\
                    --- a/src/lib.rs\n\
                    +++ b/src/lib.rs\n\
                    @@ -1,2 +1,3 @@\n\
                    -old\n\
                    +new\n\
                    +more\n\
                    diff --git a/README.md b/README.md\n\
                    +++ b/README.md\n\
                    +hello\n";
        let files = summarize(diff);
        assert_eq!(
            files,
            vec![
                FileDiff { path: "src/lib.rs".into(), additions: 2, deletions: 1 },
                FileDiff { path: "README.md".into(), additions: 1, deletions: 0 },
            ]
        );
    }

    #[tokio::test]
    async fn test_diff_requires_git() {
        let dir = tempfile::tempdir().unwrap();
        let result = diff(&Capability::Unavailable("test".into()), &dir.path().to_string_lossy()).await;
        assert!(matches!(result, Err(GatewayError::Internal(_))));
    }
}
