//! Whole-file JSON persistence for the state directory.

use serde::{de::DeserializeOwned, Serialize};
use std::io::ErrorKind;
use std::path::Path;

/// Read a JSON state file. A missing file yields `None`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<Option<T>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, format!("{}: {e}", path.display())))
}

/// Rewrite a state file wholesale via temp file + rename.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(value)
        .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, body).await?;
    restrict_permissions(&tmp).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
