//! Validated, atomic file edits inside an app directory.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::AppId;
use crate::error::{RuntimeError, RuntimeResult};
use crate::validator::{self, EditMagnitude};

/// A whole-file replacement requested by an upstream editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditRequest {
    pub app_id: AppId,
    pub app_path: PathBuf,
    /// Relative to `app_path`.
    pub file_path: String,
    pub content: String,
    pub project_name: Option<String>,
}

/// What happened to the running app as a result of an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReloadAction {
    /// A hot-reload session picked the change up.
    HotReload,
    /// The app is running without hot reload; restart to see the change.
    RestartRequired,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditOutcome {
    pub path: PathBuf,
    pub created: bool,
    pub magnitude: EditMagnitude,
    pub reload: ReloadAction,
}

/// Join `relative` onto `root`, rejecting absolute paths and any `..`.
pub fn resolve_in_root(root: &Path, relative: &str) -> RuntimeResult<PathBuf> {
    let rel = Path::new(relative);
    let mut clean = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(RuntimeError::Validation(format!(
                    "path {relative:?} escapes the app directory"
                )));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(RuntimeError::Validation("empty file path".into()));
    }
    Ok(root.join(clean))
}

/// Validate `content` for the target's file type and write it atomically.
///
/// On any failure the file on disk is left exactly as it was.
pub async fn write_validated(root: &Path, relative: &str, content: &str) -> RuntimeResult<EditOutcome> {
    let path = resolve_in_root(root, relative)?;
    validator::validate_for_path(&path, content)
        .map_err(|failure| RuntimeError::Validation(format!("{relative}: {failure}")))?;

    let previous = match tokio::fs::read_to_string(&path).await {
        Ok(text) => Some(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        // Binary or unreadable: still replaceable, just not classifiable.
        Err(_) => Some(String::new()),
    };
    let magnitude = previous
        .as_deref()
        .map_or(EditMagnitude::Rewrite, |old| validator::classify_edit(old, content));

    write_atomic(&path, content.as_bytes()).await?;
    debug!(path = %path.display(), ?magnitude, "applied edit");

    Ok(EditOutcome {
        path,
        created: previous.is_none(),
        magnitude,
        reload: ReloadAction::None,
    })
}

/// Write through a sibling temp file and rename over the target.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> RuntimeResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| RuntimeError::Validation(format!("{} has no parent", path.display())))?;
    tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| RuntimeError::io(parent, e))?;

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let temp = parent.join(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));

    if let Err(e) = tokio::fs::write(&temp, bytes).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(RuntimeError::io(&temp, e));
    }
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(RuntimeError::io(path, e));
    }
    Ok(())
}
