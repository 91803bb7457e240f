//! Workspace-relative save/convert handling.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use flowhost_core::traits::{FileHandlerError, FlowFileHandler};
use serde_json::Value;

/// Save/convert handler rooted at the configured workspace directory.
///
/// Save writes the flow description as pretty JSON. Convert belongs to the
/// external export pipeline; without one wired in, convert requests fail
/// with an explicit error rather than producing fake code.
pub struct WorkspaceFileHandler {
    workspace_dir: PathBuf,
}

impl WorkspaceFileHandler {
    /// Create a handler rooted at `workspace_dir`.
    #[must_use]
    pub fn new(workspace_dir: PathBuf) -> Self {
        Self { workspace_dir }
    }

    /// Resolve a client-supplied path inside the workspace.
    ///
    /// Absolute paths and parent-directory components are rejected so a
    /// client cannot write outside the workspace root.
    fn resolve(&self, file_path: &str) -> Result<PathBuf, FileHandlerError> {
        let rel = Path::new(file_path);
        if rel.is_absolute() {
            return Err(FileHandlerError::InvalidPath(format!(
                "absolute paths are not allowed: {file_path}"
            )));
        }
        if rel
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(FileHandlerError::InvalidPath(format!(
                "path escapes the workspace: {file_path}"
            )));
        }
        Ok(self.workspace_dir.join(rel))
    }
}

#[async_trait]
impl FlowFileHandler for WorkspaceFileHandler {
    async fn save(&self, file_path: &str, flow: &Value) -> Result<String, FileHandlerError> {
        let target = self.resolve(file_path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(flow)
            .map_err(|e| FileHandlerError::Failed(e.to_string()))?;
        tokio::fs::write(&target, body).await?;
        tracing::info!(path = %target.display(), "flow saved");
        Ok(target.display().to_string())
    }

    async fn convert(
        &self,
        _flow: &Value,
        format: Option<&str>,
    ) -> Result<String, FileHandlerError> {
        Err(FileHandlerError::Failed(format!(
            "no export pipeline configured for format {}",
            format.unwrap_or("default")
        )))
    }
}
