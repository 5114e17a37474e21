//! Workspace validation for new sessions.
//!
//! A client may ask for a tool to run in a specific directory. The path
//! must exist, be a directory, resolve (after following symlinks) under
//! one of the configured trusted roots, and not be a system directory.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::commands::RegistryError;

/// System locations a session may never run in, even under a trusted root.
const FORBIDDEN_PREFIXES: &[&str] = &[
    "/etc", "/proc", "/sys", "/dev", "/boot", "/bin", "/sbin", "/usr/bin", "/usr/sbin",
];

/// Trusted roots for session working directories.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspacePolicy {
    roots: Vec<PathBuf>,
}

impl WorkspacePolicy {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Validates a requested workspace.
    ///
    /// `None` means "inherit the daemon's working directory" and is always
    /// accepted.
    ///
    /// # Errors
    ///
    /// `RegistryError::WorkspaceDenied` when the path does not exist, is not
    /// a directory, is a system directory, or lies outside every root.
    pub async fn resolve(&self, requested: Option<&str>) -> Result<Option<PathBuf>, RegistryError> {
        let Some(requested) = requested.map(str::trim).filter(|p| !p.is_empty()) else {
            return Ok(None);
        };

        let deny = |reason: &str| RegistryError::WorkspaceDenied {
            path: requested.to_string(),
            reason: reason.to_string(),
        };

        let resolved = tokio::fs::canonicalize(requested)
            .await
            .map_err(|_| deny("path does not exist"))?;

        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|_| deny("path is not accessible"))?;
        if !metadata.is_dir() {
            return Err(deny("path is not a directory"));
        }

        if resolved == Path::new("/") || FORBIDDEN_PREFIXES.iter().any(|p| resolved.starts_with(p)) {
            return Err(deny("system directories are not allowed"));
        }

        for root in &self.roots {
            let root = tokio::fs::canonicalize(root).await.unwrap_or_else(|_| root.clone());
            if resolved.starts_with(&root) {
                debug!(workspace = %resolved.display(), root = %root.display(), "Workspace accepted");
                return Ok(Some(resolved));
            }
        }

        Err(deny("outside the trusted workspace roots"))
    }
}
