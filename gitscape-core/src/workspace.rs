//! Ephemeral per-operation directories.
//!
//! Each digestion gets its own uniquely-named directory under the configured
//! root. [`WorkspaceManager::dispose`] removes it and may be called any number
//! of times; `Drop` calls it once more, retrying a removal that failed earlier,
//! so a panic or an aborted task still leaves nothing behind.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::DigestError;

/// An exclusively-owned scratch directory.
#[derive(Debug)]
pub struct Workspace {
    path: PathBuf,
    created_at: DateTime<Utc>,
    disposed: AtomicBool,
}

impl Workspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Remove the directory. Once a call succeeds later calls do nothing; a
    /// failed removal leaves the workspace live so the next call retries. A
    /// directory that is already gone counts as success.
    pub fn dispose(&self) -> io::Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Ok(());
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => {
                self.disposed.store(true, Ordering::Release);
                debug!(path = %self.path.display(), "Removed workspace");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.disposed.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                error!(error = ?e, path = %self.path.display(), "Failed to remove workspace");
                Err(e)
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = self.dispose();
    }
}

/// Hands out workspaces under a common root.
#[derive(Clone, Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a fresh, empty, uniquely-named directory.
    pub fn acquire(&self) -> Result<Workspace, DigestError> {
        fs::create_dir_all(&self.root).map_err(|e| {
            error!(error = ?e, root = %self.root.display(), "Failed to create workspace root");
            DigestError::InternalError(format!("cannot create workspace root: {e}"))
        })?;
        let path = self.root.join(format!("digest-{}", Uuid::new_v4()));
        // create_dir (not create_dir_all) so a name collision is an error rather than sharing.
        fs::create_dir(&path).map_err(|e| {
            error!(error = ?e, path = %path.display(), "Failed to create workspace");
            DigestError::InternalError(format!("cannot create workspace: {e}"))
        })?;
        info!(path = %path.display(), "Allocated workspace");
        Ok(Workspace {
            path,
            created_at: Utc::now(),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn dispose(&self, workspace: &Workspace) -> io::Result<()> {
        workspace.dispose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_creates_distinct_empty_directories() {
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let a = manager.acquire().unwrap();
        let b = manager.acquire().unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().is_dir());
        assert_eq!(fs::read_dir(a.path()).unwrap().count(), 0);
    }

    #[test]
    fn dispose_is_idempotent_and_recursive() {
        let root = tempdir().unwrap();
        let manager = WorkspaceManager::new(root.path());
        let ws = manager.acquire().unwrap();
        fs::create_dir_all(ws.path().join("a/b")).unwrap();
        fs::write(ws.path().join("a/b/file.txt"), "x").unwrap();

        manager.dispose(&ws).unwrap();
        assert!(!ws.path().exists());
        assert!(ws.is_disposed());
        manager.dispose(&ws).unwrap();
    }

    #[test]
    fn dispose_tolerates_missing_directory() {
        let root = tempdir().unwrap();
        let ws = WorkspaceManager::new(root.path()).acquire().unwrap();
        fs::remove_dir_all(ws.path()).unwrap();
        assert!(ws.dispose().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn failed_removal_is_retried() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempdir().unwrap();
        let ws = WorkspaceManager::new(root.path()).acquire().unwrap();
        let locked = ws.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("pack"), "x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();

        // Privileged users ignore directory permissions; nothing to exercise then.
        if fs::write(locked.join("canary"), "x").is_ok() {
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        assert!(ws.dispose().is_err());
        assert!(!ws.is_disposed());
        assert!(ws.path().exists());

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        ws.dispose().unwrap();
        assert!(ws.is_disposed());
        assert!(!ws.path().exists());
    }

    #[test]
    fn drop_removes_directory() {
        let root = tempdir().unwrap();
        let path = {
            let ws = WorkspaceManager::new(root.path()).acquire().unwrap();
            fs::write(ws.path().join("f"), "x").unwrap();
            ws.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
