//! Completed-file placement.
//!
//! Moves a staged download to its caller-specified destination: any
//! pre-existing destination file is replaced, parent directories are
//! created, and a rename that fails across filesystems falls back to
//! copy-then-remove. On failure both the partially-moved destination and
//! the staged source are deleted so no half-moved file survives.

use std::io;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

/// Hook for platform filesystem indexing after a file lands somewhere new.
///
/// The bridge calls [`scan`](MediaScanner::scan) before it forgets a task
/// whose file moved, so integrations can make the file visible to media
/// catalogs. Scanning is best effort and has no failure mode.
#[async_trait]
pub trait MediaScanner: Send + Sync {
    /// Notifies the platform that `path` changed.
    async fn scan(&self, path: &Path);
}

/// Scanner that does nothing; the default on platforms without an index.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMediaScanner;

#[async_trait]
impl MediaScanner for NoopMediaScanner {
    async fn scan(&self, _path: &Path) {}
}

/// Moves `staged` to `destination`, replacing any existing file there.
///
/// # Errors
///
/// Returns the underlying I/O error after cleaning up both paths; the
/// staged file is gone either way.
#[instrument(fields(staged = %staged.display(), destination = %destination.display()))]
pub async fn move_to_destination(staged: &Path, destination: &Path) -> io::Result<()> {
    match try_move(staged, destination).await {
        Ok(()) => {
            debug!("file placed at destination");
            Ok(())
        }
        Err(error) => {
            warn!(error = %error, "file move failed, cleaning up");
            if let Err(cleanup) = tokio::fs::remove_file(destination).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(error = %cleanup, "could not remove partial destination");
                }
            }
            if let Err(cleanup) = tokio::fs::remove_file(staged).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(error = %cleanup, "could not remove staged file");
                }
            }
            Err(error)
        }
    }
}

async fn try_move(staged: &Path, destination: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(destination).await {
        Ok(()) => {}
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => return Err(error),
    }

    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::rename(staged, destination).await {
        Ok(()) => Ok(()),
        // Rename cannot cross filesystems; fall back to copy + remove.
        Err(_) => {
            tokio::fs::copy(staged, destination).await?;
            tokio::fs::remove_file(staged).await
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_move_creates_parents_and_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("staged.bin");
        let destination = dir.path().join("nested/deep/final.bin");
        std::fs::write(&staged, b"new contents").unwrap();

        move_to_destination(&staged, &destination).await.unwrap();
        assert!(!staged.exists());
        assert_eq!(std::fs::read(&destination).unwrap(), b"new contents");

        // Second move over the existing destination replaces it.
        std::fs::write(&staged, b"replacement").unwrap();
        move_to_destination(&staged, &destination).await.unwrap();
        assert_eq!(std::fs::read(&destination).unwrap(), b"replacement");
    }

    #[tokio::test]
    async fn test_failed_move_cleans_up_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("staged.bin");
        std::fs::write(&staged, b"data").unwrap();

        // Destination whose parent is a file, so create_dir_all fails.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let destination = blocker.join("final.bin");

        let result = move_to_destination(&staged, &destination).await;
        assert!(result.is_err());
        assert!(!staged.exists(), "staged file removed on failure");
        assert!(!destination.exists());
    }

    #[test]
    fn test_missing_staged_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("never-existed.bin");
        let destination = dir.path().join("final.bin");

        let result = tokio_test::block_on(move_to_destination(&staged, &destination));
        assert!(result.is_err());
        assert!(!destination.exists());
    }
}
