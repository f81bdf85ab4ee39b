//! Backup-then-write-then-commit file surgery.
//!
//! At every observable instant the target either holds the old bytes with
//! no sidecar, the old bytes with a sidecar equal to them, or the new
//! bytes with no sidecar. A sidecar found on entry is a crashed
//! half-write from a previous run and is restored before anything else.

use std::path::Path;

use synapse_syntax::SyntaxValidator;
use tracing::{error, info, warn};

/// Sidecar suffix appended to the target path.
pub const JOURNAL_SUFFIX: &str = ".journal";

#[derive(Debug, Clone, Copy, Default)]
pub struct JournaledWriter {
    validator: SyntaxValidator,
}

impl JournaledWriter {
    pub fn new(validator: SyntaxValidator) -> Self {
        Self { validator }
    }

    fn journal_path(path: &Path) -> std::path::PathBuf {
        let mut os = path.as_os_str().to_owned();
        os.push(JOURNAL_SUFFIX);
        std::path::PathBuf::from(os)
    }

    /// Copy the pre-image to the sidecar. A missing target is a new file
    /// creation: valid, nothing to back up.
    async fn backup(path: &Path) -> bool {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return true;
        }
        match tokio::fs::copy(path, Self::journal_path(path)).await {
            Ok(_) => true,
            Err(err) => {
                error!(path = %path.display(), %err, "journal backup failed");
                false
            }
        }
    }

    /// Delete the sidecar after a successful write.
    async fn commit(path: &Path) {
        let _ = tokio::fs::remove_file(Self::journal_path(path)).await;
    }

    /// Restore the pre-image over the target and drop the sidecar.
    async fn rollback(path: &Path) {
        let journal = Self::journal_path(path);
        if tokio::fs::try_exists(&journal).await.unwrap_or(false) {
            match tokio::fs::copy(&journal, path).await {
                Ok(_) => {
                    let _ = tokio::fs::remove_file(&journal).await;
                    warn!(path = %path.display(), "rollback restored pre-image");
                }
                Err(err) => {
                    error!(path = %path.display(), %err, "ROLLBACK FAILED, manual repair required");
                }
            }
        }
    }

    /// Validate, journal, write, commit. Returns false without touching
    /// the filesystem when validation rejects the content, and false with
    /// the pre-image restored when any I/O step fails.
    pub async fn apply_surgery_safe(&self, path: &Path, new_content: &str) -> bool {
        let extension = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();

        if !self.validator.validate_syntax(new_content, &extension) {
            error!(path = %path.display(), "syntax gate rejected proposed content");
            return false;
        }

        // A sidecar left behind by a crash means the target may hold a
        // half-write; put the pre-image back before operating on it.
        let journal = Self::journal_path(path);
        if tokio::fs::try_exists(&journal).await.unwrap_or(false) {
            warn!(path = %path.display(), "stale journal found, recovering pre-image first");
            Self::rollback(path).await;
        }

        if !Self::backup(path).await {
            return false;
        }

        match tokio::fs::write(path, new_content).await {
            Ok(()) => {
                Self::commit(path).await;
                info!(path = %path.display(), bytes = new_content.len(), "surgery committed");
                true
            }
            Err(err) => {
                error!(path = %path.display(), %err, "write failed, rolling back");
                Self::rollback(path).await;
                false
            }
        }
    }
}
