//! Durable storage for the moderation queue state.
//!
//! [`FileStore`] persists the whole [`QueueSnapshot`] as one JSON
//! document. Saves are atomic from the caller's perspective: the
//! snapshot is written to a temporary file and renamed into place, so
//! a crash mid-save never leaves a file the loader cannot parse.
//! Before each overwrite the previous file is rotated into a rolling
//! window of backups; on a corrupt load the backups are tried in
//! reverse-chronological order before falling back to an empty state.
//! Losing all pending records on unrecoverable corruption is an
//! accepted, loudly logged failure mode.

use crate::error::QueueError;
use crate::record::QueueSnapshot;
use chrono::Utc;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

/// Persistence seam. The core assumes last-write-wins, not ACID.
pub trait RecordStore: Send + Sync {
    fn load(&self) -> Result<QueueSnapshot, QueueError>;
    fn save(&self, snapshot: &QueueSnapshot) -> Result<(), QueueError>;
}

// ── JSON file store ──────────────────────────────────────────────

pub struct FileStore {
    path: PathBuf,
    max_backups: usize,
    /// Serializes writers: concurrent saves must not interleave the
    /// rotate/write/rename sequence.
    io_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            path: path.into(),
            max_backups,
            io_lock: Mutex::new(()),
        }
    }

    fn backup_prefix(&self) -> String {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "moderation_queue.json".to_string());
        format!("{name}.backup.")
    }

    /// Copy the current file aside and prune backups beyond the window.
    fn rotate_backup(&self) -> std::io::Result<()> {
        if !self.path.exists() {
            return Ok(());
        }

        let backup = self.path.with_file_name(format!(
            "{}{}",
            self.backup_prefix(),
            Utc::now().timestamp_micros()
        ));
        std::fs::copy(&self.path, &backup)?;

        let mut backups = self.list_backups()?;
        if backups.len() > self.max_backups {
            backups.sort();
            let excess = backups.len() - self.max_backups;
            for old in backups.into_iter().take(excess) {
                if let Err(e) = std::fs::remove_file(&old) {
                    tracing::warn!(path = %old.display(), "failed to prune old backup: {e}");
                }
            }
        }
        Ok(())
    }

    /// All backup files for this store, unsorted.
    fn list_backups(&self) -> std::io::Result<Vec<PathBuf>> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let prefix = self.backup_prefix();
        let mut backups = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry
                .file_name()
                .to_string_lossy()
                .starts_with(prefix.as_str())
            {
                backups.push(entry.path());
            }
        }
        Ok(backups)
    }

    fn parse(raw: &[u8]) -> Result<QueueSnapshot, QueueError> {
        serde_json::from_slice(raw).map_err(|e| QueueError::CorruptState(e.to_string()))
    }

    /// Try each backup, newest first. Returns the first parseable one.
    fn recover_from_backups(&self) -> Option<QueueSnapshot> {
        let mut backups = self.list_backups().ok()?;
        backups.sort();
        backups.reverse();

        for backup in backups {
            match std::fs::read(&backup).map_err(QueueError::from).and_then(|raw| Self::parse(&raw)) {
                Ok(snapshot) => {
                    tracing::warn!(
                        backup = %backup.display(),
                        pending = snapshot.pending.len(),
                        "recovered moderation state from backup"
                    );
                    return Some(snapshot);
                }
                Err(e) => {
                    tracing::warn!(backup = %backup.display(), "backup unusable: {e}");
                }
            }
        }
        None
    }
}

impl RecordStore for FileStore {
    fn load(&self) -> Result<QueueSnapshot, QueueError> {
        if !self.path.exists() {
            tracing::info!(path = %self.path.display(), "no snapshot file, starting empty");
            return Ok(QueueSnapshot::default());
        }

        let attempt = std::fs::read(&self.path)
            .map_err(QueueError::from)
            .and_then(|raw| Self::parse(&raw));

        match attempt {
            Ok(snapshot) => {
                tracing::info!(
                    pending = snapshot.pending.len(),
                    approved = snapshot.approved.len(),
                    rejected = snapshot.rejected.len(),
                    "moderation state loaded"
                );
                Ok(snapshot)
            }
            Err(e) => {
                tracing::error!(path = %self.path.display(), "snapshot unreadable: {e}");
                match self.recover_from_backups() {
                    Some(snapshot) => Ok(snapshot),
                    None => {
                        tracing::error!(
                            "all recovery attempts failed, cold-starting with empty state"
                        );
                        Ok(QueueSnapshot::default())
                    }
                }
            }
        }
    }

    fn save(&self, snapshot: &QueueSnapshot) -> Result<(), QueueError> {
        let _guard = self.io_lock.lock();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if let Err(e) = self.rotate_backup() {
            tracing::warn!("failed to rotate snapshot backup: {e}");
        }

        let mut stamped = snapshot.clone();
        stamped.meta.saved_at = Utc::now();
        let raw = serde_json::to_vec_pretty(&stamped)
            .map_err(|e| QueueError::CorruptState(e.to_string()))?;

        let tmp = self.path.with_file_name(format!(
            "{}.tmp",
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "moderation_queue.json".to_string())
        ));
        std::fs::write(&tmp, &raw)?;
        std::fs::rename(&tmp, &self.path)?;

        tracing::debug!(
            pending = snapshot.pending.len(),
            path = %self.path.display(),
            "moderation state saved"
        );
        Ok(())
    }
}
