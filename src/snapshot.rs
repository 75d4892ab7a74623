//! # Source Snapshots
//!
//! The live browser keeps its SQLite stores locked, so every read works from a
//! private copy taken under a fresh name. The copy is removed when the
//! [`SourceSnapshot`] guard drops, on the error path included.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OpenFlags};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("source database not found: {0}")]
    SourceMissing(PathBuf),
    #[error("permission denied reading {0}")]
    PermissionDenied(PathBuf),
    #[error("failed to copy {path}: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl SnapshotError {
    /// Short machine-readable reason, stable across releases.
    pub fn reason(&self) -> &'static str {
        match self {
            SnapshotError::SourceMissing(_) => "source_missing",
            SnapshotError::PermissionDenied(_) => "permission_denied",
            SnapshotError::Copy { .. } => "copy_failed",
            SnapshotError::Sqlite(_) => "database_unreadable",
        }
    }

    /// Remediation hint a shell can show next to the error.
    pub fn remediation(&self) -> &'static str {
        match self {
            SnapshotError::SourceMissing(_) => {
                "make sure the browser is installed and the profile has browsing history"
            }
            SnapshotError::PermissionDenied(_) => {
                "grant this program full disk access (or read permission on the browser profile)"
            }
            SnapshotError::Copy { .. } | SnapshotError::Sqlite(_) => {
                "close the browser and retry, or grant full disk access"
            }
        }
    }
}

static SNAPSHOT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A private, disposable copy of a locked source file.
#[derive(Debug)]
pub struct SourceSnapshot {
    path: PathBuf,
}

impl SourceSnapshot {
    /// Copy `source` into `temp_dir` under a unique name.
    ///
    /// A plain file copy is tried first; if the OS refuses it, the SQLite
    /// online backup API reads the source read-only instead.
    pub fn take(source: &Path, temp_dir: &Path, label: &str) -> Result<Self, SnapshotError> {
        if !source.exists() {
            return Err(SnapshotError::SourceMissing(source.to_path_buf()));
        }
        std::fs::create_dir_all(temp_dir).map_err(|e| SnapshotError::Copy {
            path: temp_dir.to_path_buf(),
            source: e,
        })?;
        let snapshot = Self {
            path: temp_dir.join(unique_name(label)),
        };

        match std::fs::copy(source, &snapshot.path) {
            Ok(_) => {
                debug!(
                    "snapshot {} -> {}",
                    source.display(),
                    snapshot.path.display()
                );
                Ok(snapshot)
            }
            Err(err) => {
                debug!("plain copy of {} failed ({err}); trying sqlite backup", source.display());
                match backup_copy(source, &snapshot.path) {
                    Ok(()) => Ok(snapshot),
                    Err(_) if err.kind() == ErrorKind::PermissionDenied => {
                        Err(SnapshotError::PermissionDenied(source.to_path_buf()))
                    }
                    Err(_) => Err(SnapshotError::Copy {
                        path: source.to_path_buf(),
                        source: err,
                    }),
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> Result<Connection, SnapshotError> {
        Ok(Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?)
    }
}

impl Drop for SourceSnapshot {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!("failed to remove snapshot {}: {err}", self.path.display());
            }
        }
    }
}

fn backup_copy(source: &Path, dest: &Path) -> Result<(), rusqlite::Error> {
    let src = Connection::open_with_flags(
        source,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    src.backup(rusqlite::DatabaseName::Main, dest, None)
}

fn unique_name(label: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let seq = SNAPSHOT_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{label}_{}_{nanos:08x}_{seq}.sqlite", std::process::id())
}
