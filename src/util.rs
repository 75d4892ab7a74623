//! # Utility Module
//!
//! Output directory validation and the up-front check that the browser's
//! history store can actually be read.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Result, anyhow};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::parsers::sqlite_db;
use crate::snapshot::{SnapshotError, SourceSnapshot};

/// Ensure output directory exists and is writable, warning on unsafe permissions.
pub fn ensure_output_dir(path: &Path) -> Result<()> {
    if path.exists() {
        let metadata = std::fs::metadata(path)?;
        if !metadata.is_dir() {
            return Err(anyhow!(
                "output path is not a directory: {}",
                path.display()
            ));
        }
    } else {
        std::fs::create_dir_all(path)?;
    }

    let probe_path = path.join(".histmark_write_probe");
    match OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe_path)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe_path);
        }
        Err(err) => {
            return Err(anyhow!(
                "output directory is not writable: {} ({})",
                path.display(),
                err
            ));
        }
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(path)?.permissions().mode();
        if mode & 0o002 != 0 {
            warn!("output directory is world-writable: {}", path.display());
        }
    }

    Ok(())
}

/// Result of [`check_source_access`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AccessReport {
    pub ok: bool,
    /// Machine-readable reason, empty when `ok`.
    pub reason: String,
    /// Human-readable explanation and remediation.
    pub message: String,
}

impl AccessReport {
    fn ok() -> Self {
        Self {
            ok: true,
            reason: String::new(),
            message: "history database is readable".to_string(),
        }
    }

    fn from_error(err: &SnapshotError) -> Self {
        Self {
            ok: false,
            reason: err.reason().to_string(),
            message: format!("{err}; {}", err.remediation()),
        }
    }
}

/// Verify the profile and history store exist, can be safe-copied, and carry
/// a `urls` table.
pub fn check_source_access(cfg: &Config) -> AccessReport {
    if !cfg.profile_dir.as_os_str().is_empty() && !cfg.profile_dir.is_dir() {
        let err = SnapshotError::SourceMissing(cfg.profile_dir.clone());
        return AccessReport::from_error(&err);
    }
    if let Err(err) = std::fs::metadata(&cfg.history_path) {
        let err = match err.kind() {
            std::io::ErrorKind::PermissionDenied => {
                SnapshotError::PermissionDenied(cfg.history_path.clone())
            }
            _ => SnapshotError::SourceMissing(cfg.history_path.clone()),
        };
        return AccessReport::from_error(&err);
    }
    let has_urls = SourceSnapshot::take(&cfg.history_path, &cfg.temp_dir, "access_check")
        .and_then(|snap| {
            let conn = snap.open()?;
            Ok(sqlite_db::has_table(&conn, "urls")?)
        });
    match has_urls {
        Ok(true) => {
            debug!("history store {} is readable", cfg.history_path.display());
            AccessReport::ok()
        }
        Ok(false) => AccessReport {
            ok: false,
            reason: "database_unreadable".to_string(),
            message: format!(
                "{} has no urls table; point history_path at the browser's History file",
                cfg.history_path.display()
            ),
        },
        Err(err) => AccessReport::from_error(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_in(dir: &Path) -> Config {
        Config {
            profile_dir: dir.join("Default"),
            history_path: dir.join("Default/History"),
            temp_dir: dir.join("tmp"),
            ..Config::default()
        }
    }

    #[test]
    fn ensure_output_dir_creates_and_rejects_files() {
        let dir = tempdir().expect("tempdir");
        let out = dir.path().join("a/b");
        ensure_output_dir(&out).expect("create");
        assert!(out.is_dir());
        assert!(!out.join(".histmark_write_probe").exists());

        let file = dir.path().join("file");
        std::fs::write(&file, b"x").expect("write");
        assert!(ensure_output_dir(&file).is_err());
    }

    #[test]
    fn missing_profile_is_reported() {
        let dir = tempdir().expect("tempdir");
        let report = check_source_access(&config_in(dir.path()));
        assert!(!report.ok);
        assert_eq!(report.reason, "source_missing");
        assert!(report.message.contains("installed"));
    }

    #[test]
    fn readable_history_passes() {
        let dir = tempdir().expect("tempdir");
        let cfg = config_in(dir.path());
        std::fs::create_dir_all(&cfg.profile_dir).expect("mkdir");
        let conn = rusqlite::Connection::open(&cfg.history_path).expect("conn");
        conn.execute("CREATE TABLE urls (url TEXT)", []).expect("create");
        drop(conn);

        let report = check_source_access(&cfg);
        assert!(report.ok, "{report:?}");
        let leftovers = std::fs::read_dir(&cfg.temp_dir).expect("tmp").count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn history_without_urls_table_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let cfg = config_in(dir.path());
        std::fs::create_dir_all(&cfg.profile_dir).expect("mkdir");
        let conn = rusqlite::Connection::open(&cfg.history_path).expect("conn");
        conn.execute("CREATE TABLE visits (id INTEGER)", []).expect("create");
        drop(conn);

        let report = check_source_access(&cfg);
        assert!(!report.ok);
        assert_eq!(report.reason, "database_unreadable");
        assert!(report.message.contains("urls"));
    }
}
