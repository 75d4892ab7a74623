//! # Cache Scanner
//!
//! Correlates opaque on-disk cache files with watched URLs. Files are never
//! parsed as a container format: each one is decoded through a fixed ladder of
//! encodings, searched for the URL, and mined for an HTML span.

pub mod extract;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use memchr::memmem;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::Config;

use extract::{DECODE_LADDER, ExtractKind, ExtractPolicy, decode_lossy, extract_html};

/// Recovered HTML for one URL from one cache file.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub url: String,
    pub html: String,
    pub kind: ExtractKind,
    pub encoding: &'static str,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CacheScanner {
    min_file_size: u64,
    policy: ExtractPolicy,
}

impl CacheScanner {
    pub fn new(min_file_size: u64, policy: ExtractPolicy) -> Self {
        Self {
            min_file_size,
            policy,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(
            cfg.min_cache_file_size,
            ExtractPolicy {
                min_html_len: cfg.min_html_len,
                min_blob_len: cfg.min_blob_len,
            },
        )
    }

    /// Test one cache file against `urls`; at most one hit per URL.
    pub fn scan_file(&self, path: &Path, urls: &[String]) -> Vec<CacheHit> {
        if urls.is_empty() {
            return Vec::new();
        }
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() && meta.len() >= self.min_file_size => {}
            Ok(_) => return Vec::new(),
            Err(err) => {
                debug!("skipping {}: {err}", path.display());
                return Vec::new();
            }
        }
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(err) => {
                debug!("failed to read {}: {err}", path.display());
                return Vec::new();
            }
        };
        self.scan_bytes(path, &bytes, urls)
    }

    pub fn scan_bytes(&self, path: &Path, bytes: &[u8], urls: &[String]) -> Vec<CacheHit> {
        if (bytes.len() as u64) < self.min_file_size {
            return Vec::new();
        }
        // An ASCII URL absent from the raw bytes cannot appear in any
        // ASCII-compatible decoding either.
        let mut remaining: Vec<&String> = urls
            .iter()
            .filter(|u| !u.is_ascii() || memmem::find(bytes, u.as_bytes()).is_some())
            .collect();
        if remaining.is_empty() {
            return Vec::new();
        }

        let mut hits = Vec::new();
        let mut delivered: HashSet<String> = HashSet::new();
        for encoding in DECODE_LADDER {
            if remaining.is_empty() {
                break;
            }
            let text = decode_lossy(bytes, encoding);
            let mut extracted: Option<Option<(ExtractKind, String)>> = None;
            for url in &remaining {
                if !text.contains(url.as_str()) {
                    continue;
                }
                let found = extracted.get_or_insert_with(|| extract_html(&text, &self.policy));
                if let Some((kind, html)) = found {
                    debug!(
                        "cache hit for {url} in {} ({:?}, {})",
                        path.display(),
                        kind,
                        encoding.name()
                    );
                    hits.push(CacheHit {
                        url: url.to_string(),
                        html: html.clone(),
                        kind: *kind,
                        encoding: encoding.name(),
                        path: path.to_path_buf(),
                    });
                    delivered.insert(url.to_string());
                }
            }
            remaining.retain(|u| !delivered.contains(u.as_str()));
        }
        hits
    }
}

/// List regular files under each root; `(path, recursive)` pairs.
pub fn collect_cache_files(roots: &[(PathBuf, bool)], cancelled: &dyn Fn() -> bool) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for (root, recursive) in roots {
        if root.as_os_str().is_empty() || !root.exists() {
            debug!("cache root {} not present", root.display());
            continue;
        }
        let walker = WalkDir::new(root).max_depth(if *recursive { usize::MAX } else { 1 });
        for entry in walker {
            if cancelled() {
                return files;
            }
            match entry {
                Ok(e) if e.file_type().is_file() => files.push(e.into_path()),
                Ok(_) => {}
                Err(err) => warn!("cache walk error under {}: {err}", root.display()),
            }
        }
    }
    files
}
