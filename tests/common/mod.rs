//! Shared fixtures: synthetic history databases, cache blobs and a scripted
//! fetcher.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rusqlite::Connection;

use histmark::config::Config;
use histmark::fetch::PageFetcher;

pub fn create_history(path: &Path, rows: &[(&str, &str, i64)]) {
    let conn = Connection::open(path).expect("conn");
    conn.execute(
        "CREATE TABLE IF NOT EXISTS urls (id INTEGER PRIMARY KEY, url TEXT, title TEXT, visit_count INTEGER, last_visit_time INTEGER)",
        [],
    )
    .expect("create");
    for (url, title, time) in rows {
        conn.execute(
            "INSERT INTO urls (url, title, visit_count, last_visit_time) VALUES (?1, ?2, 1, ?3)",
            (url, title, time),
        )
        .expect("insert");
    }
}

/// A cache entry as the browser lays it out: key, binary header, then the body.
pub fn cache_blob(url: &str, paragraph: &str) -> Vec<u8> {
    let mut data = vec![0x30, 0x5c, 0x72, 0xa7, 0x1b, 0x6d, 0xfb, 0xfc];
    data.extend_from_slice(b"1/0/_dk_https://example.com ");
    data.extend_from_slice(url.as_bytes());
    data.extend_from_slice(&[0, 0, 0, 0, 0xd8, 0x41, 0x0d, 0x97]);
    let body = format!(
        "<!DOCTYPE html><html><head><title>t</title></head><body><h1>Heading</h1><p>{}</p></body></html>",
        paragraph.repeat(1200 / paragraph.len().max(1) + 1)
    );
    data.extend_from_slice(body.as_bytes());
    data.extend_from_slice(&[0xff; 32]);
    data
}

pub struct Fixture {
    pub root: tempfile::TempDir,
    pub cfg: Config,
}

impl Fixture {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let base = root.path().to_path_buf();
        let cfg = Config {
            profile_dir: base.join("profile"),
            history_path: base.join("profile/History"),
            cookies_path: base.join("profile/Cookies"),
            temp_dir: base.join("tmp"),
            save_dir: base.join("out"),
            batch_wait_ms: 5_000,
            fetch_backoff_ms: 10,
            ..Config::default()
        };
        let mut fixture = Self { root, cfg };
        fixture.cfg.cache_dirs.main = base.join("cache/Cache");
        fixture.cfg.cache_dirs.network = base.join("cache/Cache/Cache_Data");
        for dir in [
            &fixture.cfg.profile_dir,
            &fixture.cfg.save_dir,
            &fixture.cfg.cache_dirs.main,
            &fixture.cfg.cache_dirs.network,
        ] {
            std::fs::create_dir_all(dir).expect("mkdir");
        }
        fixture
    }

    pub fn cache_file(&self, nested: &str, bytes: &[u8]) -> PathBuf {
        let path = self.cfg.cache_dirs.network.join(nested);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(&path, bytes).expect("write cache file");
        path
    }
}

/// Serves canned pages and counts every call.
#[derive(Default)]
pub struct ScriptedFetcher {
    pub pages: HashMap<String, String>,
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn with_pages(pages: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            pages: pages
                .iter()
                .map(|(u, h)| (u.to_string(), h.to_string()))
                .collect(),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PageFetcher for ScriptedFetcher {
    fn fetch(&self, url: &str) -> Option<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.pages.get(url).cloned()
    }
}
