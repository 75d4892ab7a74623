//! Thresholds and defaults shared across the crate.

/// Microseconds between 1601-01-01 and 1970-01-01.
pub const WEBKIT_UNIX_OFFSET_MICROS: i64 = 11_644_473_600 * 1_000_000;

pub const DEFAULT_RECORD_LIMIT: usize = 100;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_BATCH_WAIT_MS: u64 = 1500;
pub const DEFAULT_PROGRESS_EVERY: usize = 5;

/// Cache files below this size cannot hold a usable page.
pub const DEFAULT_MIN_CACHE_FILE_SIZE: u64 = 100;
/// Extracted `<html>` or `<body>` spans must exceed this many characters.
pub const DEFAULT_MIN_HTML_LEN: usize = 1000;
/// Decoded blobs (or fetched bodies) without markers are accepted above this size.
pub const DEFAULT_MIN_BLOB_LEN: usize = 5000;

pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_FETCH_MAX_RETRIES: u32 = 2;
pub const DEFAULT_FETCH_BACKOFF_MS: u64 = 1000;
pub const MAX_REDIRECTS: usize = 10;
/// Fallback fetches running at once for one batch.
pub const DEFAULT_FETCH_WORKERS: usize = 8;

pub const DEFAULT_STOP_GRACE_MS: u64 = 1000;
/// Upper bound for any blocking wait between stop-flag checks.
pub const STOP_CHECK_INTERVAL_MS: u64 = 1000;

/// Filename byte budget, kept under the common 255-byte component limit.
pub const MAX_FILENAME_BYTES: usize = 250;

pub const DEFAULT_TITLE: &str = "No Title";
pub const DEFAULT_DATASET_NAME: &str = "Chrome History";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36";
pub const DEFAULT_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "zh-CN,zh;q=0.9,en;q=0.8";

pub const CHANNEL_CAPACITY: usize = 256;
pub const STATE_DIR_NAME: &str = ".histmark";

pub const UPLOAD_TIMEOUT_SECS: u64 = 60;
pub const INDEX_EMBEDDING_MODEL: &str = "text-embedding-v2";
pub const INDEX_CHUNK_METHOD: &str = "markdown";
