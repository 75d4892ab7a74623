//! # Content Fetcher
//!
//! Authenticated re-fetch used when a page cannot be recovered from cache.
//! Requests carry browser-like headers and the domain's cookies; failures are
//! retried a bounded number of times and then collapse to `None`.

use std::time::Duration;

use encoding_rs::{Encoding, GB18030, UTF_8, WINDOWS_1252};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{self, HeaderMap, HeaderValue};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::constants::MAX_REDIRECTS;
use crate::cookies::{CookieVault, cookie_header};
use crate::scanner::extract::has_html_markers;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("request timed out")]
    Timeout,
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Fallback source of page HTML.
pub trait PageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
    pub min_blob_len: usize,
}

impl FetchPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            timeout: Duration::from_secs(cfg.fetch_timeout_secs),
            max_retries: cfg.fetch_max_retries,
            backoff: Duration::from_millis(cfg.fetch_backoff_ms),
            min_blob_len: cfg.min_blob_len,
        }
    }
}

pub struct HttpFetcher {
    client: Client,
    cookies: Option<CookieVault>,
    policy: FetchPolicy,
}

impl HttpFetcher {
    pub fn new(
        cfg: &Config,
        cookies: Option<CookieVault>,
        policy: FetchPolicy,
    ) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&cfg.accept) {
            headers.insert(header::ACCEPT, value);
        }
        if let Ok(value) = HeaderValue::from_str(&cfg.accept_language) {
            headers.insert(header::ACCEPT_LANGUAGE, value);
        }
        let client = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .default_headers(headers)
            .timeout(policy.timeout)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self {
            client,
            cookies,
            policy,
        })
    }

    fn attempt(&self, url: &str) -> Result<String, FetchError> {
        let parsed = url::Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;

        let mut request = self.client.get(parsed.as_str());
        if let Some(vault) = &self.cookies {
            if let Some(cookie) = cookie_header(&vault.cookies_for(host)) {
                request = request.header(header::COOKIE, cookie);
            }
        }

        let response = request.send().map_err(classify)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().map_err(classify)?;
        Ok(decode_body(&bytes, content_type.as_deref()))
    }
}

impl PageFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Option<String> {
        let attempts = self.policy.max_retries.saturating_add(1);
        let mut last_body = None;
        for attempt in 1..=attempts {
            match self.attempt(url) {
                Ok(body) => {
                    if has_html_markers(&body) || body.chars().count() > self.policy.min_blob_len
                    {
                        debug!("fetched {url} on attempt {attempt} ({} bytes)", body.len());
                        return Some(body);
                    }
                    debug!("fetched {url} without html markers on attempt {attempt}");
                    last_body = Some(body);
                }
                Err(err) => {
                    debug!("fetch attempt {attempt} for {url} failed: {err}");
                }
            }
            if attempt < attempts {
                std::thread::sleep(self.policy.backoff);
            }
        }
        if last_body.is_none() {
            warn!("giving up on {url} after {attempts} attempts");
        }
        last_body
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Http(err)
    }
}

static CONTENT_TYPE_CHARSET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)charset\s*=\s*["']?([A-Za-z0-9_\-:.]+)"#).expect("regex"));

static META_CHARSET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?([A-Za-z0-9_\-:.]+)"#).expect("regex")
});

/// Decode a response body using the best available charset evidence:
/// BOM, `Content-Type`, `<meta charset>`, then strict UTF-8, GB18030,
/// and finally windows-1252.
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> String {
    if let Some((encoding, _)) = Encoding::for_bom(bytes) {
        return encoding.decode_with_bom_removal(bytes).0.into_owned();
    }

    let label = content_type
        .and_then(|ct| CONTENT_TYPE_CHARSET.captures(ct).map(|c| c[1].to_string()))
        .or_else(|| {
            let head = &bytes[..bytes.len().min(4096)];
            let head = WINDOWS_1252.decode_without_bom_handling(head).0;
            META_CHARSET.captures(&head).map(|c| c[1].to_string())
        });
    let declared = label.and_then(|l| Encoding::for_label(l.as_bytes()));

    if let Some(encoding) = declared {
        return encoding.decode_without_bom_handling(bytes).0.into_owned();
    }

    if let Some(text) = UTF_8.decode_without_bom_handling_and_without_replacement(bytes) {
        return text.into_owned();
    }
    if let Some(text) = GB18030.decode_without_bom_handling_and_without_replacement(bytes) {
        return text.into_owned();
    }
    WINDOWS_1252.decode_without_bom_handling(bytes).0.into_owned()
}
