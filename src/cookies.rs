use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::config::Config;
use crate::parsers::sqlite_db;
use crate::snapshot::{SnapshotError, SourceSnapshot};

/// Reads per-domain cookies from a private snapshot of the cookie store.
///
/// Nothing is cached: every lookup takes a fresh snapshot, since the browser
/// may rotate cookies between requests.
#[derive(Debug, Clone)]
pub struct CookieVault {
    cookies_path: PathBuf,
    temp_dir: PathBuf,
}

impl CookieVault {
    pub fn new(cookies_path: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            cookies_path: cookies_path.into(),
            temp_dir: temp_dir.into(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.cookies_path.clone(), cfg.temp_dir.clone())
    }

    /// Cookies whose host key contains `domain`. Errors yield an empty jar.
    pub fn cookies_for(&self, domain: &str) -> HashMap<String, String> {
        match self.try_cookies_for(domain) {
            Ok(jar) => {
                debug!("loaded {} cookies for {domain}", jar.len());
                jar
            }
            Err(err) => {
                warn!("cookie lookup for {domain} failed: {err}");
                HashMap::new()
            }
        }
    }

    fn try_cookies_for(&self, domain: &str) -> Result<HashMap<String, String>, SnapshotError> {
        let snap = SourceSnapshot::take(&self.cookies_path, &self.temp_dir, "cookies")?;
        let conn = snap.open()?;
        let records = sqlite_db::read_cookies(&conn, domain)?;
        Ok(records.into_iter().map(|c| (c.name, c.value)).collect())
    }
}

/// Render a jar as a `Cookie` request header value.
pub fn cookie_header(jar: &HashMap<String, String>) -> Option<String> {
    if jar.is_empty() {
        return None;
    }
    let mut pairs: Vec<_> = jar.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    Some(pairs.join("; "))
}
