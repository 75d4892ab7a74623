use chrono::NaiveDateTime;
use serde::Serialize;

use crate::constants::DEFAULT_TITLE;
use crate::parsers::sqlite_db::webkit_timestamp_to_datetime;

/// One row of the browser's `urls` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisitRecord {
    pub title: String,
    pub url: String,
    /// Microseconds since 1601-01-01T00:00:00 UTC.
    pub visit_time_raw: i64,
    pub visit_count: i64,
}

impl VisitRecord {
    pub fn new(title: Option<String>, url: String, visit_time_raw: i64, visit_count: i64) -> Self {
        let title = match title {
            Some(t) if !t.trim().is_empty() => t,
            _ => DEFAULT_TITLE.to_string(),
        };
        Self {
            title,
            url,
            visit_time_raw,
            visit_count,
        }
    }

    pub fn visit_time(&self) -> Option<NaiveDateTime> {
        webkit_timestamp_to_datetime(self.visit_time_raw)
    }

    pub fn display_time(&self) -> String {
        self.visit_time()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub host_key: String,
}
