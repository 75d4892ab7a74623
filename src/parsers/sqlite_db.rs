use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use rusqlite::{Connection, params};

use crate::parsers::browser::{CookieRecord, VisitRecord};

pub fn has_table(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' AND name=?1")?;
    let mut rows = stmt.query([name])?;
    Ok(rows.next()?.is_some())
}

/// Most recent visits first, bounded to `limit` rows.
pub fn read_recent_visits(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<VisitRecord>> {
    let mut stmt = conn.prepare(
        "SELECT title, url, last_visit_time, visit_count FROM urls \
         ORDER BY last_visit_time DESC LIMIT ?1",
    )?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map(params![limit], map_visit)?;
    rows.collect()
}

/// Visits strictly newer than `watermark`, most recent first.
pub fn read_visits_since(conn: &Connection, watermark: i64) -> rusqlite::Result<Vec<VisitRecord>> {
    let mut stmt = conn.prepare(
        "SELECT title, url, last_visit_time, visit_count FROM urls \
         WHERE last_visit_time > ?1 ORDER BY last_visit_time DESC",
    )?;
    let rows = stmt.query_map(params![watermark], map_visit)?;
    rows.collect()
}

pub fn max_visit_time(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT MAX(last_visit_time) FROM urls", [], |row| row.get(0))
}

/// Cookies whose host key contains `domain` anywhere (`host_key LIKE '%domain%'`).
pub fn read_cookies(conn: &Connection, domain: &str) -> rusqlite::Result<Vec<CookieRecord>> {
    let mut stmt = conn.prepare(
        "SELECT name, value, host_key FROM cookies WHERE host_key LIKE '%' || ?1 || '%'",
    )?;
    let rows = stmt.query_map(params![domain], |row| {
        Ok(CookieRecord {
            name: row.get(0)?,
            value: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            host_key: row.get(2)?,
        })
    })?;
    rows.collect()
}

fn map_visit(row: &rusqlite::Row<'_>) -> rusqlite::Result<VisitRecord> {
    let title: Option<String> = row.get(0)?;
    let url: String = row.get(1)?;
    let last_visit_time: Option<i64> = row.get(2)?;
    let visit_count: Option<i64> = row.get(3)?;
    Ok(VisitRecord::new(
        title,
        url,
        last_visit_time.unwrap_or(0),
        visit_count.unwrap_or(0),
    ))
}

fn webkit_epoch() -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(1601, 1, 1)?.and_hms_opt(0, 0, 0)
}

/// 1601-epoch microseconds to a naive UTC timestamp.
pub fn webkit_timestamp_to_datetime(microseconds: i64) -> Option<NaiveDateTime> {
    if microseconds < 0 {
        return None;
    }
    webkit_epoch()?.checked_add_signed(TimeDelta::microseconds(microseconds))
}
