//! # Markdown Output
//!
//! Derives file names from page titles, renders recovered HTML as Markdown
//! behind a fixed header, and rebuilds the set of already converted URLs from
//! the header lines of existing files.

use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use htmd::HtmlToMarkdown;
use htmd::options::{CodeBlockStyle, Options};
use thiserror::Error;
use tracing::{debug, warn};

use crate::acquire::ContentSource;
use crate::constants::{DEFAULT_TITLE, MAX_FILENAME_BYTES};

const URL_MARKER: &str = "URL: ";
/// Header lines searched for the URL marker when rebuilding the processed set.
const HEADER_SCAN_LINES: usize = 8;
const ILLEGAL_FILENAME_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("html to markdown failed: {0}")]
    Render(#[source] std::io::Error),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn is_invisible(c: char) -> bool {
    c.is_control()
        || matches!(
            c,
            '\u{00AD}'
                | '\u{200B}'..='\u{200F}'
                | '\u{202A}'..='\u{202E}'
                | '\u{2060}'..='\u{2064}'
                | '\u{FEFF}'
        )
}

/// Make a page title safe for use as a file name on common filesystems.
///
/// May return an empty string; see [`file_stem`] for the fallback.
pub fn sanitize_filename(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !is_invisible(*c))
        .map(|c| if ILLEGAL_FILENAME_CHARS.contains(&c) { '_' } else { c })
        .collect();
    let trimmed = trim_edges(&cleaned);
    let truncated = truncate_bytes(trimmed, MAX_FILENAME_BYTES);
    trim_edges(truncated).to_string()
}

fn trim_edges(s: &str) -> &str {
    s.trim_matches(|c: char| c == '.' || c.is_whitespace())
}

fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// File stem for a page: the sanitized title, or `untitled_<hash>` keyed on the
/// URL when the title is blank or only the missing-title placeholder.
pub fn file_stem(title: &str, url: &str) -> String {
    let stem = sanitize_filename(title);
    if stem.is_empty() || stem == DEFAULT_TITLE {
        let digest = format!("{:x}", md5::compute(url.as_bytes()));
        return format!("untitled_{}", &digest[..8]);
    }
    stem
}

pub fn output_path(save_dir: &Path, title: &str, url: &str) -> PathBuf {
    save_dir.join(format!("{}.md", file_stem(title, url)))
}

pub fn html_to_markdown(html: &str) -> Result<String, ConvertError> {
    let converter = HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "noscript"])
        .options(Options {
            code_block_style: CodeBlockStyle::Fenced,
            ..Default::default()
        })
        .build();
    converter.convert(html).map_err(ConvertError::Render)
}

pub fn render_markdown(
    title: &str,
    url: &str,
    source: ContentSource,
    html: &str,
) -> Result<String, ConvertError> {
    let body = html_to_markdown(html)?;
    Ok(format!(
        "# {title}\n\n{URL_MARKER}{url}\nSource: {}\n\n---\n\n{}\n",
        source.label(),
        body.trim_end()
    ))
}

/// Render and write one page. The file only appears once fully written.
pub fn write_markdown(
    save_dir: &Path,
    title: &str,
    url: &str,
    source: ContentSource,
    html: &str,
) -> Result<PathBuf, ConvertError> {
    let markdown = render_markdown(title, url, source, html)?;
    let path = output_path(save_dir, title, url);
    let partial = path.with_extension("md.part");
    let io_err = |source| ConvertError::Io {
        path: path.clone(),
        source,
    };
    fs::write(&partial, markdown).map_err(io_err)?;
    if let Err(err) = fs::rename(&partial, &path) {
        let _ = fs::remove_file(&partial);
        return Err(io_err(err));
    }
    debug!("wrote {}", path.display());
    Ok(path)
}

/// URLs already converted to a file, shared between workers.
#[derive(Debug, Clone, Default)]
pub struct ProcessedUrls {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl ProcessedUrls {
    /// Rebuild from the `URL:` header line of every `*.md` file in `save_dir`.
    pub fn load(save_dir: &Path) -> Self {
        let set = Self::default();
        let entries = match fs::read_dir(save_dir) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("no existing output in {}: {err}", save_dir.display());
                return set;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            match read_url_marker(&path) {
                Ok(Some(url)) => {
                    set.insert(url);
                }
                Ok(None) => {}
                Err(err) => warn!("failed to read {}: {err}", path.display()),
            }
        }
        debug!("{} processed urls found in {}", set.len(), save_dir.display());
        set
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn contains(&self, url: &str) -> bool {
        self.lock().contains(url)
    }

    pub fn insert(&self, url: String) -> bool {
        self.lock().insert(url)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn to_set(&self) -> HashSet<String> {
        self.lock().clone()
    }
}

fn read_url_marker(path: &Path) -> std::io::Result<Option<String>> {
    let reader = BufReader::new(fs::File::open(path)?);
    for line in reader.lines().take(HEADER_SCAN_LINES) {
        let line = match line {
            Ok(l) => l,
            // Non-UTF-8 files are not ours.
            Err(_) => return Ok(None),
        };
        if let Some(url) = line.strip_prefix(URL_MARKER) {
            let url = url.trim();
            if !url.is_empty() {
                return Ok(Some(url.to_string()));
            }
        }
    }
    Ok(None)
}
