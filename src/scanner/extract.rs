//! Lossy decoding and HTML boundary heuristics for opaque cache blobs.

use encoding_rs::{BIG5, Encoding, GBK, SHIFT_JIS, UTF_8, WINDOWS_1252};

/// Decoding ladder tried for every cache file, in order.
pub const DECODE_LADDER: [&Encoding; 5] = [UTF_8, WINDOWS_1252, GBK, BIG5, SHIFT_JIS];

const DOCTYPE_OPEN: &str = "<!doctype html";
const HTML_OPEN: &str = "<html";
const HTML_CLOSE: &str = "</html>";
const BODY_OPEN: &str = "<body";
const BODY_CLOSE: &str = "</body>";
const STRUCTURAL_MARKERS: [&str; 6] = ["<html", "<body", "<!doctype", "<head", "<div", "<p"];

#[derive(Debug, Clone, Copy)]
pub struct ExtractPolicy {
    /// Minimum characters for an `<html>` or `<body>` span.
    pub min_html_len: usize,
    /// Minimum characters for accepting a whole blob with only partial markers.
    pub min_blob_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractKind {
    Document,
    Body,
    Blob,
}

/// Decode without ever failing; undecodable bytes become U+FFFD.
pub fn decode_lossy(bytes: &[u8], encoding: &'static Encoding) -> String {
    encoding.decode_without_bom_handling(bytes).0.into_owned()
}

pub fn has_html_markers(text: &str) -> bool {
    let head = text.get(..text.len().min(8192)).unwrap_or(text);
    let lower = head.to_ascii_lowercase();
    lower.contains(HTML_OPEN) || lower.contains(DOCTYPE_OPEN) || lower.contains(BODY_OPEN)
}

/// Find the best HTML span in a decoded blob.
///
/// Prefers a full `<!DOCTYPE html>`/`<html` .. `</html>` document, then a
/// `<body>` .. `</body>` span wrapped into a synthetic document, then the
/// whole blob if it carries some structural marker and is large enough.
pub fn extract_html(text: &str, policy: &ExtractPolicy) -> Option<(ExtractKind, String)> {
    // ASCII lowercasing keeps byte offsets aligned with `text`.
    let lower = text.to_ascii_lowercase();

    let doc_start = match (lower.find(DOCTYPE_OPEN), lower.find(HTML_OPEN)) {
        (Some(d), Some(h)) => Some(d.min(h)),
        (d, h) => d.or(h),
    };
    if let (Some(start), Some(end)) = (doc_start, lower.rfind(HTML_CLOSE)) {
        if start < end {
            let span = &text[start..end + HTML_CLOSE.len()];
            if span.chars().count() >= policy.min_html_len {
                return Some((ExtractKind::Document, span.to_string()));
            }
        }
    }

    if let (Some(start), Some(end)) = (lower.find(BODY_OPEN), lower.rfind(BODY_CLOSE)) {
        if start < end {
            let span = &text[start..end + BODY_CLOSE.len()];
            if span.chars().count() >= policy.min_html_len {
                let doc = format!(
                    "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"></head>\n{span}\n</html>"
                );
                return Some((ExtractKind::Body, doc));
            }
        }
    }

    if STRUCTURAL_MARKERS.iter().any(|m| lower.contains(m))
        && text.chars().count() > policy.min_blob_len
    {
        return Some((ExtractKind::Blob, text.to_string()));
    }

    None
}
