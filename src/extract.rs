//! PDF page extraction and page analysis.
//!
//! Extraction is split in two so the analysis can be exercised without a
//! real PDF: [`extract_pages`] turns bytes into one raw string per page,
//! and [`analyze_pages`] normalizes them, assigns section headers, and
//! rejects image-only (scanned) documents.

use serde::Serialize;

/// Pages with less text than this count as near-empty.
const NEAR_EMPTY_PAGE_CHARS: usize = 40;
/// Fraction of near-empty pages at which a document is considered scanned.
const SCANNED_PAGE_RATIO: f64 = 0.6;
/// Documents with less total text than this are considered scanned.
const MIN_DOCUMENT_CHARS: usize = 250;
/// Only the first lines of a page are considered for a section header.
const HEADER_SCAN_LINES: usize = 12;
const MAX_SECTION_CHARS: usize = 255;

pub const DEFAULT_SECTION: &str = "General";

#[derive(Debug)]
pub enum ExtractError {
    Pdf(String),
    NoPages,
    /// Little or no extractable text; OCR would be needed first.
    Scanned,
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::NoPages => write!(f, "No pages found in PDF"),
            ExtractError::Scanned => write!(
                f,
                "PDF appears to be scanned or image-based. OCR is required before indexing."
            ),
        }
    }
}

impl std::error::Error for ExtractError {}

/// One analyzed page of a manual.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManualPage {
    /// 1-based page number.
    pub page_number: i64,
    pub section: String,
    pub text: String,
}

/// Extract raw text for every page of a PDF.
pub fn extract_pages(bytes: &[u8]) -> Result<Vec<String>, ExtractError> {
    pdf_extract::extract_text_from_mem_by_pages(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))
}

/// Normalize page text, attach section headers, and reject scanned PDFs.
pub fn analyze_pages(raw_pages: Vec<String>) -> Result<Vec<ManualPage>, ExtractError> {
    if raw_pages.is_empty() {
        return Err(ExtractError::NoPages);
    }

    let mut near_empty = 0usize;
    let mut total_chars = 0usize;
    let mut detected: Vec<(String, Option<String>)> = Vec::with_capacity(raw_pages.len());

    for raw in &raw_pages {
        let text = normalize_whitespace(raw);
        let chars = text.chars().count();
        if chars < NEAR_EMPTY_PAGE_CHARS {
            near_empty += 1;
        }
        total_chars += chars;
        let header = detect_section_header(&text);
        detected.push((text, header));
    }

    let ratio = near_empty as f64 / raw_pages.len() as f64;
    if ratio >= SCANNED_PAGE_RATIO || total_chars < MIN_DOCUMENT_CHARS {
        return Err(ExtractError::Scanned);
    }

    // Pages without their own header inherit the last one seen.
    let mut active = DEFAULT_SECTION.to_string();
    let pages = detected
        .into_iter()
        .enumerate()
        .map(|(i, (text, header))| {
            if let Some(h) = header {
                active = h;
            }
            ManualPage {
                page_number: i as i64 + 1,
                section: active.clone(),
                text,
            }
        })
        .collect();

    Ok(pages)
}

/// Full document text with `--- Page N ---` markers, as stored on the manual.
pub fn render_document_text(pages: &[ManualPage]) -> String {
    let mut out = String::new();
    for page in pages {
        out.push_str(&format!("\n--- Page {} ---\n", page.page_number));
        out.push_str(&page.text);
    }
    out
}

/// Collapse horizontal whitespace runs, cap blank-line runs at one, trim.
///
/// NUL is read as a space and `\r` is dropped, so CRLF text normalizes like
/// LF text. Spaces before a line break are removed, which makes a line of
/// only spaces or tabs a blank line.
pub fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    let mut newlines = 0usize;

    for c in text.chars() {
        let c = if c == '\0' { ' ' } else { c };
        match c {
            ' ' | '\t' => pending_space = true,
            '\r' => {}
            '\n' => {
                pending_space = false;
                newlines += 1;
            }
            _ => {
                if newlines > 0 {
                    // trailing spaces before a newline are dropped with it
                    if out.ends_with(' ') {
                        out.pop();
                    }
                    out.push_str(if newlines >= 2 { "\n\n" } else { "\n" });
                    newlines = 0;
                    pending_space = false;
                }
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                out.push(c);
            }
        }
    }

    out.trim().to_string()
}

/// First short line near the top of the page that is upper-case or ends
/// with a colon.
pub fn detect_section_header(page_text: &str) -> Option<String> {
    page_text
        .lines()
        .take(HEADER_SCAN_LINES)
        .map(str::trim)
        .find(|line| {
            let len = line.chars().count();
            (4..=90).contains(&len) && (is_upper_case(line) || line.ends_with(':'))
        })
        .map(|line| line.chars().take(MAX_SECTION_CHARS).collect())
}

/// True when the text has at least one cased character and none of its
/// cased characters are lower-case.
pub fn is_upper_case(text: &str) -> bool {
    let mut has_cased = false;
    for c in text.chars() {
        if c.is_lowercase() {
            return false;
        }
        if c.is_uppercase() {
            has_cased = true;
        }
    }
    has_cased
}
