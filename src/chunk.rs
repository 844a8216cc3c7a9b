//! Section-aware manual chunker.
//!
//! Pages are broken into *units*: whole table-like paragraphs (error-code
//! listings and similar) or single sentences. Units are packed into
//! [`ManualChunk`]s of roughly `target_tokens`, never crossing a section
//! boundary. After a size-driven flush the next chunk starts with the tail
//! of the previous one so context carries across the cut.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::extract::{normalize_whitespace, ManualPage, DEFAULT_SECTION};

/// Fraction of code-like lines that makes a paragraph table-like.
const TABLE_LINE_RATIO: f64 = 0.4;
const TABLE_MIN_LINES: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct ManualChunk {
    pub id: String,
    pub chunk_index: i64,
    /// Lowest page number contributing to the chunk.
    pub page_number: i64,
    pub section: String,
    pub text: String,
    pub text_hash: String,
}

#[derive(Debug, Clone)]
struct Unit {
    text: String,
    page_number: i64,
    tokens: usize,
}

/// Rough token count for technical prose: 1.3 tokens per word, at least 1.
pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    ((words as f64 * 1.3) as usize).max(1)
}

/// Pack analyzed pages into chunks with contiguous indices from 0.
pub fn chunk_pages(
    pages: &[ManualPage],
    target_tokens: usize,
    overlap_tokens: usize,
) -> Vec<ManualChunk> {
    let mut chunks = Vec::new();
    let mut current: Vec<Unit> = Vec::new();
    let mut current_tokens = 0usize;
    let mut current_section: Option<String> = None;

    for page in pages {
        let section = match page.section.trim() {
            "" => DEFAULT_SECTION,
            s => s,
        };

        for text in split_into_units(&page.text) {
            let unit = Unit {
                tokens: estimate_tokens(&text),
                text,
                page_number: page.page_number,
            };

            if current_section.as_deref() != Some(section) {
                if let Some(prev) = current_section.take() {
                    flush(&mut chunks, &current, &prev);
                }
                current.clear();
                current_tokens = 0;
                current_section = Some(section.to_string());
            }

            if !current.is_empty() && current_tokens + unit.tokens > target_tokens {
                flush(&mut chunks, &current, section);
                current = tail_overlap(&current, overlap_tokens);
                current_tokens = current.iter().map(|u| u.tokens).sum();
            }

            current_tokens += unit.tokens;
            current.push(unit);
        }
    }

    if let Some(section) = current_section {
        flush(&mut chunks, &current, &section);
    }

    chunks
}

fn flush(chunks: &mut Vec<ManualChunk>, units: &[Unit], section: &str) {
    if units.is_empty() {
        return;
    }
    let joined = units
        .iter()
        .map(|u| u.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    let text = normalize_whitespace(&joined);
    if text.is_empty() {
        return;
    }
    let page_number = units.iter().map(|u| u.page_number).min().unwrap_or(1);
    let index = chunks.len() as i64;
    chunks.push(make_chunk(index, page_number, section, text));
}

/// Trailing units of `units` whose estimated tokens reach `overlap_tokens`.
fn tail_overlap(units: &[Unit], overlap_tokens: usize) -> Vec<Unit> {
    if overlap_tokens == 0 {
        return Vec::new();
    }
    let mut running = 0usize;
    let mut start = units.len();
    while start > 0 {
        start -= 1;
        running += units[start].tokens;
        if running >= overlap_tokens {
            break;
        }
    }
    units[start..].to_vec()
}

fn make_chunk(index: i64, page_number: i64, section: &str, text: String) -> ManualChunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    ManualChunk {
        id: Uuid::new_v4().to_string(),
        chunk_index: index,
        page_number,
        section: section.to_string(),
        text,
        text_hash: hash,
    }
}

/// Paragraphs split on blank lines; table-like paragraphs stay whole, the
/// rest are split into sentences.
pub fn split_into_units(text: &str) -> Vec<String> {
    let mut units = Vec::new();
    for paragraph in split_paragraphs(text) {
        if is_table_like(paragraph) {
            units.push(paragraph.to_string());
            continue;
        }
        let sentences = split_sentences(paragraph);
        if sentences.len() <= 1 {
            units.push(paragraph.to_string());
        } else {
            units.extend(sentences);
        }
    }
    units
}

fn split_paragraphs(text: &str) -> Vec<&str> {
    let mut paragraphs = Vec::new();
    let mut start = 0usize;
    let mut offset = 0usize;
    let mut blank_run = false;

    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() && line.ends_with('\n') {
            if !blank_run {
                paragraphs.push(&text[start..offset]);
                blank_run = true;
            }
        } else if blank_run {
            start = offset;
            blank_run = false;
        }
        offset += line.len();
    }
    if !blank_run {
        paragraphs.push(&text[start..]);
    }

    paragraphs
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// At least four non-empty lines, 40% or more of them code rows.
pub fn is_table_like(paragraph: &str) -> bool {
    let lines: Vec<&str> = paragraph
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.len() < TABLE_MIN_LINES {
        return false;
    }
    let code_like = lines.iter().filter(|l| is_code_row(l)).count();
    code_like as f64 / lines.len() as f64 >= TABLE_LINE_RATIO
}

/// A short code token followed by a description, e.g. `E12 Door open` or
/// `PUMP-1 Drain pump`.
fn is_code_row(line: &str) -> bool {
    let Some(split) = line.find(char::is_whitespace) else {
        return false;
    };
    let (token, rest) = line.split_at(split);
    if rest.trim().is_empty() {
        return false;
    }

    let len = token.chars().count();
    let table_token = (2..=20).contains(&len)
        && token
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '/'));
    table_token || is_error_code_token(token)
}

fn is_error_code_token(token: &str) -> bool {
    let upper = token.to_ascii_uppercase();
    ["ERR", "AL", "E", "F"].iter().any(|prefix| {
        upper
            .strip_prefix(prefix)
            .map(|digits| {
                !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit() || c == '-')
            })
            .unwrap_or(false)
    })
}

/// Split after `.`, `!` or `?` when whitespace follows and the next
/// sentence starts with an upper-case letter or a digit.
pub fn split_sentences(paragraph: &str) -> Vec<String> {
    let chars: Vec<(usize, char)> = paragraph.char_indices().collect();
    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let (pos, c) = chars[i];
        if matches!(c, '.' | '!' | '?') {
            let mut j = i + 1;
            while j < chars.len() && chars[j].1.is_whitespace() {
                j += 1;
            }
            if j > i + 1 && j < chars.len() {
                let next = chars[j].1;
                if next.is_ascii_uppercase() || next.is_ascii_digit() {
                    sentences.push(paragraph[start..pos + c.len_utf8()].trim().to_string());
                    start = chars[j].0;
                    i = j;
                    continue;
                }
            }
        }
        i += 1;
    }
    sentences.push(paragraph[start..].trim().to_string());
    sentences.retain(|s| !s.is_empty());
    sentences
}
