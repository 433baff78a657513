#![expect(
    clippy::string_slice,
    reason = "cut offsets come from char_indices and regex match boundaries"
)]


use std::sync::LazyLock;

use fancy_regex::Regex;
use tracing::debug;

use crate::database::sqlite::ContextType;
use crate::{RagError, Result};

/// Chunk size and overlap, both in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerConfig {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl ChunkerConfig {
    /// Per-type defaults.
    #[inline]
    pub fn for_type(context_type: ContextType) -> Self {
        match context_type {
            ContextType::Markdown => Self {
                chunk_size: 1200,
                overlap: 200,
            },
            ContextType::Faq => Self {
                chunk_size: 800,
                overlap: 100,
            },
            ContextType::Pdf | ContextType::Webscraper => Self {
                chunk_size: 1000,
                overlap: 150,
            },
        }
    }
}

/// Split `text` using the strategy for `context_type`.
///
/// All chunkers are deterministic and pure; every returned chunk is non-empty
/// after trimming.
#[inline]
pub fn chunk_for_type(
    context_type: ContextType,
    text: &str,
    config: ChunkerConfig,
) -> Result<Vec<String>> {
    if config.chunk_size == 0 {
        return Err(RagError::Chunk("chunk_size must be nonzero".to_string()));
    }

    let chunks = match context_type {
        ContextType::Markdown => chunk_markdown(text, config),
        ContextType::Faq => chunk_faq(text, config),
        ContextType::Pdf => chunk_pdf(text, config),
        ContextType::Webscraper => chunk_web(text, config),
    };

    debug!(
        "Chunked {} chars of {} content into {} chunks",
        text.chars().count(),
        context_type,
        chunks.len()
    );

    Ok(chunks)
}

/// Where to cut relative to a break-pattern match.
#[derive(Debug, Clone, Copy)]
enum Cut {
    /// Cut before the match (the match starts the next chunk).
    Start,
    /// Cut after the match (the match ends this chunk).
    End,
}

struct BreakRule {
    pattern: Regex,
    cut: Cut,
}

impl BreakRule {
    fn new(pattern: &str, cut: Cut) -> Self {
        Self {
            // Patterns are static and known-valid.
            pattern: Regex::new(pattern).unwrap_or_else(|e| panic!("invalid break pattern: {e}")),
            cut,
        }
    }
}

/// Windowed chunker: slide a window of `chunk_size` characters, prefer the
/// last acceptable break of the first matching rule, else hard-cut at the
/// window boundary. At most one hard cut per chunk.
fn chunk_windowed(
    text: &str,
    config: ChunkerConfig,
    rules: &[BreakRule],
    min_fraction: f32,
) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let remaining = &text[start..];
        let end_offset = char_offset(remaining, config.chunk_size);
        let window = &remaining[..end_offset];

        // The final window is taken whole; no break search needed.
        let cut = if start + end_offset >= text.len() {
            window.len()
        } else {
            let min_bytes = (window.len() as f32 * min_fraction) as usize;
            find_cut(window, rules, min_bytes).unwrap_or(window.len())
        };

        let piece = &window[..cut];
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }

        // Advance by chunk length minus overlap, always at least one char.
        let piece_chars = piece.chars().count();
        let advance_chars = piece_chars.saturating_sub(config.overlap).max(1);
        let advance_bytes = char_offset(remaining, advance_chars).max(1);
        start += advance_bytes;
    }

    chunks
}

/// Byte offset of the `chars`-th character, clamped to the end of `s`.
fn char_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}

/// Last acceptable break in the window, trying rules in preference order.
fn find_cut(window: &str, rules: &[BreakRule], min_bytes: usize) -> Option<usize> {
    for rule in rules {
        let mut best: Option<usize> = None;
        for m in rule.pattern.find_iter(window).flatten() {
            let pos = match rule.cut {
                Cut::Start => m.start(),
                Cut::End => m.end(),
            };
            if pos >= min_bytes && pos > 0 && pos < window.len() {
                best = Some(best.map_or(pos, |b: usize| b.max(pos)));
            }
        }
        if best.is_some() {
            return best;
        }
    }
    None
}

static PLAIN_RULES: LazyLock<Vec<BreakRule>> = LazyLock::new(|| {
    vec![
        BreakRule::new(r"\. ", Cut::End),
        BreakRule::new(r"! ", Cut::End),
        BreakRule::new(r"\? ", Cut::End),
        BreakRule::new(r"\n\n", Cut::End),
        BreakRule::new(r" ", Cut::End),
    ]
});

/// Plain text: sentence ends, paragraph breaks, then any whitespace, at 50%
/// of the window or later.
#[inline]
pub fn chunk_text(text: &str, config: ChunkerConfig) -> Vec<String> {
    chunk_windowed(text, config, &PLAIN_RULES, 0.5)
}

static MARKDOWN_RULES: LazyLock<Vec<BreakRule>> = LazyLock::new(|| {
    vec![
        BreakRule::new(r"(?m)^#{1,6} ", Cut::Start),
        BreakRule::new(r"\n\n", Cut::End),
        BreakRule::new(r"(?m)^[-*+] ", Cut::Start),
        BreakRule::new(r"(?m)^\d+[.)] ", Cut::Start),
        BreakRule::new(r"(?m)^```", Cut::Start),
        BreakRule::new(r"[.!?] ", Cut::End),
        BreakRule::new(r" ", Cut::End),
    ]
});

static TOP_LEVEL_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^# ").unwrap_or_else(|e| panic!("invalid header pattern: {e}"))
});

/// Markdown: first try splitting on top-level headers; if every section fits
/// within `chunk_size`, the sections are the chunks. Otherwise fall back to
/// windowed chunking with markdown-aware break preferences at 40%.
#[inline]
pub fn chunk_markdown(text: &str, config: ChunkerConfig) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let mut boundaries: Vec<usize> = TOP_LEVEL_HEADER
        .find_iter(text)
        .flatten()
        .map(|m| m.start())
        .collect();

    if !boundaries.is_empty() {
        if boundaries[0] != 0 {
            boundaries.insert(0, 0);
        }
        boundaries.push(text.len());

        let sections: Vec<&str> = boundaries
            .windows(2)
            .map(|w| text[w[0]..w[1]].trim())
            .filter(|s| !s.is_empty())
            .collect();

        if !sections.is_empty()
            && sections
                .iter()
                .all(|s| s.chars().count() <= config.chunk_size)
        {
            return sections.iter().map(|s| (*s).to_string()).collect();
        }
    }

    chunk_windowed(text, config, &MARKDOWN_RULES, 0.4)
}

static FAQ_GROUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^Q:.*?(?=^Q:|\z)").unwrap_or_else(|e| panic!("invalid FAQ pattern: {e}"))
});

/// FAQ: extract `Q: ...` groups (greedy until the next `Q:` or end of input)
/// and greedy-pack whole groups into chunks, emitting before a group would
/// exceed `chunk_size`. Falls back to plain text when no `Q:` structure is
/// found.
#[inline]
pub fn chunk_faq(text: &str, config: ChunkerConfig) -> Vec<String> {
    let matches: Vec<_> = FAQ_GROUP.find_iter(text).flatten().collect();

    if matches.is_empty() {
        return chunk_text(text, config);
    }

    // Preamble before the first question rides along as its own group.
    let mut groups: Vec<&str> = Vec::new();
    let first_start = matches[0].start();
    if !text[..first_start].trim().is_empty() {
        groups.push(&text[..first_start]);
    }
    groups.extend(matches.iter().map(|m| m.as_str()));

    const SEPARATOR_LEN: usize = 2; // "\n\n"

    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;

    for group in groups {
        // Each group is measured with its trailing blank line, so packing
        // stays within the budget even after groups are rejoined.
        let trimmed = group.trim();
        let group_len = trimmed.chars().count() + SEPARATOR_LEN;

        if !current.is_empty() && current_len + SEPARATOR_LEN + group_len > config.chunk_size {
            chunks.push(current.join("\n\n"));
            current.clear();
            current_len = 0;
        }

        if !current.is_empty() {
            current_len += SEPARATOR_LEN;
        }
        current.push(trimmed);
        current_len += group_len;
    }

    if !current.is_empty() {
        chunks.push(current.join("\n\n"));
    }

    chunks.retain(|c| !c.trim().is_empty());
    chunks
}

static PDF_RULES: LazyLock<Vec<BreakRule>> = LazyLock::new(|| {
    vec![
        BreakRule::new(r"(?m)^[A-Z][A-Z0-9 \-]{3,}$", Cut::Start),
        BreakRule::new(r"\n\n", Cut::End),
        BreakRule::new(r"(?m)^[•\-*] ", Cut::Start),
        BreakRule::new(r"(?m)^\d+[.)] ", Cut::Start),
        BreakRule::new(r"[.!?] ", Cut::End),
        BreakRule::new(r"\s", Cut::End),
    ]
});

static SENTENCE_REFLOW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([.!?]) ([A-Z])").unwrap_or_else(|e| panic!("invalid reflow pattern: {e}"))
});

/// PDF: extracted text arrives with broken layout, so normalize whitespace,
/// reflow sentence ends into paragraph breaks, re-expose ALL-CAPS headers,
/// then window with PDF break preferences at 30%.
#[inline]
pub fn chunk_pdf(text: &str, config: ChunkerConfig) -> Vec<String> {
    let normalized = normalize_pdf_text(text);
    chunk_windowed(&normalized, config, &PDF_RULES, 0.3)
}

fn normalize_pdf_text(text: &str) -> String {
    // Rebuild paragraphs: collapse whitespace runs, keep blank lines as
    // paragraph breaks, and float ALL-CAPS header lines out on their own.
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        let line = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if line.is_empty() {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
        } else if is_all_caps_header(&line) {
            if !current.is_empty() {
                paragraphs.push(std::mem::take(&mut current));
            }
            paragraphs.push(line);
        } else {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&line);
        }
    }
    if !current.is_empty() {
        paragraphs.push(current);
    }

    let joined = paragraphs.join("\n\n");

    // Sentence end followed by a capital starts a new paragraph.
    SENTENCE_REFLOW.replace_all(&joined, "$1\n\n$2").into_owned()
}

fn is_all_caps_header(line: &str) -> bool {
    let alpha_count = line.chars().filter(|c| c.is_ascii_alphabetic()).count();
    alpha_count >= 2
        && line.len() >= 4
        && line
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == ' ' || c == '-')
}

static WEB_RULES: LazyLock<Vec<BreakRule>> = LazyLock::new(|| {
    vec![
        BreakRule::new(r"\n{2,}", Cut::End),
        BreakRule::new(r"\n", Cut::End),
        BreakRule::new(r"\.\s+", Cut::End),
        BreakRule::new(r",\s+", Cut::End),
        BreakRule::new(r"\s", Cut::End),
    ]
});

/// Web: normalize runs of blank lines and spaces, then window with web break
/// preferences at 40%.
#[inline]
pub fn chunk_web(text: &str, config: ChunkerConfig) -> Vec<String> {
    let normalized = normalize_web_text(text);
    chunk_windowed(&normalized, config, &WEB_RULES, 0.4)
}

fn normalize_web_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.replace('\r', "").lines() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run == 1 {
                out.push('\n');
            }
        } else {
            blank_run = 0;
            let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
            out.push_str(&collapsed);
            out.push('\n');
        }
    }
    out
}
