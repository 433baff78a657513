
pub mod web;

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::ScraperConfig;
use crate::database::sqlite::ContextType;
use crate::{RagError, Result};

pub use web::WebScraper;

/// The raw material handed to ingestion for one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// In-memory PDF document.
    PdfBytes(Vec<u8>),
    /// A file on disk (PDF, Markdown, or FAQ depending on the context type).
    File(PathBuf),
    /// Already-loaded text (Markdown or FAQ).
    Text(String),
    /// A page to scrape with the headless browser.
    Url(String),
}

impl SourceSpec {
    /// File path recorded on persisted chunks, when the source is a file.
    #[inline]
    pub fn file_path(&self) -> Option<&Path> {
        match *self {
            SourceSpec::File(ref path) => Some(path),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match *self {
            SourceSpec::PdfBytes(_) => "pdf-bytes",
            SourceSpec::File(_) => "file",
            SourceSpec::Text(_) => "text",
            SourceSpec::Url(_) => "url",
        }
    }
}

/// Turn a source into a single UTF-8 text blob using the parser for
/// `context_type`.
///
/// Web sources drive a headless browser and can take a while; everything
/// else is local I/O.
pub async fn parse(
    context_type: ContextType,
    source: &SourceSpec,
    scraper_config: &ScraperConfig,
) -> Result<String> {
    let text = match (context_type, source) {
        (ContextType::Pdf, SourceSpec::PdfBytes(bytes)) => parse_pdf(bytes)?,
        (ContextType::Pdf, SourceSpec::File(path)) => parse_pdf(&read_file_bytes(path)?)?,
        (ContextType::Markdown, SourceSpec::File(path)) => read_file_text(path)?,
        (ContextType::Markdown, SourceSpec::Text(text)) => text.clone(),
        (ContextType::Faq, SourceSpec::File(path)) => read_file_text(path)?.trim().to_string(),
        (ContextType::Faq, SourceSpec::Text(text)) => text.trim().to_string(),
        (ContextType::Webscraper, SourceSpec::Url(url)) => {
            WebScraper::new(scraper_config.clone()).scrape(url).await?
        }
        (context_type, source) => {
            return Err(RagError::InvalidInput(format!(
                "Source {} is not valid for {} contexts",
                source.kind(),
                context_type
            )));
        }
    };

    debug!(
        "Parsed {} source into {} chars of text",
        context_type,
        text.chars().count()
    );

    Ok(text)
}

/// Extract text from an in-memory PDF document.
fn parse_pdf(bytes: &[u8]) -> Result<String> {
    if bytes.is_empty() {
        return Err(RagError::InvalidInput("PDF source is empty".to_string()));
    }

    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| RagError::Parse(format!("Failed to extract text from PDF: {e}")))
}

fn read_file_bytes(path: &Path) -> Result<Vec<u8>> {
    if !path.exists() {
        return Err(RagError::NotFound(format!(
            "Source file does not exist: {}",
            path.display()
        )));
    }
    Ok(std::fs::read(path)?)
}

fn read_file_text(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(RagError::NotFound(format!(
            "Source file does not exist: {}",
            path.display()
        )));
    }
    std::fs::read_to_string(path).map_err(|e| {
        RagError::Parse(format!(
            "Source file {} is not valid UTF-8: {e}",
            path.display()
        ))
    })
}
