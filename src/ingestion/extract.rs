//! Page-indexed text extraction from uploaded bytes.
//!
//! Extraction never fails: formats without a parser, parser errors and empty results all degrade
//! to a one-page placeholder describing the file, so later stages always have text to work on.

use crate::catalog::ArtifactSource;
use scraper::{ElementRef, Html};
use std::path::Path;

const BLOCK_TAGS: [&str; 22] = [
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "figcaption",
    "footer", "h1", "h2", "h3", "h4", "h5", "h6", "header", "li", "p", "pre", "section",
];
const TABLE_TAGS: [&str; 4] = ["table", "tr", "ul", "ol"];
const SKIPPED_TAGS: [&str; 6] = ["script", "style", "noscript", "head", "template", "svg"];

/// Text of one page, numbered from 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    /// Page number.
    pub number: u32,
    /// Page text.
    pub text: String,
}

/// Result of extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedText {
    /// Text of every page joined.
    pub full_text: String,
    /// Per-page text.
    pub pages: Vec<PageText>,
    /// Number of pages, at least 1.
    pub page_count: u32,
    /// Whether the text is a placeholder rather than the file's content.
    pub placeholder: bool,
}

impl ExtractedText {
    fn single_page(text: String) -> Self {
        Self {
            pages: vec![PageText {
                number: 1,
                text: text.clone(),
            }],
            full_text: text,
            page_count: 1,
            placeholder: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceFormat {
    Pdf,
    PlainText,
    Markup,
    Unsupported,
}

fn detect_format(media_type: &str, file_name: Option<&str>) -> SourceFormat {
    let media_type = media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match media_type.as_str() {
        "application/pdf" => return SourceFormat::Pdf,
        "text/html" | "application/xhtml+xml" => return SourceFormat::Markup,
        "text/plain" | "text/markdown" | "text/csv" | "application/json" => {
            return SourceFormat::PlainText;
        }
        _ => {}
    }

    let extension = file_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("pdf") => SourceFormat::Pdf,
        Some("html" | "htm" | "xhtml") => SourceFormat::Markup,
        Some("txt" | "md" | "markdown" | "csv" | "json") => SourceFormat::PlainText,
        _ => SourceFormat::Unsupported,
    }
}

/// Extract page-indexed text from an artifact source.
pub async fn extract_text(source: &ArtifactSource) -> ExtractedText {
    let format = detect_format(&source.media_type, source.file_name.as_deref());
    let extracted = match format {
        SourceFormat::Pdf => extract_pdf(source.bytes.clone()).await,
        SourceFormat::PlainText => Some(ExtractedText::single_page(
            String::from_utf8_lossy(&source.bytes).into_owned(),
        )),
        SourceFormat::Markup => Some(ExtractedText::single_page(markup_text(
            &String::from_utf8_lossy(&source.bytes),
        ))),
        SourceFormat::Unsupported => None,
    };

    match extracted {
        Some(text) if !text.full_text.trim().is_empty() => text,
        _ => {
            tracing::warn!(
                media_type = %source.media_type,
                file_name = source.file_name.as_deref().unwrap_or_default(),
                size = source.bytes.len(),
                ?format,
                "No extractable text, using placeholder"
            );
            placeholder(source)
        }
    }
}

async fn extract_pdf(bytes: Vec<u8>) -> Option<ExtractedText> {
    let parsed = tokio::task::spawn_blocking(move || {
        let text = pdf_extract::extract_text_from_mem(&bytes);
        let page_count = lopdf::Document::load_mem(&bytes)
            .map(|document| document.get_pages().len() as u32)
            .unwrap_or(1);
        (text, page_count)
    })
    .await;

    match parsed {
        Ok((Ok(text), page_count)) => {
            let text = text.replace('\0', "");
            let pages = split_evenly(&text, page_count.max(1));
            Some(ExtractedText {
                page_count: pages.len() as u32,
                pages,
                full_text: text,
                placeholder: false,
            })
        }
        Ok((Err(error), _)) => {
            tracing::warn!(error = %error, "PDF text extraction failed");
            None
        }
        Err(error) => {
            tracing::warn!(error = %error, "PDF parser panicked");
            None
        }
    }
}

/// Split text into `page_count` pages of roughly equal character length.
///
/// PDF text carries no dependable page markers, so this is an approximation of the real layout.
pub fn split_evenly(text: &str, page_count: u32) -> Vec<PageText> {
    let page_count = page_count.max(1) as usize;
    let chars: Vec<char> = text.chars().collect();
    let per_page = chars.len().div_ceil(page_count).max(1);

    (0..page_count)
        .map(|page| {
            let start = (page * per_page).min(chars.len());
            let end = ((page + 1) * per_page).min(chars.len());
            PageText {
                number: page as u32 + 1,
                text: chars[start..end].iter().collect(),
            }
        })
        .collect()
}

/// Visible text of an HTML document, one blank line between block elements.
pub fn markup_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut raw = String::new();
    collect_text(document.root_element(), &mut raw);

    raw.split("\n\n")
        .map(|block| block.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|block| !block.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    let name = element.value().name();
    if SKIPPED_TAGS.contains(&name) {
        return;
    }
    let block = BLOCK_TAGS.contains(&name) || TABLE_TAGS.contains(&name);
    if block {
        out.push_str("\n\n");
    }
    for child in element.children() {
        if let Some(child_element) = ElementRef::wrap(child) {
            collect_text(child_element, out);
        } else if let Some(text) = child.value().as_text() {
            out.push_str(text);
            out.push(' ');
        }
    }
    if block {
        out.push_str("\n\n");
    }
}

fn placeholder(source: &ArtifactSource) -> ExtractedText {
    let name = source.file_name.as_deref().unwrap_or("untitled");
    let text = format!(
        "Uploaded file \"{name}\" of type {} ({} bytes). No text could be extracted from this file.",
        source.media_type,
        source.bytes.len()
    );
    ExtractedText {
        placeholder: true,
        ..ExtractedText::single_page(text)
    }
}
