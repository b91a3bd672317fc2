//! Upload metadata suggestions and tolerant JSON extraction from model output.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// System prompt for metadata suggestions.
pub const METADATA_SYSTEM_PROMPT: &str = "You catalogue documents for a company knowledge base. \
Reply with one JSON object with the keys title, summary, tags, language and docType. \
The summary is at most two sentences. Tags are short lowercase keywords.";

const METADATA_TEXT_LIMIT: usize = 6000;
const FALLBACK_SUMMARY_CHARS: usize = 200;

/// Suggested metadata for an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    /// Human-friendly title.
    pub title: String,
    /// One or two sentence summary.
    pub summary: String,
    /// Short topical tags.
    pub tags: Vec<String>,
    /// ISO 639-1 language code.
    pub language: String,
    /// Coarse document type, e.g. `report`.
    pub doc_type: String,
}

/// Input to metadata generation: extracted text when available, raw bytes otherwise.
#[derive(Debug, Clone, Copy)]
pub struct MetadataRequest<'a> {
    /// Extracted text, if extraction succeeded.
    pub text: Option<&'a str>,
    /// Original bytes, sent when no text is available.
    pub raw_file: Option<&'a [u8]>,
    /// Name of the uploaded file.
    pub file_name: &'a str,
}

impl MetadataRequest<'_> {
    /// Text shown to the model, bounded in length.
    pub fn text(&self) -> String {
        let text = match (self.text, self.raw_file) {
            (Some(text), _) => text.to_string(),
            (None, Some(bytes)) => String::from_utf8_lossy(bytes)
                .chars()
                .filter(|ch| !ch.is_control() || ch.is_whitespace())
                .collect(),
            (None, None) => String::new(),
        };
        text.chars().take(METADATA_TEXT_LIMIT).collect()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct SuggestedMetadata {
    title: Option<String>,
    summary: Option<String>,
    tags: Vec<String>,
    language: Option<String>,
    #[serde(alias = "doc_type", alias = "type")]
    doc_type: Option<String>,
}

/// Prompt asking the model to describe a file.
pub fn metadata_prompt(file_name: &str, text: &str) -> String {
    format!("File name: {file_name}\n\nContent:\n{text}\n\nDescribe this file as JSON.")
}

/// Merge the model's answer with file-derived defaults for anything missing or malformed.
pub fn metadata_from_completion(raw: &str, file_name: &str, text: &str) -> DocumentMetadata {
    let fallback = fallback_metadata(file_name, text);
    let Some(suggested) = extract_json_object(raw)
        .and_then(|json| serde_json::from_str::<SuggestedMetadata>(json).ok())
    else {
        tracing::debug!(file_name, "Metadata completion was not valid JSON, using defaults");
        return fallback;
    };

    DocumentMetadata {
        title: non_empty(suggested.title).unwrap_or(fallback.title),
        summary: non_empty(suggested.summary).unwrap_or(fallback.summary),
        tags: suggested
            .tags
            .into_iter()
            .map(|tag| tag.trim().to_lowercase())
            .filter(|tag| !tag.is_empty())
            .collect(),
        language: non_empty(suggested.language).unwrap_or(fallback.language),
        doc_type: non_empty(suggested.doc_type).unwrap_or(fallback.doc_type),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Metadata derived from the file name and leading text alone.
pub fn fallback_metadata(file_name: &str, text: &str) -> DocumentMetadata {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default()
        .replace(['_', '-'], " ");
    let title = stem.trim();
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");

    DocumentMetadata {
        title: if title.is_empty() {
            "Untitled document".to_string()
        } else {
            title.to_string()
        },
        summary: collapsed.chars().take(FALLBACK_SUMMARY_CHARS).collect(),
        tags: Vec::new(),
        language: "unknown".to_string(),
        doc_type: "document".to_string(),
    }
}

/// Locate the outermost JSON object in model output, skipping code fences and chatter.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_json_is_accepted() {
        let raw = "Sure!\n```json\n{\"title\":\"Travel Policy\",\"summary\":\"Rules.\",\"tags\":[\"Travel\"],\"language\":\"en\",\"docType\":\"policy\"}\n```";
        let metadata = metadata_from_completion(raw, "travel.pdf", "");
        assert_eq!(metadata.title, "Travel Policy");
        assert_eq!(metadata.tags, vec!["travel".to_string()]);
        assert_eq!(metadata.doc_type, "policy");
    }

    #[test]
    fn garbage_falls_back_to_file_derived_values() {
        let metadata =
            metadata_from_completion("I cannot help", "q3_sales-report.pdf", "Revenue grew.");
        assert_eq!(metadata.title, "q3 sales report");
        assert_eq!(metadata.summary, "Revenue grew.");
        assert!(metadata.tags.is_empty());
        assert_eq!(metadata.language, "unknown");
    }

    #[test]
    fn missing_fields_are_filled_individually() {
        let metadata = metadata_from_completion(r#"{"summary":"  "}"#, "notes.txt", "Body");
        assert_eq!(metadata.title, "notes");
        assert_eq!(metadata.summary, "Body");
    }

    #[test]
    fn request_text_prefers_extracted_text_and_is_bounded() {
        let long = "x".repeat(METADATA_TEXT_LIMIT + 10);
        let request = MetadataRequest {
            text: Some(&long),
            raw_file: Some(b"ignored".as_slice()),
            file_name: "a.txt",
        };
        assert_eq!(request.text().len(), METADATA_TEXT_LIMIT);

        let raw_only = MetadataRequest {
            text: None,
            raw_file: Some(b"plain\x00text".as_slice()),
            file_name: "a.bin",
        };
        assert_eq!(raw_only.text(), "plaintext");
    }
}
