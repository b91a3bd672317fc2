//! Substring scoring shared by the index backends.

use super::LexicalHit;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Field a lexical query matched, in decreasing weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LexicalField {
    /// Artifact title.
    Title,
    /// Original file name.
    FileName,
    /// Artifact summary.
    Summary,
    /// Chunk text.
    Content,
}

impl LexicalField {
    /// Score given to a hit on this field.
    pub fn weight(self) -> f32 {
        match self {
            Self::Title => 0.9,
            Self::FileName => 0.8,
            Self::Summary => 0.7,
            Self::Content => 0.6,
        }
    }
}

/// Highest-weighted field containing `query`, case-insensitively.
pub fn best_match(
    query: &str,
    title: &str,
    file_name: Option<&str>,
    summary: Option<&str>,
    content: &str,
) -> Option<LexicalField> {
    let needle = query.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }
    let contains = |haystack: &str| haystack.to_lowercase().contains(&needle);

    if contains(title) {
        Some(LexicalField::Title)
    } else if file_name.is_some_and(contains) {
        Some(LexicalField::FileName)
    } else if summary.is_some_and(contains) {
        Some(LexicalField::Summary)
    } else if contains(content) {
        Some(LexicalField::Content)
    } else {
        None
    }
}

/// Keep the heaviest hit of every artifact, order by weight and cut to `limit`.
///
/// Ties keep the order the hits were scanned in.
pub fn rank_lexical_hits(hits: Vec<LexicalHit>, limit: usize) -> Vec<LexicalHit> {
    let mut best: HashMap<_, usize> = HashMap::new();
    let mut ranked: Vec<LexicalHit> = Vec::new();
    for hit in hits {
        match best.get(&hit.hit.artifact_id) {
            Some(&position) if ranked[position].hit.score >= hit.hit.score => {}
            Some(&position) => ranked[position] = hit,
            None => {
                best.insert(hit.hit.artifact_id, ranked.len());
                ranked.push(hit);
            }
        }
    }
    ranked.sort_by(|a, b| b.hit.score.partial_cmp(&a.hit.score).unwrap_or(Ordering::Equal));
    ranked.truncate(limit);
    ranked
}
