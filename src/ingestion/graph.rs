//! Best-effort knowledge graph extraction for articles.

use super::IngestionError;
use crate::catalog::{ArtifactRepository, KnowledgeEntity, ResolvedRelationship};
use crate::provider::metadata::extract_json_object;
use crate::provider::{CompletionOptions, ModelProvider};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

const GRAPH_SYSTEM_PROMPT: &str = "You extract a knowledge graph from company articles. \
Reply with one JSON object: {\"entities\":[{\"name\":\"\",\"type\":\"\",\"description\":\"\"}],\
\"relationships\":[{\"source\":\"\",\"target\":\"\",\"type\":\"\",\"description\":\"\"}]}. \
Relationship endpoints must repeat entity names exactly.";

/// Counts of what was persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GraphSummary {
    /// Entities written.
    pub entities: usize,
    /// Relationships written.
    pub relationships: usize,
}

#[derive(Debug, Default, Deserialize)]
struct GraphExtraction {
    #[serde(default)]
    entities: Vec<KnowledgeEntity>,
    #[serde(default)]
    relationships: Vec<ExtractedRelationship>,
}

#[derive(Debug, Clone, Deserialize)]
struct ExtractedRelationship {
    source: String,
    target: String,
    #[serde(rename = "type", alias = "relation_type", default)]
    relation_type: String,
    #[serde(default)]
    description: String,
}

fn graph_prompt(title: &str, text: &str) -> String {
    format!("Article title: {title}\n\nArticle text:\n{text}")
}

fn parse_graph(raw: &str) -> Result<GraphExtraction, IngestionError> {
    let json = extract_json_object(raw).ok_or(IngestionError::MalformedGraph)?;
    serde_json::from_str(json).map_err(|_| IngestionError::MalformedGraph)
}

fn dedupe_entities(entities: Vec<KnowledgeEntity>) -> Vec<KnowledgeEntity> {
    let mut seen = HashSet::new();
    entities
        .into_iter()
        .map(|entity| KnowledgeEntity {
            name: entity.name.trim().to_string(),
            ..entity
        })
        .filter(|entity| !entity.name.is_empty() && seen.insert(entity.name.clone()))
        .collect()
}

fn resolve_relationships(
    relationships: Vec<ExtractedRelationship>,
    ids: &HashMap<String, Uuid>,
) -> Vec<ResolvedRelationship> {
    relationships
        .into_iter()
        .filter_map(|relationship| {
            let source = ids.get(relationship.source.trim())?;
            let target = ids.get(relationship.target.trim())?;
            Some(ResolvedRelationship {
                source_entity_id: *source,
                target_entity_id: *target,
                relation_type: relationship.relation_type,
                description: relationship.description,
            })
        })
        .collect()
}

/// Extract entities and relationships from the first `char_limit` characters and persist them.
///
/// Entities replace the artifact's previous graph; relationships are kept only when both
/// endpoints match a persisted entity name exactly.
pub async fn extract_knowledge_graph(
    provider: &dyn ModelProvider,
    artifacts: &dyn ArtifactRepository,
    artifact_id: Uuid,
    title: &str,
    text: &str,
    char_limit: usize,
) -> Result<GraphSummary, IngestionError> {
    let prefix: String = text.chars().take(char_limit).collect();
    let options = CompletionOptions::with_system(GRAPH_SYSTEM_PROMPT)
        .json()
        .max_tokens(2000);
    let raw = provider
        .generate_completion(&graph_prompt(title, &prefix), &options)
        .await?;
    let extraction = parse_graph(&raw)?;

    let entities = dedupe_entities(extraction.entities);
    let ids = artifacts.replace_entities(artifact_id, &entities).await?;
    let relationships = resolve_relationships(extraction.relationships, &ids);
    artifacts
        .insert_relationships(artifact_id, &relationships)
        .await?;

    Ok(GraphSummary {
        entities: ids.len(),
        relationships: relationships.len(),
    })
}
