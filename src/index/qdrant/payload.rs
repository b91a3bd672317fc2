//! Conversion between chunk records and Qdrant points.

use crate::catalog::ArtifactKind;
use crate::catalog::types::rfc3339_now;
use crate::index::{ChunkHit, ChunkRecord, IndexError};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Deterministic point id for a chunk generation, so retried upserts overwrite instead of
/// duplicating.
pub fn chunk_point_id(artifact_id: Uuid, embedding_version: i64, chunk_index: usize) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(artifact_id.as_bytes());
    hasher.update(embedding_version.to_be_bytes());
    hasher.update((chunk_index as u64).to_be_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

/// Build the point body stored for a chunk. New points are not yet `processed`.
pub(crate) fn chunk_point(record: &ChunkRecord) -> Value {
    json!({
        "id": chunk_point_id(record.artifact_id, record.embedding_version, record.chunk_index),
        "vector": record.embedding,
        "payload": {
            "artifact_id": record.artifact_id,
            "artifact_kind": record.artifact_kind.as_str(),
            "organization_id": record.organization_id,
            "division_id": record.division_id,
            "title": record.title,
            "file_name": record.file_name,
            "summary": record.summary,
            "chunk_index": record.chunk_index,
            "content": record.content,
            "token_count": record.token_count,
            "page_start": record.page_start,
            "page_end": record.page_end,
            "embedding_version": record.embedding_version,
            "processed": false,
            "indexed_at": rfc3339_now(),
        }
    })
}

/// Decode a stored payload into a search hit.
pub(crate) fn hit_from_payload(
    payload: &Map<String, Value>,
    score: f32,
) -> Result<ChunkHit, IndexError> {
    Ok(ChunkHit {
        artifact_id: uuid_field(payload, "artifact_id")?,
        artifact_kind: str_field(payload, "artifact_kind")?
            .parse::<ArtifactKind>()
            .map_err(IndexError::Malformed)?,
        division_id: optional_str(payload, "division_id")
            .map(|value| parse_uuid("division_id", value))
            .transpose()?,
        title: str_field(payload, "title")?.to_string(),
        file_name: optional_str(payload, "file_name").map(str::to_string),
        summary: optional_str(payload, "summary").map(str::to_string),
        chunk_index: u64_field(payload, "chunk_index")? as usize,
        content: str_field(payload, "content")?.to_string(),
        page_start: u64_field(payload, "page_start")? as u32,
        page_end: u64_field(payload, "page_end")? as u32,
        score,
    })
}

fn str_field<'a>(payload: &'a Map<String, Value>, key: &str) -> Result<&'a str, IndexError> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| IndexError::Malformed(format!("missing string field `{key}`")))
}

fn optional_str<'a>(payload: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    payload.get(key).and_then(Value::as_str)
}

fn u64_field(payload: &Map<String, Value>, key: &str) -> Result<u64, IndexError> {
    payload
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| IndexError::Malformed(format!("missing integer field `{key}`")))
}

fn uuid_field(payload: &Map<String, Value>, key: &str) -> Result<Uuid, IndexError> {
    parse_uuid(key, str_field(payload, key)?)
}

fn parse_uuid(key: &str, value: &str) -> Result<Uuid, IndexError> {
    Uuid::parse_str(value).map_err(|err| IndexError::Malformed(format!("`{key}`: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ChunkRecord {
        ChunkRecord {
            artifact_id: Uuid::from_u128(5),
            artifact_kind: ArtifactKind::Article,
            organization_id: Uuid::from_u128(1),
            division_id: None,
            title: "Release notes".into(),
            file_name: None,
            summary: Some("What changed".into()),
            chunk_index: 2,
            content: "The exporter now streams rows.".into(),
            token_count: 9,
            page_start: 1,
            page_end: 1,
            embedding_version: 3,
            embedding: vec![0.5, 0.5],
        }
    }

    #[test]
    fn point_ids_are_stable_per_generation() {
        let a = chunk_point_id(Uuid::from_u128(5), 3, 2);
        assert_eq!(a, chunk_point_id(Uuid::from_u128(5), 3, 2));
        assert_ne!(a, chunk_point_id(Uuid::from_u128(5), 4, 2));
        assert_ne!(a, chunk_point_id(Uuid::from_u128(5), 3, 1));
    }

    #[test]
    fn stored_payload_decodes_back_into_a_hit() {
        let point = chunk_point(&record());
        assert_eq!(point["payload"]["processed"], json!(false));
        assert_eq!(point["payload"]["division_id"], Value::Null);

        let payload = point["payload"].as_object().expect("payload");
        let hit = hit_from_payload(payload, 0.8).expect("hit");
        assert_eq!(hit.artifact_kind, ArtifactKind::Article);
        assert_eq!(hit.chunk_index, 2);
        assert_eq!(hit.division_id, None);
        assert_eq!(hit.summary.as_deref(), Some("What changed"));
    }

    #[test]
    fn missing_fields_are_reported() {
        let mut payload = Map::new();
        payload.insert("artifact_id".into(), json!("not-a-uuid"));
        assert!(matches!(
            hit_from_payload(&payload, 0.1),
            Err(IndexError::Malformed(_))
        ));
    }
}
