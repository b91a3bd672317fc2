mod common;

use common::{Harness, ORG, SALES};
use rustykb::catalog::{ArtifactKind, ArtifactRepository, NewArtifact, ProcessingStatus};
use rustykb::index::ChunkIndex;
use rustykb::service::KnowledgeApi;
use uuid::Uuid;

fn long_document() -> String {
    (0..30)
        .map(|n| {
            format!(
                "Section {n} explains how travel requests for region {n} are approved, which \
                 receipts must be kept and how reimbursements are paid out each month."
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[tokio::test]
async fn reingesting_replaces_chunks_without_duplicates() {
    let harness = Harness::new();
    let id = harness.create(
        1,
        ORG,
        Some(SALES),
        ArtifactKind::Document,
        "Travel handbook",
        &long_document(),
    );

    let first = harness.service.ingest_now(id).await.expect("first run");
    let first_indexes = harness.index.chunk_indexes(id).await;
    assert!(first.chunk_count > 1);
    assert_eq!(first_indexes, (0..first.chunk_count).collect::<Vec<_>>());

    let second = harness.service.ingest_now(id).await.expect("second run");
    assert_eq!(second.chunk_count, first.chunk_count);
    assert_eq!(harness.index.chunk_indexes(id).await, first_indexes);
    assert_eq!(second.embedding_version, first.embedding_version + 1);

    let record = harness.catalog.artifact(id).await.expect("record");
    assert_eq!(record.status, ProcessingStatus::Completed);
    assert_eq!(record.embedding_model.as_deref(), Some("fake-embedding"));
    assert_eq!(record.error, None);
}

#[tokio::test]
async fn short_policy_becomes_a_single_chunk() {
    let harness = Harness::new();
    let id = harness
        .ingested(
            2,
            ORG,
            None,
            ArtifactKind::Document,
            "Remote work",
            "Employees may work remotely two days a week.\n\nRequests go through the team lead.",
        )
        .await;

    assert_eq!(harness.index.chunk_indexes(id).await, vec![0]);
    let status = harness.service.artifact_status(id).await.expect("status");
    assert!(status.processed);
    let last = status.progress_log.last().expect("log entry");
    assert_eq!(last.message, "Processing complete");
    assert_eq!(last.progress, 100);
    assert!(
        status
            .progress_log
            .windows(2)
            .all(|pair| pair[0].progress <= pair[1].progress)
    );
}

#[tokio::test]
async fn failures_are_recorded_and_a_retry_recovers() {
    let harness = Harness::new();
    let id = harness.create(
        3,
        ORG,
        None,
        ArtifactKind::Document,
        "Security policy",
        "Laptops must use full disk encryption at all times.",
    );
    harness.provider.fail_embeddings(true);

    let error = harness.service.ingest_now(id).await.expect_err("fails");
    let status = harness.service.artifact_status(id).await.expect("status");
    assert_eq!(status.status, ProcessingStatus::Failed);
    assert!(!status.processed);
    assert_eq!(status.error.as_deref(), Some(error.to_string().as_str()));
    assert!(
        status
            .progress_log
            .last()
            .is_some_and(|entry| entry.message.starts_with("Processing failed: "))
    );
    assert_eq!(harness.service.metrics_snapshot().ingestion_failures, 1);

    harness.provider.fail_embeddings(false);
    harness.service.ingest_now(id).await.expect("retry");
    let status = harness.service.artifact_status(id).await.expect("status");
    assert_eq!(status.status, ProcessingStatus::Completed);
    assert_eq!(status.error, None);
}

#[tokio::test]
async fn articles_get_a_knowledge_graph() {
    let harness = Harness::new();
    harness.provider.script_completions(&[r#"{
        "entities": [
            {"name": "Acme", "type": "organization", "description": "The company"},
            {"name": "Berlin", "type": "location", "description": "New office"}
        ],
        "relationships": [
            {"source": "Acme", "target": "Berlin", "type": "opened_office_in", "description": ""},
            {"source": "Acme", "target": "Paris", "type": "mentions", "description": ""}
        ]
    }"#]);
    let id = harness.create(
        4,
        ORG,
        None,
        ArtifactKind::Article,
        "Berlin office",
        "Acme opened a new office in Berlin this spring.",
    );

    let outcome = harness.service.ingest_now(id).await.expect("ingest");

    let graph = outcome.graph.expect("graph summary");
    assert_eq!((graph.entities, graph.relationships), (2, 1));
    let mut names = harness.catalog.entity_names(id).expect("entities");
    names.sort();
    assert_eq!(names, vec!["Acme".to_string(), "Berlin".to_string()]);
    assert_eq!(harness.catalog.relationship_count(id).expect("relationships"), 1);
}

#[tokio::test]
async fn unreadable_uploads_are_indexed_from_a_placeholder() {
    let harness = Harness::new();
    let id = Uuid::from_u128(5);
    harness
        .catalog
        .create_artifact(&NewArtifact {
            id,
            organization_id: ORG,
            division_id: None,
            kind: ArtifactKind::Document,
            title: "Office photo".into(),
            file_name: Some("office.png".into()),
            media_type: "image/png".into(),
            summary: None,
            content: vec![0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a],
        })
        .expect("artifact");

    let outcome = harness.service.ingest_now(id).await.expect("ingest");

    assert!(outcome.placeholder_text);
    assert_eq!(outcome.chunk_count, 1);
    assert_eq!(harness.index.count_chunks(id).await.expect("count"), 1);
}

#[tokio::test]
async fn triggering_an_unknown_artifact_is_rejected() {
    let harness = Harness::new();
    let error = harness
        .service
        .trigger_ingestion(Uuid::from_u128(999))
        .await
        .expect_err("unknown");
    assert!(error.to_string().contains("not found"));
}
