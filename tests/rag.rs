mod common;

use common::{Harness, ORG, SALES, caller};
use rustykb::catalog::{ArtifactKind, Role};
use rustykb::index::ArtifactKinds;
use rustykb::rag::{ChatTurn, RagRequest, TurnRole};
use rustykb::service::{ErrorClass, KnowledgeApi};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn drain(rx: &mut mpsc::Receiver<String>) -> String {
    let mut answer = String::new();
    while let Ok(token) = rx.try_recv() {
        answer.push_str(&token);
    }
    answer
}

#[tokio::test]
async fn answers_without_sources_carry_no_citations() {
    let harness = Harness::new();
    let (tx, mut rx) = mpsc::channel(16);

    let citations = harness
        .service
        .rag_query(
            RagRequest {
                question: "What is our parental leave policy?".into(),
                history: Vec::new(),
                caller: caller(Role::Member, Some(SALES)),
                kinds: ArtifactKinds::All,
            },
            tx,
            CancellationToken::new(),
        )
        .await
        .expect("answer");

    assert!(citations.is_empty());
    assert_eq!(drain(&mut rx), "Sure, here you go.");
    let prompts = harness.provider.system_prompts();
    assert_eq!(prompts.len(), 1);
    assert!(!prompts[0].contains("Context:"));

    let usage = harness.catalog.usage_events(ORG).expect("usage");
    assert!(usage.iter().any(|event| event.operation == "rag_query"));
    assert_eq!(harness.service.metrics_snapshot().answers_streamed, 1);
}

#[tokio::test]
async fn grounded_answers_cite_their_sources() {
    let harness = Harness::new();
    let id = harness
        .ingested(
            0x201,
            ORG,
            Some(SALES),
            ArtifactKind::Document,
            "Commission plan",
            "Sales commission is paid quarterly at five percent of closed revenue.",
        )
        .await;
    let (tx, _rx) = mpsc::channel(16);

    let citations = harness
        .service
        .rag_query(
            RagRequest {
                question: "When is sales commission paid?".into(),
                history: vec![ChatTurn {
                    role: TurnRole::User,
                    content: "Hi there".into(),
                }],
                caller: caller(Role::Member, Some(SALES)),
                kinds: ArtifactKinds::All,
            },
            tx,
            CancellationToken::new(),
        )
        .await
        .expect("answer");

    assert_eq!(citations.len(), 1);
    let citation = &citations[0];
    assert_eq!(citation.artifact_id, id);
    assert_eq!(citation.title, "Commission plan");
    assert_eq!(citation.division_name.as_deref(), Some("Sales"));
    assert!(citation.excerpt.starts_with("Sales commission is paid quarterly"));
    assert!(harness.provider.system_prompts()[0].contains("Context:\n[1] Commission plan"));
}

#[tokio::test]
async fn single_scope_chat_stays_on_one_artifact() {
    let harness = Harness::new();
    let text = "Sales commission is paid quarterly at five percent of closed revenue.";
    let target = harness
        .ingested(0x301, ORG, None, ArtifactKind::Article, "Commission FAQ", text)
        .await;
    harness
        .ingested(0x302, ORG, None, ArtifactKind::Article, "Commission archive", text)
        .await;
    let (tx, mut rx) = mpsc::channel(16);

    let citations = harness
        .service
        .chat_single_scope(
            target,
            "How is sales commission paid?".into(),
            Vec::new(),
            tx,
            CancellationToken::new(),
        )
        .await
        .expect("chat");

    assert!(!citations.is_empty());
    assert!(citations.iter().all(|citation| citation.artifact_id == target));
    assert_eq!(drain(&mut rx), "Sure, here you go.");
    let prompt = harness.provider.system_prompts().pop().expect("prompt");
    assert!(prompt.contains("\"Commission FAQ\""));

    let usage = harness.catalog.usage_events(ORG).expect("usage");
    assert!(
        usage
            .iter()
            .any(|event| event.operation == "artifact_chat" && event.artifact_id == Some(target))
    );
}

#[tokio::test]
async fn chatting_with_a_missing_artifact_is_not_found() {
    let harness = Harness::new();
    let (tx, _rx) = mpsc::channel(16);

    let error = harness
        .service
        .chat_single_scope(
            Uuid::from_u128(0xDEAD),
            "Anything?".into(),
            Vec::new(),
            tx,
            CancellationToken::new(),
        )
        .await
        .expect_err("missing");

    assert_eq!(error.class(), ErrorClass::NotFound);
    assert!(harness.provider.system_prompts().is_empty());
}

#[tokio::test]
async fn blank_questions_are_rejected() {
    let harness = Harness::new();
    let (tx, _rx) = mpsc::channel(16);

    let error = harness
        .service
        .rag_query(
            RagRequest {
                question: "   ".into(),
                history: Vec::new(),
                caller: caller(Role::Admin, None),
                kinds: ArtifactKinds::All,
            },
            tx,
            CancellationToken::new(),
        )
        .await
        .expect_err("blank");

    assert_eq!(error.class(), ErrorClass::BadRequest);
}
