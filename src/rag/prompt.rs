//! Prompt assembly for grounded answers.

use super::{ChatTurn, TurnRole};
use crate::index::ChunkHit;

/// Conversation turns carried into the prompt, counted from the end.
pub const HISTORY_TURNS: usize = 6;

const WITH_CONTEXT: &str = "You are the knowledge assistant of this organization. Answer the \
question using the numbered context passages below. Cite the passages you rely on with their \
number in square brackets, like [1]. If the passages do not cover the question, say so briefly \
and answer from general knowledge, making clear which part is not from the organization's \
material. Greetings and small talk need no citations; reply to them naturally.";

const WITHOUT_CONTEXT: &str = "You are the knowledge assistant of this organization. Answer \
helpfully and concisely from general knowledge. Respond naturally to greetings and small talk. \
Do not mention documents, articles or search results, and never claim that something was not \
found in them.";

/// Number each hit as `[i] Title (page N)` followed by its text.
pub fn build_context(hits: &[ChunkHit]) -> String {
    hits.iter()
        .enumerate()
        .map(|(position, hit)| {
            format!(
                "[{}] {} ({})\n{}",
                position + 1,
                hit.title,
                hit.locator(),
                hit.content.trim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// System prompt for organization-wide answers.
pub fn rag_system_prompt(context: &str) -> String {
    if context.trim().is_empty() {
        WITHOUT_CONTEXT.to_string()
    } else {
        format!("{WITH_CONTEXT}\n\nContext:\n{context}")
    }
}

/// System prompt confining the conversation to one artifact.
pub fn single_scope_system_prompt(title: &str, context: &str) -> String {
    let rules = format!(
        "You answer questions about the article \"{title}\" and nothing else. Use only the \
         passages below. If the question is about anything the passages do not cover, reply that \
         the topic is not discussed in this article and do not answer it from general knowledge."
    );
    if context.trim().is_empty() {
        format!("{rules}\n\nNo passages of this article matched the question.")
    } else {
        format!("{rules}\n\nPassages:\n{context}")
    }
}

/// Flatten the last `max_turns` history turns and the question into one prompt.
pub fn compose_prompt(history: &[ChatTurn], question: &str, max_turns: usize) -> String {
    let skip = history.len().saturating_sub(max_turns);
    let mut lines: Vec<String> = history[skip..]
        .iter()
        .filter(|turn| !turn.content.trim().is_empty())
        .map(|turn| {
            let speaker = match turn.role {
                TurnRole::User => "User",
                TurnRole::Assistant => "Assistant",
            };
            format!("{speaker}: {}", turn.content.trim())
        })
        .collect();
    if lines.is_empty() {
        return question.trim().to_string();
    }
    lines.push(format!("User: {}", question.trim()));
    lines.join("\n\n")
}
