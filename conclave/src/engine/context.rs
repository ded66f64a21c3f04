//! Token estimation and context compaction.
//!
//! Estimation is the deliberate `len/4` heuristic — loose, but monotonic,
//! which is all compaction needs. When the estimate reaches 80% of the
//! model's context limit, everything but the 10 most recent messages is
//! summarized by one blocking LLM call and replaced with a single synthetic
//! user message; a `system` row records the compaction in history.

use std::sync::Arc;

use chrono::Utc;
use sse_event::StreamEvent;
use tracing::warn;

use crate::engine::prompts::SUMMARIZATION_PROMPT;
use crate::entity::{new_id, MessageMetadata, StoredMessage};
use crate::message::{ChatMessage, MessageContent, Role};
use crate::provider::ChatProvider;
use crate::store::SqliteStore;

/// Compaction triggers at this fraction of the context limit.
pub const COMPACTION_THRESHOLD: f64 = 0.80;
/// Messages kept verbatim during compaction.
pub const COMPACTION_KEEP_RECENT: usize = 10;
/// Per-message cap in the summarization transcript.
const SUMMARY_INPUT_CHAR_CAP: usize = 2000;
/// Preview length in the `context_compacted` event.
const SUMMARY_PREVIEW_CHARS: usize = 120;

/// Rough token estimate: `chars / 4` per text part.
pub fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|m| match &m.content {
            MessageContent::Text(s) => s.len() / 4,
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    crate::message::ContentPart::Text { text } => text.len() / 4,
                    crate::message::ContentPart::ImageUrl { .. } => 0,
                })
                .sum(),
        })
        .sum()
}

/// Context limit by model family; conservative 100k fallback.
pub fn context_limit(model_id: &str) -> usize {
    let lower = model_id.to_lowercase();
    for (family, limit) in [
        ("claude-opus", 200_000),
        ("claude-sonnet", 200_000),
        ("claude-haiku", 200_000),
        ("gpt-4", 128_000),
        ("gpt-3.5", 16_385),
    ] {
        if lower.contains(family) {
            return limit;
        }
    }
    100_000
}

/// Compacts `messages` in place when the estimate is at or past the
/// threshold. Returns the `context_compacted` event when compaction ran.
///
/// Idempotent below threshold: a history already under budget is untouched.
/// A failed summarization call logs and leaves the history alone.
pub async fn compact_if_needed(
    messages: &mut Vec<ChatMessage>,
    provider: &Arc<dyn ChatProvider>,
    store: &Arc<SqliteStore>,
    session_id: &str,
) -> Option<StreamEvent> {
    if messages.len() <= COMPACTION_KEEP_RECENT + 2 {
        return None;
    }
    let estimated = estimate_tokens(messages);
    let limit = context_limit(provider.model_id());
    if (estimated as f64) < limit as f64 * COMPACTION_THRESHOLD {
        return None;
    }

    let split = messages.len() - COMPACTION_KEEP_RECENT;
    let older = &messages[..split];
    let summarized_count = older.len();

    let history_text: Vec<String> = older
        .iter()
        .map(|m| {
            let text: String = m.text().chars().take(SUMMARY_INPUT_CHAR_CAP).collect();
            format!("{}: {}", m.role.as_str().to_uppercase(), text)
        })
        .collect();
    let request = format!(
        "Please summarize this conversation history:\n\n{}",
        history_text.join("\n\n")
    );

    let summary_text = match provider
        .chat(&[ChatMessage::user(request)], Some(SUMMARIZATION_PROMPT), &[])
        .await
    {
        Ok(response) if !response.content.is_empty() => response.content,
        Ok(_) => "(no summary)".to_string(),
        Err(e) => {
            warn!(session = session_id, error = %e, "context compaction summarization failed");
            return None;
        }
    };

    // History keeps a marker so clients can see when compaction happened.
    let record = StoredMessage {
        id: new_id(),
        session_id: session_id.to_string(),
        role: Role::System,
        content: MessageContent::Text(format!(
            "[Context compacted — {} messages summarized]\n\n{}",
            summarized_count, summary_text
        )),
        agent_id: None,
        reasoning: None,
        metadata: MessageMetadata {
            compaction: Some(true),
            messages_summarized: Some(summarized_count),
            ..Default::default()
        },
        attachment_ids: None,
        rating: None,
        created_at: Utc::now(),
    };
    if let Err(e) = store.insert_message(&record).await {
        warn!(session = session_id, error = %e, "failed to save compaction record");
    }

    let recent = messages.split_off(split);
    messages.clear();
    messages.push(ChatMessage::user(format!(
        "[Summary of earlier conversation]\n{}",
        summary_text
    )));
    messages.extend(recent);

    Some(StreamEvent::ContextCompacted {
        messages_summarized: summarized_count,
        summary_preview: summary_text.chars().take(SUMMARY_PREVIEW_CHARS).collect(),
    })
}
