//! Conversation History Truncation
//!
//! Bounds the history forwarded to a backend with a small context window.
//!
//! The budget is a raw character count, not a token count. Characters are a
//! rough stand-in for tokens; the budget should be configured with headroom
//! for the model's real tokenizer.

use tracing::trace;

use crate::messages::Message;

/// Default character budget for non-system history
pub const DEFAULT_CONTEXT_CHARS: usize = 500;

/// Truncate `messages` so that non-system content fits in `budget_chars`.
///
/// Walks from the most recent message backwards. System messages are always
/// kept. Non-system messages are kept while the running total stays within
/// the budget; once one would overflow it, that message and every older
/// non-system message are dropped whole. Relative order is preserved.
#[must_use]
pub fn truncate_history(messages: &[Message], budget_chars: usize) -> Vec<Message> {
    let mut keep = vec![false; messages.len()];
    let mut total = 0usize;
    let mut exhausted = false;

    for (idx, msg) in messages.iter().enumerate().rev() {
        if msg.is_system() {
            keep[idx] = true;
            continue;
        }
        if exhausted {
            continue;
        }

        let len = msg.char_len();
        if total + len > budget_chars {
            exhausted = true;
            continue;
        }
        total += len;
        keep[idx] = true;
    }

    let kept: Vec<Message> = messages
        .iter()
        .zip(keep)
        .filter_map(|(msg, k)| k.then(|| msg.clone()))
        .collect();

    trace!(
        original = messages.len(),
        kept = kept.len(),
        chars = total,
        budget = budget_chars,
        "Truncated conversation history"
    );

    kept
}

/// First system message content, if any
#[must_use]
pub fn first_system_prompt(messages: &[Message]) -> Option<&str> {
    messages
        .iter()
        .find(|m| m.is_system())
        .map(|m| m.content.as_str())
}

/// Render the non-system messages as `"{role}: {content}"` lines
#[must_use]
pub fn build_query(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| !m.is_system())
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}
