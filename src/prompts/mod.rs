//! Prompt construction for generations
//!
//! Turns a conversation's finalized history into the prompt handed to a
//! provider, and builds the best-effort title request.

pub mod title;

pub use title::{clean_title, title_prompt};

use crate::providers::Prompt;
use crate::storage::types::{Message, Sender};

/// System instructions used when the configuration does not override them
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. \
Answer clearly and concisely, and say so when you are unsure.";

/// Formats finalized messages as a `User:` / `Assistant:` transcript
///
/// Non-final messages are skipped: their text is not known yet.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use threadline::prompts::format_transcript;
/// use threadline::storage::types::{Message, Sender};
///
/// let message = Message {
///     id: 1,
///     conversation_id: "c".into(),
///     sender: Sender::User,
///     is_final: true,
///     final_text: "Hi".into(),
///     created_at: Utc::now(),
///     updated_at: Utc::now(),
/// };
/// assert_eq!(format_transcript(&[message]), "User: Hi");
/// ```
pub fn format_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| m.is_final)
        .map(|m| {
            let role = match m.sender {
                Sender::User => "User",
                Sender::Assistant => "Assistant",
            };
            format!("{}: {}", role, m.final_text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Builds the prompt for the next assistant turn
///
/// The transcript ends with an open `Assistant:` line for the provider to
/// complete.
pub fn build_generation_prompt(system_prompt: &str, history: &[Message]) -> Prompt {
    let transcript = format_transcript(history);
    let text = if transcript.is_empty() {
        "Assistant:".to_string()
    } else {
        format!("{}\nAssistant:", transcript)
    };
    Prompt::new(text).with_system(system_prompt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(id: i64, sender: Sender, text: &str, is_final: bool) -> Message {
        Message {
            id,
            conversation_id: "c".into(),
            sender,
            is_final,
            final_text: text.into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_transcript_orders_roles() {
        let history = vec![
            message(1, Sender::User, "Hi", true),
            message(2, Sender::Assistant, "Hello!", true),
            message(3, Sender::User, "How are you?", true),
        ];
        assert_eq!(
            format_transcript(&history),
            "User: Hi\nAssistant: Hello!\nUser: How are you?"
        );
    }

    #[test]
    fn test_transcript_skips_non_final() {
        let history = vec![
            message(1, Sender::User, "Hi", true),
            message(2, Sender::Assistant, "", false),
        ];
        assert_eq!(format_transcript(&history), "User: Hi");
    }

    #[test]
    fn test_generation_prompt_ends_with_open_turn() {
        let history = vec![message(1, Sender::User, "Hi", true)];
        let prompt = build_generation_prompt(DEFAULT_SYSTEM_PROMPT, &history);
        assert_eq!(prompt.text, "User: Hi\nAssistant:");
        assert_eq!(prompt.system.as_deref(), Some(DEFAULT_SYSTEM_PROMPT));
    }

    #[test]
    fn test_generation_prompt_without_system() {
        let prompt = build_generation_prompt("", &[]);
        assert_eq!(prompt.text, "Assistant:");
        assert!(prompt.system.is_none());
    }
}
