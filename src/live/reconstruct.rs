//! Live reconstruction
//!
//! Pure functions turning a conversation's message rows plus the chunk log
//! of its in-flight answer into the list a reader displays. Nothing is
//! cached between calls; readers recompute on every change.

use crate::storage::{Chunk, Message};

/// The trailing non-final assistant message, if any
pub fn in_flight_message(messages: &[Message]) -> Option<&Message> {
    messages.last().filter(|m| m.is_in_flight())
}

/// Builds the display list from messages and the in-flight chunk log
///
/// Every message is returned as-is except a trailing non-final assistant
/// message, whose text becomes the concatenation of its chunks in index
/// order. Chunks belonging to other messages are ignored.
///
/// # Examples
///
/// ```
/// use chrono::Utc;
/// use threadline::live::reconstruct;
/// use threadline::storage::{Chunk, Message, Sender};
///
/// let now = Utc::now();
/// let message = |id, sender, is_final, text: &str| Message {
///     id,
///     conversation_id: "c".into(),
///     sender,
///     is_final,
///     final_text: text.into(),
///     created_at: now,
///     updated_at: now,
/// };
/// let chunk = |index, content: &str| Chunk {
///     id: index,
///     message_id: 2,
///     chunk_index: index,
///     content: content.into(),
///     created_at: now,
/// };
///
/// let messages = vec![
///     message(1, Sender::User, true, "Hi"),
///     message(2, Sender::Assistant, false, ""),
/// ];
/// let display = reconstruct(&messages, &[chunk(0, "A"), chunk(1, "B")]);
/// assert_eq!(display[0].final_text, "Hi");
/// assert_eq!(display[1].final_text, "AB");
/// ```
pub fn reconstruct(messages: &[Message], chunks: &[Chunk]) -> Vec<Message> {
    let mut display = messages.to_vec();
    let Some(last) = display.last_mut().filter(|m| m.is_in_flight()) else {
        return display;
    };

    let mut own: Vec<&Chunk> = chunks.iter().filter(|c| c.message_id == last.id).collect();
    own.sort_by_key(|c| c.chunk_index);
    last.final_text = own.iter().map(|c| c.content.as_str()).collect();
    display
}
