//! Chunk log
//!
//! Durable, ordered, append-only log of generated fragments per message.
//! A [`ChunkWriter`] is the single writer for one message; it assigns
//! indices from 0 and only advances after a successful insert, so the
//! persisted indices never have gaps.

use crate::error::Result;
use crate::generation::metrics::record_chunk_appended;
use crate::storage::{Chunk, MessageId, SqliteStorage};

/// Read and write access to the chunk log
#[derive(Debug, Clone)]
pub struct ChunkLog {
    storage: SqliteStorage,
}

impl ChunkLog {
    /// Creates a chunk log over `storage`
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }

    /// Starts the single writer for `message_id`
    pub fn writer(&self, message_id: MessageId) -> ChunkWriter {
        ChunkWriter {
            storage: self.storage.clone(),
            message_id,
            next_index: 0,
            text: String::new(),
        }
    }

    /// Chunks of a message in index order
    pub fn read(&self, message_id: MessageId) -> Result<Vec<Chunk>> {
        self.storage.list_chunks(message_id)
    }

    /// Text produced so far for a message
    pub fn text(&self, message_id: MessageId) -> Result<String> {
        Ok(concat_chunks(&self.read(message_id)?))
    }
}

/// Concatenates chunk contents in the order given
pub fn concat_chunks(chunks: &[Chunk]) -> String {
    chunks.iter().map(|chunk| chunk.content.as_str()).collect()
}

/// Appends fragments of one message in strict index order
#[derive(Debug)]
pub struct ChunkWriter {
    storage: SqliteStorage,
    message_id: MessageId,
    next_index: i64,
    text: String,
}

impl ChunkWriter {
    /// Persists `fragment` under the next index and accumulates it
    ///
    /// # Errors
    ///
    /// Returns the store error; the index is not consumed and the fragment is
    /// not added to the accumulated text.
    pub async fn append(&mut self, fragment: &str) -> Result<i64> {
        let index = self.next_index;
        let message_id = self.message_id;
        let content = fragment.to_string();
        self.storage
            .run_blocking(move |storage| storage.insert_chunk(message_id, index, &content))
            .await?;
        self.next_index += 1;
        self.text.push_str(fragment);
        record_chunk_appended();
        tracing::trace!(
            message_id = self.message_id,
            chunk_index = index,
            "Appended chunk"
        );
        Ok(index)
    }

    /// Message being written
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Number of chunks persisted so far
    pub fn len(&self) -> usize {
        self.next_index as usize
    }

    /// Whether nothing has been persisted yet
    pub fn is_empty(&self) -> bool {
        self.next_index == 0
    }

    /// Text accumulated from persisted fragments
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Consumes the writer, returning the accumulated text
    pub fn into_text(self) -> String {
        self.text
    }
}
