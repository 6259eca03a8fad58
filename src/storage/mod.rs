use crate::access::AccessPolicy;
use crate::error::{persistence, Result, ThreadlineError};
use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use directories::ProjectDirs;
use rusqlite::{
    params, Connection, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::broadcast;

pub mod changes;
pub mod types;

pub use changes::{ChangeFeed, StoreChange};
pub use types::{
    AccessLevel, Chunk, Conversation, ConversationId, FinalizeOutcome, Message, MessageId, Sender,
    Turn,
};

/// Title given to a conversation until one is generated
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Chat";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    access_level TEXT NOT NULL DEFAULT 'private',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    sender TEXT NOT NULL,
    is_final INTEGER NOT NULL,
    final_text TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, created_at);
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_one_in_flight
    ON messages(conversation_id) WHERE is_final = 0;
CREATE TABLE IF NOT EXISTS message_chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(message_id, chunk_index)
);
";

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender, is_final, final_text, created_at, updated_at";

const CONVERSATION_COLUMNS: &str = "id, user_id, title, access_level, created_at, updated_at";

/// SQLite store for conversations, messages and the transient chunk log
///
/// Each operation opens its own connection, so the store is cheap to clone
/// and safe to share between concurrent generations. Committed mutations are
/// announced on the [`ChangeFeed`].
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    db_path: PathBuf,
    changes: ChangeFeed,
}

impl SqliteStorage {
    /// Create a storage instance in the platform data directory
    pub fn new() -> Result<Self> {
        Self::new_with_path(Self::default_path()?)
    }

    /// Default database location (`<data dir>/threadline.db`)
    pub fn default_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("dev", "threadline", "threadline").ok_or_else(|| {
            ThreadlineError::Persistence("Could not determine data directory".into())
        })?;
        Ok(proj_dirs.data_dir().join("threadline.db"))
    }

    /// Create a storage instance that uses the specified database path
    ///
    /// # Examples
    ///
    /// ```
    /// use threadline::storage::SqliteStorage;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let storage = SqliteStorage::new_with_path(dir.path().join("chat.db")).unwrap();
    /// assert!(storage.db_path().ends_with("chat.db"));
    /// ```
    pub fn new_with_path<P: Into<PathBuf>>(db_path: P) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .context("Failed to create parent directory for database")
                    .map_err(|e| ThreadlineError::Persistence(e.to_string()))?;
            }
        }

        let storage = Self {
            db_path,
            changes: ChangeFeed::new(),
        };
        storage.init()?;
        Ok(storage)
    }

    /// Path of the backing database file
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// The change feed this store publishes to
    pub fn changes(&self) -> &ChangeFeed {
        &self.changes
    }

    /// Subscribe to changes committed from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Runs `op` against this store on the blocking thread pool
    ///
    /// Async callers reach SQLite through here rather than calling the
    /// synchronous methods on a runtime worker.
    ///
    /// # Errors
    ///
    /// Returns the error from `op`, or `Persistence` if the blocking task
    /// panicked or was cancelled.
    pub async fn run_blocking<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&SqliteStorage) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.clone();
        tokio::task::spawn_blocking(move || op(&storage))
            .await
            .map_err(|e| ThreadlineError::Persistence(format!("Store task failed: {}", e)))?
    }

    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path).map_err(persistence("Failed to open database"))?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(persistence("Failed to set busy timeout"))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(persistence("Failed to enable foreign keys"))?;
        Ok(conn)
    }

    fn init(&self) -> Result<()> {
        let conn = self.open()?;
        let _mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(persistence("Failed to enable WAL"))?;
        conn.execute_batch(SCHEMA)
            .map_err(persistence("Failed to create tables"))?;
        Ok(())
    }

    /// Record a user turn
    ///
    /// In one transaction: creates the conversation when `conversation_id` is
    /// `None`, otherwise checks that it exists, that `user_id` may write to it
    /// and that no assistant message is still in flight; then inserts the
    /// final user message.
    pub fn begin_turn(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        text: &str,
        policy: &dyn AccessPolicy,
    ) -> Result<(Conversation, Message)> {
        let mut conn = self.open()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(persistence("Failed to start transaction"))?;
        let (conversation, message, created) =
            record_user_message(&tx, user_id, conversation_id, text, policy)?;
        tx.commit()
            .map_err(persistence("Failed to commit transaction"))?;

        self.publish_turn(&conversation, created);
        tracing::debug!(
            conversation_id = %conversation.id,
            message_id = message.id,
            created,
            "Recorded user message"
        );
        Ok((conversation, message))
    }

    /// Record a user turn together with the placeholder answering it
    ///
    /// Same checks as [`SqliteStorage::begin_turn`], but the non-final
    /// assistant message is inserted in the same transaction. A turn rejected
    /// with `GenerationInProgress` leaves nothing behind.
    pub fn begin_answered_turn(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
        text: &str,
        policy: &dyn AccessPolicy,
    ) -> Result<Turn> {
        let mut conn = self.open()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(persistence("Failed to start transaction"))?;
        let (conversation, user_message, created) =
            record_user_message(&tx, user_id, conversation_id, text, policy)?;
        let placeholder = insert_placeholder(&tx, &conversation.id)?;
        tx.commit()
            .map_err(persistence("Failed to commit transaction"))?;

        self.publish_turn(&conversation, created);
        tracing::debug!(
            conversation_id = %conversation.id,
            user_message_id = user_message.id,
            message_id = placeholder.id,
            created,
            "Recorded user message and placeholder"
        );
        Ok(Turn {
            conversation,
            user_message,
            placeholder,
        })
    }

    fn publish_turn(&self, conversation: &Conversation, created: bool) {
        if created {
            self.changes.publish(StoreChange::Conversation {
                conversation_id: conversation.id.clone(),
            });
        }
        self.changes.publish(StoreChange::Messages {
            conversation_id: conversation.id.clone(),
        });
    }

    /// Load a conversation by id
    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.open()?;
        query_conversation(&conn, id)
    }

    /// Load a message by id
    pub fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        let conn = self.open()?;
        let sql = format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLUMNS);
        let message = conn
            .query_row(&sql, params![id], message_from_row)
            .optional()
            .map_err(persistence("Failed to query message"))?;
        Ok(message)
    }

    /// Load a message together with its parent conversation
    pub fn get_message_with_conversation(
        &self,
        id: MessageId,
    ) -> Result<Option<(Message, Conversation)>> {
        let Some(message) = self.get_message(id)? else {
            return Ok(None);
        };
        let conversation = self
            .get_conversation(&message.conversation_id)?
            .ok_or_else(|| {
                ThreadlineError::NotFound(format!("conversation {}", message.conversation_id))
            })?;
        Ok(Some((message, conversation)))
    }

    /// Messages of a conversation ordered by creation
    pub fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conn = self.open()?;
        query_messages(&conn, conversation_id)
    }

    /// Messages of a conversation plus the chunk log of its in-flight tail
    ///
    /// Both reads share one transaction, so the chunks always belong to the
    /// message list returned. The chunk list is empty when the last message
    /// is final.
    pub fn read_conversation_tail(
        &self,
        conversation_id: &str,
    ) -> Result<(Vec<Message>, Vec<Chunk>)> {
        let mut conn = self.open()?;
        let tx = conn
            .transaction()
            .map_err(persistence("Failed to start transaction"))?;
        let messages = query_messages(&tx, conversation_id)?;
        let chunks = match messages.last().filter(|m| m.is_in_flight()) {
            Some(tail) => query_chunks(&tx, tail.id)?,
            None => Vec::new(),
        };
        tx.commit()
            .map_err(persistence("Failed to commit transaction"))?;
        Ok((messages, chunks))
    }

    /// Insert the non-final assistant message a generation writes into
    ///
    /// Fails with `GenerationInProgress` when the conversation already has an
    /// in-flight message.
    pub fn insert_assistant_placeholder(&self, conversation_id: &str) -> Result<Message> {
        let mut conn = self.open()?;
        let tx = conn
            .transaction()
            .map_err(persistence("Failed to start transaction"))?;
        let message = insert_placeholder(&tx, conversation_id)?;
        tx.commit()
            .map_err(persistence("Failed to commit transaction"))?;

        self.changes.publish(StoreChange::Messages {
            conversation_id: conversation_id.to_string(),
        });
        Ok(message)
    }

    /// Append one chunk to a non-final message's log
    ///
    /// The insert only happens while the message is non-final; appending to a
    /// finalized message fails with `MessageFinalized`.
    pub fn insert_chunk(&self, message_id: MessageId, chunk_index: i64, content: &str) -> Result<()> {
        let conn = self.open()?;
        let inserted = conn
            .execute(
                "INSERT INTO message_chunks (message_id, chunk_index, content, created_at)
                SELECT ?1, ?2, ?3, ?4
                WHERE EXISTS (SELECT 1 FROM messages WHERE id = ?1 AND is_final = 0)",
                params![message_id, chunk_index, content, timestamp(Utc::now())],
            )
            .map_err(persistence("Failed to insert chunk"))?;

        if inserted == 0 {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM messages WHERE id = ?",
                    params![message_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(persistence("Failed to query message"))?;
            return Err(match exists {
                Some(_) => ThreadlineError::MessageFinalized(message_id),
                None => ThreadlineError::NotFound(format!("message {}", message_id)),
            }
            .into());
        }

        self.changes.publish(StoreChange::Chunks { message_id });
        Ok(())
    }

    /// Chunks of a message ordered by index
    pub fn list_chunks(&self, message_id: MessageId) -> Result<Vec<Chunk>> {
        let conn = self.open()?;
        query_chunks(&conn, message_id)
    }

    /// Collapse a message's chunk log into its final text
    ///
    /// Runs as one IMMEDIATE transaction: the conditional update on
    /// `is_final = 0` decides which of several racing finalizers wins, the
    /// others observe [`FinalizeOutcome::AlreadyFinal`]. `known_text` takes
    /// precedence over the chunk log when supplied.
    pub fn finalize_message(
        &self,
        message_id: MessageId,
        known_text: Option<&str>,
    ) -> Result<FinalizeOutcome> {
        let mut conn = self.open()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(persistence("Failed to start transaction"))?;

        let row: Option<(String, bool)> = tx
            .query_row(
                "SELECT conversation_id, is_final FROM messages WHERE id = ?",
                params![message_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(persistence("Failed to query message"))?;
        let Some((conversation_id, is_final)) = row else {
            return Err(ThreadlineError::NotFound(format!("message {}", message_id)).into());
        };

        if is_final {
            let stale = delete_chunks(&tx, message_id)?;
            tx.commit()
                .map_err(persistence("Failed to commit transaction"))?;
            if stale > 0 {
                self.changes.publish(StoreChange::Chunks { message_id });
            }
            return Ok(FinalizeOutcome::AlreadyFinal);
        }

        let text = match known_text {
            Some(text) => text.to_string(),
            None => query_chunks(&tx, message_id)?
                .into_iter()
                .map(|chunk| chunk.content)
                .collect(),
        };

        let now = timestamp(Utc::now());
        let updated = tx
            .execute(
                "UPDATE messages SET is_final = 1, final_text = ?, updated_at = ?
                WHERE id = ? AND is_final = 0",
                params![text, now, message_id],
            )
            .map_err(persistence("Failed to finalize message"))?;
        if updated == 0 {
            return Ok(FinalizeOutcome::AlreadyFinal);
        }

        tx.execute(
            "UPDATE conversations SET updated_at = ? WHERE id = ?",
            params![now, conversation_id],
        )
        .map_err(persistence("Failed to touch conversation"))?;

        let chunks_deleted = delete_chunks(&tx, message_id)?;

        tx.commit()
            .map_err(persistence("Failed to commit transaction"))?;

        self.changes.publish(StoreChange::Messages {
            conversation_id: conversation_id.clone(),
        });
        self.changes.publish(StoreChange::Chunks { message_id });
        self.changes
            .publish(StoreChange::Conversation { conversation_id });

        Ok(FinalizeOutcome::Finalized {
            text,
            chunks_deleted,
        })
    }

    /// Replace a conversation's title
    pub fn update_conversation_title(&self, conversation_id: &str, title: &str) -> Result<()> {
        self.update_conversation_column(conversation_id, "title", title)
    }

    /// Change who besides the owner may access a conversation
    pub fn set_access_level(&self, conversation_id: &str, level: AccessLevel) -> Result<()> {
        self.update_conversation_column(conversation_id, "access_level", level.as_str())
    }

    fn update_conversation_column(
        &self,
        conversation_id: &str,
        column: &'static str,
        value: &str,
    ) -> Result<()> {
        let conn = self.open()?;
        let sql = format!(
            "UPDATE conversations SET {} = ?, updated_at = ? WHERE id = ?",
            column
        );
        let updated = conn
            .execute(&sql, params![value, timestamp(Utc::now()), conversation_id])
            .map_err(persistence("Failed to update conversation"))?;
        if updated == 0 {
            return Err(
                ThreadlineError::NotFound(format!("conversation {}", conversation_id)).into(),
            );
        }
        self.changes.publish(StoreChange::Conversation {
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    /// All non-final messages across conversations, oldest first
    pub fn list_non_final_messages(&self) -> Result<Vec<Message>> {
        let conn = self.open()?;
        let sql = format!(
            "SELECT {} FROM messages WHERE is_final = 0 ORDER BY created_at, id",
            MESSAGE_COLUMNS
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(persistence("Failed to prepare statement"))?;
        let messages = stmt
            .query_map([], message_from_row)
            .map_err(persistence("Failed to query non-final messages"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(persistence("Failed to read message row"))?;
        Ok(messages)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn conversion_error(column: usize, err: ThreadlineError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let sender: String = row.get(2)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender: sender.parse().map_err(|e| conversion_error(2, e))?,
        is_final: row.get(3)?,
        final_text: row.get(4)?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    let access_level: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(Conversation {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        access_level: access_level.parse().map_err(|e| conversion_error(3, e))?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn query_conversation(conn: &Connection, id: &str) -> Result<Option<Conversation>> {
    let sql = format!(
        "SELECT {} FROM conversations WHERE id = ?",
        CONVERSATION_COLUMNS
    );
    let conversation = conn
        .query_row(&sql, params![id], conversation_from_row)
        .optional()
        .map_err(persistence("Failed to query conversation"))?;
    Ok(conversation)
}

fn query_messages(conn: &Connection, conversation_id: &str) -> Result<Vec<Message>> {
    let sql = format!(
        "SELECT {} FROM messages WHERE conversation_id = ? ORDER BY created_at, id",
        MESSAGE_COLUMNS
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(persistence("Failed to prepare statement"))?;
    let messages = stmt
        .query_map(params![conversation_id], message_from_row)
        .map_err(persistence("Failed to query messages"))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(persistence("Failed to read message row"))?;
    Ok(messages)
}

fn query_chunks(conn: &Connection, message_id: MessageId) -> Result<Vec<Chunk>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, message_id, chunk_index, content, created_at
            FROM message_chunks WHERE message_id = ? ORDER BY chunk_index",
        )
        .map_err(persistence("Failed to prepare statement"))?;
    let chunks = stmt
        .query_map(params![message_id], |row| {
            let created_at: String = row.get(4)?;
            Ok(Chunk {
                id: row.get(0)?,
                message_id: row.get(1)?,
                chunk_index: row.get(2)?,
                content: row.get(3)?,
                created_at: parse_timestamp(&created_at),
            })
        })
        .map_err(persistence("Failed to query chunks"))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(persistence("Failed to read chunk row"))?;
    Ok(chunks)
}

fn insert_conversation(tx: &Transaction<'_>, conversation: &Conversation) -> Result<()> {
    tx.execute(
        "INSERT INTO conversations (id, user_id, title, access_level, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)",
        params![
            conversation.id,
            conversation.user_id,
            conversation.title,
            conversation.access_level.as_str(),
            timestamp(conversation.created_at),
            timestamp(conversation.updated_at),
        ],
    )
    .map_err(persistence("Failed to insert conversation"))?;
    Ok(())
}

fn record_user_message(
    tx: &Transaction<'_>,
    user_id: &str,
    conversation_id: Option<&str>,
    text: &str,
    policy: &dyn AccessPolicy,
) -> Result<(Conversation, Message, bool)> {
    let now = Utc::now();
    let (conversation, created) = match conversation_id {
        None => {
            let conversation = Conversation {
                id: ulid::Ulid::new().to_string(),
                user_id: user_id.to_string(),
                title: DEFAULT_CONVERSATION_TITLE.to_string(),
                access_level: AccessLevel::Private,
                created_at: now,
                updated_at: now,
            };
            insert_conversation(tx, &conversation)?;
            (conversation, true)
        }
        Some(id) => {
            let conversation = query_conversation(tx, id)?
                .ok_or_else(|| ThreadlineError::NotFound(format!("conversation {}", id)))?;
            if !policy.can_write(&conversation, user_id) {
                return Err(ThreadlineError::PermissionDenied(format!(
                    "user {} may not write to conversation {}",
                    user_id, id
                ))
                .into());
            }
            let in_flight: Option<i64> = tx
                .query_row(
                    "SELECT id FROM messages WHERE conversation_id = ? AND is_final = 0",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(persistence("Failed to check in-flight message"))?;
            if let Some(message_id) = in_flight {
                return Err(ThreadlineError::GenerationInProgress(format!(
                    "message {} in conversation {} is still generating",
                    message_id, id
                ))
                .into());
            }
            (conversation, false)
        }
    };

    let message = insert_message(tx, &conversation.id, Sender::User, true, text, now)?;
    Ok((conversation, message, created))
}

fn insert_placeholder(tx: &Transaction<'_>, conversation_id: &str) -> Result<Message> {
    match insert_message(
        tx,
        conversation_id,
        Sender::Assistant,
        false,
        "",
        Utc::now(),
    ) {
        Err(e) if is_constraint_violation(&e) => Err(ThreadlineError::GenerationInProgress(
            format!("conversation {} already has a message in flight", conversation_id),
        )
        .into()),
        other => other,
    }
}

fn insert_message(
    tx: &Transaction<'_>,
    conversation_id: &str,
    sender: Sender,
    is_final: bool,
    text: &str,
    at: DateTime<Utc>,
) -> Result<Message> {
    let ts = timestamp(at);
    tx.execute(
        "INSERT INTO messages (conversation_id, sender, is_final, final_text, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)",
        params![conversation_id, sender.as_str(), is_final, text, ts, ts],
    )
    .map_err(|e| anyhow::Error::new(e).context("Failed to insert message"))?;
    Ok(Message {
        id: tx.last_insert_rowid(),
        conversation_id: conversation_id.to_string(),
        sender,
        is_final,
        final_text: text.to_string(),
        created_at: at,
        updated_at: at,
    })
}

fn delete_chunks(tx: &Transaction<'_>, message_id: MessageId) -> Result<usize> {
    let deleted = tx
        .execute(
            "DELETE FROM message_chunks WHERE message_id = ?",
            params![message_id],
        )
        .map_err(persistence("Failed to delete chunks"))?;
    Ok(deleted)
}

fn is_constraint_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<rusqlite::Error>(),
            Some(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation
        )
    })
}
