//! Generation orchestrator
//!
//! Drives one assistant answer end to end. The caller gets the message id as
//! soon as the placeholder row exists and the cancellation token is
//! registered; fragments are pulled, persisted and finalized on a spawned
//! task whose [`GenerationOutcome`] can be awaited or ignored.

use crate::access::AccessPolicy;
use crate::config::GenerationConfig;
use crate::error::{is_interruption, is_timeout, kind_of, Result, ThreadlineError};
use crate::generation::chunk_log::{ChunkLog, ChunkWriter};
use crate::generation::finalize::Finalizer;
use crate::generation::metrics::GenerationMetrics;
use crate::generation::registry::{ActiveStream, StreamRegistry};
use crate::generation::stop::{request_stop, StopOutcome};
use crate::prompts::{build_generation_prompt, clean_title, format_transcript, title_prompt};
use crate::providers::{Prompt, Provider};
use crate::storage::{ConversationId, Message, MessageId, SqliteStorage};

use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How a generation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// The provider finished; the full answer was finalized
    Completed { text: String },
    /// Stopped through the registry; the partial answer was finalized
    Cancelled { text: String },
    /// The provider hit its time limit; the partial answer was finalized
    TimedOut { text: String },
    /// The provider or the store failed; the message is left for recovery
    Failed { error: String },
}

impl GenerationOutcome {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Cancelled { .. } => "cancelled",
            Self::TimedOut { .. } => "timed_out",
            Self::Failed { .. } => "failed",
        }
    }

    /// Finalized text, unless the generation failed
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Completed { text } | Self::Cancelled { text } | Self::TimedOut { text } => {
                Some(text)
            }
            Self::Failed { .. } => None,
        }
    }
}

/// A generation that has been started
#[derive(Debug)]
pub struct StartedGeneration {
    /// Conversation the answer belongs to
    pub conversation_id: ConversationId,
    /// Placeholder assistant message receiving the answer
    pub message_id: MessageId,
    task: JoinHandle<GenerationOutcome>,
}

impl StartedGeneration {
    /// Waits for the generation to end
    pub async fn wait(self) -> GenerationOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => GenerationOutcome::Failed {
                error: format!("generation task ended abnormally: {}", e),
            },
        }
    }

    /// Lets the generation run on without waiting for it
    pub fn detach(self) -> (ConversationId, MessageId) {
        (self.conversation_id, self.message_id)
    }
}

/// Generation behaviour taken from configuration
#[derive(Debug, Clone)]
pub struct GenerationSettings {
    /// System instructions for every prompt
    pub system_prompt: String,
    /// Whether the first answer of a conversation triggers a title request
    pub generate_titles: bool,
    /// Maximum title length in characters
    pub title_max_chars: usize,
}

impl From<&GenerationConfig> for GenerationSettings {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            system_prompt: config.system_prompt.clone(),
            generate_titles: config.generate_titles,
            title_max_chars: config.title_max_chars,
        }
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self::from(&GenerationConfig::default())
    }
}

/// Starts generations, and stops them on request
#[derive(Clone)]
pub struct GenerationOrchestrator {
    storage: SqliteStorage,
    provider: Arc<dyn Provider>,
    registry: StreamRegistry,
    policy: Arc<dyn AccessPolicy>,
    chunk_log: ChunkLog,
    finalizer: Finalizer,
    settings: GenerationSettings,
}

impl GenerationOrchestrator {
    /// Creates an orchestrator
    pub fn new(
        storage: SqliteStorage,
        provider: Arc<dyn Provider>,
        registry: StreamRegistry,
        policy: Arc<dyn AccessPolicy>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            chunk_log: ChunkLog::new(storage.clone()),
            finalizer: Finalizer::new(storage.clone()),
            storage,
            provider,
            registry,
            policy,
            settings,
        }
    }

    /// Store this orchestrator writes to
    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// Registry of running generations
    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /// Permission check in use
    pub fn policy(&self) -> &Arc<dyn AccessPolicy> {
        &self.policy
    }

    /// Records a user message and starts the assistant's answer
    ///
    /// Without `conversation_id` a new conversation is created and, once the
    /// first answer completes, a title is requested for it.
    ///
    /// # Errors
    ///
    /// `Validation` for a blank message, `NotFound`/`PermissionDenied` for the
    /// conversation, `GenerationInProgress` when an answer is still streaming,
    /// and `Persistence` when the turn cannot be recorded.
    pub async fn generate(
        &self,
        requester: &str,
        conversation_id: Option<&str>,
        message: &str,
    ) -> Result<StartedGeneration> {
        if message.trim().is_empty() {
            return Err(ThreadlineError::Validation("message must not be empty".into()).into());
        }
        if conversation_id.is_some_and(|id| id.trim().is_empty()) {
            return Err(
                ThreadlineError::Validation("conversationId must not be empty".into()).into(),
            );
        }

        let policy = Arc::clone(&self.policy);
        let (user, conversation, text) = (
            requester.to_string(),
            conversation_id.map(str::to_string),
            message.to_string(),
        );
        let (turn, history) = self
            .storage
            .run_blocking(move |storage| {
                let turn = storage.begin_answered_turn(
                    &user,
                    conversation.as_deref(),
                    &text,
                    policy.as_ref(),
                )?;
                let history = storage.list_messages(&turn.conversation.id)?;
                Ok((turn, history))
            })
            .await?;
        tracing::info!(
            conversation_id = %turn.conversation.id,
            user_message_id = turn.user_message.id,
            message_id = turn.placeholder.id,
            new_conversation = conversation_id.is_none(),
            "Starting generation"
        );

        self.launch(
            &turn.conversation.id,
            turn.placeholder.id,
            &history,
            conversation_id.is_none(),
        )
    }

    /// Creates the placeholder answer and starts generating into it
    ///
    /// Returns once the placeholder exists and its token is registered.
    pub async fn start_generation(
        &self,
        conversation_id: &str,
        prior_messages: &[Message],
        first_turn: bool,
    ) -> Result<StartedGeneration> {
        let conversation = conversation_id.to_string();
        let placeholder = self
            .storage
            .run_blocking(move |storage| storage.insert_assistant_placeholder(&conversation))
            .await?;
        self.launch(conversation_id, placeholder.id, prior_messages, first_turn)
    }

    fn launch(
        &self,
        conversation_id: &str,
        message_id: MessageId,
        prior_messages: &[Message],
        first_turn: bool,
    ) -> Result<StartedGeneration> {
        let active = match self.registry.register_guarded(message_id) {
            Ok(active) => active,
            Err(e) => {
                self.finalizer.finalize_or_log(message_id, Some(""));
                return Err(e);
            }
        };

        let prompt = build_generation_prompt(&self.settings.system_prompt, prior_messages);
        let title_transcript = (first_turn && self.settings.generate_titles)
            .then(|| format_transcript(prior_messages));

        let orchestrator = self.clone();
        let conversation = conversation_id.to_string();
        let task = tokio::spawn(async move {
            orchestrator
                .run(active, conversation, prompt, title_transcript)
                .await
        });

        Ok(StartedGeneration {
            conversation_id: conversation_id.to_string(),
            message_id,
            task,
        })
    }

    /// Requests that a running generation stop
    ///
    /// See [`request_stop`].
    pub fn stop(&self, message_id: MessageId, requester: &str) -> Result<StopOutcome> {
        request_stop(
            &self.storage,
            &self.registry,
            self.policy.as_ref(),
            message_id,
            requester,
        )
    }

    async fn run(
        self,
        active: ActiveStream,
        conversation_id: ConversationId,
        prompt: Prompt,
        title_transcript: Option<String>,
    ) -> GenerationOutcome {
        let message_id = active.message_id();
        let metrics = GenerationMetrics::start(self.provider.name());
        let mut writer = self.chunk_log.writer(message_id);

        let result = self.pump(active.token(), &prompt, &mut writer).await;
        let cancelled = active.token().is_cancelled();
        let chunks = writer.len();
        let text = writer.into_text();

        let outcome = match result {
            Ok(()) => {
                self.finalizer
                    .finalize_or_log_async(message_id, Some(text.clone()))
                    .await;
                GenerationOutcome::Completed { text }
            }
            Err(e) if cancelled || is_interruption(&e) => {
                self.finalizer
                    .finalize_or_log_async(message_id, Some(text.clone()))
                    .await;
                if !cancelled && is_timeout(&e) {
                    tracing::warn!(message_id, error = %e, "Generation timed out");
                    GenerationOutcome::TimedOut { text }
                } else {
                    GenerationOutcome::Cancelled { text }
                }
            }
            Err(e) => {
                if matches!(kind_of(&e), Some(ThreadlineError::MessageFinalized(_))) {
                    tracing::warn!(message_id, "Message was finalized by another writer");
                } else {
                    tracing::error!(
                        message_id,
                        conversation_id = %conversation_id,
                        error = %e,
                        "Generation failed; leaving message for recovery"
                    );
                }
                GenerationOutcome::Failed {
                    error: e.to_string(),
                }
            }
        };

        metrics.record_outcome(outcome.as_str());
        tracing::info!(
            message_id,
            conversation_id = %conversation_id,
            outcome = outcome.as_str(),
            chunks,
            "Generation finished"
        );

        // Release the registry entry before the title request.
        drop(active);

        if let (GenerationOutcome::Completed { .. }, Some(transcript)) = (&outcome, title_transcript)
        {
            let orchestrator = self.clone();
            tokio::spawn(async move {
                orchestrator
                    .generate_title(&conversation_id, &transcript)
                    .await;
            });
        }

        outcome
    }

    async fn pump(
        &self,
        token: &CancellationToken,
        prompt: &Prompt,
        writer: &mut ChunkWriter,
    ) -> Result<()> {
        let mut fragments = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ThreadlineError::Cancelled.into()),
            stream = self.provider.stream(prompt, token.clone()) => stream?,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ThreadlineError::Cancelled.into()),
                next = fragments.next() => next,
            };
            match next {
                None => return Ok(()),
                Some(Ok(fragment)) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    writer.append(&fragment).await?;
                }
                Some(Err(e)) => return Err(e),
            }
        }
    }

    async fn generate_title(&self, conversation_id: &str, transcript: &str) {
        let raw = match self.provider.complete(&title_prompt(transcript)).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "Title generation failed");
                return;
            }
        };

        let Some(title) = clean_title(&raw, self.settings.title_max_chars) else {
            tracing::debug!(conversation_id, "Provider returned an empty title");
            return;
        };

        let (conversation, stored_title) = (conversation_id.to_string(), title.clone());
        let stored = self
            .storage
            .run_blocking(move |storage| {
                storage.update_conversation_title(&conversation, &stored_title)
            })
            .await;
        match stored {
            Ok(()) => tracing::debug!(conversation_id, title = %title, "Updated conversation title"),
            Err(e) => tracing::warn!(conversation_id, error = %e, "Failed to store title"),
        }
    }
}
