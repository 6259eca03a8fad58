/*!
Command handlers for the CLI

One module per subcommand:

- `serve`  : HTTP API plus the background recovery sweep
- `ask`    : Send one message and stream the answer to stdout
- `watch`  : Follow a conversation live
- `recover`: One recovery sweep

The handlers only wire library components together: storage, provider,
orchestrator, views and the HTTP router.
*/

use crate::access::OwnerOrSharedPolicy;
use crate::config::Config;
use crate::error::Result;
use crate::generation::{GenerationOrchestrator, GenerationSettings, StreamRegistry};
use crate::providers::create_provider;
use crate::storage::{Message, MessageId, Sender, SqliteStorage};

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

/// Opens the store configured in `storage.path`, or the default location
pub fn open_storage(config: &Config) -> Result<SqliteStorage> {
    match &config.storage.path {
        Some(path) => SqliteStorage::new_with_path(path.clone()),
        None => SqliteStorage::new(),
    }
}

/// Builds an orchestrator from configuration
pub fn build_orchestrator(
    config: &Config,
    storage: SqliteStorage,
    registry: StreamRegistry,
) -> Result<GenerationOrchestrator> {
    let provider = create_provider(&config.provider)?;
    tracing::debug!(provider = provider.name(), "Created provider");
    Ok(GenerationOrchestrator::new(
        storage,
        provider,
        registry,
        Arc::new(OwnerOrSharedPolicy),
        GenerationSettings::from(&config.generation),
    ))
}

fn role(sender: Sender) -> &'static str {
    match sender {
        Sender::User => "User",
        Sender::Assistant => "Assistant",
    }
}

/// Prints messages incrementally as their text grows
///
/// Text already printed for a message is not printed again; only the new
/// suffix is written.
#[derive(Debug, Default)]
struct TranscriptPrinter {
    shown: HashMap<MessageId, String>,
    open: Option<MessageId>,
}

impl TranscriptPrinter {
    fn print(&mut self, out: &mut impl Write, messages: &[Message]) -> std::io::Result<()> {
        for message in messages {
            let text = &message.final_text;
            match self.shown.get_mut(&message.id) {
                None => {
                    if self.open.take().is_some() {
                        writeln!(out)?;
                    }
                    write!(out, "{}: {}", role(message.sender), text)?;
                    self.shown.insert(message.id, text.clone());
                    self.open = Some(message.id);
                }
                Some(shown) => {
                    if let Some(suffix) = text.strip_prefix(shown.as_str()) {
                        write!(out, "{}", suffix)?;
                        *shown = text.clone();
                    } else if message.is_final || !shown.starts_with(text.as_str()) {
                        write!(out, "\n{}: {}", role(message.sender), text)?;
                        *shown = text.clone();
                    }
                    // A shorter in-flight text is a stale read; keep what is shown.
                }
            }
            if message.is_final && self.open == Some(message.id) {
                writeln!(out)?;
                self.open = None;
            }
        }
        out.flush()
    }
}

// Serve command handler
pub mod serve {
    //! Runs the HTTP API until Ctrl-C.
    //!
    //! On startup every orphaned message is finalized; a periodic sweep keeps
    //! doing so with a grace period. On shutdown running generations are
    //! stopped so their partial text is finalized before exit.

    use super::*;
    use crate::generation::metrics::init_metrics_exporter;
    use crate::generation::RecoverySweeper;
    use crate::server::{self, AppState};
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

    /// Start the server
    pub async fn run_serve(config: Config) -> Result<()> {
        let storage = open_storage(&config)?;
        tracing::info!("Using database {}", storage.db_path().display());
        let registry = StreamRegistry::new();
        init_metrics_exporter(config.server.metrics_address.as_deref());

        let sweeper = RecoverySweeper::new(storage.clone(), registry.clone());
        if config.recovery.sweep_on_startup {
            let report = sweeper.sweep_async(Duration::ZERO).await?;
            if report.finalized > 0 {
                tracing::info!(
                    finalized = report.finalized,
                    "Recovered messages left over from a previous run"
                );
            }
        }

        let shutdown = CancellationToken::new();
        let recovery = sweeper.spawn(
            config.recovery.interval(),
            config.recovery.grace(),
            shutdown.clone(),
        );

        let orchestrator = build_orchestrator(&config, storage, registry.clone())?;
        let listener = TcpListener::bind(config.bind_address()?).await?;

        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
            }
            signal.cancel();
        });

        let result = server::serve(listener, AppState::new(orchestrator), shutdown.clone()).await;
        shutdown.cancel();

        let stopping = registry.cancel_all();
        if stopping > 0 {
            tracing::info!(stopping, "Stopping running generations");
            let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN;
            while !registry.is_empty() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        if let Err(e) = recovery.await {
            tracing::warn!("Recovery loop ended abnormally: {}", e);
        }
        result
    }
}

// Ask command handler
pub mod ask {
    //! Sends one message and prints the answer while it streams.
    //!
    //! The answer is read back through a [`LiveConversation`], the same path
    //! any other reader uses. Ctrl-C stops the generation; the partial answer
    //! is kept.

    use super::*;
    use crate::error::ThreadlineError;
    use crate::generation::GenerationOutcome;
    use crate::live::{LiveConversation, StoreQuerySource, ViewStore};

    /// Run one generation and print it
    pub async fn run_ask(
        config: Config,
        conversation: Option<String>,
        user: String,
        message: String,
    ) -> Result<GenerationOutcome> {
        let storage = open_storage(&config)?;
        let orchestrator = build_orchestrator(&config, storage.clone(), StreamRegistry::new())?;
        let views = ViewStore::new(Arc::new(StoreQuerySource::new(storage.clone())));

        let started = orchestrator
            .generate(&user, conversation.as_deref(), &message)
            .await?;
        let conversation_id = started.conversation_id.clone();
        let message_id = started.message_id;
        eprintln!("conversation {} / message {}", conversation_id, message_id);

        let mut live = LiveConversation::open(&views, &user, &conversation_id, config.views.ttl());
        let mut printer = TranscriptPrinter::default();
        let mut stdout = std::io::stdout();
        let mut stop_requested = false;

        let wait = started.wait();
        tokio::pin!(wait);

        let outcome = loop {
            tokio::select! {
                outcome = &mut wait => break outcome,
                signal = tokio::signal::ctrl_c(), if !stop_requested => {
                    if signal.is_ok() {
                        stop_requested = true;
                        orchestrator.stop(message_id, &user)?;
                        eprintln!("\nstopping...");
                    }
                }
                snapshot = live.changed() => match snapshot {
                    Ok(snapshot) => {
                        let answer: Vec<Message> = snapshot
                            .messages
                            .into_iter()
                            .filter(|m| m.id == message_id)
                            .collect();
                        printer.print(&mut stdout, &answer)?;
                    }
                    Err(e) => tracing::debug!("Live update failed: {}", e),
                },
            }
        };

        if let Some(answer) = storage.get_message(message_id)? {
            printer.print(&mut stdout, &[answer])?;
        }

        match &outcome {
            GenerationOutcome::Completed { .. } => {}
            GenerationOutcome::Cancelled { .. } => eprintln!("[stopped]"),
            GenerationOutcome::TimedOut { .. } => eprintln!("[timed out]"),
            GenerationOutcome::Failed { error } => {
                return Err(ThreadlineError::Generation(error.clone()).into());
            }
        }
        Ok(outcome)
    }
}

// Watch command handler
pub mod watch {
    //! Prints a conversation and every change to it until Ctrl-C.
    //!
    //! Polls the store as well as listening to the in-process feed, so answers
    //! generated by another process (for example `threadline serve`) show up.

    use super::*;
    use crate::access::AccessPolicy;
    use crate::error::ThreadlineError;
    use crate::live::{LiveConversation, StoreQuerySource, ViewStore};
    use std::time::Duration;

    const POLL_INTERVAL: Duration = Duration::from_millis(250);

    /// Follow a conversation
    pub async fn run_watch(config: Config, conversation_id: String, user: String) -> Result<()> {
        let storage = open_storage(&config)?;
        let conversation = storage
            .get_conversation(&conversation_id)?
            .ok_or_else(|| ThreadlineError::NotFound(format!("conversation {}", conversation_id)))?;
        if !OwnerOrSharedPolicy.can_read(&conversation, &user) {
            return Err(ThreadlineError::PermissionDenied(format!(
                "user {} may not read conversation {}",
                user, conversation_id
            ))
            .into());
        }
        eprintln!("{} ({})", conversation.title, conversation.id);

        let source = StoreQuerySource::new(storage).with_polling(POLL_INTERVAL);
        let views = ViewStore::new(Arc::new(source));
        let mut live = LiveConversation::open(&views, &user, &conversation_id, config.views.ttl());
        let mut printer = TranscriptPrinter::default();
        let mut stdout = std::io::stdout();

        printer.print(&mut stdout, &live.snapshot()?.messages)?;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                snapshot = live.changed() => {
                    printer.print(&mut stdout, &snapshot?.messages)?;
                }
            }
        }
        Ok(())
    }
}

// Recover command handler
pub mod recover {
    //! Runs one recovery sweep and prints its report.
    //!
    //! Generations running in other processes are not visible to this
    //! process's registry; use a grace period when a server may be running.

    use super::*;
    use crate::generation::{RecoverySweeper, SweepReport};
    use std::time::Duration;

    /// Sweep once
    pub fn run_recover(config: Config, min_age: Duration) -> Result<SweepReport> {
        let storage = open_storage(&config)?;
        let report = RecoverySweeper::new(storage, StreamRegistry::new()).sweep(min_age)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(report)
    }
}
