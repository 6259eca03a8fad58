//! Crash recovery
//!
//! A generation that died without finalizing leaves a non-final message
//! behind, which blocks its conversation. The sweep finalizes every such
//! message that has no registered stream and has been quiet for at least a
//! grace period, using whatever chunks it had persisted.

use crate::error::Result;
use crate::generation::finalize::Finalizer;
use crate::generation::metrics::record_recovered;
use crate::generation::registry::StreamRegistry;
use crate::storage::{FinalizeOutcome, Message, SqliteStorage};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    /// Non-final messages examined
    pub scanned: usize,
    /// Messages this sweep finalized
    pub finalized: usize,
    /// Messages with a registered stream in this process
    pub skipped_active: usize,
    /// Messages with activity inside the grace period
    pub skipped_recent: usize,
    /// Messages whose finalization failed
    pub failed: usize,
}

/// Finalizes orphaned non-final messages
#[derive(Debug, Clone)]
pub struct RecoverySweeper {
    storage: SqliteStorage,
    registry: StreamRegistry,
    finalizer: Finalizer,
}

impl RecoverySweeper {
    /// Creates a sweeper sharing the process-wide registry
    pub fn new(storage: SqliteStorage, registry: StreamRegistry) -> Self {
        Self {
            finalizer: Finalizer::new(storage.clone()),
            storage,
            registry,
        }
    }

    /// Runs one sweep
    ///
    /// Messages whose latest activity (creation or newest chunk) is younger
    /// than `min_age` are skipped. Failures on single messages are counted
    /// and logged; the sweep carries on.
    ///
    /// # Errors
    ///
    /// Returns an error only when the non-final messages cannot be listed.
    pub fn sweep(&self, min_age: Duration) -> Result<SweepReport> {
        let candidates = self.storage.list_non_final_messages()?;
        let now = Utc::now();
        let mut report = SweepReport {
            scanned: candidates.len(),
            ..SweepReport::default()
        };

        for message in candidates {
            if self.registry.contains(message.id) {
                report.skipped_active += 1;
                continue;
            }

            match self.is_recent(&message, now, min_age) {
                Ok(true) => {
                    report.skipped_recent += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(message_id = message.id, error = %e, "Failed to inspect message");
                    report.failed += 1;
                    continue;
                }
            }

            match self.finalizer.finalize(message.id, None) {
                Ok(FinalizeOutcome::Finalized { .. }) => {
                    tracing::info!(
                        message_id = message.id,
                        conversation_id = %message.conversation_id,
                        "Recovered orphaned message"
                    );
                    report.finalized += 1;
                }
                Ok(FinalizeOutcome::AlreadyFinal) => {}
                Err(e) => {
                    tracing::warn!(message_id = message.id, error = %e, "Failed to recover message");
                    report.failed += 1;
                }
            }
        }

        record_recovered(report.finalized);
        if report.scanned > 0 {
            tracing::debug!(?report, "Recovery sweep finished");
        }
        Ok(report)
    }

    fn is_recent(&self, message: &Message, now: DateTime<Utc>, min_age: Duration) -> Result<bool> {
        if min_age.is_zero() {
            return Ok(false);
        }
        let last_chunk = self
            .storage
            .list_chunks(message.id)?
            .last()
            .map(|chunk| chunk.created_at);
        let last_activity = last_chunk
            .map_or(message.updated_at, |at| at.max(message.updated_at));
        let age = now
            .signed_duration_since(last_activity)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Ok(age < min_age)
    }

    /// Runs one sweep on the blocking thread pool
    pub async fn sweep_async(&self, min_age: Duration) -> Result<SweepReport> {
        let sweeper = self.clone();
        self.storage
            .run_blocking(move |_| sweeper.sweep(min_age))
            .await
    }

    /// Sweeps every `interval` until `shutdown` is cancelled
    ///
    /// The first sweep runs one interval after the call.
    pub fn spawn(
        self,
        interval: Duration,
        grace: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        tracing::debug!("Recovery loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_async(grace).await {
                            tracing::warn!(error = %e, "Recovery sweep failed");
                        }
                    }
                }
            }
        })
    }
}
