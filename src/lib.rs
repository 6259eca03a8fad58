//! Threadline - chat backend with crash-safe streaming generation
//!
//! Assistant answers are written to a per-message chunk log while they are
//! generated, collapsed into the message row once generation ends, and read
//! live through shared, reference-counted views.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `storage`: SQLite conversations, messages and chunks, plus a change feed
//! - `providers`: Fragment sources (Ollama, scripted)
//! - `generation`: Orchestrator, stream registry, chunk log, finalization and recovery
//! - `live`: Live reconstruction and the materialized view cache
//! - `server`: HTTP API
//! - `access`: Conversation permission checks
//! - `prompts`: Prompt and title formatting
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use threadline::access::OwnerOrSharedPolicy;
//! use threadline::generation::{GenerationOrchestrator, GenerationSettings, StreamRegistry};
//! use threadline::providers::ScriptedProvider;
//! use threadline::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let orchestrator = GenerationOrchestrator::new(
//!         SqliteStorage::new_with_path("threadline.db")?,
//!         Arc::new(ScriptedProvider::new(["Hello", "!"])),
//!         StreamRegistry::new(),
//!         Arc::new(OwnerOrSharedPolicy),
//!         GenerationSettings::default(),
//!     );
//!     let outcome = orchestrator.generate("alice", None, "Hi").await?.wait().await;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

pub mod access;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod generation;
pub mod live;
pub mod prompts;
pub mod providers;
pub mod server;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use error::{Result, ThreadlineError};
pub use generation::{GenerationOrchestrator, StreamRegistry};
pub use live::{LiveConversation, ViewStore};
pub use storage::SqliteStorage;

#[cfg(test)]
pub mod test_utils;
