//! Streaming generation pipeline
//!
//! An assistant answer goes through these stages:
//!
//! 1. [`GenerationOrchestrator`] records the user turn, inserts a non-final
//!    placeholder and registers a cancellation token in the
//!    [`StreamRegistry`].
//! 2. A spawned task pulls fragments from the provider and appends each to
//!    the [`ChunkLog`] under a gap-free index.
//! 3. On completion, stop or timeout the [`Finalizer`] collapses the log into
//!    the message's final text and deletes the chunks.
//! 4. Anything left non-final by a crashed generation is picked up by the
//!    [`RecoverySweeper`].

pub mod chunk_log;
pub mod finalize;
pub mod metrics;
pub mod orchestrator;
pub mod recovery;
pub mod registry;
pub mod stop;

pub use chunk_log::{concat_chunks, ChunkLog, ChunkWriter};
pub use finalize::Finalizer;
pub use orchestrator::{
    GenerationOrchestrator, GenerationOutcome, GenerationSettings, StartedGeneration,
};
pub use recovery::{RecoverySweeper, SweepReport};
pub use registry::{ActiveStream, StreamRegistry};
pub use stop::{request_stop, StopOutcome};
