//! # SpiteDB Projections
//!
//! A checkpointed, partitioned projection engine for event stores. A
//! projection reads events from a source, folds them into per-partition state
//! with a user handler, emits derived events, and records how far it got so a
//! restart resumes exactly where the last checkpoint left off.
//!
//! - **Positions**: checkpoint tags for every kind of source (whole log,
//!   one stream, several streams, event-type index)
//! - **Ordered processing**: a staged work queue that loads state
//!   concurrently but writes output in event order
//! - **Exactly-once output**: emitted streams reconcile re-emitted events
//!   with what is already stored after a restart
//! - **Bounded memory**: an LRU partition cache that never evicts state
//!   still waiting for its checkpoint
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Runtime (tokio actor)                       │
//! │          commands, store IO, reader tasks, status feed          │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 CoreProjection (no IO of its own)               │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  Processing │  │  Partition  │  │  Checkpoint manager     │  │
//! │  │    queue    │  │    cache    │  │  (emitted streams)      │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  EventStore (memory or SQLite)                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Checkpoints follow output**: a checkpoint is written only after every
//!    event emitted before it is durable
//! 2. **Monotonic positions**: tags a projection processes never go backward
//! 3. **Ordered output**: output is written in the order the source delivered
//!    the events, whatever order their state loads finished in
//! 4. **Pinned state**: a partition with unsaved changes stays in memory
//!
//! ## Module Organization
//!
//! - [`tag`], [`codec`]: checkpoint positions and their stored form
//! - [`tagger`], [`subscription`]: turning log events into tagged messages
//! - [`staged_queue`], [`processing_queue`]: ordered staged work
//! - [`partition_cache`]: partition states in memory
//! - [`checkpoint`]: emitted streams, checkpoint records and their manager
//! - [`projection`]: the orchestrator and its lifecycle
//! - [`runtime`]: the tokio driver
//! - [`store`]: the event store contract and two implementations

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types shared by every module.
pub mod error;

/// Checkpoint tags: positions a projection can resume from.
pub mod tag;

/// Stored form of checkpoint tags.
pub mod codec;

/// Domain types: received events, partition states, emitted events.
pub mod types;

/// Position taggers, one per source kind.
pub mod tagger;

/// Generic multi-stage work queue.
pub mod staged_queue;

/// Partition state cache.
pub mod partition_cache;

/// Sans-IO request bookkeeping.
pub mod io;

/// Retry backoff with jitter.
pub mod backoff;

/// Emitted streams, checkpoint records and the checkpoint manager.
pub mod checkpoint;

/// Event store contract plus memory and SQLite implementations.
pub mod store;

/// Projection configuration.
pub mod config;

/// The user-supplied state handler.
pub mod handler;

/// Running result events.
pub mod results;

/// Reader subscriptions.
pub mod subscription;

/// Flow-controlled processing queue.
pub mod processing_queue;

/// The projection orchestrator.
pub mod projection;

/// Tokio runtime for projections.
///
/// The main entry point is [`spawn_projection`](runtime::spawn_projection).
pub mod runtime;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{Error, Result};

pub use config::ProjectionConfig;
pub use handler::{HandlerOutput, StateHandler};
pub use projection::{
    CoreProjection, ProjectionOutput, ProjectionState, ProjectionStatistics, ProjectionStatus, QueryId,
};
pub use runtime::{spawn_projection, ProjectionHandle, RuntimeOptions};
pub use store::{EventStore, MemoryStore, SqliteStore};
pub use subscription::SourceDefinition;
pub use tag::{CheckpointTag, TfPos};
pub use types::{EmittedEvent, PartitionState, ProjectionNames, ProjectionVersion, ReceivedEvent};
