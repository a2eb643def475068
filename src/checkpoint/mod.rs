//! # Checkpointing
//!
//! Everything between "an event was processed" and "its consequences are
//! durable":
//!
//! - [`EmittedStream`]: writes derived events to one output stream and, after
//!   a restart, reconciles re-emitted events with what is already stored
//! - [`ProjectionCheckpoint`]: the set of emitted streams that belong to one
//!   checkpoint interval
//! - [`CheckpointWriter`] / [`CheckpointReader`]: persist and load the
//!   `$ProjectionCheckpoint` record
//! - [`CheckpointManager`]: the lifecycle that ties them together
//!
//! ## Sans-IO
//!
//! None of these types touch the store. They publish requests through
//! [`Effects::io`] with a [`Continuation`] naming who asked, and report
//! lifecycle events by pushing [`Signal`]s. The projection drains both.
//!
//! ```text
//!   current checkpoint ──emits──► EmittedStream* ──writes──► store
//!        │ start_checkpoint
//!        ▼
//!   closing checkpoint ──all streams flushed──► ReadyForCheckpoint
//!                                                   │
//!                      CheckpointWriter ◄───────────┘
//!                            │ written
//!                            ▼
//!                   CheckpointCompleted(tag)
//! ```

mod emitted_stream;
mod manager;
mod partition;
mod projection_checkpoint;
mod writer;

pub use emitted_stream::{EmittedStream, EmittedStreamConfig};
pub use manager::{CheckpointManager, CheckpointSettings, CheckpointStatistics};
pub use partition::{PartitionStateLoader, PartitionStateUpdates};
pub use projection_checkpoint::ProjectionCheckpoint;
pub use writer::{CheckpointReader, CheckpointWriter};

use std::collections::VecDeque;

use crate::io::IoDispatcher;
use crate::staged_queue::TaskId;
use crate::tag::CheckpointTag;
use crate::types::PartitionState;

/// Identifier of one checkpoint interval.
pub type CheckpointId = u64;

// =============================================================================
// Continuations
// =============================================================================

/// What to do when an IO request completes.
#[derive(Debug, Clone, PartialEq)]
pub enum Continuation {
    /// A page of the checkpoint stream was read.
    ReadCheckpoint,
    /// The checkpoint record was written.
    WriteCheckpoint,
    /// The checkpoint write backoff elapsed.
    CheckpointRetry,
    /// A page of an emitted stream was read during recovery.
    EmittedRead {
        /// Owning checkpoint.
        checkpoint: CheckpointId,
        /// Output stream.
        stream: String,
    },
    /// A batch was written to an emitted stream.
    EmittedWrite {
        /// Owning checkpoint.
        checkpoint: CheckpointId,
        /// Output stream.
        stream: String,
    },
    /// An emitted stream's write backoff elapsed.
    EmittedRetry {
        /// Owning checkpoint.
        checkpoint: CheckpointId,
        /// Output stream.
        stream: String,
    },
    /// A page of a partition checkpoint stream was read.
    LoadPartition {
        /// Work item waiting for the state.
        task: TaskId,
        /// Partition being loaded.
        partition: String,
        /// Position the state is needed at.
        at: CheckpointTag,
    },
}

impl Continuation {
    /// Checkpoint interval the request belongs to, for emitted-stream IO.
    pub fn checkpoint(&self) -> Option<CheckpointId> {
        match self {
            Continuation::EmittedRead { checkpoint, .. }
            | Continuation::EmittedWrite { checkpoint, .. }
            | Continuation::EmittedRetry { checkpoint, .. } => Some(*checkpoint),
            _ => None,
        }
    }
}

// =============================================================================
// Signals
// =============================================================================

/// Something the projection has to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// The checkpoint stream was read.
    CheckpointLoaded {
        /// Last checkpoint of this projection, if any.
        tag: Option<CheckpointTag>,
        /// Serialized root state stored with it.
        data: Option<String>,
        /// Event number the next checkpoint write expects.
        event_number: i64,
    },
    /// A partition's state was read from its checkpoint stream.
    PartitionLoaded {
        /// Work item waiting for the state.
        task: TaskId,
        /// Partition.
        partition: String,
        /// Loaded (or empty) state.
        state: PartitionState,
    },
    /// Every stream of a closing checkpoint is flushed.
    ReadyForCheckpoint {
        /// The closing checkpoint.
        checkpoint: CheckpointId,
    },
    /// A checkpoint is durable.
    CheckpointCompleted(CheckpointTag),
    /// Someone else wrote to a stream we own; start over from the last checkpoint.
    RestartRequested(String),
    /// Unrecoverable; fault the projection.
    Failed(String),
}

/// Requests and signals produced while handling one input.
#[derive(Debug, Default)]
pub struct Effects {
    /// Store requests in flight.
    pub io: IoDispatcher<Continuation>,
    signals: VecDeque<Signal>,
}

impl Effects {
    /// Creates empty effects.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a signal.
    pub fn signal(&mut self, signal: Signal) {
        self.signals.push_back(signal);
    }

    /// Queues [`Signal::Failed`].
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.signal(Signal::Failed(reason.into()));
    }

    /// Queues [`Signal::RestartRequested`].
    pub fn restart(&mut self, reason: impl Into<String>) {
        self.signal(Signal::RestartRequested(reason.into()));
    }

    /// Takes the oldest queued signal.
    pub fn next_signal(&mut self) -> Option<Signal> {
        self.signals.pop_front()
    }

    /// Drops queued signals.
    pub fn clear_signals(&mut self) {
        self.signals.clear();
    }
}
