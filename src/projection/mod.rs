//! # Core Projection
//!
//! The orchestrator that ties readers, the processing queue, the partition
//! cache and the checkpoint manager together, and the lifecycle callers see.
//!
//! ## Lifecycle
//!
//! ```text
//!  Initial ─► LoadStateRequested ─► StateLoaded ─► Subscribed ─► Running
//!                                        │                         │
//!                                        └──(load stopped)──► Stopped ◄── Stopping ◄─┤ stop
//!                                                                  ▲                 │
//!                                           PhaseCompleted ◄── CompletingPhase ◄─────┤ EOF (stop on EOF)
//!                                                                                    │
//!                                        Faulted ◄── FaultedStopping ◄───────────────┘ handler error
//! ```
//!
//! Any error that escapes a step moves the projection straight to `Faulted`.
//! `kill` and `suspend` skip the final checkpoint.
//!
//! ## Sans-IO
//!
//! [`CoreProjection`] does no IO. Callers drain two queues after every call:
//!
//! - [`CoreProjection::take_io`]: store requests, answered through
//!   [`CoreProjection::handle_io`]
//! - [`CoreProjection::take_outputs`]: [`ProjectionOutput`]s for the reader,
//!   the status listener and query callers
//!
//! The tokio runtime in [`crate::runtime`] is one such caller; the tests
//! drive the same type synchronously.
//!
//! ## Processing Stages
//!
//! Every subscription message becomes a work item that moves through five
//! stages of the processing queue:
//!
//! | # | Stage | Ordered | Does |
//! |---|-------|---------|------|
//! | 0 | record event order | yes | keeps items in subscription order |
//! | 1 | get state partition | yes | asks the handler for the partition, sets the correlation id |
//! | 2 | load | no | locks the cached state or loads it from its checkpoint stream |
//! | 3 | process | no | runs the handler |
//! | 4 | write output | yes | emits, updates the checkpoint manager, parks checkpoint requests |

mod context;
mod lifecycle;
mod work_item;

pub use lifecycle::CoreProjection;

use std::fmt;

use serde::{Serialize, Serializer};

use crate::processing_queue::ReadControl;
use crate::subscription::{ReaderSubscription, SubscriptionId};
use crate::tag::CheckpointTag;

/// Identifies a state or result query.
pub type QueryId = u64;

// =============================================================================
// States
// =============================================================================

/// Lifecycle state of a projection. See the module docs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProjectionState {
    /// Created or reset; nothing loaded.
    Initial,
    /// Waiting for the last checkpoint.
    LoadStateRequested,
    /// Checkpoint loaded, caches primed.
    StateLoaded,
    /// Subscribed, waiting for the reader to start.
    Subscribed,
    /// Processing events.
    Running,
    /// Writing the final checkpoint before stopping.
    Stopping,
    /// Stopped; queries are still answered.
    Stopped,
    /// Writing what was processed before faulting.
    FaultedStopping,
    /// Faulted; see [`CoreProjection::faulted_reason`].
    Faulted,
    /// End of the source reached; writing the final checkpoint.
    CompletingPhase,
    /// Final checkpoint of the last phase written.
    PhaseCompleted,
    /// Taken off its worker without a final checkpoint.
    Suspended,
}

impl ProjectionState {
    /// Whether the projection consumes subscription messages.
    pub(crate) fn is_subscribed(self) -> bool {
        matches!(self, ProjectionState::Subscribed | ProjectionState::Running)
    }

    /// Whether the processing queue knows its position, so queries can be
    /// answered.
    pub(crate) fn has_position(self) -> bool {
        !matches!(
            self,
            ProjectionState::Initial | ProjectionState::LoadStateRequested
        )
    }
}

impl fmt::Display for ProjectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProjectionState::Initial => "Initial",
            ProjectionState::LoadStateRequested => "LoadStateRequested",
            ProjectionState::StateLoaded => "StateLoaded",
            ProjectionState::Subscribed => "Subscribed",
            ProjectionState::Running => "Running",
            ProjectionState::Stopping => "Stopping",
            ProjectionState::Stopped => "Stopped",
            ProjectionState::FaultedStopping => "FaultedStopping",
            ProjectionState::Faulted => "Faulted",
            ProjectionState::CompletingPhase => "CompletingPhase",
            ProjectionState::PhaseCompleted => "PhaseCompleted",
            ProjectionState::Suspended => "Suspended",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Outputs
// =============================================================================

/// Status transitions reported to listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status")]
pub enum ProjectionStatus {
    /// The projection is subscribed and processing.
    Started,
    /// The projection stopped.
    Stopped {
        /// `true` when it stopped because its source was fully processed.
        completed: bool,
    },
    /// The projection faulted.
    Faulted {
        /// Human-readable reason.
        reason: String,
    },
    /// The projection was suspended.
    Suspended,
}

/// Something the caller of a [`CoreProjection`] has to act on.
#[derive(Debug)]
pub enum ProjectionOutput {
    /// Start a reader for this subscription.
    Subscribe(ReaderSubscription),
    /// Stop the reader of this subscription.
    Unsubscribe {
        /// The subscription.
        subscription: SubscriptionId,
    },
    /// Pause or resume the reader of this subscription.
    ReadControl {
        /// The subscription.
        subscription: SubscriptionId,
        /// What to do.
        control: ReadControl,
    },
    /// Call [`CoreProjection::tick`]: more work is queued.
    Tick,
    /// The lifecycle changed.
    Status(ProjectionStatus),
    /// Answer to [`CoreProjection::get_state`].
    StateReport {
        /// The query.
        query_id: QueryId,
        /// Partition asked for.
        partition: String,
        /// Its state, `None` when unknown.
        state: Option<String>,
        /// Position the answer is valid at.
        position: Option<CheckpointTag>,
    },
    /// Answer to [`CoreProjection::get_result`].
    ResultReport {
        /// The query.
        query_id: QueryId,
        /// Partition asked for.
        partition: String,
        /// Its result, `None` when unknown.
        result: Option<String>,
        /// Position the answer is valid at.
        position: Option<CheckpointTag>,
    },
}

// =============================================================================
// Statistics
// =============================================================================

/// Point-in-time counters of one projection.
///
/// Serializes with camelCase keys and tags in their display form.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionStatistics {
    /// Projection name.
    pub name: String,
    /// Lifecycle state.
    pub state: ProjectionState,
    /// State name plus `"/Paused"` while reading is paused.
    pub status: String,
    /// Last processed position.
    #[serde(serialize_with = "display_tag")]
    pub position: Option<CheckpointTag>,
    /// Reader progress in percent, `-1` when unknown.
    pub progress: f32,
    /// Last durable checkpoint.
    #[serde(serialize_with = "display_tag")]
    pub last_checkpoint: Option<CheckpointTag>,
    /// Events processed since the last (re)start.
    pub events_processed_after_restart: u64,
    /// Work items waiting in the processing queue.
    pub buffered_events: usize,
    /// Events queued in the closing checkpoint.
    pub write_pending_events_before_checkpoint: usize,
    /// Events queued in the current checkpoint.
    pub write_pending_events_after_checkpoint: usize,
    /// Store reads in flight.
    pub reads_in_progress: usize,
    /// Store writes in flight.
    pub writes_in_progress: usize,
    /// Partition states in memory.
    pub partitions_cached: usize,
    /// `"Requested"` while a checkpoint is in flight.
    pub checkpoint_status: String,
    /// Fault reason, when faulted.
    pub faulted_reason: Option<String>,
}

fn display_tag<S: Serializer>(tag: &Option<CheckpointTag>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match tag {
        Some(tag) => serializer.collect_str(tag),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_tagged() {
        let json = serde_json::to_string(&ProjectionStatus::Stopped { completed: true }).unwrap();
        assert_eq!(json, r#"{"status":"Stopped","completed":true}"#);
        let json = serde_json::to_string(&ProjectionStatus::Started).unwrap();
        assert_eq!(json, r#"{"status":"Started"}"#);
    }

    #[test]
    fn test_statistics_serialize_tags_as_text() {
        let stats = ProjectionStatistics {
            name: "orders".to_string(),
            state: ProjectionState::Running,
            status: "Running/Paused".to_string(),
            position: Some(CheckpointTag::from_position(0, 10, 9)),
            progress: 50.0,
            last_checkpoint: None,
            events_processed_after_restart: 3,
            buffered_events: 0,
            write_pending_events_before_checkpoint: 0,
            write_pending_events_after_checkpoint: 0,
            reads_in_progress: 0,
            writes_in_progress: 0,
            partitions_cached: 1,
            checkpoint_status: String::new(),
            faulted_reason: None,
        };
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["state"], "Running");
        assert_eq!(value["position"], "C:10/P:9");
        assert!(value["lastCheckpoint"].is_null());
        assert_eq!(value["eventsProcessedAfterRestart"], 3);
    }
}
