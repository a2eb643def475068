//! # State Handler
//!
//! The projection's user logic. The engine owns ordering, caching and
//! durability; a [`StateHandler`] only folds events into partition state.
//!
//! ```text
//! event ─► partition_for ─► (load state) ─► process_event ─► new state + emits
//!                                               │
//!                                 transform_state_to_result ─► result
//! ```
//!
//! States and results are JSON text. An empty `state` means the partition
//! has not seen an event yet.
//!
//! # Rust Pattern: Default Methods as Optional Hooks
//!
//! Only [`StateHandler::process_event`] is required. The other hooks have
//! default bodies that give the behavior of an unpartitioned projection
//! without results or deletions, so a handler overrides just what it uses.

use crate::tag::CheckpointTag;
use crate::types::{EmittedEvent, PartitionState, ReceivedEvent, ROOT_PARTITION};
use crate::Result;

/// What a handler produced for one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutput {
    /// New partition state.
    pub state: String,
    /// Events to write to derived streams.
    pub emitted: Vec<EmittedEvent>,
}

impl HandlerOutput {
    /// Output that only replaces the state.
    pub fn state(state: impl Into<String>) -> Self {
        Self {
            state: state.into(),
            emitted: Vec::new(),
        }
    }

    /// Adds an emitted event.
    pub fn with_emitted(mut self, event: EmittedEvent) -> Self {
        self.emitted.push(event);
        self
    }
}

/// User logic of a projection.
///
/// Errors returned from any hook fault the projection.
pub trait StateHandler: Send {
    /// Partition the event belongs to. `None` skips the event.
    fn partition_for(&self, _event: &ReceivedEvent) -> Result<Option<String>> {
        Ok(Some(ROOT_PARTITION.to_string()))
    }

    /// Called before the first event of a partition is processed.
    fn process_partition_created(
        &mut self,
        _partition: &str,
        _tag: &CheckpointTag,
        _event: &ReceivedEvent,
    ) -> Result<Vec<EmittedEvent>> {
        Ok(Vec::new())
    }

    /// Folds `event` into `state`. `None` means the event was not handled and
    /// the state stays as it is.
    fn process_event(
        &mut self,
        partition: &str,
        state: &PartitionState,
        event: &ReceivedEvent,
        tag: &CheckpointTag,
    ) -> Result<Option<HandlerOutput>>;

    /// The source stream of `partition` was deleted. Returns the replacement
    /// state, if any.
    fn process_partition_deleted(&mut self, _partition: &str, _state: &PartitionState) -> Result<Option<String>> {
        Ok(None)
    }

    /// Result published for `state`.
    fn transform_state_to_result(&self, state: &str) -> Result<Option<String>> {
        Ok(Some(state.to_string()))
    }
}

impl<H: StateHandler + ?Sized> StateHandler for Box<H> {
    fn partition_for(&self, event: &ReceivedEvent) -> Result<Option<String>> {
        (**self).partition_for(event)
    }

    fn process_partition_created(
        &mut self,
        partition: &str,
        tag: &CheckpointTag,
        event: &ReceivedEvent,
    ) -> Result<Vec<EmittedEvent>> {
        (**self).process_partition_created(partition, tag, event)
    }

    fn process_event(
        &mut self,
        partition: &str,
        state: &PartitionState,
        event: &ReceivedEvent,
        tag: &CheckpointTag,
    ) -> Result<Option<HandlerOutput>> {
        (**self).process_event(partition, state, event, tag)
    }

    fn process_partition_deleted(&mut self, partition: &str, state: &PartitionState) -> Result<Option<String>> {
        (**self).process_partition_deleted(partition, state)
    }

    fn transform_state_to_result(&self, state: &str) -> Result<Option<String>> {
        (**self).transform_state_to_result(state)
    }
}
