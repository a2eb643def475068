//! Everything a work item may touch while it runs a stage.
//!
//! The processing queue owns the work items and lends them this context, so
//! an item can reach the handler, the cache and the checkpoint manager
//! without borrowing the projection that owns the queue.

use tracing::{debug, error};

use super::ProjectionOutput;
use crate::checkpoint::{CheckpointManager, Effects};
use crate::config::ProjectionConfig;
use crate::handler::StateHandler;
use crate::partition_cache::PartitionStateCache;
use crate::results::ResultEmitter;
use crate::staged_queue::TaskId;
use crate::tag::CheckpointTag;
use crate::types::{EmittedEvent, PartitionState, ProjectionNames, ROOT_PARTITION};
use crate::{Error, Result};

/// A state change produced by the process stage and written by the write
/// stage.
#[derive(Debug, Clone)]
pub(crate) struct StateUpdate {
    pub partition: String,
    pub old: PartitionState,
    /// Equal to `old` when the handler left the state as it was.
    pub new: PartitionState,
    pub emitted: Vec<EmittedEvent>,
}

impl StateUpdate {
    pub fn is_changed(&self) -> bool {
        self.old.is_changed(&self.new)
    }
}

/// Shared state of one projection run. See the module docs.
pub(crate) struct ProcessingContext<H> {
    pub names: ProjectionNames,
    pub config: ProjectionConfig,
    pub handler: H,
    pub zero: CheckpointTag,
    pub manager: CheckpointManager,
    pub cache: PartitionStateCache,
    pub results: ResultEmitter,
    pub fx: Effects,

    /// Items finalize only while this is set.
    pub running: bool,
    /// Checkpoint-suggested item waiting for its checkpoint.
    pub parked_checkpoint: Option<TaskId>,
    /// Set by a handler failure; the projection writes what it has and faults.
    pub faulting: Option<String>,
    pub eof_reached: bool,
    pub not_authorized: bool,
    pub replies: Vec<ProjectionOutput>,
}

impl<H: StateHandler> ProcessingContext<H> {
    /// Forgets everything of the previous run.
    pub fn reset(&mut self) {
        self.cache.initialize();
        self.manager.initialize(&mut self.fx);
        self.running = false;
        self.parked_checkpoint = None;
        self.faulting = None;
        self.eof_reached = false;
        self.not_authorized = false;
    }

    /// Returns the state of `partition` if it is cached, or starts loading it
    /// and returns `None`; the state then arrives as a partition-loaded signal.
    ///
    /// `lock_at` locks the state for an update at that position. Without it
    /// the state is only read.
    pub fn begin_get_partition_state(
        &mut self,
        task: TaskId,
        partition: &str,
        lock_at: Option<&CheckpointTag>,
    ) -> Result<Option<PartitionState>> {
        if partition == ROOT_PARTITION {
            return Ok(Some(self.cache.get_locked_partition_state(ROOT_PARTITION)?.clone()));
        }
        let cached = match lock_at {
            Some(at) => self.cache.try_get_and_lock_partition_state(partition, at.clone())?,
            None => self.cache.try_get_unlocked_partition_state(partition).cloned(),
        };
        if cached.is_some() {
            return Ok(cached);
        }
        let at = match lock_at {
            Some(at) => at.clone(),
            None => self.query_position(),
        };
        debug!(partition, task, "loading partition state");
        self.manager.begin_load_partition_state_at(task, partition, at, &mut self.fx);
        Ok(None)
    }

    /// A position after everything this run can process, for loading the
    /// newest stored state of a partition.
    fn query_position(&self) -> CheckpointTag {
        CheckpointTag::from_phase(self.zero.phase() + 1, false)
    }

    /// Records a handler failure. Later items are skipped.
    pub fn handler_failed(&mut self, tag: &CheckpointTag, err: Error) {
        let reason = format!(
            "The {} projection failed to process an event.\nEvent Position: {}\n\nMessage:\n\n{}",
            self.names.name(),
            tag,
            err
        );
        self.fail_processing(reason);
    }

    /// Records a failure that ends processing but keeps what was done.
    pub fn fail_processing(&mut self, reason: String) {
        if self.faulting.is_none() {
            error!(projection = %self.names.name(), reason = %reason, "projection processing failed");
            self.faulting = Some(reason);
        }
        self.running = false;
    }

    /// Handler emits are only allowed when the configuration enables them.
    pub fn ensure_emit_allowed(&mut self, emitted: &[EmittedEvent]) -> bool {
        if emitted.is_empty() || self.config.emit_events_enabled {
            return true;
        }
        self.fail_processing("'emit' is not allowed by the projection/configuration/mode".to_string());
        false
    }

    /// Writes the output of a processed state change.
    ///
    /// Output order: catalog entry, handler emits, running results.
    pub fn write_update(
        &mut self,
        update: StateUpdate,
        caused_by: Option<String>,
        correlation_id: Option<String>,
    ) -> Result<()> {
        let changed = update.is_changed();
        let mut events = Vec::new();
        if changed && self.config.emit_partition_catalog {
            events.extend(
                self.results
                    .partition_created(&update.partition, &update.old, &update.new),
            );
        }
        events.extend(update.emitted.into_iter().map(|mut event| {
            event.caused_by = event.caused_by.or_else(|| caused_by.clone());
            event.correlation_id = event.correlation_id.or_else(|| correlation_id.clone());
            event
        }));
        if changed && self.config.output_running_results {
            events.extend(
                self.results
                    .running_results(&update.partition, &update.old, &update.new),
            );
        }
        if !events.is_empty() {
            self.manager.events_emitted(events, &mut self.fx)?;
        }
        if changed {
            self.manager
                .state_updated(&update.partition, &update.old, update.new)?;
        }
        Ok(())
    }

    /// State replacing `old` when the handler returns `state` at `tag`.
    pub fn new_state(&self, old: &PartitionState, state: String, tag: &CheckpointTag) -> Result<PartitionState> {
        if state == old.state {
            return Ok(old.clone());
        }
        let result = self.handler.transform_state_to_result(&state)?;
        Ok(PartitionState::new(state, result, tag.clone()))
    }
}
