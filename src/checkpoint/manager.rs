//! # Checkpoint Manager
//!
//! Tracks what the projection has processed and turns that into durable
//! checkpoints.
//!
//! ## Lifecycle
//!
//! ```text
//! initialize ─► start(tag) ─► event_processed* ─► checkpoint_suggested
//!                                  ▲                      │ start_checkpoint
//!                                  │                      ▼
//!                                  │           closing checkpoint flushes
//!                                  │                      │ ready_for_checkpoint
//!                                  │                      ▼
//!                                  └──── checkpoint_written ◄── writer
//! stopping ─► (final checkpoint) ─► CheckpointCompleted ─► stopped
//! ```
//!
//! Only one checkpoint is in flight at a time. Output emitted while a
//! checkpoint is closing goes to the next ("current") checkpoint, whose
//! streams start writing only once the closing one is durable.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::{
    CheckpointId, CheckpointReader, CheckpointWriter, Continuation, EmittedStreamConfig, Effects,
    PartitionStateLoader, PartitionStateUpdates, ProjectionCheckpoint, Signal,
};
use crate::backoff::RetryBackoff;
use crate::io::IoResponse;
use crate::staged_queue::TaskId;
use crate::tag::CheckpointTag;
use crate::tagger::{PositionTagger, PositionTracker};
use crate::types::{EmittedEvent, PartitionState, ProjectionNames, ProjectionVersion, ROOT_PARTITION};
use crate::{Error, Result};

/// Settings the manager takes from the projection configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointSettings {
    /// Persist checkpoints and partition states.
    pub checkpoints_enabled: bool,
    /// Maximum events per emitted-stream write.
    pub max_write_batch_length: usize,
    /// Retries after the first failed write.
    pub max_write_retries: u32,
    /// Backoff time unit.
    pub backoff_unit: Duration,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            checkpoints_enabled: true,
            max_write_batch_length: 500,
            max_write_retries: 12,
            backoff_unit: Duration::from_secs(1),
        }
    }
}

/// Counters exposed through projection statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointStatistics {
    /// Last processed position.
    pub position: Option<CheckpointTag>,
    /// Reader progress in percent, `-1` when unknown.
    pub progress: f32,
    /// Last durable checkpoint.
    pub last_checkpoint: Option<CheckpointTag>,
    /// Events processed since the last (re)start.
    pub events_processed_after_restart: u64,
    /// Events queued in the closing checkpoint.
    pub write_pending_events_before_checkpoint: usize,
    /// Events queued in the current checkpoint.
    pub write_pending_events_after_checkpoint: usize,
    /// Store reads in flight.
    pub reads_in_progress: usize,
    /// Store writes in flight.
    pub writes_in_progress: usize,
    /// `"Requested"` while a checkpoint is in flight.
    pub checkpoint_status: String,
}

/// Owns the checkpoint lifecycle of one projection. See the module docs.
#[derive(Debug)]
pub struct CheckpointManager {
    settings: CheckpointSettings,
    version: ProjectionVersion,
    tagger: Arc<dyn PositionTagger>,
    backoff: RetryBackoff,

    reader: CheckpointReader,
    writer: CheckpointWriter,
    loader: PartitionStateLoader,
    partition_updates: PartitionStateUpdates,

    next_checkpoint_id: CheckpointId,
    current: Option<ProjectionCheckpoint>,
    closing: Option<ProjectionCheckpoint>,

    last_processed: PositionTracker,
    last_completed: Option<CheckpointTag>,
    requested_position: Option<CheckpointTag>,
    requested_state: Option<PartitionState>,
    root_state: Option<PartitionState>,
    in_checkpoint: bool,
    progress: f32,
    events_processed_after_restart: u64,

    started: bool,
    stopping: bool,
    stopped: bool,
}

impl CheckpointManager {
    /// Creates a manager for projection `names`.
    pub fn new(
        names: ProjectionNames,
        version: ProjectionVersion,
        tagger: Arc<dyn PositionTagger>,
        settings: CheckpointSettings,
        mut backoff: RetryBackoff,
    ) -> Self {
        let checkpoint_stream = names.checkpoint_stream();
        let reader = CheckpointReader::new(
            checkpoint_stream.clone(),
            version,
            tagger.clone(),
            settings.checkpoints_enabled,
        );
        let writer = CheckpointWriter::new(checkpoint_stream, version, backoff.fork());
        Self {
            reader,
            writer,
            loader: PartitionStateLoader::new(names.clone(), version, tagger.clone()),
            partition_updates: PartitionStateUpdates::new(names),
            next_checkpoint_id: 1,
            current: None,
            closing: None,
            last_processed: PositionTracker::new(tagger.clone()),
            last_completed: None,
            requested_position: None,
            requested_state: None,
            root_state: None,
            in_checkpoint: false,
            progress: -1.0,
            events_processed_after_restart: 0,
            started: false,
            stopping: false,
            stopped: false,
            settings,
            version,
            tagger,
            backoff,
        }
    }

    /// Settings in use.
    pub fn settings(&self) -> &CheckpointSettings {
        &self.settings
    }

    /// Last processed position.
    pub fn last_processed_event_position(&self) -> Option<&CheckpointTag> {
        self.last_processed.last_tag()
    }

    /// Last durable checkpoint.
    pub fn last_completed_checkpoint_position(&self) -> Option<&CheckpointTag> {
        self.last_completed.as_ref()
    }

    /// Root partition state as of the last update.
    pub fn root_state(&self) -> Option<&PartitionState> {
        self.root_state.as_ref()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Drops every checkpoint, pending request and signal.
    pub fn initialize(&mut self, fx: &mut Effects) {
        self.drop_checkpoints(fx);
        fx.io.cancel_all();
        fx.clear_signals();
        self.reader.initialize();
        self.writer.initialize();
        self.partition_updates.clear();
        self.last_processed.initialize();
        self.last_completed = None;
        self.requested_position = None;
        self.requested_state = None;
        self.root_state = None;
        self.in_checkpoint = false;
        self.progress = -1.0;
        self.events_processed_after_restart = 0;
        self.started = false;
        self.stopping = false;
        self.stopped = false;
    }

    /// Starts loading the last checkpoint.
    pub fn begin_load_state(&mut self, fx: &mut Effects) -> Result<()> {
        self.reader.begin_load_state(fx)
    }

    /// Sets the checkpoint stream position the next write expects.
    pub fn start_writer_from(&mut self, event_number: i64) {
        self.writer.start_from(event_number);
    }

    /// Starts tracking from `checkpoint_tag`.
    pub fn start(&mut self, checkpoint_tag: CheckpointTag, root_state: PartitionState, fx: &mut Effects) -> Result<()> {
        if self.started {
            return Err(Error::InvalidState("checkpoint manager already started".to_string()));
        }
        self.last_processed.update_by_checkpoint_tag_initial(checkpoint_tag.clone())?;
        self.last_completed = Some(checkpoint_tag.clone());
        self.root_state = Some(root_state);
        self.requested_position = None;
        self.in_checkpoint = false;
        self.progress = -1.0;
        self.stopping = false;
        self.stopped = false;
        self.started = true;
        let mut current = self.new_checkpoint(checkpoint_tag.clone());
        current.start(fx)?;
        self.current = Some(current);
        debug!(tag = %checkpoint_tag, "checkpoint manager started");
        Ok(())
    }

    /// Writes a final checkpoint; [`Signal::CheckpointCompleted`] follows.
    pub fn stopping(&mut self, fx: &mut Effects) -> Result<()> {
        self.ensure_started()?;
        if self.stopping {
            return Err(Error::InvalidState("checkpoint manager already stopping".to_string()));
        }
        self.stopping = true;
        self.request_checkpoint_to_stop(fx)
    }

    /// Drops the checkpoints and their requests.
    pub fn stopped(&mut self, fx: &mut Effects) {
        self.drop_checkpoints(fx);
        fx.io.cancel_where(|k| !matches!(k, Continuation::LoadPartition { .. }));
        self.writer.initialize();
        self.reader.initialize();
        self.in_checkpoint = false;
        self.started = false;
        self.stopped = true;
    }

    // =========================================================================
    // Processing Notifications
    // =========================================================================

    /// Records a partition state change.
    pub fn state_updated(&mut self, partition: &str, old_state: &PartitionState, new_state: PartitionState) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.ensure_started()?;
        self.ensure_not_stopping()?;
        if partition == ROOT_PARTITION {
            self.root_state = Some(new_state);
        } else if self.settings.checkpoints_enabled {
            self.partition_updates
                .state_updated(partition, new_state, old_state.caused_by.clone());
        }
        Ok(())
    }

    /// Records that the event at `checkpoint_tag` was fully processed.
    pub fn event_processed(&mut self, checkpoint_tag: CheckpointTag, progress: f32) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.ensure_started()?;
        self.ensure_not_stopping()?;
        self.last_processed.update_by_checkpoint_tag_forward(checkpoint_tag)?;
        self.events_processed_after_restart += 1;
        self.progress = progress;
        Ok(())
    }

    /// Queues emitted events in the current checkpoint.
    pub fn events_emitted(&mut self, events: Vec<EmittedEvent>, fx: &mut Effects) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.ensure_started()?;
        self.ensure_not_stopping()?;
        if events.iter().any(|e| e.stream_id.is_empty()) {
            fx.fail("Cannot write to a null stream id");
            return Ok(());
        }
        self.current_mut()?.validate_order_and_emit_events(events, fx)
    }

    /// Updates reader progress.
    pub fn progress(&mut self, progress: f32) {
        if self.stopping || self.stopped {
            return;
        }
        self.progress = progress;
    }

    /// The reader suggests a checkpoint at `checkpoint_tag`. Returns `true`
    /// when there is nothing to wait for.
    pub fn checkpoint_suggested(&mut self, checkpoint_tag: CheckpointTag, progress: f32, fx: &mut Effects) -> Result<bool> {
        if !self.settings.checkpoints_enabled {
            return Err(Error::InvalidState("Checkpoints are not used".to_string()));
        }
        if self.stopped || self.stopping {
            return Ok(true);
        }
        self.ensure_started()?;
        if self.last_processed.last_tag() != Some(&checkpoint_tag) {
            self.last_processed.update_by_checkpoint_tag_forward(checkpoint_tag)?;
        }
        self.progress = progress;
        self.request_checkpoint(false, fx)
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    /// Every stream of checkpoint `checkpoint` is flushed.
    pub fn ready_for_checkpoint(&mut self, checkpoint: CheckpointId, fx: &mut Effects) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        if self.closing.as_ref().map(ProjectionCheckpoint::id) != Some(checkpoint) {
            debug!(checkpoint, "readiness of a stale checkpoint ignored");
            return Ok(());
        }
        let requested = self
            .requested_position
            .clone()
            .ok_or_else(|| Error::InvalidState("no checkpoint was requested".to_string()))?;
        if self.settings.checkpoints_enabled {
            let state = match &self.requested_state {
                Some(state) => state.serialize()?,
                None => "[]".to_string(),
            };
            self.writer.begin_write_checkpoint(requested, state, fx)
        } else {
            self.checkpoint_written(requested, fx)
        }
    }

    fn request_checkpoint_to_stop(&mut self, fx: &mut Effects) -> Result<()> {
        if self.in_checkpoint {
            return Ok(());
        }
        let needs_checkpoint = match (&self.last_completed, self.last_processed.last_tag()) {
            (Some(completed), Some(processed)) => completed.is_before(processed)?,
            _ => false,
        };
        if needs_checkpoint {
            self.request_checkpoint(true, fx)?;
        } else if let Some(completed) = self.last_completed.clone() {
            fx.signal(Signal::CheckpointCompleted(completed));
        }
        Ok(())
    }

    fn request_checkpoint(&mut self, force: bool, fx: &mut Effects) -> Result<bool> {
        if !force && !self.settings.checkpoints_enabled {
            return Err(Error::InvalidState("Checkpoints are not allowed".to_string()));
        }
        if self.in_checkpoint {
            return Err(Error::InvalidState("Checkpoint in progress".to_string()));
        }
        self.start_checkpoint(fx)
    }

    fn start_checkpoint(&mut self, fx: &mut Effects) -> Result<bool> {
        let requested = self
            .last_processed
            .last_tag()
            .cloned()
            .ok_or_else(|| Error::InvalidState("Initial position was not set".to_string()))?;
        if self.last_completed.as_ref() == Some(&requested) {
            return Ok(true);
        }
        if self.settings.checkpoints_enabled {
            let events = self.partition_updates.take_checkpoint_events()?;
            if !events.is_empty() {
                self.current_mut()?.validate_order_and_emit_events(events, fx)?;
            }
        }
        self.in_checkpoint = true;
        self.requested_position = Some(requested.clone());
        self.requested_state = self.root_state.clone();
        let next = self.new_checkpoint(requested.clone());
        let mut closing = self
            .current
            .replace(next)
            .ok_or_else(|| Error::InvalidState("no current checkpoint".to_string()))?;
        debug!(tag = %requested, checkpoint = closing.id(), "checkpoint started");
        closing.prepare(requested, fx)?;
        self.closing = Some(closing);
        Ok(false)
    }

    fn checkpoint_written(&mut self, position: CheckpointTag, fx: &mut Effects) -> Result<()> {
        let closing = self
            .closing
            .take()
            .ok_or_else(|| Error::InvalidState("no checkpoint is closing".to_string()))?;
        closing.dispose(fx);
        info!(tag = %position, "checkpoint completed");
        self.last_completed = Some(position.clone());
        self.requested_position = None;
        self.requested_state = None;
        self.in_checkpoint = false;
        self.current_mut()?.start(fx)?;
        if self.stopping {
            let behind = match self.last_processed.last_tag() {
                Some(processed) => position.is_before(processed)?,
                None => false,
            };
            if behind {
                debug!(tag = %position, "events processed while checkpointing, writing the final checkpoint");
                self.start_checkpoint(fx)?;
                return Ok(());
            }
        }
        fx.signal(Signal::CheckpointCompleted(position));
        Ok(())
    }

    // =========================================================================
    // Partition State Loading
    // =========================================================================

    /// Starts loading the state `partition` had before `at`; the answer
    /// arrives as [`Signal::PartitionLoaded`].
    pub fn begin_load_partition_state_at(&mut self, task: TaskId, partition: &str, at: CheckpointTag, fx: &mut Effects) {
        if self.settings.checkpoints_enabled {
            self.loader.begin(task, partition, at, fx);
        } else {
            fx.signal(Signal::PartitionLoaded {
                task,
                partition: partition.to_string(),
                state: PartitionState::empty(self.tagger.make_zero_checkpoint_tag()),
            });
        }
    }

    // =========================================================================
    // IO Routing
    // =========================================================================

    /// Routes a completed store request to its owner.
    pub fn handle_io(&mut self, continuation: Continuation, response: IoResponse, fx: &mut Effects) -> Result<()> {
        match &continuation {
            Continuation::ReadCheckpoint => self.reader.handle(response, fx),
            Continuation::WriteCheckpoint | Continuation::CheckpointRetry => {
                if self.stopped {
                    return Ok(());
                }
                match self.writer.handle(&continuation, response, fx)? {
                    Some(position) => self.checkpoint_written(position, fx),
                    None => Ok(()),
                }
            }
            Continuation::LoadPartition { .. } => self.loader.handle(continuation, response, fx),
            emitted => {
                let id = emitted.checkpoint();
                let owner = [self.current.as_mut(), self.closing.as_mut()]
                    .into_iter()
                    .flatten()
                    .find(|cp| Some(cp.id()) == id);
                match owner {
                    Some(checkpoint) => checkpoint.handle(&continuation, response, fx),
                    None => {
                        debug!(?continuation, "completion for a disposed checkpoint ignored");
                        Ok(())
                    }
                }
            }
        }
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Snapshot of the counters.
    pub fn statistics(&self) -> CheckpointStatistics {
        let before = self.closing.as_ref().map(ProjectionCheckpoint::pending_writes).unwrap_or(0);
        let after = self.current.as_ref().map(ProjectionCheckpoint::pending_writes).unwrap_or(0);
        let checkpoints = [self.current.as_ref(), self.closing.as_ref()];
        let reads = checkpoints
            .iter()
            .flatten()
            .map(|cp| cp.reads_in_progress())
            .sum::<usize>()
            + self.reader.reads_in_progress();
        let writes = checkpoints
            .iter()
            .flatten()
            .map(|cp| cp.writes_in_progress())
            .sum::<usize>()
            + self.writer.writes_in_progress();
        CheckpointStatistics {
            position: self.last_processed.last_tag().cloned(),
            progress: self.progress,
            last_checkpoint: self.last_completed.clone(),
            events_processed_after_restart: self.events_processed_after_restart,
            write_pending_events_before_checkpoint: before,
            write_pending_events_after_checkpoint: after,
            reads_in_progress: reads,
            writes_in_progress: writes,
            checkpoint_status: if self.in_checkpoint {
                "Requested".to_string()
            } else {
                String::new()
            },
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn new_checkpoint(&mut self, from: CheckpointTag) -> ProjectionCheckpoint {
        let id = self.next_checkpoint_id;
        self.next_checkpoint_id += 1;
        ProjectionCheckpoint::new(
            id,
            EmittedStreamConfig {
                version: self.version,
                tagger: self.tagger.clone(),
                from_checkpoint: from,
                max_write_batch_length: self.settings.max_write_batch_length,
                backoff: self.backoff.fork(),
            },
        )
    }

    fn current_mut(&mut self) -> Result<&mut ProjectionCheckpoint> {
        self.current
            .as_mut()
            .ok_or_else(|| Error::InvalidState("no current checkpoint".to_string()))
    }

    fn drop_checkpoints(&mut self, fx: &mut Effects) {
        if let Some(current) = self.current.take() {
            current.dispose(fx);
        }
        if let Some(closing) = self.closing.take() {
            closing.dispose(fx);
        }
    }

    fn ensure_started(&self) -> Result<()> {
        if !self.started {
            return Err(Error::InvalidState("checkpoint manager not started".to_string()));
        }
        Ok(())
    }

    fn ensure_not_stopping(&self) -> Result<()> {
        if self.stopping {
            return Err(Error::InvalidState("checkpoint manager is stopping".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::IoRequest;
    use crate::store::{ReadResult, WriteResult};
    use crate::tagger::TransactionFilePositionTagger;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn at(commit: i64) -> CheckpointTag {
        CheckpointTag::from_position(0, commit, commit)
    }

    fn manager(settings: CheckpointSettings) -> CheckpointManager {
        CheckpointManager::new(
            ProjectionNames::new("p"),
            ProjectionVersion::new(1, 0, 0),
            Arc::new(TransactionFilePositionTagger::new(0)),
            settings,
            RetryBackoff::new(Duration::from_millis(1), 3, StdRng::seed_from_u64(11)),
        )
    }

    fn started(settings: CheckpointSettings, fx: &mut Effects) -> CheckpointManager {
        let mut m = manager(settings);
        m.start(at(0), PartitionState::empty(at(0)), fx).unwrap();
        m
    }

    /// Answers store requests with empty streams and successful writes and
    /// feeds readiness back, the way the projection loop does.
    fn drive(m: &mut CheckpointManager, fx: &mut Effects) -> Vec<Signal> {
        let mut seen = Vec::new();
        loop {
            let mut progressed = false;
            for (id, request) in fx.io.take_outgoing() {
                progressed = true;
                let response = match request {
                    IoRequest::ReadBackward { .. } => IoResponse::Read(ReadResult::NoStream),
                    IoRequest::WriteEvents { .. } => {
                        IoResponse::Write(WriteResult::Success { first_event_number: 0 })
                    }
                    IoRequest::Delay { .. } => IoResponse::DelayElapsed,
                };
                if let Some((k, response)) = fx.io.complete(id, response) {
                    m.handle_io(k, response, fx).unwrap();
                }
            }
            while let Some(signal) = fx.next_signal() {
                progressed = true;
                if let Signal::ReadyForCheckpoint { checkpoint } = signal {
                    m.ready_for_checkpoint(checkpoint, fx).unwrap();
                }
                seen.push(signal);
            }
            if !progressed {
                return seen;
            }
        }
    }

    #[test]
    fn test_checkpoint_suggested_writes_checkpoint() {
        let mut fx = Effects::new();
        let mut m = started(CheckpointSettings::default(), &mut fx);
        m.event_processed(at(10), 50.0).unwrap();
        assert!(!m.checkpoint_suggested(at(10), 50.0, &mut fx).unwrap());
        assert_eq!(m.statistics().checkpoint_status, "Requested");

        let signals = drive(&mut m, &mut fx);
        assert!(signals.contains(&Signal::CheckpointCompleted(at(10))));
        assert_eq!(m.last_completed_checkpoint_position(), Some(&at(10)));
        assert_eq!(m.statistics().checkpoint_status, "");
    }

    #[test]
    fn test_checkpoint_at_last_completed_is_immediate() {
        let mut fx = Effects::new();
        let mut m = started(CheckpointSettings::default(), &mut fx);
        assert!(m.checkpoint_suggested(at(0), 0.0, &mut fx).unwrap());
        assert!(fx.io.take_outgoing().is_empty());
    }

    #[test]
    fn test_event_processed_must_move_forward() {
        let mut fx = Effects::new();
        let mut m = started(CheckpointSettings::default(), &mut fx);
        m.event_processed(at(10), 0.0).unwrap();
        assert!(matches!(m.event_processed(at(10), 0.0), Err(Error::OrderingViolation(_))));
        assert!(matches!(m.event_processed(at(5), 0.0), Err(Error::OrderingViolation(_))));
    }

    #[test]
    fn test_one_checkpoint_at_a_time() {
        let mut fx = Effects::new();
        let mut m = started(CheckpointSettings::default(), &mut fx);
        m.event_processed(at(10), 0.0).unwrap();
        m.checkpoint_suggested(at(10), 0.0, &mut fx).unwrap();
        m.event_processed(at(20), 0.0).unwrap();
        assert!(m.checkpoint_suggested(at(20), 0.0, &mut fx).is_err());
    }

    #[test]
    fn test_partition_checkpoints_emitted_at_checkpoint_start() {
        let mut fx = Effects::new();
        let mut m = started(CheckpointSettings::default(), &mut fx);
        let zero = TransactionFilePositionTagger::new(0).make_zero_checkpoint_tag();
        m.state_updated("a", &PartitionState::empty(zero), PartitionState::new("{}", None, at(10)))
            .unwrap();
        m.event_processed(at(10), 0.0).unwrap();
        m.checkpoint_suggested(at(10), 0.0, &mut fx).unwrap();

        let out = fx.io.take_outgoing();
        let [(_, IoRequest::ReadBackward { stream, .. })] = out.as_slice() else {
            panic!("expected a tail read: {:?}", out);
        };
        assert_eq!(stream, "$projections-p-a-checkpoint");
        assert_eq!(m.statistics().write_pending_events_before_checkpoint, 1);
    }

    #[test]
    fn test_emitting_to_empty_stream_fails() {
        let mut fx = Effects::new();
        let mut m = started(CheckpointSettings::default(), &mut fx);
        m.events_emitted(vec![EmittedEvent::new("", "X", None, at(5))], &mut fx)
            .unwrap();
        assert_eq!(fx.next_signal(), Some(Signal::Failed("Cannot write to a null stream id".to_string())));
    }

    #[test]
    fn test_stopping_writes_final_checkpoint() {
        let mut fx = Effects::new();
        let mut m = started(CheckpointSettings::default(), &mut fx);
        m.event_processed(at(10), 0.0).unwrap();
        m.stopping(&mut fx).unwrap();
        assert!(m.event_processed(at(20), 0.0).is_err());

        let signals = drive(&mut m, &mut fx);
        assert!(signals.contains(&Signal::CheckpointCompleted(at(10))));
    }

    #[test]
    fn test_stopping_during_checkpoint_writes_final_checkpoint() {
        let mut fx = Effects::new();
        let mut m = started(CheckpointSettings::default(), &mut fx);
        m.event_processed(at(10), 0.0).unwrap();
        m.checkpoint_suggested(at(10), 0.0, &mut fx).unwrap();
        m.event_processed(at(20), 0.0).unwrap();
        m.stopping(&mut fx).unwrap();

        let completed: Vec<CheckpointTag> = drive(&mut m, &mut fx)
            .into_iter()
            .filter_map(|s| match s {
                Signal::CheckpointCompleted(tag) => Some(tag),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec![at(20)]);
        assert_eq!(m.last_completed_checkpoint_position(), Some(&at(20)));
    }

    #[test]
    fn test_stopping_without_progress_completes_at_once() {
        let mut fx = Effects::new();
        let mut m = started(CheckpointSettings::default(), &mut fx);
        m.stopping(&mut fx).unwrap();
        assert_eq!(fx.next_signal(), Some(Signal::CheckpointCompleted(at(0))));
        assert!(fx.io.take_outgoing().is_empty());
    }

    #[test]
    fn test_disabled_checkpoints() {
        let settings = CheckpointSettings {
            checkpoints_enabled: false,
            ..CheckpointSettings::default()
        };
        let mut fx = Effects::new();
        let mut m = started(settings, &mut fx);
        assert!(m.checkpoint_suggested(at(1), 0.0, &mut fx).is_err());

        m.begin_load_partition_state_at(4, "a", at(5), &mut fx);
        assert!(matches!(fx.next_signal(), Some(Signal::PartitionLoaded { task: 4, .. })));

        // stopping still flushes emitted output, without a checkpoint record
        m.event_processed(at(10), 0.0).unwrap();
        m.stopping(&mut fx).unwrap();
        let signals = drive(&mut m, &mut fx);
        assert!(signals.contains(&Signal::CheckpointCompleted(at(10))));
    }

    #[test]
    fn test_start_twice_fails() {
        let mut fx = Effects::new();
        let mut m = started(CheckpointSettings::default(), &mut fx);
        assert!(m.start(at(0), PartitionState::empty(at(0)), &mut fx).is_err());
        m.stopped(&mut fx);
        m.initialize(&mut fx);
        m.start(at(0), PartitionState::empty(at(0)), &mut fx).unwrap();
    }
}
