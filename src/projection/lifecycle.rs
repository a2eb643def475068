//! The projection state machine. See the module docs of [`crate::projection`].

use std::collections::VecDeque;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, trace, warn};

use super::context::ProcessingContext;
use super::work_item::{stage_ordering, QueryKind, WorkItem, PROCESS};
use super::{ProjectionOutput, ProjectionState, ProjectionStatistics, ProjectionStatus, QueryId};
use crate::backoff::RetryBackoff;
use crate::checkpoint::{CheckpointManager, Continuation, Effects, Signal};
use crate::config::ProjectionConfig;
use crate::handler::StateHandler;
use crate::io::{IoRequest, IoResponse, RequestId};
use crate::partition_cache::PartitionStateCache;
use crate::processing_queue::{CoreProjectionQueue, ReadControl};
use crate::results::ResultEmitter;
use crate::staged_queue::NextStage;
use crate::subscription::{
    ReaderSubscription, SourceDefinition, SubscriptionId, SubscriptionMessage, SubscriptionMessageKind,
    SubscriptionOptions,
};
use crate::tag::CheckpointTag;
use crate::tagger::PositionTagger;
use crate::types::{PartitionState, ProjectionNames, ProjectionVersion, ROOT_PARTITION};
use crate::{Error, Result};

/// One projection: a handler, its source, and everything that keeps its
/// output consistent with its checkpoints.
///
/// # Example
///
/// ```ignore
/// let mut projection = CoreProjection::new("balances", version, source, handler, config);
/// projection.start()?;
/// loop {
///     for (id, request) in projection.take_io() {
///         let response = perform(&store, &request);
///         projection.handle_io(id, response);
///     }
///     for output in projection.take_outputs() {
///         // start readers, forward status, answer queries ...
///     }
/// }
/// ```
pub struct CoreProjection<H: StateHandler> {
    ctx: ProcessingContext<H>,
    queue: CoreProjectionQueue<WorkItem>,
    source: SourceDefinition,
    tagger: Arc<dyn PositionTagger>,
    state: ProjectionState,
    subscribe_on_load: bool,
    next_subscription_id: SubscriptionId,
    next_query_id: QueryId,
    outputs: VecDeque<ProjectionOutput>,
    tick_requested: bool,
    /// Reason to report once the faulted-stopping checkpoint is written.
    fault_after_stop: Option<String>,
    faulted_reason: Option<String>,
}

impl<H: StateHandler> CoreProjection<H> {
    /// Creates a projection with jittered write backoff.
    pub fn new(
        name: impl Into<String>,
        version: ProjectionVersion,
        source: SourceDefinition,
        handler: H,
        config: ProjectionConfig,
    ) -> Self {
        let backoff = RetryBackoff::from_entropy(config.backoff_unit, config.max_write_retries);
        Self::with_backoff(name, version, source, handler, config, backoff)
    }

    /// Creates a projection whose backoff draws from a fixed seed.
    pub fn with_seed(
        name: impl Into<String>,
        version: ProjectionVersion,
        source: SourceDefinition,
        handler: H,
        config: ProjectionConfig,
        seed: u64,
    ) -> Self {
        let backoff = RetryBackoff::new(config.backoff_unit, config.max_write_retries, StdRng::seed_from_u64(seed));
        Self::with_backoff(name, version, source, handler, config, backoff)
    }

    /// Creates a projection with the given write backoff.
    pub fn with_backoff(
        name: impl Into<String>,
        version: ProjectionVersion,
        source: SourceDefinition,
        handler: H,
        config: ProjectionConfig,
        backoff: RetryBackoff,
    ) -> Self {
        let names = ProjectionNames::new(name);
        let tagger = source.tagger(0);
        let zero = tagger.make_zero_checkpoint_tag();
        let manager = CheckpointManager::new(
            names.clone(),
            version,
            tagger.clone(),
            config.checkpoint_settings(),
            backoff,
        );
        let queue = CoreProjectionQueue::new(stage_ordering(), config.pending_events_threshold);
        let ctx = ProcessingContext {
            results: ResultEmitter::new(names.clone(), zero.clone()),
            cache: PartitionStateCache::new(config.max_cached_partitions),
            names,
            config,
            handler,
            zero,
            manager,
            fx: Effects::new(),
            running: false,
            parked_checkpoint: None,
            faulting: None,
            eof_reached: false,
            not_authorized: false,
            replies: Vec::new(),
        };
        Self {
            ctx,
            queue,
            source,
            tagger,
            state: ProjectionState::Initial,
            subscribe_on_load: false,
            next_subscription_id: 1,
            next_query_id: 1,
            outputs: VecDeque::new(),
            tick_requested: false,
            fault_after_stop: None,
            faulted_reason: None,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Projection name.
    pub fn name(&self) -> &str {
        self.ctx.names.name()
    }

    /// Lifecycle state.
    pub fn state(&self) -> ProjectionState {
        self.state
    }

    /// Configuration in use.
    pub fn config(&self) -> &ProjectionConfig {
        &self.ctx.config
    }

    /// Why the projection faulted.
    pub fn faulted_reason(&self) -> Option<&str> {
        self.faulted_reason.as_deref()
    }

    /// Store requests to perform. Answer each through [`handle_io`](Self::handle_io).
    pub fn take_io(&mut self) -> Vec<(RequestId, IoRequest)> {
        self.ctx.fx.io.take_outgoing()
    }

    /// Outputs produced since the last call.
    pub fn take_outputs(&mut self) -> Vec<ProjectionOutput> {
        self.outputs.drain(..).collect()
    }

    /// Snapshot of the projection's counters.
    pub fn statistics(&self) -> ProjectionStatistics {
        let checkpoint = self.ctx.manager.statistics();
        let partition_reads = self
            .ctx
            .fx
            .io
            .reads_in_flight(|k| matches!(k, Continuation::LoadPartition { .. }));
        ProjectionStatistics {
            name: self.name().to_string(),
            state: self.state,
            status: format!("{}{}", self.state, self.queue.status()),
            position: checkpoint.position,
            progress: checkpoint.progress,
            last_checkpoint: checkpoint.last_checkpoint,
            events_processed_after_restart: checkpoint.events_processed_after_restart,
            buffered_events: self.queue.buffered_count(),
            write_pending_events_before_checkpoint: checkpoint.write_pending_events_before_checkpoint,
            write_pending_events_after_checkpoint: checkpoint.write_pending_events_after_checkpoint,
            reads_in_progress: checkpoint.reads_in_progress + partition_reads,
            writes_in_progress: checkpoint.writes_in_progress,
            partitions_cached: self.ctx.cache.cached_item_count(),
            checkpoint_status: checkpoint.checkpoint_status,
            faulted_reason: self.faulted_reason.clone(),
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Loads the last checkpoint and starts processing.
    pub fn start(&mut self) -> Result<()> {
        self.begin_load(true)
    }

    /// Loads the last checkpoint without subscribing, so queries can be
    /// answered from stored state.
    pub fn load_stopped(&mut self) -> Result<()> {
        self.begin_load(false)
    }

    /// Writes a final checkpoint and stops.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            ProjectionState::Subscribed | ProjectionState::Running => {
                self.begin_stopping(ProjectionState::Stopping);
            }
            ProjectionState::Initial | ProjectionState::LoadStateRequested | ProjectionState::StateLoaded => {
                self.stopped(false);
            }
            ProjectionState::Stopping | ProjectionState::Stopped => {}
            other => {
                return Err(Error::InvalidState(format!(
                    "cannot stop the {} projection while it is {}",
                    self.name(),
                    other
                )))
            }
        }
        self.pump();
        Ok(())
    }

    /// Stops at once, without a final checkpoint.
    pub fn kill(&mut self) {
        if !matches!(self.state, ProjectionState::Initial | ProjectionState::Stopped) {
            warn!(projection = %self.name(), state = %self.state, "projection killed");
            self.stopped(false);
        }
    }

    /// Takes the projection off its worker without a final checkpoint.
    pub fn suspend(&mut self) {
        if self.state == ProjectionState::Suspended {
            return;
        }
        self.unsubscribe();
        self.ctx.running = false;
        self.complete_parked_checkpoint();
        self.ctx.manager.stopped(&mut self.ctx.fx);
        self.set_state(ProjectionState::Suspended);
        self.outputs.push_back(ProjectionOutput::Status(ProjectionStatus::Suspended));
    }

    /// Runs queued work after a [`ProjectionOutput::Tick`].
    pub fn tick(&mut self) {
        self.tick_requested = false;
        self.pump();
    }

    /// Answers a store request.
    pub fn handle_io(&mut self, id: RequestId, response: IoResponse) {
        let Some((continuation, response)) = self.ctx.fx.io.complete(id, response) else {
            return;
        };
        if let Err(err) = self
            .ctx
            .manager
            .handle_io(continuation, response, &mut self.ctx.fx)
        {
            self.set_faulted(err.to_string());
        }
        self.pump();
    }

    /// Queues a state query; a [`ProjectionOutput::StateReport`] answers it.
    pub fn get_state(&mut self, partition: impl Into<String>) -> QueryId {
        self.query(QueryKind::State, partition.into())
    }

    /// Queues a result query; a [`ProjectionOutput::ResultReport`] answers it.
    pub fn get_result(&mut self, partition: impl Into<String>) -> QueryId {
        self.query(QueryKind::Result, partition.into())
    }

    /// The reader of `subscription` failed; faults the projection if that
    /// reader is still current.
    pub fn reader_failed(&mut self, subscription: SubscriptionId, reason: impl Into<String>) {
        if self.queue.subscription() == Some(subscription) {
            self.set_faulted(reason.into());
        }
    }

    /// Feeds a message of the reader subscription.
    pub fn handle_subscription_message(&mut self, message: SubscriptionMessage) {
        if !self.state.is_subscribed() {
            trace!(%message, state = %self.state, "subscription message ignored");
            return;
        }
        match self.queue.accept(&message) {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                self.set_faulted(err.to_string());
                return;
            }
        }
        if self.state == ProjectionState::Subscribed {
            self.set_state(ProjectionState::Running);
        }
        let (item, tag, allow_current) = match message.kind {
            SubscriptionMessageKind::CommittedEvent { event, tag, progress } => {
                (WorkItem::committed_event(event, tag.clone(), progress), tag, false)
            }
            SubscriptionMessageKind::CheckpointSuggested { tag, progress } => {
                if !self.ctx.config.checkpoints_enabled {
                    return;
                }
                (WorkItem::CheckpointSuggested { tag: tag.clone(), progress }, tag, true)
            }
            SubscriptionMessageKind::Progress { tag, progress } => (WorkItem::Progress { progress }, tag, true),
            SubscriptionMessageKind::Eof { tag } => {
                self.unsubscribe();
                (WorkItem::Completed, tag, true)
            }
            SubscriptionMessageKind::PartitionEof { partition, tag } => {
                (WorkItem::partition_eof(partition, tag.clone()), tag, true)
            }
            SubscriptionMessageKind::PartitionDeleted { partition, tag } => {
                (WorkItem::partition_deleted(partition, tag.clone()), tag, true)
            }
            SubscriptionMessageKind::NotAuthorized { tag } => {
                self.unsubscribe();
                (WorkItem::NotAuthorized, tag, true)
            }
        };
        match self.queue.enqueue_task(item, tag, allow_current) {
            Ok((_, control)) => self.read_control(control),
            Err(err) => {
                self.set_faulted(err.to_string());
                return;
            }
        }
        self.pump();
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    fn begin_load(&mut self, subscribe: bool) -> Result<()> {
        match self.state {
            ProjectionState::Initial
            | ProjectionState::Stopped
            | ProjectionState::Faulted
            | ProjectionState::PhaseCompleted
            | ProjectionState::Suspended => {}
            other => {
                return Err(Error::InvalidState(format!(
                    "cannot start the {} projection while it is {}",
                    self.name(),
                    other
                )))
            }
        }
        self.subscribe_on_load = subscribe;
        self.enter_initial();
        self.set_state(ProjectionState::LoadStateRequested);
        if let Err(err) = self.ctx.manager.begin_load_state(&mut self.ctx.fx) {
            self.set_faulted(err.to_string());
        }
        self.pump();
        Ok(())
    }

    fn enter_initial(&mut self) {
        self.unsubscribe();
        self.ctx.reset();
        self.queue.initialize(self.ctx.zero.clone());
        self.tick_requested = false;
        self.fault_after_stop = None;
        self.faulted_reason = None;
        self.set_state(ProjectionState::Initial);
    }

    fn state_loaded(&mut self, tag: Option<CheckpointTag>, data: Option<String>, event_number: i64) -> Result<()> {
        self.ctx.manager.start_writer_from(event_number);
        let position = tag.unwrap_or_else(|| self.ctx.zero.clone());
        let root = PartitionState::deserialize(data.as_deref(), position.clone())?;
        self.ctx
            .cache
            .cache_and_lock_partition_state(ROOT_PARTITION, root.clone(), None)?;
        self.queue.initialize(position.clone());
        self.set_state(ProjectionState::StateLoaded);
        self.ctx
            .manager
            .start(position.clone(), root, &mut self.ctx.fx)?;
        if !self.subscribe_on_load {
            self.stopped(false);
            return Ok(());
        }
        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        let subscription = ReaderSubscription::new(
            id,
            self.source.clone(),
            self.tagger.clone(),
            position.clone(),
            SubscriptionOptions::from_config(&self.ctx.config),
        )?;
        self.queue.subscribed(id);
        self.outputs.push_back(ProjectionOutput::Subscribe(subscription));
        self.ctx.running = true;
        self.set_state(ProjectionState::Subscribed);
        info!(projection = %self.name(), from = %position, "projection started");
        self.outputs.push_back(ProjectionOutput::Status(ProjectionStatus::Started));
        Ok(())
    }

    /// Stops reading and writes the final checkpoint; `next` is the state to
    /// wait in.
    fn begin_stopping(&mut self, next: ProjectionState) {
        self.unsubscribe();
        self.ctx.running = false;
        self.set_state(next);
        if let Err(err) = self.ctx.manager.stopping(&mut self.ctx.fx) {
            let reason = self.fault_after_stop.take().unwrap_or_else(|| err.to_string());
            self.set_faulted(reason);
        }
    }

    fn stopped(&mut self, completed: bool) {
        self.unsubscribe();
        self.ctx.running = false;
        self.complete_parked_checkpoint();
        self.ctx.manager.stopped(&mut self.ctx.fx);
        if completed {
            self.set_state(ProjectionState::PhaseCompleted);
        }
        self.set_state(ProjectionState::Stopped);
        info!(projection = %self.name(), completed, "projection stopped");
        self.outputs
            .push_back(ProjectionOutput::Status(ProjectionStatus::Stopped { completed }));
    }

    fn set_faulted(&mut self, reason: String) {
        if self.state == ProjectionState::Faulted {
            debug!(projection = %self.name(), %reason, "further failure of a faulted projection");
            return;
        }
        error!(projection = %self.name(), %reason, "projection faulted");
        self.unsubscribe();
        self.ctx.running = false;
        self.complete_parked_checkpoint();
        self.ctx.manager.stopped(&mut self.ctx.fx);
        self.fault_after_stop = None;
        self.faulted_reason = Some(reason.clone());
        self.set_state(ProjectionState::Faulted);
        self.outputs
            .push_back(ProjectionOutput::Status(ProjectionStatus::Faulted { reason }));
    }

    fn set_state(&mut self, state: ProjectionState) {
        if self.state != state {
            debug!(projection = %self.name(), from = %self.state, to = %state, "projection state changed");
            self.state = state;
        }
    }

    fn unsubscribe(&mut self) {
        if let Some(subscription) = self.queue.subscription() {
            self.queue.unsubscribed();
            self.outputs
                .push_back(ProjectionOutput::Unsubscribe { subscription });
        }
    }

    fn read_control(&mut self, control: Option<ReadControl>) {
        if let (Some(control), Some(subscription)) = (control, self.queue.subscription()) {
            self.outputs
                .push_back(ProjectionOutput::ReadControl { subscription, control });
        }
    }

    fn complete_parked_checkpoint(&mut self) {
        if let Some(id) = self.ctx.parked_checkpoint.take() {
            if let Err(err) = self.queue.complete(id, NextStage::Complete) {
                warn!(projection = %self.name(), %err, "parked checkpoint request could not be completed");
            }
        }
    }

    fn query(&mut self, kind: QueryKind, partition: String) -> QueryId {
        let query_id = self.next_query_id;
        self.next_query_id += 1;
        if self.state.has_position() {
            let item = WorkItem::query(query_id, kind, partition.clone());
            match self.queue.enqueue_out_of_order(item, partition.clone()) {
                Ok(_) => {
                    self.pump();
                    return query_id;
                }
                Err(err) => warn!(projection = %self.name(), %err, "query answered without state"),
            }
        }
        let reply = match kind {
            QueryKind::State => ProjectionOutput::StateReport {
                query_id,
                partition,
                state: None,
                position: None,
            },
            QueryKind::Result => ProjectionOutput::ResultReport {
                query_id,
                partition,
                result: None,
                position: None,
            },
        };
        self.outputs.push_back(reply);
        query_id
    }

    // =========================================================================
    // Signals
    // =========================================================================

    fn handle_signal(&mut self, signal: Signal) -> Result<()> {
        match signal {
            Signal::CheckpointLoaded {
                tag,
                data,
                event_number,
            } => {
                if self.state != ProjectionState::LoadStateRequested {
                    debug!(state = %self.state, "late checkpoint load ignored");
                    return Ok(());
                }
                self.state_loaded(tag, data, event_number)
            }
            Signal::PartitionLoaded { task, partition, state } => self.partition_loaded(task, partition, state),
            Signal::ReadyForCheckpoint { checkpoint } => {
                self.ctx.manager.ready_for_checkpoint(checkpoint, &mut self.ctx.fx)
            }
            Signal::CheckpointCompleted(tag) => {
                self.complete_parked_checkpoint();
                self.ctx.cache.unlock(tag, false)?;
                match self.state {
                    ProjectionState::Stopping => self.stopped(false),
                    ProjectionState::CompletingPhase => self.stopped(true),
                    ProjectionState::FaultedStopping => {
                        let reason = self.fault_after_stop.take().unwrap_or_default();
                        self.set_faulted(reason);
                    }
                    _ => {}
                }
                Ok(())
            }
            Signal::RestartRequested(reason) => {
                if self.state.is_subscribed() {
                    info!(projection = %self.name(), %reason, "restarting projection");
                    let subscribe = self.subscribe_on_load;
                    self.enter_initial();
                    self.subscribe_on_load = subscribe;
                    self.set_state(ProjectionState::LoadStateRequested);
                    self.ctx.manager.begin_load_state(&mut self.ctx.fx)
                } else {
                    self.set_faulted(reason);
                    Ok(())
                }
            }
            Signal::Failed(reason) => {
                self.set_faulted(reason);
                Ok(())
            }
        }
    }

    fn partition_loaded(&mut self, task: u64, partition: String, state: PartitionState) -> Result<()> {
        let Some(lock_at) = self.queue.task_mut(task).map(|item| item.lock_at()) else {
            debug!(task, %partition, "partition state for a dropped work item ignored");
            return Ok(());
        };
        match lock_at {
            Some(at) if self.ctx.running => {
                self.ctx
                    .cache
                    .cache_and_lock_partition_state(&partition, state.clone(), Some(at))?;
            }
            _ => {
                if self.ctx.cache.try_get_unlocked_partition_state(&partition).is_none() {
                    self.ctx.cache.cache_partition_state(&partition, state.clone())?;
                }
            }
        }
        if let Some(item) = self.queue.task_mut(task) {
            item.state_loaded(state);
        }
        self.queue.complete(task, NextStage::Stage(PROCESS))
    }

    // =========================================================================
    // Driving
    // =========================================================================

    /// Reacts to signals and runs queued work until nothing moves or the
    /// batch budget is spent.
    fn pump(&mut self) {
        let mut budget = self.ctx.config.process_batch_size.max(1);
        loop {
            let mut progressed = self.drain_signals();
            if budget > 0 && self.state.has_position() {
                match self.queue.process(budget, &mut self.ctx) {
                    Ok((steps, control)) => {
                        budget = budget.saturating_sub(steps);
                        progressed |= steps > 0;
                        self.read_control(control);
                    }
                    Err(err) => {
                        self.set_faulted(err.to_string());
                        progressed = true;
                    }
                }
            }
            progressed |= self.apply_context_flags();
            if !progressed {
                break;
            }
        }
        if budget == 0 && self.queue.buffered_count() > 0 && !self.tick_requested {
            self.tick_requested = true;
            self.outputs.push_back(ProjectionOutput::Tick);
        }
    }

    fn drain_signals(&mut self) -> bool {
        let mut any = false;
        while let Some(signal) = self.ctx.fx.next_signal() {
            any = true;
            if let Err(err) = self.handle_signal(signal) {
                self.set_faulted(err.to_string());
            }
        }
        any
    }

    /// Acts on what work items recorded in the context.
    fn apply_context_flags(&mut self) -> bool {
        self.outputs.extend(self.ctx.replies.drain(..));
        let mut changed = false;
        if let Some(reason) = self.ctx.faulting.take() {
            changed = true;
            if self.state.is_subscribed() {
                self.fault_after_stop = Some(reason);
                self.begin_stopping(ProjectionState::FaultedStopping);
            } else {
                self.set_faulted(reason);
            }
        }
        if std::mem::take(&mut self.ctx.not_authorized) {
            changed = true;
            if self.state.is_subscribed() {
                warn!(projection = %self.name(), "reading the source is not authorized, stopping");
                self.begin_stopping(ProjectionState::Stopping);
            }
        }
        if std::mem::take(&mut self.ctx.eof_reached) {
            changed = true;
            if self.state == ProjectionState::Running && self.ctx.config.stop_on_eof {
                info!(projection = %self.name(), "end of source reached, completing");
                self.begin_stopping(ProjectionState::CompletingPhase);
            }
        }
        changed
    }
}
