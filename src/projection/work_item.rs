//! Work items: one per subscription message or query, driven through the
//! five processing stages.

use tracing::trace;

use super::context::{ProcessingContext, StateUpdate};
use super::{ProjectionOutput, QueryId};
use crate::handler::StateHandler;
use crate::staged_queue::{NextStage, StageOutcome, StagedTask, TaskId};
use crate::tag::CheckpointTag;
use crate::types::{PartitionState, ReceivedEvent, ROOT_PARTITION};
use crate::{Error, Result};

// =============================================================================
// Stages
// =============================================================================

pub(crate) const RECORD_EVENT_ORDER: usize = 0;
pub(crate) const GET_STATE_PARTITION: usize = 1;
pub(crate) const LOAD: usize = 2;
pub(crate) const PROCESS: usize = 3;
pub(crate) const WRITE_OUTPUT: usize = 4;

/// Whether each stage is ordered.
pub(crate) fn stage_ordering() -> Vec<bool> {
    vec![true, true, false, false, true]
}

// =============================================================================
// Items
// =============================================================================

/// What a query asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryKind {
    State,
    Result,
}

#[derive(Debug)]
pub(crate) struct EventItem {
    event: ReceivedEvent,
    tag: CheckpointTag,
    progress: f32,
    partition: Option<String>,
    state: Option<PartitionState>,
    update: Option<StateUpdate>,
}

#[derive(Debug)]
pub(crate) enum WorkItem {
    CommittedEvent(Box<EventItem>),
    Progress {
        progress: f32,
    },
    CheckpointSuggested {
        tag: CheckpointTag,
        progress: f32,
    },
    /// The reader reached the end of its source.
    Completed,
    NotAuthorized,
    PartitionEof {
        partition: String,
        tag: CheckpointTag,
        state: Option<PartitionState>,
    },
    PartitionDeleted {
        partition: String,
        tag: CheckpointTag,
        state: Option<PartitionState>,
        update: Option<StateUpdate>,
    },
    Query {
        query_id: QueryId,
        kind: QueryKind,
        partition: String,
        state: Option<PartitionState>,
    },
}

impl WorkItem {
    pub fn committed_event(event: ReceivedEvent, tag: CheckpointTag, progress: f32) -> Self {
        WorkItem::CommittedEvent(Box::new(EventItem {
            event,
            tag,
            progress,
            partition: None,
            state: None,
            update: None,
        }))
    }

    pub fn partition_eof(partition: String, tag: CheckpointTag) -> Self {
        WorkItem::PartitionEof {
            partition,
            tag,
            state: None,
        }
    }

    pub fn partition_deleted(partition: String, tag: CheckpointTag) -> Self {
        WorkItem::PartitionDeleted {
            partition,
            tag,
            state: None,
            update: None,
        }
    }

    pub fn query(query_id: QueryId, kind: QueryKind, partition: String) -> Self {
        WorkItem::Query {
            query_id,
            kind,
            partition,
            state: None,
        }
    }

    /// Position the partition state is locked at; `None` for items that only
    /// read state.
    pub fn lock_at(&self) -> Option<CheckpointTag> {
        match self {
            WorkItem::CommittedEvent(item) => Some(item.tag.clone()),
            WorkItem::PartitionDeleted { tag, .. } => Some(tag.clone()),
            _ => None,
        }
    }

    /// Hands a loaded partition state to the item.
    pub fn state_loaded(&mut self, loaded: PartitionState) {
        match self {
            WorkItem::CommittedEvent(item) => item.state = Some(loaded),
            WorkItem::PartitionEof { state, .. }
            | WorkItem::PartitionDeleted { state, .. }
            | WorkItem::Query { state, .. } => *state = Some(loaded),
            _ => {}
        }
    }

    // =========================================================================
    // Stage Steps
    // =========================================================================

    fn record_event_order(&self) -> StageOutcome {
        match self {
            WorkItem::CommittedEvent(_) | WorkItem::PartitionEof { .. } | WorkItem::PartitionDeleted { .. } => {
                StageOutcome::to_stage(GET_STATE_PARTITION)
            }
            WorkItem::Query { .. } => StageOutcome::to_stage(LOAD),
            _ => StageOutcome::to_stage(WRITE_OUTPUT),
        }
    }

    fn get_state_partition<H: StateHandler>(&mut self, ctx: &mut ProcessingContext<H>) -> StageOutcome {
        if !ctx.running {
            return StageOutcome::complete();
        }
        match self {
            WorkItem::CommittedEvent(item) => match ctx.handler.partition_for(&item.event) {
                Ok(Some(partition)) => {
                    item.partition = Some(partition.clone());
                    StageOutcome::Ready {
                        next: NextStage::Stage(LOAD),
                        correlation: Some(partition),
                    }
                }
                Ok(None) => {
                    trace!(tag = %item.tag, "event not partitioned, skipped");
                    StageOutcome::to_stage(WRITE_OUTPUT)
                }
                Err(err) => {
                    ctx.handler_failed(&item.tag, err);
                    StageOutcome::complete()
                }
            },
            WorkItem::PartitionEof { partition, .. } | WorkItem::PartitionDeleted { partition, .. } => {
                StageOutcome::Ready {
                    next: NextStage::Stage(LOAD),
                    correlation: Some(partition.clone()),
                }
            }
            _ => StageOutcome::to_stage(LOAD),
        }
    }

    fn load<H: StateHandler>(&mut self, id: TaskId, ctx: &mut ProcessingContext<H>) -> Result<StageOutcome> {
        let loaded = match self {
            WorkItem::CommittedEvent(item) => {
                if !ctx.running {
                    return Ok(StageOutcome::complete());
                }
                let partition = item
                    .partition
                    .as_deref()
                    .ok_or_else(|| Error::InvalidState(format!("no partition selected for '{}'", item.tag)))?;
                ctx.begin_get_partition_state(id, partition, Some(&item.tag))?
            }
            WorkItem::PartitionDeleted { partition, tag, .. } => {
                if !ctx.running {
                    return Ok(StageOutcome::complete());
                }
                ctx.begin_get_partition_state(id, partition, Some(tag))?
            }
            WorkItem::PartitionEof { partition, .. } | WorkItem::Query { partition, .. } => {
                ctx.begin_get_partition_state(id, partition, None)?
            }
            _ => return Ok(StageOutcome::to_stage(WRITE_OUTPUT)),
        };
        match loaded {
            Some(state) => {
                self.state_loaded(state);
                Ok(StageOutcome::to_stage(PROCESS))
            }
            None => Ok(StageOutcome::Pending),
        }
    }

    fn process_state<H: StateHandler>(&mut self, ctx: &mut ProcessingContext<H>) -> Result<StageOutcome> {
        match self {
            WorkItem::CommittedEvent(item) => {
                if !ctx.running {
                    return Ok(StageOutcome::complete());
                }
                let (partition, old) = match (item.partition.clone(), item.state.take()) {
                    (Some(partition), Some(old)) => (partition, old),
                    _ => {
                        return Err(Error::InvalidState(format!(
                            "partition state for '{}' was not loaded",
                            item.tag
                        )))
                    }
                };
                let update = match run_handler(ctx, &partition, old, &item.event, &item.tag) {
                    Ok(update) => update,
                    Err(err) => {
                        ctx.handler_failed(&item.tag, err);
                        return Ok(StageOutcome::complete());
                    }
                };
                if !ctx.ensure_emit_allowed(&update.emitted) {
                    return Ok(StageOutcome::complete());
                }
                if update.is_changed() {
                    ctx.cache
                        .update_locked_partition_state(&update.partition, update.new.clone())?;
                }
                item.update = Some(update);
                Ok(StageOutcome::to_stage(WRITE_OUTPUT))
            }
            WorkItem::PartitionDeleted {
                partition,
                tag,
                state,
                update,
            } => {
                if !ctx.running {
                    return Ok(StageOutcome::complete());
                }
                let old = state
                    .take()
                    .ok_or_else(|| Error::InvalidState(format!("state of '{}' was not loaded", partition)))?;
                let replacement = match ctx.handler.process_partition_deleted(partition, &old) {
                    Ok(replacement) => replacement,
                    Err(err) => {
                        ctx.handler_failed(tag, err);
                        return Ok(StageOutcome::complete());
                    }
                };
                let new = match replacement.map(|s| ctx.new_state(&old, s, tag)).transpose() {
                    Ok(new) => new.unwrap_or_else(|| old.clone()),
                    Err(err) => {
                        ctx.handler_failed(tag, err);
                        return Ok(StageOutcome::complete());
                    }
                };
                if old.is_changed(&new) {
                    ctx.cache.update_locked_partition_state(partition, new.clone())?;
                }
                *update = Some(StateUpdate {
                    partition: partition.clone(),
                    old,
                    new,
                    emitted: Vec::new(),
                });
                Ok(StageOutcome::to_stage(WRITE_OUTPUT))
            }
            _ => Ok(StageOutcome::to_stage(WRITE_OUTPUT)),
        }
    }

    fn write_output<H: StateHandler>(&mut self, id: TaskId, ctx: &mut ProcessingContext<H>) -> Result<StageOutcome> {
        match self {
            WorkItem::CommittedEvent(item) => {
                if !ctx.running {
                    return Ok(StageOutcome::complete());
                }
                if let Some(update) = item.update.take() {
                    ctx.write_update(update, Some(item.event.event_link()), item.event.correlation_id())?;
                }
                ctx.manager.event_processed(item.tag.clone(), item.progress)?;
            }
            WorkItem::Progress { progress } => {
                if ctx.running {
                    ctx.manager.progress(*progress);
                }
            }
            WorkItem::CheckpointSuggested { tag, progress } => {
                if !ctx.running || ctx.parked_checkpoint.is_some() {
                    return Ok(StageOutcome::complete());
                }
                if !ctx.manager.checkpoint_suggested(tag.clone(), *progress, &mut ctx.fx)? {
                    ctx.parked_checkpoint = Some(id);
                    return Ok(StageOutcome::Pending);
                }
            }
            WorkItem::Completed => {
                if ctx.running {
                    ctx.eof_reached = true;
                }
            }
            WorkItem::NotAuthorized => {
                if ctx.running {
                    ctx.not_authorized = true;
                }
            }
            WorkItem::PartitionEof { partition, tag, state } => {
                let result = state.as_ref().and_then(|s| s.result.as_deref());
                if let (true, false, Some(result)) = (ctx.running, ctx.config.output_running_results, result) {
                    let events = ctx.results.result_updated(partition, Some(result), tag.clone());
                    ctx.manager.events_emitted(events, &mut ctx.fx)?;
                }
            }
            WorkItem::PartitionDeleted { tag, update, .. } => {
                if !ctx.running {
                    return Ok(StageOutcome::complete());
                }
                if let Some(update) = update.take() {
                    ctx.write_update(update, None, None)?;
                }
                let progress = ctx.manager.statistics().progress;
                ctx.manager.event_processed(tag.clone(), progress)?;
            }
            WorkItem::Query {
                query_id,
                kind,
                partition,
                state,
            } => {
                let position = ctx.manager.last_processed_event_position().cloned();
                let reply = match kind {
                    QueryKind::State => ProjectionOutput::StateReport {
                        query_id: *query_id,
                        partition: partition.clone(),
                        state: state.as_ref().map(|s| s.state.clone()).filter(|s| !s.is_empty()),
                        position,
                    },
                    QueryKind::Result => ProjectionOutput::ResultReport {
                        query_id: *query_id,
                        partition: partition.clone(),
                        result: state.as_ref().and_then(|s| s.result.clone()),
                        position,
                    },
                };
                ctx.replies.push(reply);
            }
        }
        Ok(StageOutcome::complete())
    }
}

impl<H: StateHandler> StagedTask<ProcessingContext<H>> for WorkItem {
    fn process(&mut self, stage: usize, id: TaskId, ctx: &mut ProcessingContext<H>) -> Result<StageOutcome> {
        match stage {
            RECORD_EVENT_ORDER => Ok(self.record_event_order()),
            GET_STATE_PARTITION => Ok(self.get_state_partition(ctx)),
            LOAD => self.load(id, ctx),
            PROCESS => self.process_state(ctx),
            WRITE_OUTPUT => self.write_output(id, ctx),
            other => Err(Error::InvalidState(format!("processing stage {} does not exist", other))),
        }
    }
}

/// Runs the handler for one event. Emitted events are stamped with the
/// event's tag.
fn run_handler<H: StateHandler>(
    ctx: &mut ProcessingContext<H>,
    partition: &str,
    old: PartitionState,
    event: &ReceivedEvent,
    tag: &CheckpointTag,
) -> Result<StateUpdate> {
    let mut emitted = Vec::new();
    if partition != ROOT_PARTITION && old.caused_by == ctx.zero {
        emitted.extend(ctx.handler.process_partition_created(partition, tag, event)?);
    }
    let new = match ctx.handler.process_event(partition, &old, event, tag)? {
        Some(output) => {
            emitted.extend(output.emitted);
            ctx.new_state(&old, output.state, tag)?
        }
        None => old.clone(),
    };
    for event in &mut emitted {
        event.caused_by_tag = tag.clone();
    }
    Ok(StateUpdate {
        partition: partition.to_string(),
        old,
        new,
        emitted,
    })
}
