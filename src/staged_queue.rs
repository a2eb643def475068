//! # Staged Processing Queue
//!
//! A pipeline of numbered stages that work items move through. Each stage is
//! either **ordered** or **unordered**:
//!
//! | Stage kind | Start order | Completion order |
//! |------------|-------------|------------------|
//! | Ordered    | enqueue order | any |
//! | Unordered  | arrival order at the stage | any |
//!
//! An item in an ordered stage cannot start until every item enqueued before
//! it has started that stage (or skipped it). Unordered stages start items as
//! they arrive, but the head of the stage blocks the rest.
//!
//! ## Correlation
//!
//! Items may carry a correlation id (the projection uses the partition name).
//! An item whose correlation predecessor has not completed cannot start any
//! stage. The id is either supplied at enqueue time or attached when the item
//! completes an ordered stage, and it can be attached only once.
//!
//! ```text
//! stage:      0 (ordered)   1 (unordered)   2 (ordered)
//!             ┌────────┐    ┌────────┐      ┌────────┐
//! enqueue ──► │ t3 t2  │──► │   t1   │ ───► │        │ ──► done
//!             └────────┘    └────────┘      └────────┘
//! ```
//!
//! ## Async Steps
//!
//! A step either finishes immediately ([`StageOutcome::Ready`]) or is left
//! in flight ([`StageOutcome::Pending`]) and finished later through
//! [`StagedProcessingQueue::complete`]. [`StagedProcessingQueue::process`]
//! stops once `max` steps it started are in flight.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;

use crate::{Error, Result};

/// Identifier of a queued item, unique for the queue's lifetime.
pub type TaskId = u64;

/// Where an item goes after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStage {
    /// Move to this (later) stage.
    Stage(usize),
    /// Leave the queue.
    Complete,
}

/// Result of running one stage of an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The step finished.
    Ready {
        /// Next stage.
        next: NextStage,
        /// Correlation id to attach (ordered stages only).
        correlation: Option<String>,
    },
    /// The step continues asynchronously.
    Pending,
}

impl StageOutcome {
    /// Finished, moving to `stage`.
    pub fn to_stage(stage: usize) -> Self {
        StageOutcome::Ready {
            next: NextStage::Stage(stage),
            correlation: None,
        }
    }

    /// Finished, leaving the queue.
    pub fn complete() -> Self {
        StageOutcome::Ready {
            next: NextStage::Complete,
            correlation: None,
        }
    }
}

/// An item that can be driven through the queue's stages.
///
/// `C` is the context handed to every step, which lets items reach the
/// component that owns the queue without borrowing it.
pub trait StagedTask<C> {
    /// Runs `stage` of this item.
    fn process(&mut self, stage: usize, id: TaskId, ctx: &mut C) -> Result<StageOutcome>;
}

struct Entry<T> {
    task: T,
    stage: usize,
    busy: bool,
    correlation: Option<String>,
    prev_by_correlation: Option<TaskId>,
    next_by_correlation: Option<TaskId>,
}

/// Multi-stage work queue. See the module docs.
pub struct StagedProcessingQueue<T> {
    ordered: Vec<bool>,
    entries: BTreeMap<TaskId, Entry<T>>,
    next_id: TaskId,
    /// Ordered stages: last item that started the stage.
    cursors: Vec<Option<TaskId>>,
    /// Unordered stages: items waiting to start the stage.
    waiting: Vec<VecDeque<TaskId>>,
    correlation_last: HashMap<String, TaskId>,
}

impl<T> StagedProcessingQueue<T> {
    /// Creates a queue; `ordered[i]` tells whether stage `i` is ordered.
    pub fn new(ordered: Vec<bool>) -> Self {
        let stages = ordered.len();
        Self {
            ordered,
            entries: BTreeMap::new(),
            next_id: 1,
            cursors: vec![None; stages],
            waiting: vec![VecDeque::new(); stages],
            correlation_last: HashMap::new(),
        }
    }

    /// Number of items in the queue.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// `true` when no item is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stage an item is at (running or waiting to run).
    pub fn stage_of(&self, id: TaskId) -> Option<usize> {
        self.entries.get(&id).map(|e| e.stage)
    }

    /// Mutable access to a queued item.
    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut T> {
        self.entries.get_mut(&id).map(|e| &mut e.task)
    }

    /// Queued items in enqueue order.
    pub fn tasks(&self) -> impl Iterator<Item = (TaskId, &T)> {
        self.entries.iter().map(|(id, e)| (*id, &e.task))
    }

    /// Drops every item and resets stage bookkeeping.
    pub fn initialize(&mut self) {
        self.entries.clear();
        self.cursors.iter_mut().for_each(|c| *c = None);
        self.waiting.iter_mut().for_each(VecDeque::clear);
        self.correlation_last.clear();
    }

    /// Finishes an in-flight step.
    pub fn complete(&mut self, id: TaskId, next: NextStage, correlation: Option<String>) -> Result<()> {
        let busy = self.entries.get(&id).map(|e| e.busy);
        if busy != Some(true) {
            return Err(Error::InvalidState(format!("work item {} has no step in progress", id)));
        }
        self.advance(id, next, correlation)
    }

    fn stage_count(&self) -> usize {
        self.ordered.len()
    }

    fn next_runnable(&self) -> Option<(TaskId, usize)> {
        (0..self.stage_count())
            .rev()
            .find_map(|stage| self.runnable_at(stage).map(|id| (id, stage)))
    }

    fn runnable_at(&self, stage: usize) -> Option<TaskId> {
        if self.ordered[stage] {
            let from = match self.cursors[stage] {
                Some(last) => Bound::Excluded(last),
                None => Bound::Unbounded,
            };
            for (id, entry) in self.entries.range((from, Bound::Unbounded)) {
                if entry.stage > stage {
                    continue;
                }
                if entry.stage < stage || entry.busy || entry.prev_by_correlation.is_some() {
                    return None;
                }
                return Some(*id);
            }
            None
        } else {
            let id = *self.waiting[stage].front()?;
            let entry = self.entries.get(&id)?;
            (entry.prev_by_correlation.is_none() && !entry.busy).then_some(id)
        }
    }

    fn start(&mut self, id: TaskId, stage: usize) {
        if self.ordered[stage] {
            self.cursors[stage] = Some(id);
        } else if self.waiting[stage].front() == Some(&id) {
            self.waiting[stage].pop_front();
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.busy = true;
        }
    }

    fn advance(&mut self, id: TaskId, next: NextStage, correlation: Option<String>) -> Result<()> {
        let stage = {
            let entry = self
                .entries
                .get_mut(&id)
                .ok_or_else(|| Error::InvalidState(format!("work item {} is not queued", id)))?;
            entry.busy = false;
            entry.stage
        };
        if let Some(correlation) = correlation {
            if !self.ordered[stage] {
                return Err(Error::InvalidState(format!(
                    "work item {} tried to set its correlation id in unordered stage {}",
                    id, stage
                )));
            }
            self.link_correlation(id, correlation)?;
        }
        match next {
            NextStage::Complete => {
                self.remove(id);
                Ok(())
            }
            NextStage::Stage(next_stage) => {
                if next_stage <= stage || next_stage >= self.stage_count() {
                    return Err(Error::InvalidState(format!(
                        "work item {} cannot move from stage {} to stage {}",
                        id, stage, next_stage
                    )));
                }
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.stage = next_stage;
                }
                if !self.ordered[next_stage] {
                    self.waiting[next_stage].push_back(id);
                }
                Ok(())
            }
        }
    }

    fn link_correlation(&mut self, id: TaskId, correlation: String) -> Result<()> {
        let previous = self
            .correlation_last
            .get(&correlation)
            .copied()
            .filter(|last| *last != id && self.entries.contains_key(last));
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| Error::InvalidState(format!("work item {} is not queued", id)))?;
        if let Some(existing) = &entry.correlation {
            return Err(Error::InvalidState(format!(
                "work item {} already has correlation id '{}'",
                id, existing
            )));
        }
        entry.correlation = Some(correlation.clone());
        entry.prev_by_correlation = previous;
        if let Some(previous) = previous.and_then(|p| self.entries.get_mut(&p)) {
            previous.next_by_correlation = Some(id);
        }
        self.correlation_last.insert(correlation, id);
        Ok(())
    }

    fn remove(&mut self, id: TaskId) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        if let Some(prev) = entry.prev_by_correlation.and_then(|p| self.entries.get_mut(&p)) {
            prev.next_by_correlation = entry.next_by_correlation;
        }
        if let Some(next) = entry.next_by_correlation.and_then(|n| self.entries.get_mut(&n)) {
            next.prev_by_correlation = entry.prev_by_correlation;
        }
        if let Some(correlation) = entry.correlation {
            if self.correlation_last.get(&correlation) == Some(&id) {
                match entry.prev_by_correlation {
                    Some(prev) => {
                        self.correlation_last.insert(correlation, prev);
                    }
                    None => {
                        self.correlation_last.remove(&correlation);
                    }
                }
            }
        }
    }
}

impl<T> StagedProcessingQueue<T> {
    /// Adds an item at stage 0 and returns its id.
    pub fn enqueue(&mut self, task: T) -> TaskId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                task,
                stage: 0,
                busy: false,
                correlation: None,
                prev_by_correlation: None,
                next_by_correlation: None,
            },
        );
        if self.stage_count() > 0 && !self.ordered[0] {
            self.waiting[0].push_back(id);
        }
        id
    }

    /// Adds an item that already belongs to a correlation group.
    pub fn enqueue_correlated(&mut self, task: T, correlation: String) -> Result<TaskId> {
        let id = self.enqueue(task);
        self.link_correlation(id, correlation)?;
        Ok(id)
    }

    /// Runs steps until nothing can start or `max` started steps are in
    /// flight. Returns the number of steps run.
    pub fn process<C>(&mut self, max: usize, ctx: &mut C) -> Result<usize>
    where
        T: StagedTask<C>,
    {
        self.process_bounded(max, usize::MAX, ctx)
    }

    /// Like [`process`](Self::process), but also stops after `max_steps`
    /// steps.
    pub fn process_bounded<C>(&mut self, max: usize, max_steps: usize, ctx: &mut C) -> Result<usize>
    where
        T: StagedTask<C>,
    {
        let mut steps = 0;
        let mut in_flight = 0;
        while in_flight < max && steps < max_steps {
            let Some((id, stage)) = self.next_runnable() else {
                break;
            };
            self.start(id, stage);
            let entry = self
                .entries
                .get_mut(&id)
                .ok_or_else(|| Error::InvalidState(format!("work item {} vanished", id)))?;
            let outcome = entry.task.process(stage, id, ctx)?;
            steps += 1;
            match outcome {
                StageOutcome::Ready { next, correlation } => self.advance(id, next, correlation)?,
                StageOutcome::Pending => in_flight += 1,
            }
        }
        Ok(steps)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Test item: `steps` stages, finishing immediately up to
    /// `immediate_up_to` and staying in flight afterwards.
    struct TestTask {
        correlation: String,
        steps: usize,
        immediate_up_to: Option<usize>,
    }

    impl TestTask {
        fn new(correlation: &str, steps: usize, immediate_up_to: Option<usize>) -> Self {
            Self {
                correlation: correlation.to_string(),
                steps,
                immediate_up_to,
            }
        }

        fn next_after(&self, stage: usize) -> NextStage {
            if stage + 1 >= self.steps {
                NextStage::Complete
            } else {
                NextStage::Stage(stage + 1)
            }
        }
    }

    /// Log of executed (item, stage) steps.
    type Log = Vec<(TaskId, usize)>;

    impl StagedTask<Log> for TestTask {
        fn process(&mut self, stage: usize, id: TaskId, log: &mut Log) -> Result<StageOutcome> {
            log.push((id, stage));
            match self.immediate_up_to {
                Some(up_to) if stage <= up_to => Ok(StageOutcome::Ready {
                    next: self.next_after(stage),
                    correlation: None,
                }),
                _ => Ok(StageOutcome::Pending),
            }
        }
    }

    fn push(q: &mut StagedProcessingQueue<TestTask>, task: TestTask) -> TaskId {
        let correlation = task.correlation.clone();
        q.enqueue_correlated(task, correlation).unwrap()
    }

    fn finish_step(q: &mut StagedProcessingQueue<TestTask>, id: TaskId) {
        let stage = q.stage_of(id).unwrap();
        let next = q.task_mut(id).unwrap().next_after(stage);
        q.complete(id, next, None).unwrap();
    }

    fn last_stage(log: &Log, id: TaskId) -> Option<usize> {
        log.iter().rev().find(|(t, _)| *t == id).map(|(_, s)| *s)
    }

    #[test]
    fn test_empty_queue_processes_nothing() {
        let mut q: StagedProcessingQueue<TestTask> = StagedProcessingQueue::new(vec![true]);
        let mut log = Log::new();
        assert_eq!(q.process(1, &mut log).unwrap(), 0);
    }

    #[test]
    fn test_one_step_task_runs_at_stage_zero() {
        let mut q = StagedProcessingQueue::new(vec![true]);
        let mut log = Log::new();
        let t1 = push(&mut q, TestTask::new("1", 1, None));
        assert_eq!(q.process(1, &mut log).unwrap(), 1);
        assert_eq!(last_stage(&log, t1), Some(0));
    }

    #[test]
    fn test_two_step_task_with_immediate_first_step() {
        let mut q = StagedProcessingQueue::new(vec![true, true]);
        let mut log = Log::new();
        let t1 = push(&mut q, TestTask::new("1", 2, Some(0)));
        assert_eq!(q.process(1, &mut log).unwrap(), 2);
        assert_eq!(last_stage(&log, t1), Some(1));
        assert_eq!(q.count(), 1);
    }

    #[test]
    fn test_two_step_task_with_immediate_steps_leaves_queue() {
        let mut q = StagedProcessingQueue::new(vec![true, true]);
        let mut log = Log::new();
        push(&mut q, TestTask::new("1", 2, Some(1)));
        assert_eq!(q.process(1, &mut log).unwrap(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn test_initialize_drops_everything() {
        let mut q = StagedProcessingQueue::new(vec![true, true]);
        let mut log = Log::new();
        push(&mut q, TestTask::new("1", 2, Some(0)));
        q.initialize();
        assert_eq!(q.count(), 0);
        assert_eq!(q.process(1, &mut log).unwrap(), 0);
        assert!(log.is_empty());
        push(&mut q, TestTask::new("1", 1, None));
        assert_eq!(q.count(), 1);
    }

    #[test]
    fn test_related_tasks_wait_for_each_other() {
        let mut q = StagedProcessingQueue::new(vec![true, true]);
        let mut log = Log::new();
        let t1 = push(&mut q, TestTask::new("1", 1, None));
        let t2 = push(&mut q, TestTask::new("1", 1, None));
        assert_eq!(q.process(1, &mut log).unwrap(), 1);
        assert_eq!(q.process(1, &mut log).unwrap(), 0);
        assert_eq!(last_stage(&log, t1), Some(0));
        assert_eq!(last_stage(&log, t2), None);

        finish_step(&mut q, t1);
        assert_eq!(q.process(1, &mut log).unwrap(), 1);
        assert_eq!(last_stage(&log, t2), Some(0));
    }

    #[test]
    fn test_unrelated_tasks_run_side_by_side() {
        let mut q = StagedProcessingQueue::new(vec![true, true]);
        let mut log = Log::new();
        let t1 = push(&mut q, TestTask::new("1", 1, None));
        let t2 = push(&mut q, TestTask::new("2", 1, None));
        assert_eq!(q.process(1, &mut log).unwrap(), 1);
        assert_eq!(q.process(1, &mut log).unwrap(), 1);
        assert_eq!(last_stage(&log, t1), Some(0));
        assert_eq!(last_stage(&log, t2), Some(0));
    }

    #[test]
    fn test_ordered_stage_waits_for_earlier_task() {
        let mut q = StagedProcessingQueue::new(vec![true, true]);
        let mut log = Log::new();
        let t1 = push(&mut q, TestTask::new("1", 2, None));
        let t2 = push(&mut q, TestTask::new("2", 2, Some(0)));

        assert_eq!(q.process(1, &mut log).unwrap(), 1);
        assert_eq!(q.process(1, &mut log).unwrap(), 1);
        assert_eq!(q.process(1, &mut log).unwrap(), 0);
        assert_eq!(last_stage(&log, t2), Some(0));

        finish_step(&mut q, t1);
        assert_eq!(q.process(1, &mut log).unwrap(), 1);
        assert_eq!(q.process(1, &mut log).unwrap(), 1);
        assert_eq!(last_stage(&log, t1), Some(1));
        assert_eq!(last_stage(&log, t2), Some(1));
    }

    #[test]
    fn test_unordered_stages_let_later_tasks_overtake() {
        let mut q = StagedProcessingQueue::new(vec![false, false, true]);
        let mut log = Log::new();
        let t1 = push(&mut q, TestTask::new("1", 3, None));
        let t2 = push(&mut q, TestTask::new("2", 3, Some(0)));

        assert_eq!(q.process(1, &mut log).unwrap(), 1);
        assert_eq!(q.process(1, &mut log).unwrap(), 2);
        assert_eq!(q.process(1, &mut log).unwrap(), 0);
        assert_eq!(last_stage(&log, t1), Some(0));
        assert_eq!(last_stage(&log, t2), Some(1));

        finish_step(&mut q, t1);
        assert_eq!(q.process(1, &mut log).unwrap(), 1);
        assert_eq!(q.process(1, &mut log).unwrap(), 0);
    }

    #[test]
    fn test_final_ordered_stage_releases_in_enqueue_order() {
        let mut q = StagedProcessingQueue::new(vec![false, false, true]);
        let mut log = Log::new();
        let t1 = push(&mut q, TestTask::new("1", 3, None));
        let t2 = push(&mut q, TestTask::new("2", 3, Some(0)));
        let t3 = push(&mut q, TestTask::new("3", 3, Some(0)));

        assert_eq!(q.process(1, &mut log).unwrap(), 1);
        assert_eq!(q.process(1, &mut log).unwrap(), 2);
        assert_eq!(q.process(1, &mut log).unwrap(), 2);

        finish_step(&mut q, t1);
        assert_eq!(q.process(1, &mut log).unwrap(), 1);
        assert_eq!(q.process(1, &mut log).unwrap(), 0);

        finish_step(&mut q, t2);
        finish_step(&mut q, t3);
        assert_eq!(q.process(1, &mut log).unwrap(), 0);

        finish_step(&mut q, t1);
        assert_eq!(q.process(1, &mut log).unwrap(), 1);
        assert_eq!(q.process(1, &mut log).unwrap(), 1);
        assert_eq!(q.process(1, &mut log).unwrap(), 1);

        let final_stage: Vec<TaskId> = log.iter().filter(|(_, s)| *s == 2).map(|(t, _)| *t).collect();
        assert_eq!(final_stage, vec![t1, t2, t3]);
    }

    #[test]
    fn test_related_task_waits_for_ordered_stage_behind_unordered_one() {
        let mut q = StagedProcessingQueue::new(vec![true, false, true]);
        let mut log = Log::new();
        // t1 stays in flight at the unordered stage; t2 would pass it straight through.
        let t1 = push(&mut q, TestTask::new("p", 3, Some(0)));
        let t2 = push(&mut q, TestTask::new("p", 3, Some(1)));

        q.process(10, &mut log).unwrap();
        q.process(10, &mut log).unwrap();
        assert_eq!(last_stage(&log, t1), Some(1));
        assert!(!log.contains(&(t2, 2)));

        finish_step(&mut q, t1);
        q.process(10, &mut log).unwrap();
        assert_eq!(last_stage(&log, t1), Some(2));
        assert!(!log.contains(&(t2, 2)));

        finish_step(&mut q, t1);
        q.process(10, &mut log).unwrap();
        q.process(10, &mut log).unwrap();
        assert_eq!(last_stage(&log, t2), Some(2));

        let final_stage: Vec<TaskId> = log.iter().filter(|(_, s)| *s == 2).map(|(t, _)| *t).collect();
        assert_eq!(final_stage, vec![t1, t2]);
    }

    #[test]
    fn test_complete_rejects_idle_items() {
        let mut q: StagedProcessingQueue<TestTask> = StagedProcessingQueue::new(vec![true]);
        assert!(matches!(
            q.complete(42, NextStage::Complete, None),
            Err(Error::InvalidState(_))
        ));
    }

    /// Item that attaches its correlation id when leaving stage 0.
    struct Correlating {
        partition: &'static str,
    }

    impl StagedTask<Log> for Correlating {
        fn process(&mut self, stage: usize, id: TaskId, log: &mut Log) -> Result<StageOutcome> {
            log.push((id, stage));
            match stage {
                0 => Ok(StageOutcome::Ready {
                    next: NextStage::Stage(1),
                    correlation: Some(self.partition.to_string()),
                }),
                _ => Ok(StageOutcome::Pending),
            }
        }
    }

    #[test]
    fn test_correlation_attached_in_ordered_stage_serializes_partition() {
        let mut q = StagedProcessingQueue::new(vec![true, false]);
        let mut log = Log::new();
        let a1 = q.enqueue(Correlating { partition: "a" });
        let a2 = q.enqueue(Correlating { partition: "a" });
        let b1 = q.enqueue(Correlating { partition: "b" });

        // a1 runs both stages; a2 blocks the unordered head behind a1.
        assert_eq!(q.process(10, &mut log).unwrap(), 4);
        assert_eq!(last_stage(&log, a1), Some(1));
        assert_eq!(last_stage(&log, a2), Some(0));
        assert_eq!(last_stage(&log, b1), Some(0));

        q.complete(a1, NextStage::Complete, None).unwrap();
        assert_eq!(q.process(10, &mut log).unwrap(), 2);
        assert_eq!(last_stage(&log, a2), Some(1));
        assert_eq!(last_stage(&log, b1), Some(1));
    }

    #[test]
    fn test_correlation_cannot_be_set_twice() {
        let mut q = StagedProcessingQueue::new(vec![true, true]);
        let mut log = Log::new();
        let t1 = push(&mut q, TestTask::new("1", 2, None));
        q.process(1, &mut log).unwrap();
        assert!(matches!(
            q.complete(t1, NextStage::Stage(1), Some("other".to_string())),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_bounded_processing_stops_after_max_steps() {
        let mut q = StagedProcessingQueue::new(vec![true, true]);
        let mut log = Log::new();
        for n in 0..3 {
            push(&mut q, TestTask::new(&n.to_string(), 2, Some(1)));
        }
        assert_eq!(q.process_bounded(10, 4, &mut log).unwrap(), 4);
        assert_eq!(q.count(), 1);
        assert_eq!(q.process_bounded(10, 4, &mut log).unwrap(), 2);
        assert!(q.is_empty());
    }
}
