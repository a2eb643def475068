//! # Projection Processing Queue
//!
//! Wraps a [`StagedProcessingQueue`] with the rules the projection needs on
//! top of plain staging:
//!
//! - **Queueing order**: positioned items arrive in tag order. A tag below
//!   the last enqueued one is rejected; an equal tag only for items that do
//!   not carry an event (progress, checkpoint suggestions, EOF) or right after
//!   the queue was initialized.
//! - **Flow control**: more than `pending_events_threshold` buffered items
//!   pause the reader; it resumes once the buffer drains below half of that.
//! - **Subscription gate**: messages of a dropped subscription are ignored and
//!   a gap in sequence numbers is fatal.
//!
//! ```text
//!  subscription ──► accept? ──► enqueue_task ──► [ staged queue ] ──► process
//!                                    │                                  │
//!                                count > threshold              count < threshold / 2
//!                                    ▼                                  ▼
//!                              ReadControl::Pause               ReadControl::Resume
//! ```

use tracing::debug;

use crate::staged_queue::{NextStage, StagedProcessingQueue, StagedTask, TaskId};
use crate::subscription::{SubscriptionId, SubscriptionMessage};
use crate::tag::CheckpointTag;
use crate::{Error, Result};

/// Flow-control request for the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadControl {
    /// Stop delivering events.
    Pause,
    /// Deliver events again.
    Resume,
}

/// Ordered, flow-controlled work queue of one projection. See the module docs.
pub struct CoreProjectionQueue<T> {
    queue: StagedProcessingQueue<T>,
    pending_events_threshold: usize,
    last_enqueued: Option<CheckpointTag>,
    just_initialized: bool,
    subscription: Option<SubscriptionId>,
    expected_sequence: u64,
    paused: bool,
}

impl<T> CoreProjectionQueue<T> {
    /// Creates a queue; `ordered[i]` tells whether stage `i` is ordered.
    pub fn new(ordered: Vec<bool>, pending_events_threshold: usize) -> Self {
        Self {
            queue: StagedProcessingQueue::new(ordered),
            pending_events_threshold,
            last_enqueued: None,
            just_initialized: false,
            subscription: None,
            expected_sequence: 0,
            paused: false,
        }
    }

    /// Drops every item and starts over at `zero`.
    pub fn initialize(&mut self, zero: CheckpointTag) {
        self.queue.initialize();
        self.last_enqueued = Some(zero);
        self.just_initialized = true;
        self.subscription = None;
        self.expected_sequence = 0;
        self.paused = false;
    }

    /// Accepts messages of `subscription` from sequence number 0 on.
    pub fn subscribed(&mut self, subscription: SubscriptionId) {
        self.subscription = Some(subscription);
        self.expected_sequence = 0;
        self.paused = false;
    }

    /// Ignores every subscription message from now on.
    pub fn unsubscribed(&mut self) {
        self.subscription = None;
    }

    /// Current subscription.
    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.subscription
    }

    /// Whether `message` should be processed: `false` for a stale
    /// subscription, an error for a sequence gap.
    pub fn accept(&mut self, message: &SubscriptionMessage) -> Result<bool> {
        if self.subscription != Some(message.subscription_id) {
            debug!(%message, "message of a stale subscription ignored");
            return Ok(false);
        }
        if message.sequence != self.expected_sequence {
            return Err(Error::OrderingViolation(format!(
                "Out of order message detected. Expected sequence {} but got {}",
                self.expected_sequence, message.sequence
            )));
        }
        self.expected_sequence += 1;
        Ok(true)
    }

    /// Items in the queue.
    pub fn buffered_count(&self) -> usize {
        self.queue.count()
    }

    /// `"/Paused"` while the reader is paused.
    pub fn status(&self) -> &'static str {
        if self.paused {
            "/Paused"
        } else {
            ""
        }
    }

    /// Whether the reader is paused.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Tag of the last positioned item.
    pub fn last_enqueued(&self) -> Option<&CheckpointTag> {
        self.last_enqueued.as_ref()
    }

    /// Enqueues a positioned item.
    ///
    /// `allow_current_position` accepts a tag equal to the last enqueued one.
    pub fn enqueue_task(
        &mut self,
        task: T,
        tag: CheckpointTag,
        allow_current_position: bool,
    ) -> Result<(TaskId, Option<ReadControl>)> {
        self.validate_queueing_order(&tag, allow_current_position)?;
        self.last_enqueued = Some(tag);
        let id = self.queue.enqueue(task);
        let control = if !self.paused && self.queue.count() > self.pending_events_threshold {
            self.paused = true;
            debug!(buffered = self.queue.count(), "reading paused");
            Some(ReadControl::Pause)
        } else {
            None
        };
        Ok((id, control))
    }

    /// Enqueues an item that is not positioned in the event sequence
    /// (queries), serialized with other items of `correlation`.
    pub fn enqueue_out_of_order(&mut self, task: T, correlation: String) -> Result<TaskId> {
        if self.last_enqueued.is_none() {
            return Err(Error::InvalidState(
                "Cannot enqueue an out-of-order task.  The projection position is currently unknown.".to_string(),
            ));
        }
        self.queue.enqueue_correlated(task, correlation)
    }

    /// Runs up to `max` steps and reports whether the reader can resume.
    pub fn process<C>(&mut self, max: usize, ctx: &mut C) -> Result<(usize, Option<ReadControl>)>
    where
        T: StagedTask<C>,
    {
        let steps = self.queue.process_bounded(max, max, ctx)?;
        let control = if self.paused && self.queue.count() < self.pending_events_threshold / 2 {
            self.paused = false;
            debug!(buffered = self.queue.count(), "reading resumed");
            Some(ReadControl::Resume)
        } else {
            None
        };
        Ok((steps, control))
    }

    /// Finishes an in-flight step of `id`.
    pub fn complete(&mut self, id: TaskId, next: NextStage) -> Result<()> {
        self.queue.complete(id, next, None)
    }

    /// The item with id `id`, if still queued.
    pub fn task_mut(&mut self, id: TaskId) -> Option<&mut T> {
        self.queue.task_mut(id)
    }

    fn validate_queueing_order(&mut self, tag: &CheckpointTag, allow_current_position: bool) -> Result<()> {
        let allow_current = allow_current_position || self.just_initialized;
        self.just_initialized = false;
        let Some(last) = &self.last_enqueued else {
            return Ok(());
        };
        let valid = if allow_current {
            tag.is_at_or_after(last)?
        } else {
            tag.is_after(last)?
        };
        if !valid {
            return Err(Error::OrderingViolation(format!(
                "Invalid order. Last known tag is: '{}'.  Current tag is: '{}'",
                last, tag
            )));
        }
        Ok(())
    }
}
