//! # Partition State Cache
//!
//! Holds the folded state of every partition a projection is working on.
//!
//! ## Locks
//!
//! Each entry carries a lock position. While an event for a partition is in
//! the pipeline its entry is locked at that event's tag; the checkpoint
//! manager unlocks everything before a checkpoint once the checkpoint is
//! durable. Eviction is gated by that watermark, never by recency alone:
//!
//! ```text
//!   cache order (by lock tag) ──►  t1   t2   t3 │ t4   t5
//!                                               │
//!                              unlocked_before ─┘
//!   evictable:                    ✓    ✓    ✓     ✗    ✗
//! ```
//!
//! The root partition (`""`) is locked forever and never evicted.

use std::collections::{HashMap, VecDeque};

use tracing::trace;

use crate::tag::CheckpointTag;
use crate::types::{PartitionState, ROOT_PARTITION};
use crate::{Error, Result};

/// Default maximum number of cached partitions.
pub const DEFAULT_MAX_CACHED_PARTITIONS: usize = 4000;

/// Cleanup runs once the eviction queue is this many times larger than the cap.
const CACHE_ORDER_SLACK: usize = 5;

#[derive(Debug, Clone, PartialEq)]
enum Lock {
    /// Root partition.
    Forever,
    /// Locked until a checkpoint after this tag is durable.
    At(CheckpointTag),
    /// Cached for reads only.
    Unlocked,
}

#[derive(Debug, Clone)]
struct CachedPartition {
    state: PartitionState,
    lock: Lock,
}

/// Per-partition state, evicted only once durably checkpointed.
#[derive(Debug)]
pub struct PartitionStateCache {
    max_cached: usize,
    partitions: HashMap<String, CachedPartition>,
    cache_order: VecDeque<(CheckpointTag, String)>,
    unlocked_before: CheckpointTag,
}

impl Default for PartitionStateCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CACHED_PARTITIONS)
    }
}

impl PartitionStateCache {
    /// Creates an empty cache holding at most `max_cached` partitions once
    /// they can be evicted.
    pub fn new(max_cached: usize) -> Self {
        Self {
            max_cached,
            partitions: HashMap::new(),
            cache_order: VecDeque::new(),
            unlocked_before: CheckpointTag::empty(),
        }
    }

    /// Forgets everything, including the root partition.
    pub fn initialize(&mut self) {
        self.partitions.clear();
        self.cache_order.clear();
        self.unlocked_before = CheckpointTag::empty();
    }

    /// Number of cached partitions.
    pub fn cached_item_count(&self) -> usize {
        self.partitions.len()
    }

    /// Current eviction watermark.
    pub fn unlocked_before(&self) -> &CheckpointTag {
        &self.unlocked_before
    }

    /// Caches `state` and locks it.
    ///
    /// The root partition takes `None` (locked forever); every other
    /// partition needs a tag after both its current lock and the watermark.
    pub fn cache_and_lock_partition_state(
        &mut self,
        partition: &str,
        state: PartitionState,
        lock_at: Option<CheckpointTag>,
    ) -> Result<()> {
        let lock = match (partition == ROOT_PARTITION, lock_at) {
            (true, None) => Lock::Forever,
            (true, Some(_)) => {
                return Err(Error::InvalidState(
                    "the root partition must be locked forever".to_string(),
                ))
            }
            (false, None) => {
                return Err(Error::InvalidState(format!(
                    "partition '{}' must be locked at a position",
                    partition
                )))
            }
            (false, Some(tag)) => {
                self.ensure_can_lock(partition, &tag)?;
                Lock::At(tag)
            }
        };
        if let Lock::At(tag) = &lock {
            self.cache_order.push_back((tag.clone(), partition.to_string()));
        }
        self.partitions
            .insert(partition.to_string(), CachedPartition { state, lock });
        self.clean_up(false)
    }

    /// Caches `state` without locking it, for read-only use.
    pub fn cache_partition_state(&mut self, partition: &str, state: PartitionState) -> Result<()> {
        if partition == ROOT_PARTITION {
            return self.cache_and_lock_partition_state(partition, state, None);
        }
        self.cache_order
            .push_back((CheckpointTag::empty(), partition.to_string()));
        self.partitions.insert(
            partition.to_string(),
            CachedPartition {
                state,
                lock: Lock::Unlocked,
            },
        );
        self.clean_up(false)
    }

    /// Locks a cached partition at `lock_at` and returns its state, or
    /// `None` when the partition is not cached.
    pub fn try_get_and_lock_partition_state(
        &mut self,
        partition: &str,
        lock_at: CheckpointTag,
    ) -> Result<Option<PartitionState>> {
        if partition == ROOT_PARTITION {
            return Err(Error::InvalidState(
                "the root partition is locked forever and cannot be relocked".to_string(),
            ));
        }
        if !self.partitions.contains_key(partition) {
            return Ok(None);
        }
        self.ensure_can_lock(partition, &lock_at)?;
        self.cache_order
            .push_back((lock_at.clone(), partition.to_string()));
        let entry = self.partitions.get_mut(partition).ok_or_else(|| {
            Error::PartitionNotLocked {
                partition: partition.to_string(),
                reason: "not cached".to_string(),
            }
        })?;
        entry.lock = Lock::At(lock_at);
        Ok(Some(entry.state.clone()))
    }

    /// Replaces the state of a locked partition, keeping its lock.
    pub fn update_locked_partition_state(&mut self, partition: &str, state: PartitionState) -> Result<()> {
        self.get_locked_partition_state(partition)?;
        if let Some(entry) = self.partitions.get_mut(partition) {
            entry.state = state;
        }
        Ok(())
    }

    /// State of a partition that is still locked after the watermark.
    pub fn get_locked_partition_state(&self, partition: &str) -> Result<&PartitionState> {
        let entry = self
            .partitions
            .get(partition)
            .ok_or_else(|| Error::PartitionNotLocked {
                partition: partition.to_string(),
                reason: "not cached".to_string(),
            })?;
        match &entry.lock {
            Lock::Forever => Ok(&entry.state),
            Lock::At(tag) if tag.is_after(&self.unlocked_before)? => Ok(&entry.state),
            Lock::At(tag) => Err(Error::PartitionNotLocked {
                partition: partition.to_string(),
                reason: format!(
                    "locked at '{}' which is not after the unlocked position '{}'",
                    tag, self.unlocked_before
                ),
            }),
            Lock::Unlocked => Err(Error::PartitionNotLocked {
                partition: partition.to_string(),
                reason: "cached for reads only".to_string(),
            }),
        }
    }

    /// Cached state of a partition regardless of its lock.
    pub fn try_get_unlocked_partition_state(&self, partition: &str) -> Option<&PartitionState> {
        self.partitions.get(partition).map(|e| &e.state)
    }

    /// Raises the watermark and evicts what is no longer needed.
    ///
    /// With `forget_unlocked` every entry below the watermark is evicted,
    /// not only those above the cap.
    pub fn unlock(&mut self, before: CheckpointTag, forget_unlocked: bool) -> Result<()> {
        self.unlocked_before = before;
        self.clean_up(forget_unlocked)
    }

    /// Cached partitions and their states, in no particular order.
    pub fn enumerate(&self) -> impl Iterator<Item = (&str, &PartitionState)> {
        self.partitions.iter().map(|(p, e)| (p.as_str(), &e.state))
    }

    fn ensure_can_lock(&self, partition: &str, tag: &CheckpointTag) -> Result<()> {
        if tag.is_at_or_before(&self.unlocked_before)? {
            return Err(Error::OrderingViolation(format!(
                "Attempt to lock the '{}' partition state at '{}' which is not after the unlocked position '{}'",
                partition, tag, self.unlocked_before
            )));
        }
        if let Some(CachedPartition {
            lock: Lock::At(current),
            ..
        }) = self.partitions.get(partition)
        {
            if tag.is_at_or_before(current)? {
                return Err(Error::PartitionRelock {
                    partition: partition.to_string(),
                    locked_at: current.to_string(),
                    requested: tag.to_string(),
                });
            }
        }
        Ok(())
    }

    fn clean_up(&mut self, remove_all: bool) -> Result<()> {
        while remove_all
            || self.cache_order.len() > self.max_cached * CACHE_ORDER_SLACK
            || self.partitions.len() > self.max_cached
        {
            let Some((tag, _)) = self.cache_order.front() else {
                break;
            };
            if tag.is_at_or_after(&self.unlocked_before)? {
                break;
            }
            let Some((_, partition)) = self.cache_order.pop_front() else {
                break;
            };
            let evictable = match self.partitions.get(&partition).map(|e| &e.lock) {
                None | Some(Lock::Forever) => false,
                Some(Lock::Unlocked) => true,
                Some(Lock::At(locked_at)) => locked_at.is_before(&self.unlocked_before)?,
            };
            if evictable {
                trace!(partition = %partition, "evicting partition state");
                self.partitions.remove(&partition);
            }
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
