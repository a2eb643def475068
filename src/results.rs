//! Derived output that is not written by the handler itself: running
//! results and the partition catalog.
//!
//! ```text
//! partition "acct-1" result changed ─► Result        ─► $projections-{name}-acct-1-result
//! partition "acct-1" result cleared ─► ResultRemoved ─► $projections-{name}-acct-1-result
//! first state of "acct-1"           ─► $partition    ─► $projections-{name}-partitions
//! ```

use crate::tag::CheckpointTag;
use crate::types::{
    EmittedEvent, PartitionState, ProjectionNames, PARTITION_CATALOG_EVENT_TYPE, RESULT_EVENT_TYPE,
    RESULT_REMOVED_EVENT_TYPE, ROOT_PARTITION,
};

/// Builds result and catalog events for one projection.
#[derive(Debug, Clone)]
pub struct ResultEmitter {
    names: ProjectionNames,
    zero: CheckpointTag,
}

impl ResultEmitter {
    /// Creates an emitter; `zero` is the tagger's zero tag, the `caused_by`
    /// of a partition that has never been written.
    pub fn new(names: ProjectionNames, zero: CheckpointTag) -> Self {
        Self { names, zero }
    }

    /// Events announcing that `partition`'s result is now `result`.
    pub fn result_updated(&self, partition: &str, result: Option<&str>, at: CheckpointTag) -> Vec<EmittedEvent> {
        let stream = self.names.result_stream(partition);
        let event = match result {
            Some(result) => EmittedEvent::new(stream, RESULT_EVENT_TYPE, Some(result.to_string()), at),
            None => EmittedEvent::new(stream, RESULT_REMOVED_EVENT_TYPE, None, at),
        };
        vec![event]
    }

    /// Result events for a state change, if the result changed.
    pub fn running_results(&self, partition: &str, old: &PartitionState, new: &PartitionState) -> Vec<EmittedEvent> {
        if old.result == new.result {
            return Vec::new();
        }
        self.result_updated(partition, new.result.as_deref(), new.caused_by.clone())
    }

    /// A `$partition` catalog entry when `partition` is seen for the first time.
    pub fn partition_created(&self, partition: &str, old: &PartitionState, new: &PartitionState) -> Option<EmittedEvent> {
        if partition == ROOT_PARTITION || old.caused_by != self.zero {
            return None;
        }
        Some(
            EmittedEvent::new(
                self.names.partition_catalog_stream(),
                PARTITION_CATALOG_EVENT_TYPE,
                Some(partition.to_string()),
                new.caused_by.clone(),
            )
            .not_json(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(commit: i64) -> CheckpointTag {
        CheckpointTag::from_position(0, commit, commit)
    }

    fn zero() -> CheckpointTag {
        CheckpointTag::from_position(0, 0, -1)
    }

    fn emitter() -> ResultEmitter {
        ResultEmitter::new(ProjectionNames::new("orders"), zero())
    }

    #[test]
    fn test_result_and_removal() {
        let events = emitter().result_updated("a", Some("{\"n\":1}"), at(5));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].stream_id, "$projections-orders-a-result");
        assert_eq!(events[0].event_type, "Result");
        assert_eq!(events[0].data.as_deref(), Some("{\"n\":1}"));

        let events = emitter().result_updated("", None, at(6));
        assert_eq!(events[0].stream_id, "$projections-orders-result");
        assert_eq!(events[0].event_type, "ResultRemoved");
        assert!(events[0].data.is_none());
    }

    #[test]
    fn test_running_results_only_on_change() {
        let old = PartitionState::new("{}", Some("1".to_string()), at(1));
        let same = PartitionState::new("{\"x\":1}", Some("1".to_string()), at(2));
        let changed = PartitionState::new("{\"x\":2}", Some("2".to_string()), at(3));
        assert!(emitter().running_results("a", &old, &same).is_empty());
        let events = emitter().running_results("a", &old, &changed);
        assert_eq!(events[0].caused_by_tag, at(3));
    }

    #[test]
    fn test_catalog_entry_for_new_partitions_only() {
        let new = PartitionState::new("{}", None, at(4));
        let created = emitter().partition_created("a", &PartitionState::empty(zero()), &new).unwrap();
        assert_eq!(created.stream_id, "$projections-orders-partitions");
        assert_eq!(created.event_type, "$partition");
        assert_eq!(created.data.as_deref(), Some("a"));
        assert!(!created.is_json);

        let existing = PartitionState::new("{}", None, at(1));
        assert!(emitter().partition_created("a", &existing, &new).is_none());
        assert!(emitter().partition_created("", &PartitionState::empty(zero()), &new).is_none());
    }
}
