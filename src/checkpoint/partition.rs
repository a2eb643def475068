//! Per-partition checkpoints.
//!
//! Every partition other than the root persists its state in its own stream,
//! `$projections-{name}-{partition}-checkpoint`, as `$Checkpoint` events.
//! [`PartitionStateUpdates`] collects the states that changed during one
//! checkpoint interval and turns them into those events;
//! [`PartitionStateLoader`] reads the newest usable one back.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::{Continuation, Effects, Signal};
use crate::codec::decode_checkpoint_tag;
use crate::io::{IoRequest, IoResponse};
use crate::staged_queue::TaskId;
use crate::store::{ReadResult, FROM_END};
use crate::tag::CheckpointTag;
use crate::tagger::PositionTagger;
use crate::types::{
    EmittedEvent, PartitionState, ProjectionNames, ProjectionVersion, PARTITION_CHECKPOINT_EVENT_TYPE,
};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct PendingPartitionCheckpoint {
    expected_tag: CheckpointTag,
    state: PartitionState,
}

/// Partition states changed since the last checkpoint.
#[derive(Debug)]
pub struct PartitionStateUpdates {
    names: ProjectionNames,
    states: BTreeMap<String, PendingPartitionCheckpoint>,
}

impl PartitionStateUpdates {
    /// Creates an empty set for projection `names`.
    pub fn new(names: ProjectionNames) -> Self {
        Self {
            names,
            states: BTreeMap::new(),
        }
    }

    /// Number of partitions waiting to be checkpointed.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// `true` when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Records the newest state of `partition`.
    ///
    /// The first update in an interval remembers `previous_caused_by`: the
    /// tag the partition's checkpoint stream is expected to end at.
    pub fn state_updated(&mut self, partition: &str, state: PartitionState, previous_caused_by: CheckpointTag) {
        self.states
            .entry(partition.to_string())
            .and_modify(|pending| pending.state = state.clone())
            .or_insert(PendingPartitionCheckpoint {
                expected_tag: previous_caused_by,
                state,
            });
    }

    /// Drains the collected states as `$Checkpoint` events, oldest first.
    pub fn take_checkpoint_events(&mut self) -> Result<Vec<EmittedEvent>> {
        let mut pending: Vec<(String, PendingPartitionCheckpoint)> =
            std::mem::take(&mut self.states).into_iter().collect();
        pending.sort_by(|(_, a), (_, b)| {
            a.state
                .caused_by
                .try_cmp(&b.state.caused_by)
                .unwrap_or(Ordering::Equal)
        });
        pending
            .into_iter()
            .map(|(partition, pending)| {
                Ok(EmittedEvent::new(
                    self.names.partition_checkpoint_stream(&partition),
                    PARTITION_CHECKPOINT_EVENT_TYPE,
                    Some(pending.state.serialize()?),
                    pending.state.caused_by.clone(),
                )
                .with_expected_tag(pending.expected_tag))
            })
            .collect()
    }

    /// Forgets everything collected.
    pub fn clear(&mut self) {
        self.states.clear();
    }
}

/// Loads partition states from their checkpoint streams.
#[derive(Debug, Clone)]
pub struct PartitionStateLoader {
    names: ProjectionNames,
    version: ProjectionVersion,
    tagger: Arc<dyn PositionTagger>,
}

impl PartitionStateLoader {
    /// Creates a loader.
    pub fn new(names: ProjectionNames, version: ProjectionVersion, tagger: Arc<dyn PositionTagger>) -> Self {
        Self { names, version, tagger }
    }

    /// Starts loading the state `partition` had just before `at`.
    pub fn begin(&self, task: TaskId, partition: &str, at: CheckpointTag, fx: &mut Effects) {
        self.read_page(task, partition.to_string(), at, FROM_END, fx);
    }

    /// Handles a page of a partition checkpoint stream.
    pub fn handle(&self, continuation: Continuation, response: IoResponse, fx: &mut Effects) -> Result<()> {
        let Continuation::LoadPartition { task, partition, at } = continuation else {
            return Err(Error::InvalidState(format!(
                "partition loader cannot handle {:?}",
                continuation
            )));
        };
        let slice = match response {
            IoResponse::Read(ReadResult::Success(slice)) => slice,
            IoResponse::Read(ReadResult::NoStream) | IoResponse::Read(ReadResult::StreamDeleted) => {
                self.loaded_empty(task, partition, fx);
                return Ok(());
            }
            IoResponse::Read(ReadResult::AccessDenied) => {
                fx.fail(format!(
                    "Access to the '{}' stream is denied",
                    self.names.partition_checkpoint_stream(&partition)
                ));
                return Ok(());
            }
            IoResponse::Failed(reason) => {
                fx.fail(reason);
                return Ok(());
            }
            other => {
                return Err(Error::InvalidState(format!(
                    "unexpected partition load response: {:?}",
                    other
                )))
            }
        };

        if let Some(event) = slice.events.first() {
            if event.event_type == PARTITION_CHECKPOINT_EVENT_TYPE {
                let stored = decode_checkpoint_tag(&event.metadata, &self.version)?;
                let foreign = stored.version.projection_id != self.version.projection_id
                    || self.version.epoch > stored.version.version;
                if foreign {
                    debug!(partition = %partition, "partition checkpoint from another epoch ignored");
                    self.loaded_empty(task, partition, fx);
                    return Ok(());
                }
                let tag = stored.adjust_by(self.tagger.as_ref(), &self.version)?;
                if tag.is_before(&at)? {
                    let state = PartitionState::deserialize(Some(&event.data), tag)?;
                    fx.signal(Signal::PartitionLoaded { task, partition, state });
                    return Ok(());
                }
            }
        }
        if slice.is_end_of_stream {
            self.loaded_empty(task, partition, fx);
        } else {
            self.read_page(task, partition, at, slice.next_event_number, fx);
        }
        Ok(())
    }

    fn read_page(&self, task: TaskId, partition: String, at: CheckpointTag, from_event_number: i64, fx: &mut Effects) {
        fx.io.publish(
            IoRequest::ReadBackward {
                stream: self.names.partition_checkpoint_stream(&partition),
                from_event_number,
                max_count: 1,
            },
            Continuation::LoadPartition { task, partition, at },
        );
    }

    fn loaded_empty(&self, task: TaskId, partition: String, fx: &mut Effects) {
        let state = PartitionState::empty(self.tagger.make_zero_checkpoint_tag());
        fx.signal(Signal::PartitionLoaded { task, partition, state });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_checkpoint_tag;
    use crate::store::{slice_backward, RecordedEvent};
    use crate::tag::TfPos;
    use crate::tagger::TransactionFilePositionTagger;
    use serde_json::Map;

    fn at(commit: i64) -> CheckpointTag {
        CheckpointTag::from_position(0, commit, commit)
    }

    fn loader(version: ProjectionVersion) -> PartitionStateLoader {
        PartitionStateLoader::new(
            ProjectionNames::new("p"),
            version,
            Arc::new(TransactionFilePositionTagger::new(0)),
        )
    }

    fn checkpoint_event(number: i64, event_type: &str, commit: i64, version: &ProjectionVersion) -> RecordedEvent {
        RecordedEvent {
            stream_id: "$projections-p-a-checkpoint".to_string(),
            event_number: number,
            event_type: event_type.to_string(),
            data: format!(r#"[{{"n":{}}}]"#, commit),
            metadata: encode_checkpoint_tag(&at(commit), Some(version), &Map::new()).unwrap(),
            is_json: true,
            position: TfPos::new(commit, commit),
        }
    }

    fn load(loader: &PartitionStateLoader, stored: &[RecordedEvent], before: i64) -> PartitionState {
        let mut fx = Effects::new();
        loader.begin(7, "a", at(before), &mut fx);
        loop {
            let out = fx.io.take_outgoing();
            for (id, request) in out {
                let IoRequest::ReadBackward { stream, from_event_number, max_count } = request else {
                    panic!("expected a read");
                };
                assert_eq!(stream, "$projections-p-a-checkpoint");
                let response = if stored.is_empty() {
                    IoResponse::Read(ReadResult::NoStream)
                } else {
                    IoResponse::Read(ReadResult::Success(slice_backward(stored, from_event_number, max_count)))
                };
                let (k, response) = fx.io.complete(id, response).unwrap();
                loader.handle(k, response, &mut fx).unwrap();
            }
            if let Some(Signal::PartitionLoaded { task, partition, state }) = fx.next_signal() {
                assert_eq!((task, partition.as_str()), (7, "a"));
                return state;
            }
        }
    }

    #[test]
    fn test_updates_keep_first_expected_tag() {
        let mut updates = PartitionStateUpdates::new(ProjectionNames::new("p"));
        updates.state_updated("b", PartitionState::new("{}", None, at(30)), at(0));
        updates.state_updated("a", PartitionState::new(r#"{"x":1}"#, None, at(10)), at(2));
        updates.state_updated("a", PartitionState::new(r#"{"x":2}"#, None, at(20)), at(10));
        assert_eq!(updates.len(), 2);

        let events = updates.take_checkpoint_events().unwrap();
        assert!(updates.is_empty());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].stream_id, "$projections-p-a-checkpoint");
        assert_eq!(events[0].event_type, "$Checkpoint");
        assert_eq!(events[0].data.as_deref(), Some(r#"[{"x":2}]"#));
        assert_eq!(events[0].caused_by_tag, at(20));
        assert_eq!(events[0].expected_tag, Some(at(2)));
        assert_eq!(events[1].stream_id, "$projections-p-b-checkpoint");
    }

    #[test]
    fn test_load_missing_stream_gives_empty_state() {
        let state = load(&loader(ProjectionVersion::new(1, 0, 0)), &[], 50);
        let zero = TransactionFilePositionTagger::new(0).make_zero_checkpoint_tag();
        assert_eq!(state, PartitionState::empty(zero));
    }

    #[test]
    fn test_load_skips_checkpoints_at_or_after_position() {
        let v = ProjectionVersion::new(1, 0, 0);
        let stored = vec![
            checkpoint_event(0, "$Checkpoint", 10, &v),
            checkpoint_event(1, "$Checkpoint", 20, &v),
        ];
        let state = load(&loader(v), &stored, 20);
        assert_eq!(state.state, r#"{"n":10}"#);
        assert_eq!(state.caused_by, at(10));

        let state = load(&loader(v), &stored, 25);
        assert_eq!(state.caused_by, at(20));
    }

    #[test]
    fn test_load_ignores_older_epoch() {
        let stored = vec![checkpoint_event(0, "$Checkpoint", 10, &ProjectionVersion::new(1, 0, 0))];
        let state = load(&loader(ProjectionVersion::new(1, 1, 1)), &stored, 50);
        assert_eq!(state.state, "");
    }
}
