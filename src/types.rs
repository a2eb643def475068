//! # Domain Types for SpiteDB Projections
//!
//! This module defines the values that flow through the projection engine:
//! events delivered by readers, events a projection emits, folded partition
//! state, the projection's version identity, and the naming scheme of the
//! streams a projection owns.
//!
//! ## Invariants
//!
//! - [`PartitionState::caused_by`] is the tag at which the state became valid
//! - [`EmittedEvent::caused_by_tag`] is the tag of the event that produced it;
//!   emitted events of one stream are queued in strictly increasing tag order
//! - [`ProjectionVersion::epoch`] only grows; output written under an older
//!   epoch belongs to a previous incarnation of the projection

use std::fmt;

use serde_json::{Map, Value};

use crate::tag::{CheckpointTag, TfPos};
use crate::{Error, Result};

// =============================================================================
// Event Types
// =============================================================================

/// Event type of the projection's own checkpoint events.
pub const CHECKPOINT_EVENT_TYPE: &str = "$ProjectionCheckpoint";

/// Event type of per-partition checkpoint events.
pub const PARTITION_CHECKPOINT_EVENT_TYPE: &str = "$Checkpoint";

/// Event type of running results.
pub const RESULT_EVENT_TYPE: &str = "Result";

/// Event type written when a partition's result disappears.
pub const RESULT_REMOVED_EVENT_TYPE: &str = "ResultRemoved";

/// Event type of partition catalog entries.
pub const PARTITION_CATALOG_EVENT_TYPE: &str = "$partition";

/// Name of the root partition.
pub const ROOT_PARTITION: &str = "";

// =============================================================================
// Projection Identity
// =============================================================================

/// Identity of a projection definition.
///
/// - `projection_id`: which projection wrote a record
/// - `epoch`: bumped when the projection is reset; older output is foreign
/// - `version`: bumped on every definition change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ProjectionVersion {
    /// Projection id.
    pub projection_id: i64,
    /// Reset epoch.
    pub epoch: i64,
    /// Definition version.
    pub version: i64,
}

impl ProjectionVersion {
    /// Creates a version triple.
    pub fn new(projection_id: i64, epoch: i64, version: i64) -> Self {
        Self {
            projection_id,
            epoch,
            version,
        }
    }
}

impl fmt::Display for ProjectionVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.projection_id, self.epoch, self.version)
    }
}

/// Names of the streams a projection reads and writes for itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionNames {
    name: String,
}

impl ProjectionNames {
    /// Creates the naming scheme for projection `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Projection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `$projections-{name}-checkpoint`
    pub fn checkpoint_stream(&self) -> String {
        format!("$projections-{}-checkpoint", self.name)
    }

    /// `$projections-{name}-{partition}-checkpoint`
    pub fn partition_checkpoint_stream(&self, partition: &str) -> String {
        format!("$projections-{}-{}-checkpoint", self.name, partition)
    }

    /// `$projections-{name}-result` for the root partition, otherwise
    /// `$projections-{name}-{partition}-result`.
    pub fn result_stream(&self, partition: &str) -> String {
        if partition.is_empty() {
            format!("$projections-{}-result", self.name)
        } else {
            format!("$projections-{}-{}-result", self.name, partition)
        }
    }

    /// `$projections-{name}-partitions`
    pub fn partition_catalog_stream(&self) -> String {
        format!("$projections-{}-partitions", self.name)
    }
}

// =============================================================================
// Delivered Events
// =============================================================================

/// An event delivered to a projection by a reader.
///
/// `position_stream_id`/`position_sequence` describe where the reader found
/// the event, which differs from where it was written when the reader follows
/// an index or link stream (e.g. `$et-OrderPlaced`).
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedEvent {
    /// Stream the event was written to.
    pub event_stream_id: String,
    /// Sequence number in `event_stream_id`.
    pub event_number: i64,
    /// Stream the reader read the event from.
    pub position_stream_id: String,
    /// Sequence number in `position_stream_id`.
    pub position_sequence: i64,
    /// Global log position.
    pub position: TfPos,
    /// Event type.
    pub event_type: String,
    /// Payload.
    pub data: String,
    /// Metadata.
    pub metadata: String,
    /// Whether `data` is JSON.
    pub is_json: bool,
    /// Tag assigned upstream by catalog-driven readers.
    pub pre_tagged: Option<CheckpointTag>,
}

impl ReceivedEvent {
    /// Creates an event read directly from the stream it was written to.
    pub fn new(
        stream_id: impl Into<String>,
        event_number: i64,
        position: TfPos,
        event_type: impl Into<String>,
        data: impl Into<String>,
    ) -> Self {
        let stream_id = stream_id.into();
        Self {
            position_stream_id: stream_id.clone(),
            event_stream_id: stream_id,
            event_number,
            position_sequence: event_number,
            position,
            event_type: event_type.into(),
            data: data.into(),
            metadata: String::new(),
            is_json: true,
            pre_tagged: None,
        }
    }

    /// Marks the event as found in another stream (index or link stream).
    pub fn with_position_stream(mut self, stream: impl Into<String>, sequence: i64) -> Self {
        self.position_stream_id = stream.into();
        self.position_sequence = sequence;
        self
    }

    /// Attaches an upstream tag.
    pub fn with_pre_tagged(mut self, tag: CheckpointTag) -> Self {
        self.pre_tagged = Some(tag);
        self
    }

    /// Attaches metadata.
    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    /// Payload size used for unhandled-bytes accounting.
    pub fn size(&self) -> usize {
        self.data.len() + self.metadata.len()
    }

    /// `number@stream` reference, recorded as `$causedBy` on emitted events.
    pub fn event_link(&self) -> String {
        format!("{}@{}", self.event_number, self.event_stream_id)
    }

    /// `$correlationId` of the metadata, if the metadata is a JSON object
    /// carrying one.
    pub fn correlation_id(&self) -> Option<String> {
        if self.metadata.is_empty() {
            return None;
        }
        let Ok(Value::Object(metadata)) = serde_json::from_str::<Value>(&self.metadata) else {
            return None;
        };
        metadata
            .get("$correlationId")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

// =============================================================================
// Partition State
// =============================================================================

/// Folded state of one partition.
///
/// `state` and `result` are JSON text. `state` is empty for a partition that
/// has not seen any event yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionState {
    /// Folded state.
    pub state: String,
    /// Optional result derived from the state.
    pub result: Option<String>,
    /// Tag at which the state became valid.
    pub caused_by: CheckpointTag,
}

impl PartitionState {
    /// Creates a partition state.
    pub fn new(state: impl Into<String>, result: Option<String>, caused_by: CheckpointTag) -> Self {
        Self {
            state: state.into(),
            result,
            caused_by,
        }
    }

    /// An empty state valid from `zero`.
    pub fn empty(zero: CheckpointTag) -> Self {
        Self::new("", None, zero)
    }

    /// Two states differ when either their state or their result differs.
    pub fn is_changed(&self, newer: &PartitionState) -> bool {
        self.state != newer.state || self.result != newer.result
    }

    /// Serializes as `[state]` or `[state,result]`.
    pub fn serialize(&self) -> Result<String> {
        match &self.result {
            Some(_) if self.state.is_empty() => Err(Error::InvalidState(
                "a partition state with a result cannot have an empty state".to_string(),
            )),
            Some(result) => Ok(format!("[{},{}]", self.state, result)),
            None => Ok(format!("[{}]", self.state)),
        }
    }

    /// Parses the output of [`PartitionState::serialize`].
    ///
    /// A bare JSON object is accepted as a state without a result. `None` and
    /// empty input give an empty state.
    pub fn deserialize(serialized: Option<&str>, caused_by: CheckpointTag) -> Result<Self> {
        let text = match serialized {
            Some(text) if !text.trim().is_empty() => text,
            _ => return Ok(Self::empty(caused_by)),
        };
        let value: Value = serde_json::from_str(text)?;
        let (state, result) = match value {
            Value::Array(items) => {
                let mut items = items.into_iter();
                let state = items.next();
                let result = items.next();
                (state, result)
            }
            object @ Value::Object(_) => (Some(object), None),
            other => {
                return Err(Error::CheckpointFormat(format!(
                    "unexpected partition state '{}'",
                    other
                )))
            }
        };
        let state = match state {
            Some(v) => serde_json::to_string(&v)?,
            None => String::new(),
        };
        let result = result.map(|v| serde_json::to_string(&v)).transpose()?;
        Ok(Self::new(state, result, caused_by))
    }
}

// =============================================================================
// Emitted Events
// =============================================================================

/// An event a projection writes to a derived output stream.
#[derive(Debug, Clone, PartialEq)]
pub struct EmittedEvent {
    /// Target stream.
    pub stream_id: String,
    /// Event type.
    pub event_type: String,
    /// Payload (`None` for deletion markers such as `ResultRemoved`).
    pub data: Option<String>,
    /// Whether `data` is JSON.
    pub is_json: bool,
    /// Tag of the event that produced this one.
    pub caused_by_tag: CheckpointTag,
    /// When set, the stream's last written tag must equal this one.
    pub expected_tag: Option<CheckpointTag>,
    /// Id of the event that produced this one (`$causedBy`).
    pub caused_by: Option<String>,
    /// Correlation id carried from the source event (`$correlationId`).
    pub correlation_id: Option<String>,
    /// Additional metadata written next to the tag record.
    pub extra_metadata: Map<String, Value>,
}

impl EmittedEvent {
    /// Creates an emitted event.
    pub fn new(
        stream_id: impl Into<String>,
        event_type: impl Into<String>,
        data: Option<String>,
        caused_by_tag: CheckpointTag,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            event_type: event_type.into(),
            data,
            is_json: true,
            caused_by_tag,
            expected_tag: None,
            caused_by: None,
            correlation_id: None,
            extra_metadata: Map::new(),
        }
    }

    /// Requires the stream's last written tag to be `tag`.
    pub fn with_expected_tag(mut self, tag: CheckpointTag) -> Self {
        self.expected_tag = Some(tag);
        self
    }

    /// Marks the payload as plain text.
    pub fn not_json(mut self) -> Self {
        self.is_json = false;
        self
    }

    /// Metadata written with the event: extras first, then `$causedBy` and
    /// `$correlationId` unless an extra already carries one.
    pub fn metadata_extras(&self) -> Map<String, Value> {
        let mut extras: Map<String, Value> = self
            .extra_metadata
            .iter()
            .filter(|(key, _)| key.as_str() != "$causedBy")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(caused_by) = &self.caused_by {
            extras.insert("$causedBy".to_string(), Value::String(caused_by.clone()));
        }
        if let Some(correlation_id) = &self.correlation_id {
            extras
                .entry("$correlationId".to_string())
                .or_insert_with(|| Value::String(correlation_id.clone()));
        }
        extras
    }
}

// =============================================================================
// Tests
// =============================================================================
