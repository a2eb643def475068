//! # Position Taggers
//!
//! A [`PositionTagger`] turns a delivered event into a [`CheckpointTag`]. There
//! is one implementation per read strategy:
//!
//! | Tagger | Reads | Tag mode |
//! |--------|-------|----------|
//! | [`StreamPositionTagger`] | one stream | `Stream` |
//! | [`MultiStreamPositionTagger`] | a fixed set of streams | `MultiStream` |
//! | [`EventTypeIndexPositionTagger`] | `$et-{type}` index streams, then the log | `EventTypeIndex` |
//! | [`TransactionFilePositionTagger`] | the global log | `Position` |
//! | [`PreparePositionTagger`] | the global log by prepare offset | `PreparePosition` |
//! | [`PreTaggedPositionTagger`] | catalog-driven readers that tag upstream | `ByStream` |
//!
//! ## The Dedup Contract
//!
//! Readers may hand a subscriber an event it has already seen, for example
//! when a consumer catches up to a shared cache of recent events. The tagger,
//! not the reader, decides whether an event is new:
//!
//! ```text
//! event ──► is_message_after_checkpoint_tag(last, event)?
//!              │ no  → drop silently (idempotent redelivery)
//!              │ yes
//!              ▼
//!           make_checkpoint_tag(last, event) ──► new tag (strictly after `last`)
//! ```
//!
//! `make_checkpoint_tag` rejects events from another phase or from a stream
//! outside the tagger's sources with [`Error::Misrouted`]: that is a wiring bug,
//! never a runtime condition.
//!
//! ## Adjusting Persisted Tags
//!
//! [`PositionTagger::adjust_tag`] converts a tag loaded from a checkpoint into
//! the representation the tagger works with. Tags from an earlier phase pass
//! through unchanged; tags from a later phase are rejected; conversions with no
//! meaningful mapping fail with [`Error::UnsupportedConversion`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::tag::{ByStreamPosition, CheckpointTag, TagMode, TagPosition, TfPos, NO_STREAM};
use crate::types::ReceivedEvent;
use crate::{Error, Result};

/// Prefix of event-type index streams.
pub const EVENT_TYPE_INDEX_PREFIX: &str = "$et-";

// =============================================================================
// Tagger Inputs
// =============================================================================

/// A partition (data stream) has been read to its end by a catalog reader.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionEof {
    /// Partition that reached its end.
    pub partition: String,
    /// Tag assigned upstream, for catalog-driven readers.
    pub pre_tagged: Option<CheckpointTag>,
}

/// A partition's stream has been deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionDeleted {
    /// Deleted partition.
    pub partition: String,
    /// Log position of the delete record (or of the link pointing to it).
    pub position: Option<TfPos>,
    /// Stream the reader saw the deletion in.
    pub position_stream_id: Option<String>,
    /// Sequence number of the deletion in `position_stream_id`.
    pub position_event_number: Option<i64>,
    /// Tag assigned upstream, for catalog-driven readers.
    pub pre_tagged: Option<CheckpointTag>,
}

// =============================================================================
// The Trait
// =============================================================================

/// Builds, advances and validates checkpoint tags for one read strategy.
///
/// # Rust Pattern: Trait Objects
///
/// The engine holds taggers as `Arc<dyn PositionTagger>` so the reader
/// subscription, the checkpoint manager and emitted streams can share one
/// instance without knowing the concrete strategy.
pub trait PositionTagger: Send + Sync + fmt::Debug {
    /// Phase this tagger produces tags for.
    fn phase(&self) -> i32;

    /// The tag before the first event of this strategy.
    fn make_zero_checkpoint_tag(&self) -> CheckpointTag;

    /// Whether `tag` has the shape this tagger produces.
    fn is_compatible(&self, tag: &CheckpointTag) -> bool;

    /// Converts a persisted tag into this tagger's representation.
    fn adjust_tag(&self, tag: &CheckpointTag) -> Result<CheckpointTag>;

    /// Whether `event` is genuinely new relative to `previous`.
    fn is_message_after_checkpoint_tag(&self, previous: &CheckpointTag, event: &ReceivedEvent) -> Result<bool>;

    /// Tag of `event`, given the last emitted tag.
    fn make_checkpoint_tag(&self, previous: &CheckpointTag, event: &ReceivedEvent) -> Result<CheckpointTag>;

    /// Tag of a partition end-of-stream notification.
    fn make_partition_eof_tag(&self, previous: &CheckpointTag, eof: &PartitionEof) -> Result<CheckpointTag> {
        let _ = previous;
        Err(Error::Misrouted(format!(
            "partition eof for '{}' is not supported by {:?}",
            eof.partition, self
        )))
    }

    /// Tag of a partition deletion notification.
    fn make_partition_deleted_tag(
        &self,
        previous: &CheckpointTag,
        deleted: &PartitionDeleted,
    ) -> Result<CheckpointTag>;
}

// =============================================================================
// Shared Rules
// =============================================================================

fn ensure_phase(phase: i32, previous: &CheckpointTag) -> Result<()> {
    if previous.phase() != phase {
        return Err(Error::Misrouted(format!(
            "Invalid checkpoint tag phase. Expected: {} Was: {}",
            phase,
            previous.phase()
        )));
    }
    Ok(())
}

/// `Some(tag)` when the tag belongs to an earlier phase and passes through.
fn pass_earlier_phase(phase: i32, tag: &CheckpointTag) -> Result<Option<CheckpointTag>> {
    if tag.phase() < phase {
        return Ok(Some(tag.clone()));
    }
    if tag.phase() > phase {
        return Err(Error::IncompatibleTag {
            tag: tag.to_string(),
            reason: format!("Invalid checkpoint tag phase. Expected less or equal to: {}", phase),
        });
    }
    Ok(None)
}

fn unsupported(tag: &CheckpointTag, to: TagMode) -> Error {
    Error::UnsupportedConversion {
        from: tag.mode().to_string(),
        to: to.to_string(),
    }
}

fn require_tf_pos(tag: &CheckpointTag) -> Result<TfPos> {
    tag.tf_pos().ok_or_else(|| Error::IncompatibleTag {
        tag: tag.to_string(),
        reason: "a log position is required".to_string(),
    })
}

// =============================================================================
// Single Stream
// =============================================================================

/// Tags events of one stream by their sequence number.
#[derive(Debug, Clone)]
pub struct StreamPositionTagger {
    phase: i32,
    stream: String,
}

impl StreamPositionTagger {
    /// Creates a tagger for `stream`.
    pub fn new(phase: i32, stream: impl Into<String>) -> Self {
        Self {
            phase,
            stream: stream.into(),
        }
    }
}

impl PositionTagger for StreamPositionTagger {
    fn phase(&self) -> i32 {
        self.phase
    }

    fn make_zero_checkpoint_tag(&self) -> CheckpointTag {
        CheckpointTag::from_stream_position(self.phase, self.stream.clone(), NO_STREAM)
            .unwrap_or_else(|_| CheckpointTag::from_phase(self.phase, false))
    }

    fn is_compatible(&self, tag: &CheckpointTag) -> bool {
        matches!(tag.position(), TagPosition::Stream { stream, .. } if *stream == self.stream)
    }

    fn adjust_tag(&self, tag: &CheckpointTag) -> Result<CheckpointTag> {
        if let Some(earlier) = pass_earlier_phase(self.phase, tag)? {
            return Ok(earlier);
        }
        match tag.position() {
            TagPosition::Stream { .. } => CheckpointTag::from_stream_position(
                tag.phase(),
                self.stream.clone(),
                tag.stream_sequence(&self.stream).unwrap_or(NO_STREAM),
            ),
            _ => Err(unsupported(tag, TagMode::Stream)),
        }
    }

    fn is_message_after_checkpoint_tag(&self, previous: &CheckpointTag, event: &ReceivedEvent) -> Result<bool> {
        if previous.phase() < self.phase {
            return Ok(true);
        }
        let last = match previous.position() {
            TagPosition::Stream { sequence, .. } => *sequence,
            _ => {
                return Err(Error::IncompatibleTag {
                    tag: previous.to_string(),
                    reason: "a stream position is required".to_string(),
                })
            }
        };
        Ok(event.position_stream_id == self.stream && event.position_sequence > last)
    }

    fn make_checkpoint_tag(&self, previous: &CheckpointTag, event: &ReceivedEvent) -> Result<CheckpointTag> {
        ensure_phase(self.phase, previous)?;
        if event.position_stream_id != self.stream {
            return Err(Error::Misrouted(format!(
                "Invalid stream '{}'. Expected stream is '{}'",
                event.position_stream_id, self.stream
            )));
        }
        CheckpointTag::from_stream_position(self.phase, self.stream.clone(), event.position_sequence)
    }

    fn make_partition_deleted_tag(
        &self,
        previous: &CheckpointTag,
        deleted: &PartitionDeleted,
    ) -> Result<CheckpointTag> {
        ensure_phase(self.phase, previous)?;
        match (&deleted.position_stream_id, deleted.position_event_number) {
            (Some(stream), Some(number)) if *stream == self.stream => {
                CheckpointTag::from_stream_position(self.phase, self.stream.clone(), number)
            }
            _ => Err(Error::Misrouted(format!(
                "deletion of '{}' was not observed in stream '{}'",
                deleted.partition, self.stream
            ))),
        }
    }
}

// =============================================================================
// Multiple Streams
// =============================================================================

/// Tags events of a fixed set of streams with a vector of sequence numbers.
#[derive(Debug, Clone)]
pub struct MultiStreamPositionTagger {
    phase: i32,
    streams: BTreeSet<String>,
}

impl MultiStreamPositionTagger {
    /// Creates a tagger over `streams`.
    pub fn new<I, S>(phase: i32, streams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            phase,
            streams: streams.into_iter().map(Into::into).collect(),
        }
    }

    fn positions_from(&self, phase: i32, tag: &CheckpointTag) -> Result<CheckpointTag> {
        CheckpointTag::from_stream_positions(
            phase,
            self.streams
                .iter()
                .map(|s| (s.clone(), tag.stream_sequence(s).unwrap_or(NO_STREAM))),
        )
    }
}

impl PositionTagger for MultiStreamPositionTagger {
    fn phase(&self) -> i32 {
        self.phase
    }

    fn make_zero_checkpoint_tag(&self) -> CheckpointTag {
        CheckpointTag::from_stream_positions(self.phase, self.streams.iter().map(|s| (s.clone(), NO_STREAM)))
            .unwrap_or_else(|_| CheckpointTag::from_phase(self.phase, false))
    }

    fn is_compatible(&self, tag: &CheckpointTag) -> bool {
        match tag.position() {
            TagPosition::MultiStream(streams) => streams.keys().eq(self.streams.iter()),
            _ => false,
        }
    }

    fn adjust_tag(&self, tag: &CheckpointTag) -> Result<CheckpointTag> {
        if let Some(earlier) = pass_earlier_phase(self.phase, tag)? {
            return Ok(earlier);
        }
        match tag.mode() {
            TagMode::MultiStream | TagMode::Stream => self.positions_from(tag.phase(), tag),
            _ => Err(unsupported(tag, TagMode::MultiStream)),
        }
    }

    fn is_message_after_checkpoint_tag(&self, previous: &CheckpointTag, event: &ReceivedEvent) -> Result<bool> {
        if previous.phase() < self.phase {
            return Ok(true);
        }
        if previous.mode() != TagMode::MultiStream {
            return Err(Error::IncompatibleTag {
                tag: previous.to_string(),
                reason: "a multi-stream position is required".to_string(),
            });
        }
        if !self.streams.contains(&event.position_stream_id) {
            return Ok(false);
        }
        let last = previous
            .stream_sequence(&event.position_stream_id)
            .unwrap_or(NO_STREAM);
        Ok(event.position_sequence > last)
    }

    fn make_checkpoint_tag(&self, previous: &CheckpointTag, event: &ReceivedEvent) -> Result<CheckpointTag> {
        ensure_phase(self.phase, previous)?;
        if !self.streams.contains(&event.position_stream_id) {
            return Err(Error::Misrouted(format!(
                "Invalid stream '{}'. Expected one of: {:?}",
                event.position_stream_id, self.streams
            )));
        }
        previous.update_stream_position(&event.position_stream_id, event.position_sequence)
    }

    fn make_partition_deleted_tag(
        &self,
        previous: &CheckpointTag,
        deleted: &PartitionDeleted,
    ) -> Result<CheckpointTag> {
        ensure_phase(self.phase, previous)?;
        match (&deleted.position_stream_id, deleted.position_event_number) {
            (Some(stream), Some(number)) if self.streams.contains(stream) => {
                previous.update_stream_position(stream, number)
            }
            _ => Err(Error::Misrouted(format!(
                "deletion of '{}' was not observed in any of {:?}",
                deleted.partition, self.streams
            ))),
        }
    }
}

// =============================================================================
// Event Type Index
// =============================================================================

/// Tags events read through `$et-{type}` index streams, falling back to the
/// global log once the index is exhausted.
#[derive(Debug, Clone)]
pub struct EventTypeIndexPositionTagger {
    phase: i32,
    event_types: BTreeSet<String>,
}

impl EventTypeIndexPositionTagger {
    /// Creates a tagger for `event_types`.
    pub fn new<I, S>(phase: i32, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            phase,
            event_types: event_types.into_iter().map(Into::into).collect(),
        }
    }

    /// Event type of an index stream name, if it is one.
    fn index_event_type<'a>(&self, stream: &'a str) -> Option<&'a str> {
        stream.strip_prefix(EVENT_TYPE_INDEX_PREFIX)
    }

    fn hints_from(&self, tag: &CheckpointTag) -> Vec<(String, i64)> {
        self.event_types
            .iter()
            .map(|t| (t.clone(), tag.stream_sequence(t).unwrap_or(NO_STREAM)))
            .collect()
    }
}

impl PositionTagger for EventTypeIndexPositionTagger {
    fn phase(&self) -> i32 {
        self.phase
    }

    fn make_zero_checkpoint_tag(&self) -> CheckpointTag {
        CheckpointTag::from_event_type_index_positions(
            self.phase,
            TfPos::ZERO,
            self.event_types.iter().map(|t| (t.clone(), NO_STREAM)),
        )
        .unwrap_or_else(|_| CheckpointTag::from_phase(self.phase, false))
    }

    fn is_compatible(&self, tag: &CheckpointTag) -> bool {
        tag.mode() == TagMode::EventTypeIndex
    }

    fn adjust_tag(&self, tag: &CheckpointTag) -> Result<CheckpointTag> {
        if let Some(earlier) = pass_earlier_phase(self.phase, tag)? {
            return Ok(earlier);
        }
        match tag.mode() {
            TagMode::EventTypeIndex | TagMode::Position => CheckpointTag::from_event_type_index_positions(
                tag.phase(),
                require_tf_pos(tag)?,
                self.hints_from(tag),
            ),
            _ => Err(unsupported(tag, TagMode::EventTypeIndex)),
        }
    }

    fn is_message_after_checkpoint_tag(&self, previous: &CheckpointTag, event: &ReceivedEvent) -> Result<bool> {
        if previous.phase() < self.phase {
            return Ok(true);
        }
        if previous.mode() != TagMode::EventTypeIndex {
            return Err(Error::IncompatibleTag {
                tag: previous.to_string(),
                reason: "an event-type-index position is required".to_string(),
            });
        }
        match self.index_event_type(&event.position_stream_id) {
            Some(event_type) => {
                let last = previous.stream_sequence(event_type).unwrap_or(NO_STREAM);
                Ok(self.event_types.contains(event_type) && event.position_sequence > last)
            }
            None => Ok(event.position > require_tf_pos(previous)?),
        }
    }

    fn make_checkpoint_tag(&self, previous: &CheckpointTag, event: &ReceivedEvent) -> Result<CheckpointTag> {
        ensure_phase(self.phase, previous)?;
        match self.index_event_type(&event.position_stream_id) {
            Some(event_type) => {
                if !self.event_types.contains(event_type) {
                    return Err(Error::Misrouted(format!(
                        "Invalid index stream '{}'. Expected event types: {:?}",
                        event.position_stream_id, self.event_types
                    )));
                }
                previous.update_event_type_index_position(
                    event.position,
                    Some((event_type, event.position_sequence)),
                )
            }
            None => {
                if !self.event_types.contains(&event.event_type) {
                    return Err(Error::Misrouted(format!(
                        "Invalid event type '{}'. Expected event types: {:?}",
                        event.event_type, self.event_types
                    )));
                }
                previous.update_event_type_index_position(event.position, None)
            }
        }
    }

    fn make_partition_deleted_tag(
        &self,
        previous: &CheckpointTag,
        deleted: &PartitionDeleted,
    ) -> Result<CheckpointTag> {
        ensure_phase(self.phase, previous)?;
        let position = deleted.position.ok_or_else(|| {
            Error::Misrouted(format!("deletion of '{}' carries no log position", deleted.partition))
        })?;
        previous.update_event_type_index_position(position, None)
    }
}

// =============================================================================
// Global Log
// =============================================================================

/// Tags events by their global log position.
#[derive(Debug, Clone)]
pub struct TransactionFilePositionTagger {
    phase: i32,
}

impl TransactionFilePositionTagger {
    /// Creates a log-position tagger.
    pub fn new(phase: i32) -> Self {
        Self { phase }
    }
}

impl PositionTagger for TransactionFilePositionTagger {
    fn phase(&self) -> i32 {
        self.phase
    }

    fn make_zero_checkpoint_tag(&self) -> CheckpointTag {
        CheckpointTag::from_position(self.phase, TfPos::ZERO.commit(), TfPos::ZERO.prepare())
    }

    fn is_compatible(&self, tag: &CheckpointTag) -> bool {
        tag.mode() == TagMode::Position
    }

    fn adjust_tag(&self, tag: &CheckpointTag) -> Result<CheckpointTag> {
        if let Some(earlier) = pass_earlier_phase(self.phase, tag)? {
            return Ok(earlier);
        }
        match tag.mode() {
            TagMode::Position | TagMode::EventTypeIndex => {
                let pos = require_tf_pos(tag)?;
                Ok(CheckpointTag::from_position(tag.phase(), pos.commit(), pos.prepare()))
            }
            _ => Err(unsupported(tag, TagMode::Position)),
        }
    }

    fn is_message_after_checkpoint_tag(&self, previous: &CheckpointTag, event: &ReceivedEvent) -> Result<bool> {
        if previous.phase() < self.phase {
            return Ok(true);
        }
        Ok(event.position > require_tf_pos(previous)?)
    }

    fn make_checkpoint_tag(&self, previous: &CheckpointTag, event: &ReceivedEvent) -> Result<CheckpointTag> {
        ensure_phase(self.phase, previous)?;
        Ok(CheckpointTag::from_position(
            self.phase,
            event.position.commit(),
            event.position.prepare(),
        ))
    }

    fn make_partition_deleted_tag(
        &self,
        previous: &CheckpointTag,
        deleted: &PartitionDeleted,
    ) -> Result<CheckpointTag> {
        ensure_phase(self.phase, previous)?;
        let position = deleted.position.ok_or_else(|| {
            Error::Misrouted(format!("deletion of '{}' carries no log position", deleted.partition))
        })?;
        Ok(CheckpointTag::from_position(self.phase, position.commit(), position.prepare()))
    }
}

/// Tags events by their prepare offset only.
#[derive(Debug, Clone)]
pub struct PreparePositionTagger {
    phase: i32,
}

impl PreparePositionTagger {
    /// Creates a prepare-offset tagger.
    pub fn new(phase: i32) -> Self {
        Self { phase }
    }

    fn last_prepare(previous: &CheckpointTag) -> Result<i64> {
        match previous.position() {
            TagPosition::PreparePosition(prepare) => Ok(*prepare),
            _ => Err(Error::IncompatibleTag {
                tag: previous.to_string(),
                reason: "a prepare position is required".to_string(),
            }),
        }
    }
}

impl PositionTagger for PreparePositionTagger {
    fn phase(&self) -> i32 {
        self.phase
    }

    fn make_zero_checkpoint_tag(&self) -> CheckpointTag {
        CheckpointTag::from_prepare_position(self.phase, -1)
    }

    fn is_compatible(&self, tag: &CheckpointTag) -> bool {
        tag.mode() == TagMode::PreparePosition
    }

    fn adjust_tag(&self, tag: &CheckpointTag) -> Result<CheckpointTag> {
        if let Some(earlier) = pass_earlier_phase(self.phase, tag)? {
            return Ok(earlier);
        }
        match tag.position() {
            TagPosition::PreparePosition(_) => Ok(tag.clone()),
            TagPosition::Position(pos) | TagPosition::EventTypeIndex { position: pos, .. } => {
                Ok(CheckpointTag::from_prepare_position(tag.phase(), pos.prepare()))
            }
            _ => Err(unsupported(tag, TagMode::PreparePosition)),
        }
    }

    fn is_message_after_checkpoint_tag(&self, previous: &CheckpointTag, event: &ReceivedEvent) -> Result<bool> {
        if previous.phase() < self.phase {
            return Ok(true);
        }
        Ok(event.position.prepare() > Self::last_prepare(previous)?)
    }

    fn make_checkpoint_tag(&self, previous: &CheckpointTag, event: &ReceivedEvent) -> Result<CheckpointTag> {
        ensure_phase(self.phase, previous)?;
        Ok(CheckpointTag::from_prepare_position(self.phase, event.position.prepare()))
    }

    fn make_partition_deleted_tag(
        &self,
        previous: &CheckpointTag,
        deleted: &PartitionDeleted,
    ) -> Result<CheckpointTag> {
        ensure_phase(self.phase, previous)?;
        let position = deleted.position.ok_or_else(|| {
            Error::Misrouted(format!("deletion of '{}' carries no log position", deleted.partition))
        })?;
        Ok(CheckpointTag::from_prepare_position(self.phase, position.prepare()))
    }
}

// =============================================================================
// Pre-tagged (Catalog-driven)
// =============================================================================

/// Accepts tags assigned upstream by a catalog-driven reader.
#[derive(Debug, Clone)]
pub struct PreTaggedPositionTagger {
    phase: i32,
    catalog_stream: String,
}

impl PreTaggedPositionTagger {
    /// Creates a tagger for readers driven by `catalog_stream`.
    pub fn new(phase: i32, catalog_stream: impl Into<String>) -> Self {
        Self {
            phase,
            catalog_stream: catalog_stream.into(),
        }
    }

    fn accept(&self, previous: &CheckpointTag, pre_tagged: Option<&CheckpointTag>, what: &str) -> Result<CheckpointTag> {
        ensure_phase(self.phase, previous)?;
        let tag = pre_tagged.ok_or_else(|| Error::Misrouted(format!("{} carries no upstream tag", what)))?;
        if tag.phase() != self.phase || !self.is_compatible(tag) {
            return Err(Error::Misrouted(format!(
                "{} was tagged '{}' which does not belong to catalog '{}' in phase {}",
                what, tag, self.catalog_stream, self.phase
            )));
        }
        Ok(tag.clone())
    }
}

impl PositionTagger for PreTaggedPositionTagger {
    fn phase(&self) -> i32 {
        self.phase
    }

    fn make_zero_checkpoint_tag(&self) -> CheckpointTag {
        CheckpointTag::from_by_stream_position(
            self.phase,
            ByStreamPosition {
                catalog_stream: self.catalog_stream.clone(),
                catalog_position: NO_STREAM,
                data_stream: None,
                data_position: NO_STREAM,
                commit_position: -1,
            },
        )
        .unwrap_or_else(|_| CheckpointTag::from_phase(self.phase, false))
    }

    fn is_compatible(&self, tag: &CheckpointTag) -> bool {
        matches!(tag.position(), TagPosition::ByStream(p) if p.catalog_stream == self.catalog_stream)
    }

    fn adjust_tag(&self, tag: &CheckpointTag) -> Result<CheckpointTag> {
        if let Some(earlier) = pass_earlier_phase(self.phase, tag)? {
            return Ok(earlier);
        }
        if self.is_compatible(tag) {
            return Ok(tag.clone());
        }
        Err(unsupported(tag, TagMode::ByStream))
    }

    fn is_message_after_checkpoint_tag(&self, previous: &CheckpointTag, event: &ReceivedEvent) -> Result<bool> {
        if previous.phase() < self.phase {
            return Ok(true);
        }
        match &event.pre_tagged {
            Some(tag) => tag.is_after(previous),
            None => Err(Error::Misrouted(format!(
                "event {}@{} carries no upstream tag",
                event.event_number, event.event_stream_id
            ))),
        }
    }

    fn make_checkpoint_tag(&self, previous: &CheckpointTag, event: &ReceivedEvent) -> Result<CheckpointTag> {
        self.accept(
            previous,
            event.pre_tagged.as_ref(),
            &format!("event {}@{}", event.event_number, event.event_stream_id),
        )
    }

    fn make_partition_eof_tag(&self, previous: &CheckpointTag, eof: &PartitionEof) -> Result<CheckpointTag> {
        self.accept(
            previous,
            eof.pre_tagged.as_ref(),
            &format!("partition eof '{}'", eof.partition),
        )
    }

    fn make_partition_deleted_tag(
        &self,
        previous: &CheckpointTag,
        deleted: &PartitionDeleted,
    ) -> Result<CheckpointTag> {
        self.accept(
            previous,
            deleted.pre_tagged.as_ref(),
            &format!("partition deletion '{}'", deleted.partition),
        )
    }
}

// =============================================================================
// Position Tracker
// =============================================================================

/// The last tag a component has seen, advanced strictly forward.
#[derive(Debug, Clone)]
pub struct PositionTracker {
    tagger: Arc<dyn PositionTagger>,
    last_tag: Option<CheckpointTag>,
}

impl PositionTracker {
    /// Creates an uninitialized tracker.
    pub fn new(tagger: Arc<dyn PositionTagger>) -> Self {
        Self { tagger, last_tag: None }
    }

    /// Last recorded tag.
    pub fn last_tag(&self) -> Option<&CheckpointTag> {
        self.last_tag.as_ref()
    }

    /// Sets the starting tag.
    pub fn update_by_checkpoint_tag_initial(&mut self, tag: CheckpointTag) -> Result<()> {
        self.ensure_compatible(&tag)?;
        self.last_tag = Some(tag);
        Ok(())
    }

    /// Moves to `tag`, which must be strictly after the current tag.
    pub fn update_by_checkpoint_tag_forward(&mut self, tag: CheckpointTag) -> Result<()> {
        let last = self
            .last_tag
            .as_ref()
            .ok_or_else(|| Error::InvalidState("Initial position was not set".to_string()))?;
        if !tag.is_after(last)? {
            return Err(Error::OrderingViolation(format!(
                "Event at checkpoint tag {} has been already processed (last processed: {})",
                tag, last
            )));
        }
        self.ensure_compatible(&tag)?;
        self.last_tag = Some(tag);
        Ok(())
    }

    /// Forgets the current tag.
    pub fn initialize(&mut self) {
        self.last_tag = None;
    }

    fn ensure_compatible(&self, tag: &CheckpointTag) -> Result<()> {
        if tag.phase() == self.tagger.phase() && !self.tagger.is_compatible(tag) {
            return Err(Error::IncompatibleTag {
                tag: tag.to_string(),
                reason: format!("cannot track it with {:?}", self.tagger),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_checkpoint_tag, encode_checkpoint_tag};
    use crate::types::ProjectionVersion;
    use serde_json::Map;

    fn event(stream: &str, number: i64, commit: i64) -> ReceivedEvent {
        ReceivedEvent::new(stream, number, TfPos::new(commit, commit), "Thing", "{}")
    }

    #[test]
    fn test_stream_tagger_redelivery_is_dropped() {
        let tagger = StreamPositionTagger::new(0, "orders");
        let zero = tagger.make_zero_checkpoint_tag();
        let e = event("orders", 0, 100);

        assert!(tagger.is_message_after_checkpoint_tag(&zero, &e).unwrap());
        let tag = tagger.make_checkpoint_tag(&zero, &e).unwrap();
        assert_eq!(tag, CheckpointTag::from_stream_position(0, "orders", 0).unwrap());

        assert!(!tagger.is_message_after_checkpoint_tag(&tag, &e).unwrap());
        assert!(!tagger
            .is_message_after_checkpoint_tag(&tag, &event("other", 5, 200))
            .unwrap());
    }

    #[test]
    fn test_stream_tagger_rejects_misrouted_events() {
        let tagger = StreamPositionTagger::new(0, "orders");
        let zero = tagger.make_zero_checkpoint_tag();
        assert!(matches!(
            tagger.make_checkpoint_tag(&zero, &event("other", 0, 1)),
            Err(Error::Misrouted(_))
        ));
        let wrong_phase = CheckpointTag::from_stream_position(1, "orders", 0).unwrap();
        assert!(matches!(
            tagger.make_checkpoint_tag(&wrong_phase, &event("orders", 1, 1)),
            Err(Error::Misrouted(_))
        ));
    }

    #[test]
    fn test_multi_stream_scenario() {
        let tagger = MultiStreamPositionTagger::new(0, ["a", "b"]);
        let zero = tagger.make_zero_checkpoint_tag();
        assert_eq!(zero.stream_sequence("a"), Some(-1));
        assert_eq!(zero.stream_sequence("b"), Some(-1));

        let after_a = tagger.make_checkpoint_tag(&zero, &event("a", 0, 10)).unwrap();
        assert_eq!(after_a.stream_sequence("a"), Some(0));
        assert_eq!(after_a.stream_sequence("b"), Some(-1));

        let after_b = tagger.make_checkpoint_tag(&after_a, &event("b", 0, 20)).unwrap();
        assert_eq!(after_b.stream_sequence("a"), Some(0));
        assert_eq!(after_b.stream_sequence("b"), Some(0));
        assert!(after_b.is_after(&after_a).unwrap());

        // {a:0,b:-1} then {a:0,b:0} is a forward move on b, so the second
        // dominates. Incomparability needs each tag ahead on a different
        // stream, as with after_a and only_b below.
        let only_b = tagger.make_checkpoint_tag(&zero, &event("b", 0, 20)).unwrap();
        assert!(matches!(after_a.try_cmp(&only_b), Err(Error::IncomparableTags { .. })));
    }

    #[test]
    fn test_multi_stream_tagger_dedup_and_misrouting() {
        let tagger = MultiStreamPositionTagger::new(0, ["a", "b"]);
        let zero = tagger.make_zero_checkpoint_tag();
        let tag = tagger.make_checkpoint_tag(&zero, &event("a", 3, 10)).unwrap();
        assert!(!tagger.is_message_after_checkpoint_tag(&tag, &event("a", 3, 10)).unwrap());
        assert!(!tagger.is_message_after_checkpoint_tag(&tag, &event("a", 2, 9)).unwrap());
        assert!(tagger.is_message_after_checkpoint_tag(&tag, &event("b", 0, 11)).unwrap());
        assert!(!tagger.is_message_after_checkpoint_tag(&tag, &event("c", 0, 12)).unwrap());
        assert!(matches!(
            tagger.make_checkpoint_tag(&tag, &event("c", 0, 12)),
            Err(Error::Misrouted(_))
        ));
    }

    #[test]
    fn test_multi_stream_adjust_fills_missing_streams() {
        let tagger = MultiStreamPositionTagger::new(0, ["a", "b"]);
        let old = CheckpointTag::from_stream_position(0, "a", 7).unwrap();
        let adjusted = tagger.adjust_tag(&old).unwrap();
        assert!(tagger.is_compatible(&adjusted));
        assert_eq!(adjusted.stream_sequence("a"), Some(7));
        assert_eq!(adjusted.stream_sequence("b"), Some(-1));
    }

    #[test]
    fn test_event_type_index_tagger() {
        let tagger = EventTypeIndexPositionTagger::new(0, ["Placed", "Shipped"]);
        let zero = tagger.make_zero_checkpoint_tag();

        let from_index = event("order-1", 0, 100).with_position_stream("$et-Placed", 0);
        assert!(tagger.is_message_after_checkpoint_tag(&zero, &from_index).unwrap());
        let tag = tagger.make_checkpoint_tag(&zero, &from_index).unwrap();
        assert_eq!(tag.stream_sequence("Placed"), Some(0));
        assert_eq!(tag.tf_pos(), Some(TfPos::new(100, 100)));
        assert!(!tagger.is_message_after_checkpoint_tag(&tag, &from_index).unwrap());

        let mut from_log = event("order-2", 0, 150);
        from_log.event_type = "Shipped".to_string();
        assert!(tagger.is_message_after_checkpoint_tag(&tag, &from_log).unwrap());
        let next = tagger.make_checkpoint_tag(&tag, &from_log).unwrap();
        assert!(next.is_after(&tag).unwrap());

        let foreign_index = event("x", 0, 200).with_position_stream("$et-Other", 0);
        assert!(matches!(
            tagger.make_checkpoint_tag(&next, &foreign_index),
            Err(Error::Misrouted(_))
        ));
    }

    #[test]
    fn test_transaction_file_tagger() {
        let tagger = TransactionFilePositionTagger::new(0);
        let zero = tagger.make_zero_checkpoint_tag();
        let e = event("any", 5, 300);
        assert!(tagger.is_message_after_checkpoint_tag(&zero, &e).unwrap());
        let tag = tagger.make_checkpoint_tag(&zero, &e).unwrap();
        assert_eq!(tag, CheckpointTag::from_position(0, 300, 300));
        assert!(!tagger.is_message_after_checkpoint_tag(&tag, &e).unwrap());
    }

    #[test]
    fn test_prepare_position_tagger() {
        let tagger = PreparePositionTagger::new(0);
        let zero = tagger.make_zero_checkpoint_tag();
        let tag = tagger.make_checkpoint_tag(&zero, &event("s", 0, 40)).unwrap();
        assert_eq!(tag, CheckpointTag::from_prepare_position(0, 40));
        let adjusted = tagger.adjust_tag(&CheckpointTag::from_position(0, 50, 45)).unwrap();
        assert_eq!(adjusted, CheckpointTag::from_prepare_position(0, 45));
    }

    #[test]
    fn test_pre_tagged_tagger() {
        let tagger = PreTaggedPositionTagger::new(0, "catalog");
        let zero = tagger.make_zero_checkpoint_tag();
        let tag = CheckpointTag::from_by_stream_position(
            0,
            ByStreamPosition {
                catalog_stream: "catalog".to_string(),
                catalog_position: 0,
                data_stream: Some("data".to_string()),
                data_position: 0,
                commit_position: 10,
            },
        )
        .unwrap();
        let e = event("data", 0, 10).with_pre_tagged(tag.clone());
        assert!(tagger.is_message_after_checkpoint_tag(&zero, &e).unwrap());
        assert_eq!(tagger.make_checkpoint_tag(&zero, &e).unwrap(), tag);
        assert!(!tagger.is_message_after_checkpoint_tag(&tag, &e).unwrap());

        let eof = PartitionEof {
            partition: "data".to_string(),
            pre_tagged: Some(tag.clone()),
        };
        assert_eq!(tagger.make_partition_eof_tag(&zero, &eof).unwrap(), tag);

        let untagged = event("data", 1, 11);
        assert!(matches!(
            tagger.make_checkpoint_tag(&tag, &untagged),
            Err(Error::Misrouted(_))
        ));
    }

    #[test]
    fn test_partition_deleted_tags() {
        let tf = TransactionFilePositionTagger::new(0);
        let deleted = PartitionDeleted {
            partition: "p".to_string(),
            position: Some(TfPos::new(70, 70)),
            position_stream_id: Some("p".to_string()),
            position_event_number: Some(3),
            pre_tagged: None,
        };
        let zero = tf.make_zero_checkpoint_tag();
        assert_eq!(
            tf.make_partition_deleted_tag(&zero, &deleted).unwrap(),
            CheckpointTag::from_position(0, 70, 70)
        );

        let stream = StreamPositionTagger::new(0, "p");
        assert_eq!(
            stream
                .make_partition_deleted_tag(&stream.make_zero_checkpoint_tag(), &deleted)
                .unwrap(),
            CheckpointTag::from_stream_position(0, "p", 3).unwrap()
        );
        assert!(tf.make_partition_eof_tag(&zero, &PartitionEof {
            partition: "p".to_string(),
            pre_tagged: None,
        })
        .is_err());
    }

    #[test]
    fn test_adjust_conversions() {
        let index = CheckpointTag::from_event_type_index_positions(0, TfPos::new(10, 5), [("x", 1)]).unwrap();
        let position = CheckpointTag::from_position(0, 10, 5);

        let tf = TransactionFilePositionTagger::new(0);
        assert_eq!(tf.adjust_tag(&index).unwrap().mode(), TagMode::Position);

        let eti = EventTypeIndexPositionTagger::new(0, ["x", "y"]);
        let upgraded = eti.adjust_tag(&position).unwrap();
        assert_eq!(upgraded.mode(), TagMode::EventTypeIndex);
        assert_eq!(upgraded.stream_sequence("y"), Some(-1));

        let stream = StreamPositionTagger::new(0, "s");
        let err = stream.adjust_tag(&index).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Conversion from EventTypeIndex to Stream position tag is not supported"
        );
        assert!(matches!(
            tf.adjust_tag(&CheckpointTag::from_stream_position(0, "s", 1).unwrap()),
            Err(Error::UnsupportedConversion { .. })
        ));
    }

    #[test]
    fn test_adjust_phase_rules() {
        let tagger = TransactionFilePositionTagger::new(1);
        let earlier = CheckpointTag::from_stream_position(0, "s", 4).unwrap();
        assert_eq!(tagger.adjust_tag(&earlier).unwrap(), earlier);

        let later = CheckpointTag::from_position(2, 1, 1);
        assert!(matches!(tagger.adjust_tag(&later), Err(Error::IncompatibleTag { .. })));
    }

    #[test]
    fn test_checkpoint_version_adjust_by() {
        let version = ProjectionVersion::new(3, 0, 1);
        let tagger = EventTypeIndexPositionTagger::new(0, ["x"]);
        let position = CheckpointTag::from_position(0, 10, 5);

        // Written by the same definition in this tagger's mode: used as is.
        let indexed = tagger.adjust_tag(&position).unwrap();
        let text = encode_checkpoint_tag(&indexed, Some(&version), &Map::new()).unwrap();
        let same = decode_checkpoint_tag(&text, &version).unwrap();
        assert_eq!(same.adjust_by(&tagger, &version).unwrap(), indexed);

        // Same definition but a mode this tagger cannot track: adjusted.
        let text = encode_checkpoint_tag(&position, Some(&version), &Map::new()).unwrap();
        let plain = decode_checkpoint_tag(&text, &version).unwrap();
        assert_eq!(plain.adjust_by(&tagger, &version).unwrap().mode(), TagMode::EventTypeIndex);

        // Written by an older definition: adjusted into this tagger's mode.
        let newer = ProjectionVersion::new(3, 0, 2);
        let adjusted = plain.adjust_by(&tagger, &newer).unwrap();
        assert_eq!(adjusted.mode(), TagMode::EventTypeIndex);
    }

    #[test]
    fn test_single_stream_multi_stream_tag_survives_checkpoint_record() {
        let version = ProjectionVersion::new(3, 0, 1);
        let tagger: Arc<dyn PositionTagger> = Arc::new(MultiStreamPositionTagger::new(0, ["a"]));
        let zero = tagger.make_zero_checkpoint_tag();
        let tag = tagger.make_checkpoint_tag(&zero, &event("a", 4, 10)).unwrap();
        assert_eq!(tag.mode(), TagMode::MultiStream);

        // A one-entry stream map reads back as a single-stream tag.
        let text = encode_checkpoint_tag(&tag, Some(&version), &Map::new()).unwrap();
        let stored = decode_checkpoint_tag(&text, &version).unwrap();
        assert_eq!(stored.tag.mode(), TagMode::Stream);

        let restored = stored.adjust_by(tagger.as_ref(), &version).unwrap();
        assert_eq!(restored.mode(), TagMode::MultiStream);
        assert_eq!(restored.stream_sequence("a"), Some(4));

        let mut tracker = PositionTracker::new(tagger.clone());
        tracker.update_by_checkpoint_tag_initial(restored.clone()).unwrap();
        let next = tagger.make_checkpoint_tag(&restored, &event("a", 5, 11)).unwrap();
        tracker.update_by_checkpoint_tag_forward(next).unwrap();
    }

    #[test]
    fn test_position_tracker_is_strictly_monotonic() {
        let tagger: Arc<dyn PositionTagger> = Arc::new(TransactionFilePositionTagger::new(0));
        let mut tracker = PositionTracker::new(tagger.clone());

        assert!(tracker
            .update_by_checkpoint_tag_forward(CheckpointTag::from_position(0, 1, 1))
            .is_err());

        tracker
            .update_by_checkpoint_tag_initial(tagger.make_zero_checkpoint_tag())
            .unwrap();
        tracker
            .update_by_checkpoint_tag_forward(CheckpointTag::from_position(0, 10, 10))
            .unwrap();
        assert!(matches!(
            tracker.update_by_checkpoint_tag_forward(CheckpointTag::from_position(0, 10, 10)),
            Err(Error::OrderingViolation(_))
        ));
        assert!(matches!(
            tracker.update_by_checkpoint_tag_forward(CheckpointTag::from_position(0, 5, 5)),
            Err(Error::OrderingViolation(_))
        ));
        assert!(tracker
            .update_by_checkpoint_tag_initial(CheckpointTag::from_stream_position(0, "s", 1).unwrap())
            .is_err());

        tracker.initialize();
        assert!(tracker.last_tag().is_none());
    }
}
