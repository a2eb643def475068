//! # Checkpoint Tags
//!
//! A [`CheckpointTag`] answers "where are we?" for a projection. It is both the
//! resume point after a restart and the ordering key that gates every write,
//! checkpoint and cache eviction decision in the engine.
//!
//! ## Modes
//!
//! Different read strategies need different coordinates, so a tag carries
//! exactly one [`TagPosition`]:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────────────────────────────────┐
//! │ Mode             │ Coordinates                                          │
//! ├──────────────────┼──────────────────────────────────────────────────────┤
//! │ Phase            │ sentinel: not started / completed                    │
//! │ Position         │ global log (commit, prepare)                         │
//! │ PreparePosition  │ global log prepare offset only                       │
//! │ Stream           │ one stream → sequence number                         │
//! │ MultiStream      │ fixed set of streams → sequence numbers              │
//! │ EventTypeIndex   │ (commit, prepare) + per-event-type sequence hints    │
//! │ ByStream         │ catalog stream position, data stream position        │
//! └──────────────────┴──────────────────────────────────────────────────────┘
//! ```
//!
//! Every tag also has a `phase`. Phases are compared first: a tag from a lower
//! phase is always earlier, whatever its mode.
//!
//! ## Ordering
//!
//! Tags are only *partially* ordered. Within a phase:
//!
//! - `Stream` and `MultiStream` compare with each other (a single stream is a
//!   one-entry vector), and so do `Position` and `EventTypeIndex` (the hints
//!   are ignored). Any other mode pair is [`Error::IncomparableTags`].
//! - `MultiStream` is a vector order. If each side is ahead on some stream the
//!   tags have diverged and comparison fails loudly.
//!
//! Because of this, `CheckpointTag` does not implement `PartialOrd`. Callers use
//! [`CheckpointTag::try_cmp`] and the `is_*` helpers, which return `Result`, so an
//! incomparable pair can never be mistaken for "not less than".
//!
//! ## Immutability
//!
//! Tags never change in place. The `update_*` methods return a new tag.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use crate::{Error, Result};

/// Sequence number of a stream position before the first event.
pub const NO_STREAM: i64 = -1;

// =============================================================================
// Global Log Position
// =============================================================================

/// A position in the global transaction log: commit offset, then prepare offset.
///
/// # Rust Pattern: Derived Ord
///
/// Deriving `Ord` on a struct compares fields in declaration order, which is
/// exactly "commit first, then prepare".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TfPos {
    commit: i64,
    prepare: i64,
}

impl TfPos {
    /// Position before the first record of the log.
    pub const ZERO: TfPos = TfPos { commit: 0, prepare: -1 };

    /// Creates a position from commit and prepare offsets.
    pub const fn new(commit: i64, prepare: i64) -> Self {
        Self { commit, prepare }
    }

    /// Commit offset.
    pub fn commit(&self) -> i64 {
        self.commit
    }

    /// Prepare offset.
    pub fn prepare(&self) -> i64 {
        self.prepare
    }
}

impl fmt::Display for TfPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C:{}/P:{}", self.commit, self.prepare)
    }
}

// =============================================================================
// Modes and Positions
// =============================================================================

/// Discriminator of a tag's representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagMode {
    /// Sentinel for "phase not started" / "phase completed".
    Phase,
    /// Global log commit + prepare offsets.
    Position,
    /// Global log prepare offset only.
    PreparePosition,
    /// A single stream.
    Stream,
    /// A fixed set of streams.
    MultiStream,
    /// Global log position plus event-type index hints.
    EventTypeIndex,
    /// Catalog-driven reading.
    ByStream,
}

impl fmt::Display for TagMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Coordinates of a catalog-driven (`ByStream`) position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByStreamPosition {
    /// Stream listing the data streams to read.
    pub catalog_stream: String,
    /// Position in the catalog stream.
    pub catalog_position: i64,
    /// Data stream currently being read, if any.
    pub data_stream: Option<String>,
    /// Position in the data stream ([`NO_STREAM`] when there is none).
    pub data_position: i64,
    /// Commit offset of the last event read.
    pub commit_position: i64,
}

/// The active representation of a [`CheckpointTag`].
///
/// Each variant carries only the fields that mean something for its mode.
#[derive(Debug, Clone)]
pub enum TagPosition {
    /// Phase sentinel.
    Phase {
        /// `true` once the phase has been fully processed.
        completed: bool,
    },
    /// Global log position.
    Position(TfPos),
    /// Global log prepare offset.
    PreparePosition(i64),
    /// One stream and its last processed sequence number.
    Stream {
        /// Stream name.
        stream: String,
        /// Last processed sequence number.
        sequence: i64,
    },
    /// Several streams. Keys are fixed when the tagger creates its zero tag.
    MultiStream(BTreeMap<String, i64>),
    /// Global log position with per-event-type index positions.
    EventTypeIndex {
        /// Global log position. This alone is the tag's identity.
        position: TfPos,
        /// Event type → sequence number in that type's index stream.
        streams: BTreeMap<String, i64>,
    },
    /// Catalog-driven reading.
    ByStream(ByStreamPosition),
}

impl TagPosition {
    /// Returns the mode discriminator.
    pub fn mode(&self) -> TagMode {
        match self {
            TagPosition::Phase { .. } => TagMode::Phase,
            TagPosition::Position(_) => TagMode::Position,
            TagPosition::PreparePosition(_) => TagMode::PreparePosition,
            TagPosition::Stream { .. } => TagMode::Stream,
            TagPosition::MultiStream(_) => TagMode::MultiStream,
            TagPosition::EventTypeIndex { .. } => TagMode::EventTypeIndex,
            TagPosition::ByStream(_) => TagMode::ByStream,
        }
    }
}

// =============================================================================
// CheckpointTag
// =============================================================================

/// An immutable position marker: phase plus one mode-specific position.
#[derive(Debug, Clone)]
pub struct CheckpointTag {
    phase: i32,
    position: TagPosition,
}

impl CheckpointTag {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// The tag before everything: phase -1, not completed.
    pub fn empty() -> Self {
        Self::from_phase(-1, false)
    }

    /// Phase sentinel tag.
    pub fn from_phase(phase: i32, completed: bool) -> Self {
        Self {
            phase,
            position: TagPosition::Phase { completed },
        }
    }

    /// Global log position tag.
    pub fn from_position(phase: i32, commit: i64, prepare: i64) -> Self {
        Self {
            phase,
            position: TagPosition::Position(TfPos::new(commit, prepare)),
        }
    }

    /// Prepare-offset-only tag.
    pub fn from_prepare_position(phase: i32, prepare: i64) -> Self {
        Self {
            phase,
            position: TagPosition::PreparePosition(prepare),
        }
    }

    /// Single stream tag.
    ///
    /// Fails on an empty stream name or a sequence number below [`NO_STREAM`].
    pub fn from_stream_position(phase: i32, stream: impl Into<String>, sequence: i64) -> Result<Self> {
        let stream = stream.into();
        validate_stream_entry(&stream, sequence)?;
        Ok(Self {
            phase,
            position: TagPosition::Stream { stream, sequence },
        })
    }

    /// Multi-stream tag. At least one stream is required.
    pub fn from_stream_positions<I, S>(phase: i32, streams: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        let streams = collect_streams(streams)?;
        if streams.is_empty() {
            return Err(Error::IncompatibleTag {
                tag: "<multi-stream>".to_string(),
                reason: "a multi-stream position needs at least one stream".to_string(),
            });
        }
        Ok(Self {
            phase,
            position: TagPosition::MultiStream(streams),
        })
    }

    /// Event-type-index tag. The hint map may be empty.
    pub fn from_event_type_index_positions<I, S>(phase: i32, position: TfPos, streams: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        Ok(Self {
            phase,
            position: TagPosition::EventTypeIndex {
                position,
                streams: collect_streams(streams)?,
            },
        })
    }

    /// Catalog-driven tag.
    pub fn from_by_stream_position(phase: i32, position: ByStreamPosition) -> Result<Self> {
        validate_stream_entry(&position.catalog_stream, position.catalog_position)?;
        if let Some(data) = &position.data_stream {
            validate_stream_entry(data, position.data_position)?;
        }
        Ok(Self {
            phase,
            position: TagPosition::ByStream(position),
        })
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    /// Phase number.
    pub fn phase(&self) -> i32 {
        self.phase
    }

    /// Mode-specific position.
    pub fn position(&self) -> &TagPosition {
        &self.position
    }

    /// Mode discriminator.
    pub fn mode(&self) -> TagMode {
        self.position.mode()
    }

    /// Global log position for `Position` and `EventTypeIndex` tags.
    pub fn tf_pos(&self) -> Option<TfPos> {
        match &self.position {
            TagPosition::Position(pos) => Some(*pos),
            TagPosition::EventTypeIndex { position, .. } => Some(*position),
            _ => None,
        }
    }

    /// Sequence number recorded for `stream`, for the stream-based modes.
    pub fn stream_sequence(&self, stream: &str) -> Option<i64> {
        match &self.position {
            TagPosition::Stream { stream: s, sequence } if s == stream => Some(*sequence),
            TagPosition::MultiStream(streams) => streams.get(stream).copied(),
            TagPosition::EventTypeIndex { streams, .. } => streams.get(stream).copied(),
            _ => None,
        }
    }

    /// Stream map of the stream family (`Stream` as a one-entry map).
    fn stream_map(&self) -> Option<Cow<'_, BTreeMap<String, i64>>> {
        match &self.position {
            TagPosition::Stream { stream, sequence } => {
                let mut map = BTreeMap::new();
                map.insert(stream.clone(), *sequence);
                Some(Cow::Owned(map))
            }
            TagPosition::MultiStream(streams) => Some(Cow::Borrowed(streams)),
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Comparison
    // -------------------------------------------------------------------------

    /// Orders two tags.
    ///
    /// Phase decides first. Within a phase the mode-upgrade table applies:
    /// `Stream`↔`MultiStream` and `Position`↔`EventTypeIndex` are comparable,
    /// every other mismatch is [`Error::IncomparableTags`], as is a diverged
    /// multi-stream vector.
    pub fn try_cmp(&self, other: &CheckpointTag) -> Result<Ordering> {
        if self.phase != other.phase {
            return Ok(self.phase.cmp(&other.phase));
        }

        use TagPosition::*;
        match (&self.position, &other.position) {
            (Phase { completed: a }, Phase { completed: b }) => Ok(a.cmp(b)),
            (PreparePosition(a), PreparePosition(b)) => Ok(a.cmp(b)),
            (Position(a), Position(b))
            | (Position(a), EventTypeIndex { position: b, .. })
            | (EventTypeIndex { position: a, .. }, Position(b))
            | (EventTypeIndex { position: a, .. }, EventTypeIndex { position: b, .. }) => Ok(a.cmp(b)),
            (
                Stream { stream: a, sequence: x },
                Stream { stream: b, sequence: y },
            ) => {
                if a != b {
                    return Err(self.incomparable(other));
                }
                Ok(x.cmp(y))
            }
            (ByStream(a), ByStream(b)) => {
                if a.catalog_stream != b.catalog_stream {
                    return Err(self.incomparable(other));
                }
                Ok(a
                    .catalog_position
                    .cmp(&b.catalog_position)
                    .then(a.data_position.cmp(&b.data_position)))
            }
            _ => match (self.stream_map(), other.stream_map()) {
                (Some(left), Some(right)) => self.compare_vectors(other, &left, &right),
                _ => Err(self.incomparable(other)),
            },
        }
    }

    /// Vector order over stream maps. A stream missing on one side counts as
    /// "the other side is ahead".
    fn compare_vectors(
        &self,
        other: &CheckpointTag,
        left: &BTreeMap<String, i64>,
        right: &BTreeMap<String, i64>,
    ) -> Result<Ordering> {
        let ahead = |a: &BTreeMap<String, i64>, b: &BTreeMap<String, i64>| {
            a.iter().any(|(stream, seq)| match b.get(stream) {
                None => true,
                Some(other_seq) => seq > other_seq,
            })
        };
        match (ahead(left, right), ahead(right, left)) {
            (true, true) => Err(self.incomparable(other)),
            (true, false) => Ok(Ordering::Greater),
            (false, true) => Ok(Ordering::Less),
            (false, false) => Ok(Ordering::Equal),
        }
    }

    fn incomparable(&self, other: &CheckpointTag) -> Error {
        Error::IncomparableTags {
            left: self.to_string(),
            right: other.to_string(),
        }
    }

    /// `self > other`
    pub fn is_after(&self, other: &CheckpointTag) -> Result<bool> {
        Ok(self.try_cmp(other)? == Ordering::Greater)
    }

    /// `self >= other`
    pub fn is_at_or_after(&self, other: &CheckpointTag) -> Result<bool> {
        Ok(self.try_cmp(other)? != Ordering::Less)
    }

    /// `self < other`
    pub fn is_before(&self, other: &CheckpointTag) -> Result<bool> {
        Ok(self.try_cmp(other)? == Ordering::Less)
    }

    /// `self <= other`
    pub fn is_at_or_before(&self, other: &CheckpointTag) -> Result<bool> {
        Ok(self.try_cmp(other)? != Ordering::Greater)
    }

    // -------------------------------------------------------------------------
    // Updates (return new tags)
    // -------------------------------------------------------------------------

    /// Returns a copy with `stream` advanced to `sequence` (never moved back).
    ///
    /// Only valid for `MultiStream` tags whose key set contains `stream`.
    pub fn update_stream_position(&self, stream: &str, sequence: i64) -> Result<CheckpointTag> {
        let TagPosition::MultiStream(streams) = &self.position else {
            return Err(Error::IncompatibleTag {
                tag: self.to_string(),
                reason: "stream positions can only be updated on a multi-stream tag".to_string(),
            });
        };
        let Some(current) = streams.get(stream) else {
            return Err(Error::Misrouted(format!(
                "stream '{}' is not part of the position '{}'",
                stream, self
            )));
        };
        let mut updated = streams.clone();
        updated.insert(stream.to_string(), (*current).max(sequence));
        Ok(CheckpointTag {
            phase: self.phase,
            position: TagPosition::MultiStream(updated),
        })
    }

    /// Returns a copy with a new base position and optionally one advanced
    /// event-type hint.
    pub fn update_event_type_index_position(
        &self,
        position: TfPos,
        hint: Option<(&str, i64)>,
    ) -> Result<CheckpointTag> {
        let TagPosition::EventTypeIndex { streams, .. } = &self.position else {
            return Err(Error::IncompatibleTag {
                tag: self.to_string(),
                reason: "index positions can only be updated on an event-type-index tag".to_string(),
            });
        };
        let mut updated = streams.clone();
        if let Some((event_type, sequence)) = hint {
            let entry = updated.entry(event_type.to_string()).or_insert(NO_STREAM);
            *entry = (*entry).max(sequence);
        }
        Ok(CheckpointTag {
            phase: self.phase,
            position: TagPosition::EventTypeIndex {
                position,
                streams: updated,
            },
        })
    }
}

// =============================================================================
// Validation Helpers
// =============================================================================

fn validate_stream_entry(stream: &str, sequence: i64) -> Result<()> {
    if stream.is_empty() {
        return Err(Error::IncompatibleTag {
            tag: format!(": {}", sequence),
            reason: "stream name must not be empty".to_string(),
        });
    }
    if sequence < NO_STREAM {
        return Err(Error::IncompatibleTag {
            tag: format!("{}: {}", stream, sequence),
            reason: "sequence number must be -1 or greater".to_string(),
        });
    }
    Ok(())
}

fn collect_streams<I, S>(streams: I) -> Result<BTreeMap<String, i64>>
where
    I: IntoIterator<Item = (S, i64)>,
    S: Into<String>,
{
    let mut map = BTreeMap::new();
    for (stream, sequence) in streams {
        let stream = stream.into();
        validate_stream_entry(&stream, sequence)?;
        map.insert(stream, sequence);
    }
    Ok(map)
}

// =============================================================================
// Equality and Display
// =============================================================================

/// Equality follows comparison: related modes are equal when they compare
/// equal, `EventTypeIndex` hints are ignored, unrelated modes are never equal.
impl PartialEq for CheckpointTag {
    fn eq(&self, other: &Self) -> bool {
        if self.phase != other.phase {
            return false;
        }
        use TagPosition::*;
        match (&self.position, &other.position) {
            (Phase { completed: a }, Phase { completed: b }) => a == b,
            (PreparePosition(a), PreparePosition(b)) => a == b,
            (ByStream(a), ByStream(b)) => a == b,
            _ => match (self.tf_pos(), other.tf_pos()) {
                (Some(a), Some(b)) => a == b,
                _ => match (self.stream_map(), other.stream_map()) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                },
            },
        }
    }
}

impl Eq for CheckpointTag {}

impl fmt::Display for CheckpointTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let TagPosition::Phase { completed } = &self.position {
            write!(f, "Phase: {}", self.phase)?;
            if *completed {
                write!(f, " (completed)")?;
            }
            return Ok(());
        }
        if self.phase != 0 {
            write!(f, "({}) ", self.phase)?;
        }
        match &self.position {
            TagPosition::Phase { .. } => Ok(()),
            TagPosition::Position(pos) => write!(f, "{}", pos),
            TagPosition::PreparePosition(prepare) => write!(f, "{}", prepare),
            TagPosition::Stream { stream, sequence } => write!(f, "{}: {}", stream, sequence),
            TagPosition::MultiStream(streams) => {
                for (stream, sequence) in streams {
                    write!(f, "{}: {}; ", stream, sequence)?;
                }
                Ok(())
            }
            TagPosition::EventTypeIndex { position, streams } => {
                write!(f, "{}; ", position)?;
                for (stream, sequence) in streams {
                    write!(f, "{}: {}; ", stream, sequence)?;
                }
                Ok(())
            }
            TagPosition::ByStream(p) => write!(
                f,
                "{}:{}/{}:{}/{}",
                p.catalog_stream,
                p.catalog_position,
                p.data_stream.as_deref().unwrap_or(""),
                p.data_position,
                p.commit_position
            ),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
