//! # Event Store Collaborator
//!
//! The projection engine reads its inputs from, and writes checkpoints and
//! derived output to, an event store. This module defines the contract it
//! relies on plus two implementations:
//!
//! - [`MemoryStore`]: in-process, with fault injection for tests
//! - [`SqliteStore`]: durable, on a single SQLite file
//!
//! ## Outcomes, Not Errors
//!
//! Reads and writes report expected conditions as variants of
//! [`ReadResult`] / [`WriteResult`]. A missing stream, an optimistic
//! concurrency conflict or a timeout is something the caller decides about.
//! `Err` is reserved for the store itself being broken.
//!
//! ## Stream Numbering
//!
//! Event numbers start at 0 and have no gaps. A stream that was never written
//! has a last event number of `-1`.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::tag::{TfPos, NO_STREAM};
use crate::types::ReceivedEvent;
use crate::Result;

/// Read position meaning "from the end of the stream".
pub const FROM_END: i64 = -1;

// =============================================================================
// Records
// =============================================================================

/// An event as stored.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Stream the event belongs to.
    pub stream_id: String,
    /// Position within the stream (0-based).
    pub event_number: i64,
    /// Event type.
    pub event_type: String,
    /// Payload.
    pub data: String,
    /// Metadata.
    pub metadata: String,
    /// Whether `data` is JSON.
    pub is_json: bool,
    /// Position in the global log.
    pub position: TfPos,
}

impl From<RecordedEvent> for ReceivedEvent {
    fn from(recorded: RecordedEvent) -> Self {
        let mut event = ReceivedEvent::new(
            recorded.stream_id,
            recorded.event_number,
            recorded.position,
            recorded.event_type,
            recorded.data,
        )
        .with_metadata(recorded.metadata);
        event.is_json = recorded.is_json;
        event
    }
}

/// An event to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Event type.
    pub event_type: String,
    /// Payload.
    pub data: String,
    /// Metadata.
    pub metadata: String,
    /// Whether `data` is JSON.
    pub is_json: bool,
}

impl NewEvent {
    /// Creates a JSON event without metadata.
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
            metadata: String::new(),
            is_json: true,
        }
    }

    /// Attaches metadata.
    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }
}

/// Optimistic concurrency expectation for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No check.
    Any,
    /// The stream must not exist yet.
    NoStream,
    /// The stream's last event number must be this.
    Exact(i64),
}

impl ExpectedVersion {
    /// Expectation from a last known event number (`-1` for none).
    pub fn from_last_event_number(last: i64) -> Self {
        if last < 0 {
            ExpectedVersion::NoStream
        } else {
            ExpectedVersion::Exact(last)
        }
    }

    /// Whether a stream whose last event number is `current` satisfies this.
    pub fn matches(&self, current: i64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => current == NO_STREAM,
            ExpectedVersion::Exact(n) => *n == current,
        }
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// A page of a single stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamSlice {
    /// Events in read order.
    pub events: Vec<RecordedEvent>,
    /// Where the next page starts.
    pub next_event_number: i64,
    /// Last event number of the stream at read time.
    pub last_event_number: i64,
    /// No more events in the read direction.
    pub is_end_of_stream: bool,
}

/// Outcome of a stream read.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadResult {
    /// Events (possibly none) were read.
    Success(StreamSlice),
    /// The stream has never been written.
    NoStream,
    /// The stream has been deleted.
    StreamDeleted,
    /// The reader may not read the stream.
    AccessDenied,
}

/// Outcome of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Events were appended starting at `first_event_number`.
    Success {
        /// Number of the first written event.
        first_event_number: i64,
    },
    /// The expectation did not hold.
    WrongExpectedVersion {
        /// Actual last event number.
        current_version: i64,
    },
    /// Transient: prepare phase timed out.
    PrepareTimeout,
    /// Transient: commit phase timed out.
    CommitTimeout,
    /// Transient: forwarding to the leader timed out.
    ForwardTimeout,
    /// The stream has been deleted.
    StreamDeleted,
    /// The writer may not write the stream.
    AccessDenied,
}

impl WriteResult {
    /// Whether the write may succeed if retried unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WriteResult::PrepareTimeout | WriteResult::CommitTimeout | WriteResult::ForwardTimeout
        )
    }
}

/// A page of the global log.
#[derive(Debug, Clone, PartialEq)]
pub struct AllSlice {
    /// Events in log order.
    pub events: Vec<RecordedEvent>,
    /// Where the next page starts.
    pub next_position: TfPos,
    /// Position after the last event in the log at read time.
    pub head: TfPos,
    /// `true` when the page reached the head of the log.
    pub is_end: bool,
}

// =============================================================================
// The Trait
// =============================================================================

/// What the projection engine needs from an event store.
///
/// # Rust Pattern: Send + Sync Trait Objects
///
/// The runtime shares one store between the projection loop and blocking IO
/// tasks as `Arc<dyn EventStore>`, so implementations synchronize internally.
pub trait EventStore: Send + Sync {
    /// Reads up to `max_count` events from `from_event_number` (or
    /// [`FROM_END`]) towards the start of the stream.
    fn read_stream_backward(&self, stream: &str, from_event_number: i64, max_count: usize) -> Result<ReadResult>;

    /// Reads up to `max_count` events from `from_event_number` towards the end.
    fn read_stream_forward(&self, stream: &str, from_event_number: i64, max_count: usize) -> Result<ReadResult>;

    /// Reads up to `max_count` events of the global log at or after `from`.
    fn read_all_forward(&self, from: TfPos, max_count: usize) -> Result<AllSlice>;

    /// Appends `events` to `stream` if `expected` holds.
    fn write_events(&self, stream: &str, expected: ExpectedVersion, events: Vec<NewEvent>) -> Result<WriteResult>;

    /// Deletes `stream`. Later reads report [`ReadResult::StreamDeleted`].
    fn delete_stream(&self, stream: &str) -> Result<()>;
}

// =============================================================================
// Slicing Helpers
// =============================================================================

/// Builds a backward page from a stream's events (ascending by number).
pub(crate) fn slice_backward(events: &[RecordedEvent], from_event_number: i64, max_count: usize) -> StreamSlice {
    let last = events.last().map(|e| e.event_number).unwrap_or(NO_STREAM);
    let start = if from_event_number < 0 || from_event_number > last {
        last
    } else {
        from_event_number
    };
    let page: Vec<RecordedEvent> = events
        .iter()
        .rev()
        .filter(|e| e.event_number <= start)
        .take(max_count)
        .cloned()
        .collect();
    let next = match page.last() {
        Some(e) => e.event_number - 1,
        None => NO_STREAM,
    };
    StreamSlice {
        events: page,
        next_event_number: next,
        last_event_number: last,
        is_end_of_stream: next < 0,
    }
}

/// Builds a forward page from a stream's events (ascending by number).
pub(crate) fn slice_forward(events: &[RecordedEvent], from_event_number: i64, max_count: usize) -> StreamSlice {
    let last = events.last().map(|e| e.event_number).unwrap_or(NO_STREAM);
    let from = from_event_number.max(0);
    let page: Vec<RecordedEvent> = events
        .iter()
        .filter(|e| e.event_number >= from)
        .take(max_count)
        .cloned()
        .collect();
    let next = page.last().map(|e| e.event_number + 1).unwrap_or(from);
    StreamSlice {
        events: page,
        next_event_number: next,
        last_event_number: last,
        is_end_of_stream: next > last,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(n: i64) -> Vec<RecordedEvent> {
        (0..n)
            .map(|i| RecordedEvent {
                stream_id: "s".to_string(),
                event_number: i,
                event_type: "T".to_string(),
                data: "{}".to_string(),
                metadata: String::new(),
                is_json: true,
                position: TfPos::new(i * 10, i * 10),
            })
            .collect()
    }

    #[test]
    fn test_backward_pages_from_end() {
        let events = stream(3);
        let first = slice_backward(&events, FROM_END, 1);
        assert_eq!(first.events[0].event_number, 2);
        assert_eq!(first.next_event_number, 1);
        assert_eq!(first.last_event_number, 2);
        assert!(!first.is_end_of_stream);

        let last = slice_backward(&events, 0, 1);
        assert_eq!(last.events[0].event_number, 0);
        assert!(last.is_end_of_stream);
    }

    #[test]
    fn test_forward_pages() {
        let events = stream(3);
        let page = slice_forward(&events, 1, 5);
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.next_event_number, 3);
        assert!(page.is_end_of_stream);
    }

    #[test]
    fn test_expected_version() {
        assert_eq!(ExpectedVersion::from_last_event_number(-1), ExpectedVersion::NoStream);
        assert!(ExpectedVersion::NoStream.matches(-1));
        assert!(!ExpectedVersion::Exact(3).matches(4));
        assert!(ExpectedVersion::Any.matches(7));
        assert!(WriteResult::CommitTimeout.is_transient());
        assert!(!WriteResult::StreamDeleted.is_transient());
    }
}
