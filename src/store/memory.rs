//! In-memory event store with fault injection.
//!
//! Every stream is a `Vec` of events and the global log is a second `Vec` of
//! clones. Tests can script write outcomes per stream and deny access to
//! streams to exercise the engine's retry and failure paths.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{
    slice_backward, slice_forward, AllSlice, EventStore, ExpectedVersion, NewEvent, ReadResult,
    RecordedEvent, WriteResult,
};
use crate::tag::{TfPos, NO_STREAM};
use crate::{Error, Result};

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<String, Vec<RecordedEvent>>,
    log: Vec<RecordedEvent>,
    deleted: HashSet<String>,
    denied: HashSet<String>,
    scripted_writes: HashMap<String, VecDeque<WriteResult>>,
    write_attempts: HashMap<String, usize>,
}

impl Inner {
    fn last_event_number(&self, stream: &str) -> i64 {
        self.streams
            .get(stream)
            .and_then(|events| events.last())
            .map(|e| e.event_number)
            .unwrap_or(NO_STREAM)
    }
}

/// Event store kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))
    }

    /// Appends events without any expectation and returns the first event number.
    pub fn append(&self, stream: &str, events: Vec<NewEvent>) -> Result<i64> {
        match self.write_events(stream, ExpectedVersion::Any, events)? {
            WriteResult::Success { first_event_number } => Ok(first_event_number),
            other => Err(Error::Store(format!("append to '{}' failed: {:?}", stream, other))),
        }
    }

    /// All events of a stream, oldest first.
    pub fn events(&self, stream: &str) -> Result<Vec<RecordedEvent>> {
        Ok(self.lock()?.streams.get(stream).cloned().unwrap_or_default())
    }

    /// Makes the next writes to `stream` return `results` instead of writing.
    pub fn script_writes(&self, stream: &str, results: impl IntoIterator<Item = WriteResult>) -> Result<()> {
        self.lock()?
            .scripted_writes
            .entry(stream.to_string())
            .or_default()
            .extend(results);
        Ok(())
    }

    /// Makes every read and write of `stream` report access denied.
    pub fn deny_access(&self, stream: &str) -> Result<()> {
        self.lock()?.denied.insert(stream.to_string());
        Ok(())
    }

    /// Number of write attempts made against `stream`, scripted ones included.
    pub fn write_attempts(&self, stream: &str) -> Result<usize> {
        Ok(self.lock()?.write_attempts.get(stream).copied().unwrap_or(0))
    }

    fn read(
        &self,
        stream: &str,
        slice: impl FnOnce(&[RecordedEvent]) -> super::StreamSlice,
    ) -> Result<ReadResult> {
        let inner = self.lock()?;
        if inner.denied.contains(stream) {
            return Ok(ReadResult::AccessDenied);
        }
        if inner.deleted.contains(stream) {
            return Ok(ReadResult::StreamDeleted);
        }
        match inner.streams.get(stream) {
            Some(events) if !events.is_empty() => Ok(ReadResult::Success(slice(events))),
            _ => Ok(ReadResult::NoStream),
        }
    }
}

impl EventStore for MemoryStore {
    fn read_stream_backward(&self, stream: &str, from_event_number: i64, max_count: usize) -> Result<ReadResult> {
        self.read(stream, |events| slice_backward(events, from_event_number, max_count))
    }

    fn read_stream_forward(&self, stream: &str, from_event_number: i64, max_count: usize) -> Result<ReadResult> {
        self.read(stream, |events| slice_forward(events, from_event_number, max_count))
    }

    fn read_all_forward(&self, from: TfPos, max_count: usize) -> Result<AllSlice> {
        let inner = self.lock()?;
        let start = inner.log.partition_point(|e| e.position < from);
        let events: Vec<RecordedEvent> = inner.log[start..].iter().take(max_count).cloned().collect();
        let head = TfPos::new(inner.log.len() as i64, inner.log.len() as i64);
        let next_position = match events.last() {
            Some(e) => TfPos::new(e.position.commit() + 1, e.position.commit() + 1),
            None => from,
        };
        Ok(AllSlice {
            is_end: start + events.len() >= inner.log.len(),
            events,
            next_position,
            head,
        })
    }

    fn write_events(&self, stream: &str, expected: ExpectedVersion, events: Vec<NewEvent>) -> Result<WriteResult> {
        let mut inner = self.lock()?;
        *inner.write_attempts.entry(stream.to_string()).or_default() += 1;

        if let Some(result) = inner
            .scripted_writes
            .get_mut(stream)
            .and_then(VecDeque::pop_front)
        {
            return Ok(result);
        }
        if inner.denied.contains(stream) {
            return Ok(WriteResult::AccessDenied);
        }
        if inner.deleted.contains(stream) {
            return Ok(WriteResult::StreamDeleted);
        }
        let current = inner.last_event_number(stream);
        if !expected.matches(current) {
            return Ok(WriteResult::WrongExpectedVersion {
                current_version: current,
            });
        }

        let first_event_number = current + 1;
        for (offset, event) in events.into_iter().enumerate() {
            let global = inner.log.len() as i64;
            let recorded = RecordedEvent {
                stream_id: stream.to_string(),
                event_number: first_event_number + offset as i64,
                event_type: event.event_type,
                data: event.data,
                metadata: event.metadata,
                is_json: event.is_json,
                position: TfPos::new(global, global),
            };
            inner.log.push(recorded.clone());
            inner.streams.entry(stream.to_string()).or_default().push(recorded);
        }
        Ok(WriteResult::Success { first_event_number })
    }

    fn delete_stream(&self, stream: &str) -> Result<()> {
        self.lock()?.deleted.insert(stream.to_string());
        Ok(())
    }
}
