//! # Emitted Stream
//!
//! Writes the events a projection emits to one output stream, in order, and
//! makes re-emission after a restart idempotent.
//!
//! ## Recovery
//!
//! The first time an emitted stream has something to write it reads the
//! output stream backward from its tail. Every event written by this
//! projection (same id, current epoch) after the checkpoint the stream started
//! from is collected. Pending events are then matched against that tail in
//! order:
//!
//! ```text
//! stored tail:     E1@A  E2@B
//! pending:         E1@A  E2@B  E3@C
//!                  ─────────── ────
//!                  acknowledged written
//! ```
//!
//! A pending event with the same tag as a stored one must also have the same
//! type, otherwise the recomputation diverged from durable history and the
//! projection fails. Recovery ends with the first pending event after the
//! last stored tag.
//!
//! ## Writes
//!
//! Batches of up to `max_write_batch_length` events are appended with the
//! last known event number as the expected version. A version conflict means
//! the stream was written from outside and requests a restart. Timeouts are
//! retried with [`RetryBackoff`].

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{CheckpointId, Continuation, Effects};
use crate::backoff::{RetryBackoff, WARN_FROM_ATTEMPT};
use crate::codec::{decode_checkpoint_tag, encode_checkpoint_tag};
use crate::io::{IoRequest, IoResponse};
use crate::store::{ExpectedVersion, NewEvent, ReadResult, StreamSlice, WriteResult, FROM_END};
use crate::tag::{CheckpointTag, NO_STREAM};
use crate::tagger::PositionTagger;
use crate::types::{EmittedEvent, ProjectionVersion};
use crate::{Error, Result};

/// Events read per recovery page.
const RECOVERY_PAGE_SIZE: usize = 1;

/// Settings shared by the emitted streams of one checkpoint.
#[derive(Debug, Clone)]
pub struct EmittedStreamConfig {
    /// Identity stamped on every written event.
    pub version: ProjectionVersion,
    /// Tagger used to adjust tags read back from the stream.
    pub tagger: Arc<dyn PositionTagger>,
    /// Start of the checkpoint interval the stream belongs to.
    pub from_checkpoint: CheckpointTag,
    /// Maximum events per write.
    pub max_write_batch_length: usize,
    /// Retry policy for writes.
    pub backoff: RetryBackoff,
}

#[derive(Debug, Clone)]
struct StoredEmit {
    tag: CheckpointTag,
    event_type: String,
    event_number: i64,
}

/// One output stream of one checkpoint. See the module docs.
#[derive(Debug)]
pub struct EmittedStream {
    stream_id: String,
    checkpoint: CheckpointId,
    config: EmittedStreamConfig,
    zero: CheckpointTag,

    pending: VecDeque<EmittedEvent>,
    /// Stored tail, newest at the bottom, oldest on top.
    already_committed: Vec<StoredEmit>,
    submitted: Vec<NewEvent>,
    last_queued: Option<CheckpointTag>,
    last_committed_or_submitted: Option<CheckpointTag>,
    last_known_event_number: i64,
    write_attempt: u32,

    started: bool,
    checkpoint_requested: bool,
    awaiting_read: bool,
    awaiting_write: bool,
    recovery_completed: bool,
}

impl EmittedStream {
    /// Creates a stream that has not read its tail yet.
    pub fn new(stream_id: impl Into<String>, checkpoint: CheckpointId, config: EmittedStreamConfig) -> Self {
        let zero = config.tagger.make_zero_checkpoint_tag();
        Self {
            stream_id: stream_id.into(),
            checkpoint,
            config,
            zero,
            pending: VecDeque::new(),
            already_committed: Vec::new(),
            submitted: Vec::new(),
            last_queued: None,
            last_committed_or_submitted: None,
            last_known_event_number: NO_STREAM,
            write_attempt: 0,
            started: false,
            checkpoint_requested: false,
            awaiting_read: false,
            awaiting_write: false,
            recovery_completed: false,
        }
    }

    /// Output stream name.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Events queued but not yet written.
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// `1` while a write is in flight.
    pub fn writes_in_progress(&self) -> usize {
        usize::from(self.awaiting_write)
    }

    /// `1` while a recovery read is in flight.
    pub fn reads_in_progress(&self) -> usize {
        usize::from(self.awaiting_read)
    }

    /// `true` once a checkpoint was requested and everything queued is written.
    pub fn is_ready_for_checkpoint(&self) -> bool {
        self.checkpoint_requested && !self.awaiting_write && self.pending.is_empty()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Allows writes to start.
    pub fn start(&mut self, fx: &mut Effects) -> Result<()> {
        if self.started {
            return Err(Error::InvalidState(format!(
                "emitted stream '{}' already started",
                self.stream_id
            )));
        }
        self.started = true;
        self.process_writes(fx)
    }

    /// Queues one group of events caused by the same event.
    pub fn emit_events(&mut self, events: Vec<EmittedEvent>, fx: &mut Effects) -> Result<()> {
        let Some(first) = events.first() else {
            return Ok(());
        };
        let group_tag = first.caused_by_tag.clone();
        let in_order = match &self.last_queued {
            Some(last) => group_tag.is_after(last)?,
            None => group_tag.is_at_or_after(&self.config.from_checkpoint)?,
        };
        if !in_order {
            let last = self.last_queued.as_ref().unwrap_or(&self.config.from_checkpoint);
            return Err(Error::OrderingViolation(format!(
                "Invalid event order. '{}' goes after '{}'",
                group_tag, last
            )));
        }
        for event in &events {
            if event.caused_by_tag != group_tag {
                return Err(Error::InvalidState(format!(
                    "events emitted together must share one caused-by tag ('{}' vs '{}')",
                    event.caused_by_tag, group_tag
                )));
            }
            if event.stream_id != self.stream_id {
                return Err(Error::Misrouted(format!(
                    "event for '{}' emitted to '{}'",
                    event.stream_id, self.stream_id
                )));
            }
        }
        if self.checkpoint_requested {
            return Err(Error::InvalidState(format!(
                "checkpoint already requested for '{}'",
                self.stream_id
            )));
        }
        self.last_queued = Some(group_tag);
        self.pending.extend(events);
        self.process_writes(fx)
    }

    /// Stops accepting events; the stream becomes ready once flushed.
    pub fn checkpoint(&mut self) -> Result<()> {
        if !self.started {
            return Err(Error::InvalidState(format!("emitted stream '{}' not started", self.stream_id)));
        }
        if self.checkpoint_requested {
            return Err(Error::InvalidState(format!(
                "checkpoint already requested for '{}'",
                self.stream_id
            )));
        }
        self.checkpoint_requested = true;
        Ok(())
    }

    /// Routes a completed request to this stream.
    pub fn handle(&mut self, continuation: &Continuation, response: IoResponse, fx: &mut Effects) -> Result<()> {
        match continuation {
            Continuation::EmittedRead { .. } => self.read_completed(response, fx),
            Continuation::EmittedWrite { .. } => self.write_completed(response, fx),
            Continuation::EmittedRetry { .. } => {
                self.publish_write(fx);
                Ok(())
            }
            other => Err(Error::InvalidState(format!(
                "emitted stream '{}' cannot handle {:?}",
                self.stream_id, other
            ))),
        }
    }

    // =========================================================================
    // Writing
    // =========================================================================

    fn process_writes(&mut self, fx: &mut Effects) -> Result<()> {
        if !self.started || self.awaiting_read || self.awaiting_write || self.pending.is_empty() {
            return Ok(());
        }
        if self.last_committed_or_submitted.is_none() {
            self.read_tail(FROM_END, fx);
            Ok(())
        } else {
            self.submit_in_recovery(fx)
        }
    }

    fn submit_in_recovery(&mut self, fx: &mut Effects) -> Result<()> {
        match self.reconcile(fx) {
            Err(Error::InvalidEmittedEventSequence(reason)) => {
                fx.fail(reason);
                Ok(())
            }
            other => other,
        }
    }

    fn reconcile(&mut self, fx: &mut Effects) -> Result<()> {
        let mut any_found = false;
        while let Some(next) = self.pending.front() {
            if !self.recovery_completed {
                let last_committed = self.last_committed_or_submitted.as_ref().unwrap_or(&self.zero);
                if self.already_committed.is_empty() || next.caused_by_tag.is_after(last_committed)? {
                    self.recovery_completed = true;
                }
            }
            if self.recovery_completed {
                if any_found {
                    debug!(stream = %self.stream_id, "re-emitted events acknowledged");
                }
                return self.submit_write_events(fx);
            }

            let Some(stored) = self.already_committed.pop() else {
                continue;
            };
            if stored.tag.is_before(&next.caused_by_tag)? {
                continue;
            }
            if stored.tag != next.caused_by_tag || stored.event_type != next.event_type {
                return Err(Error::InvalidEmittedEventSequence(format!(
                    "An event emitted in recovery for stream {} differs from the originally emitted event. Existing('{}', '{}'). New('{}', '{}')",
                    self.stream_id, stored.event_type, stored.tag, next.event_type, next.caused_by_tag
                )));
            }
            debug!(
                stream = %self.stream_id,
                event_number = stored.event_number,
                tag = %stored.tag,
                "skipping already written event"
            );
            any_found = true;
            self.pending.pop_front();
        }
        if self.pending.is_empty() {
            self.on_write_completed(fx)?;
        }
        Ok(())
    }

    fn submit_write_events(&mut self, fx: &mut Effects) -> Result<()> {
        if self.awaiting_write || self.awaiting_read {
            return Err(Error::InvalidState(format!(
                "emitted stream '{}' is already busy",
                self.stream_id
            )));
        }
        let mut batch = Vec::new();
        while batch.len() < self.config.max_write_batch_length {
            let Some(event) = self.pending.pop_front() else {
                break;
            };
            if let Some(expected) = &event.expected_tag {
                if self.last_committed_or_submitted.as_ref() != Some(expected) {
                    let last = self
                        .last_committed_or_submitted
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default();
                    fx.restart(format!(
                        "Wrong expected tag while submitting write event request to the '{}' stream.  The last known stream tag is: '{}'  the expected tag is: '{}'",
                        self.stream_id, last, expected
                    ));
                    return Ok(());
                }
            }
            let metadata = encode_checkpoint_tag(
                &event.caused_by_tag,
                Some(&self.config.version),
                &event.metadata_extras(),
            )?;
            self.last_committed_or_submitted = Some(event.caused_by_tag.clone());
            batch.push(NewEvent {
                event_type: event.event_type,
                data: event.data.unwrap_or_default(),
                metadata,
                is_json: event.is_json,
            });
        }
        if batch.is_empty() {
            return Ok(());
        }
        self.submitted = batch;
        self.write_attempt = 1;
        self.awaiting_write = true;
        self.schedule_write(fx);
        Ok(())
    }

    fn schedule_write(&mut self, fx: &mut Effects) {
        let attempt = self.write_attempt;
        if attempt >= WARN_FROM_ATTEMPT {
            warn!(stream = %self.stream_id, attempt, "retrying write to emitted stream");
        }
        let delay = self.config.backoff.delay_for_attempt(attempt);
        if delay.is_zero() {
            self.publish_write(fx);
        } else {
            fx.io.publish(
                IoRequest::Delay { duration: delay },
                Continuation::EmittedRetry {
                    checkpoint: self.checkpoint,
                    stream: self.stream_id.clone(),
                },
            );
        }
    }

    fn publish_write(&mut self, fx: &mut Effects) {
        fx.io.publish(
            IoRequest::WriteEvents {
                stream: self.stream_id.clone(),
                expected_version: ExpectedVersion::from_last_event_number(self.last_known_event_number),
                events: self.submitted.clone(),
            },
            Continuation::EmittedWrite {
                checkpoint: self.checkpoint,
                stream: self.stream_id.clone(),
            },
        );
    }

    fn write_completed(&mut self, response: IoResponse, fx: &mut Effects) -> Result<()> {
        if !self.awaiting_write {
            return Err(Error::InvalidState(format!(
                "no write was submitted to '{}'",
                self.stream_id
            )));
        }
        self.awaiting_write = false;
        let checkpoint = self.last_committed_or_submitted.clone().unwrap_or_else(|| self.zero.clone());
        let reason = match response {
            IoResponse::Write(WriteResult::Success { first_event_number }) => {
                self.last_known_event_number = first_event_number + self.submitted.len() as i64 - 1;
                self.submitted.clear();
                return self.on_write_completed(fx);
            }
            IoResponse::Write(WriteResult::WrongExpectedVersion { current_version }) => {
                info!(stream = %self.stream_id, current_version, "emitted stream written from outside");
                fx.restart(format!(
                    "The '{}' stream has been written to from the outside. Expected Version: {}, Current Version: {}. Checkpoint: {}.",
                    self.stream_id, self.last_known_event_number, current_version, checkpoint
                ));
                return Ok(());
            }
            IoResponse::Write(result) if result.is_transient() => format!("{:?}", result),
            IoResponse::TimedOut => "Timeout".to_string(),
            IoResponse::Write(result) => {
                fx.fail(format!("Failed to write events to {}: {:?}", self.stream_id, result));
                return Ok(());
            }
            IoResponse::Failed(reason) => {
                fx.fail(reason);
                return Ok(());
            }
            other => {
                return Err(Error::InvalidState(format!(
                    "unexpected write response for '{}': {:?}",
                    self.stream_id, other
                )))
            }
        };
        if self.config.backoff.should_retry(self.write_attempt) {
            self.write_attempt += 1;
            self.awaiting_write = true;
            self.schedule_write(fx);
        } else {
            fx.fail(format!(
                "Failed to write events to {}. Retry limit of {} reached. Reason: {}. Checkpoint: {}.",
                self.stream_id,
                self.config.backoff.max_retries(),
                reason,
                checkpoint
            ));
        }
        Ok(())
    }

    fn on_write_completed(&mut self, fx: &mut Effects) -> Result<()> {
        self.process_writes(fx)
    }

    // =========================================================================
    // Recovery Reads
    // =========================================================================

    fn read_tail(&mut self, from_event_number: i64, fx: &mut Effects) {
        self.awaiting_read = true;
        fx.io.publish(
            IoRequest::ReadBackward {
                stream: self.stream_id.clone(),
                from_event_number,
                max_count: RECOVERY_PAGE_SIZE,
            },
            Continuation::EmittedRead {
                checkpoint: self.checkpoint,
                stream: self.stream_id.clone(),
            },
        );
    }

    fn read_completed(&mut self, response: IoResponse, fx: &mut Effects) -> Result<()> {
        if !self.awaiting_read {
            return Ok(());
        }
        self.awaiting_read = false;
        let slice = match response {
            IoResponse::Read(ReadResult::Success(slice)) => slice,
            IoResponse::Read(ReadResult::NoStream) => StreamSlice {
                events: Vec::new(),
                next_event_number: NO_STREAM,
                last_event_number: NO_STREAM,
                is_end_of_stream: true,
            },
            IoResponse::Read(ReadResult::StreamDeleted) => {
                fx.fail(format!(
                    "Stream : {} is deleted. Cannot emit events to it",
                    self.stream_id
                ));
                return Ok(());
            }
            IoResponse::Read(ReadResult::AccessDenied) => {
                fx.fail(format!("Access to the '{}' stream is denied", self.stream_id));
                return Ok(());
            }
            IoResponse::Failed(reason) => {
                fx.fail(reason);
                return Ok(());
            }
            other => {
                return Err(Error::InvalidState(format!(
                    "unexpected read response for '{}': {:?}",
                    self.stream_id, other
                )))
            }
        };

        if self.last_committed_or_submitted.is_none() && !self.discover_tail(&slice, fx)? {
            return Ok(());
        }

        let Some(stop) = self.collect_already_committed(&slice, fx)? else {
            return Ok(());
        };
        if stop {
            self.submit_in_recovery(fx)
        } else {
            self.read_tail(slice.next_event_number, fx);
            Ok(())
        }
    }

    /// Works out the last tag written by this projection incarnation.
    /// Returns `false` when the stream cannot be emitted to.
    fn discover_tail(&mut self, slice: &StreamSlice, fx: &mut Effects) -> Result<bool> {
        let new_physical = slice.last_event_number == NO_STREAM;
        let newest = if new_physical { None } else { slice.events.first() };
        let stored = match newest {
            None => None,
            Some(event) => match decode_checkpoint_tag(&event.metadata, &self.config.version) {
                Ok(stored) => Some(stored),
                Err(_) => {
                    fx.fail(format!(
                        "The '{}' stream managed by projection {} has been written to from the outside.",
                        self.stream_id, self.config.version.projection_id
                    ));
                    return Ok(false);
                }
            },
        };
        if let Some(stored) = &stored {
            if stored.version.projection_id != self.config.version.projection_id {
                fx.fail(format!(
                    "Multiple projections emitting to the same stream detected.  Stream: '{}'. Last event projection: '{}'.  Emitting projection: '{}'",
                    self.stream_id, stored.version.projection_id, self.config.version.projection_id
                ));
                return Ok(false);
            }
        }
        let new_logical = match &stored {
            None => true,
            Some(stored) => self.config.version.epoch > stored.version.version,
        };
        self.last_known_event_number = if new_physical { NO_STREAM } else { slice.last_event_number };
        let last_committed = match &stored {
            Some(stored) if !new_logical => match stored.adjust_by(self.config.tagger.as_ref(), &self.config.version) {
                Ok(tag) => tag,
                Err(e) => {
                    fx.fail(e.to_string());
                    return Ok(false);
                }
            },
            _ => self.zero.clone(),
        };
        debug!(stream = %self.stream_id, tag = %last_committed, "emitted stream tail discovered");
        self.last_committed_or_submitted = Some(last_committed);
        Ok(true)
    }

    /// Pushes stored events newer than the start checkpoint. Returns
    /// `Some(true)` when the relevant tail is fully collected, `None` on failure.
    fn collect_already_committed(&mut self, slice: &StreamSlice, fx: &mut Effects) -> Result<Option<bool>> {
        let mut stop = false;
        for event in &slice.events {
            let stored = match decode_checkpoint_tag(&event.metadata, &self.config.version) {
                Ok(stored) => stored,
                Err(_) => {
                    fx.fail(format!(
                        "A unstamped event found. Stream: '{}'. EventNumber: '{}'",
                        self.stream_id, event.event_number
                    ));
                    return Ok(None);
                }
            };
            let our_epoch = stored.version.projection_id == self.config.version.projection_id
                && stored.version.version >= self.config.version.epoch;
            if !our_epoch {
                stop = true;
                break;
            }
            let tag = match stored.adjust_by(self.config.tagger.as_ref(), &self.config.version) {
                Ok(tag) => tag,
                Err(e) => {
                    fx.fail(e.to_string());
                    return Ok(None);
                }
            };
            if tag.is_at_or_before(&self.config.from_checkpoint)? {
                stop = true;
                break;
            }
            self.already_committed.push(StoredEmit {
                tag,
                event_type: event.event_type.clone(),
                event_number: event.event_number,
            });
        }
        Ok(Some(stop || slice.is_end_of_stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::RequestId;
    use crate::store::RecordedEvent;
    use crate::tag::TfPos;
    use crate::tagger::TransactionFilePositionTagger;
    use crate::checkpoint::Signal;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::Map;
    use std::time::Duration;

    const STREAM: &str = "out";

    fn version() -> ProjectionVersion {
        ProjectionVersion::new(7, 0, 0)
    }

    fn at(commit: i64) -> CheckpointTag {
        CheckpointTag::from_position(0, commit, commit)
    }

    fn stream(from: CheckpointTag) -> EmittedStream {
        EmittedStream::new(
            STREAM,
            1,
            EmittedStreamConfig {
                version: version(),
                tagger: Arc::new(TransactionFilePositionTagger::new(0)),
                from_checkpoint: from,
                max_write_batch_length: 500,
                backoff: RetryBackoff::new(Duration::from_millis(1), 2, StdRng::seed_from_u64(1)),
            },
        )
    }

    fn emitted(event_type: &str, commit: i64) -> EmittedEvent {
        EmittedEvent::new(STREAM, event_type, Some("{}".to_string()), at(commit))
    }

    fn stored(number: i64, event_type: &str, commit: i64, version: &ProjectionVersion) -> RecordedEvent {
        RecordedEvent {
            stream_id: STREAM.to_string(),
            event_number: number,
            event_type: event_type.to_string(),
            data: "{}".to_string(),
            metadata: encode_checkpoint_tag(&at(commit), Some(version), &Map::new()).unwrap(),
            is_json: true,
            position: TfPos::new(number, number),
        }
    }

    /// Answers reads backward from `tail` (ascending by number).
    fn read_page(tail: &[RecordedEvent], request: &IoRequest) -> IoResponse {
        let IoRequest::ReadBackward { from_event_number, max_count, .. } = request else {
            panic!("expected a read, got {:?}", request);
        };
        if tail.is_empty() {
            return IoResponse::Read(ReadResult::NoStream);
        }
        IoResponse::Read(ReadResult::Success(crate::store::slice_backward(tail, *from_event_number, *max_count)))
    }

    fn take_one(fx: &mut Effects) -> (RequestId, IoRequest) {
        let mut out = fx.io.take_outgoing();
        assert_eq!(out.len(), 1, "expected exactly one request: {:?}", out);
        out.remove(0)
    }

    fn complete(s: &mut EmittedStream, fx: &mut Effects, id: RequestId, response: IoResponse) {
        let (k, response) = fx.io.complete(id, response).expect("known request");
        s.handle(&k, response, fx).unwrap();
    }

    /// Serves recovery reads from `tail` until something else is requested.
    fn serve_reads(s: &mut EmittedStream, fx: &mut Effects, tail: &[RecordedEvent]) -> Vec<(RequestId, IoRequest)> {
        loop {
            let out = fx.io.take_outgoing();
            match out.as_slice() {
                [(id, request @ IoRequest::ReadBackward { .. })] => {
                    let response = read_page(tail, request);
                    complete(s, fx, *id, response);
                }
                _ => return out,
            }
        }
    }

    #[test]
    fn test_writes_to_new_stream_with_stamped_metadata() {
        let mut fx = Effects::new();
        let mut s = stream(at(0));
        s.start(&mut fx).unwrap();
        s.emit_events(vec![emitted("A", 10)], &mut fx).unwrap();

        let out = serve_reads(&mut s, &mut fx, &[]);
        let [(id, IoRequest::WriteEvents { expected_version, events, .. })] = out.as_slice() else {
            panic!("expected a write: {:?}", out);
        };
        assert_eq!(*expected_version, ExpectedVersion::NoStream);
        let record = decode_checkpoint_tag(&events[0].metadata, &version()).unwrap();
        assert_eq!(record.tag, at(10));
        assert_eq!(record.version, version());
        assert_eq!(s.writes_in_progress(), 1);

        complete(&mut s, &mut fx, *id, IoResponse::Write(WriteResult::Success { first_event_number: 0 }));
        assert_eq!(s.pending_writes(), 0);
        assert_eq!(s.writes_in_progress(), 0);
    }

    #[test]
    fn test_recovery_acknowledges_already_written_events() {
        let v = version();
        let tail = vec![stored(0, "A", 10, &v), stored(1, "B", 20, &v)];
        let mut fx = Effects::new();
        let mut s = stream(at(0));
        s.start(&mut fx).unwrap();
        s.emit_events(vec![emitted("A", 10)], &mut fx).unwrap();
        s.emit_events(vec![emitted("B", 20)], &mut fx).unwrap();
        s.emit_events(vec![emitted("C", 30)], &mut fx).unwrap();

        let out = serve_reads(&mut s, &mut fx, &tail);
        let [(_, IoRequest::WriteEvents { expected_version, events, .. })] = out.as_slice() else {
            panic!("expected a write: {:?}", out);
        };
        assert_eq!(*expected_version, ExpectedVersion::Exact(1));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "C");
    }

    #[test]
    fn test_recovery_stops_at_start_checkpoint() {
        let v = version();
        let tail = vec![stored(0, "A", 10, &v), stored(1, "B", 20, &v)];
        let mut fx = Effects::new();
        let mut s = stream(at(10));
        s.start(&mut fx).unwrap();
        s.emit_events(vec![emitted("B", 20)], &mut fx).unwrap();

        let out = serve_reads(&mut s, &mut fx, &tail);
        assert!(out.is_empty(), "nothing left to write: {:?}", out);
        assert_eq!(s.pending_writes(), 0);
    }

    #[test]
    fn test_recovery_mismatch_fails() {
        let v = version();
        let tail = vec![stored(0, "A", 10, &v)];
        let mut fx = Effects::new();
        let mut s = stream(at(0));
        s.start(&mut fx).unwrap();
        s.emit_events(vec![emitted("Other", 10)], &mut fx).unwrap();

        serve_reads(&mut s, &mut fx, &tail);
        let Some(Signal::Failed(reason)) = fx.next_signal() else {
            panic!("expected a failure");
        };
        assert!(reason.contains("differs from the originally emitted event"), "{}", reason);
    }

    #[test]
    fn test_foreign_and_unstamped_tails_fail() {
        let foreign = vec![stored(0, "A", 10, &ProjectionVersion::new(99, 0, 0))];
        let mut fx = Effects::new();
        let mut s = stream(at(0));
        s.start(&mut fx).unwrap();
        s.emit_events(vec![emitted("A", 10)], &mut fx).unwrap();
        serve_reads(&mut s, &mut fx, &foreign);
        let Some(Signal::Failed(reason)) = fx.next_signal() else {
            panic!("expected a failure");
        };
        assert!(reason.starts_with("Multiple projections emitting to the same stream detected"));

        let mut outside = stored(0, "A", 10, &version());
        outside.metadata = String::new();
        let mut fx = Effects::new();
        let mut s = stream(at(0));
        s.start(&mut fx).unwrap();
        s.emit_events(vec![emitted("A", 10)], &mut fx).unwrap();
        serve_reads(&mut s, &mut fx, &[outside]);
        let Some(Signal::Failed(reason)) = fx.next_signal() else {
            panic!("expected a failure");
        };
        assert!(reason.contains("has been written to from the outside"), "{}", reason);
    }

    #[test]
    fn test_older_epoch_tail_is_a_new_logical_stream() {
        let old = ProjectionVersion::new(7, 0, 0);
        let tail = vec![stored(0, "A", 10, &old)];
        let mut fx = Effects::new();
        let mut s = EmittedStream::new(
            STREAM,
            1,
            EmittedStreamConfig {
                version: ProjectionVersion::new(7, 1, 1),
                tagger: Arc::new(TransactionFilePositionTagger::new(0)),
                from_checkpoint: at(0),
                max_write_batch_length: 500,
                backoff: RetryBackoff::new(Duration::from_millis(1), 2, StdRng::seed_from_u64(1)),
            },
        );
        s.start(&mut fx).unwrap();
        s.emit_events(vec![emitted("A", 10)], &mut fx).unwrap();

        let out = serve_reads(&mut s, &mut fx, &tail);
        let [(_, IoRequest::WriteEvents { expected_version, events, .. })] = out.as_slice() else {
            panic!("expected a write: {:?}", out);
        };
        assert_eq!(*expected_version, ExpectedVersion::Exact(0));
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_wrong_expected_version_requests_restart() {
        let mut fx = Effects::new();
        let mut s = stream(at(0));
        s.start(&mut fx).unwrap();
        s.emit_events(vec![emitted("A", 10)], &mut fx).unwrap();
        let out = serve_reads(&mut s, &mut fx, &[]);
        let (id, _) = &out[0];

        complete(
            &mut s,
            &mut fx,
            *id,
            IoResponse::Write(WriteResult::WrongExpectedVersion { current_version: 4 }),
        );
        let Some(Signal::RestartRequested(reason)) = fx.next_signal() else {
            panic!("expected a restart");
        };
        assert!(reason.contains("has been written to from the outside"), "{}", reason);
    }

    #[test]
    fn test_timeouts_retry_then_fail() {
        let mut fx = Effects::new();
        let mut s = stream(at(0));
        s.start(&mut fx).unwrap();
        s.emit_events(vec![emitted("A", 10)], &mut fx).unwrap();
        let out = serve_reads(&mut s, &mut fx, &[]);
        let (mut id, _) = out[0].clone();

        // max_retries = 2: attempts 1, 2 and 3, with a backoff delay before each retry
        for _ in 0..2 {
            complete(&mut s, &mut fx, id, IoResponse::Write(WriteResult::CommitTimeout));
            let (delay_id, request) = take_one(&mut fx);
            assert!(matches!(request, IoRequest::Delay { .. }));
            complete(&mut s, &mut fx, delay_id, IoResponse::DelayElapsed);
            let (write_id, request) = take_one(&mut fx);
            assert!(matches!(request, IoRequest::WriteEvents { .. }));
            id = write_id;
        }
        assert!(fx.next_signal().is_none());

        complete(&mut s, &mut fx, id, IoResponse::Write(WriteResult::PrepareTimeout));
        let Some(Signal::Failed(reason)) = fx.next_signal() else {
            panic!("expected a failure");
        };
        assert!(reason.contains("Retry limit of 2 reached"), "{}", reason);
    }

    #[test]
    fn test_expected_tag_mismatch_requests_restart() {
        let mut fx = Effects::new();
        let mut s = stream(at(0));
        s.start(&mut fx).unwrap();
        s.emit_events(vec![emitted("$Checkpoint", 10).with_expected_tag(at(5))], &mut fx)
            .unwrap();
        serve_reads(&mut s, &mut fx, &[]);
        assert!(matches!(fx.next_signal(), Some(Signal::RestartRequested(_))));
    }

    #[test]
    fn test_group_ordering_and_checkpoint() {
        let mut fx = Effects::new();
        let mut s = stream(at(10));
        assert!(s.emit_events(vec![emitted("A", 5)], &mut fx).is_err());
        s.emit_events(vec![emitted("A", 10)], &mut fx).unwrap();
        assert!(matches!(
            s.emit_events(vec![emitted("B", 10)], &mut fx),
            Err(Error::OrderingViolation(_))
        ));
        assert!(s
            .emit_events(vec![emitted("B", 20), emitted("C", 30)], &mut fx)
            .is_err());

        // not started: nothing goes out and checkpointing is refused
        assert!(fx.io.take_outgoing().is_empty());
        assert!(s.checkpoint().is_err());

        s.start(&mut fx).unwrap();
        s.checkpoint().unwrap();
        assert!(!s.is_ready_for_checkpoint());
        assert!(s.emit_events(vec![emitted("D", 40)], &mut fx).is_err());
        assert_eq!(s.reads_in_progress(), 1);

        let out = serve_reads(&mut s, &mut fx, &[]);
        let (id, _) = &out[0];
        complete(&mut s, &mut fx, *id, IoResponse::Write(WriteResult::Success { first_event_number: 0 }));
        assert!(s.is_ready_for_checkpoint());
    }

    #[test]
    fn test_deleted_stream_fails() {
        let mut fx = Effects::new();
        let mut s = stream(at(0));
        s.start(&mut fx).unwrap();
        s.emit_events(vec![emitted("A", 10)], &mut fx).unwrap();
        let (id, _) = take_one(&mut fx);
        complete(&mut s, &mut fx, id, IoResponse::Read(ReadResult::StreamDeleted));
        let Some(Signal::Failed(reason)) = fx.next_signal() else {
            panic!("expected a failure");
        };
        assert_eq!(reason, "Stream : out is deleted. Cannot emit events to it");
    }
}
