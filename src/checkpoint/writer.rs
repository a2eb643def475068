//! Persisting and loading the `$ProjectionCheckpoint` record.
//!
//! The checkpoint stream belongs to the projection alone: every write
//! expects the event number of the last record this projection wrote, so an
//! outside write turns into a restart rather than silently interleaving.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{Continuation, Effects, Signal};
use crate::backoff::{RetryBackoff, WARN_FROM_ATTEMPT};
use crate::codec::{decode_checkpoint_tag, encode_checkpoint_tag};
use crate::io::{IoRequest, IoResponse};
use crate::store::{ExpectedVersion, NewEvent, ReadResult, WriteResult, FROM_END};
use crate::tag::{CheckpointTag, NO_STREAM};
use crate::tagger::PositionTagger;
use crate::types::{ProjectionVersion, CHECKPOINT_EVENT_TYPE};
use crate::{Error, Result};

// =============================================================================
// Writer
// =============================================================================

#[derive(Debug)]
struct InFlightCheckpoint {
    position: CheckpointTag,
    event: NewEvent,
    attempt: u32,
}

/// Writes checkpoint records to `$projections-{name}-checkpoint`.
#[derive(Debug)]
pub struct CheckpointWriter {
    stream: String,
    version: ProjectionVersion,
    backoff: RetryBackoff,
    last_written_event_number: i64,
    in_flight: Option<InFlightCheckpoint>,
}

impl CheckpointWriter {
    /// Creates a writer for `stream`.
    pub fn new(stream: impl Into<String>, version: ProjectionVersion, backoff: RetryBackoff) -> Self {
        Self {
            stream: stream.into(),
            version,
            backoff,
            last_written_event_number: NO_STREAM,
            in_flight: None,
        }
    }

    /// Forgets the in-flight write and the known stream position.
    pub fn initialize(&mut self) {
        self.in_flight = None;
        self.last_written_event_number = NO_STREAM;
    }

    /// Sets the event number the next write expects.
    pub fn start_from(&mut self, event_number: i64) {
        self.last_written_event_number = event_number;
    }

    /// `1` while a checkpoint write is in flight.
    pub fn writes_in_progress(&self) -> usize {
        usize::from(self.in_flight.is_some())
    }

    /// Writes the checkpoint record for `position` with the serialized root state.
    pub fn begin_write_checkpoint(&mut self, position: CheckpointTag, state: String, fx: &mut Effects) -> Result<()> {
        if let Some(in_flight) = &self.in_flight {
            return Err(Error::InvalidState(format!(
                "checkpoint at '{}' is still being written",
                in_flight.position
            )));
        }
        let metadata = encode_checkpoint_tag(&position, Some(&self.version), &Default::default())?;
        let event = NewEvent::new(CHECKPOINT_EVENT_TYPE, state).with_metadata(metadata);
        self.in_flight = Some(InFlightCheckpoint {
            position,
            event,
            attempt: 1,
        });
        self.publish(fx);
        Ok(())
    }

    /// Handles a checkpoint write or retry completion. Returns the tag once
    /// the record is durable.
    pub fn handle(
        &mut self,
        continuation: &Continuation,
        response: IoResponse,
        fx: &mut Effects,
    ) -> Result<Option<CheckpointTag>> {
        match continuation {
            Continuation::CheckpointRetry => {
                if self.in_flight.is_some() {
                    self.publish(fx);
                }
                Ok(None)
            }
            Continuation::WriteCheckpoint => self.write_completed(response, fx),
            other => Err(Error::InvalidState(format!("checkpoint writer cannot handle {:?}", other))),
        }
    }

    fn write_completed(&mut self, response: IoResponse, fx: &mut Effects) -> Result<Option<CheckpointTag>> {
        let Some(in_flight) = self.in_flight.as_mut() else {
            debug!(stream = %self.stream, "late checkpoint write completion ignored");
            return Ok(None);
        };
        let reason = match response {
            IoResponse::Write(WriteResult::Success { first_event_number }) => {
                self.last_written_event_number = first_event_number;
                let position = in_flight.position.clone();
                self.in_flight = None;
                debug!(stream = %self.stream, %position, "checkpoint written");
                return Ok(Some(position));
            }
            IoResponse::Write(WriteResult::WrongExpectedVersion { current_version }) => {
                info!(stream = %self.stream, current_version, "checkpoint stream written from outside");
                self.in_flight = None;
                fx.restart(format!(
                    "Checkpoint stream `{}` has been written to from the outside",
                    self.stream
                ));
                return Ok(None);
            }
            IoResponse::Write(result) if result.is_transient() => format!("{:?}", result),
            IoResponse::TimedOut => "Timeout".to_string(),
            IoResponse::Write(result) => {
                self.in_flight = None;
                fx.fail(format!("Failed to write a checkpoint to {}: {:?}", self.stream, result));
                return Ok(None);
            }
            IoResponse::Failed(reason) => {
                self.in_flight = None;
                fx.fail(reason);
                return Ok(None);
            }
            other => {
                return Err(Error::InvalidState(format!(
                    "unexpected checkpoint write response: {:?}",
                    other
                )))
            }
        };

        if !self.backoff.should_retry(in_flight.attempt) {
            let position = in_flight.position.clone();
            self.in_flight = None;
            fx.fail(format!(
                "Failed to write a checkpoint to {}. Retry limit of {} reached. Reason: {}. Checkpoint: {}.",
                self.stream,
                self.backoff.max_retries(),
                reason,
                position
            ));
            return Ok(None);
        }
        in_flight.attempt += 1;
        let attempt = in_flight.attempt;
        if attempt >= WARN_FROM_ATTEMPT {
            warn!(stream = %self.stream, attempt, %reason, "retrying checkpoint write");
        }
        let delay = self.backoff.delay_for_attempt(attempt);
        fx.io.publish(IoRequest::Delay { duration: delay }, Continuation::CheckpointRetry);
        Ok(None)
    }

    fn publish(&self, fx: &mut Effects) {
        let Some(in_flight) = &self.in_flight else {
            return;
        };
        fx.io.publish(
            IoRequest::WriteEvents {
                stream: self.stream.clone(),
                expected_version: ExpectedVersion::from_last_event_number(self.last_written_event_number),
                events: vec![in_flight.event.clone()],
            },
            Continuation::WriteCheckpoint,
        );
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Loads the newest usable checkpoint record.
#[derive(Debug)]
pub struct CheckpointReader {
    stream: String,
    version: ProjectionVersion,
    tagger: Arc<dyn PositionTagger>,
    checkpoints_enabled: bool,
    loading: bool,
}

impl CheckpointReader {
    /// Creates a reader for `stream`.
    pub fn new(
        stream: impl Into<String>,
        version: ProjectionVersion,
        tagger: Arc<dyn PositionTagger>,
        checkpoints_enabled: bool,
    ) -> Self {
        Self {
            stream: stream.into(),
            version,
            tagger,
            checkpoints_enabled,
            loading: false,
        }
    }

    /// Forgets an in-flight load.
    pub fn initialize(&mut self) {
        self.loading = false;
    }

    /// `1` while a checkpoint read is in flight.
    pub fn reads_in_progress(&self) -> usize {
        usize::from(self.loading)
    }

    /// Starts loading; the answer arrives as [`Signal::CheckpointLoaded`].
    pub fn begin_load_state(&mut self, fx: &mut Effects) -> Result<()> {
        if self.loading {
            return Err(Error::InvalidState("checkpoint is already being loaded".to_string()));
        }
        if !self.checkpoints_enabled {
            fx.signal(Signal::CheckpointLoaded {
                tag: None,
                data: None,
                event_number: NO_STREAM,
            });
            return Ok(());
        }
        self.loading = true;
        self.read_page(FROM_END, fx);
        Ok(())
    }

    /// Handles a page of the checkpoint stream.
    pub fn handle(&mut self, response: IoResponse, fx: &mut Effects) -> Result<()> {
        if !self.loading {
            return Ok(());
        }
        let slice = match response {
            IoResponse::Read(ReadResult::Success(slice)) => slice,
            IoResponse::Read(ReadResult::NoStream) => {
                self.loaded(None, None, NO_STREAM, fx);
                return Ok(());
            }
            IoResponse::Read(other @ (ReadResult::StreamDeleted | ReadResult::AccessDenied)) => {
                self.loading = false;
                fx.fail(format!("Cannot read the '{}' stream: {:?}", self.stream, other));
                return Ok(());
            }
            IoResponse::Failed(reason) => {
                self.loading = false;
                fx.fail(reason);
                return Ok(());
            }
            other => {
                return Err(Error::InvalidState(format!(
                    "unexpected checkpoint read response: {:?}",
                    other
                )))
            }
        };

        if let Some(event) = slice.events.iter().find(|e| e.event_type == CHECKPOINT_EVENT_TYPE) {
            let stored = decode_checkpoint_tag(&event.metadata, &self.version)?;
            if stored.version.projection_id != self.version.projection_id
                || self.version.epoch > stored.version.version
            {
                info!(stream = %self.stream, stored = %stored.version, "checkpoint from another epoch ignored");
                self.loaded(None, None, slice.last_event_number, fx);
            } else {
                let tag = stored.adjust_by(self.tagger.as_ref(), &self.version)?;
                let data = Some(event.data.clone());
                self.loaded(Some(tag), data, event.event_number, fx);
            }
            return Ok(());
        }
        if slice.is_end_of_stream {
            self.loaded(None, None, slice.last_event_number, fx);
        } else {
            self.read_page(slice.next_event_number, fx);
        }
        Ok(())
    }

    fn read_page(&self, from_event_number: i64, fx: &mut Effects) {
        fx.io.publish(
            IoRequest::ReadBackward {
                stream: self.stream.clone(),
                from_event_number,
                max_count: 1,
            },
            Continuation::ReadCheckpoint,
        );
    }

    fn loaded(&mut self, tag: Option<CheckpointTag>, data: Option<String>, event_number: i64, fx: &mut Effects) {
        self.loading = false;
        fx.signal(Signal::CheckpointLoaded {
            tag,
            data,
            event_number,
        });
    }
}
