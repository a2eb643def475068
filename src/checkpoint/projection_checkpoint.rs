//! One checkpoint interval: the emitted streams written between two
//! checkpoint tags.

use std::collections::BTreeMap;

use tracing::debug;

use super::{CheckpointId, Continuation, EmittedStream, EmittedStreamConfig, Effects, Signal};
use crate::io::IoResponse;
use crate::tag::CheckpointTag;
use crate::types::EmittedEvent;
use crate::{Error, Result};

/// Emitted streams of one checkpoint interval.
///
/// Once [`prepare`](Self::prepare)d, the checkpoint stops accepting events
/// and pushes [`Signal::ReadyForCheckpoint`] when every stream is flushed.
#[derive(Debug)]
pub struct ProjectionCheckpoint {
    id: CheckpointId,
    config: EmittedStreamConfig,
    last_passed: CheckpointTag,
    streams: BTreeMap<String, EmittedStream>,
    started: bool,
    requested: Option<CheckpointTag>,
    ready_reported: bool,
}

impl ProjectionCheckpoint {
    /// Creates a checkpoint starting at `config.from_checkpoint`.
    pub fn new(id: CheckpointId, config: EmittedStreamConfig) -> Self {
        let last_passed = config.from_checkpoint.clone();
        Self {
            id,
            config,
            last_passed,
            streams: BTreeMap::new(),
            started: false,
            requested: None,
            ready_reported: false,
        }
    }

    /// Checkpoint id.
    pub fn id(&self) -> CheckpointId {
        self.id
    }

    /// Tag the interval started at.
    pub fn from(&self) -> &CheckpointTag {
        &self.config.from_checkpoint
    }

    /// Lets the streams write.
    pub fn start(&mut self, fx: &mut Effects) -> Result<()> {
        if self.started {
            return Err(Error::InvalidState(format!("checkpoint {} already started", self.id)));
        }
        self.started = true;
        for stream in self.streams.values_mut() {
            stream.start(fx)?;
        }
        Ok(())
    }

    /// Routes events to their streams, creating streams on first use.
    pub fn validate_order_and_emit_events(&mut self, events: Vec<EmittedEvent>, fx: &mut Effects) -> Result<()> {
        if let Some(requested) = &self.requested {
            return Err(Error::InvalidState(format!(
                "checkpoint at '{}' requested; cannot emit any more events",
                requested
            )));
        }
        let mut groups: Vec<(String, Vec<EmittedEvent>)> = Vec::new();
        for event in events {
            if event.caused_by_tag.is_before(&self.config.from_checkpoint)? {
                return Err(Error::OrderingViolation(format!(
                    "Invalid event order. '{}' goes before the checkpoint start '{}'",
                    event.caused_by_tag, self.config.from_checkpoint
                )));
            }
            if event.caused_by_tag.is_after(&self.last_passed)? {
                self.last_passed = event.caused_by_tag.clone();
            }
            match groups.iter_mut().find(|(stream, _)| *stream == event.stream_id) {
                Some((_, group)) => group.push(event),
                None => groups.push((event.stream_id.clone(), vec![event])),
            }
        }
        for (stream_id, group) in groups {
            self.stream_for(&stream_id, fx)?.emit_events(group, fx)?;
        }
        Ok(())
    }

    /// Stops accepting events; readiness is signalled once all streams flush.
    pub fn prepare(&mut self, position: CheckpointTag, fx: &mut Effects) -> Result<()> {
        self.requested = Some(position);
        for stream in self.streams.values_mut() {
            stream.checkpoint()?;
        }
        self.report_if_ready(fx);
        Ok(())
    }

    /// Routes a completed emitted-stream request.
    pub fn handle(&mut self, continuation: &Continuation, response: IoResponse, fx: &mut Effects) -> Result<()> {
        let stream_id = match continuation {
            Continuation::EmittedRead { stream, .. }
            | Continuation::EmittedWrite { stream, .. }
            | Continuation::EmittedRetry { stream, .. } => stream,
            other => {
                return Err(Error::InvalidState(format!(
                    "checkpoint {} cannot handle {:?}",
                    self.id, other
                )))
            }
        };
        match self.streams.get_mut(stream_id) {
            Some(stream) => stream.handle(continuation, response, fx)?,
            None => debug!(checkpoint = self.id, stream = %stream_id, "response for unknown stream ignored"),
        }
        self.report_if_ready(fx);
        Ok(())
    }

    /// Events waiting to be written, over all streams.
    pub fn pending_writes(&self) -> usize {
        self.streams.values().map(EmittedStream::pending_writes).sum()
    }

    /// Writes in flight, over all streams.
    pub fn writes_in_progress(&self) -> usize {
        self.streams.values().map(EmittedStream::writes_in_progress).sum()
    }

    /// Recovery reads in flight, over all streams.
    pub fn reads_in_progress(&self) -> usize {
        self.streams.values().map(EmittedStream::reads_in_progress).sum()
    }

    /// Drops the streams and forgets their in-flight requests.
    pub fn dispose(self, fx: &mut Effects) {
        let id = self.id;
        fx.io.cancel_where(|k| k.checkpoint() == Some(id));
    }

    fn stream_for(&mut self, stream_id: &str, fx: &mut Effects) -> Result<&mut EmittedStream> {
        if !self.streams.contains_key(stream_id) {
            let mut config = self.config.clone();
            config.backoff = self.config.backoff.fork();
            let mut stream = EmittedStream::new(stream_id, self.id, config);
            if self.started {
                stream.start(fx)?;
            }
            self.streams.insert(stream_id.to_string(), stream);
        }
        self.streams
            .get_mut(stream_id)
            .ok_or_else(|| Error::InvalidState(format!("emitted stream '{}' vanished", stream_id)))
    }

    fn report_if_ready(&mut self, fx: &mut Effects) {
        if self.ready_reported || self.requested.is_none() {
            return;
        }
        if self.streams.values().all(EmittedStream::is_ready_for_checkpoint) {
            self.ready_reported = true;
            fx.signal(Signal::ReadyForCheckpoint { checkpoint: self.id });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::RetryBackoff;
    use crate::io::IoRequest;
    use crate::store::{ReadResult, WriteResult};
    use crate::tagger::TransactionFilePositionTagger;
    use crate::types::ProjectionVersion;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;
    use std::time::Duration;

    fn at(commit: i64) -> CheckpointTag {
        CheckpointTag::from_position(0, commit, commit)
    }

    fn checkpoint(from: CheckpointTag) -> ProjectionCheckpoint {
        ProjectionCheckpoint::new(
            3,
            EmittedStreamConfig {
                version: ProjectionVersion::new(1, 0, 0),
                tagger: Arc::new(TransactionFilePositionTagger::new(0)),
                from_checkpoint: from,
                max_write_batch_length: 500,
                backoff: RetryBackoff::new(Duration::from_millis(1), 3, StdRng::seed_from_u64(9)),
            },
        )
    }

    fn event(stream: &str, commit: i64) -> EmittedEvent {
        EmittedEvent::new(stream, "Thing", Some("{}".to_string()), at(commit))
    }

    /// Answers every outgoing request: empty streams, successful writes.
    fn drain(cp: &mut ProjectionCheckpoint, fx: &mut Effects) {
        loop {
            let out = fx.io.take_outgoing();
            if out.is_empty() {
                return;
            }
            for (id, request) in out {
                let response = match request {
                    IoRequest::ReadBackward { .. } => IoResponse::Read(ReadResult::NoStream),
                    IoRequest::WriteEvents { .. } => {
                        IoResponse::Write(WriteResult::Success { first_event_number: 0 })
                    }
                    IoRequest::Delay { .. } => IoResponse::DelayElapsed,
                };
                let (k, response) = fx.io.complete(id, response).unwrap();
                cp.handle(&k, response, fx).unwrap();
            }
        }
    }

    #[test]
    fn test_empty_checkpoint_is_ready_immediately() {
        let mut fx = Effects::new();
        let mut cp = checkpoint(at(0));
        cp.start(&mut fx).unwrap();
        cp.prepare(at(10), &mut fx).unwrap();
        assert_eq!(fx.next_signal(), Some(Signal::ReadyForCheckpoint { checkpoint: 3 }));
    }

    #[test]
    fn test_ready_after_streams_flush() {
        let mut fx = Effects::new();
        let mut cp = checkpoint(at(0));
        cp.start(&mut fx).unwrap();
        cp.validate_order_and_emit_events(vec![event("a", 5), event("b", 5), event("a", 5)], &mut fx)
            .unwrap();
        assert_eq!(cp.pending_writes(), 3);
        assert_eq!(cp.reads_in_progress(), 2);

        cp.prepare(at(10), &mut fx).unwrap();
        assert!(fx.next_signal().is_none());
        assert!(cp.validate_order_and_emit_events(vec![event("a", 11)], &mut fx).is_err());

        drain(&mut cp, &mut fx);
        assert_eq!(cp.pending_writes(), 0);
        assert_eq!(fx.next_signal(), Some(Signal::ReadyForCheckpoint { checkpoint: 3 }));
        assert!(fx.next_signal().is_none());
    }

    #[test]
    fn test_streams_wait_for_start() {
        let mut fx = Effects::new();
        let mut cp = checkpoint(at(0));
        cp.validate_order_and_emit_events(vec![event("a", 5)], &mut fx).unwrap();
        assert!(fx.io.take_outgoing().is_empty());

        cp.start(&mut fx).unwrap();
        assert_eq!(fx.io.take_outgoing().len(), 1);
    }

    #[test]
    fn test_rejects_events_before_start_tag() {
        let mut fx = Effects::new();
        let mut cp = checkpoint(at(10));
        assert!(matches!(
            cp.validate_order_and_emit_events(vec![event("a", 5)], &mut fx),
            Err(Error::OrderingViolation(_))
        ));
    }

    #[test]
    fn test_dispose_cancels_stream_io() {
        let mut fx = Effects::new();
        let mut cp = checkpoint(at(0));
        cp.start(&mut fx).unwrap();
        cp.validate_order_and_emit_events(vec![event("a", 5)], &mut fx).unwrap();
        assert_eq!(fx.io.pending_count(), 1);
        cp.dispose(&mut fx);
        assert_eq!(fx.io.pending_count(), 0);
    }
}
