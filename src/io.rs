//! # Correlated Store IO
//!
//! The projection core never talks to the store directly. It publishes
//! [`IoRequest`]s, each tagged with a [`RequestId`] and a continuation that
//! says what to do with the answer, and the runtime later feeds the
//! [`IoResponse`] back in.
//!
//! ```text
//!  core ──publish(req, k)──► IoDispatcher ──(id, req)──► runtime ──► store
//!   ▲                            │
//!   └────── k, response ◄── complete(id, resp) ◄──────────────────────┘
//! ```
//!
//! Cancelling a request drops its continuation, so a late completion for it
//! is ignored. A read that timed out is reissued with the same id and
//! continuation instead of being surfaced.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tracing::debug;

use crate::store::{EventStore, ExpectedVersion, NewEvent, ReadResult, WriteResult};

/// Identifier of an in-flight request.
pub type RequestId = u64;

/// Something the core needs the runtime to do.
#[derive(Debug, Clone, PartialEq)]
pub enum IoRequest {
    /// Read a stream backward.
    ReadBackward {
        /// Stream to read.
        stream: String,
        /// First event number to return, or `-1` for the end.
        from_event_number: i64,
        /// Page size.
        max_count: usize,
    },
    /// Append to a stream.
    WriteEvents {
        /// Target stream.
        stream: String,
        /// Concurrency expectation.
        expected_version: ExpectedVersion,
        /// Events to append.
        events: Vec<NewEvent>,
    },
    /// Wait, then answer with [`IoResponse::DelayElapsed`].
    Delay {
        /// How long to wait.
        duration: Duration,
    },
}

impl IoRequest {
    fn is_read(&self) -> bool {
        matches!(self, IoRequest::ReadBackward { .. })
    }

    fn is_write(&self) -> bool {
        matches!(self, IoRequest::WriteEvents { .. })
    }
}

/// What the runtime reports back.
#[derive(Debug, Clone, PartialEq)]
pub enum IoResponse {
    /// Answer to a read.
    Read(ReadResult),
    /// Answer to a write.
    Write(WriteResult),
    /// A delay ran out.
    DelayElapsed,
    /// The store did not answer in time.
    TimedOut,
    /// The store is broken.
    Failed(String),
}

/// Pending requests and their continuations.
#[derive(Debug)]
pub struct IoDispatcher<K> {
    next_id: RequestId,
    pending: HashMap<RequestId, (IoRequest, K)>,
    outgoing: VecDeque<(RequestId, IoRequest)>,
}

impl<K> Default for IoDispatcher<K> {
    fn default() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
            outgoing: VecDeque::new(),
        }
    }
}

impl<K> IoDispatcher<K> {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request and queues it for the runtime.
    pub fn publish(&mut self, request: IoRequest, continuation: K) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        self.outgoing.push_back((id, request.clone()));
        self.pending.insert(id, (request, continuation));
        id
    }

    /// Requests published since the last call.
    pub fn take_outgoing(&mut self) -> Vec<(RequestId, IoRequest)> {
        self.outgoing.drain(..).collect()
    }

    /// Matches a response with its continuation.
    ///
    /// Returns `None` for cancelled or unknown requests and for read
    /// timeouts, which are reissued.
    pub fn complete(&mut self, id: RequestId, response: IoResponse) -> Option<(K, IoResponse)> {
        let (request, continuation) = self.pending.remove(&id)?;
        if response == IoResponse::TimedOut && request.is_read() {
            debug!(request_id = id, "read timed out, reissuing");
            self.outgoing.push_back((id, request.clone()));
            self.pending.insert(id, (request, continuation));
            return None;
        }
        Some((continuation, response))
    }

    /// Forgets one request.
    pub fn cancel(&mut self, id: RequestId) {
        self.pending.remove(&id);
        self.outgoing.retain(|(queued, _)| *queued != id);
    }

    /// Forgets every request whose continuation matches `predicate`.
    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&K) -> bool) {
        let cancelled: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, (_, k))| predicate(k))
            .map(|(id, _)| *id)
            .collect();
        for id in cancelled {
            self.cancel(id);
        }
    }

    /// Forgets every request.
    pub fn cancel_all(&mut self) {
        self.pending.clear();
        self.outgoing.clear();
    }

    /// Reads in flight whose continuation matches `predicate`.
    pub fn reads_in_flight(&self, predicate: impl Fn(&K) -> bool) -> usize {
        self.pending
            .values()
            .filter(|(r, k)| r.is_read() && predicate(k))
            .count()
    }

    /// Writes in flight whose continuation matches `predicate`.
    pub fn writes_in_flight(&self, predicate: impl Fn(&K) -> bool) -> usize {
        self.pending
            .values()
            .filter(|(r, k)| r.is_write() && predicate(k))
            .count()
    }

    /// Number of requests in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Performs a store request synchronously.
///
/// A delay completes at once; callers that want to wait sleep before
/// calling this. Store errors become [`IoResponse::Failed`].
pub fn perform(store: &dyn EventStore, request: &IoRequest) -> IoResponse {
    let outcome = match request {
        IoRequest::ReadBackward {
            stream,
            from_event_number,
            max_count,
        } => store
            .read_stream_backward(stream, *from_event_number, *max_count)
            .map(IoResponse::Read),
        IoRequest::WriteEvents {
            stream,
            expected_version,
            events,
        } => store
            .write_events(stream, *expected_version, events.clone())
            .map(IoResponse::Write),
        IoRequest::Delay { .. } => Ok(IoResponse::DelayElapsed),
    };
    outcome.unwrap_or_else(|err| IoResponse::Failed(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn read(stream: &str) -> IoRequest {
        IoRequest::ReadBackward {
            stream: stream.to_string(),
            from_event_number: -1,
            max_count: 1,
        }
    }

    #[test]
    fn test_completion_returns_continuation() {
        let mut io: IoDispatcher<&str> = IoDispatcher::new();
        let id = io.publish(read("s"), "load");
        assert_eq!(io.take_outgoing(), vec![(id, read("s"))]);

        let (k, response) = io.complete(id, IoResponse::Read(ReadResult::NoStream)).unwrap();
        assert_eq!(k, "load");
        assert_eq!(response, IoResponse::Read(ReadResult::NoStream));
        assert!(io.complete(id, IoResponse::Read(ReadResult::NoStream)).is_none());
    }

    #[test]
    fn test_cancelled_completion_is_ignored() {
        let mut io: IoDispatcher<u8> = IoDispatcher::new();
        let a = io.publish(read("a"), 1);
        let b = io.publish(read("b"), 2);
        io.cancel_where(|k| *k == 1);
        assert!(io.complete(a, IoResponse::DelayElapsed).is_none());
        assert!(io.complete(b, IoResponse::DelayElapsed).is_some());

        io.publish(read("c"), 3);
        io.cancel_all();
        assert_eq!(io.pending_count(), 0);
        assert!(io.take_outgoing().is_empty());
    }

    #[test]
    fn test_read_timeout_is_reissued() {
        let mut io: IoDispatcher<&str> = IoDispatcher::new();
        let id = io.publish(read("s"), "checkpoint");
        io.take_outgoing();

        assert!(io.complete(id, IoResponse::TimedOut).is_none());
        assert_eq!(io.take_outgoing(), vec![(id, read("s"))]);
        assert_eq!(io.reads_in_flight(|_| true), 1);

        let delay = io.publish(IoRequest::Delay { duration: Duration::from_millis(5) }, "retry");
        assert_eq!(io.complete(delay, IoResponse::TimedOut).map(|(k, _)| k), Some("retry"));
    }

    #[test]
    fn test_perform_against_memory_store() {
        let store = MemoryStore::new();
        let write = IoRequest::WriteEvents {
            stream: "s".to_string(),
            expected_version: ExpectedVersion::NoStream,
            events: vec![NewEvent::new("E", "{}")],
        };
        assert_eq!(
            perform(&store, &write),
            IoResponse::Write(WriteResult::Success { first_event_number: 0 })
        );
        assert!(matches!(perform(&store, &read("s")), IoResponse::Read(ReadResult::Success(_))));
        assert_eq!(
            perform(&store, &IoRequest::Delay { duration: Duration::from_secs(1) }),
            IoResponse::DelayElapsed
        );
    }
}
