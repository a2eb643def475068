#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use spitedb_projections::io::perform;
use spitedb_projections::store::{ExpectedVersion, NewEvent, ReadResult};
use spitedb_projections::subscription::ReaderSubscription;
use spitedb_projections::{
    CheckpointTag, CoreProjection, EmittedEvent, Error, EventStore, HandlerOutput, PartitionState,
    ProjectionConfig, ProjectionOutput, ProjectionStatus, ProjectionVersion, ReceivedEvent, Result,
    SourceDefinition, StateHandler,
};

/// Counts events per stream. `Emit` events also emit the new count to
/// `out-{stream}`; `Boom` events fail.
pub struct Counter;

impl StateHandler for Counter {
    fn partition_for(&self, event: &ReceivedEvent) -> Result<Option<String>> {
        Ok(Some(event.event_stream_id.clone()))
    }

    fn process_event(
        &mut self,
        partition: &str,
        state: &PartitionState,
        event: &ReceivedEvent,
        tag: &CheckpointTag,
    ) -> Result<Option<HandlerOutput>> {
        if event.event_type == "Boom" {
            return Err(Error::Handler("boom".to_string()));
        }
        let count: u64 = if state.state.is_empty() {
            0
        } else {
            state.state.parse().map_err(|_| Error::Handler("bad state".to_string()))?
        };
        let mut output = HandlerOutput::state((count + 1).to_string());
        if event.event_type == "Emit" {
            output = output.with_emitted(EmittedEvent::new(
                format!("out-{}", partition),
                "Counted",
                Some((count + 1).to_string()),
                tag.clone(),
            ));
        }
        Ok(Some(output))
    }
}

pub fn counter(config: ProjectionConfig) -> CoreProjection<Counter> {
    CoreProjection::with_seed(
        "counter",
        ProjectionVersion::new(1, 0, 0),
        SourceDefinition::AllEvents,
        Counter,
        config,
        7,
    )
}

pub fn create_temp_store_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

pub fn append(store: &dyn EventStore, stream: &str, event_type: &str) {
    store
        .write_events(stream, ExpectedVersion::Any, vec![NewEvent::new(event_type, "{}")])
        .expect("append event");
}

/// Payloads of `stream`, oldest first.
pub fn stream_data(store: &dyn EventStore, stream: &str) -> Vec<String> {
    match store.read_stream_forward(stream, 0, 1000).expect("read stream") {
        ReadResult::Success(slice) => slice.events.into_iter().map(|e| e.data).collect(),
        _ => Vec::new(),
    }
}

/// Drives a projection synchronously against a store.
pub struct Driver {
    pub projection: CoreProjection<Counter>,
    pub store: Arc<dyn EventStore>,
    pub subscription: Option<ReaderSubscription>,
    pub outputs: Vec<ProjectionOutput>,
}

impl Driver {
    pub fn new(store: Arc<dyn EventStore>, config: ProjectionConfig) -> Self {
        Self::with_projection(store, counter(config))
    }

    pub fn with_projection(store: Arc<dyn EventStore>, projection: CoreProjection<Counter>) -> Self {
        Self {
            projection,
            store,
            subscription: None,
            outputs: Vec::new(),
        }
    }

    /// Performs requested IO until the projection goes quiet.
    pub fn settle(&mut self) {
        loop {
            let io = self.projection.take_io();
            let outputs = self.projection.take_outputs();
            if io.is_empty() && outputs.is_empty() {
                break;
            }
            for (id, request) in io {
                let response = perform(self.store.as_ref(), &request);
                self.projection.handle_io(id, response);
            }
            for output in outputs {
                match output {
                    ProjectionOutput::Subscribe(subscription) => self.subscription = Some(subscription),
                    ProjectionOutput::Unsubscribe { .. } => self.subscription = None,
                    ProjectionOutput::Tick => self.projection.tick(),
                    other => self.outputs.push(other),
                }
            }
        }
    }

    /// Delivers the unread part of the log to the current subscription.
    pub fn feed(&mut self) {
        self.settle();
        let Some(subscription) = self.subscription.as_mut() else {
            return;
        };
        let slice = self
            .store
            .read_all_forward(subscription.read_from(), 1000)
            .expect("read log");
        let mut messages = Vec::new();
        for event in slice.events {
            messages.extend(
                subscription
                    .handle_committed_event(event.into(), 100.0)
                    .expect("tag event"),
            );
        }
        if subscription.stop_on_eof() {
            messages.extend(subscription.handle_eof());
        }
        for message in messages {
            self.projection.handle_subscription_message(message);
            self.settle();
        }
    }

    pub fn state_of(&mut self, partition: &str) -> Option<String> {
        let query = self.projection.get_state(partition);
        self.settle();
        self.outputs.iter().find_map(|o| match o {
            ProjectionOutput::StateReport { query_id, state, .. } if *query_id == query => Some(state.clone()),
            _ => None,
        })?
    }

    pub fn statuses(&self) -> Vec<ProjectionStatus> {
        self.outputs
            .iter()
            .filter_map(|o| match o {
                ProjectionOutput::Status(status) => Some(status.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn stream(&self, stream: &str) -> Vec<String> {
        stream_data(self.store.as_ref(), stream)
    }
}

/// Polls `f` until it yields a value.
pub async fn eventually<T, F, Fut>(timeout: Duration, interval: Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f().await {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
