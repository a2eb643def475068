//! # Projection Runtime
//!
//! Runs a [`CoreProjection`] on tokio. The projection itself does no IO; this
//! module is the driver that performs its store requests, runs its readers
//! and hands its outputs to callers.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                        ProjectionHandle (Clone)                       │
//! │         start / stop / kill / statistics / state / shutdown           │
//! └──────────────────────────────┬────────────────────────────────────────┘
//!                                │ mpsc (commands, oneshot replies)
//!                                ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                          Projection actor task                         │
//! │                                                                       │
//! │   CoreProjection ──take_io──► spawn_blocking(store) ──┐               │
//! │        ▲                      sleep (delays)          │ internal mpsc │
//! │        └───────────── handle_io / messages / Tick ◄───┘               │
//! │                                                                       │
//! │   Subscribe ──► reader task: read_all_forward ─► ReaderSubscription   │
//! │   ReadControl ──► watch (pause / resume / stop)                       │
//! │   Status ──► broadcast                                                │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Rust Concepts
//!
//! - **Actor ownership**: the projection is owned by one task, so it needs no
//!   locking. Everything else talks to it through channels.
//! - **`spawn_blocking`**: [`EventStore`] calls are synchronous (SQLite), so
//!   they run on tokio's blocking pool instead of stalling the actor.
//! - **`tokio::sync::watch`**: the latest pause/resume/stop decision for a
//!   reader; a reader only ever needs the newest value.
//! - **`tokio::sync::broadcast`**: status changes fan out to every listener.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::handler::StateHandler;
use crate::io::{perform, IoRequest, IoResponse, RequestId};
use crate::processing_queue::ReadControl;
use crate::projection::{
    CoreProjection, ProjectionOutput, ProjectionState, ProjectionStatistics, ProjectionStatus, QueryId,
};
use crate::store::EventStore;
use crate::subscription::{ReaderSubscription, SubscriptionId, SubscriptionMessage};
use crate::tag::TfPos;

// =============================================================================
// Configuration
// =============================================================================

/// Size of the command channel.
const COMMAND_CHANNEL_SIZE: usize = 256;

/// Default number of log events a reader fetches per read.
pub const DEFAULT_READ_BATCH_SIZE: usize = 500;

/// Default wait before a caught-up reader polls the log again.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Default capacity of the status broadcast.
pub const DEFAULT_STATUS_CAPACITY: usize = 64;

/// Settings of the runtime, as opposed to the projection.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Log events fetched per reader read.
    pub read_batch_size: usize,
    /// Wait before a caught-up reader polls again.
    pub poll_interval: Duration,
    /// Status changes buffered for slow listeners.
    pub status_capacity: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            status_capacity: DEFAULT_STATUS_CAPACITY,
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

enum Command {
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    Kill {
        reply: oneshot::Sender<()>,
    },
    Statistics {
        reply: oneshot::Sender<ProjectionStatistics>,
    },
    State {
        reply: oneshot::Sender<ProjectionState>,
    },
    Query {
        partition: String,
        result: bool,
        reply: oneshot::Sender<Option<String>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Messages from tasks the actor spawned.
enum Internal {
    IoCompleted {
        id: RequestId,
        response: IoResponse,
    },
    Messages(Vec<SubscriptionMessage>),
    ReaderFailed {
        subscription: SubscriptionId,
        reason: String,
    },
    Tick,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderControl {
    Run,
    Pause,
    Stop,
}

// =============================================================================
// Handle
// =============================================================================

/// Async handle to a projection running on tokio.
///
/// Cloning is cheap; all clones talk to the same actor.
#[derive(Clone)]
pub struct ProjectionHandle {
    commands: mpsc::Sender<Command>,
    status: broadcast::Sender<ProjectionStatus>,
}

impl ProjectionHandle {
    /// Loads the last checkpoint and starts processing.
    pub async fn start(&self) -> Result<()> {
        self.request(|reply| Command::Start { reply }).await?
    }

    /// Writes a final checkpoint and stops. Resolves once the projection has
    /// stopped or faulted.
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await?
    }

    /// Stops without a final checkpoint.
    pub async fn kill(&self) -> Result<()> {
        self.request(|reply| Command::Kill { reply }).await
    }

    /// Snapshot of the projection's counters.
    pub async fn statistics(&self) -> Result<ProjectionStatistics> {
        self.request(|reply| Command::Statistics { reply }).await
    }

    /// Lifecycle state.
    pub async fn state(&self) -> Result<ProjectionState> {
        self.request(|reply| Command::State { reply }).await
    }

    /// State of `partition`, `None` when unknown.
    pub async fn partition_state(&self, partition: impl Into<String>) -> Result<Option<String>> {
        let partition = partition.into();
        self.request(|reply| Command::Query {
            partition,
            result: false,
            reply,
        })
        .await
    }

    /// Result of `partition`, `None` when unknown.
    pub async fn partition_result(&self, partition: impl Into<String>) -> Result<Option<String>> {
        let partition = partition.into();
        self.request(|reply| Command::Query {
            partition,
            result: true,
            reply,
        })
        .await
    }

    /// Receives every status change from now on.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ProjectionStatus> {
        self.status.subscribe()
    }

    /// Kills the projection and ends the actor. Call [`stop`](Self::stop)
    /// first to keep a final checkpoint.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| Error::RuntimeClosed)?;
        response.await.map_err(|_| Error::RuntimeClosed)
    }
}

/// Spawns `projection` on the current tokio runtime.
///
/// The projection starts idle; call [`ProjectionHandle::start`].
///
/// # Example
///
/// ```rust,ignore
/// let store: Arc<dyn EventStore> = Arc::new(SqliteStore::open("events.db")?);
/// let handle = spawn_projection(projection, store, RuntimeOptions::default());
/// handle.start().await?;
/// ```
pub fn spawn_projection<H>(
    projection: CoreProjection<H>,
    store: Arc<dyn EventStore>,
    options: RuntimeOptions,
) -> ProjectionHandle
where
    H: StateHandler + 'static,
{
    let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (status, _) = broadcast::channel(options.status_capacity.max(1));
    let actor = ProjectionActor {
        read_timeout: projection.config().read_timeout,
        projection,
        store,
        options,
        internal_tx,
        readers: HashMap::new(),
        queries: HashMap::new(),
        stop_waiters: Vec::new(),
        status: status.clone(),
    };
    tokio::spawn(actor.run(command_rx, internal_rx));
    ProjectionHandle { commands, status }
}

// =============================================================================
// Actor
// =============================================================================

struct ProjectionActor<H: StateHandler> {
    projection: CoreProjection<H>,
    store: Arc<dyn EventStore>,
    options: RuntimeOptions,
    read_timeout: Duration,
    internal_tx: mpsc::UnboundedSender<Internal>,
    readers: HashMap<SubscriptionId, watch::Sender<ReaderControl>>,
    queries: HashMap<QueryId, oneshot::Sender<Option<String>>>,
    stop_waiters: Vec<oneshot::Sender<Result<()>>>,
    status: broadcast::Sender<ProjectionStatus>,
}

impl<H: StateHandler + 'static> ProjectionActor<H> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut internal: mpsc::UnboundedReceiver<Internal>) {
        info!(projection = %self.projection.name(), "projection runtime started");
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = internal.recv() => self.handle_internal(event),
            }
        }
        info!(projection = %self.projection.name(), "projection runtime stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { reply } => {
                let _ = reply.send(self.projection.start());
            }
            Command::Stop { reply } => match self.projection.stop() {
                Ok(()) => self.stop_waiters.push(reply),
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Command::Kill { reply } => {
                self.projection.kill();
                let _ = reply.send(());
            }
            Command::Statistics { reply } => {
                let _ = reply.send(self.projection.statistics());
            }
            Command::State { reply } => {
                let _ = reply.send(self.projection.state());
            }
            Command::Query {
                partition,
                result,
                reply,
            } => {
                let query = if result {
                    self.projection.get_result(partition)
                } else {
                    self.projection.get_state(partition)
                };
                self.queries.insert(query, reply);
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
        self.flush();
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::IoCompleted { id, response } => self.projection.handle_io(id, response),
            Internal::Messages(messages) => {
                for message in messages {
                    self.projection.handle_subscription_message(message);
                }
            }
            Internal::ReaderFailed { subscription, reason } => {
                self.projection.reader_failed(subscription, reason);
            }
            Internal::Tick => self.projection.tick(),
        }
        self.flush();
    }

    fn shutdown(&mut self) {
        self.projection.kill();
        self.flush();
        for (_, reader) in self.readers.drain() {
            let _ = reader.send(ReaderControl::Stop);
        }
        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(Err(Error::RuntimeClosed));
        }
    }

    /// Performs what the projection asked for.
    fn flush(&mut self) {
        for (id, request) in self.projection.take_io() {
            self.dispatch_io(id, request);
        }
        for output in self.projection.take_outputs() {
            self.handle_output(output);
        }
        if !matches!(
            self.projection.state(),
            ProjectionState::Stopping | ProjectionState::FaultedStopping | ProjectionState::CompletingPhase
        ) {
            for waiter in self.stop_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    fn handle_output(&mut self, output: ProjectionOutput) {
        match output {
            ProjectionOutput::Subscribe(subscription) => self.spawn_reader(subscription),
            ProjectionOutput::Unsubscribe { subscription } => {
                if let Some(reader) = self.readers.remove(&subscription) {
                    let _ = reader.send(ReaderControl::Stop);
                }
            }
            ProjectionOutput::ReadControl { subscription, control } => {
                if let Some(reader) = self.readers.get(&subscription) {
                    let control = match control {
                        ReadControl::Pause => ReaderControl::Pause,
                        ReadControl::Resume => ReaderControl::Run,
                    };
                    let _ = reader.send(control);
                }
            }
            ProjectionOutput::Tick => {
                let _ = self.internal_tx.send(Internal::Tick);
            }
            ProjectionOutput::Status(status) => {
                debug!(projection = %self.projection.name(), ?status, "status changed");
                let _ = self.status.send(status);
            }
            ProjectionOutput::StateReport { query_id, state, .. } => self.answer(query_id, state),
            ProjectionOutput::ResultReport { query_id, result, .. } => self.answer(query_id, result),
        }
    }

    fn answer(&mut self, query: QueryId, value: Option<String>) {
        if let Some(reply) = self.queries.remove(&query) {
            let _ = reply.send(value);
        }
    }

    fn dispatch_io(&self, id: RequestId, request: IoRequest) {
        let tx = self.internal_tx.clone();
        if let IoRequest::Delay { duration } = request {
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                let _ = tx.send(Internal::IoCompleted {
                    id,
                    response: IoResponse::DelayElapsed,
                });
            });
            return;
        }
        let store = self.store.clone();
        let timeout = matches!(request, IoRequest::ReadBackward { .. }).then_some(self.read_timeout);
        tokio::spawn(async move {
            let call = tokio::task::spawn_blocking(move || perform(store.as_ref(), &request));
            let response = match timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(joined) => joined_response(joined),
                    Err(_) => IoResponse::TimedOut,
                },
                None => joined_response(call.await),
            };
            let _ = tx.send(Internal::IoCompleted { id, response });
        });
    }

    fn spawn_reader(&mut self, subscription: ReaderSubscription) {
        let (control, control_rx) = watch::channel(ReaderControl::Run);
        self.readers.insert(subscription.id(), control);
        let reader = LogReader {
            from: subscription.read_from(),
            subscription,
            store: self.store.clone(),
            tx: self.internal_tx.clone(),
            control: control_rx,
            batch_size: self.options.read_batch_size.max(1),
            poll_interval: self.options.poll_interval,
        };
        tokio::spawn(reader.run());
    }
}

fn joined_response(joined: std::result::Result<IoResponse, tokio::task::JoinError>) -> IoResponse {
    joined.unwrap_or_else(|err| IoResponse::Failed(format!("store call panicked: {}", err)))
}

// =============================================================================
// Reader
// =============================================================================

/// Pages through the global log on behalf of one subscription.
struct LogReader {
    subscription: ReaderSubscription,
    from: TfPos,
    store: Arc<dyn EventStore>,
    tx: mpsc::UnboundedSender<Internal>,
    control: watch::Receiver<ReaderControl>,
    batch_size: usize,
    poll_interval: Duration,
}

impl LogReader {
    async fn run(mut self) {
        let id = self.subscription.id();
        debug!(subscription = id, from = %self.from, "reader started");
        loop {
            let control = *self.control.borrow_and_update();
            match control {
                ReaderControl::Stop => break,
                ReaderControl::Pause => {
                    if self.control.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                ReaderControl::Run => {}
            }

            let store = self.store.clone();
            let (from, batch_size) = (self.from, self.batch_size);
            let slice = match tokio::task::spawn_blocking(move || store.read_all_forward(from, batch_size)).await {
                Ok(Ok(slice)) => slice,
                Ok(Err(err)) => {
                    warn!(subscription = id, %err, "log read failed, retrying");
                    if !self.idle().await {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    self.fail(format!("log read panicked: {}", err));
                    break;
                }
            };

            let progress = progress(slice.next_position, slice.head);
            let mut messages = Vec::new();
            for event in slice.events {
                match self.subscription.handle_committed_event(event.into(), progress) {
                    Ok(produced) => messages.extend(produced),
                    Err(err) => {
                        self.fail(err.to_string());
                        return;
                    }
                }
            }
            self.from = slice.next_position;
            let stop = slice.is_end && self.subscription.stop_on_eof();
            if stop {
                messages.extend(self.subscription.handle_eof());
            }
            if !messages.is_empty() && self.tx.send(Internal::Messages(messages)).is_err() {
                break;
            }
            if stop {
                debug!(subscription = id, "end of log reached");
                break;
            }
            if slice.is_end && !self.idle().await {
                break;
            }
        }
        debug!(subscription = id, "reader stopped");
    }

    /// Waits for new data or a control change; `false` when the actor is gone.
    async fn idle(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => true,
            changed = self.control.changed() => changed.is_ok(),
        }
    }

    fn fail(&self, reason: String) {
        let _ = self.tx.send(Internal::ReaderFailed {
            subscription: self.subscription.id(),
            reason,
        });
    }
}

/// Read progress in percent.
fn progress(position: TfPos, head: TfPos) -> f32 {
    if head.commit() <= 0 {
        return 100.0;
    }
    ((position.commit() as f32 / head.commit() as f32) * 100.0).min(100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress() {
        assert_eq!(progress(TfPos::new(0, 0), TfPos::new(0, 0)), 100.0);
        assert_eq!(progress(TfPos::new(5, 5), TfPos::new(10, 10)), 50.0);
        assert_eq!(progress(TfPos::new(12, 12), TfPos::new(10, 10)), 100.0);
    }

    #[test]
    fn test_default_options() {
        let options = RuntimeOptions::default();
        assert_eq!(options.read_batch_size, DEFAULT_READ_BATCH_SIZE);
        assert_eq!(options.poll_interval, Duration::from_millis(DEFAULT_POLL_INTERVAL_MS));
    }
}
