//! # Reader Subscriptions
//!
//! A [`ReaderSubscription`] sits between a reader (something that pages
//! through the store) and a projection. Readers may redeliver events after a
//! restart or a reissued read; the subscription turns whatever they hand it
//! into a gap-free, duplicate-free sequence of [`SubscriptionMessage`]s.
//!
//! ## Per-Event Pipeline
//!
//! ```text
//!  reader event
//!      │
//!      ▼
//!  source filter ── outside the source ──► dropped
//!      │
//!      ▼
//!  is_message_after_checkpoint_tag ── not newer ──► dropped (redelivery)
//!      │
//!      ▼
//!  make_checkpoint_tag, tracker moves forward
//!      │
//!      ▼
//!  event-type filter ── unhandled ──► count bytes
//!      │ handled
//!      ▼
//!  CommittedEvent ─► (thresholds crossed?) ─► CheckpointSuggested
//! ```
//!
//! ## Sequencing
//!
//! Every message carries the subscription id and a sequence number that
//! grows by one per message. The projection ignores messages of a
//! subscription it has dropped and faults on a gap.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::config::ProjectionConfig;
use crate::tag::{CheckpointTag, TfPos};
use crate::tagger::{
    EventTypeIndexPositionTagger, MultiStreamPositionTagger, PartitionDeleted, PartitionEof, PositionTagger,
    PositionTracker, StreamPositionTagger, TransactionFilePositionTagger,
};
use crate::types::ReceivedEvent;
use crate::Result;

/// Identifies one subscription of one projection run.
pub type SubscriptionId = u64;

// =============================================================================
// Sources
// =============================================================================

/// What a projection reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDefinition {
    /// Every user event in the log. Streams starting with `$` are skipped.
    AllEvents,
    /// One stream.
    Stream(String),
    /// Several streams, tagged by a per-stream position vector.
    Streams(Vec<String>),
    /// User events of the given types.
    EventTypes(Vec<String>),
}

impl SourceDefinition {
    /// The tagger matching this source.
    pub fn tagger(&self, phase: i32) -> Arc<dyn PositionTagger> {
        match self {
            SourceDefinition::AllEvents => Arc::new(TransactionFilePositionTagger::new(phase)),
            SourceDefinition::Stream(stream) => Arc::new(StreamPositionTagger::new(phase, stream.clone())),
            SourceDefinition::Streams(streams) => {
                Arc::new(MultiStreamPositionTagger::new(phase, streams.iter().cloned()))
            }
            SourceDefinition::EventTypes(types) => {
                Arc::new(EventTypeIndexPositionTagger::new(phase, types.iter().cloned()))
            }
        }
    }

    /// Whether `event` belongs to this source.
    pub fn includes(&self, event: &ReceivedEvent) -> bool {
        let stream = event.event_stream_id.as_str();
        match self {
            SourceDefinition::AllEvents => !is_system_stream(stream),
            SourceDefinition::Stream(source) => stream == source,
            SourceDefinition::Streams(sources) => sources.iter().any(|s| s == stream),
            SourceDefinition::EventTypes(types) => {
                !is_system_stream(stream) && types.iter().any(|t| *t == event.event_type)
            }
        }
    }

    /// Whether a deletion of `stream` concerns this source.
    pub fn includes_stream(&self, stream: &str) -> bool {
        match self {
            SourceDefinition::AllEvents | SourceDefinition::EventTypes(_) => !is_system_stream(stream),
            SourceDefinition::Stream(source) => stream == source,
            SourceDefinition::Streams(sources) => sources.iter().any(|s| s == stream),
        }
    }
}

fn is_system_stream(stream: &str) -> bool {
    stream.starts_with('$')
}

// =============================================================================
// Messages
// =============================================================================

/// A message from a subscription to its projection.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionMessage {
    /// Subscription that produced the message.
    pub subscription_id: SubscriptionId,
    /// Position of the message in the subscription's output.
    pub sequence: u64,
    /// Payload.
    pub kind: SubscriptionMessageKind,
}

/// Payload of a [`SubscriptionMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionMessageKind {
    /// A new event to process.
    CommittedEvent {
        /// The event.
        event: ReceivedEvent,
        /// Its tag.
        tag: CheckpointTag,
        /// Reader progress in percent.
        progress: f32,
    },
    /// Enough has been read to make a checkpoint worthwhile.
    CheckpointSuggested {
        /// Position to checkpoint at.
        tag: CheckpointTag,
        /// Reader progress in percent.
        progress: f32,
    },
    /// Reader progress changed without new events.
    Progress {
        /// Current position.
        tag: CheckpointTag,
        /// Reader progress in percent.
        progress: f32,
    },
    /// The reader reached the end of its source and stops.
    Eof {
        /// Position at the end.
        tag: CheckpointTag,
    },
    /// A partition was read to its end.
    PartitionEof {
        /// The partition.
        partition: String,
        /// Position of the notification.
        tag: CheckpointTag,
    },
    /// A partition's source stream was deleted.
    PartitionDeleted {
        /// The partition.
        partition: String,
        /// Position of the deletion.
        tag: CheckpointTag,
    },
    /// The reader may not read its source.
    NotAuthorized {
        /// Position the reader stopped at.
        tag: CheckpointTag,
    },
}

impl SubscriptionMessageKind {
    fn name(&self) -> &'static str {
        match self {
            SubscriptionMessageKind::CommittedEvent { .. } => "CommittedEvent",
            SubscriptionMessageKind::CheckpointSuggested { .. } => "CheckpointSuggested",
            SubscriptionMessageKind::Progress { .. } => "Progress",
            SubscriptionMessageKind::Eof { .. } => "Eof",
            SubscriptionMessageKind::PartitionEof { .. } => "PartitionEof",
            SubscriptionMessageKind::PartitionDeleted { .. } => "PartitionDeleted",
            SubscriptionMessageKind::NotAuthorized { .. } => "NotAuthorized",
        }
    }
}

impl fmt::Display for SubscriptionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} {}", self.subscription_id, self.sequence, self.kind.name())
    }
}

// =============================================================================
// Options
// =============================================================================

/// Thresholds a subscription applies.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionOptions {
    /// Handled events before a checkpoint is suggested; `None` disables suggestions.
    pub checkpoint_handled_threshold: Option<u64>,
    /// Skipped bytes before a checkpoint is suggested; `None` disables suggestions.
    pub checkpoint_unhandled_bytes_threshold: Option<u64>,
    /// Event types the handler processes; `None` handles everything in the source.
    pub handled_event_types: Option<BTreeSet<String>>,
    /// Stop at the end of the source.
    pub stop_on_eof: bool,
}

impl SubscriptionOptions {
    /// Options derived from a projection configuration.
    pub fn from_config(config: &ProjectionConfig) -> Self {
        let enabled = config.checkpoints_enabled;
        Self {
            checkpoint_handled_threshold: enabled.then_some(config.checkpoint_handled_threshold),
            checkpoint_unhandled_bytes_threshold: enabled.then_some(config.checkpoint_unhandled_bytes_threshold),
            handled_event_types: None,
            stop_on_eof: config.stop_on_eof,
        }
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Deduplicates and tags reader output. See the module docs.
#[derive(Debug)]
pub struct ReaderSubscription {
    id: SubscriptionId,
    source: SourceDefinition,
    tagger: Arc<dyn PositionTagger>,
    tracker: PositionTracker,
    options: SubscriptionOptions,
    next_sequence: u64,
    handled_since_checkpoint: u64,
    unhandled_bytes_since_checkpoint: u64,
    eof_reached: bool,
}

impl ReaderSubscription {
    /// Creates a subscription that delivers what comes after `from`.
    pub fn new(
        id: SubscriptionId,
        source: SourceDefinition,
        tagger: Arc<dyn PositionTagger>,
        from: CheckpointTag,
        options: SubscriptionOptions,
    ) -> Result<Self> {
        let mut tracker = PositionTracker::new(tagger.clone());
        tracker.update_by_checkpoint_tag_initial(from)?;
        Ok(Self {
            id,
            source,
            tagger,
            tracker,
            options,
            next_sequence: 0,
            handled_since_checkpoint: 0,
            unhandled_bytes_since_checkpoint: 0,
            eof_reached: false,
        })
    }

    /// Subscription id.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// What the subscription reads.
    pub fn source(&self) -> &SourceDefinition {
        &self.source
    }

    /// Whether the reader should stop at the end of the source.
    pub fn stop_on_eof(&self) -> bool {
        self.options.stop_on_eof
    }

    /// Whether [`handle_eof`](Self::handle_eof) ran.
    pub fn eof_reached(&self) -> bool {
        self.eof_reached
    }

    /// Last tag delivered or skipped over.
    pub fn last_tag(&self) -> CheckpointTag {
        self.tracker
            .last_tag()
            .cloned()
            .unwrap_or_else(|| self.tagger.make_zero_checkpoint_tag())
    }

    /// Log position a global-log reader resumes from.
    ///
    /// Stream-based tags carry no log position, so such readers start at the
    /// beginning and rely on deduplication.
    pub fn read_from(&self) -> TfPos {
        self.tracker
            .last_tag()
            .and_then(CheckpointTag::tf_pos)
            .filter(|pos| *pos > TfPos::ZERO)
            .unwrap_or(TfPos::ZERO)
    }

    /// Runs one reader event through the pipeline.
    pub fn handle_committed_event(&mut self, event: ReceivedEvent, progress: f32) -> Result<Vec<SubscriptionMessage>> {
        if self.eof_reached || !self.source.includes(&event) {
            return Ok(Vec::new());
        }
        let last = self.last_tag();
        if !self.tagger.is_message_after_checkpoint_tag(&last, &event)? {
            trace!(
                subscription = self.id,
                stream = %event.event_stream_id,
                event_number = event.event_number,
                "redelivered event dropped"
            );
            return Ok(Vec::new());
        }
        let tag = self.tagger.make_checkpoint_tag(&last, &event)?;
        self.tracker.update_by_checkpoint_tag_forward(tag.clone())?;

        let mut messages = Vec::new();
        let handled = match &self.options.handled_event_types {
            Some(types) => types.contains(&event.event_type),
            None => true,
        };
        if handled {
            self.handled_since_checkpoint += 1;
            messages.push(self.message(SubscriptionMessageKind::CommittedEvent {
                event,
                tag,
                progress,
            }));
        } else {
            self.unhandled_bytes_since_checkpoint += event.size() as u64;
        }
        self.suggest_checkpoint_if_needed(progress, &mut messages);
        Ok(messages)
    }

    /// The reader has caught up with the end of the source.
    pub fn handle_eof(&mut self) -> Vec<SubscriptionMessage> {
        if self.eof_reached {
            return Vec::new();
        }
        self.eof_reached = true;
        let tag = self.last_tag();
        vec![self.message(SubscriptionMessageKind::Eof { tag })]
    }

    /// A partition was read to its end.
    pub fn handle_partition_eof(&mut self, eof: PartitionEof) -> Result<Vec<SubscriptionMessage>> {
        let tag = self.tagger.make_partition_eof_tag(&self.last_tag(), &eof)?;
        Ok(vec![self.message(SubscriptionMessageKind::PartitionEof {
            partition: eof.partition,
            tag,
        })])
    }

    /// A source stream was deleted.
    pub fn handle_partition_deleted(&mut self, deleted: PartitionDeleted) -> Result<Vec<SubscriptionMessage>> {
        if !self.source.includes_stream(&deleted.partition) {
            return Ok(Vec::new());
        }
        let last = self.last_tag();
        let tag = self.tagger.make_partition_deleted_tag(&last, &deleted)?;
        if !tag.is_after(&last)? {
            return Ok(Vec::new());
        }
        self.tracker.update_by_checkpoint_tag_forward(tag.clone())?;
        Ok(vec![self.message(SubscriptionMessageKind::PartitionDeleted {
            partition: deleted.partition,
            tag,
        })])
    }

    /// The reader was refused access to its source.
    pub fn handle_not_authorized(&mut self) -> Vec<SubscriptionMessage> {
        let tag = self.last_tag();
        vec![self.message(SubscriptionMessageKind::NotAuthorized { tag })]
    }

    /// Reader progress changed.
    pub fn handle_progress(&mut self, progress: f32) -> Vec<SubscriptionMessage> {
        let tag = self.last_tag();
        vec![self.message(SubscriptionMessageKind::Progress { tag, progress })]
    }

    fn suggest_checkpoint_if_needed(&mut self, progress: f32, messages: &mut Vec<SubscriptionMessage>) {
        let handled = self
            .options
            .checkpoint_handled_threshold
            .is_some_and(|t| self.handled_since_checkpoint >= t);
        let unhandled = self
            .options
            .checkpoint_unhandled_bytes_threshold
            .is_some_and(|t| self.unhandled_bytes_since_checkpoint >= t);
        if handled || unhandled {
            self.handled_since_checkpoint = 0;
            self.unhandled_bytes_since_checkpoint = 0;
            let tag = self.last_tag();
            messages.push(self.message(SubscriptionMessageKind::CheckpointSuggested { tag, progress }));
        }
    }

    fn message(&mut self, kind: SubscriptionMessageKind) -> SubscriptionMessage {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        SubscriptionMessage {
            subscription_id: self.id,
            sequence,
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(stream: &str, number: i64, global: i64, event_type: &str) -> ReceivedEvent {
        ReceivedEvent::new(stream, number, TfPos::new(global, global), event_type, "{}")
    }

    fn options() -> SubscriptionOptions {
        SubscriptionOptions {
            checkpoint_handled_threshold: Some(2),
            checkpoint_unhandled_bytes_threshold: Some(1000),
            handled_event_types: None,
            stop_on_eof: false,
        }
    }

    fn all_events(from: CheckpointTag, options: SubscriptionOptions) -> ReaderSubscription {
        let source = SourceDefinition::AllEvents;
        ReaderSubscription::new(1, source.clone(), source.tagger(0), from, options).unwrap()
    }

    fn kinds(messages: &[SubscriptionMessage]) -> Vec<&'static str> {
        messages.iter().map(|m| m.kind.name()).collect()
    }

    #[test]
    fn test_redelivered_events_are_dropped() {
        let mut sub = all_events(CheckpointTag::from_position(0, 5, 5), options());
        assert!(sub.handle_committed_event(event("a", 0, 5, "E"), 0.0).unwrap().is_empty());
        let out = sub.handle_committed_event(event("a", 1, 6, "E"), 0.0).unwrap();
        assert_eq!(kinds(&out), vec!["CommittedEvent"]);
        assert!(sub.handle_committed_event(event("a", 1, 6, "E"), 0.0).unwrap().is_empty());
        assert_eq!(sub.last_tag(), CheckpointTag::from_position(0, 6, 6));
        assert_eq!(sub.read_from(), TfPos::new(6, 6));
    }

    #[test]
    fn test_system_streams_are_outside_all_events() {
        let mut sub = all_events(CheckpointTag::from_position(0, 0, -1), options());
        assert!(sub
            .handle_committed_event(event("$projections-p-result", 0, 1, "Result"), 0.0)
            .unwrap()
            .is_empty());
        assert_eq!(sub.last_tag(), CheckpointTag::from_position(0, 0, -1));
    }

    #[test]
    fn test_sequence_numbers_grow_by_one() {
        let mut sub = all_events(CheckpointTag::from_position(0, 0, -1), options());
        let mut messages = Vec::new();
        for n in 0..3 {
            messages.extend(sub.handle_committed_event(event("a", n, n + 1, "E"), 0.0).unwrap());
        }
        messages.extend(sub.handle_eof());
        let sequences: Vec<u64> = messages.iter().map(|m| m.sequence).collect();
        assert_eq!(sequences, (0..messages.len() as u64).collect::<Vec<_>>());
        assert!(messages.iter().all(|m| m.subscription_id == 1));
    }

    #[test]
    fn test_handled_threshold_suggests_checkpoint() {
        let mut sub = all_events(CheckpointTag::from_position(0, 0, -1), options());
        let first = sub.handle_committed_event(event("a", 0, 1, "E"), 10.0).unwrap();
        assert_eq!(kinds(&first), vec!["CommittedEvent"]);
        let second = sub.handle_committed_event(event("a", 1, 2, "E"), 20.0).unwrap();
        assert_eq!(kinds(&second), vec!["CommittedEvent", "CheckpointSuggested"]);
        let SubscriptionMessageKind::CheckpointSuggested { tag, progress } = &second[1].kind else {
            panic!("expected a suggestion");
        };
        assert_eq!(*tag, CheckpointTag::from_position(0, 2, 2));
        assert_eq!(*progress, 20.0);
    }

    #[test]
    fn test_unhandled_bytes_suggest_checkpoint() {
        let mut opts = options();
        opts.handled_event_types = Some(["Wanted".to_string()].into_iter().collect());
        opts.checkpoint_unhandled_bytes_threshold = Some(4);
        let mut sub = all_events(CheckpointTag::from_position(0, 0, -1), opts);
        let out = sub.handle_committed_event(event("a", 0, 1, "Other"), 0.0).unwrap();
        assert_eq!(kinds(&out), vec!["CheckpointSuggested"]);
    }

    #[test]
    fn test_disabled_thresholds_never_suggest() {
        let config = ProjectionConfig::default().with_checkpoints_enabled(false);
        let mut sub = all_events(
            CheckpointTag::from_position(0, 0, -1),
            SubscriptionOptions::from_config(&config),
        );
        for n in 0..5 {
            let out = sub.handle_committed_event(event("a", n, n + 1, "E"), 0.0).unwrap();
            assert_eq!(kinds(&out), vec!["CommittedEvent"]);
        }
    }

    #[test]
    fn test_stream_source_filters_other_streams() {
        let source = SourceDefinition::Stream("orders".to_string());
        let tagger = source.tagger(0);
        let zero = tagger.make_zero_checkpoint_tag();
        let mut sub = ReaderSubscription::new(7, source, tagger, zero, options()).unwrap();
        assert!(sub.handle_committed_event(event("other", 0, 1, "E"), 0.0).unwrap().is_empty());
        let out = sub.handle_committed_event(event("orders", 0, 2, "E"), 0.0).unwrap();
        let SubscriptionMessageKind::CommittedEvent { tag, .. } = &out[0].kind else {
            panic!("expected an event");
        };
        assert_eq!(tag.stream_sequence("orders"), Some(0));
        assert_eq!(sub.read_from(), TfPos::ZERO);
    }

    #[test]
    fn test_event_type_source() {
        let source = SourceDefinition::EventTypes(vec!["A".to_string()]);
        let tagger = source.tagger(0);
        let zero = tagger.make_zero_checkpoint_tag();
        let mut sub = ReaderSubscription::new(2, source, tagger, zero, options()).unwrap();
        assert!(sub.handle_committed_event(event("s", 0, 1, "B"), 0.0).unwrap().is_empty());
        let out = sub.handle_committed_event(event("s", 1, 2, "A"), 0.0).unwrap();
        assert_eq!(kinds(&out), vec!["CommittedEvent"]);
    }

    #[test]
    fn test_eof_is_reported_once() {
        let mut sub = all_events(CheckpointTag::from_position(0, 0, -1), options());
        assert_eq!(kinds(&sub.handle_eof()), vec!["Eof"]);
        assert!(sub.handle_eof().is_empty());
        assert!(sub.eof_reached());
        assert!(sub.handle_committed_event(event("a", 0, 1, "E"), 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_partition_deleted_after_current_position() {
        let mut sub = all_events(CheckpointTag::from_position(0, 5, 5), options());
        let deleted = |global| PartitionDeleted {
            partition: "a".to_string(),
            position: Some(TfPos::new(global, global)),
            position_stream_id: None,
            position_event_number: None,
            pre_tagged: None,
        };
        assert!(sub.handle_partition_deleted(deleted(3)).unwrap().is_empty());
        let out = sub.handle_partition_deleted(deleted(9)).unwrap();
        assert_eq!(kinds(&out), vec!["PartitionDeleted"]);
    }
}
