//! # Error Handling for SpiteDB Projections
//!
//! This module defines the error type used throughout the projection engine.
//! A single error enum ([`Error`]) represents every failure mode, which keeps
//! function signatures simple and lets the orchestrator funnel all fatal
//! conditions through one "set faulted" transition.
//!
//! ## Errors vs. Outcomes
//!
//! Not every failure is an `Error`. The store collaborator reports transient
//! timeouts, optimistic-concurrency conflicts and access denial as *outcomes*
//! ([`crate::store::WriteResult`], [`crate::store::ReadResult`]). Those drive
//! retry, restart or stop decisions locally and never surface as `Err`.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Ordering | Non-monotonic event tag, stale checkpoint | Fault the projection |
//! | Position model | Incomparable tags, unsupported conversion | Fault, operator fixes definition |
//! | Reconciliation | Re-emitted event differs from durable history | Fault, never "fix" silently |
//! | Misuse | Relocking a partition, reading unlocked state | Fault (programming error) |
//! | Internal | SQLite error, malformed checkpoint record | Log and investigate |

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur inside the projection engine.
///
/// # Rust Pattern: Enum Variants
///
/// Each variant is one failure mode. The `#[error(...)]` attribute is the
/// human-readable reason that ends up in the `Faulted` status of a projection.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Ordering Errors (fatal, never retried)
    // =========================================================================

    /// An event, checkpoint or emitted event arrived out of order.
    ///
    /// # When This Happens
    ///
    /// - `EventProcessed` called with a tag that is not strictly after the last one
    /// - A work item enqueued with a tag before the last enqueued tag
    /// - An emitted event group caused by a tag at or before the last queued group
    /// - A checkpoint requested at or before the start of the current checkpoint
    ///
    /// This is an integration bug: something upstream reordered messages.
    #[error("ordering violation: {0}")]
    OrderingViolation(String),

    // =========================================================================
    // Position Model Errors (fatal, surfaced to the operator)
    // =========================================================================

    /// Two checkpoint tags cannot be ordered.
    ///
    /// # When This Happens
    ///
    /// - The tags use unrelated modes (e.g. `Stream` vs `EventTypeIndex`)
    /// - Two `Stream` tags name different streams
    /// - Two `MultiStream` tags have diverged: each is ahead on some stream
    ///
    /// The last case is concurrent-update detection. It must never be resolved
    /// with a tie-break.
    #[error("incomparable checkpoint tags: '{left}' and '{right}'")]
    IncomparableTags {
        /// Display form of the left-hand tag
        left: String,
        /// Display form of the right-hand tag
        right: String,
    },

    /// A persisted tag cannot be converted into the mode the current reader uses.
    ///
    /// # Recovery
    ///
    /// The checkpoint is structurally incompatible with the current projection
    /// definition. Reset the projection or restore the previous definition.
    #[error("Conversion from {from} to {to} position tag is not supported")]
    UnsupportedConversion {
        /// Mode of the persisted tag
        from: String,
        /// Mode the tagger expects
        to: String,
    },

    /// A tag was handed to a component that cannot work with it.
    #[error("incompatible checkpoint tag '{tag}': {reason}")]
    IncompatibleTag {
        /// Display form of the offending tag
        tag: String,
        /// What was expected instead
        reason: String,
    },

    /// A reader delivered an event that does not belong to the tagger's sources.
    ///
    /// This is a programming error in the reader wiring, not a runtime condition.
    #[error("misrouted event: {0}")]
    Misrouted(String),

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================

    /// An event re-emitted during recovery differs from what is durably recorded.
    #[error("{0}")]
    InvalidEmittedEventSequence(String),

    // =========================================================================
    // Partition Cache Misuse
    // =========================================================================

    /// A partition was locked again at or before the tag it is already locked at.
    #[error("Attempt to relock the '{partition}' partition state locked at the '{locked_at}' position at the earlier position '{requested}'")]
    PartitionRelock {
        /// Partition name
        partition: String,
        /// Current lock tag
        locked_at: String,
        /// Requested lock tag
        requested: String,
    },

    /// Locked state was requested for a partition that is not (or no longer) locked.
    #[error("partition '{partition}' is not locked: {reason}")]
    PartitionNotLocked {
        /// Partition name
        partition: String,
        /// Why the lookup failed
        reason: String,
    },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================

    /// An operation was invoked in a lifecycle state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The state handler failed to process an event.
    #[error("{0}")]
    Handler(String),

    /// The runtime task owning the projection is gone.
    #[error("projection runtime has shut down")]
    RuntimeClosed,

    // =========================================================================
    // Internal Errors (investigate and fix)
    // =========================================================================

    /// A persisted checkpoint record could not be interpreted.
    #[error("invalid checkpoint record: {0}")]
    CheckpointFormat(String),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The database schema is incompatible with this build.
    #[error("schema error: {0}")]
    Schema(String),

    /// SQLite operation failed.
    ///
    /// # Rust Pattern: #[from]
    ///
    /// The `#[from]` attribute generates `impl From<rusqlite::Error> for Error`,
    /// so the `?` operator converts store errors automatically.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The store failed in a way that is neither a timeout nor a conflict.
    #[error("store error: {0}")]
    Store(String),
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let incomparable = Error::IncomparableTags {
            left: "a: 0; b: -1; ".to_string(),
            right: "a: -1; b: 0; ".to_string(),
        };
        assert_eq!(
            incomparable.to_string(),
            "incomparable checkpoint tags: 'a: 0; b: -1; ' and 'a: -1; b: 0; '"
        );

        let conversion = Error::UnsupportedConversion {
            from: "EventTypeIndex".to_string(),
            to: "Stream".to_string(),
        };
        assert_eq!(
            conversion.to_string(),
            "Conversion from EventTypeIndex to Stream position tag is not supported"
        );

        let ordering = Error::OrderingViolation("tag went backwards".to_string());
        assert_eq!(ordering.to_string(), "ordering violation: tag went backwards");
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();
        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let our_err: Error = json_err.into();
        assert!(matches!(our_err, Error::Json(_)));
    }
}
