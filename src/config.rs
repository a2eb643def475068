//! # Projection Configuration
//!
//! Knobs of one projection. Every field has a `DEFAULT_*` constant and a
//! `with_*` builder so callers only spell out what they change:
//!
//! ```rust
//! use std::time::Duration;
//! use spitedb_projections::ProjectionConfig;
//!
//! let config = ProjectionConfig::default()
//!     .with_checkpoint_handled_threshold(100)
//!     .with_backoff_unit(Duration::from_millis(50));
//! assert_eq!(config.checkpoint_handled_threshold, 100);
//! ```

use std::time::Duration;

use crate::checkpoint::CheckpointSettings;
use crate::partition_cache::DEFAULT_MAX_CACHED_PARTITIONS;

// =============================================================================
// Defaults
// =============================================================================

/// Handled events between suggested checkpoints.
pub const DEFAULT_CHECKPOINT_HANDLED_THRESHOLD: u64 = 4000;

/// Bytes of skipped events between suggested checkpoints.
pub const DEFAULT_CHECKPOINT_UNHANDLED_BYTES_THRESHOLD: u64 = 10 * 1000 * 1000;

/// Buffered work items above which the reader is paused.
///
/// Reading resumes once the buffer drains below half of this.
pub const DEFAULT_PENDING_EVENTS_THRESHOLD: usize = 5000;

/// Maximum events per emitted-stream write.
pub const DEFAULT_MAX_WRITE_BATCH_LENGTH: usize = 500;

/// Queue steps run per tick.
pub const DEFAULT_PROCESS_BATCH_SIZE: usize = 30;

/// Retries after the first failed write.
pub const DEFAULT_MAX_WRITE_RETRIES: u32 = 12;

/// Backoff time unit in milliseconds.
pub const DEFAULT_BACKOFF_UNIT_MS: u64 = 1000;

/// Store read timeout in milliseconds.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 10_000;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration of one projection.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionConfig {
    /// Persist checkpoints and partition states.
    pub checkpoints_enabled: bool,

    /// Handled events after which the reader suggests a checkpoint.
    pub checkpoint_handled_threshold: u64,

    /// Skipped bytes after which the reader suggests a checkpoint.
    pub checkpoint_unhandled_bytes_threshold: u64,

    /// Buffered work items above which reading pauses.
    pub pending_events_threshold: usize,

    /// Maximum events per emitted-stream write.
    pub max_write_batch_length: usize,

    /// Partition states kept in memory.
    pub max_cached_partitions: usize,

    /// Allow the handler to emit events.
    pub emit_events_enabled: bool,

    /// Write `Result` events to result streams.
    pub output_running_results: bool,

    /// Write `$partition` events for new partitions.
    pub emit_partition_catalog: bool,

    /// Stop (completed) at the end of the log instead of waiting for more.
    pub stop_on_eof: bool,

    /// Queue steps run per tick.
    pub process_batch_size: usize,

    /// Retries after the first failed write.
    pub max_write_retries: u32,

    /// Backoff time unit.
    pub backoff_unit: Duration,

    /// Store read timeout. Only the runtime applies it.
    pub read_timeout: Duration,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            checkpoints_enabled: true,
            checkpoint_handled_threshold: DEFAULT_CHECKPOINT_HANDLED_THRESHOLD,
            checkpoint_unhandled_bytes_threshold: DEFAULT_CHECKPOINT_UNHANDLED_BYTES_THRESHOLD,
            pending_events_threshold: DEFAULT_PENDING_EVENTS_THRESHOLD,
            max_write_batch_length: DEFAULT_MAX_WRITE_BATCH_LENGTH,
            max_cached_partitions: DEFAULT_MAX_CACHED_PARTITIONS,
            emit_events_enabled: false,
            output_running_results: false,
            emit_partition_catalog: false,
            stop_on_eof: false,
            process_batch_size: DEFAULT_PROCESS_BATCH_SIZE,
            max_write_retries: DEFAULT_MAX_WRITE_RETRIES,
            backoff_unit: Duration::from_millis(DEFAULT_BACKOFF_UNIT_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
        }
    }
}

impl ProjectionConfig {
    /// Sets [`checkpoints_enabled`](Self::checkpoints_enabled).
    pub fn with_checkpoints_enabled(mut self, enabled: bool) -> Self {
        self.checkpoints_enabled = enabled;
        self
    }

    /// Sets [`checkpoint_handled_threshold`](Self::checkpoint_handled_threshold).
    pub fn with_checkpoint_handled_threshold(mut self, threshold: u64) -> Self {
        self.checkpoint_handled_threshold = threshold;
        self
    }

    /// Sets [`checkpoint_unhandled_bytes_threshold`](Self::checkpoint_unhandled_bytes_threshold).
    pub fn with_checkpoint_unhandled_bytes_threshold(mut self, threshold: u64) -> Self {
        self.checkpoint_unhandled_bytes_threshold = threshold;
        self
    }

    /// Sets [`pending_events_threshold`](Self::pending_events_threshold).
    pub fn with_pending_events_threshold(mut self, threshold: usize) -> Self {
        self.pending_events_threshold = threshold;
        self
    }

    /// Sets [`max_write_batch_length`](Self::max_write_batch_length).
    pub fn with_max_write_batch_length(mut self, length: usize) -> Self {
        self.max_write_batch_length = length;
        self
    }

    /// Sets [`max_cached_partitions`](Self::max_cached_partitions).
    pub fn with_max_cached_partitions(mut self, max: usize) -> Self {
        self.max_cached_partitions = max;
        self
    }

    /// Sets [`emit_events_enabled`](Self::emit_events_enabled).
    pub fn with_emit_events_enabled(mut self, enabled: bool) -> Self {
        self.emit_events_enabled = enabled;
        self
    }

    /// Sets [`output_running_results`](Self::output_running_results).
    pub fn with_output_running_results(mut self, enabled: bool) -> Self {
        self.output_running_results = enabled;
        self
    }

    /// Sets [`emit_partition_catalog`](Self::emit_partition_catalog).
    pub fn with_emit_partition_catalog(mut self, enabled: bool) -> Self {
        self.emit_partition_catalog = enabled;
        self
    }

    /// Sets [`stop_on_eof`](Self::stop_on_eof).
    pub fn with_stop_on_eof(mut self, stop: bool) -> Self {
        self.stop_on_eof = stop;
        self
    }

    /// Sets [`process_batch_size`](Self::process_batch_size).
    pub fn with_process_batch_size(mut self, size: usize) -> Self {
        self.process_batch_size = size;
        self
    }

    /// Sets [`max_write_retries`](Self::max_write_retries).
    pub fn with_max_write_retries(mut self, retries: u32) -> Self {
        self.max_write_retries = retries;
        self
    }

    /// Sets [`backoff_unit`](Self::backoff_unit).
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Sets [`read_timeout`](Self::read_timeout).
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// The part of the configuration the checkpoint manager uses.
    pub fn checkpoint_settings(&self) -> CheckpointSettings {
        CheckpointSettings {
            checkpoints_enabled: self.checkpoints_enabled,
            max_write_batch_length: self.max_write_batch_length,
            max_write_retries: self.max_write_retries,
            backoff_unit: self.backoff_unit,
        }
    }

    /// Reading resumes below this many buffered items.
    pub fn resume_threshold(&self) -> usize {
        self.pending_events_threshold / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProjectionConfig::default();
        assert!(config.checkpoints_enabled);
        assert_eq!(config.checkpoint_handled_threshold, 4000);
        assert_eq!(config.pending_events_threshold, 5000);
        assert_eq!(config.resume_threshold(), 2500);
        assert_eq!(config.max_cached_partitions, 4000);
        assert_eq!(config.backoff_unit, Duration::from_secs(1));
        assert!(!config.stop_on_eof);
    }

    #[test]
    fn test_checkpoint_settings_follow_builders() {
        let config = ProjectionConfig::default()
            .with_checkpoints_enabled(false)
            .with_max_write_batch_length(7)
            .with_max_write_retries(2)
            .with_backoff_unit(Duration::from_millis(3));
        let settings = config.checkpoint_settings();
        assert!(!settings.checkpoints_enabled);
        assert_eq!(settings.max_write_batch_length, 7);
        assert_eq!(settings.max_write_retries, 2);
        assert_eq!(settings.backoff_unit, Duration::from_millis(3));
    }
}
