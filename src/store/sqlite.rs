//! # SQLite Event Store
//!
//! A durable [`EventStore`] on a single SQLite file.
//!
//! ## Table Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  events                                  deleted_streams     │
//! │  ┌───────────────────────────┐           ┌───────────────┐   │
//! │  │ global_pos (PK, autoinc)  │           │ stream_id (PK)│   │
//! │  │ stream_id                 │           └───────────────┘   │
//! │  │ event_number              │                               │
//! │  │ event_type, data, metadata│           store_metadata      │
//! │  │ is_json                   │           ┌───────────────┐   │
//! │  └───────────────────────────┘           │ key, value    │   │
//! │   UNIQUE (stream_id, event_number)       └───────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! `global_pos` doubles as both halves of the log position, so the commit
//! and prepare offsets of an event are equal.
//!
//! ## Concurrency
//!
//! The connection sits behind a `Mutex`. Each write runs in a transaction
//! that checks the expected version and appends, so a conflicting writer
//! observes `WrongExpectedVersion` instead of a constraint violation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{AllSlice, EventStore, ExpectedVersion, NewEvent, ReadResult, RecordedEvent, StreamSlice, WriteResult};
use crate::tag::{TfPos, NO_STREAM};
use crate::{Error, Result};

/// Current schema version. Opening a file with another version fails.
const SCHEMA_VERSION: i32 = 1;

/// Every event, keyed by its global log position.
const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    global_pos   INTEGER PRIMARY KEY AUTOINCREMENT,
    stream_id    TEXT NOT NULL,
    event_number INTEGER NOT NULL,
    event_type   TEXT NOT NULL,
    data         TEXT NOT NULL,
    metadata     TEXT NOT NULL,
    is_json      INTEGER NOT NULL,
    UNIQUE (stream_id, event_number)
)
"#;

/// Streams that have been deleted.
const CREATE_DELETED_STREAMS: &str = r#"
CREATE TABLE IF NOT EXISTS deleted_streams (
    stream_id TEXT PRIMARY KEY
)
"#;

/// Key/value metadata, currently only the schema version.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS store_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

const SELECT_COLUMNS: &str =
    "SELECT global_pos, stream_id, event_number, event_type, data, metadata, is_json FROM events";

/// Event store backed by SQLite.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (and if needed creates) a store file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Opens a store that lives only as long as this value.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        conn.execute_batch(CREATE_METADATA)?;
        conn.execute_batch(CREATE_EVENTS)?;
        conn.execute_batch(CREATE_DELETED_STREAMS)?;
        verify_or_set_version(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("sqlite connection lock poisoned".to_string()))
    }
}

fn verify_or_set_version(conn: &Connection) -> Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT value FROM store_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match existing {
        None => {
            conn.execute(
                "INSERT INTO store_metadata (key, value) VALUES ('schema_version', ?)",
                [SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(v) if v == SCHEMA_VERSION.to_string() => {}
        Some(v) => {
            return Err(Error::Schema(format!(
                "schema version mismatch: file has version {v}, this build requires {SCHEMA_VERSION}"
            )));
        }
    }
    Ok(())
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<RecordedEvent> {
    let global_pos: i64 = row.get(0)?;
    Ok(RecordedEvent {
        stream_id: row.get(1)?,
        event_number: row.get(2)?,
        event_type: row.get(3)?,
        data: row.get(4)?,
        metadata: row.get(5)?,
        is_json: row.get::<_, i64>(6)? != 0,
        position: TfPos::new(global_pos, global_pos),
    })
}

fn is_deleted(conn: &Connection, stream: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM deleted_streams WHERE stream_id = ?",
        [stream],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn last_event_number(conn: &Connection, stream: &str) -> Result<i64> {
    let last: Option<i64> = conn.query_row(
        "SELECT MAX(event_number) FROM events WHERE stream_id = ?",
        [stream],
        |row| row.get(0),
    )?;
    Ok(last.unwrap_or(NO_STREAM))
}

impl EventStore for SqliteStore {
    fn read_stream_backward(&self, stream: &str, from_event_number: i64, max_count: usize) -> Result<ReadResult> {
        let conn = self.lock()?;
        if is_deleted(&conn, stream)? {
            return Ok(ReadResult::StreamDeleted);
        }
        let last = last_event_number(&conn, stream)?;
        if last == NO_STREAM {
            return Ok(ReadResult::NoStream);
        }
        let start = if from_event_number < 0 || from_event_number > last {
            last
        } else {
            from_event_number
        };
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE stream_id = ? AND event_number <= ? ORDER BY event_number DESC LIMIT ?"
        ))?;
        let events = stmt
            .query_map(params![stream, start, max_count as i64], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let next = events.last().map(|e| e.event_number - 1).unwrap_or(NO_STREAM);
        Ok(ReadResult::Success(StreamSlice {
            events,
            next_event_number: next,
            last_event_number: last,
            is_end_of_stream: next < 0,
        }))
    }

    fn read_stream_forward(&self, stream: &str, from_event_number: i64, max_count: usize) -> Result<ReadResult> {
        let conn = self.lock()?;
        if is_deleted(&conn, stream)? {
            return Ok(ReadResult::StreamDeleted);
        }
        let last = last_event_number(&conn, stream)?;
        if last == NO_STREAM {
            return Ok(ReadResult::NoStream);
        }
        let from = from_event_number.max(0);
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE stream_id = ? AND event_number >= ? ORDER BY event_number LIMIT ?"
        ))?;
        let events = stmt
            .query_map(params![stream, from, max_count as i64], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let next = events.last().map(|e| e.event_number + 1).unwrap_or(from);
        Ok(ReadResult::Success(StreamSlice {
            events,
            next_event_number: next,
            last_event_number: last,
            is_end_of_stream: next > last,
        }))
    }

    fn read_all_forward(&self, from: TfPos, max_count: usize) -> Result<AllSlice> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} WHERE global_pos >= ? ORDER BY global_pos LIMIT ?"
        ))?;
        let events = stmt
            .query_map(params![from.commit(), max_count as i64], row_to_event)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let max_pos: Option<i64> = conn.query_row("SELECT MAX(global_pos) FROM events", [], |row| row.get(0))?;
        let head_pos = max_pos.unwrap_or(0) + 1;
        let next_position = match events.last() {
            Some(e) => TfPos::new(e.position.commit() + 1, e.position.commit() + 1),
            None => from,
        };
        Ok(AllSlice {
            is_end: next_position.commit() >= head_pos,
            events,
            next_position,
            head: TfPos::new(head_pos, head_pos),
        })
    }

    fn write_events(&self, stream: &str, expected: ExpectedVersion, events: Vec<NewEvent>) -> Result<WriteResult> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        if is_deleted(&tx, stream)? {
            return Ok(WriteResult::StreamDeleted);
        }
        let current = last_event_number(&tx, stream)?;
        if !expected.matches(current) {
            return Ok(WriteResult::WrongExpectedVersion {
                current_version: current,
            });
        }
        let first_event_number = current + 1;
        for (offset, event) in events.iter().enumerate() {
            tx.execute(
                "INSERT INTO events (stream_id, event_number, event_type, data, metadata, is_json)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    stream,
                    first_event_number + offset as i64,
                    event.event_type,
                    event.data,
                    event.metadata,
                    event.is_json as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(WriteResult::Success { first_event_number })
    }

    fn delete_stream(&self, stream: &str) -> Result<()> {
        self.lock()?.execute(
            "INSERT OR IGNORE INTO deleted_streams (stream_id) VALUES (?)",
            [stream],
        )?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
