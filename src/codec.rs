//! # Checkpoint Record Codec
//!
//! Checkpoint tags are persisted as the JSON metadata of checkpoint events and
//! of every event a projection emits. The format has to stay readable across
//! upgrades, so this module owns both directions of the mapping.
//!
//! ## Record Layout
//!
//! ```text
//! {
//!   "$v":  "projectionId:epoch:version:systemVersion",   only when projectionId > 0
//!   "$ph": 1,                                             only when phase != 0
//!   "$cp": true,                                          Phase
//!   "$c":  1200, "$p": 1150,                              Position / EventTypeIndex
//!   "$p":  1150,                                          PreparePosition
//!   "$s":  {"stream-a": 4, "stream-b": -1},               Stream / MultiStream / EventTypeIndex
//!   "$m":  "bs", "$c": 1200, "$s": [{"cat": 3}, {"d": 7}] ByStream
//!   ...                                                   anything else: extra metadata
//! }
//! ```
//!
//! Unknown keys are preserved as extra metadata and written back verbatim, so
//! correlation ids and other annotations survive a decode/encode cycle.
//!
//! ## Legacy Input
//!
//! The decoder also accepts `v`, `c`, `p`, `s`, `commitPosition`,
//! `preparePosition` and `streams`, and infers the mode when no discriminator
//! is present (see [`decode_checkpoint_tag`]).

use serde_json::{Map, Value};

use crate::tag::{ByStreamPosition, CheckpointTag, TagPosition, TfPos};
use crate::tagger::PositionTagger;
use crate::types::ProjectionVersion;
use crate::{Error, Result};

/// Version of the checkpoint record format written by this crate.
pub const SYSTEM_VERSION: i32 = 4;

/// Mode marker of a `ByStream` record.
const BY_STREAM_MARKER: &str = "bs";

// =============================================================================
// Decoded Record
// =============================================================================

/// A decoded checkpoint record: the tag plus who wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointTagVersion {
    /// The position.
    pub tag: CheckpointTag,
    /// Projection id, epoch and version of the writer.
    pub version: ProjectionVersion,
    /// Record format version of the writer.
    pub system_version: i32,
    /// Keys this codec does not interpret.
    pub extra: Map<String, Value>,
}

impl CheckpointTagVersion {
    /// Returns the tag in the representation `tagger` expects.
    ///
    /// A record written by the same projection definition in the current
    /// format is used as is when `tagger` can track it. Anything else goes
    /// through [`PositionTagger::adjust_tag`].
    pub fn adjust_by(&self, tagger: &dyn PositionTagger, current: &ProjectionVersion) -> Result<CheckpointTag> {
        if self.system_version == SYSTEM_VERSION
            && self.version.version == current.version
            && self.version.projection_id == current.projection_id
            && tagger.is_compatible(&self.tag)
        {
            return Ok(self.tag.clone());
        }
        tagger.adjust_tag(&self.tag)
    }

    /// `$correlationId` extra, if present.
    pub fn correlation_id(&self) -> Option<&str> {
        self.extra.get("$correlationId").and_then(Value::as_str)
    }
}

// =============================================================================
// Encoding
// =============================================================================

/// Encodes a tag as a checkpoint record.
///
/// `version` is written as `$v` only when its projection id is positive.
pub fn encode_checkpoint_tag(
    tag: &CheckpointTag,
    version: Option<&ProjectionVersion>,
    extra: &Map<String, Value>,
) -> Result<String> {
    let mut record = Map::new();

    if let Some(v) = version.filter(|v| v.projection_id > 0) {
        record.insert(
            "$v".to_string(),
            Value::String(format!(
                "{}:{}:{}:{}",
                v.projection_id, v.epoch, v.version, SYSTEM_VERSION
            )),
        );
    }
    if tag.phase() != 0 {
        record.insert("$ph".to_string(), Value::from(tag.phase()));
    }

    match tag.position() {
        TagPosition::Phase { completed } => {
            record.insert("$cp".to_string(), Value::Bool(*completed));
        }
        TagPosition::Position(pos) => {
            record.insert("$c".to_string(), Value::from(pos.commit()));
            record.insert("$p".to_string(), Value::from(pos.prepare()));
        }
        TagPosition::PreparePosition(prepare) => {
            record.insert("$p".to_string(), Value::from(*prepare));
        }
        TagPosition::Stream { stream, sequence } => {
            let mut streams = Map::new();
            streams.insert(stream.clone(), Value::from(*sequence));
            record.insert("$s".to_string(), Value::Object(streams));
        }
        TagPosition::MultiStream(streams) => {
            record.insert("$s".to_string(), streams_to_json(streams.iter()));
        }
        TagPosition::EventTypeIndex { position, streams } => {
            record.insert("$c".to_string(), Value::from(position.commit()));
            record.insert("$p".to_string(), Value::from(position.prepare()));
            record.insert("$s".to_string(), streams_to_json(streams.iter()));
        }
        TagPosition::ByStream(p) => {
            record.insert("$m".to_string(), Value::String(BY_STREAM_MARKER.to_string()));
            record.insert("$c".to_string(), Value::from(p.commit_position));
            let mut parts = vec![single_entry(&p.catalog_stream, p.catalog_position)];
            if let Some(data) = &p.data_stream {
                parts.push(single_entry(data, p.data_position));
            }
            record.insert("$s".to_string(), Value::Array(parts));
        }
    }

    for (key, value) in extra {
        if !record.contains_key(key) {
            record.insert(key.clone(), value.clone());
        }
    }

    Ok(serde_json::to_string(&Value::Object(record))?)
}

fn streams_to_json<'a>(streams: impl Iterator<Item = (&'a String, &'a i64)>) -> Value {
    Value::Object(
        streams
            .map(|(stream, sequence)| (stream.clone(), Value::from(*sequence)))
            .collect(),
    )
}

fn single_entry(stream: &str, position: i64) -> Value {
    let mut entry = Map::new();
    entry.insert(stream.to_string(), Value::from(position));
    Value::Object(entry)
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes a checkpoint record.
///
/// `current` supplies the projection id when the record carries no `$v`.
///
/// # Mode Inference
///
/// - `$m: "bs"` → `ByStream`
/// - `$cp` present → `Phase`
/// - streams with `$c` → `EventTypeIndex`; one stream → `Stream`; more → `MultiStream`
/// - `$c`/`$p` both `i64::MIN` → `Phase` (not completed); both `i64::MAX` → `Phase` (completed)
/// - only `$p`, or `$c` at `i64::MIN` → `PreparePosition`
/// - `$c` and `$p` → `Position`
pub fn decode_checkpoint_tag(text: &str, current: &ProjectionVersion) -> Result<CheckpointTagVersion> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Object(object) = value else {
        return Err(Error::CheckpointFormat(format!("expected a JSON object, found '{}'", text)));
    };

    let mut version = ProjectionVersion {
        projection_id: current.projection_id,
        epoch: 0,
        version: 0,
    };
    let mut system_version = 0;
    let mut phase = 0i32;
    let mut completed = None;
    let mut commit = None;
    let mut prepare = None;
    let mut streams = None;
    let mut marker = None;
    let mut extra = Map::new();

    for (key, value) in object {
        match key.as_str() {
            "$v" | "v" => {
                let (v, s) = parse_version(&value, current)?;
                version = v;
                system_version = s;
            }
            "$ph" => {
                let raw = as_i64(&key, &value)?;
                phase = i32::try_from(raw)
                    .map_err(|_| Error::CheckpointFormat(format!("'$ph' is out of range: {}", raw)))?;
            }
            "$cp" => {
                completed = Some(value.as_bool().ok_or_else(|| {
                    Error::CheckpointFormat(format!("'$cp' must be a boolean, found {}", value))
                })?)
            }
            "$c" | "c" | "commitPosition" => commit = Some(as_i64(&key, &value)?),
            "$p" | "p" | "preparePosition" => prepare = Some(as_i64(&key, &value)?),
            "$s" | "s" | "streams" => streams = Some(value),
            "$m" => marker = value.as_str().map(str::to_string),
            _ => {
                extra.insert(key, value);
            }
        }
    }

    let tag = if marker.as_deref() == Some(BY_STREAM_MARKER) {
        decode_by_stream(phase, commit, streams)?
    } else if let Some(completed) = completed {
        CheckpointTag::from_phase(phase, completed)
    } else if let Some(streams) = streams {
        let map = parse_stream_map(&streams)?;
        match commit {
            Some(c) => CheckpointTag::from_event_type_index_positions(
                phase,
                TfPos::new(c, prepare.unwrap_or(-1)),
                map,
            )?,
            None if map.len() == 1 => {
                let (stream, sequence) = map.into_iter().next().ok_or_else(|| {
                    Error::CheckpointFormat("empty stream map".to_string())
                })?;
                CheckpointTag::from_stream_position(phase, stream, sequence)?
            }
            None => CheckpointTag::from_stream_positions(phase, map)?,
        }
    } else {
        match (commit, prepare) {
            (Some(i64::MIN), Some(i64::MIN)) => CheckpointTag::from_phase(phase, false),
            (Some(i64::MAX), Some(i64::MAX)) => CheckpointTag::from_phase(phase, true),
            (None, Some(p)) | (Some(i64::MIN), Some(p)) => CheckpointTag::from_prepare_position(phase, p),
            (Some(c), Some(p)) => CheckpointTag::from_position(phase, c, p),
            _ => {
                return Err(Error::CheckpointFormat(format!(
                    "no position found in checkpoint record '{}'",
                    text
                )))
            }
        }
    };

    Ok(CheckpointTagVersion {
        tag,
        version,
        system_version,
        extra,
    })
}

fn as_i64(key: &str, value: &Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| Error::CheckpointFormat(format!("'{}' must be an integer, found {}", key, value)))
}

/// `$v` forms: "version", "version:system", "id:epoch:version", "id:epoch:version:system".
fn parse_version(value: &Value, current: &ProjectionVersion) -> Result<(ProjectionVersion, i32)> {
    if let Some(v) = value.as_i64() {
        return Ok((
            ProjectionVersion {
                projection_id: current.projection_id,
                epoch: 0,
                version: v,
            },
            0,
        ));
    }
    let text = value
        .as_str()
        .ok_or_else(|| Error::CheckpointFormat(format!("'$v' must be a string, found {}", value)))?;
    let parts = text
        .split(':')
        .map(|p| {
            p.parse::<i64>()
                .map_err(|_| Error::CheckpointFormat(format!("invalid version '{}'", text)))
        })
        .collect::<Result<Vec<i64>>>()?;

    let with_current = |epoch, version| ProjectionVersion {
        projection_id: current.projection_id,
        epoch,
        version,
    };
    Ok(match parts.as_slice() {
        [version] => (with_current(0, *version), 0),
        [version, system] => (with_current(0, *version), *system as i32),
        [id, epoch, version] => (
            ProjectionVersion {
                projection_id: *id,
                epoch: *epoch,
                version: *version,
            },
            0,
        ),
        [id, epoch, version, system] => (
            ProjectionVersion {
                projection_id: *id,
                epoch: *epoch,
                version: *version,
            },
            *system as i32,
        ),
        _ => return Err(Error::CheckpointFormat(format!("invalid version '{}'", text))),
    })
}

fn parse_stream_map(value: &Value) -> Result<Vec<(String, i64)>> {
    let object = value
        .as_object()
        .ok_or_else(|| Error::CheckpointFormat(format!("'$s' must be an object, found {}", value)))?;
    object
        .iter()
        .map(|(stream, seq)| Ok((stream.clone(), as_i64(stream, seq)?)))
        .collect()
}

fn decode_by_stream(phase: i32, commit: Option<i64>, streams: Option<Value>) -> Result<CheckpointTag> {
    let parts = match streams {
        Some(Value::Array(parts)) => parts,
        other => {
            return Err(Error::CheckpointFormat(format!(
                "by-stream record needs a '$s' array, found {:?}",
                other
            )))
        }
    };
    let mut entries = parts.iter().map(parse_stream_map);
    let (catalog_stream, catalog_position) = match entries.next() {
        Some(entry) => entry?
            .into_iter()
            .next()
            .ok_or_else(|| Error::CheckpointFormat("empty catalog entry".to_string()))?,
        None => return Err(Error::CheckpointFormat("missing catalog entry".to_string())),
    };
    let (data_stream, data_position) = match entries.next() {
        Some(entry) => {
            let (stream, position) = entry?
                .into_iter()
                .next()
                .ok_or_else(|| Error::CheckpointFormat("empty data entry".to_string()))?;
            (Some(stream), position)
        }
        None => (None, -1),
    };
    CheckpointTag::from_by_stream_position(
        phase,
        ByStreamPosition {
            catalog_stream,
            catalog_position,
            data_stream,
            data_position,
            commit_position: commit.unwrap_or(-1),
        },
    )
}

// =============================================================================
// Tests
// =============================================================================
