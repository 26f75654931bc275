//! Decoder for object-storage event envelopes.
//!
//! The envelope format belongs to the event source, so decoding is permissive:
//! unknown fields are ignored and a malformed record only rejects that record.
//! The whole payload fails only when the envelope itself cannot be read.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::model::ObjectReference;

const TEST_EVENT: &str = "s3:TestEvent";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no `Records` array")]
    MissingRecords,
}

/// A single notification record that could not be turned into a reference.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum RecordError {
    #[error("record {index}: missing required field `{field}`")]
    MissingField { index: usize, field: String },
    #[error("record {index}: invalid field `{field}`: {reason}")]
    InvalidField {
        index: usize,
        field: String,
        reason: String,
    },
}

impl RecordError {
    pub fn index(&self) -> usize {
        match self {
            RecordError::MissingField { index, .. } | RecordError::InvalidField { index, .. } => {
                *index
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Decoded {
    pub references: Vec<ObjectReference>,
    pub errors: Vec<RecordError>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    #[serde(rename = "awsRegion")]
    aws_region: Option<String>,
    #[serde(rename = "eventTime")]
    event_time: Option<String>,
    #[serde(rename = "eventName")]
    event_name: Option<String>,
    s3: Option<RawS3>,
}

#[derive(Debug, Deserialize)]
struct RawS3 {
    bucket: Option<RawBucket>,
    object: Option<RawObject>,
}

#[derive(Debug, Deserialize)]
struct RawBucket {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawObject {
    key: Option<String>,
    size: Option<Value>,
}

#[instrument(skip_all, fields(bytes = raw.len()))]
pub fn decode(raw: &[u8]) -> Result<Decoded, DecodeError> {
    if raw.iter().all(u8::is_ascii_whitespace) {
        debug!("empty payload");
        return Ok(Decoded::default());
    }

    let envelope: Value = serde_json::from_slice(raw)?;
    let Value::Object(mut envelope) = envelope else {
        return Err(DecodeError::NotAnObject);
    };

    if envelope.get("Event").and_then(Value::as_str) == Some(TEST_EVENT) {
        debug!("ignoring storage test event");
        return Ok(Decoded::default());
    }

    let records = match envelope
        .remove("Records")
        .or_else(|| envelope.remove("records"))
    {
        Some(Value::Array(records)) => records,
        _ => return Err(DecodeError::MissingRecords),
    };

    let decode_time = Utc::now();
    let mut decoded = Decoded::default();
    for (index, record) in records.into_iter().enumerate() {
        match decode_record(index, record, decode_time) {
            Ok(reference) => decoded.references.push(reference),
            Err(err) => {
                warn!(%err, "skipping malformed notification record");
                decoded.errors.push(err);
            }
        }
    }
    debug!(
        references = decoded.references.len(),
        rejected = decoded.errors.len(),
        "decoded notification payload"
    );
    Ok(decoded)
}

fn decode_record(
    index: usize,
    record: Value,
    decode_time: DateTime<Utc>,
) -> Result<ObjectReference, RecordError> {
    let raw: RawRecord = serde_json::from_value(record).map_err(|e| RecordError::InvalidField {
        index,
        field: "record".into(),
        reason: e.to_string(),
    })?;

    let missing = |field: &str| RecordError::MissingField {
        index,
        field: field.into(),
    };

    let s3 = raw.s3.ok_or_else(|| missing("s3"))?;
    let bucket = s3
        .bucket
        .and_then(|b| b.name)
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| missing("s3.bucket.name"))?;
    let object = s3.object.ok_or_else(|| missing("s3.object.key"))?;
    let key = object
        .key
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| missing("s3.object.key"))?;

    let size_bytes = match object.size {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            value
                .as_i64()
                .filter(|size| *size >= 0)
                .ok_or_else(|| RecordError::InvalidField {
                    index,
                    field: "s3.object.size".into(),
                    reason: format!("expected a non-negative integer, got {}", value),
                })?,
        ),
    };

    let event_time = match raw.event_time {
        None => decode_time,
        Some(ts) => DateTime::parse_from_rfc3339(&ts)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| RecordError::InvalidField {
                index,
                field: "eventTime".into(),
                reason: e.to_string(),
            })?,
    };

    Ok(ObjectReference {
        bucket,
        key,
        size_bytes,
        region: raw.aws_region.unwrap_or_default(),
        event_time,
        event_name: raw.event_name,
    })
}
