use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::decoder::RecordError;

/// One object named by a storage notification record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectReference {
    pub bucket: String,
    pub key: String,
    pub size_bytes: Option<i64>,
    pub region: String,
    pub event_time: DateTime<Utc>,
    pub event_name: Option<String>,
}

impl ObjectReference {
    /// Virtual-hosted S3 address of the object, without credentials.
    pub fn object_url(&self) -> String {
        if self.region.is_empty() {
            format!("https://{}.s3.amazonaws.com/{}", self.bucket, self.key)
        } else {
            format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, self.key
            )
        }
    }

    /// Address handed to the ingestion backend, with the source credential attached.
    pub fn source_uri(&self, source_credentials: &str) -> String {
        let url = self.object_url();
        if source_credentials.is_empty() {
            url
        } else {
            format!("{};AwsCredentials={}", url, source_credentials)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    #[default]
    Json,
    MultiJson,
    Csv,
    Tsv,
    Parquet,
    Avro,
    Orc,
    Txt,
}

impl DataFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataFormat::Json => "json",
            DataFormat::MultiJson => "multijson",
            DataFormat::Csv => "csv",
            DataFormat::Tsv => "tsv",
            DataFormat::Parquet => "parquet",
            DataFormat::Avro => "avro",
            DataFormat::Orc => "orc",
            DataFormat::Txt => "txt",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReportLevel {
    None,
    #[default]
    FailuresOnly,
    FailuresAndSuccesses,
}

impl ReportLevel {
    /// Numeric level understood by the ingestion service.
    pub fn code(&self) -> u8 {
        match self {
            ReportLevel::FailuresOnly => 0,
            ReportLevel::None => 1,
            ReportLevel::FailuresAndSuccesses => 2,
        }
    }
}

/// Destination table, shared read-only by every request in a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestionTarget {
    pub database: String,
    pub table: String,
    #[serde(default)]
    pub format: DataFormat,
    #[serde(default)]
    pub mapping: Option<String>,
}

#[derive(Clone)]
pub struct IngestionRequest {
    pub source_id: Uuid,
    pub source_uri: String,
    pub target: Arc<IngestionTarget>,
    pub flush_immediately: bool,
    pub size_hint: Option<i64>,
    pub delete_source_on_success: bool,
    pub report_level: ReportLevel,
}

impl IngestionRequest {
    /// Source URI with any attached credential replaced by a placeholder.
    pub fn redacted_uri(&self) -> String {
        redact_uri(&self.source_uri)
    }
}

impl fmt::Debug for IngestionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestionRequest")
            .field("source_id", &self.source_id)
            .field("source_uri", &self.redacted_uri())
            .field("target", &self.target)
            .field("flush_immediately", &self.flush_immediately)
            .field("size_hint", &self.size_hint)
            .finish_non_exhaustive()
    }
}

pub fn redact_uri(uri: &str) -> String {
    match uri.split_once(';') {
        Some((base, _)) => format!("{};[REDACTED]", base),
        None => uri.to_string(),
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transient,
    Permanent,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestionOutcome {
    pub reference: ObjectReference,
    pub succeeded: bool,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
    pub attempts: u32,
    pub latency_ms: i64,
    pub source_id: Option<Uuid>,
}

impl IngestionOutcome {
    pub fn success(
        reference: ObjectReference,
        source_id: Uuid,
        attempts: u32,
        latency_ms: i64,
    ) -> Self {
        Self {
            reference,
            succeeded: true,
            error_kind: None,
            error: None,
            attempts,
            latency_ms,
            source_id: Some(source_id),
        }
    }

    pub fn failure(
        reference: ObjectReference,
        kind: ErrorKind,
        error: impl Into<String>,
        source_id: Option<Uuid>,
        attempts: u32,
        latency_ms: i64,
    ) -> Self {
        Self {
            reference,
            succeeded: false,
            error_kind: Some(kind),
            error: Some(error.into()),
            attempts,
            latency_ms,
            source_id,
        }
    }

    /// Outcome for a reference that was never handed to the client.
    pub fn cancelled(reference: ObjectReference) -> Self {
        Self::failure(
            reference,
            ErrorKind::Cancelled,
            "batch cancelled before submission",
            None,
            0,
            0,
        )
    }
}

/// Aggregated result of one notification batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BatchResult {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<IngestionOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RecordError>,
}

impl BatchResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, outcome: IngestionOutcome) {
        if outcome.succeeded {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.outcomes.push(outcome);
    }

    pub fn finalize(mut self) -> Self {
        self.total = self.outcomes.len();
        debug_assert_eq!(self.succeeded + self.failed, self.total);
        self
    }

    pub fn with_rejected(mut self, rejected: Vec<RecordError>) -> Self {
        self.rejected = rejected;
        self
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed == 0 && self.rejected.is_empty()
    }
}
