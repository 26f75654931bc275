//! Ingestion client seam.
//!
//! `IngestClient` is the only surface the pipeline calls on the ingestion
//! backend. Implementations own one long-lived session and must be safe to
//! share between concurrent submissions; the pipeline adds no locking of its
//! own. Errors come back already classified as transient or permanent.
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::{ErrorKind, IngestionRequest};

pub mod http;

pub use http::HttpIngestClient;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IngestError {
    /// Timeouts, throttling, service unavailability. Worth retrying.
    #[error("transient ingestion failure: {0}")]
    Transient(String),
    /// Bad credentials, unknown table, malformed request. Retrying will not help.
    #[error("permanent ingestion failure: {0}")]
    Permanent(String),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Transient(_) => ErrorKind::Transient,
            IngestError::Permanent(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    /// Accepted by the service; the data lands asynchronously.
    Queued,
    Succeeded,
}

/// Handle returned for an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingIngestion {
    pub source_id: Uuid,
    pub status: IngestionStatus,
}

#[async_trait]
pub trait IngestClient: Send + Sync {
    /// Submit one request. Implementations do not retry.
    async fn submit(&self, request: &IngestionRequest) -> Result<PendingIngestion, IngestError>;

    /// Release the underlying session. Submissions after close fail permanently.
    async fn close(&self) -> Result<(), IngestError> {
        Ok(())
    }
}

/// Run `f` with the shared client and close the client afterwards, whatever `f` returned.
pub async fn with_session<T, F, Fut>(client: Arc<dyn IngestClient>, f: F) -> T
where
    F: FnOnce(Arc<dyn IngestClient>) -> Fut,
    Fut: Future<Output = T>,
{
    let out = f(Arc::clone(&client)).await;
    match client.close().await {
        Ok(()) => debug!("ingestion session closed"),
        Err(err) => warn!(%err, "failed to close ingestion session"),
    }
    out
}
