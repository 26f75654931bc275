//! Forwarding pipeline: one ingestion request per object reference.
//!
//! Submissions run concurrently up to a fixed limit. Each worker yields
//! `(index, outcome)` and the collector restores input order, so the batch
//! result does not depend on which submission finished first.
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::ingest::IngestClient;
use crate::model::{
    BatchResult, ErrorKind, IngestionOutcome, IngestionRequest, IngestionTarget, ObjectReference,
    ReportLevel,
};
use crate::reporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOptions {
    pub concurrency_limit: usize,
    pub retry: RetryPolicy,
    pub flush_immediately: bool,
    pub report_level: ReportLevel,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: 8,
            retry: RetryPolicy::default(),
            flush_immediately: true,
            report_level: ReportLevel::FailuresOnly,
        }
    }
}

impl PipelineOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            concurrency_limit: cfg.pipeline.concurrency_limit.max(1),
            retry: RetryPolicy {
                max_retries: cfg.pipeline.max_retries,
                base_backoff: Duration::from_millis(cfg.pipeline.base_backoff_ms),
                max_backoff: Duration::from_millis(cfg.pipeline.max_backoff_ms),
            },
            flush_immediately: cfg.ingestion.flush_immediately,
            report_level: cfg.ingestion.report_level,
        }
    }
}

pub struct Pipeline {
    client: Arc<dyn IngestClient>,
    target: Arc<IngestionTarget>,
    source_credentials: String,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        client: Arc<dyn IngestClient>,
        target: IngestionTarget,
        source_credentials: impl Into<String>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            client,
            target: Arc::new(target),
            source_credentials: source_credentials.into(),
            options,
        }
    }

    /// Forward every reference and return the ordered batch result.
    pub async fn forward(
        &self,
        references: Vec<ObjectReference>,
        cancel: &CancellationToken,
    ) -> BatchResult {
        reporter::aggregate(self.submit_all(references, cancel).await)
    }

    /// Submit every reference, returning outcomes tagged with their input position.
    ///
    /// Exactly one outcome is produced per reference, including on cancellation.
    #[instrument(skip_all, fields(references = references.len(), table = %self.target.table))]
    pub async fn submit_all(
        &self,
        references: Vec<ObjectReference>,
        cancel: &CancellationToken,
    ) -> Vec<(usize, IngestionOutcome)> {
        if references.is_empty() {
            return Vec::new();
        }
        let limit = self.options.concurrency_limit.max(1);
        debug!(limit, "dispatching ingestion requests");

        stream::iter(references.into_iter().enumerate())
            .map(|(index, reference)| async move {
                (index, self.forward_one(reference, cancel).await)
            })
            .buffer_unordered(limit)
            .collect()
            .await
    }

    pub fn build_request(&self, reference: &ObjectReference) -> IngestionRequest {
        IngestionRequest {
            source_id: Uuid::new_v4(),
            source_uri: reference.source_uri(&self.source_credentials),
            target: Arc::clone(&self.target),
            flush_immediately: self.options.flush_immediately,
            size_hint: reference.size_bytes,
            delete_source_on_success: false,
            report_level: self.options.report_level,
        }
    }

    async fn forward_one(
        &self,
        reference: ObjectReference,
        cancel: &CancellationToken,
    ) -> IngestionOutcome {
        if cancel.is_cancelled() {
            return IngestionOutcome::cancelled(reference);
        }

        let request = self.build_request(&reference);
        let uri = request.redacted_uri();
        let retry = self.options.retry;
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                res = self.client.submit(&request) => Some(res),
            };
            let elapsed = elapsed_ms(started);

            let err = match result {
                None => {
                    warn!(%uri, attempts, "ingestion abandoned on cancellation");
                    return IngestionOutcome::failure(
                        reference,
                        ErrorKind::Cancelled,
                        "batch cancelled during submission",
                        Some(request.source_id),
                        attempts,
                        elapsed,
                    );
                }
                Some(Ok(pending)) => {
                    info!(
                        %uri,
                        source_id = %pending.source_id,
                        status = ?pending.status,
                        attempts,
                        latency_ms = elapsed,
                        "ingestion submitted"
                    );
                    return IngestionOutcome::success(reference, pending.source_id, attempts, elapsed);
                }
                Some(Err(err)) => err,
            };

            let retries_used = attempts - 1;
            if !err.is_transient() || retries_used >= retry.max_retries {
                warn!(?err, %uri, attempts, "ingestion failed");
                return IngestionOutcome::failure(
                    reference,
                    err.kind(),
                    err.to_string(),
                    Some(request.source_id),
                    attempts,
                    elapsed,
                );
            }

            let delay = retry.backoff(attempts);
            warn!(?err, %uri, attempt = attempts, ?delay, "transient ingestion failure; backoff");
            let cancelled = tokio::select! {
                biased;
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(delay) => false,
            };
            if cancelled {
                return IngestionOutcome::failure(
                    reference,
                    ErrorKind::Cancelled,
                    format!("batch cancelled while retrying after: {}", err),
                    Some(request.source_id),
                    attempts,
                    elapsed_ms(started),
                );
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}
