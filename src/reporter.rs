//! Batch result aggregation and emission.
use std::io::Write;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::decoder::RecordError;
use crate::model::{BatchResult, IngestionOutcome};

/// Destination for finished batch results.
pub trait ReportSink: Send + Sync {
    fn name(&self) -> &'static str;

    fn emit(&self, result: &BatchResult) -> anyhow::Result<()>;
}

/// Logs a batch summary, plus one warning per failed reference.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ReportSink for TracingSink {
    fn name(&self) -> &'static str {
        "tracing"
    }

    fn emit(&self, result: &BatchResult) -> anyhow::Result<()> {
        for outcome in result.outcomes.iter().filter(|o| !o.succeeded) {
            warn!(
                bucket = %outcome.reference.bucket,
                key = %outcome.reference.key,
                kind = outcome.error_kind.map(|k| k.as_str()).unwrap_or("unknown"),
                attempts = outcome.attempts,
                error = outcome.error.as_deref().unwrap_or_default(),
                "object not ingested"
            );
        }
        for rejected in &result.rejected {
            warn!(%rejected, "notification record rejected");
        }
        info!(
            total = result.total,
            succeeded = result.succeeded,
            failed = result.failed,
            rejected = result.rejected.len(),
            "batch forwarded"
        );
        Ok(())
    }
}

/// Writes each batch result as one JSON line.
pub struct WriterSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<W: Write + Send> ReportSink for WriterSink<W> {
    fn name(&self) -> &'static str {
        "writer"
    }

    fn emit(&self, result: &BatchResult) -> anyhow::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow::anyhow!("writer sink poisoned"))?;
        serde_json::to_writer(&mut *writer, result)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Build a finalized result from worker outcomes, restoring input order.
pub fn aggregate(mut indexed: Vec<(usize, IngestionOutcome)>) -> BatchResult {
    indexed.sort_by_key(|(index, _)| *index);
    let mut result = BatchResult::new();
    for (_, outcome) in indexed {
        result.push(outcome);
    }
    result.finalize()
}

#[derive(Default)]
pub struct Reporter {
    sinks: Vec<Box<dyn ReportSink>>,
}

impl Reporter {
    pub fn new(sinks: Vec<Box<dyn ReportSink>>) -> Self {
        Self { sinks }
    }

    pub fn with_sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Aggregate outcomes and record rejects into a batch result, then emit it. Never fails.
    pub fn report(
        &self,
        indexed: Vec<(usize, IngestionOutcome)>,
        rejected: Vec<RecordError>,
    ) -> BatchResult {
        let result = aggregate(indexed).with_rejected(rejected);
        self.emit(&result);
        result
    }

    /// Hand a finished result to every sink; a failing sink is skipped.
    pub fn emit(&self, result: &BatchResult) {
        for sink in &self.sinks {
            if let Err(err) = sink.emit(result) {
                debug!(sink = sink.name(), ?err, "report sink unavailable");
            }
        }
    }
}
