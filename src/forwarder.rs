//! Entry point for one notification batch.
//!
//! A batch moves through `Idle -> Decoding -> Forwarding -> Reporting -> Idle`.
//! Only an unreadable envelope stops a batch; failures of individual records
//! or submissions end up in the returned `BatchResult`.
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::{Config, ConfigError, CredentialSource};
use crate::credentials::Credential;
use crate::decoder::{self, DecodeError};
use crate::ingest::{self, IngestClient};
use crate::model::BatchResult;
use crate::pipeline::{Pipeline, PipelineOptions};
use crate::reporter::Reporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    Idle,
    Decoding,
    Forwarding,
    Reporting,
}

impl ForwarderState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ForwarderState::Idle => "idle",
            ForwarderState::Decoding => "decoding",
            ForwarderState::Forwarding => "forwarding",
            ForwarderState::Reporting => "reporting",
        }
    }
}

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("cannot decode notification payload: {0}")]
    Decode(#[from] DecodeError),
}

pub struct Forwarder {
    pipeline: Pipeline,
    reporter: Reporter,
    deadline: Option<Duration>,
    state: watch::Sender<ForwarderState>,
}

impl Forwarder {
    pub fn new(pipeline: Pipeline, reporter: Reporter, deadline: Option<Duration>) -> Self {
        let (state, _) = watch::channel(ForwarderState::Idle);
        Self {
            pipeline,
            reporter,
            deadline,
            state,
        }
    }

    /// Wire a forwarder from validated configuration and a shared client.
    pub fn from_config(
        cfg: &Config,
        credential: &Credential,
        client: Arc<dyn IngestClient>,
        reporter: Reporter,
    ) -> Self {
        let pipeline = Pipeline::new(
            client,
            cfg.target(),
            credential.source_credentials.clone(),
            PipelineOptions::from_config(cfg),
        );
        Self::new(pipeline, reporter, cfg.deadline())
    }

    pub fn state(&self) -> ForwarderState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ForwarderState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ForwarderState) {
        let prev = self.state.send_replace(next);
        debug!(from = prev.as_str(), to = next.as_str(), "forwarder state");
    }

    /// Decode a raw event payload, forward every object it names and report the outcome.
    #[instrument(skip_all, fields(bytes = raw.len()))]
    pub async fn handle(
        &self,
        raw: &[u8],
        cancel: &CancellationToken,
    ) -> Result<BatchResult, ForwardError> {
        self.transition(ForwarderState::Decoding);
        let decoded = match decoder::decode(raw) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.transition(ForwarderState::Idle);
                return Err(err.into());
            }
        };

        self.transition(ForwarderState::Forwarding);
        let batch = cancel.child_token();
        let timer = self.deadline.map(|deadline| {
            let batch = batch.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                info!(?deadline, "batch deadline reached; cancelling");
                batch.cancel();
            })
        });
        let indexed = self.pipeline.submit_all(decoded.references, &batch).await;
        if let Some(timer) = timer {
            timer.abort();
        }

        self.transition(ForwarderState::Reporting);
        let result = self.reporter.report(indexed, decoded.errors);
        self.transition(ForwarderState::Idle);
        Ok(result)
    }
}

/// A forwarder wired to the client it submits through.
pub struct Startup {
    pub forwarder: Forwarder,
    pub client: Arc<dyn IngestClient>,
}

impl Startup {
    /// Resolve credentials, then connect the client, then wire the forwarder.
    ///
    /// A credential failure returns before `connect` runs, so nothing is submitted.
    pub fn new<L, C>(
        cfg: &Config,
        load_credential: L,
        connect: C,
        reporter: Reporter,
    ) -> Result<Self, ConfigError>
    where
        L: FnOnce(&CredentialSource) -> Result<Credential, ConfigError>,
        C: FnOnce(&Config, Arc<Credential>) -> Result<Arc<dyn IngestClient>, ConfigError>,
    {
        let credential = Arc::new(load_credential(&cfg.credentials)?);
        let client = connect(cfg, Arc::clone(&credential))?;
        let forwarder = Forwarder::from_config(cfg, &credential, Arc::clone(&client), reporter);
        Ok(Self { forwarder, client })
    }

    /// Handle one payload inside a session; the client is closed afterwards.
    pub async fn run(
        self,
        raw: &[u8],
        cancel: &CancellationToken,
    ) -> Result<BatchResult, ForwardError> {
        let Startup { forwarder, client } = self;
        ingest::with_session(client, |_client| async move {
            forwarder.handle(raw, cancel).await
        })
        .await
    }
}
