use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ingest_forwarder::config;
use ingest_forwarder::credentials;
use ingest_forwarder::forwarder::Startup;
use ingest_forwarder::ingest::{HttpIngestClient, IngestClient};
use ingest_forwarder::reporter::{Reporter, TracingSink, WriterSink};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Forward object-created notifications to the ingestion service"
)]
struct Args {
    /// Path to YAML config file; configuration is read from the environment when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the event payload; read from stdin when omitted
    #[arg(long)]
    event: Option<PathBuf>,

    /// Exit with status 2 when any object or record failed
    #[arg(long)]
    fail_on_partial: bool,

    /// Do not print the batch result to stdout
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = match &args.config {
        Some(path) => config::load(Some(path))
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => config::Config::from_env().context("failed to read config from environment")?,
    };

    let mut reporter = Reporter::default().with_sink(TracingSink);
    if !args.quiet {
        reporter = reporter.with_sink(WriterSink::new(std::io::stdout()));
    }

    let startup = Startup::new(
        &cfg,
        credentials::load,
        |cfg, credential| {
            let client: Arc<dyn IngestClient> =
                Arc::new(HttpIngestClient::from_config(cfg, credential)?);
            Ok(client)
        },
        reporter,
    )?;

    let raw = match &args.event {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read event from {}", path.display()))?,
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("failed to read event from stdin")?;
            buf
        }
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling batch");
            on_signal.cancel();
        }
    });

    info!(
        database = %cfg.ingestion.database,
        table = %cfg.ingestion.table,
        "forwarding notification batch"
    );
    let result = startup.run(&raw, &cancel).await;

    match result {
        Ok(batch) if args.fail_on_partial && !batch.is_complete_success() => {
            error!(
                failed = batch.failed,
                rejected = batch.rejected.len(),
                "batch finished with failures"
            );
            Ok(ExitCode::from(2))
        }
        Ok(_) => Ok(ExitCode::SUCCESS),
        Err(err) => Err(err).context("batch aborted"),
    }
}
