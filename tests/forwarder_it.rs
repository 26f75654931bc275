use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ingest_forwarder::config;
use ingest_forwarder::credentials;
use ingest_forwarder::forwarder::{Forwarder, Startup};
use ingest_forwarder::ingest::{
    with_session, IngestClient, IngestError, IngestionStatus, PendingIngestion,
};
use ingest_forwarder::model::{BatchResult, ErrorKind, IngestionRequest};
use ingest_forwarder::pipeline::{Pipeline, PipelineOptions, RetryPolicy};
use ingest_forwarder::reporter::{Reporter, WriterSink};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct SubmitCall {
    source_uri: String,
    size_hint: Option<i64>,
    flush_immediately: bool,
}

/// Records every submission and replays scripted responses per object key.
#[derive(Clone, Default)]
struct RecordingIngest {
    responses: Arc<Mutex<Vec<(String, VecDeque<Result<(), IngestError>>)>>>,
    calls: Arc<Mutex<Vec<SubmitCall>>>,
    closed: Arc<Mutex<bool>>,
    delay: Duration,
}

impl RecordingIngest {
    fn with_responses(key: &str, responses: Vec<Result<(), IngestError>>) -> Self {
        let client = Self::default();
        client
            .responses
            .try_lock()
            .unwrap()
            .push((key.to_string(), VecDeque::from(responses)));
        client
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    async fn pop_response(&self, uri: &str) -> Result<(), IngestError> {
        let mut guard = self.responses.lock().await;
        for (key, queue) in guard.iter_mut() {
            if uri.contains(&format!("/{};", key)) || uri.ends_with(&format!("/{}", key)) {
                return queue.pop_front().unwrap_or(Ok(()));
            }
        }
        Ok(())
    }

    async fn calls(&self) -> Vec<SubmitCall> {
        self.calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl IngestClient for RecordingIngest {
    async fn submit(&self, request: &IngestionRequest) -> Result<PendingIngestion, IngestError> {
        self.calls.lock().await.push(SubmitCall {
            source_uri: request.source_uri.clone(),
            size_hint: request.size_hint,
            flush_immediately: request.flush_immediately,
        });
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.pop_response(&request.source_uri).await?;
        Ok(PendingIngestion {
            source_id: request.source_id,
            status: IngestionStatus::Queued,
        })
    }

    async fn close(&self) -> Result<(), IngestError> {
        *self.closed.lock().await = true;
        Ok(())
    }
}

fn record(bucket: &str, key: &str, size: Option<i64>) -> Value {
    let mut object = json!({ "key": key, "eTag": "0123456789abcdef" });
    if let Some(size) = size {
        object["size"] = json!(size);
    }
    json!({
        "eventVersion": "2.1",
        "eventSource": "aws:s3",
        "awsRegion": "eu-central-1",
        "eventTime": "2024-05-01T08:30:00.000Z",
        "eventName": "ObjectCreated:Put",
        "userIdentity": { "principalId": "AWS:EXAMPLE" },
        "s3": {
            "bucket": { "name": bucket },
            "object": object
        }
    })
}

fn payload(records: Vec<Value>) -> Vec<u8> {
    serde_json::to_vec(&json!({ "Records": records })).unwrap()
}

fn forwarder_with(client: RecordingIngest, options: PipelineOptions) -> Forwarder {
    let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
    let pipeline = Pipeline::new(Arc::new(client), cfg.target(), "AKID;SECRET", options);
    Forwarder::new(pipeline, Reporter::default(), None)
}

fn quick_retries(max_retries: u32) -> PipelineOptions {
    PipelineOptions {
        retry: RetryPolicy {
            max_retries,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
        },
        ..Default::default()
    }
}

fn keys(result: &BatchResult) -> Vec<String> {
    result
        .outcomes
        .iter()
        .map(|o| o.reference.key.clone())
        .collect()
}

#[tokio::test]
async fn forwards_every_record_in_order() {
    let client = RecordingIngest::default();
    let forwarder = forwarder_with(client.clone(), PipelineOptions::default());
    let raw = payload(
        (0..12)
            .map(|i| record("b1", &format!("k{i}"), Some(i * 10)))
            .collect(),
    );

    let result = forwarder.handle(&raw, &CancellationToken::new()).await.unwrap();

    assert_eq!(result.total, 12);
    assert_eq!(result.succeeded, 12);
    assert_eq!(result.failed, 0);
    assert_eq!(result.succeeded + result.failed, result.outcomes.len());
    let expected: Vec<_> = (0..12).map(|i| format!("k{i}")).collect();
    assert_eq!(keys(&result), expected);

    let calls = client.calls().await;
    assert_eq!(calls.len(), 12);
    assert!(calls.iter().all(|c| c.flush_immediately));
    assert!(calls.iter().any(|c| c.source_uri
        == "https://b1.s3.eu-central-1.amazonaws.com/k3;AwsCredentials=AKID;SECRET"
        && c.size_hint == Some(30)));
}

#[tokio::test]
async fn malformed_records_do_not_affect_siblings() {
    let client = RecordingIngest::default();
    let forwarder = forwarder_with(client.clone(), PipelineOptions::default());
    let mut missing_key = record("b1", "ignored", Some(1));
    missing_key["s3"]["object"] = json!({ "size": 1 });
    let raw = payload(vec![
        record("b1", "k1", Some(1)),
        missing_key,
        json!({ "s3": "garbage" }),
        record("b1", "k4", Some(1)),
    ]);

    let result = forwarder.handle(&raw, &CancellationToken::new()).await.unwrap();

    assert_eq!(result.total, 2);
    assert_eq!(result.succeeded, 2);
    assert_eq!(keys(&result), vec!["k1", "k4"]);
    assert_eq!(result.rejected.len(), 2);
    assert_eq!(result.rejected[0].index(), 1);
    assert_eq!(result.rejected[1].index(), 2);
    assert_eq!(client.calls().await.len(), 2);
}

#[tokio::test]
async fn record_without_size_is_still_forwarded() {
    let client = RecordingIngest::default();
    let forwarder = forwarder_with(client.clone(), PipelineOptions::default());
    let raw = payload(vec![record("b1", "k1", Some(100)), record("b1", "bad", None)]);

    let result = forwarder.handle(&raw, &CancellationToken::new()).await.unwrap();

    assert_eq!(result.total, 2);
    assert!(result.outcomes.iter().all(|o| o.succeeded));
    let calls = client.calls().await;
    let sizes: Vec<_> = calls.iter().map(|c| c.size_hint).collect();
    assert!(sizes.contains(&Some(100)));
    assert!(sizes.contains(&None));
}

#[tokio::test]
async fn duplicate_notifications_are_forwarded_twice() {
    let client = RecordingIngest::default();
    let forwarder = forwarder_with(client.clone(), PipelineOptions::default());
    let raw = payload(vec![record("b1", "k1", Some(5)), record("b1", "k1", Some(5))]);

    let result = forwarder.handle(&raw, &CancellationToken::new()).await.unwrap();

    assert_eq!(result.total, 2);
    assert_eq!(result.succeeded, 2);
    assert_ne!(result.outcomes[0].source_id, result.outcomes[1].source_id);
    assert_eq!(client.calls().await.len(), 2);
}

#[tokio::test]
async fn empty_payload_never_calls_the_client() {
    let client = RecordingIngest::default();
    let forwarder = forwarder_with(client.clone(), PipelineOptions::default());

    let result = forwarder
        .handle(&payload(vec![]), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result, BatchResult::new());
    assert!(client.calls().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn result_content_does_not_depend_on_concurrency() {
    let raw = payload(
        (0..20)
            .map(|i| record("b1", &format!("k{i}"), Some(i)))
            .collect(),
    );

    let mut results = Vec::new();
    for limit in [1usize, 8] {
        let client = RecordingIngest::with_responses(
            "k7",
            vec![Err(IngestError::Permanent("unknown table".into()))],
        );
        let client = RecordingIngest {
            delay: Duration::from_millis(5),
            ..client
        };
        let options = PipelineOptions {
            concurrency_limit: limit,
            ..Default::default()
        };
        let forwarder = forwarder_with(client, options);
        results.push(forwarder.handle(&raw, &CancellationToken::new()).await.unwrap());
    }

    let strip = |r: &BatchResult| -> Vec<(String, bool, Option<ErrorKind>, u32)> {
        r.outcomes
            .iter()
            .map(|o| (o.reference.key.clone(), o.succeeded, o.error_kind, o.attempts))
            .collect()
    };
    assert_eq!(strip(&results[0]), strip(&results[1]));
    assert_eq!(results[0].failed, 1);
    assert_eq!(results[1].total, 20);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_then_success_within_budget() {
    let client = RecordingIngest::with_responses(
        "k1",
        vec![
            Err(IngestError::Transient("throttled".into())),
            Err(IngestError::Transient("timeout".into())),
            Ok(()),
        ],
    );
    let forwarder = forwarder_with(client.clone(), quick_retries(3));
    let raw = payload(vec![record("b1", "k1", Some(1)), record("b1", "k2", Some(2))]);

    let result = forwarder.handle(&raw, &CancellationToken::new()).await.unwrap();

    let first = &result.outcomes[0];
    assert!(first.succeeded);
    assert_eq!(first.attempts, 3);
    assert!(first.latency_ms >= 300, "latency {}", first.latency_ms);
    assert_eq!(result.outcomes[1].attempts, 1);
    assert_eq!(client.calls().await.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn deadline_cancels_outstanding_references() {
    let client = RecordingIngest::slow(Duration::from_secs(5));
    let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
    let options = PipelineOptions {
        concurrency_limit: 1,
        ..Default::default()
    };
    let pipeline = Pipeline::new(Arc::new(client.clone()), cfg.target(), "", options);
    let forwarder = Forwarder::new(pipeline, Reporter::default(), Some(Duration::from_secs(7)));
    let raw = payload((0..4).map(|i| record("b1", &format!("k{i}"), None)).collect());

    let result = forwarder.handle(&raw, &CancellationToken::new()).await.unwrap();

    assert_eq!(result.total, 4);
    assert!(result.outcomes[0].succeeded);
    let kinds: Vec<_> = result.outcomes.iter().map(|o| o.error_kind).collect();
    assert_eq!(
        kinds,
        vec![
            None,
            Some(ErrorKind::Cancelled),
            Some(ErrorKind::Cancelled),
            Some(ErrorKind::Cancelled)
        ]
    );
    // k1 was in flight when the deadline hit; k2 and k3 were never submitted.
    assert_eq!(client.calls().await.len(), 2);
    assert_eq!(result.outcomes[1].attempts, 1);
    assert_eq!(result.outcomes[3].attempts, 0);
}

#[tokio::test]
async fn session_closes_client_after_batch() {
    let client = RecordingIngest::default();
    let shared: Arc<dyn IngestClient> = Arc::new(client.clone());
    let forwarder = forwarder_with(client.clone(), PipelineOptions::default());
    let raw = payload(vec![record("b1", "k1", None)]);

    let result = with_session(shared, |_c| async {
        forwarder.handle(&raw, &CancellationToken::new()).await
    })
    .await
    .unwrap();

    assert_eq!(result.succeeded, 1);
    assert!(*client.closed.lock().await);
}

/// Writer whose bytes stay readable after the sink that owns it is moved away.
#[derive(Clone, Default)]
struct SharedBuf(Arc<std::sync::Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn emitted_report_lists_rejected_records() {
    let out = SharedBuf::default();
    let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
    let pipeline = Pipeline::new(
        Arc::new(RecordingIngest::default()),
        cfg.target(),
        "",
        PipelineOptions::default(),
    );
    let reporter = Reporter::default().with_sink(WriterSink::new(out.clone()));
    let forwarder = Forwarder::new(pipeline, reporter, None);
    let mut missing_key = record("b1", "ignored", Some(1));
    missing_key["s3"]["object"] = json!({ "size": 1 });
    let raw = payload(vec![record("b1", "k1", Some(1)), missing_key]);

    let result = forwarder.handle(&raw, &CancellationToken::new()).await.unwrap();

    let written = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
    assert_eq!(written.lines().count(), 1);
    let emitted: BatchResult = serde_json::from_str(written.trim()).unwrap();
    assert_eq!(emitted.rejected.len(), 1);
    assert_eq!(emitted.rejected[0].index(), 1);
    assert_eq!(emitted, result);
}

fn lookup_without_app_key(name: &str) -> Option<String> {
    match name {
        "AppId" => Some("app".to_string()),
        "AppTenant" => Some("tenant".to_string()),
        "AwsCredentials" => Some("A;B".to_string()),
        _ => None,
    }
}

#[tokio::test]
async fn missing_credential_stops_before_forwarding() {
    let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
    let client = RecordingIngest::default();
    let connected = AtomicBool::new(false);

    let err = Startup::new(
        &cfg,
        |_source| credentials::from_lookup(lookup_without_app_key),
        |_cfg, _credential| {
            connected.store(true, Ordering::SeqCst);
            let shared: Arc<dyn IngestClient> = Arc::new(client.clone());
            Ok(shared)
        },
        Reporter::default(),
    )
    .err()
    .unwrap();

    assert!(matches!(
        err,
        config::ConfigError::MissingCredential("AppKey")
    ));
    assert!(!connected.load(Ordering::SeqCst));
    assert!(client.calls().await.is_empty());
    assert!(!*client.closed.lock().await);
}

#[tokio::test]
async fn startup_runs_batch_in_a_session() {
    let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
    let client = RecordingIngest::default();
    let lookup = |name: &str| lookup_without_app_key(name).or_else(|| Some("key".to_string()));

    let startup = Startup::new(
        &cfg,
        |_source| credentials::from_lookup(lookup),
        |_cfg, _credential| {
            let shared: Arc<dyn IngestClient> = Arc::new(client.clone());
            Ok(shared)
        },
        Reporter::default(),
    )
    .unwrap();
    let raw = payload(vec![record("b1", "k1", Some(3))]);
    let result = startup.run(&raw, &CancellationToken::new()).await.unwrap();

    assert_eq!(result.succeeded, 1);
    let calls = client.calls().await;
    assert_eq!(calls.len(), 1);
    assert!(calls[0].source_uri.ends_with("/k1;AwsCredentials=A;B"));
    assert!(*client.closed.lock().await);
}
