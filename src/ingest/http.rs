use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{IngestClient, IngestError, IngestionStatus, PendingIngestion};
use crate::config::{Config, ConfigError};
use crate::credentials::Credential;
use crate::model::IngestionRequest;

const CLIENT_NAME: &str = "ingest-forwarder";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Ingestion facade over the service's REST endpoint.
///
/// One instance is built per process and shared by every submission; the
/// underlying `reqwest::Client` pools connections and the bearer token is
/// cached until shortly before it expires.
pub struct HttpIngestClient {
    http: Client,
    endpoint: Url,
    authority_host: Url,
    credential: Arc<Credential>,
    token: Mutex<Option<CachedToken>>,
    closed: AtomicBool,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl fmt::Debug for HttpIngestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpIngestClient")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Body of a streaming ingest-from-URI call.
///
/// The route only needs `SourceUri`. The remaining properties are sent
/// alongside it so the request carries the same ingestion properties as a
/// queued submission; the engine ignores those it does not use.
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct IngestBody<'a> {
    source_uri: &'a str,
    source_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_data_size: Option<i64>,
    flush_immediately: bool,
    retain_blob_on_success: bool,
    report_level: u8,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

impl HttpIngestClient {
    pub fn from_config(cfg: &Config, credential: Arc<Credential>) -> Result<Self, ConfigError> {
        let endpoint = cfg.endpoint_url()?;
        let authority_host =
            Url::parse(&cfg.ingestion.authority_host).map_err(|e| ConfigError::InvalidUrl {
                field: "ingestion.authority_host",
                reason: e.to_string(),
            })?;
        Self::new(
            endpoint,
            authority_host,
            credential,
            Duration::from_secs(cfg.ingestion.request_timeout_secs),
        )
    }

    pub fn new(
        endpoint: Url,
        authority_host: Url,
        credential: Arc<Credential>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let http = Client::builder()
            .user_agent(concat!("ingest-forwarder/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint,
            authority_host,
            credential,
            token: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn ingest_url(&self, request: &IngestionRequest) -> Result<Url, IngestError> {
        let target = &request.target;
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| IngestError::Permanent("ingestion endpoint cannot be a base URL".into()))?
            .pop_if_empty()
            .extend([
                "v1",
                "rest",
                "ingest",
                target.database.as_str(),
                target.table.as_str(),
            ]);
        url.query_pairs_mut()
            .append_pair("sourceKind", "uri")
            .append_pair("streamFormat", target.format.as_str());
        if let Some(mapping) = &target.mapping {
            url.query_pairs_mut().append_pair("mappingName", mapping);
        }
        Ok(url)
    }

    pub fn build_request(
        &self,
        request: &IngestionRequest,
        token: &str,
    ) -> Result<reqwest::Request, IngestError> {
        let url = self.ingest_url(request)?;
        let body = IngestBody {
            source_uri: &request.source_uri,
            source_id: request.source_id,
            raw_data_size: request.size_hint,
            flush_immediately: request.flush_immediately,
            retain_blob_on_success: !request.delete_source_on_success,
            report_level: request.report_level.code(),
        };
        self.http
            .post(url)
            .header("Authorization", format!("Bearer {}", token))
            .header(
                "x-ms-client-request-id",
                format!("{};{}", CLIENT_NAME, request.source_id),
            )
            .header("x-ms-app", CLIENT_NAME)
            .header("Content-Type", "application/json")
            .json(&body)
            .build()
            .map_err(|e| IngestError::Permanent(format!("failed to build ingestion request: {}", e)))
    }

    fn token_url(&self) -> Result<Url, IngestError> {
        self.authority_host
            .join(&format!("{}/oauth2/v2.0/token", self.credential.tenant))
            .map_err(|e| IngestError::Permanent(format!("invalid token endpoint: {}", e)))
    }

    fn token_scope(&self) -> String {
        format!(
            "{}/.default",
            self.endpoint.origin().ascii_serialization()
        )
    }

    async fn bearer_token(&self) -> Result<String, IngestError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_REFRESH_MARGIN {
                return Ok(token.value.clone());
            }
        }

        let res = self
            .http
            .post(self.token_url()?)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.credential.app_id.as_str()),
                ("client_secret", self.credential.app_key.as_str()),
                ("scope", self.token_scope().as_str()),
            ])
            .send()
            .await
            .map_err(classify_transport)?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "token request rejected");
            return Err(classify_status(status, &format!("token request: {}", body)));
        }
        let payload: TokenResponse = res
            .json()
            .await
            .map_err(|e| IngestError::Transient(format!("invalid token response: {}", e)))?;

        info!(expires_in = payload.expires_in, "acquired ingestion token");
        let value = payload.access_token.clone();
        *cached = Some(CachedToken {
            value: payload.access_token,
            expires_at: Instant::now() + Duration::from_secs(payload.expires_in),
        });
        Ok(value)
    }
}

#[async_trait]
impl IngestClient for HttpIngestClient {
    #[instrument(skip_all, fields(source_id = %request.source_id))]
    async fn submit(&self, request: &IngestionRequest) -> Result<PendingIngestion, IngestError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IngestError::Permanent("client closed".into()));
        }
        let token = self.bearer_token().await?;
        let http_request = self.build_request(request, &token)?;
        debug!(url = %http_request.url(), uri = %request.redacted_uri(), "sending ingestion request");

        let res = self
            .http
            .execute(http_request)
            .await
            .map_err(classify_transport)?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "ingestion request rejected");
            return Err(classify_status(status, &body));
        }

        let status = if status == StatusCode::ACCEPTED {
            IngestionStatus::Queued
        } else {
            IngestionStatus::Succeeded
        };
        Ok(PendingIngestion {
            source_id: request.source_id,
            status,
        })
    }

    async fn close(&self) -> Result<(), IngestError> {
        self.closed.store(true, Ordering::Release);
        self.token.lock().await.take();
        Ok(())
    }
}

/// Map an HTTP error status onto the transient/permanent split.
pub fn classify_status(status: StatusCode, body: &str) -> IngestError {
    let message = format!("{}: {}", status, body);
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        IngestError::Transient(message)
    } else {
        IngestError::Permanent(message)
    }
}

fn classify_transport(err: reqwest::Error) -> IngestError {
    if err.is_builder() {
        IngestError::Permanent(err.to_string())
    } else {
        IngestError::Transient(err.to_string())
    }
}
