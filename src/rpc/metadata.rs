//! Metadata documents fetched over HTTP, with `ipfs://` URIs served by a gateway.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use serde_json::Value;
use url::Url;

use crate::live_object::external::{ExternalCallError, MetadataResolver};

#[derive(Debug, Clone)]
pub struct MetadataClientConfig {
    /// Gateway used for `ipfs://` URIs and bare CIDs, e.g. `https://ipfs.io/`.
    pub gateway: Url,
    pub timeout: Duration,
}

impl MetadataClientConfig {
    pub fn new(gateway: Url) -> Self {
        Self {
            gateway,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct HttpMetadataResolver {
    http: HttpClient,
    gateway: Url,
}

impl HttpMetadataResolver {
    pub fn new(config: MetadataClientConfig) -> Result<Self, ExternalCallError> {
        let http = HttpClient::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExternalCallError::Permanent(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            gateway: config.gateway,
        })
    }

    /// Where `uri` is fetched from: http(s) as-is, everything else through the gateway.
    pub fn document_url(&self, uri: &str) -> Result<Url, ExternalCallError> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(ExternalCallError::Permanent("empty metadata URI".to_string()));
        }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return Url::parse(uri).map_err(|e| ExternalCallError::Permanent(format!("{}: {}", uri, e)));
        }

        let path = uri
            .strip_prefix("ipfs://")
            .map(|rest| rest.strip_prefix("ipfs/").unwrap_or(rest))
            .unwrap_or(uri);
        self.gateway
            .join(&format!("ipfs/{}", path))
            .map_err(|e| ExternalCallError::Permanent(format!("{}: {}", uri, e)))
    }
}

/// Rate limits and upstream failures are worth another attempt; other
/// error statuses come back the same every time.
fn status_error(url: &Url, status: StatusCode) -> ExternalCallError {
    let msg = format!("GET {} returned {}", url, status);
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ExternalCallError::Transient(msg)
    } else {
        ExternalCallError::Permanent(msg)
    }
}

fn request_error(url: &Url, e: reqwest::Error) -> ExternalCallError {
    let msg = format!("GET {} failed: {}", url, e);
    if e.is_timeout() || e.is_connect() || e.is_request() {
        ExternalCallError::Transient(msg)
    } else {
        ExternalCallError::Permanent(msg)
    }
}

#[async_trait]
impl MetadataResolver for HttpMetadataResolver {
    async fn resolve(&self, uri: &str) -> Result<Value, ExternalCallError> {
        let url = self.document_url(uri)?;
        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| request_error(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(&url, status));
        }

        // A body that is not JSON will not become JSON on retry.
        response
            .json::<Value>()
            .await
            .map_err(|e| ExternalCallError::Permanent(format!("GET {} is not JSON: {}", url, e)))
    }
}
