use crate::transport::{DeliveryOutcome, FederationTransport, PeerEndpoint, PostEventResponse};
use crate::{FederationEnvelope, FederationError, FederationServerKey};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// HTTP client for server-to-server federation requests.
#[derive(Debug, Clone)]
pub struct FederationClient {
    http: Client,
    origin: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_name: String,
    pub federation_endpoint: String,
    pub key_id: Option<String>,
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationKeysResponse {
    pub server_name: String,
    pub keys: Vec<FederationServerKey>,
}

impl FederationClient {
    pub fn new() -> Result<Self, FederationError> {
        Self::build(None)
    }

    /// Client that names this server in the `X-Rookery-Origin` header.
    pub fn with_origin(origin: impl Into<String>) -> Result<Self, FederationError> {
        Self::build(Some(origin.into()))
    }

    fn build(origin: Option<String>) -> Result<Self, FederationError> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(concat!("Rookery-Federation/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FederationError::Http(e.to_string()))?;
        Ok(Self { http, origin })
    }

    /// Discover a remote server's federation info via its `.well-known` endpoint.
    pub async fn fetch_server_info(&self, base_url: &str) -> Result<ServerInfo, FederationError> {
        let url = format!(
            "{}/.well-known/rookery/server",
            base_url.trim_end_matches('/')
        );
        let resp = self.get_with_retry(&url).await?;
        resp.json()
            .await
            .map_err(|e| FederationError::RemoteError(format!("invalid server info: {e}")))
    }

    /// Fetch the public keys of a remote server.
    pub async fn fetch_server_keys(
        &self,
        federation_endpoint: &str,
    ) -> Result<FederationKeysResponse, FederationError> {
        let url = format!("{}/keys", federation_endpoint.trim_end_matches('/'));
        let resp = self.get_with_retry(&url).await?;
        resp.json()
            .await
            .map_err(|e| FederationError::RemoteError(format!("invalid keys response: {e}")))
    }

    /// Send a signed envelope to a remote server's ingest endpoint.
    pub async fn post_event(
        &self,
        federation_endpoint: &str,
        envelope: &FederationEnvelope,
    ) -> Result<DeliveryOutcome, FederationError> {
        let url = format!("{}/event", federation_endpoint.trim_end_matches('/'));
        let body_bytes =
            serde_json::to_vec(envelope).map_err(|e| FederationError::Http(e.to_string()))?;
        let resp = self.post_with_retry(&url, body_bytes).await?;
        if resp.status() == StatusCode::CONFLICT {
            return Ok(DeliveryOutcome::Deferred);
        }
        let body: PostEventResponse = resp
            .json()
            .await
            .map_err(|e| FederationError::RemoteError(format!("invalid event response: {e}")))?;
        Ok(if body.inserted {
            DeliveryOutcome::Applied
        } else {
            DeliveryOutcome::Duplicate
        })
    }

    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, FederationError> {
        let mut last_err = FederationError::Http("no attempts made".to_string());
        for attempt in 0..MAX_RETRIES {
            match self.http.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status().is_server_error() => {
                    last_err = FederationError::RemoteError(format!(
                        "server error {} from {}",
                        resp.status(),
                        url
                    ));
                }
                Ok(resp) => {
                    return Err(FederationError::RemoteError(format!(
                        "request to {} returned {}",
                        url,
                        resp.status()
                    )));
                }
                Err(e) => last_err = FederationError::Http(e.to_string()),
            }
            if attempt + 1 < MAX_RETRIES {
                tokio::time::sleep(RETRY_BASE_DELAY * 2u32.pow(attempt)).await;
            }
        }
        Err(last_err)
    }

    /// POST with short in-request retries on 5xx and network errors. 409 is
    /// handed back to the caller; any other 4xx is a permanent rejection.
    async fn post_with_retry(
        &self,
        url: &str,
        body_bytes: Vec<u8>,
    ) -> Result<reqwest::Response, FederationError> {
        let mut last_err = FederationError::Http("no attempts made".to_string());
        for attempt in 0..MAX_RETRIES {
            let mut request = self
                .http
                .post(url)
                .header("content-type", "application/json")
                .body(body_bytes.clone());
            if let Some(origin) = &self.origin {
                request = request.header("X-Rookery-Origin", origin.as_str());
            }

            match request.send().await {
                Ok(resp) if resp.status().is_success() || resp.status() == StatusCode::CONFLICT => {
                    return Ok(resp);
                }
                Ok(resp) if resp.status().is_server_error() => {
                    last_err = FederationError::RemoteError(format!(
                        "server error {} from {}",
                        resp.status(),
                        url
                    ));
                }
                Ok(resp) => {
                    let status = resp.status();
                    let detail = resp.text().await.unwrap_or_default();
                    return Err(FederationError::Rejected(format!(
                        "request to {url} returned {status}: {detail}"
                    )));
                }
                Err(e) => {
                    last_err = FederationError::Http(e.to_string());
                }
            }
            if attempt + 1 < MAX_RETRIES {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl FederationTransport for FederationClient {
    async fn send_event(
        &self,
        peer: &PeerEndpoint,
        envelope: &FederationEnvelope,
    ) -> Result<DeliveryOutcome, FederationError> {
        self.post_event(&peer.federation_endpoint, envelope).await
    }
}
