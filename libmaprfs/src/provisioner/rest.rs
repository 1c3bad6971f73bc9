//! Control-plane REST client.
//!
//! Every call walks the endpoint list in order and stops at the first
//! endpoint that answers with a non-error status.  Transport errors, non-2xx
//! responses, unparseable bodies and `"status":"ERROR"` all count as that
//! endpoint's failure.  No retries on the same endpoint, no backoff.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::ServerInfo;
use crate::error::MaprError;
use crate::secret::Credentials;

/// Port used for endpoints that do not name one.
pub const DEFAULT_REST_PORT: u16 = 8443;
/// Bound on a single request/response exchange.
pub const REST_TIMEOUT: Duration = Duration::from_secs(60);

pub const CREATE_PATH: &str = "/rest/volume/create";
pub const REMOVE_PATH: &str = "/rest/volume/remove";

/// `host[:port]` entries of a space separated list, with the default port
/// applied where absent.
pub fn parse_endpoints(raw: &str) -> Vec<String> {
    raw.split_whitespace()
        .map(|ep| {
            if ep.contains(':') {
                ep.to_owned()
            } else {
                format!("{ep}:{DEFAULT_REST_PORT}")
            }
        })
        .collect()
}

/// Raw answer of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestResponse {
    pub status: u16,
    pub body: String,
}

/// Issues a single authenticated POST.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, url: &Url, credentials: &Credentials) -> Result<RestResponse, MaprError>;
}

/// [`Transport`] over `reqwest`.  Certificates are not verified: control
/// planes run with self-signed certificates on private networks.
pub struct HttpsTransport {
    client: reqwest::Client,
}

impl HttpsTransport {
    pub fn new() -> Result<Self, MaprError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(REST_TIMEOUT)
            .build()
            .map_err(MaprError::internal)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpsTransport {
    async fn post(&self, url: &Url, credentials: &Credentials) -> Result<RestResponse, MaprError> {
        let response = self
            .client
            .post(url.clone())
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await
            .map_err(MaprError::internal)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(MaprError::internal)?;
        Ok(RestResponse { status, body })
    }
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

/// Volume create/remove against a list of control-plane endpoints.
pub struct RestClient {
    transport: Box<dyn Transport>,
    scheme: String,
}

impl RestClient {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            scheme: "https".into(),
        }
    }

    /// Production client: HTTPS, no certificate verification.
    pub fn https() -> Result<Self, MaprError> {
        Ok(Self::new(Box::new(HttpsTransport::new()?)))
    }

    /// Override the URL scheme, `https` by default.
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    #[instrument(skip(self, server, query), fields(rest = %server.rest_servers))]
    pub async fn create_volume(
        &self,
        server: &ServerInfo,
        volume: &str,
        query: &BTreeMap<String, String>,
    ) -> Result<(), MaprError> {
        self.call(server, CREATE_PATH, query)
            .await
            .map_err(|reason| MaprError::ProvisioningFailed {
                volume: volume.to_owned(),
                reason,
            })
    }

    #[instrument(skip(self, server), fields(rest = %server.rest_servers))]
    pub async fn delete_volume(&self, server: &ServerInfo, volume: &str) -> Result<(), MaprError> {
        let query = BTreeMap::from([("name".to_owned(), volume.to_owned())]);
        self.call(server, REMOVE_PATH, &query)
            .await
            .map_err(|reason| MaprError::DeletionFailed {
                volume: volume.to_owned(),
                reason,
            })
    }

    /// Walk the endpoints; `Err` carries the last endpoint's failure.
    async fn call(
        &self,
        server: &ServerInfo,
        path: &str,
        query: &BTreeMap<String, String>,
    ) -> Result<(), String> {
        let mut last = "no REST servers configured".to_owned();
        for endpoint in parse_endpoints(&server.rest_servers) {
            let url = match self.url(&endpoint, path, query) {
                Ok(url) => url,
                Err(e) => {
                    warn!(%endpoint, error = %e, "bad REST endpoint");
                    last = format!("{endpoint}: {e}");
                    continue;
                }
            };
            info!(%endpoint, %path, query = url.query().unwrap_or_default(), "calling REST server");

            match self.attempt(&url, &server.credentials).await {
                Ok(()) => {
                    info!(%endpoint, "REST call succeeded");
                    return Ok(());
                }
                Err(reason) => {
                    warn!(%endpoint, %reason, "REST call failed, trying next server");
                    last = format!("{endpoint}: {reason}");
                }
            }
        }
        Err(last)
    }

    async fn attempt(&self, url: &Url, credentials: &Credentials) -> Result<(), String> {
        let response = self
            .transport
            .post(url, credentials)
            .await
            .map_err(|e| e.to_string())?;
        debug!(status = response.status, body = %response.body, "REST response");

        if !(200..300).contains(&response.status) {
            return Err(format!("HTTP {}", response.status));
        }
        let body: StatusBody = serde_json::from_str(&response.body)
            .map_err(|e| format!("unreadable response: {e}"))?;
        if body.status.as_deref() == Some("ERROR") {
            let detail = body.errors.map(|e| e.to_string()).unwrap_or_default();
            return Err(format!("status ERROR {detail}").trim_end().to_owned());
        }
        Ok(())
    }

    fn url(&self, endpoint: &str, path: &str, query: &BTreeMap<String, String>) -> Result<Url, MaprError> {
        let mut url = Url::parse(&format!("{}://{endpoint}{path}", self.scheme))
            .map_err(MaprError::internal)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }
}
