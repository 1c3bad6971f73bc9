//! Credential resolution from orchestrator secrets.
//!
//! Secure mounts need a cluster ticket (`CONTAINER_TICKET`), the provisioner
//! needs the cluster admin login (`MAPR_CLUSTER_USER` /
//! `MAPR_CLUSTER_PASSWORD`).  Both are read from a [`SecretStore`]; in
//! production that is [`KubeSecretStore`], which talks to the API server
//! directly because the plugin runs outside the orchestrator's service
//! discovery environment.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::MaprError;

/// Secret key holding the container ticket.
pub const TICKET_KEY: &str = "CONTAINER_TICKET";
/// Secret key holding the control-plane user name.
pub const ADMIN_USER_KEY: &str = "MAPR_CLUSTER_USER";
/// Secret key holding the control-plane password.
pub const ADMIN_PASSWORD_KEY: &str = "MAPR_CLUSTER_PASSWORD";

const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Location of a secret object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,
    pub namespace: String,
}

impl SecretRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Basic-auth login for the control plane.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Read access to the orchestrator's secret objects.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Return the decoded key/value data of a secret.
    async fn get_secret(&self, secret: &SecretRef) -> Result<HashMap<String, String>, MaprError>;
}

/// Fetch the container ticket stored under [`TICKET_KEY`].
#[instrument(skip(store), fields(secret = %secret))]
pub async fn resolve_ticket(store: &dyn SecretStore, secret: &SecretRef) -> Result<String, MaprError> {
    let mut data = non_empty_secret(store, secret).await?;
    let ticket = data.remove(TICKET_KEY).ok_or_else(|| {
        MaprError::CredentialUnavailable(format!("secret {secret} has no {TICKET_KEY}"))
    })?;
    info!("got ticket secret");
    Ok(ticket)
}

/// Fetch the control-plane login stored under [`ADMIN_USER_KEY`] and
/// [`ADMIN_PASSWORD_KEY`].
#[instrument(skip(store), fields(secret = %secret))]
pub async fn resolve_admin_credentials(
    store: &dyn SecretStore,
    secret: &SecretRef,
) -> Result<Credentials, MaprError> {
    let mut data = non_empty_secret(store, secret).await?;
    let mut take = |key: &str| {
        data.remove(key).ok_or_else(|| {
            MaprError::CredentialUnavailable(format!("secret {secret} has no {key}"))
        })
    };
    let username = take(ADMIN_USER_KEY)?;
    let password = take(ADMIN_PASSWORD_KEY)?;
    info!("got admin secret");
    Ok(Credentials { username, password })
}

async fn non_empty_secret(
    store: &dyn SecretStore,
    secret: &SecretRef,
) -> Result<HashMap<String, String>, MaprError> {
    let data = store.get_secret(secret).await?;
    if data.is_empty() {
        return Err(MaprError::CredentialUnavailable(format!(
            "secret {secret} has no data"
        )));
    }
    Ok(data)
}

// ---------------------------------------------------------------------------
// API server address
// ---------------------------------------------------------------------------

/// `{host}:{port}` of the orchestrator API server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub host: String,
    pub port: u16,
}

impl ServiceInfo {
    pub fn parse(raw: &str) -> Result<Self, MaprError> {
        let raw = raw.trim();
        let (host, port) = raw
            .rsplit_once(':')
            .ok_or_else(|| MaprError::credential(format!("bad service info {raw:?}")))?;
        let port = port
            .parse()
            .map_err(|e| MaprError::credential(format!("bad service port in {raw:?}: {e}")))?;
        if host.is_empty() {
            return Err(MaprError::credential(format!("bad service info {raw:?}")));
        }
        Ok(Self {
            host: host.trim_matches(|c| c == '[' || c == ']').to_owned(),
            port,
        })
    }

    /// From `KUBERNETES_SERVICE_HOST` / `KUBERNETES_SERVICE_PORT`, if both set.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").ok()?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").ok()?;
        Self::parse(&format!("{host}:{port}")).ok()
    }

    pub async fn load(path: &Path) -> Result<Self, MaprError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            MaprError::CredentialUnavailable(format!("read {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    pub async fn store(&self, path: &Path) -> Result<(), MaprError> {
        tokio::fs::write(path, format!("{self}\n"))
            .await
            .map_err(|e| MaprError::internal(format!("write {}: {e}", path.display())))
    }

    pub fn url(&self) -> Result<Url, MaprError> {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        Url::parse(&format!("https://{host}:{}", self.port)).map_err(MaprError::credential)
    }
}

impl fmt::Display for ServiceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// Kubernetes-backed store
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SecretObject {
    #[serde(default)]
    data: HashMap<String, String>,
}

/// [`SecretStore`] reading `v1/Secret` objects from the API server.
pub struct KubeSecretStore {
    api_server: Url,
    token: String,
    client: reqwest::Client,
}

impl KubeSecretStore {
    /// Build a store for `api_server`, authenticating with a bearer `token`
    /// and trusting `ca_pem` when given.
    pub fn new(api_server: Url, token: String, ca_pem: Option<&[u8]>) -> Result<Self, MaprError> {
        let mut builder = reqwest::Client::builder().timeout(API_TIMEOUT);
        if let Some(pem) = ca_pem {
            let cert = reqwest::Certificate::from_pem(pem).map_err(MaprError::credential)?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder.build().map_err(MaprError::credential)?;
        Ok(Self {
            api_server,
            token,
            client,
        })
    }

    /// Store using the pod service-account token and CA, addressing the API
    /// server at `service`.
    pub async fn with_service_account(service: &ServiceInfo) -> Result<Self, MaprError> {
        Self::with_token_file(service.url()?, Path::new(SERVICE_ACCOUNT_TOKEN)).await
    }

    /// Store addressing `api_server` with the token read from `token_file`.
    /// The service-account CA is trusted when present.
    pub async fn with_token_file(api_server: Url, token_file: &Path) -> Result<Self, MaprError> {
        let token = tokio::fs::read_to_string(token_file).await.map_err(|e| {
            MaprError::CredentialUnavailable(format!("read {}: {e}", token_file.display()))
        })?;
        let ca = tokio::fs::read(SERVICE_ACCOUNT_CA).await.ok();
        Self::new(api_server, token.trim().to_owned(), ca.as_deref())
    }

    fn secret_url(&self, secret: &SecretRef) -> Result<Url, MaprError> {
        let mut url = self.api_server.clone();
        url.path_segments_mut()
            .map_err(|_| MaprError::credential("API server URL cannot be a base"))?
            .pop_if_empty()
            .extend([
                "api",
                "v1",
                "namespaces",
                secret.namespace.as_str(),
                "secrets",
                secret.name.as_str(),
            ]);
        Ok(url)
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    #[instrument(skip(self), fields(secret = %secret))]
    async fn get_secret(&self, secret: &SecretRef) -> Result<HashMap<String, String>, MaprError> {
        let url = self.secret_url(secret)?;
        debug!(%url, "fetching secret");
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(MaprError::credential)?;

        let status = response.status();
        if !status.is_success() {
            return Err(MaprError::CredentialUnavailable(format!(
                "secret {secret}: HTTP {status}"
            )));
        }

        let object: SecretObject = response.json().await.map_err(MaprError::credential)?;
        Ok(decode_secret_data(object.data))
    }
}

/// Base64-decode every value of a secret. A value that is not base64 or not
/// UTF-8 is dropped with a warning, so only a lookup of that key fails.
fn decode_secret_data(data: HashMap<String, String>) -> HashMap<String, String> {
    data.into_iter()
        .filter_map(|(key, encoded)| {
            let decoded = general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|e| e.to_string())
                .and_then(|bytes| String::from_utf8(bytes).map_err(|e| e.to_string()));
            match decoded {
                Ok(value) => Some((key, value)),
                Err(reason) => {
                    warn!(%key, %reason, "skipping undecodable secret value");
                    None
                }
            }
        })
        .collect()
}

/// [`SecretStore`] used on worker nodes: the API server address comes from
/// the service-info record cached at init, resolved on first use so that
/// unsecured mounts never touch it.
pub struct NodeSecretStore {
    info_file: PathBuf,
}

impl NodeSecretStore {
    pub fn new(info_file: impl Into<PathBuf>) -> Self {
        Self {
            info_file: info_file.into(),
        }
    }
}

#[async_trait]
impl SecretStore for NodeSecretStore {
    async fn get_secret(&self, secret: &SecretRef) -> Result<HashMap<String, String>, MaprError> {
        let service = ServiceInfo::load(&self.info_file).await?;
        info!(api_server = %service, "starting kube client");
        KubeSecretStore::with_service_account(&service)
            .await?
            .get_secret(secret)
            .await
    }
}

/// In-memory [`SecretStore`], for wiring tests and local runs.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: HashMap<(String, String), HashMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<I, K, V>(&mut self, secret: &SecretRef, data: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.secrets.insert(
            (secret.namespace.clone(), secret.name.clone()),
            data.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        );
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self, secret: &SecretRef) -> Result<HashMap<String, String>, MaprError> {
        self.secrets
            .get(&(secret.namespace.clone(), secret.name.clone()))
            .cloned()
            .ok_or_else(|| MaprError::CredentialUnavailable(format!("secret {secret} not found")))
    }
}
