//! Dynamic provisioning of cluster volumes.
//!
//! [`Provisioner::provision`] turns a claim into a control-plane volume and
//! the persistent volume describing it.  [`Provisioner::delete`] removes the
//! backing volume again, working only from what the persistent volume
//! carries: the annotations written at provisioning time are the sole record
//! of which control plane owns the volume.

pub mod params;
pub mod rest;
pub mod volume;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::MaprError;
use crate::secret::{self, Credentials, SecretRef, SecretStore};
use crate::types::{AccessMode, ReclaimPolicy};

pub use params::{ServerParams, StorageClassParams, VolumeParams};
pub use rest::{HttpsTransport, RestClient, RestResponse, Transport};
pub use volume::{VolumeInfo, convert_capacity};

/// Identity this provisioner registers under, and the flex driver its
/// volumes mount through.
pub const PROVISIONER_NAME: &str = "mapr.com/maprfs";
pub const DRIVER_NAME: &str = "mapr.com/maprfs";
pub const PROVISIONER_VERSION: &str = "v1.0.0";

pub const ANNOTATION_IDENTITY: &str = "mapr.com/maprProvisionerIdentity";
pub const ANNOTATION_VERSION: &str = "mapr.com/provisionerVersion";
pub const ANNOTATION_DESCRIPTION: &str = "mapr.com/description";
pub const ANNOTATION_REST_SERVERS: &str = "mapr.com/restServers";
pub const ANNOTATION_SECRET_NAME: &str = "mapr.com/secretName";
pub const ANNOTATION_SECRET_NAMESPACE: &str = "mapr.com/secretNamespace";
pub const ANNOTATION_VOLUME_NAME: &str = "mapr.com/volumeName";

/// `tracing` target of the per-claim and per-volume events.  Each carries a
/// `reason` and the `claim` or `pv` it concerns.
pub const EVENT_TARGET: &str = "maprfs::event";

/// Where the control plane is and how to log in to it.  Rebuilt for every
/// call; on delete only `rest_servers`, `admin_secret` and `credentials`
/// are known.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub rest_servers: String,
    pub cldb_hosts: String,
    pub cluster: String,
    pub security_type: String,
    pub ticket_secret_name: String,
    pub ticket_secret_namespace: String,
    pub admin_secret: SecretRef,
    pub credentials: Credentials,
}

/// A claim waiting for a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    /// Name of the claim, for logging.
    #[serde(default)]
    pub claim_name: String,
    /// Requested capacity in bytes.
    pub capacity: u64,
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
    /// Storage-class parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Persistent volume record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolume {
    #[serde(default = "pv_api_version")]
    pub api_version: String,
    #[serde(default = "pv_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PersistentVolumeSpec,
}

fn pv_api_version() -> String {
    "v1".to_owned()
}

fn pv_kind() -> String {
    "PersistentVolume".to_owned()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentVolumeSpec {
    #[serde(default)]
    pub persistent_volume_reclaim_policy: ReclaimPolicy,
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
    #[serde(default)]
    pub capacity: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flex_volume: Option<FlexVolumeSource>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlexVolumeSource {
    pub driver: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl PersistentVolume {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

pub struct Provisioner {
    identity: String,
    secrets: Box<dyn SecretStore>,
    rest: RestClient,
}

impl Provisioner {
    pub fn new(identity: impl Into<String>, secrets: Box<dyn SecretStore>, rest: RestClient) -> Self {
        Self {
            identity: identity.into(),
            secrets,
            rest,
        }
    }

    /// Create a control-plane volume for `req` and describe it as a
    /// persistent volume.  Progress is reported as claim events under
    /// [`EVENT_TARGET`].
    #[instrument(skip_all, fields(claim = %req.claim_name))]
    pub async fn provision(&self, req: &ProvisionRequest) -> Result<PersistentVolume, MaprError> {
        info!("=== starting volume provisioning ===");
        let result = self.create(req).await;
        if let Err(error) = &result {
            warn!(target: EVENT_TARGET, claim = req.claim_name.as_str(), reason = "ProvisioningError", %error, "cannot create volume");
        }
        result
    }

    async fn create(&self, req: &ProvisionRequest) -> Result<PersistentVolume, MaprError> {
        let claim = req.claim_name.as_str();
        info!(target: EVENT_TARGET, claim, reason = "Provisioning", "parsing parameters");
        let params = StorageClassParams::sanitize(&req.parameters);
        let (server_params, volume_params, passthrough) = params.split()?;

        let server = self.server_info(server_params).await?;
        info!(target: EVENT_TARGET, claim, reason = "ProvisioningSecret", "got admin secret");
        info!(
            target: EVENT_TARGET,
            claim,
            reason = "Provisioning",
            rest = %server.rest_servers,
            cldb = %server.cldb_hosts,
            cluster = %server.cluster,
            security = %server.security_type,
            "constructed server info"
        );

        let volume = VolumeInfo::generate(&volume_params, req.capacity);
        info!(
            target: EVENT_TARGET,
            claim,
            reason = "Provisioning",
            volume = %volume.name,
            path = %volume.path,
            quota = %volume.quota,
            "generated volume name"
        );

        let query = volume.create_query(&passthrough);
        self.rest.create_volume(&server, &volume.name, &query).await?;
        info!(target: EVENT_TARGET, claim, reason = "ProvisioningREST", volume = %volume.name, "volume created");

        info!(
            target: EVENT_TARGET,
            claim,
            reason = "Provisioning",
            pv = %volume.pv_name,
            reclaim = ?volume.reclaim_policy,
            "=== finished volume provisioning ==="
        );
        Ok(self.persistent_volume(req, &server, &volume))
    }

    /// Remove the volume behind `pv`.  Volumes this provisioner did not
    /// create are [`MaprError::Ignored`].
    #[instrument(skip_all, fields(pv = %pv.metadata.name))]
    pub async fn delete(&self, pv: &PersistentVolume) -> Result<(), MaprError> {
        let name = pv.metadata.name.as_str();
        if pv.annotation(ANNOTATION_IDENTITY).is_none() {
            warn!(target: EVENT_TARGET, pv = name, reason = "DeleteVolumeWarning", "identity annotation missing, not ours");
            return Err(MaprError::Ignored(format!(
                "identity annotation on PV is not {ANNOTATION_IDENTITY}"
            )));
        }
        info!("=== starting volume delete ===");

        let (server, volume) = match self.delete_target(pv).await {
            Ok(target) => target,
            Err(error) => {
                warn!(target: EVENT_TARGET, pv = name, reason = "DeleteVolumeWarning", %error, "cannot delete volume");
                return Err(error);
            }
        };

        info!(target: EVENT_TARGET, pv = name, reason = "DeleteVolume", %volume, "removing volume");
        if let Err(error) = self.rest.delete_volume(&server, &volume).await {
            warn!(target: EVENT_TARGET, pv = name, reason = "DeleteError", %volume, %error, "cannot delete volume");
            return Err(error);
        }

        info!(target: EVENT_TARGET, pv = name, reason = "DeleteREST", %volume, "=== finished volume delete ===");
        Ok(())
    }

    /// Control plane and volume name recorded on `pv` at provisioning time.
    async fn delete_target(&self, pv: &PersistentVolume) -> Result<(ServerInfo, String), MaprError> {
        let required = |key: &str| {
            pv.annotation(key)
                .map(str::to_owned)
                .ok_or_else(|| MaprError::invalid(format!("{key} annotation not found on PV")))
        };
        let rest_servers = required(ANNOTATION_REST_SERVERS)?;
        let volume = required(ANNOTATION_VOLUME_NAME)?;
        let admin_secret = SecretRef::new(
            required(ANNOTATION_SECRET_NAME)?,
            required(ANNOTATION_SECRET_NAMESPACE)?,
        );

        let credentials = secret::resolve_admin_credentials(self.secrets.as_ref(), &admin_secret).await?;
        let server = ServerInfo {
            rest_servers,
            admin_secret,
            credentials,
            ..Default::default()
        };
        Ok((server, volume))
    }

    async fn server_info(&self, p: ServerParams) -> Result<ServerInfo, MaprError> {
        let credentials = secret::resolve_admin_credentials(self.secrets.as_ref(), &p.admin_secret).await?;
        Ok(ServerInfo {
            rest_servers: p.rest_servers,
            cldb_hosts: p.cldb_hosts,
            cluster: p.cluster,
            security_type: p.security_type,
            ticket_secret_name: p.ticket_secret_name,
            ticket_secret_namespace: p.ticket_secret_namespace,
            admin_secret: p.admin_secret,
            credentials,
        })
    }

    fn persistent_volume(&self, req: &ProvisionRequest, server: &ServerInfo, volume: &VolumeInfo) -> PersistentVolume {
        let annotations = BTreeMap::from([
            (ANNOTATION_IDENTITY.to_owned(), self.identity.clone()),
            (ANNOTATION_VERSION.to_owned(), PROVISIONER_VERSION.to_owned()),
            (
                ANNOTATION_DESCRIPTION.to_owned(),
                format!("Dynamically provisioned PV for MapR-FS: {}", volume.name),
            ),
            (ANNOTATION_REST_SERVERS.to_owned(), server.rest_servers.clone()),
            (ANNOTATION_SECRET_NAME.to_owned(), server.admin_secret.name.clone()),
            (ANNOTATION_SECRET_NAMESPACE.to_owned(), server.admin_secret.namespace.clone()),
            (ANNOTATION_VOLUME_NAME.to_owned(), volume.name.clone()),
        ]);

        let options = BTreeMap::from([
            ("volumePath".to_owned(), volume.path.clone()),
            ("cluster".to_owned(), server.cluster.clone()),
            ("cldbHosts".to_owned(), server.cldb_hosts.clone()),
            ("securityType".to_owned(), server.security_type.clone()),
            ("ticketSecretName".to_owned(), server.ticket_secret_name.clone()),
            ("ticketSecretNamespace".to_owned(), server.ticket_secret_namespace.clone()),
            ("platinum".to_owned(), volume.platinum.clone()),
            ("mountOptions".to_owned(), volume.mount_options.clone()),
            ("readOnly".to_owned(), volume.read_only.clone()),
        ]);

        PersistentVolume {
            api_version: pv_api_version(),
            kind: pv_kind(),
            metadata: ObjectMeta {
                name: volume.pv_name.clone(),
                annotations,
            },
            spec: PersistentVolumeSpec {
                persistent_volume_reclaim_policy: volume.reclaim_policy,
                access_modes: req.access_modes.clone(),
                capacity: BTreeMap::from([("storage".to_owned(), req.capacity.to_string())]),
                flex_volume: Some(FlexVolumeSource {
                    driver: DRIVER_NAME.to_owned(),
                    options,
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::{ADMIN_PASSWORD_KEY, ADMIN_USER_KEY, MemorySecretStore};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use tracing::field::{Field, Visit};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use url::Url;

    type Calls = Arc<Mutex<Vec<(Url, Credentials)>>>;

    /// Accepts everything on hosts in `up`, refuses connections elsewhere.
    struct FakeControlPlane {
        up: Vec<&'static str>,
        calls: Calls,
    }

    #[async_trait]
    impl Transport for FakeControlPlane {
        async fn post(&self, url: &Url, credentials: &Credentials) -> Result<RestResponse, MaprError> {
            self.calls.lock().unwrap().push((url.clone(), credentials.clone()));
            if self.up.iter().any(|host| url.host_str() == Some(*host)) {
                Ok(RestResponse {
                    status: 200,
                    body: r#"{"timestamp":1,"status":"OK","total":0,"data":[]}"#.into(),
                })
            } else {
                Err(MaprError::internal("connection refused"))
            }
        }
    }

    /// `(subject, reason)` of every event sent to [`EVENT_TARGET`].
    #[derive(Clone, Default)]
    struct EventLog(Arc<Mutex<Vec<(String, String)>>>);

    #[derive(Default)]
    struct EventFields {
        subject: String,
        reason: String,
    }

    impl Visit for EventFields {
        fn record_str(&mut self, field: &Field, value: &str) {
            match field.name() {
                "claim" | "pv" => self.subject = value.to_owned(),
                "reason" => self.reason = value.to_owned(),
                _ => {}
            }
        }

        fn record_debug(&mut self, _field: &Field, _value: &dyn std::fmt::Debug) {}
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for EventLog {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if event.metadata().target() != EVENT_TARGET {
                return;
            }
            let mut fields = EventFields::default();
            event.record(&mut fields);
            self.0.lock().unwrap().push((fields.subject, fields.reason));
        }
    }

    impl EventLog {
        fn install(&self) -> tracing::subscriber::DefaultGuard {
            tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
        }

        fn reasons(&self) -> Vec<String> {
            self.0.lock().unwrap().iter().map(|(_, r)| r.clone()).collect()
        }

        fn subjects(&self) -> Vec<String> {
            self.0.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
        }
    }

    fn provisioner(up: Vec<&'static str>) -> (Provisioner, Calls) {
        let mut secrets = MemorySecretStore::new();
        secrets.insert(
            &SecretRef::new("admin", "mapr-system"),
            [(ADMIN_USER_KEY, "mapr"), (ADMIN_PASSWORD_KEY, "s3cret")],
        );
        let calls = Calls::default();
        let transport = FakeControlPlane {
            up,
            calls: calls.clone(),
        };
        let provisioner = Provisioner::new(
            PROVISIONER_NAME,
            Box::new(secrets),
            RestClient::new(Box::new(transport)),
        );
        (provisioner, calls)
    }

    fn request() -> ProvisionRequest {
        let parameters = [
            ("restServers", "rest-down rest-up"),
            ("cldbHosts", "cldb1 cldb2"),
            ("cluster", "my.cluster.com"),
            ("securityType", "secure"),
            ("ticketSecretName", "ticket"),
            ("ticketSecretNamespace", "mapr"),
            ("maprSecretName", "admin"),
            ("maprSecretNamespace", "mapr-system"),
            ("namePrefix", "web"),
            ("mountPrefix", "/k8s"),
            ("replication", "3"),
            ("notAParam", "x"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect();
        ProvisionRequest {
            claim_name: "data-web-0".into(),
            capacity: 5_000_000_000,
            access_modes: vec![AccessMode::ReadWriteMany],
            parameters,
        }
    }

    #[tokio::test]
    async fn provision_builds_annotated_volume() {
        let (provisioner, calls) = provisioner(vec!["rest-up"]);
        let pv = provisioner.provision(&request()).await.unwrap();

        let volume = pv.annotation(ANNOTATION_VOLUME_NAME).unwrap().to_owned();
        let suffix = volume.strip_prefix("web.").unwrap();
        assert_eq!(pv.metadata.name, format!("web-{suffix}"));
        assert_eq!(pv.annotation(ANNOTATION_IDENTITY), Some(PROVISIONER_NAME));
        assert_eq!(pv.annotation(ANNOTATION_VERSION), Some("v1.0.0"));
        assert_eq!(pv.annotation(ANNOTATION_REST_SERVERS), Some("rest-down rest-up"));
        assert_eq!(pv.spec.capacity["storage"], "5000000000");
        assert_eq!(pv.spec.access_modes, vec![AccessMode::ReadWriteMany]);

        let flex = pv.spec.flex_volume.as_ref().unwrap();
        assert_eq!(flex.driver, DRIVER_NAME);
        assert_eq!(flex.options["volumePath"], format!("/k8s/web-{suffix}"));
        assert_eq!(flex.options["cldbHosts"], "cldb1 cldb2");
        assert_eq!(flex.options["ticketSecretName"], "ticket");
        assert_eq!(flex.options["readOnly"], "false");

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        let (url, creds) = &calls[1];
        assert_eq!(url.host_str(), Some("rest-up"));
        assert_eq!(url.path(), "/rest/volume/create");
        assert_eq!(creds.username, "mapr");
        let query: BTreeMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(query["quota"], "5000M");
        assert_eq!(query["replication"], "3");
        assert_eq!(query["name"], volume);
        assert!(!query.contains_key("notAParam"));
        assert!(!query.contains_key("cldbHosts"));
        assert!(!query.contains_key("maprSecretName"));
    }

    #[tokio::test]
    async fn delete_from_persisted_annotations_only() {
        let (creator, _) = provisioner(vec!["rest-up"]);
        let pv = creator.provision(&request()).await.unwrap();

        // Keep nothing but the four annotations delete depends on, plus the
        // identity marker.
        let keep = [
            ANNOTATION_IDENTITY,
            ANNOTATION_REST_SERVERS,
            ANNOTATION_SECRET_NAME,
            ANNOTATION_SECRET_NAMESPACE,
            ANNOTATION_VOLUME_NAME,
        ];
        let stored = PersistentVolume {
            api_version: pv_api_version(),
            kind: pv_kind(),
            metadata: ObjectMeta {
                name: pv.metadata.name.clone(),
                annotations: pv
                    .metadata
                    .annotations
                    .iter()
                    .filter(|(k, _)| keep.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            },
            spec: PersistentVolumeSpec::default(),
        };
        let json = serde_json::to_string(&stored).unwrap();
        let stored: PersistentVolume = serde_json::from_str(&json).unwrap();

        let (deleter, calls) = provisioner(vec!["rest-up"]);
        deleter.delete(&stored).await.unwrap();

        let calls = calls.lock().unwrap();
        let (url, creds) = calls.last().unwrap();
        assert_eq!(url.host_str(), Some("rest-up"));
        assert_eq!(url.path(), "/rest/volume/remove");
        assert_eq!(
            url.query(),
            Some(format!("name={}", pv.annotation(ANNOTATION_VOLUME_NAME).unwrap()).as_str())
        );
        assert_eq!(creds.password, "s3cret");
    }

    #[tokio::test]
    async fn foreign_volume_is_ignored() {
        let (provisioner, calls) = provisioner(vec!["rest-up"]);
        let pv: PersistentVolume =
            serde_json::from_str(r#"{"metadata":{"name":"pv-1"}}"#).unwrap();
        let err = provisioner.delete(&pv).await.unwrap_err();
        assert!(matches!(err, MaprError::Ignored(_)));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_annotation_is_invalid() {
        let (provisioner, _) = provisioner(vec!["rest-up"]);
        let pv: PersistentVolume = serde_json::from_str(
            r#"{"metadata":{"name":"pv-1","annotations":{
                "mapr.com/maprProvisionerIdentity":"mapr.com/maprfs",
                "mapr.com/restServers":"rest-up"}}}"#,
        )
        .unwrap();
        let err = provisioner.delete(&pv).await.unwrap_err();
        assert!(err.to_string().contains(ANNOTATION_VOLUME_NAME), "{err}");
    }

    #[tokio::test]
    async fn all_endpoints_down_fails_provisioning() {
        let (provisioner, calls) = provisioner(vec![]);
        let err = provisioner.provision(&request()).await.unwrap_err();
        assert!(matches!(err, MaprError::ProvisioningFailed { .. }));
        assert_eq!(calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_admin_secret_fails_before_rest() {
        let (provisioner, calls) = provisioner(vec!["rest-up"]);
        let mut req = request();
        req.parameters.insert("maprSecretName".into(), "nope".into());
        let err = provisioner.provision(&req).await.unwrap_err();
        assert!(matches!(err, MaprError::CredentialUnavailable(_)));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn provisioning_reports_claim_events() {
        let events = EventLog::default();
        let _guard = events.install();

        let (provisioner, _) = provisioner(vec!["rest-up"]);
        provisioner.provision(&request()).await.unwrap();

        let reasons = events.reasons();
        for reason in ["Provisioning", "ProvisioningSecret", "ProvisioningREST"] {
            assert!(reasons.iter().any(|r| r == reason), "{reasons:?}");
        }
        assert!(!reasons.iter().any(|r| r == "ProvisioningError"), "{reasons:?}");
        assert!(events.subjects().iter().all(|s| s == "data-web-0"));
    }

    #[tokio::test]
    async fn failures_are_reported_as_warning_events() {
        let events = EventLog::default();
        let _guard = events.install();

        let (provisioner, _) = provisioner(vec![]);
        provisioner.provision(&request()).await.unwrap_err();
        assert_eq!(events.reasons().last().map(String::as_str), Some("ProvisioningError"));

        let pv: PersistentVolume =
            serde_json::from_str(r#"{"metadata":{"name":"pv-1"}}"#).unwrap();
        provisioner.delete(&pv).await.unwrap_err();
        let log = events.0.lock().unwrap();
        assert_eq!(
            log.last(),
            Some(&("pv-1".to_owned(), "DeleteVolumeWarning".to_owned()))
        );
    }
}
