//! Storage-class parameters accepted by the provisioner.

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use crate::error::MaprError;
use crate::secret::SecretRef;
use crate::types::{ReclaimPolicy, SecurityType};

/// Every parameter key a storage class may carry.  The first block is
/// consumed by the provisioner itself, the rest is handed to the control
/// plane unchanged.
pub const LEGAL_PARAMS: &[&str] = &[
    // provisioner
    "cldbHosts",
    "maprSecretName",
    "maprSecretNamespace",
    "ticketSecretName",
    "ticketSecretNamespace",
    "namePrefix",
    "cluster",
    "mountPrefix",
    "securityType",
    "restServers",
    "platinum",
    "mountOptions",
    "readOnly",
    "reclaimPolicy",
    // volume create
    "advisoryquota",
    "ae",
    "aetype",
    "allowgrant",
    "allowinherit",
    "auditenabled",
    "coalesce",
    "containerallocationfactor",
    "criticalrereplicationtimeoutsec",
    "dataauditops",
    "dbindexlagsecalarmthresh",
    "dbrepllagsecalarmthresh",
    "enforceminreplicationforio",
    "forceauditenable",
    "group",
    "inherit",
    "localvolumehost",
    "localvolumeport",
    "maxinodesalarmthreshold",
    "maxnssizembalarmthreshold",
    "minreplication",
    "mirrorschedule",
    "mirrorthrottle",
    "mount",
    "nsminreplication",
    "nsreplication",
    "readAce",
    "readonly",
    "replication",
    "replicationtype",
    "rereplicationtimeoutsec",
    "rootdirperms",
    "schedule",
    "skipinherit",
    "source",
    "tenantuser",
    "topology",
    "type",
    "user",
    "wiresecurityenabled",
    "writeAce",
];

/// Prefix used for generated names when the class names none.
pub const DEFAULT_NAME_PREFIX: &str = "maprprovisioner";

/// Cluster-level parameters: where the control plane lives and how mounts
/// reach the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerParams {
    /// Space separated control-plane endpoints.
    pub rest_servers: String,
    pub cldb_hosts: String,
    pub cluster: String,
    pub security: SecurityType,
    /// Raw `securityType`, copied verbatim onto the volume.
    pub security_type: String,
    pub ticket_secret_name: String,
    pub ticket_secret_namespace: String,
    /// Secret holding the control-plane admin login.
    pub admin_secret: SecretRef,
}

/// Parameters shaping the generated volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeParams {
    pub name_prefix: String,
    pub mount_prefix: String,
    pub platinum: String,
    pub read_only: String,
    pub mount_options: String,
    pub reclaim_policy: ReclaimPolicy,
}

/// Storage-class parameters reduced to the allow-list.
#[derive(Debug, Clone, Default)]
pub struct StorageClassParams {
    params: BTreeMap<String, String>,
    dropped: Vec<String>,
}

impl StorageClassParams {
    /// Keep only allow-listed keys.  Everything else is dropped with a
    /// warning, never rejected.
    pub fn sanitize(raw: &HashMap<String, String>) -> Self {
        let mut clean = Self::default();
        for (key, value) in raw {
            if LEGAL_PARAMS.iter().any(|legal| legal == key) {
                clean.params.insert(key.clone(), value.clone());
            } else {
                warn!(%key, %value, "storage class contained illegal parameter");
                clean.dropped.push(key.clone());
            }
        }
        clean.dropped.sort();
        clean
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Keys removed by [`sanitize`](Self::sanitize).
    pub fn dropped(&self) -> &[String] {
        &self.dropped
    }

    /// Split into the provisioner's own parameters and the pass-through
    /// control-plane query.
    pub fn split(mut self) -> Result<(ServerParams, VolumeParams, BTreeMap<String, String>), MaprError> {
        let mut take = |key: &str| self.params.remove(key).unwrap_or_default();

        let security_type = take("securityType");
        let server = ServerParams {
            rest_servers: take("restServers"),
            cldb_hosts: take("cldbHosts"),
            cluster: take("cluster"),
            security: SecurityType::from(security_type.as_str()),
            security_type,
            ticket_secret_name: take("ticketSecretName"),
            ticket_secret_namespace: take("ticketSecretNamespace"),
            admin_secret: SecretRef::new(take("maprSecretName"), take("maprSecretNamespace")),
        };

        let name_prefix = take("namePrefix");
        let reclaim = take("reclaimPolicy");
        let volume = VolumeParams {
            name_prefix: if name_prefix.is_empty() {
                DEFAULT_NAME_PREFIX.to_owned()
            } else {
                name_prefix
            },
            mount_prefix: take("mountPrefix"),
            platinum: or_false(take("platinum")),
            read_only: or_false(take("readOnly")),
            mount_options: take("mountOptions"),
            reclaim_policy: ReclaimPolicy::from_param(Some(reclaim.as_str())),
        };

        if server.rest_servers.split_whitespace().next().is_none() {
            return Err(MaprError::invalid("storage class must specify restServers"));
        }
        if server.admin_secret.name.is_empty() || server.admin_secret.namespace.is_empty() {
            return Err(MaprError::invalid(
                "storage class must specify maprSecretName and maprSecretNamespace",
            ));
        }
        Ok((server, volume, self.params))
    }
}

fn or_false(value: String) -> String {
    if value.is_empty() { "false".to_owned() } else { value }
}
