//! Driver configuration: on-disk layout and typed mount options.
//!
//! [`Layout`] names every fixed path the driver touches.  Environment
//! variables:
//! - `MAPRFS_INSTALL_DIR`: root of the MapR client installation.
//!   Defaults to `/opt/mapr`.
//! - `MAPRFS_COPY_DIR`: directory holding the second-stage install hook
//!   (`copy2mapr`).  Defaults to `/etc/kubernetes/mapr-kdf`.
//!
//! [`MountOptions`] is the validated form of the JSON option map the
//! orchestrator passes with every `mount`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::error::MaprError;
use crate::secret::SecretRef;
use crate::types::SecurityType;

const DEFAULT_INSTALL_DIR: &str = "/opt/mapr";
const DEFAULT_COPY_DIR: &str = "/etc/kubernetes/mapr-kdf";

/// File names under [`Layout::log_dir`], never rotated.
pub const PLUGIN_LOG_FILE: &str = "plugin-k8s.log";
pub const PROVISIONER_LOG_FILE: &str = "provisioner-k8s.log";

/// Fixed paths used by the plugin, the mount daemon and the provisioner.
#[derive(Debug, Clone)]
pub struct Layout {
    /// `{install}/k8s`, parent of everything the plugin owns.
    pub k8s_dir: PathBuf,
    /// Plugin, provisioner and per-mount daemon logs.
    pub log_dir: PathBuf,
    /// Parent of every staging mount.
    pub mounts_dir: PathBuf,
    /// Parent of every support record.
    pub support_dir: PathBuf,
    /// Init marker: present means "reinstall of the same version".
    pub save_file: PathBuf,
    /// `{host}:{port}` of the API server, cached at init.
    pub info_file: PathBuf,
    /// The opaque mount daemon launcher.
    pub fuse_script: PathBuf,
    /// Bundled `fusermount` binary.
    pub fusermount_source: PathBuf,
    /// Where `fusermount` gets linked on fresh install.
    pub fusermount_link: PathBuf,
    /// Node FQDN recorded for the mount daemon.
    pub hostname_file: PathBuf,
    /// Kernel core pattern file, `None` to leave it alone.
    pub core_pattern_file: Option<PathBuf>,
    /// Second-stage install hook run on every init, `None` to skip.
    pub install_hook: Option<PathBuf>,
}

impl Layout {
    /// Production layout for the given installation and hook directories.
    pub fn new(install_dir: &Path, copy_dir: &Path) -> Self {
        let k8s_dir = install_dir.join("k8s");
        let bin_dir = k8s_dir.join("bin");
        Self {
            log_dir: install_dir.join("logs"),
            mounts_dir: k8s_dir.join("mounts"),
            support_dir: k8s_dir.join("support"),
            save_file: k8s_dir.join("SAVE"),
            info_file: k8s_dir.join("serviceinfo"),
            fuse_script: bin_dir.join("start-fuse"),
            fusermount_source: bin_dir.join("fusermount"),
            fusermount_link: PathBuf::from("/bin/fusermount"),
            hostname_file: k8s_dir.join("hostname"),
            core_pattern_file: Some(PathBuf::from("/proc/sys/kernel/core_pattern")),
            install_hook: Some(copy_dir.join("copy2mapr")),
            k8s_dir,
        }
    }

    /// Layout read from `MAPRFS_INSTALL_DIR` / `MAPRFS_COPY_DIR`.
    pub fn from_env() -> Self {
        let install = std::env::var("MAPRFS_INSTALL_DIR")
            .unwrap_or_else(|_| DEFAULT_INSTALL_DIR.to_owned());
        let copy =
            std::env::var("MAPRFS_COPY_DIR").unwrap_or_else(|_| DEFAULT_COPY_DIR.to_owned());
        Self::new(Path::new(&install), Path::new(&copy))
    }

    /// Self-contained layout under `root`: no install hook, no system files.
    pub fn rooted(root: &Path) -> Self {
        let mut layout = Self::new(root, root);
        layout.fusermount_link = root.join("fusermount");
        layout.core_pattern_file = None;
        layout.install_hook = None;
        layout
    }

    pub fn plugin_log(&self) -> PathBuf {
        self.log_dir.join(PLUGIN_LOG_FILE)
    }

    pub fn provisioner_log(&self) -> PathBuf {
        self.log_dir.join(PROVISIONER_LOG_FILE)
    }
}

// ---------------------------------------------------------------------------
// Mount options
// ---------------------------------------------------------------------------

/// Flags handed to the mount daemon unless the caller overrides them.
pub const DEFAULT_FUSE_FLAGS: &str = "-o allow_other -o big_writes -o auto_unmount -o async_dio -o max_background=64 -o auto_inval_data --disable_writeback";

/// Option map exactly as the orchestrator sends it.
#[derive(Debug, Default, Deserialize)]
struct RawMountOptions {
    #[serde(default)]
    cluster: String,
    #[serde(rename = "cldbHosts", default)]
    cldb_hosts: String,
    #[serde(rename = "securityType", default)]
    security_type: String,
    #[serde(rename = "ticketSecretName", default)]
    ticket_secret_name: String,
    #[serde(rename = "ticketSecretNamespace", default)]
    ticket_secret_namespace: String,
    #[serde(rename = "readOnly", default)]
    read_only: String,
    #[serde(rename = "mountOptions", default)]
    mount_options: String,
    #[serde(default)]
    platinum: String,
    #[serde(rename = "volumePath", default)]
    volume_path: String,
    #[serde(rename = "kubernetes.io/readwrite", default)]
    access_mode: String,
    #[serde(flatten)]
    other: BTreeMap<String, serde_json::Value>,
}

/// Validated mount configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub cluster: String,
    /// Raw, space separated CLDB endpoint list.
    pub cldb_hosts: String,
    pub security: SecurityType,
    /// `securityType` exactly as given, handed on to the mount daemon.
    pub security_type: String,
    /// Ticket secret; always `Some` for secure clusters.
    pub ticket_secret: Option<SecretRef>,
    /// Mount read-only: access mode other than `rw`, or `readOnly=true`.
    pub read_only: bool,
    /// Wholesale replacement for [`DEFAULT_FUSE_FLAGS`].
    pub mount_options: Option<String>,
    pub platinum: bool,
    /// Subpath inside the cluster, always starting with `/`.
    pub volume_path: String,
    /// Keys that are neither recognised nor `kubernetes.io/*`.
    pub unrecognized: Vec<String>,
}

impl MountOptions {
    /// Parse and validate the orchestrator's JSON option map.
    pub fn from_json(json: &str) -> Result<Self, MaprError> {
        let raw: RawMountOptions = serde_json::from_str(json)
            .map_err(|e| MaprError::invalid(format!("malformed mount options: {e}")))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawMountOptions) -> Result<Self, MaprError> {
        let cluster = raw.cluster.trim().to_owned();
        let cldb_hosts = raw.cldb_hosts.trim().to_owned();
        if cluster.is_empty() || cldb_hosts.is_empty() {
            return Err(MaprError::invalid("must specify a cluster and cldbHosts"));
        }

        let security = SecurityType::from(raw.security_type.as_str());
        let ticket_secret = match (
            raw.ticket_secret_name.trim(),
            raw.ticket_secret_namespace.trim(),
        ) {
            ("", _) | (_, "") => None,
            (name, namespace) => Some(SecretRef::new(name, namespace)),
        };
        if security.is_secure() && ticket_secret.is_none() {
            return Err(MaprError::invalid(
                "secure clusters need ticketSecretName and ticketSecretNamespace",
            ));
        }

        let unrecognized: Vec<String> = raw
            .other
            .into_keys()
            .filter(|k| !k.starts_with("kubernetes.io/"))
            .collect();
        for key in &unrecognized {
            warn!(%key, "unrecognized mount option ignored");
        }

        let volume_path = match raw.volume_path.trim() {
            "" => {
                warn!("no volumePath given, mounting cluster root");
                "/".to_owned()
            }
            p if p.starts_with('/') => p.to_owned(),
            p => format!("/{p}"),
        };

        let mount_options = Some(raw.mount_options.trim().to_owned()).filter(|s| !s.is_empty());

        Ok(Self {
            cluster,
            cldb_hosts,
            security,
            security_type: raw.security_type,
            ticket_secret,
            read_only: raw.access_mode != "rw" || raw.read_only == "true",
            mount_options,
            platinum: raw.platinum == "true",
            volume_path,
            unrecognized,
        })
    }

    /// Option string for the mount daemon.
    pub fn fuse_flags(&self) -> String {
        let mut flags = self
            .mount_options
            .clone()
            .unwrap_or_else(|| DEFAULT_FUSE_FLAGS.to_owned());
        if self.read_only {
            flags.push_str(" -o ro");
        }
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"{
        "cluster": "my.cluster.com",
        "cldbHosts": "cldb1 cldb2:9999",
        "kubernetes.io/readwrite": "rw",
        "kubernetes.io/pod.name": "web-0"
    }"#;

    #[test]
    fn parse_basic_options() {
        let opts = MountOptions::from_json(BASIC).unwrap();
        assert_eq!(opts.cluster, "my.cluster.com");
        assert_eq!(opts.security, SecurityType::Unsecure);
        assert!(!opts.read_only);
        assert_eq!(opts.volume_path, "/");
        assert!(opts.unrecognized.is_empty());
        assert_eq!(opts.fuse_flags(), DEFAULT_FUSE_FLAGS);
    }

    #[test]
    fn missing_cluster_or_cldb_is_invalid() {
        for json in [
            r#"{"cldbHosts": "cldb1"}"#,
            r#"{"cluster": "c1"}"#,
            r#"{"cluster": " ", "cldbHosts": "cldb1"}"#,
        ] {
            let err = MountOptions::from_json(json).unwrap_err();
            assert!(matches!(err, MaprError::InvalidRequest(_)), "{json}");
        }
    }

    #[test]
    fn secure_requires_both_secret_fields() {
        let json = r#"{"cluster":"c","cldbHosts":"h","securityType":"secure","ticketSecretName":"t"}"#;
        assert!(matches!(
            MountOptions::from_json(json),
            Err(MaprError::InvalidRequest(_))
        ));

        let json = r#"{"cluster":"c","cldbHosts":"h","securityType":"secure",
            "ticketSecretName":"t","ticketSecretNamespace":"ns"}"#;
        let opts = MountOptions::from_json(json).unwrap();
        assert_eq!(opts.ticket_secret, Some(SecretRef::new("t", "ns")));
    }

    #[test]
    fn security_type_is_kept_verbatim() {
        let opts = MountOptions::from_json(r#"{"cluster":"c","cldbHosts":"h"}"#).unwrap();
        assert_eq!(opts.security_type, "");
        assert_eq!(opts.security, SecurityType::Unsecure);

        let json = r#"{"cluster":"c","cldbHosts":"h","securityType":"kerberos"}"#;
        let opts = MountOptions::from_json(json).unwrap();
        assert_eq!(opts.security_type, "kerberos");
        assert_eq!(opts.security, SecurityType::Unsecure);
    }

    #[test]
    fn read_only_unless_rw() {
        let opts = MountOptions::from_json(r#"{"cluster":"c","cldbHosts":"h"}"#).unwrap();
        assert!(opts.read_only);
        assert!(opts.fuse_flags().ends_with(" -o ro"));

        let json = r#"{"cluster":"c","cldbHosts":"h","kubernetes.io/readwrite":"rw","readOnly":"true"}"#;
        assert!(MountOptions::from_json(json).unwrap().read_only);
    }

    #[test]
    fn mount_options_override_defaults() {
        let json = r#"{"cluster":"c","cldbHosts":"h","kubernetes.io/readwrite":"rw",
            "mountOptions":"-o allow_other","platinum":"true","volumePath":"apps/data"}"#;
        let opts = MountOptions::from_json(json).unwrap();
        assert_eq!(opts.fuse_flags(), "-o allow_other");
        assert!(opts.platinum);
        assert_eq!(opts.volume_path, "/apps/data");
    }

    #[test]
    fn unknown_keys_are_reported() {
        let json = r#"{"cluster":"c","cldbHosts":"h","replication":"3"}"#;
        let opts = MountOptions::from_json(json).unwrap();
        assert_eq!(opts.unrecognized, vec!["replication".to_owned()]);
    }

    #[test]
    fn malformed_json_is_invalid() {
        assert!(matches!(
            MountOptions::from_json("not json"),
            Err(MaprError::InvalidRequest(_))
        ));
    }

    #[test]
    fn rooted_layout_stays_under_root() {
        let layout = Layout::rooted(Path::new("/tmp/x"));
        assert_eq!(layout.mounts_dir, Path::new("/tmp/x/k8s/mounts"));
        assert_eq!(layout.support_dir, Path::new("/tmp/x/k8s/support"));
        assert!(layout.install_hook.is_none());
        assert!(layout.core_pattern_file.is_none());
    }
}
