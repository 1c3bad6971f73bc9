//! Attaching the cluster at a local staging path through the mount daemon.
//!
//! The daemon (`start-fuse`) is opaque: it is handed a fixed positional
//! argument list, forks the FUSE client and records the client pid in the
//! support record.  Nothing here tracks that process beyond the pid file.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::bind::Mounter;
use crate::config::MountOptions;
use crate::error::MaprError;
use crate::secret::{self, SecretStore};
use crate::state::MountStateStore;
use crate::types::{KubePath, SecurityType};

/// Port appended to CLDB endpoints that do not name one.
pub const CLDB_DEFAULT_PORT: u16 = 7222;

/// Append the default port to every endpoint lacking one.  Every endpoint,
/// including the last, is followed by a single space.
pub fn normalize_cldb_hosts(raw: &str) -> String {
    raw.split_whitespace()
        .map(|host| {
            if host.contains(':') {
                format!("{host} ")
            } else {
                format!("{host}:{CLDB_DEFAULT_PORT} ")
            }
        })
        .collect()
}

/// Cluster configuration line handed to the daemon.
pub fn cluster_conf_line(cluster: &str, secure: bool, cldb_list: &str) -> String {
    format!("{cluster} secure={secure} {cldb_list}")
}

/// Positional arguments of the mount daemon, in invocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonArgs {
    pub staging_path: PathBuf,
    pub support_path: PathBuf,
    pub log_path: PathBuf,
    pub kpath: PathBuf,
    /// Raw `securityType` of the mount request.
    pub security_type: String,
    pub ticket_path: PathBuf,
    pub cluster_conf: String,
    pub platinum: bool,
    pub pod_id: String,
    pub flags: String,
}

impl DaemonArgs {
    pub fn to_argv(&self) -> Vec<OsString> {
        vec![
            self.staging_path.clone().into(),
            self.support_path.clone().into(),
            self.log_path.clone().into(),
            self.kpath.clone().into(),
            self.security_type.clone().into(),
            self.ticket_path.clone().into(),
            self.cluster_conf.clone().into(),
            self.platinum.to_string().into(),
            self.pod_id.clone().into(),
            self.flags.clone().into(),
        ]
    }
}

/// Launches the mount daemon and waits for it to report.
#[async_trait]
pub trait MountDaemon: Send + Sync {
    async fn launch(&self, args: &DaemonArgs) -> Result<(), MaprError>;
}

/// [`MountDaemon`] running an external launcher script.  No timeout: a hung
/// launcher hangs the request until the orchestrator kills the plugin.
#[derive(Debug, Clone)]
pub struct ScriptDaemon {
    script: PathBuf,
}

impl ScriptDaemon {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

#[async_trait]
impl MountDaemon for ScriptDaemon {
    #[instrument(skip_all, fields(script = %self.script.display()))]
    async fn launch(&self, args: &DaemonArgs) -> Result<(), MaprError> {
        let mount_failed = |reason: String| MaprError::MountFailed {
            path: args.kpath.display().to_string(),
            reason,
        };

        debug!(?args, "calling FUSE script");
        let output = tokio::process::Command::new(&self.script)
            .args(args.to_argv())
            .output()
            .await
            .map_err(|e| mount_failed(format!("spawn {}: {e}", self.script.display())))?;

        if !output.status.success() {
            return Err(mount_failed(format!(
                "{} exited with {}: {}",
                self.script.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Attaches the cluster at the staging path of a mount.
pub struct FuseStager<'a> {
    store: &'a MountStateStore,
    daemon: &'a dyn MountDaemon,
    mounter: &'a dyn Mounter,
    secrets: &'a dyn SecretStore,
}

impl<'a> FuseStager<'a> {
    pub fn new(
        store: &'a MountStateStore,
        daemon: &'a dyn MountDaemon,
        mounter: &'a dyn Mounter,
        secrets: &'a dyn SecretStore,
    ) -> Self {
        Self {
            store,
            daemon,
            mounter,
            secrets,
        }
    }

    /// Prepare the support record, resolve credentials and run the daemon.
    /// Returns the staging path.  Options are validated before this is
    /// called, so every failure here is past the first mutation.
    ///
    /// A staging path that is already mounted is reused as is: the daemon
    /// serving it owns `fusepid`, and a second one would orphan it.
    #[instrument(skip_all, fields(kpath = %kpath))]
    pub async fn attach(&self, kpath: &KubePath, opts: &MountOptions) -> Result<PathBuf, MaprError> {
        let key = kpath.key();
        let staging = self.store.staging_path(key);
        if self.mounter.is_mounted(&staging) {
            info!(staging = %staging.display(), "FUSE already attached, reusing it");
            return Ok(staging);
        }
        info!(staging = %staging.display(), "starting FUSE");

        let record = self.store.prepare(kpath).await?;
        let cldb_list = normalize_cldb_hosts(&opts.cldb_hosts);

        let secure = match (&opts.security, &opts.ticket_secret) {
            (SecurityType::Secure, Some(ticket_secret)) => {
                let ticket = secret::resolve_ticket(self.secrets, ticket_secret).await?;
                record.write_ticket(&ticket).await?;
                true
            }
            (SecurityType::Secure, None) => {
                return Err(MaprError::invalid(
                    "secure clusters need ticketSecretName and ticketSecretNamespace",
                ));
            }
            (SecurityType::Unsecure, _) => false,
        };
        let cluster_conf = cluster_conf_line(&opts.cluster, secure, &cldb_list);
        info!(%cluster_conf, read_only = opts.read_only, "creating cluster info");

        let args = DaemonArgs {
            staging_path: staging.clone(),
            support_path: record.dir().to_path_buf(),
            log_path: self.store.daemon_log(key),
            kpath: kpath.path().to_path_buf(),
            security_type: opts.security_type.clone(),
            ticket_path: record.ticket_path(),
            cluster_conf,
            platinum: opts.platinum,
            pod_id: key.pod_id.clone(),
            flags: opts.fuse_flags(),
        };
        self.daemon.launch(&args).await?;

        info!("successfully started FUSE");
        Ok(staging)
    }
}

/// Directory inside the staging mount that backs `volume_path` of `cluster`.
pub fn volume_source(staging: &Path, cluster: &str, volume_path: &str) -> PathBuf {
    let mut source = staging.join(cluster);
    let sub = volume_path.trim_start_matches('/');
    if !sub.is_empty() {
        source.push(sub);
    }
    source
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Layout;
    use crate::secret::{MemorySecretStore, SecretRef, TICKET_KEY};
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;

    /// Records every launch and writes a pid like the real daemon does.
    #[derive(Default)]
    struct RecordingDaemon {
        launches: Mutex<Vec<DaemonArgs>>,
        fail: bool,
    }

    #[async_trait]
    impl MountDaemon for RecordingDaemon {
        async fn launch(&self, args: &DaemonArgs) -> Result<(), MaprError> {
            self.launches.lock().unwrap().push(args.clone());
            if self.fail {
                return Err(MaprError::MountFailed {
                    path: args.kpath.display().to_string(),
                    reason: "exit status: 1".into(),
                });
            }
            std::fs::write(args.support_path.join("fusepid"), "99999\n").unwrap();
            Ok(())
        }
    }

    /// Mount table holding whatever the test puts in it.
    #[derive(Default)]
    struct MountTable(Mutex<Vec<PathBuf>>);

    impl Mounter for MountTable {
        fn is_mounted(&self, path: &Path) -> bool {
            self.0.lock().unwrap().iter().any(|p| p == path)
        }

        fn bind(&self, _source: &Path, target: &Path) -> nix::Result<()> {
            self.0.lock().unwrap().push(target.to_path_buf());
            Ok(())
        }

        fn force_unmount(&self, target: &Path) -> nix::Result<()> {
            self.0.lock().unwrap().retain(|p| p != target);
            Ok(())
        }
    }

    fn kpath(root: &Path) -> KubePath {
        let raw = root.join("pods/pod-a/volumes/mapr.com~maprfs/vol-a");
        KubePath::parse(&raw.display().to_string()).unwrap()
    }

    #[test]
    fn cldb_default_port_only_where_absent() {
        assert_eq!(normalize_cldb_hosts("cldb1 cldb2:9999"), "cldb1:7222 cldb2:9999 ");
        assert_eq!(normalize_cldb_hosts("  cldb1   "), "cldb1:7222 ");
        assert_eq!(normalize_cldb_hosts(""), "");
    }

    #[test]
    fn argv_order_matches_daemon_contract() {
        let args = DaemonArgs {
            staging_path: "/m/p-v".into(),
            support_path: "/s/p-v".into(),
            log_path: "/l/p-v".into(),
            kpath: "/k/pods/p/volumes/d/v".into(),
            security_type: "unsecure".into(),
            ticket_path: "/s/p-v/maprticket_0".into(),
            cluster_conf: "c secure=false h:7222 ".into(),
            platinum: false,
            pod_id: "p".into(),
            flags: "-o ro".into(),
        };
        let argv: Vec<String> = args
            .to_argv()
            .into_iter()
            .map(|s| s.into_string().unwrap())
            .collect();
        assert_eq!(
            argv,
            [
                "/m/p-v",
                "/s/p-v",
                "/l/p-v",
                "/k/pods/p/volumes/d/v",
                "unsecure",
                "/s/p-v/maprticket_0",
                "c secure=false h:7222 ",
                "false",
                "p",
                "-o ro",
            ]
        );
    }

    #[test]
    fn volume_source_joins_subpath() {
        let staging = Path::new("/m/p-v");
        assert_eq!(volume_source(staging, "c1", "/"), Path::new("/m/p-v/c1"));
        assert_eq!(
            volume_source(staging, "c1", "/apps/data"),
            Path::new("/m/p-v/c1/apps/data")
        );
    }

    #[tokio::test]
    async fn attach_unsecure() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MountStateStore::new(&Layout::rooted(tmp.path()));
        let daemon = RecordingDaemon::default();
        let secrets = MemorySecretStore::new();
        let opts = MountOptions::from_json(
            r#"{"cluster":"c1","cldbHosts":"cldb1 cldb2:9999","kubernetes.io/readwrite":"rw"}"#,
        )
        .unwrap();

        let kp = kpath(tmp.path());
        let staging = FuseStager::new(&store, &daemon, &MountTable::default(), &secrets)
            .attach(&kp, &opts)
            .await
            .unwrap();

        assert_eq!(staging, store.staging_path(kp.key()));
        let launches = daemon.launches.lock().unwrap();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].cluster_conf, "c1 secure=false cldb1:7222 cldb2:9999 ");
        assert_eq!(launches[0].pod_id, "pod-a");
        assert_eq!(launches[0].to_argv()[4], "");
        assert!(!store.record(kp.key()).ticket_path().exists());
    }

    #[tokio::test]
    async fn attached_staging_is_not_relaunched() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MountStateStore::new(&Layout::rooted(tmp.path()));
        let daemon = RecordingDaemon::default();
        let mounts = MountTable::default();
        let secrets = MemorySecretStore::new();
        let opts = MountOptions::from_json(r#"{"cluster":"c1","cldbHosts":"cldb1"}"#).unwrap();
        let kp = kpath(tmp.path());
        let stager = FuseStager::new(&store, &daemon, &mounts, &secrets);

        let staging = stager.attach(&kp, &opts).await.unwrap();
        mounts.0.lock().unwrap().push(staging.clone());
        std::fs::write(store.record(kp.key()).pid_path(), "4242\n").unwrap();

        assert_eq!(stager.attach(&kp, &opts).await.unwrap(), staging);
        assert_eq!(daemon.launches.lock().unwrap().len(), 1);
        assert_eq!(
            store.record(kp.key()).read_pid().await.unwrap(),
            Some(4242)
        );
    }

    #[tokio::test]
    async fn attach_secure_writes_ticket() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MountStateStore::new(&Layout::rooted(tmp.path()));
        let daemon = RecordingDaemon::default();
        let mut secrets = MemorySecretStore::new();
        secrets.insert(&SecretRef::new("tkt", "mapr"), [(TICKET_KEY, "c1 TICKETDATA")]);
        let opts = MountOptions::from_json(
            r#"{"cluster":"c1","cldbHosts":"cldb1","securityType":"secure",
                "ticketSecretName":"tkt","ticketSecretNamespace":"mapr"}"#,
        )
        .unwrap();

        let kp = kpath(tmp.path());
        FuseStager::new(&store, &daemon, &MountTable::default(), &secrets)
            .attach(&kp, &opts)
            .await
            .unwrap();

        let record = store.record(kp.key());
        assert_eq!(
            std::fs::read_to_string(record.ticket_path()).unwrap(),
            "c1 TICKETDATA"
        );
        let launches = daemon.launches.lock().unwrap();
        assert_eq!(launches[0].cluster_conf, "c1 secure=true cldb1:7222 ");
        assert_eq!(launches[0].security_type, "secure");
        assert!(launches[0].flags.ends_with(" -o ro"));
    }

    #[tokio::test]
    async fn attach_secure_without_secret_never_launches() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MountStateStore::new(&Layout::rooted(tmp.path()));
        let daemon = RecordingDaemon::default();
        let secrets = MemorySecretStore::new();
        let opts = MountOptions::from_json(
            r#"{"cluster":"c1","cldbHosts":"cldb1","securityType":"secure",
                "ticketSecretName":"missing","ticketSecretNamespace":"mapr"}"#,
        )
        .unwrap();

        let err = FuseStager::new(&store, &daemon, &MountTable::default(), &secrets)
            .attach(&kpath(tmp.path()), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, MaprError::CredentialUnavailable(_)));
        assert!(daemon.launches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn daemon_failure_is_mount_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let store = MountStateStore::new(&Layout::rooted(tmp.path()));
        let daemon = RecordingDaemon {
            fail: true,
            ..Default::default()
        };
        let secrets = MemorySecretStore::new();
        let opts = MountOptions::from_json(r#"{"cluster":"c1","cldbHosts":"cldb1"}"#).unwrap();

        let err = FuseStager::new(&store, &daemon, &MountTable::default(), &secrets)
            .attach(&kpath(tmp.path()), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, MaprError::MountFailed { .. }));
    }

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("start-fuse");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn script_daemon_passes_arguments() {
        let tmp = tempfile::tempdir().unwrap();
        let support = tmp.path().join("support");
        std::fs::create_dir(&support).unwrap();
        let script = write_script(
            tmp.path(),
            r#"echo "$$" > "$2/fusepid"; printf '%s\n' "$@" > "$2/argv""#,
        );

        let args = DaemonArgs {
            staging_path: tmp.path().join("staging"),
            support_path: support.clone(),
            log_path: tmp.path().join("log"),
            kpath: "/k/pods/p/volumes/d/v".into(),
            security_type: "unsecure".into(),
            ticket_path: support.join("maprticket_0"),
            cluster_conf: "c secure=false h:7222 ".into(),
            platinum: true,
            pod_id: "p".into(),
            flags: "-o allow_other -o ro".into(),
        };
        ScriptDaemon::new(&script).launch(&args).await.unwrap();

        assert!(support.join("fusepid").exists());
        let argv = std::fs::read_to_string(support.join("argv")).unwrap();
        let lines: Vec<&str> = argv.lines().collect();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[6], "c secure=false h:7222 ");
        assert_eq!(lines[7], "true");
        assert_eq!(lines[9], "-o allow_other -o ro");
    }

    #[tokio::test]
    async fn script_daemon_nonzero_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "echo boom >&2; exit 3");
        let args = DaemonArgs {
            staging_path: "/nonexistent/s".into(),
            support_path: "/nonexistent/p".into(),
            log_path: "/nonexistent/l".into(),
            kpath: "/k/pods/p/volumes/d/v".into(),
            security_type: "unsecure".into(),
            ticket_path: "/nonexistent/t".into(),
            cluster_conf: String::new(),
            platinum: false,
            pod_id: "p".into(),
            flags: String::new(),
        };
        let err = ScriptDaemon::new(&script).launch(&args).await.unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, MaprError::MountFailed { .. }));
        assert!(msg.contains("boom"), "{msg}");
    }

    #[tokio::test]
    async fn script_daemon_missing_script() {
        let err = ScriptDaemon::new("/nonexistent/start-fuse")
            .launch(&DaemonArgs {
                staging_path: "/s".into(),
                support_path: "/p".into(),
                log_path: "/l".into(),
                kpath: "/k".into(),
                security_type: String::new(),
                ticket_path: "/t".into(),
                cluster_conf: String::new(),
                platinum: false,
                pod_id: "p".into(),
                flags: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MaprError::MountFailed { .. }));
    }
}
