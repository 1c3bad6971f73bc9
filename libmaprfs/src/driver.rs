//! The plugin operations: `init`, `mount`, `unmount`.
//!
//! [`Driver`] wires the components together.  Each plugin invocation builds
//! one, runs exactly one [`Operation`] and exits.

use std::path::Path;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::bind::{self, KernelMounter, Mounter};
use crate::cleanup::{CleanupSequencer, DEFAULT_GRACE};
use crate::config::{Layout, MountOptions};
use crate::error::MaprError;
use crate::fuse::{FuseStager, MountDaemon, ScriptDaemon};
use crate::reply::DriverReply;
use crate::secret::{NodeSecretStore, SecretStore, ServiceInfo};
use crate::state::MountStateStore;
use crate::types::KubePath;

/// Kernel core pattern installed on fresh install.
pub const CORE_PATTERN: &str = "/opt/cores/%e.core.%p.%h";

/// One plugin invocation, decoded from the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Init,
    Mount { target: String, options: String },
    Unmount { target: String },
    Unsupported(String),
}

impl Operation {
    /// Decode `<op> [args...]`.  Unknown operations, and known ones with
    /// the wrong arity, are unsupported.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Self {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        match args.as_slice() {
            ["init", ..] => Self::Init,
            ["mount", target, options, ..] => Self::Mount {
                target: (*target).to_owned(),
                options: (*options).to_owned(),
            },
            ["unmount", target, ..] => Self::Unmount {
                target: (*target).to_owned(),
            },
            [op, ..] => Self::Unsupported((*op).to_owned()),
            [] => Self::Unsupported(String::new()),
        }
    }
}

pub struct Driver {
    layout: Layout,
    store: MountStateStore,
    daemon: Box<dyn MountDaemon>,
    mounter: Box<dyn Mounter>,
    secrets: Box<dyn SecretStore>,
    grace: Duration,
}

impl Driver {
    pub fn new(
        layout: Layout,
        daemon: Box<dyn MountDaemon>,
        mounter: Box<dyn Mounter>,
        secrets: Box<dyn SecretStore>,
    ) -> Self {
        Self {
            store: MountStateStore::new(&layout),
            layout,
            daemon,
            mounter,
            secrets,
            grace: DEFAULT_GRACE,
        }
    }

    /// Driver for a real node: launcher script, kernel mounts and the API
    /// server recorded at init.
    pub fn for_node(layout: Layout) -> Self {
        let daemon = ScriptDaemon::new(&layout.fuse_script);
        let secrets = NodeSecretStore::new(&layout.info_file);
        Self::new(layout, Box::new(daemon), Box::new(KernelMounter), Box::new(secrets))
    }

    /// Time a mount daemon gets to exit after SIGTERM.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Run `op` and turn the outcome into the plugin reply.
    pub async fn handle(&self, op: Operation) -> DriverReply {
        match op {
            Operation::Init => match self.init().await {
                Ok(()) => DriverReply::initialized(),
                Err(e) => e.into(),
            },
            Operation::Mount { target, options } => self.mount(&target, &options).await.into(),
            Operation::Unmount { target } => self.unmount(&target).await.into(),
            Operation::Unsupported(op) => {
                info!(%op, "operation not supported");
                DriverReply::not_supported()
            }
        }
    }

    fn cleaner(&self) -> CleanupSequencer<'_> {
        CleanupSequencer::new(&self.store, self.mounter.as_ref()).with_grace(self.grace)
    }

    // -----------------------------------------------------------------------
    // init
    // -----------------------------------------------------------------------

    /// Prepare the node.  A fresh install (no marker) reclaims every stale
    /// mount; a reinstall of the same version keeps them and consumes the
    /// marker.
    #[instrument(skip(self))]
    pub async fn init(&self) -> Result<(), MaprError> {
        info!("=== starting init of MapR-FS plugin ===");
        if let Some(hook) = &self.layout.install_hook {
            run_install_hook(hook).await?;
        }

        match tokio::fs::metadata(&self.layout.save_file).await {
            Ok(_) => {
                info!("reinstalling same plugin version, preserving running mounts");
                if let Err(e) = tokio::fs::remove_file(&self.layout.save_file).await {
                    warn!(error = %e, path = %self.layout.save_file.display(), "cannot remove save file");
                }
            }
            Err(_) => self.fresh_install().await?,
        }

        info!("=== finished init of MapR-FS plugin ===");
        Ok(())
    }

    async fn fresh_install(&self) -> Result<(), MaprError> {
        let report = self.cleaner().sweep().await;
        for (key, e) in &report.failed {
            warn!(%key, error = %e, "stale mount not fully released");
        }

        self.link_fusermount().await;

        tokio::fs::create_dir_all(&self.layout.k8s_dir)
            .await
            .map_err(|e| init_failed(&self.layout.k8s_dir, e))?;

        let fqdn = node_fqdn().await;
        info!(%fqdn, path = %self.layout.hostname_file.display(), "setting hostname");
        write_private(&self.layout.hostname_file, format!("{fqdn}\n").as_bytes())
            .await
            .map_err(|e| init_failed(&self.layout.hostname_file, e))?;

        if let Some(pattern_file) = &self.layout.core_pattern_file {
            info!("setting core pattern");
            tokio::fs::write(pattern_file, CORE_PATTERN)
                .await
                .map_err(|e| init_failed(pattern_file, e))?;
        }

        match ServiceInfo::from_env() {
            Some(service) => {
                info!(api_server = %service, "recording API server address");
                service.store(&self.layout.info_file).await?;
            }
            None => warn!("KUBERNETES_SERVICE_HOST/PORT unset, secure mounts need an existing service info record"),
        }
        Ok(())
    }

    async fn link_fusermount(&self) {
        let (from, to) = (&self.layout.fusermount_source, &self.layout.fusermount_link);
        match tokio::fs::symlink(from, to).await {
            Ok(()) => info!(from = %from.display(), to = %to.display(), "linked fusermount"),
            Err(e) => info!(from = %from.display(), to = %to.display(), reason = %e, "will not link fusermount"),
        }
    }

    // -----------------------------------------------------------------------
    // mount / unmount
    // -----------------------------------------------------------------------

    /// Attach the cluster and bind the requested subpath onto `target`.
    /// Options are fully validated before anything is created.
    #[instrument(skip(self, options_json))]
    pub async fn mount(&self, target: &str, options_json: &str) -> Result<(), MaprError> {
        info!("=== starting new mount ===");
        let kpath = KubePath::parse(target)?;
        let opts = MountOptions::from_json(options_json)?;

        let staging = FuseStager::new(
            &self.store,
            self.daemon.as_ref(),
            self.mounter.as_ref(),
            self.secrets.as_ref(),
        )
        .attach(&kpath, &opts)
        .await?;
        bind::bind_volume(
            self.mounter.as_ref(),
            &staging,
            &opts.cluster,
            &opts.volume_path,
            kpath.path(),
        )
        .await?;

        info!("=== successfully mounted ===");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn unmount(&self, target: &str) -> Result<(), MaprError> {
        info!("=== starting unmount ===");
        let kpath = KubePath::parse(target)?;
        self.cleaner().release(&kpath).await?;
        info!("=== successfully unmounted ===");
        Ok(())
    }
}

fn init_failed(path: &Path, e: impl std::fmt::Display) -> MaprError {
    MaprError::InitFailed(format!("{}: {e}", path.display()))
}

async fn run_install_hook(hook: &Path) -> Result<(), MaprError> {
    info!(hook = %hook.display(), "running second stage copy");
    let output = tokio::process::Command::new(hook)
        .output()
        .await
        .map_err(|e| MaprError::InitFailed(format!("second stage copy {}: {e}", hook.display())))?;
    if !output.status.success() {
        return Err(MaprError::InitFailed(format!(
            "second stage copy {} exited with {}: {}",
            hook.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// `hostname --fqdn`, falling back to the kernel hostname when name
/// resolution is unavailable.
async fn node_fqdn() -> String {
    let fqdn = tokio::process::Command::new("hostname")
        .arg("--fqdn")
        .output()
        .await
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_owned())
        .filter(|name| !name.is_empty());
    if let Some(fqdn) = fqdn {
        return fqdn;
    }
    warn!("hostname --fqdn failed, using kernel hostname");
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_owned())
}

async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await?;
    file.write_all(contents).await?;
    file.flush().await
}
