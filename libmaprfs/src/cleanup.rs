//! Reversal of a mount: bind, staging mount, daemon process, support record.
//!
//! [`CleanupSequencer::release`] attempts every step regardless of earlier
//! failures and reports once.  [`CleanupSequencer::sweep`] runs the same
//! sequence for every support record left on disk by a previous crash.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, info, instrument, warn};

use crate::bind::Mounter;
use crate::error::MaprError;
use crate::state::MountStateStore;
use crate::types::{KubePath, MountKey};

/// Time a daemon gets between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(3);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of a crash-recovery sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Keys whose release completed.
    pub released: Vec<MountKey>,
    /// Keys whose release left something behind.
    pub failed: Vec<(MountKey, MaprError)>,
    /// Support records without a usable kernel path.
    pub skipped: Vec<PathBuf>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

pub struct CleanupSequencer<'a> {
    store: &'a MountStateStore,
    mounter: &'a dyn Mounter,
    grace: Duration,
}

impl<'a> CleanupSequencer<'a> {
    pub fn new(store: &'a MountStateStore, mounter: &'a dyn Mounter) -> Self {
        Self {
            store,
            mounter,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Undo every trace of the mount at `kpath`.  Absent pieces are skipped
    /// silently, so releasing a never-mounted path succeeds.
    #[instrument(skip_all, fields(kpath = %kpath))]
    pub async fn release(&self, kpath: &KubePath) -> Result<(), MaprError> {
        let key = kpath.key();
        let mut failed = Vec::new();

        // ---- bind target ----
        if let Err(e) = self.unmount_and_remove(kpath.path()).await {
            warn!(error = %e, "cannot release bind target");
            failed.push(format!("target {}: {e}", kpath));
        }

        // ---- staging mount ----
        let staging = self.store.staging_path(key);
        if let Err(e) = self.unmount_and_remove(&staging).await {
            warn!(error = %e, staging = %staging.display(), "cannot release staging mount");
            failed.push(format!("staging {}: {e}", staging.display()));
        }

        // ---- mount daemon ----
        let record = self.store.record(key);
        match record.read_pid().await {
            Ok(Some(pid)) if !process_serves(pid, &[staging.as_path(), record.dir()]) => {
                info!(pid, "recorded pid belongs to another process, daemon already gone");
            }
            Ok(Some(pid)) => {
                if let Err(e) = reclaim_process(pid, self.grace).await {
                    warn!(pid, error = %e, "cannot stop mount daemon");
                    failed.push(format!("daemon {pid}: {e}"));
                }
            }
            Ok(None) => debug!("no daemon pid recorded"),
            Err(e) => {
                warn!(error = %e, "cannot read daemon pid");
                failed.push(e.to_string());
            }
        }

        // ---- support record ----
        if let Err(e) = record.remove().await {
            warn!(error = %e, support = %record.dir().display(), "cannot remove support record");
            failed.push(format!("support {}: {e}", record.dir().display()));
        }

        if failed.is_empty() {
            info!("mount released");
            Ok(())
        } else {
            Err(MaprError::UnmountPartialFailure {
                path: kpath.to_string(),
                failed,
            })
        }
    }

    /// Force-unmount `path` if it is a mount point, then remove the empty
    /// directory.  Never recursive: a path that is still mounted would expose
    /// remote data to the removal.
    async fn unmount_and_remove(&self, path: &Path) -> Result<(), String> {
        // lstat, so a dead FUSE mount (ENOTCONN) still counts as present.
        match tokio::fs::symlink_metadata(path).await {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "already gone");
                return Ok(());
            }
            _ => {}
        }

        if self.mounter.is_mounted(path) {
            debug!(path = %path.display(), "force unmounting");
            self.mounter
                .force_unmount(path)
                .map_err(|e| format!("umount: {e}"))?;
        }

        match tokio::fs::remove_dir(path).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(format!("remove: {e}")),
            _ => Ok(()),
        }
    }

    /// Release every mount recorded on disk.  Failures are reported, never
    /// raised.
    #[instrument(skip_all)]
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let records = match self.store.scan().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "cannot scan support records");
                return report;
            }
        };

        for record in records {
            let kpath = match record.read_kpath().await.and_then(|raw| KubePath::parse(&raw)) {
                Ok(kpath) => kpath,
                Err(e) => {
                    warn!(support = %record.dir().display(), error = %e, "no usable kpath, skipping");
                    report.skipped.push(record.dir().to_path_buf());
                    continue;
                }
            };

            info!(%kpath, "releasing stale mount");
            let key = kpath.key().clone();
            match self.release(&kpath).await {
                Ok(()) => report.released.push(key),
                Err(e) => report.failed.push((key, e)),
            }
        }

        info!(
            released = report.released.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "recovery sweep finished"
        );
        report
    }
}

// ---------------------------------------------------------------------------
// Process reclamation
// ---------------------------------------------------------------------------

/// Whether `pid` names a running process.  Zombies count as gone: only
/// their parent can reap them.
pub fn process_alive(pid: i32) -> bool {
    let stat = match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat,
        Err(_) => return false,
    };
    // `<pid> (<comm>) <state> ...`, comm may itself contain ')'.
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next());
    !matches!(state, None | Some('Z') | Some('X'))
}

/// Whether the command line of `pid` names one of `paths`, either as a whole
/// argument or as a prefix of a longer path.  A pid recycled since the
/// record was written (after a reboot, say) names neither.
pub fn process_serves(pid: i32, paths: &[&Path]) -> bool {
    let Ok(cmdline) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
        return false;
    };
    cmdline
        .split(|b| *b == 0)
        .map(String::from_utf8_lossy)
        .any(|arg| paths.iter().any(|path| mentions(&arg, &path.to_string_lossy())))
}

fn mentions(arg: &str, path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    arg.match_indices(path).any(|(at, _)| {
        matches!(arg[at + path.len()..].chars().next(), None | Some('/' | ' ' | ','))
    })
}

/// SIGTERM `pid`, wait up to `grace` for it to go away, then SIGKILL.  A
/// process that is already gone is not an error.
#[instrument]
pub async fn reclaim_process(pid: i32, grace: Duration) -> Result<(), MaprError> {
    if pid <= 0 {
        return Err(MaprError::Internal(format!("refusing to signal pid {pid}")));
    }
    let target = Pid::from_raw(pid);

    match signal::kill(target, Signal::SIGTERM) {
        Ok(()) => debug!("sent SIGTERM"),
        Err(Errno::ESRCH) => {
            debug!("daemon already exited");
            return Ok(());
        }
        Err(e) => return Err(MaprError::Internal(format!("SIGTERM pid {pid}: {e}"))),
    }

    if wait_for_exit(pid, grace).await {
        debug!("daemon exited after SIGTERM");
        return Ok(());
    }

    warn!(?grace, "daemon still alive, sending SIGKILL");
    match signal::kill(target, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => return Err(MaprError::Internal(format!("SIGKILL pid {pid}: {e}"))),
    }
    if wait_for_exit(pid, grace).await {
        Ok(())
    } else {
        Err(MaprError::Internal(format!(
            "pid {pid} survived SIGKILL for {grace:?}"
        )))
    }
}

async fn wait_for_exit(pid: i32, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if !process_alive(pid) {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
