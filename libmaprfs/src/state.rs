//! On-disk record of every active mount.
//!
//! # On-disk layout
//!
//! ```text
//! <mounts_dir>/
//!   <pod>-<vol>/          # staging mount, the daemon attaches the cluster here
//! <support_dir>/
//!   <pod>-<vol>/
//!     kpath               # orchestrator target path, used by crash recovery
//!     fusepid             # written by the mount daemon itself
//!     maprticket_0        # resolved ticket, secure clusters only
//! <log_dir>/
//!   <pod>-<vol>           # per-mount daemon log
//! ```
//!
//! A support record is owned by exactly one mount.  Nothing here locks:
//! the orchestrator serialises operations on the same key.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::Layout;
use crate::error::MaprError;
use crate::types::{KubePath, MountKey};

/// Ticket file name inside a support record.
pub const TICKET_FILE: &str = "maprticket_0";
/// Daemon pid file name inside a support record.
pub const FUSE_PID_FILE: &str = "fusepid";
/// Kernel path cross-reference inside a support record.
pub const KPATH_FILE: &str = "kpath";

/// Paths of the mount state for every key.
#[derive(Debug, Clone)]
pub struct MountStateStore {
    mounts_dir: PathBuf,
    support_dir: PathBuf,
    log_dir: PathBuf,
}

impl MountStateStore {
    pub fn new(layout: &Layout) -> Self {
        Self {
            mounts_dir: layout.mounts_dir.clone(),
            support_dir: layout.support_dir.clone(),
            log_dir: layout.log_dir.clone(),
        }
    }

    /// Staging mountpoint for `key`.
    pub fn staging_path(&self, key: &MountKey) -> PathBuf {
        self.mounts_dir.join(key.to_string())
    }

    /// Support record for `key`, whether or not it exists yet.
    pub fn record(&self, key: &MountKey) -> SupportRecord {
        SupportRecord {
            dir: self.support_dir.join(key.to_string()),
        }
    }

    /// Log file the mount daemon writes for `key`.
    pub fn daemon_log(&self, key: &MountKey) -> PathBuf {
        self.log_dir.join(key.to_string())
    }

    /// Create the staging and support directories for `kpath` and record the
    /// cross-reference.  Pre-existing directories are reused.
    pub async fn prepare(&self, kpath: &KubePath) -> Result<SupportRecord, MaprError> {
        let key = kpath.key();
        let staging = self.staging_path(key);
        let record = self.record(key);

        for dir in [&staging, &record.dir] {
            debug!(path = %dir.display(), "creating directory");
            create_private_dir(dir).await.map_err(|e| MaprError::MountFailed {
                path: dir.display().to_string(),
                reason: format!("create directory: {e}"),
            })?;
        }

        tokio::fs::write(record.kpath_path(), kpath.path().as_os_str().as_encoded_bytes())
            .await
            .map_err(|e| MaprError::MountFailed {
                path: record.dir.display().to_string(),
                reason: format!("record kpath: {e}"),
            })?;

        Ok(record)
    }

    /// Every support record currently on disk.  A missing support root means
    /// there is nothing to scan.
    pub async fn scan(&self) -> Result<Vec<SupportRecord>, MaprError> {
        let mut dir = match tokio::fs::read_dir(&self.support_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.support_dir.display(), "no support records to scan");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(MaprError::Internal(format!(
                    "read_dir {}: {e}",
                    self.support_dir.display()
                )));
            }
        };

        let mut records = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(MaprError::internal)? {
            match entry.file_type().await {
                Ok(ft) if ft.is_dir() => records.push(SupportRecord { dir: entry.path() }),
                Ok(_) => debug!(path = %entry.path().display(), "not a support record, skipping"),
                Err(e) => warn!(path = %entry.path().display(), error = %e, "cannot stat entry, skipping"),
            }
        }
        records.sort_by(|a, b| a.dir.cmp(&b.dir));
        Ok(records)
    }
}

async fn create_private_dir(path: &Path) -> std::io::Result<()> {
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
        .await
}

/// Per-mount bookkeeping directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportRecord {
    dir: PathBuf,
}

impl SupportRecord {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ticket_path(&self) -> PathBuf {
        self.dir.join(TICKET_FILE)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.dir.join(FUSE_PID_FILE)
    }

    pub fn kpath_path(&self) -> PathBuf {
        self.dir.join(KPATH_FILE)
    }

    /// Persist the ticket, readable by the owner only.
    pub async fn write_ticket(&self, ticket: &str) -> Result<(), MaprError> {
        let path = self.ticket_path();
        let write = async {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&path)
                .await?;
            file.write_all(ticket.as_bytes()).await?;
            file.flush().await
        };
        write.await.map_err(|e| MaprError::MountFailed {
            path: path.display().to_string(),
            reason: format!("write ticket: {e}"),
        })
    }

    /// Daemon pid, `None` when the daemon never recorded one.
    pub async fn read_pid(&self) -> Result<Option<i32>, MaprError> {
        let path = self.pid_path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MaprError::Internal(format!("read {}: {e}", path.display()))),
        };
        raw.trim().parse().map(Some).map_err(|e| {
            MaprError::Internal(format!("bad pid {:?} in {}: {e}", raw.trim(), path.display()))
        })
    }

    /// Kernel path this record serves.
    pub async fn read_kpath(&self) -> Result<String, MaprError> {
        let path = self.kpath_path();
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| MaprError::Internal(format!("read {}: {e}", path.display())))?;
        let kpath = raw.trim_end_matches('\n').to_owned();
        if kpath.is_empty() {
            return Err(MaprError::Internal(format!("{} is empty", path.display())));
        }
        Ok(kpath)
    }

    /// Remove the record.  An absent record is not an error.
    pub async fn remove(&self) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
