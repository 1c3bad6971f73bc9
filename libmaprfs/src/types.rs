//! Core types: mount identity, kernel paths, security and access modes.
//!
//! The orchestrator hands the driver a target ("kernel") path of the form
//! `.../pods/<pod-uid>/volumes/<driver>/<volume-name>`.  Everything the
//! driver keeps on disk for that mount is keyed by `<pod-uid>-<volume-name>`,
//! so the path scheme is a structural contract with the caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::MaprError;

// ---------------------------------------------------------------------------
// Mount identity
// ---------------------------------------------------------------------------

/// Identity of one volume attachment: the pod and the volume it serves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MountKey {
    /// Pod UID (fourth segment from the end of the kernel path).
    pub pod_id: String,
    /// Volume name (last segment of the kernel path).
    pub volume_id: String,
}

impl fmt::Display for MountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.pod_id, self.volume_id)
    }
}

/// An orchestrator-assigned target path together with the identity it encodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubePath {
    path: PathBuf,
    key: MountKey,
}

impl KubePath {
    /// Offset of the pod segment counted from the end of the path.
    const POD_OFFSET: usize = 4;

    /// Parse a kernel path, extracting the pod and volume identifiers.
    ///
    /// Fails with [`MaprError::PathScheme`] when the path has fewer than four
    /// segments or either identifier is empty.  A trailing `/` is ignored.
    pub fn parse(raw: &str) -> Result<Self, MaprError> {
        let scheme_err = |reason: &str| MaprError::PathScheme {
            path: raw.to_owned(),
            reason: reason.to_owned(),
        };

        let trimmed = raw.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(scheme_err("empty path"));
        }

        let segments: Vec<&str> = trimmed.split('/').collect();
        if segments.len() < Self::POD_OFFSET {
            return Err(scheme_err(
                "expected <pod>/volumes/<driver>/<volume> as trailing segments",
            ));
        }

        let pod_id = segments[segments.len() - Self::POD_OFFSET];
        let volume_id = segments[segments.len() - 1];
        if pod_id.is_empty() || volume_id.is_empty() {
            return Err(scheme_err("empty pod or volume segment"));
        }

        Ok(Self {
            path: PathBuf::from(trimmed),
            key: MountKey {
                pod_id: pod_id.to_owned(),
                volume_id: volume_id.to_owned(),
            },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &MountKey {
        &self.key
    }
}

impl fmt::Display for KubePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

// ---------------------------------------------------------------------------
// Security & access modes
// ---------------------------------------------------------------------------

/// Cluster security mode.  Only the literal `secure` enables tickets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecurityType {
    Secure,
    #[default]
    Unsecure,
}

impl SecurityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Secure => "secure",
            Self::Unsecure => "unsecure",
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Self::Secure)
    }
}

impl From<&str> for SecurityType {
    fn from(s: &str) -> Self {
        if s == "secure" {
            Self::Secure
        } else {
            Self::Unsecure
        }
    }
}

impl fmt::Display for SecurityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Describes how a persistent volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Single-node read-write.
    ReadWriteOnce,
    /// Multi-node read-only.
    ReadOnlyMany,
    /// Multi-node read-write.
    ReadWriteMany,
}

/// What happens to the backing volume once its claim is released.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReclaimPolicy {
    #[default]
    Delete,
    Retain,
}

impl ReclaimPolicy {
    /// Only the literal `Retain` retains; anything else deletes.
    pub fn from_param(value: Option<&str>) -> Self {
        match value {
            Some("Retain") => Self::Retain,
            _ => Self::Delete,
        }
    }
}
