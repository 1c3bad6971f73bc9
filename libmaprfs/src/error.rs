//! Error taxonomy for mount lifecycle and volume provisioning.
//!
//! Every failure in `libmaprfs` is a [`MaprError`].  The plugin binary turns
//! it into a one-line JSON failure reply, the provisioner binary reports it
//! to the controller driving it.  Detail that should not reach the caller
//! belongs in the log, not in the variant payload.

use thiserror::Error;

/// Unified error type for the driver and the provisioner.
#[derive(Debug, Error)]
pub enum MaprError {
    /// Missing or contradictory request fields.  Raised before any mutation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The orchestrator path does not follow the
    /// `.../<pod>/volumes/<driver>/<volume>` scheme.
    #[error("unexpected kernel path {path}: {reason}")]
    PathScheme {
        /// Offending path.
        path: String,
        /// What was wrong with it.
        reason: String,
    },

    /// The secret store was unreachable or returned unusable data.
    #[error("credentials unavailable: {0}")]
    CredentialUnavailable(String),

    /// Preparing or launching the FUSE mount daemon failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Path being mounted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// Bind-mounting the staging subpath onto the target failed.
    #[error("bind mount of {source_path} onto {target} failed: {reason}")]
    BindFailed {
        /// Directory inside the staging mount.
        source_path: String,
        /// Orchestrator target path.
        target: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// One or more unmount steps failed.  All steps were still attempted.
    #[error("unmount of {path} incomplete: {}", failed.join("; "))]
    UnmountPartialFailure {
        /// Kernel path being released.
        path: String,
        /// One entry per failed step.
        failed: Vec<String>,
    },

    /// Plugin initialisation could not complete.
    #[error("init failed: {0}")]
    InitFailed(String),

    /// Every control-plane endpoint refused the volume create.
    #[error("cannot create volume {volume}: {reason}")]
    ProvisioningFailed {
        /// Generated volume name.
        volume: String,
        /// Last endpoint failure.
        reason: String,
    },

    /// Every control-plane endpoint refused the volume removal.
    #[error("cannot delete volume {volume}: {reason}")]
    DeletionFailed {
        /// Volume name recovered from the persistent volume.
        volume: String,
        /// Last endpoint failure.
        reason: String,
    },

    /// The persistent volume was not provisioned by this provisioner.
    #[error("ignored: {0}")]
    Ignored(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl MaprError {
    /// Create a [`MaprError::CredentialUnavailable`] from anything that
    /// implements [`std::fmt::Display`].
    pub fn credential<E: std::fmt::Display>(e: E) -> Self {
        Self::CredentialUnavailable(e.to_string())
    }

    /// Create a [`MaprError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// Shorthand for [`MaprError::InvalidRequest`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }
}
