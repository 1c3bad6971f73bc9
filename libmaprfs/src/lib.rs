//! # libmaprfs: MapR-FS volumes for Kubernetes
//!
//! `libmaprfs` carries the two halves of the MapR-FS storage integration:
//! the node-side **flexvolume driver**, which attaches a cluster through the
//! FUSE client and binds it into pods, and the **provisioner**, which
//! creates and removes cluster volumes through the control-plane REST API.
//! Everything async runs on Tokio and logs through `tracing`.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Kernel path scheme, mount keys, access modes, policies. |
//! | [`error`] | [`MaprError`] enum covering all failure modes. |
//! | [`config`] | Fixed on-disk [`Layout`] and typed [`MountOptions`]. |
//! | [`secret`] | [`SecretStore`] trait, ticket and admin login resolution. |
//! | [`state`] | Per-mount support records on disk. |
//! | [`fuse`] | Staging mounts through the opaque mount daemon. |
//! | [`bind`] | [`Mounter`] trait, bind of the volume subpath onto the pod. |
//! | [`cleanup`] | Unmount sequence and crash-recovery sweep. |
//! | [`reply`] | JSON reply envelope of the driver. |
//! | [`driver`] | `init` / `mount` / `unmount` entry points. |
//! | [`provisioner`] | Storage-class parameters, REST client, PV records. |

pub mod bind;
pub mod cleanup;
pub mod config;
pub mod driver;
pub mod error;
pub mod fuse;
pub mod provisioner;
pub mod reply;
pub mod secret;
pub mod state;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use bind::{KernelMounter, Mounter};
pub use config::{Layout, MountOptions};
pub use driver::{Driver, Operation};
pub use error::MaprError;
pub use fuse::{MountDaemon, ScriptDaemon};
pub use provisioner::{PersistentVolume, ProvisionRequest, Provisioner};
pub use reply::DriverReply;
pub use secret::{KubeSecretStore, SecretRef, SecretStore};
pub use types::*;
