//! Naming and sizing of a freshly provisioned volume.

use std::collections::BTreeMap;

use rand::Rng;

use super::params::VolumeParams;
use crate::types::ReclaimPolicy;

/// Length of the random suffix shared by the PV and volume names.
pub const RANDOM_SUFFIX_LEN: usize = 10;

const BYTES_PER_MB: u64 = 1_000_000;

/// Control-plane quota for a requested capacity in bytes: whole decimal
/// megabytes, truncated, suffixed `M`.
pub fn convert_capacity(bytes: u64) -> String {
    format!("{}M", bytes / BYTES_PER_MB)
}

/// `len` random lowercase ASCII letters.  Uniqueness rests on the
/// 26^len space alone; nothing checks the cluster for collisions.
pub fn random_suffix(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| char::from(rng.random_range(b'a'..=b'z')))
        .collect()
}

/// Everything generated for one provisioning call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    /// `{prefix}-{suffix}`, the persistent volume name.
    pub pv_name: String,
    /// `{prefix}.{suffix}`, the control-plane volume name.
    pub name: String,
    /// `{mountPrefix}/{pv_name}`, the junction path in the cluster.
    pub path: String,
    pub quota: String,
    pub platinum: String,
    pub read_only: String,
    pub mount_options: String,
    pub reclaim_policy: ReclaimPolicy,
}

impl VolumeInfo {
    pub fn generate(params: &VolumeParams, capacity_bytes: u64) -> Self {
        Self::with_suffix(params, capacity_bytes, &random_suffix(RANDOM_SUFFIX_LEN))
    }

    fn with_suffix(params: &VolumeParams, capacity_bytes: u64, suffix: &str) -> Self {
        let pv_name = format!("{}-{suffix}", params.name_prefix);
        Self {
            name: format!("{}.{suffix}", params.name_prefix),
            path: format!("{}/{pv_name}", params.mount_prefix),
            pv_name,
            quota: convert_capacity(capacity_bytes),
            platinum: params.platinum.clone(),
            read_only: params.read_only.clone(),
            mount_options: params.mount_options.clone(),
            reclaim_policy: params.reclaim_policy,
        }
    }

    /// Full `volume/create` query: pass-through parameters plus the
    /// generated identity.  Parents are always created and the volume is
    /// always mounted, whatever the class asked for.
    pub fn create_query(&self, passthrough: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut query = passthrough.clone();
        query.insert("name".into(), self.name.clone());
        query.insert("path".into(), self.path.clone());
        query.insert("quota".into(), self.quota.clone());
        query.insert("createparent".into(), "1".into());
        query.insert("mount".into(), "1".into());
        query
    }
}
