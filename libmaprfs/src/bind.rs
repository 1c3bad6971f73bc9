//! Kernel mount operations and the bind of a staging subpath onto the
//! orchestrator target.

use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags};
use tracing::{debug, info, instrument};

use crate::error::MaprError;
use crate::fuse::volume_source;

/// Kernel mount table operations.
pub trait Mounter: Send + Sync {
    /// Whether `path` is currently a mount point.
    fn is_mounted(&self, path: &Path) -> bool;

    /// Bind-mount `source` onto `target`.
    fn bind(&self, source: &Path, target: &Path) -> nix::Result<()>;

    /// Forcibly unmount `target`.
    fn force_unmount(&self, target: &Path) -> nix::Result<()>;
}

/// [`Mounter`] issuing real syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelMounter;

impl Mounter for KernelMounter {
    fn is_mounted(&self, path: &Path) -> bool {
        let contents = match std::fs::read_to_string("/proc/self/mounts") {
            Ok(c) => c,
            Err(_) => return false,
        };
        mount_table_contains(&contents, path)
    }

    fn bind(&self, source: &Path, target: &Path) -> nix::Result<()> {
        nix::mount::mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
    }

    fn force_unmount(&self, target: &Path) -> nix::Result<()> {
        nix::mount::umount2(target, MntFlags::MNT_FORCE)
    }
}

/// Whether a `/proc/self/mounts` style table lists `path` as a mount point.
///
/// Format: `<device> <mountpoint> <fstype> <options> <dump> <pass>`, with
/// whitespace and backslashes in the mount point octal-escaped.
pub fn mount_table_contains(table: &str, path: &Path) -> bool {
    let wanted = path.as_os_str().as_encoded_bytes();
    table
        .lines()
        .filter_map(|line| line.split(' ').nth(1))
        .any(|field| unescape_mount_field(field) == wanted)
}

fn unescape_mount_field(field: &str) -> Vec<u8> {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 4 <= bytes.len()
            && let Some(code) = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok())
        {
            out.push(code);
            i += 4;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Bind `<staging>/<cluster>/<volume_path>` onto `target`, creating the
/// source directory when absent.  The target is expected to exist.  Nothing
/// is rolled back on failure: the orchestrator retries with an unmount.
#[instrument(skip(mounter))]
pub async fn bind_volume(
    mounter: &dyn Mounter,
    staging: &Path,
    cluster: &str,
    volume_path: &str,
    target: &Path,
) -> Result<PathBuf, MaprError> {
    let source = volume_source(staging, cluster, volume_path);
    let bind_failed = |reason: String| MaprError::BindFailed {
        source_path: source.display().to_string(),
        target: target.display().to_string(),
        reason,
    };

    debug!(source = %source.display(), "creating bind mount directory");
    tokio::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(&source)
        .await
        .map_err(|e| bind_failed(format!("create source: {e}")))?;

    if mounter.is_mounted(target) {
        debug!(target = %target.display(), "target already mounted, assuming idempotent retry");
        return Ok(source);
    }

    mounter
        .bind(&source, target)
        .map_err(|e| bind_failed(e.to_string()))?;

    info!(source = %source.display(), target = %target.display(), "bind mount created");
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeMounter {
        mounted: Mutex<Vec<PathBuf>>,
        fail_bind: bool,
    }

    impl Mounter for FakeMounter {
        fn is_mounted(&self, path: &Path) -> bool {
            self.mounted.lock().unwrap().iter().any(|p| p == path)
        }

        fn bind(&self, _source: &Path, target: &Path) -> nix::Result<()> {
            if self.fail_bind {
                return Err(nix::errno::Errno::EPERM);
            }
            self.mounted.lock().unwrap().push(target.to_path_buf());
            Ok(())
        }

        fn force_unmount(&self, target: &Path) -> nix::Result<()> {
            self.mounted.lock().unwrap().retain(|p| p != target);
            Ok(())
        }
    }

    #[test]
    fn mount_table_lookup() {
        let table = "\
proc /proc proc rw,nosuid 0 0
/dev/fuse /opt/mapr/k8s/mounts/p-v fuse.posix-client rw 0 0
tmpfs /var/lib/kubelet/pods/p/volumes/my\\040vol tmpfs rw 0 0
";
        assert!(mount_table_contains(table, Path::new("/opt/mapr/k8s/mounts/p-v")));
        assert!(mount_table_contains(
            table,
            Path::new("/var/lib/kubelet/pods/p/volumes/my vol")
        ));
        assert!(!mount_table_contains(table, Path::new("/opt/mapr/k8s/mounts")));
    }

    #[tokio::test]
    async fn bind_creates_source_and_mounts() {
        let tmp = tempfile::tempdir().unwrap();
        let staging = tmp.path().join("mounts/p-v");
        let target = tmp.path().join("target");
        let mounter = FakeMounter::default();

        let source = bind_volume(&mounter, &staging, "c1", "/apps", &target)
            .await
            .unwrap();
        assert_eq!(source, staging.join("c1/apps"));
        assert!(source.is_dir());
        assert!(mounter.is_mounted(&target));

        // A retry on an already mounted target is a no-op.
        bind_volume(&mounter, &staging, "c1", "/apps", &target)
            .await
            .unwrap();
        assert_eq!(mounter.mounted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bind_failure_is_typed() {
        let tmp = tempfile::tempdir().unwrap();
        let mounter = FakeMounter {
            fail_bind: true,
            ..Default::default()
        };
        let err = bind_volume(
            &mounter,
            &tmp.path().join("staging"),
            "c1",
            "/",
            &tmp.path().join("target"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MaprError::BindFailed { .. }));
    }
}
