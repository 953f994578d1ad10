use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::mount::MntFlags;
use sandfs_fs::SandboxFilesystem;
use sandfs_protocol::SandboxError;
use sandfs_protocol::SandboxResult;
use tracing::info;
use tracing::warn;

const UNMOUNT_RETRIES: u32 = 5;
const UNMOUNT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// How long `mount` waits for the kernel to accept the mount before giving
/// up. Longer on platforms whose FUSE stack is known to be slower to come
/// up (macFUSE's kext handshake).
fn mount_ready_timeout() -> Duration {
    if cfg!(target_os = "macos") {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(30)
    }
}

/// A live FUSE mount. Dropping this without calling [`unmount`] still tears
/// the mount down (via `BackgroundSession`'s own `Drop`), but skips the
/// retry/backoff/forced-unmount escalation, so callers should always prefer
/// an explicit `unmount`.
pub struct ReadyHandle {
    mountpoint: PathBuf,
    session: Option<fuser::BackgroundSession>,
}

impl ReadyHandle {
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }
}

/// Removes any stale mount left behind at `mountpoint` by a previous,
/// crashed supervisor, then recreates it as an empty directory.
fn pre_mount_cleanup(mountpoint: &Path) -> SandboxResult<()> {
    if mountpoint.exists() {
        match nix::mount::umount2(mountpoint, MntFlags::MNT_FORCE) {
            Ok(()) | Err(Errno::EINVAL) | Err(Errno::ENOENT) => {}
            Err(err) => {
                warn!(
                    mountpoint = %mountpoint.display(),
                    %err,
                    "best-effort stale unmount failed, continuing anyway"
                );
            }
        }
        fs::remove_dir_all(mountpoint).or_else(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Ok(())
            } else {
                Err(err)
            }
        })?;
    }
    fs::create_dir_all(mountpoint)?;
    Ok(())
}

/// Mounts `filesystem` at `mountpoint`, waiting for the kernel to accept
/// the mount. The blocking FUSE handshake runs on a blocking-pool thread so
/// it never stalls the async runtime.
///
/// If the bound elapses before the mount completes, the handshake keeps
/// running in the background; a reaper task force-unmounts it if it
/// eventually succeeds, so a slow mount can never leak a mounted directory.
pub async fn mount(filesystem: SandboxFilesystem, mountpoint: &Path) -> SandboxResult<ReadyHandle> {
    pre_mount_cleanup(mountpoint)?;

    let mountpoint_owned = mountpoint.to_path_buf();
    let mountpoint_for_task = mountpoint_owned.clone();
    let options = vec![fuser::MountOption::FSName("sandfs".to_string())];

    let mut blocking_task = tokio::task::spawn_blocking(move || {
        fuser::spawn_mount2(filesystem, &mountpoint_for_task, &options)
    });

    match tokio::time::timeout(mount_ready_timeout(), &mut blocking_task).await {
        Ok(Ok(Ok(session))) => {
            info!(mountpoint = %mountpoint_owned.display(), "mount ready");
            Ok(ReadyHandle {
                mountpoint: mountpoint_owned,
                session: Some(session),
            })
        }
        Ok(Ok(Err(io_err))) => Err(SandboxError::MountFailed {
            reason: io_err.to_string(),
        }),
        Ok(Err(join_err)) => Err(SandboxError::MountFailed {
            reason: join_err.to_string(),
        }),
        Err(_elapsed) => {
            let late_mountpoint = mountpoint_owned.clone();
            tokio::spawn(async move {
                match blocking_task.await {
                    Ok(Ok(session)) => {
                        warn!(
                            mountpoint = %late_mountpoint.display(),
                            "mount completed after the readiness timeout, force-unmounting"
                        );
                        drop(session);
                    }
                    Ok(Err(io_err)) => {
                        warn!(mountpoint = %late_mountpoint.display(), %io_err, "late mount attempt failed");
                    }
                    Err(join_err) => {
                        warn!(mountpoint = %late_mountpoint.display(), %join_err, "late mount task panicked");
                    }
                }
            });
            Err(SandboxError::Timeout)
        }
    }
}

/// Unmounts `handle`, retrying busy mounts with exponential backoff and
/// escalating to a forced unmount if it is still busy afterward.
pub async fn unmount(mut handle: ReadyHandle) -> SandboxResult<()> {
    let Some(session) = handle.session.take() else {
        return Ok(());
    };
    let mountpoint = handle.mountpoint.clone();
    tokio::task::spawn_blocking(move || retry_unmount(session, &mountpoint))
        .await
        .map_err(|err| SandboxError::MountFailed {
            reason: err.to_string(),
        })?
}

fn retry_unmount(session: fuser::BackgroundSession, mountpoint: &Path) -> SandboxResult<()> {
    let mut backoff = UNMOUNT_INITIAL_BACKOFF;
    for attempt in 0..UNMOUNT_RETRIES {
        match nix::mount::umount2(mountpoint, MntFlags::empty()) {
            Ok(()) => {
                drop(session);
                return Ok(());
            }
            Err(Errno::EINVAL) => {
                drop(session);
                return Ok(());
            }
            Err(Errno::EBUSY) if attempt + 1 < UNMOUNT_RETRIES => {
                thread::sleep(backoff);
                backoff *= 2;
            }
            Err(_) => break,
        }
    }

    warn!(mountpoint = %mountpoint.display(), "unmount still busy, forcing");
    match nix::mount::umount2(mountpoint, MntFlags::MNT_FORCE) {
        Ok(()) | Err(Errno::EINVAL) => {
            drop(session);
            Ok(())
        }
        Err(err) => {
            drop(session);
            Err(SandboxError::MountFailed {
                reason: format!("forced unmount of {} failed: {err}", mountpoint.display()),
            })
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pre_mount_cleanup_recreates_a_plain_directory() {
        let tempdir = tempfile::tempdir().unwrap();
        let mountpoint = tempdir.path().join("mnt");
        std::fs::create_dir_all(&mountpoint).unwrap();
        std::fs::write(mountpoint.join("leftover.txt"), b"stale").unwrap();

        pre_mount_cleanup(&mountpoint).unwrap();

        assert!(mountpoint.is_dir());
        assert_eq!(std::fs::read_dir(&mountpoint).unwrap().count(), 0);
    }

    #[test]
    fn pre_mount_cleanup_creates_a_missing_directory() {
        let tempdir = tempfile::tempdir().unwrap();
        let mountpoint = tempdir.path().join("does-not-exist-yet");

        pre_mount_cleanup(&mountpoint).unwrap();

        assert!(mountpoint.is_dir());
    }

    #[test]
    fn mount_ready_timeout_is_at_least_thirty_seconds() {
        assert!(mount_ready_timeout() >= Duration::from_secs(30));
    }
}
