use std::{fs, path::Path, thread, time::Duration};

use anyhow::{bail, Context, Error};
use log::{debug, warn};
use sys_mount::UnmountFlags;

use crate::dependencies::{Dependency, DependencyError};

fn mode_option(read_only: bool) -> &'static str {
    if read_only {
        "ro"
    } else {
        "rw"
    }
}

/// Mounts `device` at `mountpoint`, creating the mountpoint directory if needed.
pub fn mount(
    device: impl AsRef<Path>,
    mountpoint: impl AsRef<Path>,
    read_only: bool,
) -> Result<(), Error> {
    fs::create_dir_all(mountpoint.as_ref()).context(format!(
        "Failed to create mountpoint '{}'",
        mountpoint.as_ref().display()
    ))?;

    Dependency::Mount
        .cmd()
        .arg("-o")
        .arg(mode_option(read_only))
        .arg(device.as_ref())
        .arg(mountpoint.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to mount '{}' at '{}'",
            device.as_ref().display(),
            mountpoint.as_ref().display(),
        ))
}

/// Remounts an already mounted filesystem read-only or read-write.
pub fn remount(mountpoint: impl AsRef<Path>, read_only: bool) -> Result<(), Error> {
    Dependency::Mount
        .cmd()
        .arg("-o")
        .arg(format!("remount,{}", mode_option(read_only)))
        .arg(mountpoint.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to remount '{}' {}",
            mountpoint.as_ref().display(),
            mode_option(read_only),
        ))
}

/// Unmounts the filesystem at `mountpoint`.
pub fn umount(mountpoint: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Umount
        .cmd()
        .arg(mountpoint.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to unmount '{}'",
            mountpoint.as_ref().display()
        ))
}

/// Returns whether `path` is currently a mountpoint.
pub fn is_mountpoint(path: impl AsRef<Path>) -> Result<bool, Error> {
    match Dependency::Mountpoint
        .cmd()
        .arg("-q")
        .arg(path.as_ref())
        .run_and_check()
    {
        Ok(()) => Ok(true),
        Err(e) if matches!(*e, DependencyError::ExecutionFailed { .. }) => Ok(false),
        Err(e) => Err(e).context(format!(
            "Failed to determine if '{}' is a mountpoint",
            path.as_ref().display()
        )),
    }
}

/// Unmounts `mountpoint`, retrying while it stays busy. Once `attempts` plain unmounts have
/// failed the filesystem is detached lazily. Succeeds immediately if nothing is mounted there.
pub fn umount_with_retries(
    mountpoint: impl AsRef<Path>,
    attempts: u32,
    delay: Duration,
) -> Result<(), Error> {
    let mountpoint = mountpoint.as_ref();
    for attempt in 1..=attempts {
        if !is_mountpoint(mountpoint)? {
            return Ok(());
        }
        match umount(mountpoint) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(
                    "Unmount attempt {attempt}/{attempts} of '{}' failed: {e:#}",
                    mountpoint.display()
                );
                thread::sleep(delay);
            }
        }
    }

    if !is_mountpoint(mountpoint)? {
        return Ok(());
    }

    debug!("Lazily detaching '{}'", mountpoint.display());
    sys_mount::unmount(mountpoint, UnmountFlags::DETACH).context(format!(
        "Failed to lazily unmount '{}'",
        mountpoint.display()
    ))?;

    if is_mountpoint(mountpoint)? {
        bail!("'{}' is still mounted after lazy unmount", mountpoint.display());
    }
    Ok(())
}

