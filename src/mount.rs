//! Scoped mounting that puts filesystems back the way they were found.
//!
//! A filesystem may already be mounted when an operation starts, e.g. by the init system. On
//! acquire the current state is captured and, on release, only what was changed is undone:
//!
//! | Found                          | Requested | Action on acquire        | Action on release |
//! |--------------------------------|-----------|--------------------------|-------------------|
//! | not mounted                    | any       | mount                    | unmount           |
//! | here, read-only                | rw        | remount rw               | remount ro        |
//! | here, read-only                | ro        | none                     | none              |
//! | here, read-write               | any       | none                     | none              |
//! | elsewhere, or in several places| any       | unmount all, mount here  | unmount           |

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info};

use neuralupgrade_api::{
    constants::{UMOUNT_ATTEMPTS, UMOUNT_RETRY_DELAY_SECS},
    error::{MountError, NeuralupgradeError, NeuralupgradeResultExt, ReportError},
};
use osutils::{findmnt, findmnt::MountEntry, mount};

use crate::filesystems::Filesystem;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

impl MountMode {
    fn is_read_only(self) -> bool {
        self == MountMode::ReadOnly
    }
}

impl fmt::Display for MountMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadOnly => "ro",
            Self::ReadWrite => "rw",
        })
    }
}

/// Host mount operations.
pub trait MountOps: Send + Sync {
    /// Every place `device` is currently mounted.
    fn mounts_of(&self, device: &Path) -> Result<Vec<MountEntry>, NeuralupgradeError>;

    fn mount(
        &self,
        device: &Path,
        mountpoint: &Path,
        mode: MountMode,
    ) -> Result<(), NeuralupgradeError>;

    fn remount(&self, mountpoint: &Path, mode: MountMode) -> Result<(), NeuralupgradeError>;

    /// Unmounts, retrying while busy.
    fn umount(&self, mountpoint: &Path) -> Result<(), NeuralupgradeError>;
}

/// Mounts on the running system, through `findmnt`, `mount` and `umount`.
#[derive(Debug, Clone)]
pub struct HostMounts {
    pub umount_attempts: u32,
    pub umount_delay: Duration,
}

impl Default for HostMounts {
    fn default() -> Self {
        Self {
            umount_attempts: UMOUNT_ATTEMPTS,
            umount_delay: Duration::from_secs(UMOUNT_RETRY_DELAY_SECS),
        }
    }
}

impl MountOps for HostMounts {
    fn mounts_of(&self, device: &Path) -> Result<Vec<MountEntry>, NeuralupgradeError> {
        findmnt::mounts_of(device).structured(MountError::QueryMounts {
            device: device.display().to_string(),
        })
    }

    fn mount(
        &self,
        device: &Path,
        mountpoint: &Path,
        mode: MountMode,
    ) -> Result<(), NeuralupgradeError> {
        mount::mount(device, mountpoint, mode.is_read_only()).structured(MountError::Mount {
            device: device.display().to_string(),
            mountpoint: mountpoint.display().to_string(),
        })
    }

    fn remount(&self, mountpoint: &Path, mode: MountMode) -> Result<(), NeuralupgradeError> {
        mount::remount(mountpoint, mode.is_read_only()).structured(MountError::Remount {
            mountpoint: mountpoint.display().to_string(),
            mode: mode.to_string(),
        })
    }

    fn umount(&self, mountpoint: &Path) -> Result<(), NeuralupgradeError> {
        mount::umount_with_retries(mountpoint, self.umount_attempts, self.umount_delay)
            .structured(MountError::Umount {
                mountpoint: mountpoint.display().to_string(),
                attempts: self.umount_attempts,
            })
    }
}

/// How a filesystem was mounted before it was acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountState {
    NotMounted,
    MountedHere(MountMode),
    MountedElsewhereOrMultiple(Vec<PathBuf>),
}

impl MountState {
    /// Classifies the mounts of a device relative to the mountpoint it is expected at.
    pub fn capture(mounts: &[MountEntry], expected: &Path) -> Self {
        match mounts {
            [] => Self::NotMounted,
            [only] if only.target == expected => Self::MountedHere(if only.is_read_only() {
                MountMode::ReadOnly
            } else {
                MountMode::ReadWrite
            }),
            _ => {
                Self::MountedElsewhereOrMultiple(mounts.iter().map(|m| m.target.clone()).collect())
            }
        }
    }
}

/// What release does to restore the captured state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseAction {
    Unmount,
    RemountReadOnly,
    Leave,
}

/// A filesystem held mounted at its expected mountpoint. Must be given back with `release`.
#[derive(Debug)]
#[must_use = "mounts must be released"]
pub struct MountHandle {
    label: String,
    mountpoint: PathBuf,
    mode: MountMode,
    on_release: ReleaseAction,
}

impl MountHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// The mode the filesystem is mounted in while held. May be read-write even if read-only
    /// was requested, when it was already mounted read-write.
    pub fn mode(&self) -> MountMode {
        self.mode
    }

    pub fn on_release(&self) -> ReleaseAction {
        self.on_release
    }

    /// Mounts `filesystem` at its mountpoint with at least the access `mode` asks for.
    pub fn acquire(
        filesystem: &Filesystem,
        mode: MountMode,
        ops: &dyn MountOps,
    ) -> Result<Self, NeuralupgradeError> {
        let device = filesystem.device()?;
        let mountpoint = filesystem.mountpoint()?;
        let state = MountState::capture(&ops.mounts_of(device)?, mountpoint);
        debug!(
            "Acquiring '{}' ({}) at '{}' {mode}, found {state:?}",
            filesystem.label(),
            device.display(),
            mountpoint.display()
        );

        let (mode, on_release) = match state {
            MountState::NotMounted => {
                ops.mount(device, mountpoint, mode)?;
                (mode, ReleaseAction::Unmount)
            }
            MountState::MountedHere(MountMode::ReadOnly) if mode == MountMode::ReadWrite => {
                ops.remount(mountpoint, MountMode::ReadWrite)?;
                (MountMode::ReadWrite, ReleaseAction::RemountReadOnly)
            }
            MountState::MountedHere(current) => (current, ReleaseAction::Leave),
            MountState::MountedElsewhereOrMultiple(targets) => {
                info!(
                    "'{}' is mounted at {targets:?}, moving it to '{}'",
                    filesystem.label(),
                    mountpoint.display()
                );
                for target in &targets {
                    ops.umount(target)?;
                }
                ops.mount(device, mountpoint, mode)?;
                (mode, ReleaseAction::Unmount)
            }
        };

        Ok(Self {
            label: filesystem.label().into(),
            mountpoint: mountpoint.into(),
            mode,
            on_release,
        })
    }

    /// Restores the mount state captured on acquire.
    pub fn release(self, ops: &dyn MountOps) -> Result<(), NeuralupgradeError> {
        debug!(
            "Releasing '{}' at '{}': {:?}",
            self.label,
            self.mountpoint.display(),
            self.on_release
        );
        match self.on_release {
            ReleaseAction::Unmount => ops.umount(&self.mountpoint),
            ReleaseAction::RemountReadOnly => ops.remount(&self.mountpoint, MountMode::ReadOnly),
            ReleaseAction::Leave => Ok(()),
        }
        .message(format!("Failed to release '{}'", self.label))
    }
}

/// Runs `f` with `filesystem` mounted, releasing it afterwards whether or not `f` succeeded.
pub fn with_mount<T>(
    filesystem: &Filesystem,
    mode: MountMode,
    ops: &dyn MountOps,
    f: impl FnOnce(&Path) -> Result<T, NeuralupgradeError>,
) -> Result<T, NeuralupgradeError> {
    let handle = MountHandle::acquire(filesystem, mode, ops)?;
    let result = f(handle.mountpoint());
    let released = handle.release(ops);
    match (result, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
        (Err(e), Err(release_error)) => Err(e.secondary_error_context(release_error)),
    }
}

/// Mounts held for the duration of one update, at most one per filesystem label.
pub struct MountTable<'a> {
    ops: &'a dyn MountOps,
    handles: BTreeMap<String, MountHandle>,
}

impl<'a> MountTable<'a> {
    pub fn new(ops: &'a dyn MountOps) -> Self {
        Self {
            ops,
            handles: BTreeMap::new(),
        }
    }

    /// Mounts `filesystem` read-write, or reuses the mount if it is already held.
    pub fn writable(&mut self, filesystem: &Filesystem) -> Result<PathBuf, NeuralupgradeError> {
        if let Some(handle) = self.handles.get(filesystem.label()) {
            if handle.mode() != MountMode::ReadWrite {
                return Err(NeuralupgradeError::new(MountError::HeldReadOnly {
                    label: filesystem.label().into(),
                }));
            }
            debug!("Reusing mount of '{}'", filesystem.label());
            return Ok(handle.mountpoint().into());
        }

        let handle = MountHandle::acquire(filesystem, MountMode::ReadWrite, self.ops)?;
        let mountpoint = handle.mountpoint().to_path_buf();
        self.handles.insert(filesystem.label().into(), handle);
        Ok(mountpoint)
    }

    pub fn is_held(&self, label: &str) -> bool {
        self.handles.contains_key(label)
    }

    /// Releases every held mount, attempting all of them. Returns the failures.
    pub fn release_all(self) -> Vec<NeuralupgradeError> {
        let ops = self.ops;
        self.handles
            .into_values()
            .filter_map(|handle| handle.release(ops).err())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use neuralupgrade_api::error::ErrorKind;

    use super::*;
    use crate::testutils::FakeMounts;

    fn entry(target: &str, options: &str) -> MountEntry {
        MountEntry {
            target: target.into(),
            source: Some("/dev/sda2".into()),
            options: options.into(),
        }
    }

    fn filesystem() -> Filesystem {
        Filesystem::new("psyopsOS-A")
            .with_device("/dev/sda2")
            .with_mountpoint("/mnt/psyopsOS/a")
    }

    #[test]
    fn test_capture() {
        let expected = Path::new("/mnt/psyopsOS/a");
        assert_eq!(MountState::capture(&[], expected), MountState::NotMounted);
        assert_eq!(
            MountState::capture(&[entry("/mnt/psyopsOS/a", "ro,relatime")], expected),
            MountState::MountedHere(MountMode::ReadOnly)
        );
        assert_eq!(
            MountState::capture(&[entry("/mnt/psyopsOS/a", "rw,relatime")], expected),
            MountState::MountedHere(MountMode::ReadWrite)
        );
        assert_eq!(
            MountState::capture(&[entry("/media/a", "rw")], expected),
            MountState::MountedElsewhereOrMultiple(vec!["/media/a".into()])
        );
        assert_eq!(
            MountState::capture(
                &[entry("/mnt/psyopsOS/a", "rw"), entry("/media/a", "rw")],
                expected
            ),
            MountState::MountedElsewhereOrMultiple(vec![
                "/mnt/psyopsOS/a".into(),
                "/media/a".into()
            ])
        );
    }

    #[test]
    fn test_not_mounted_is_unmounted_on_release() {
        let ops = FakeMounts::default();
        let handle = MountHandle::acquire(&filesystem(), MountMode::ReadWrite, &ops).unwrap();
        assert_eq!(handle.on_release(), ReleaseAction::Unmount);
        assert_eq!(handle.mode(), MountMode::ReadWrite);
        assert_eq!(
            ops.state_of("/dev/sda2"),
            vec![(PathBuf::from("/mnt/psyopsOS/a"), MountMode::ReadWrite)]
        );

        handle.release(&ops).unwrap();
        assert!(ops.state_of("/dev/sda2").is_empty());
        assert_eq!(ops.mount_count(), 1);
    }

    #[test]
    fn test_read_write_mount_is_left_alone() {
        let ops = FakeMounts::default();
        ops.premount("/dev/sda2", "/mnt/psyopsOS/a", MountMode::ReadWrite);
        let before = ops.state_of("/dev/sda2");

        for mode in [MountMode::ReadOnly, MountMode::ReadWrite] {
            let handle = MountHandle::acquire(&filesystem(), mode, &ops).unwrap();
            assert_eq!(handle.on_release(), ReleaseAction::Leave);
            assert_eq!(handle.mode(), MountMode::ReadWrite);
            handle.release(&ops).unwrap();
            assert_eq!(ops.state_of("/dev/sda2"), before);
        }
        assert_eq!(ops.mount_count(), 0);
        assert_eq!(ops.remount_count(), 0);
    }

    #[test]
    fn test_read_only_mount_is_restored() {
        let ops = FakeMounts::default();
        ops.premount("/dev/sda2", "/mnt/psyopsOS/a", MountMode::ReadOnly);

        let handle = MountHandle::acquire(&filesystem(), MountMode::ReadWrite, &ops).unwrap();
        assert_eq!(handle.on_release(), ReleaseAction::RemountReadOnly);
        assert_eq!(
            ops.state_of("/dev/sda2"),
            vec![(PathBuf::from("/mnt/psyopsOS/a"), MountMode::ReadWrite)]
        );
        handle.release(&ops).unwrap();
        assert_eq!(
            ops.state_of("/dev/sda2"),
            vec![(PathBuf::from("/mnt/psyopsOS/a"), MountMode::ReadOnly)]
        );

        // Read-only is already satisfied
        let handle = MountHandle::acquire(&filesystem(), MountMode::ReadOnly, &ops).unwrap();
        assert_eq!(handle.on_release(), ReleaseAction::Leave);
        handle.release(&ops).unwrap();
        assert_eq!(ops.remount_count(), 2);
    }

    #[test]
    fn test_mounted_elsewhere_is_moved() {
        let ops = FakeMounts::default();
        ops.premount("/dev/sda2", "/media/a", MountMode::ReadOnly);
        ops.premount("/dev/sda2", "/media/a2", MountMode::ReadOnly);

        let handle = MountHandle::acquire(&filesystem(), MountMode::ReadWrite, &ops).unwrap();
        assert_eq!(handle.on_release(), ReleaseAction::Unmount);
        assert_eq!(
            ops.state_of("/dev/sda2"),
            vec![(PathBuf::from("/mnt/psyopsOS/a"), MountMode::ReadWrite)]
        );
        handle.release(&ops).unwrap();
        assert!(ops.state_of("/dev/sda2").is_empty());
    }

    #[test]
    fn test_with_mount_releases_on_error() {
        let ops = FakeMounts::default();
        let error = with_mount(&filesystem(), MountMode::ReadOnly, &ops, |_| {
            Err::<(), _>(NeuralupgradeError::new(MountError::QueryMounts {
                device: "x".into(),
            }))
        })
        .unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::Mount(MountError::QueryMounts { .. })));
        assert!(ops.state_of("/dev/sda2").is_empty());

        // A failing release is reported alongside the original error
        ops.fail_umount("/mnt/psyopsOS/a");
        let error = with_mount(&filesystem(), MountMode::ReadOnly, &ops, |_| {
            Err::<(), _>(NeuralupgradeError::new(MountError::QueryMounts {
                device: "x".into(),
            }))
        })
        .unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::Mount(MountError::QueryMounts { .. })));
        assert_eq!(error.related().len(), 1);
        assert!(matches!(
            error.related()[0].kind(),
            ErrorKind::Mount(MountError::Umount { .. })
        ));
    }

    #[test]
    fn test_mount_table_mounts_once() {
        let ops = FakeMounts::default();
        let fs = filesystem();
        let mut table = MountTable::new(&ops);

        let first = table.writable(&fs).unwrap();
        let second = table.writable(&fs).unwrap();
        assert_eq!(first, second);
        assert!(table.is_held("psyopsOS-A"));
        assert_eq!(ops.mount_count(), 1);

        assert!(table.release_all().is_empty());
        assert!(ops.state_of("/dev/sda2").is_empty());
    }

    #[test]
    fn test_mount_table_collects_every_release_failure() {
        let ops = FakeMounts::default();
        let a = filesystem();
        let b = Filesystem::new("psyopsOS-B")
            .with_device("/dev/sda3")
            .with_mountpoint("/mnt/psyopsOS/b");
        let mut table = MountTable::new(&ops);
        table.writable(&a).unwrap();
        table.writable(&b).unwrap();

        ops.fail_umount("/mnt/psyopsOS/a");
        ops.fail_umount("/mnt/psyopsOS/b");
        let errors = table.release_all();
        assert_eq!(errors.len(), 2);
    }
}
