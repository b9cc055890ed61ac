//! In-memory stand-ins for the host seams, shared by unit tests.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use neuralupgrade_api::error::{MountError, NeuralupgradeError, VerificationError};
use osutils::findmnt::MountEntry;

use crate::{
    filesystems::{Filesystem, Filesystems},
    minisign::SignatureVerifier,
    mount::{MountMode, MountOps},
};

#[derive(Debug, Default)]
struct MountTableState {
    /// (device, target, mode)
    mounts: Vec<(PathBuf, PathBuf, MountMode)>,
    failing_umounts: BTreeSet<PathBuf>,
    mount_count: usize,
    remount_count: usize,
}

/// Tracks mounts in memory. Directories on disk are left untouched.
#[derive(Debug, Default)]
pub struct FakeMounts {
    state: Mutex<MountTableState>,
}

impl FakeMounts {
    /// Records `device` as mounted at `target` before the test starts.
    pub fn premount(&self, device: impl AsRef<Path>, target: impl AsRef<Path>, mode: MountMode) {
        self.state.lock().unwrap().mounts.push((
            device.as_ref().into(),
            target.as_ref().into(),
            mode,
        ));
    }

    /// Makes every unmount of `target` fail from now on.
    pub fn fail_umount(&self, target: impl AsRef<Path>) {
        self.state
            .lock()
            .unwrap()
            .failing_umounts
            .insert(target.as_ref().into());
    }

    pub fn state_of(&self, device: impl AsRef<Path>) -> Vec<(PathBuf, MountMode)> {
        self.state
            .lock()
            .unwrap()
            .mounts
            .iter()
            .filter(|(d, _, _)| d == device.as_ref())
            .map(|(_, target, mode)| (target.clone(), *mode))
            .collect()
    }

    /// Fresh mounts performed, not counting remounts.
    pub fn mount_count(&self) -> usize {
        self.state.lock().unwrap().mount_count
    }

    pub fn remount_count(&self) -> usize {
        self.state.lock().unwrap().remount_count
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().unwrap().mounts.is_empty()
    }
}

impl MountOps for FakeMounts {
    fn mounts_of(&self, device: &Path) -> Result<Vec<MountEntry>, NeuralupgradeError> {
        Ok(self
            .state_of(device)
            .into_iter()
            .map(|(target, mode)| MountEntry {
                target,
                source: Some(device.into()),
                options: format!("{mode},relatime"),
            })
            .collect())
    }

    fn mount(
        &self,
        device: &Path,
        mountpoint: &Path,
        mode: MountMode,
    ) -> Result<(), NeuralupgradeError> {
        let mut state = self.state.lock().unwrap();
        if state.mounts.iter().any(|(_, target, _)| target == mountpoint) {
            return Err(NeuralupgradeError::new(MountError::Mount {
                device: device.display().to_string(),
                mountpoint: mountpoint.display().to_string(),
            }));
        }
        state.mounts.push((device.into(), mountpoint.into(), mode));
        state.mount_count += 1;
        Ok(())
    }

    fn remount(&self, mountpoint: &Path, mode: MountMode) -> Result<(), NeuralupgradeError> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .mounts
            .iter_mut()
            .find(|(_, target, _)| target == mountpoint)
            .ok_or_else(|| {
                NeuralupgradeError::new(MountError::Remount {
                    mountpoint: mountpoint.display().to_string(),
                    mode: mode.to_string(),
                })
            })?;
        entry.2 = mode;
        state.remount_count += 1;
        Ok(())
    }

    fn umount(&self, mountpoint: &Path) -> Result<(), NeuralupgradeError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_umounts.contains(mountpoint) {
            return Err(NeuralupgradeError::new(MountError::Umount {
                mountpoint: mountpoint.display().to_string(),
                attempts: 3,
            }));
        }
        state.mounts.retain(|(_, target, _)| target != mountpoint);
        Ok(())
    }
}

impl MountOps for Arc<FakeMounts> {
    fn mounts_of(&self, device: &Path) -> Result<Vec<MountEntry>, NeuralupgradeError> {
        self.as_ref().mounts_of(device)
    }

    fn mount(
        &self,
        device: &Path,
        mountpoint: &Path,
        mode: MountMode,
    ) -> Result<(), NeuralupgradeError> {
        self.as_ref().mount(device, mountpoint, mode)
    }

    fn remount(&self, mountpoint: &Path, mode: MountMode) -> Result<(), NeuralupgradeError> {
        self.as_ref().remount(mountpoint, mode)
    }

    fn umount(&self, mountpoint: &Path) -> Result<(), NeuralupgradeError> {
        self.as_ref().umount(mountpoint)
    }
}

/// Accepts every payload except those explicitly rejected, and remembers what it was asked.
#[derive(Debug, Default)]
pub struct ScriptedVerifier {
    rejected: Mutex<BTreeSet<PathBuf>>,
    verified: Mutex<Vec<PathBuf>>,
}

impl ScriptedVerifier {
    pub fn reject(&self, file: impl AsRef<Path>) {
        self.rejected.lock().unwrap().insert(file.as_ref().into());
    }

    pub fn verified(&self) -> Vec<PathBuf> {
        self.verified.lock().unwrap().clone()
    }
}

impl SignatureVerifier for ScriptedVerifier {
    fn verify(&self, file: &Path, _pubkey: Option<&Path>) -> Result<(), NeuralupgradeError> {
        self.verified.lock().unwrap().push(file.into());
        if self.rejected.lock().unwrap().contains(file) {
            return Err(NeuralupgradeError::new(
                VerificationError::SignatureVerificationFailed {
                    path: file.display().to_string(),
                },
            ));
        }
        Ok(())
    }
}

impl SignatureVerifier for Arc<ScriptedVerifier> {
    fn verify(&self, file: &Path, pubkey: Option<&Path>) -> Result<(), NeuralupgradeError> {
        self.as_ref().verify(file, pubkey)
    }
}

/// Filesystems with fixed devices whose mountpoints are directories under `root`.
pub fn filesystems_under(root: &Path, efisys: &str, a: &str, b: &str) -> Filesystems {
    let make = |label: &str, device: &str| {
        let mountpoint = root.join(label);
        std::fs::create_dir_all(&mountpoint).unwrap();
        Filesystem::new(label)
            .with_device(device)
            .with_mountpoint(mountpoint)
    };
    Filesystems::new(
        make(efisys, "/dev/fake1"),
        make(a, "/dev/fake2"),
        make(b, "/dev/fake3"),
    )
    .unwrap()
}
