//! Locating the three psyopsOS filesystems and working out which OS side is running.

use std::path::{Path, PathBuf};

use log::debug;
use once_cell::sync::OnceCell;

use neuralupgrade_api::{
    constants::{
        A_LABEL_DEFAULT, BOOTED_SIDE_CMDLINE_KEY, B_LABEL_DEFAULT, EFISYS_LABEL_DEFAULT,
        FSTAB_PATH,
    },
    error::{InvalidInputError, NeuralupgradeError, ReportError, ResolutionError},
};
use osutils::{blkid, tabfile::TabFile};

/// A partition identified by its filesystem label. The device and mountpoint are resolved on
/// first use and cached for the rest of the process.
#[derive(Debug)]
pub struct Filesystem {
    label: String,
    device: OnceCell<PathBuf>,
    mountpoint: OnceCell<PathBuf>,
    fstab: PathBuf,
}

impl Filesystem {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            device: OnceCell::new(),
            mountpoint: OnceCell::new(),
            fstab: FSTAB_PATH.into(),
        }
    }

    /// Use `device` instead of looking it up by label.
    pub fn with_device(self, device: impl Into<PathBuf>) -> Self {
        Self {
            device: OnceCell::with_value(device.into()),
            ..self
        }
    }

    /// Use `mountpoint` instead of looking it up in the fstab.
    pub fn with_mountpoint(self, mountpoint: impl Into<PathBuf>) -> Self {
        Self {
            mountpoint: OnceCell::with_value(mountpoint.into()),
            ..self
        }
    }

    /// Consult `fstab` instead of /etc/fstab when resolving the mountpoint.
    pub fn with_fstab(self, fstab: impl Into<PathBuf>) -> Self {
        Self {
            fstab: fstab.into(),
            ..self
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Block device holding this filesystem, found by label.
    pub fn device(&self) -> Result<&Path, NeuralupgradeError> {
        self.device
            .get_or_try_init(|| {
                let mut devices = blkid::devices_with_label(&self.label).structured(
                    ResolutionError::DeviceNotFound {
                        label: self.label.clone(),
                    },
                )?;
                if devices.len() != 1 {
                    debug!(
                        "Found {} devices labeled '{}': {devices:?}",
                        devices.len(),
                        self.label
                    );
                    return Err(NeuralupgradeError::new(ResolutionError::DeviceNotFound {
                        label: self.label.clone(),
                    }));
                }
                Ok(devices.remove(0))
            })
            .map(PathBuf::as_path)
    }

    /// Where this filesystem is mounted, found in the fstab by device path, falling back to
    /// a `LABEL=` entry. The label entry is also used when the device cannot be found.
    pub fn mountpoint(&self) -> Result<&Path, NeuralupgradeError> {
        self.mountpoint
            .get_or_try_init(|| {
                let device = match self.device() {
                    Ok(device) => Some(device),
                    Err(e) => {
                        debug!("Looking up '{}' in the fstab by label only: {e:?}", self.label);
                        None
                    }
                };
                let not_found = || ResolutionError::MountpointNotFound {
                    label: self.label.clone(),
                    device: device
                        .map(|d| d.display().to_string())
                        .unwrap_or_else(|| "(unknown)".into()),
                    fstab: self.fstab.display().to_string(),
                };
                let tab = TabFile::read(&self.fstab).structured(not_found())?;
                device
                    .and_then(|device| tab.mount_point_for_device(device))
                    .or_else(|| tab.mount_point_for_label(&self.label))
                    .map(Path::to_path_buf)
                    .structured(not_found())
            })
            .map(PathBuf::as_path)
    }
}

/// The three filesystem slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Slot {
    Efisys,
    A,
    B,
}

/// The EFI system partition and the two OS partitions.
#[derive(Debug)]
pub struct Filesystems {
    pub efisys: Filesystem,
    pub a: Filesystem,
    pub b: Filesystem,
}

impl Default for Filesystems {
    fn default() -> Self {
        Self {
            efisys: Filesystem::new(EFISYS_LABEL_DEFAULT),
            a: Filesystem::new(A_LABEL_DEFAULT),
            b: Filesystem::new(B_LABEL_DEFAULT),
        }
    }
}

impl Filesystems {
    /// Builds the collection, rejecting duplicate labels.
    pub fn new(
        efisys: Filesystem,
        a: Filesystem,
        b: Filesystem,
    ) -> Result<Self, NeuralupgradeError> {
        if a.label() == b.label() || a.label() == efisys.label() || b.label() == efisys.label() {
            return Err(NeuralupgradeError::new(InvalidInputError::DuplicateLabels {
                efisys: efisys.label().into(),
                a: a.label().into(),
                b: b.label().into(),
            }));
        }
        Ok(Self { efisys, a, b })
    }

    pub fn slot(&self, slot: Slot) -> &Filesystem {
        match slot {
            Slot::Efisys => &self.efisys,
            Slot::A => &self.a,
            Slot::B => &self.b,
        }
    }

    pub fn by_label(&self, label: &str) -> Option<&Filesystem> {
        [&self.efisys, &self.a, &self.b]
            .into_iter()
            .find(|fs| fs.label() == label)
    }

    /// Looks up one of the two OS partitions by label.
    pub fn os_partition(&self, label: &str) -> Result<&Filesystem, NeuralupgradeError> {
        [&self.a, &self.b]
            .into_iter()
            .find(|fs| fs.label() == label)
            .structured(self.not_an_os_label(label))
    }

    /// The label of the other OS partition.
    pub fn flipside(&self, label: &str) -> Result<&str, NeuralupgradeError> {
        if label == self.a.label() {
            Ok(self.b.label())
        } else if label == self.b.label() {
            Ok(self.a.label())
        } else {
            Err(NeuralupgradeError::new(self.not_an_os_label(label)))
        }
    }

    fn not_an_os_label(&self, label: &str) -> ResolutionError {
        ResolutionError::NotAnOsLabel {
            label: label.into(),
            a: self.a.label().into(),
            b: self.b.label().into(),
        }
    }
}

/// Labels of the running and the idle OS partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sides {
    pub booted: String,
    pub nonbooted: String,
}

impl Sides {
    /// Reads the booted side from the kernel command line at `cmdline_path`.
    pub fn detect(
        filesystems: &Filesystems,
        cmdline_path: impl AsRef<Path>,
    ) -> Result<Self, NeuralupgradeError> {
        let cmdline_path = cmdline_path.as_ref();
        let unknown = || ResolutionError::BootedSideUnknown {
            path: cmdline_path.display().to_string(),
            key: BOOTED_SIDE_CMDLINE_KEY.into(),
        };
        let cmdline = std::fs::read_to_string(cmdline_path).structured(unknown())?;
        let booted = booted_label(&cmdline).structured(unknown())?;
        Self::from_booted(filesystems, booted)
    }

    /// Builds the pair from the booted label, which must name `a` or `b`.
    pub fn from_booted(
        filesystems: &Filesystems,
        booted: &str,
    ) -> Result<Self, NeuralupgradeError> {
        let nonbooted = filesystems.flipside(booted)?;
        Ok(Self {
            booted: booted.into(),
            nonbooted: nonbooted.into(),
        })
    }
}

/// Value of the last `psyopsos=` token on a kernel command line.
fn booted_label(cmdline: &str) -> Option<&str> {
    cmdline
        .split_whitespace()
        .filter_map(|token| token.split_once('='))
        .filter(|(key, _)| *key == BOOTED_SIDE_CMDLINE_KEY)
        .map(|(_, value)| value)
        .last()
}
