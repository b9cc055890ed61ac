use std::path::{Path, PathBuf};

use anyhow::{Context, Error};

/// Directory of udev symlinks naming devices by filesystem label.
const BY_LABEL_DIR: &str = "/dev/disk/by-label";

/// A representation of an fstab file.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct TabFile {
    pub entries: Vec<TabFileEntry>,
}

/// A representation of a single entry in a tab file.
#[derive(Debug, PartialEq, Eq)]
pub struct TabFileEntry {
    pub device: TabDevice,
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
}

/// The first column of a tab file entry.
#[derive(Debug, PartialEq, Eq)]
pub enum TabDevice {
    /// `LABEL=<label>` or a `/dev/disk/by-label/<label>` path.
    Label(String),
    /// A device path, e.g. `/dev/sda1`.
    Path(PathBuf),
    /// `UUID=...`, `tmpfs`, `none` and anything else not matched by device or label.
    Other(String),
}

impl TabDevice {
    fn parse(spec: &str) -> Self {
        if let Some(label) = spec.strip_prefix("LABEL=") {
            return Self::Label(label.trim_matches('"').to_owned());
        }
        let path = Path::new(spec);
        if let Ok(label) = path.strip_prefix(BY_LABEL_DIR) {
            return Self::Label(label.to_string_lossy().into_owned());
        }
        if path.is_absolute() {
            return Self::Path(path.to_owned());
        }
        Self::Other(spec.to_owned())
    }
}

impl TabFile {
    /// Reads and parses the tab file at `path`.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read '{}'", path.as_ref().display()))?;
        Ok(Self::parse(&contents))
    }

    /// Parses tab file contents. Comments, blank lines and entries with fewer than two columns
    /// are skipped.
    pub fn parse(contents: &str) -> Self {
        let entries = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let mut columns = line.split_whitespace();
                let device = TabDevice::parse(columns.next()?);
                let mount_point = PathBuf::from(columns.next()?);
                let fs_type = columns.next().unwrap_or("auto").to_owned();
                let options = columns
                    .next()
                    .map(|o| o.split(',').map(String::from).collect())
                    .unwrap_or_default();
                Some(TabFileEntry {
                    device,
                    mount_point,
                    fs_type,
                    options,
                })
            })
            .collect();
        Self { entries }
    }

    /// Mount point of the first entry naming `device` by path.
    pub fn mount_point_for_device(&self, device: impl AsRef<Path>) -> Option<&Path> {
        self.entries
            .iter()
            .find(|e| matches!(&e.device, TabDevice::Path(p) if p == device.as_ref()))
            .map(|e| e.mount_point.as_path())
    }

    /// Mount point of the first entry naming the filesystem by `label`.
    pub fn mount_point_for_label(&self, label: &str) -> Option<&Path> {
        self.entries
            .iter()
            .find(|e| matches!(&e.device, TabDevice::Label(l) if l == label))
            .map(|e| e.mount_point.as_path())
    }
}
