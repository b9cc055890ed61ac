//! Queries where a block device is currently mounted.
//!
//! `findmnt --json --list --source <device> -o target,source,options` prints a flat list of
//! every mount of the device, for example:
//!
//! ```text
//! {
//!    "filesystems": [
//!       {
//!          "target": "/mnt/psyopsOS/efisys",
//!          "source": "/dev/sda1",
//!          "options": "rw,relatime,fmask=0022,dmask=0022"
//!       }
//!    ]
//! }
//! ```
//!
//! When the device is not mounted anywhere findmnt prints nothing and exits with status 1.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use serde::Deserialize;

use crate::dependencies::Dependency;

/// Columns requested from findmnt, matching the fields of `MountEntry`.
pub const FINDMNT_COLUMNS: &str = "target,source,options";

/// Exit code findmnt uses when nothing matched.
const FINDMNT_NO_MATCH: i32 = 1;

/// Represents the output of `findmnt --json --list`.
#[derive(Debug, Deserialize)]
pub struct FindMnt {
    pub filesystems: Vec<MountEntry>,
}

/// One place a device is mounted.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone)]
pub struct MountEntry {
    pub target: PathBuf,

    /// Absent for some pseudo filesystems.
    pub source: Option<PathBuf>,

    /// Comma separated mount options, e.g. `ro,relatime`.
    pub options: String,
}

impl MountEntry {
    /// Whether the mount is read-only.
    pub fn is_read_only(&self) -> bool {
        self.options.split(',').any(|option| option == "ro")
    }
}

/// Returns every location `device` is mounted at. Empty if it is not mounted.
pub fn mounts_of(device: impl AsRef<Path>) -> Result<Vec<MountEntry>, Error> {
    let result = Dependency::Findmnt
        .cmd()
        .arg("--json")
        .arg("--list")
        .arg("--source")
        .arg(device.as_ref())
        .arg("-o")
        .arg(FINDMNT_COLUMNS)
        .output_and_check();

    let output = match result {
        Ok(output) => output,
        Err(e) if e.exit_code() == Some(FINDMNT_NO_MATCH) => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).context(format!(
                "Failed to run findmnt for '{}'",
                device.as_ref().display()
            ))
        }
    };

    parse(&output).context("Failed to deserialize output of findmnt")
}

fn parse(json: &str) -> Result<Vec<MountEntry>, serde_json::Error> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str::<FindMnt>(json).map(|findmnt| findmnt.filesystems)
}
