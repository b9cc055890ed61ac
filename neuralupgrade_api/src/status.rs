use std::path::PathBuf;

use serde::{Serialize, Serializer};

use crate::{error::MetadataError, Metadata};

/// Metadata read from a partition, or the reason it could not be read.
pub type PartitionMetadata = Result<Metadata, MetadataError>;

/// Snapshot of both OS partitions and the EFI system partition.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct SystemReport {
    /// Label of the running OS partition.
    pub booted: String,

    /// Label of the OS partition that is not running.
    pub nonbooted: String,

    /// The booted partition first, then the nonbooted one.
    pub os_partitions: Vec<OsPartitionReport>,

    pub efisys: EfisysReport,

    /// Set when the next boot label could not be matched to either OS partition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SystemReport {
    /// Returns the report of the OS partition with the given label.
    pub fn os_partition(&self, label: &str) -> Option<&OsPartitionReport> {
        self.os_partitions.iter().find(|p| p.label == label)
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct OsPartitionReport {
    pub label: String,
    pub mountpoint: Option<PathBuf>,
    pub running: bool,
    pub next_boot: bool,

    /// Trusted comment of the installed OS signature.
    #[serde(serialize_with = "metadata_or_error")]
    pub metadata: PartitionMetadata,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct EfisysReport {
    pub label: String,
    pub mountpoint: Option<PathBuf>,

    /// The boot info comment of the boot configuration.
    #[serde(serialize_with = "metadata_or_error")]
    pub boot_info: PartitionMetadata,

    /// Trusted comment of the installed ESP signature, when the platform keeps one.
    #[serde(serialize_with = "metadata_or_error")]
    pub signature: PartitionMetadata,
}

/// Outcome of comparing an installed version with a requested one.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct VersionCheck {
    pub target: String,
    pub installed: Option<String>,
    pub requested: String,
    pub up_to_date: bool,
}

/// Serializes the metadata map, or a map with a single `error` key.
fn metadata_or_error<S: Serializer>(
    value: &PartitionMetadata,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Ok(metadata) => metadata.serialize(serializer),
        Err(e) => {
            let mut error = Metadata::new();
            error.insert("error".into(), e.to_string());
            error.serialize(serializer)
        }
    }
}
