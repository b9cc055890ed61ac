//! Read-only inspection of the installed OS and ESP versions.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use log::{debug, warn};
use serde::Serialize;

use neuralupgrade_api::{
    constants::{LATEST_VERSION, OS_SIGNATURE_FILENAME},
    error::{MetadataError, NeuralupgradeError},
    status::{EfisysReport, OsPartitionReport, PartitionMetadata, SystemReport, VersionCheck},
    Metadata,
};

use crate::{
    download::{Repository, UpdateType},
    engine::EngineContext,
    filesystems::Filesystem,
    metadata::{self, SignatureSource},
    mount::{self, MountMode},
};

/// Reads both OS partitions and the ESP in parallel and works out which side boots next.
///
/// Only failing to work out the running side is an error. Partitions that cannot be mounted or
/// carry no readable metadata are reported with an error in place of their metadata.
pub fn show_booted(ctx: &EngineContext) -> Result<SystemReport, NeuralupgradeError> {
    let sides = ctx.sides()?;
    let booted = ctx.filesystems.os_partition(&sides.booted)?;
    let nonbooted = ctx.filesystems.os_partition(&sides.nonbooted)?;

    let ((booted_metadata, nonbooted_metadata), efisys) = rayon::join(
        || {
            rayon::join(
                || os_partition_metadata(ctx, booted),
                || os_partition_metadata(ctx, nonbooted),
            )
        },
        || efisys_report(ctx),
    );

    let next_boot = efisys
        .boot_info
        .as_ref()
        .ok()
        .and_then(|info| info.get("default_boot_label"))
        .cloned();
    let error = match next_boot {
        Some(ref label) if *label == sides.booted || *label == sides.nonbooted => None,
        Some(ref label) => Some(format!(
            "Default boot label '{label}' is neither '{}' nor '{}'",
            sides.booted, sides.nonbooted
        )),
        None => Some("Could not read the default boot label from the ESP".into()),
    };
    if let Some(ref error) = error {
        warn!("{error}");
    }

    let report = |filesystem: &Filesystem, metadata: PartitionMetadata| OsPartitionReport {
        label: filesystem.label().into(),
        mountpoint: mountpoint_of(filesystem),
        running: filesystem.label() == sides.booted,
        next_boot: next_boot.as_deref() == Some(filesystem.label()),
        metadata,
    };
    Ok(SystemReport {
        os_partitions: vec![
            report(booted, booted_metadata),
            report(nonbooted, nonbooted_metadata),
        ],
        booted: sides.booted.clone(),
        nonbooted: sides.nonbooted.clone(),
        efisys,
        error,
    })
}

/// Trusted comment of the OS signature installed on an OS partition.
pub fn os_partition_metadata(ctx: &EngineContext, filesystem: &Filesystem) -> PartitionMetadata {
    read_only(ctx, filesystem, |mountpoint| {
        metadata::parse_trusted_comment(SignatureSource::File(
            &mountpoint.join(OS_SIGNATURE_FILENAME),
        ))
    })
    .and_then(|metadata| metadata)
}

pub fn efisys_report(ctx: &EngineContext) -> EfisysReport {
    let filesystem = &ctx.filesystems.efisys;
    let (boot_info, signature) = match read_only(ctx, filesystem, |esp| {
        ctx.bootloader.partition_metadata(esp)
    }) {
        Ok(metadata) => metadata,
        Err(e) => (Err(e.clone()), Err(e)),
    };
    EfisysReport {
        label: filesystem.label().into(),
        mountpoint: mountpoint_of(filesystem),
        boot_info,
        signature,
    }
}

fn mountpoint_of(filesystem: &Filesystem) -> Option<PathBuf> {
    filesystem.mountpoint().ok().map(Path::to_path_buf)
}

/// Runs `f` on `filesystem` mounted read-only. Mount failures become metadata errors so they
/// can be reported alongside the partitions that could be read.
fn read_only<T>(
    ctx: &EngineContext,
    filesystem: &Filesystem,
    f: impl FnOnce(&Path) -> T,
) -> Result<T, MetadataError> {
    mount::with_mount(filesystem, MountMode::ReadOnly, ctx.mounts.as_ref(), |mountpoint| {
        Ok(f(mountpoint))
    })
    .map_err(|e| {
        debug!("Could not read '{}': {e:?}", filesystem.label());
        MetadataError::PartitionUnavailable {
            label: filesystem.label().into(),
            reason: e.kind().to_string(),
        }
    })
}

/// What `show` can report on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShowTarget {
    /// Both OS partitions and the ESP.
    System,
    Booted,
    Nonbooted,
    A,
    B,
    Efisys,

    /// Metadata of the newest published payload.
    Latest(UpdateType),

    /// A minisig file on disk.
    Signature(PathBuf),
}

impl FromStr for ShowTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "system" => Self::System,
            "booted" => Self::Booted,
            "nonbooted" => Self::Nonbooted,
            "a" => Self::A,
            "b" => Self::B,
            "efisys" => Self::Efisys,
            "latest" | "latest-os" => Self::Latest(UpdateType::Os),
            "latest-esp" => Self::Latest(UpdateType::Esp),
            path if Path::new(path).is_file() => Self::Signature(path.into()),
            other => return Err(format!("unknown target '{other}'")),
        })
    }
}

impl fmt::Display for ShowTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => f.write_str("system"),
            Self::Booted => f.write_str("booted"),
            Self::Nonbooted => f.write_str("nonbooted"),
            Self::A => f.write_str("a"),
            Self::B => f.write_str("b"),
            Self::Efisys => f.write_str("efisys"),
            Self::Latest(kind) => write!(f, "latest-{}", kind.name()),
            Self::Signature(path) => write!(f, "{}", path.display()),
        }
    }
}

/// The result of showing one target.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Shown {
    System(SystemReport),
    Efisys(EfisysReport),
    Metadata(Metadata),
}

pub fn show(
    ctx: &EngineContext,
    repository: &Repository,
    target: &ShowTarget,
) -> Result<Shown, NeuralupgradeError> {
    let os_partition = |filesystem: &Filesystem| {
        Shown::Metadata(or_error(os_partition_metadata(ctx, filesystem)))
    };
    Ok(match target {
        ShowTarget::System => Shown::System(show_booted(ctx)?),
        ShowTarget::Booted => os_partition(ctx.filesystems.os_partition(&ctx.sides()?.booted)?),
        ShowTarget::Nonbooted => {
            os_partition(ctx.filesystems.os_partition(&ctx.sides()?.nonbooted)?)
        }
        ShowTarget::A => os_partition(&ctx.filesystems.a),
        ShowTarget::B => os_partition(&ctx.filesystems.b),
        ShowTarget::Efisys => Shown::Efisys(efisys_report(ctx)),
        ShowTarget::Latest(kind) => Shown::Metadata(repository.metadata(*kind, LATEST_VERSION)?),
        ShowTarget::Signature(path) => Shown::Metadata(
            metadata::parse_trusted_comment(SignatureSource::File(path))
                .map_err(NeuralupgradeError::new)?,
        ),
    })
}

fn or_error(metadata: PartitionMetadata) -> Metadata {
    metadata.unwrap_or_else(|e| Metadata::from([("error".into(), e.to_string())]))
}

/// What `check` compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum CheckTarget {
    /// The OS on the nonbooted side
    Nonbooted,

    /// The ESP payload
    Efisys,
}

/// Compares the installed version of each target with `version`, resolving `latest` against
/// the repository. A target whose installed version cannot be read is reported as not up to
/// date.
pub fn check_versions(
    ctx: &EngineContext,
    repository: &Repository,
    targets: &[CheckTarget],
    version: &str,
) -> Result<Vec<VersionCheck>, NeuralupgradeError> {
    let mut checks = Vec::new();
    for target in targets {
        let (name, kind, installed) = match target {
            CheckTarget::Nonbooted => {
                let sides = ctx.sides()?;
                let filesystem = ctx.filesystems.os_partition(&sides.nonbooted)?;
                ("nonbooted", UpdateType::Os, os_partition_metadata(ctx, filesystem))
            }
            CheckTarget::Efisys => ("efisys", UpdateType::Esp, efisys_report(ctx).signature),
        };
        let installed = match installed {
            Ok(mut metadata) => metadata.remove("version"),
            Err(e) => {
                warn!("Could not read the installed version of '{name}': {e}");
                None
            }
        };
        let requested = repository.resolve_version(kind, version)?;
        checks.push(VersionCheck {
            target: name.into(),
            up_to_date: installed.as_deref() == Some(requested.as_str()),
            installed,
            requested,
        });
    }
    Ok(checks)
}
