use std::{fs::File, path::Path};

use anyhow::{Context, Error};
use log::debug;

/// How ownership and permissions stored in a tarball are treated on extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Restore owners and permissions from the archive, for root filesystems.
    Preserve,
    /// Ignore owners and permissions, for filesystems such as FAT that cannot store them.
    Discard,
}

/// Extracts the tarball at `tarball` over `destination`, overwriting existing files.
pub fn extract(
    tarball: impl AsRef<Path>,
    destination: impl AsRef<Path>,
    ownership: Ownership,
) -> Result<(), Error> {
    debug!(
        "Extracting '{}' to '{}'",
        tarball.as_ref().display(),
        destination.as_ref().display()
    );
    let file = File::open(tarball.as_ref())
        .context(format!("Failed to open '{}'", tarball.as_ref().display()))?;

    let mut archive = tar::Archive::new(file);
    archive.set_overwrite(true);
    archive.set_preserve_mtime(true);
    let preserve = ownership == Ownership::Preserve;
    archive.set_preserve_permissions(preserve);
    archive.set_preserve_ownerships(preserve);
    archive.set_unpack_xattrs(false);

    archive.unpack(destination.as_ref()).context(format!(
        "Failed to unpack '{}' into '{}'",
        tarball.as_ref().display(),
        destination.as_ref().display()
    ))
}
