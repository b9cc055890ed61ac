use std::{fs, path::Path};

use anyhow::{Context, Error};
use log::trace;

/// Creates all directories in a path if they don't exist
pub fn create_dirs(path: impl AsRef<Path>) -> Result<(), Error> {
    fs::create_dir_all(path.as_ref()).context(format!(
        "Could not create path: {}",
        path.as_ref().display()
    ))
}

/// Copies `from` to `to`, creating the parent directory of `to` if needed.
pub fn copy_file(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<(), Error> {
    if let Some(parent) = to.as_ref().parent() {
        create_dirs(parent)?;
    }
    fs::copy(from.as_ref(), to.as_ref()).context(format!(
        "Could not copy '{}' to '{}'",
        from.as_ref().display(),
        to.as_ref().display()
    ))?;
    Ok(())
}

/// Reads a file, returning `None` if it does not exist.
pub fn read_if_exists(path: impl AsRef<Path>) -> Result<Option<Vec<u8>>, Error> {
    match fs::read(path.as_ref()) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context(format!("Could not read '{}'", path.as_ref().display())),
    }
}

/// Flushes all filesystem buffers to stable storage.
pub fn sync() {
    trace!("Syncing filesystems");
    nix::unistd::sync();
}
