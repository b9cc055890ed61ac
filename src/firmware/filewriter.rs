//! Power-loss safe replacement of boot configuration files.
//!
//! New contents go to `<path>.new.<stamp>` first. The previous file is copied (not moved) to
//! `<path>.old.<stamp>` and synced before the new file is renamed over `<path>`, so the
//! canonical path always holds either the complete old or the complete new contents.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::{Context, Error};
use chrono::NaiveDateTime;
use log::{debug, trace, warn};

use neuralupgrade_api::constants::{
    BACKUP_COUNT_DEFAULT, BACKUP_MAX_AGE_DAYS_DEFAULT, BACKUP_TIMESTAMP_FORMAT,
};
use osutils::files;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// How many backups of a rewritten file are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPolicy {
    count: usize,
    max_age: Duration,
}

impl BackupPolicy {
    /// The newest `count` backups are always kept, and `count` is never less than the default
    /// of 10. Older backups are deleted once they are more than `max_age_days` old.
    pub fn new(count: usize, max_age_days: u64) -> Self {
        Self {
            count: count.max(BACKUP_COUNT_DEFAULT),
            max_age: Duration::from_secs(max_age_days.saturating_mul(SECONDS_PER_DAY)),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }
}

impl Default for BackupPolicy {
    fn default() -> Self {
        Self::new(BACKUP_COUNT_DEFAULT, BACKUP_MAX_AGE_DAYS_DEFAULT)
    }
}

/// Replaces the contents of `path`, keeping a timestamped backup of the old file.
///
/// Returns `false` without touching anything when `path` already holds `contents`.
pub fn write_file_carefully(
    path: impl AsRef<Path>,
    contents: impl AsRef<[u8]>,
    now: NaiveDateTime,
    policy: &BackupPolicy,
) -> Result<bool, Error> {
    write_with_rename(path.as_ref(), contents.as_ref(), now, policy, |from, to| {
        fs::rename(from, to)
    })
}

fn write_with_rename(
    path: &Path,
    contents: &[u8],
    now: NaiveDateTime,
    policy: &BackupPolicy,
    rename: impl FnOnce(&Path, &Path) -> io::Result<()>,
) -> Result<bool, Error> {
    let existing = files::read_if_exists(path)?;
    if existing.as_deref() == Some(contents) {
        debug!("'{}' is already up to date", path.display());
        return Ok(false);
    }

    let stamp = now.format(BACKUP_TIMESTAMP_FORMAT).to_string();
    let new_path = suffixed(path, "new", &stamp);
    trace!("Writing new contents to '{}'", new_path.display());
    fs::write(&new_path, contents)
        .context(format!("Failed to write '{}'", new_path.display()))?;

    if existing.is_some() {
        let backup = suffixed(path, "old", &stamp);
        debug!("Backing up '{}' to '{}'", path.display(), backup.display());
        fs::copy(path, &backup).context(format!(
            "Failed to back up '{}' to '{}'",
            path.display(),
            backup.display()
        ))?;
        files::sync();
    }

    if let Err(e) = rename(&new_path, path) {
        if let Err(remove_error) = fs::remove_file(&new_path) {
            warn!(
                "Failed to remove '{}': {remove_error}",
                new_path.display()
            );
        }
        return Err(Error::new(e).context(format!(
            "Failed to move '{}' to '{}'",
            new_path.display(),
            path.display()
        )));
    }
    files::sync();

    rotate_backups(path, policy, SystemTime::now())?;
    files::sync();
    Ok(true)
}

fn suffixed(path: &Path, kind: &str, stamp: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{kind}.{stamp}"));
    name.into()
}

/// Deletes backups of `path` beyond the newest `policy.count()` that are older than
/// `policy.max_age()`.
fn rotate_backups(path: &Path, policy: &BackupPolicy, now: SystemTime) -> Result<(), Error> {
    let pattern = format!(
        "{}.old.*",
        glob::Pattern::escape(&path.to_string_lossy())
    );
    let mut backups = glob::glob(&pattern)
        .context(format!("Invalid backup pattern '{pattern}'"))?
        .filter_map(Result::ok)
        .map(|backup| {
            let modified = fs::metadata(&backup)
                .and_then(|m| m.modified())
                .context(format!("Failed to stat '{}'", backup.display()))?;
            Ok((modified, backup))
        })
        .collect::<Result<Vec<_>, Error>>()?;

    // Newest first, ties broken by the stamp in the name
    backups.sort_by(|a, b| b.cmp(a));

    for (modified, backup) in backups.into_iter().skip(policy.count()) {
        let age = now.duration_since(modified).unwrap_or_default();
        if age > policy.max_age() {
            debug!("Removing old backup '{}'", backup.display());
            fs::remove_file(&backup)
                .context(format!("Failed to remove '{}'", backup.display()))?;
        } else {
            trace!("Keeping backup '{}'", backup.display());
        }
    }
    Ok(())
}
