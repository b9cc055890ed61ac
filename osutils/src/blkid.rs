use std::path::PathBuf;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Exit code blkid uses when no device matched the query.
const BLKID_NO_MATCH: i32 = 2;

/// Lists every block device whose filesystem carries `label`.
pub fn devices_with_label(label: &str) -> Result<Vec<PathBuf>, Error> {
    let result = Dependency::Blkid
        .cmd()
        .arg("-t")
        .arg(format!("LABEL={label}"))
        .arg("-o") // output format
        .arg("device")
        .output_and_check();

    match result {
        Ok(output) => Ok(parse_devices(&output)),
        Err(e) if e.exit_code() == Some(BLKID_NO_MATCH) => Ok(Vec::new()),
        Err(e) => Err(e).context(format!("Failed to look up devices labeled '{label}'")),
    }
}

fn parse_devices(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect()
}
