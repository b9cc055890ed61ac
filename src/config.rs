//! Settings read from `/etc/psyopsOS/neuralupgrade.conf`.
//!
//! ```ini
//! [neuralupgrade]
//! repository = https://psyops.micahrl.com/os
//! pubkey = /etc/psyopsOS/minisign.pubkey
//! backup_count = 10
//! backup_max_age_days = 30
//! ```
//!
//! Every key is optional. Command line options take precedence over the file.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Error;
use configparser::ini::Ini;
use log::debug;

use neuralupgrade_api::{
    constants::{CONFIG_PATH_DEFAULT, CONFIG_SECTION},
    error::{InvalidInputError, NeuralupgradeError, ReportError},
};
use osutils::files;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileConfig {
    pub repository: Option<String>,
    pub pubkey: Option<PathBuf>,
    pub backup_count: Option<usize>,
    pub backup_max_age_days: Option<u64>,
}

impl FileConfig {
    /// Loads `path`, or the default location when `path` is `None`. Only an explicitly given
    /// file has to exist.
    pub fn load(path: Option<&Path>) -> Result<Self, NeuralupgradeError> {
        let (path, required) = match path {
            Some(path) => (path, true),
            None => (Path::new(CONFIG_PATH_DEFAULT), false),
        };
        let load_error = || InvalidInputError::LoadConfig { path: path.into() };

        match files::read_if_exists(path).structured(load_error())? {
            Some(contents) => {
                debug!("Loading configuration from '{}'", path.display());
                let contents = String::from_utf8(contents).structured(load_error())?;
                Self::parse(&contents, path)
            }
            None if required => Err(NeuralupgradeError::new(load_error())),
            None => {
                debug!("No configuration at '{}'", path.display());
                Ok(Self::default())
            }
        }
    }

    /// Parses INI `contents`. `path` is only used in errors.
    pub fn parse(contents: &str, path: &Path) -> Result<Self, NeuralupgradeError> {
        let mut ini = Ini::new_cs();
        ini.read(contents.into())
            .map_err(Error::msg)
            .structured(InvalidInputError::LoadConfig { path: path.into() })?;

        let get = |key: &str| {
            ini.get(CONFIG_SECTION, key)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };
        Ok(Self {
            repository: get("repository"),
            pubkey: get("pubkey").map(PathBuf::from),
            backup_count: parse_value(get("backup_count"), path, "backup_count")?,
            backup_max_age_days: parse_value(
                get("backup_max_age_days"),
                path,
                "backup_max_age_days",
            )?,
        })
    }
}

fn parse_value<T>(
    value: Option<String>,
    path: &Path,
    key: &str,
) -> Result<Option<T>, NeuralupgradeError>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .map(|value| value.parse::<T>())
        .transpose()
        .structured(InvalidInputError::InvalidConfigValue {
            path: path.into(),
            key: key.into(),
        })
}
