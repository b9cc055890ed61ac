use std::path::{Path, PathBuf};

use log::{info, warn};

use neuralupgrade_api::{
    constants::{
        BACKUP_COUNT_DEFAULT, BACKUP_MAX_AGE_DAYS_DEFAULT, PUBKEY_PATH_DEFAULT,
        REPOSITORY_URL_DEFAULT,
    },
    error::{
        ExecutionEnvironmentError, InternalError, NeuralupgradeError, NeuralupgradeResultExt,
        ReportError,
    },
};
use osutils::arch::SystemArchitecture;

use cli::{Cli, Commands};
use config::FileConfig;
use download::{Repository, UpdateType};
use engine::{EngineContext, UpdateRequest};
use filesystems::{Filesystem, Filesystems};
use firmware::{filewriter::BackupPolicy, Bootloader};

pub mod cli;
pub mod config;
pub mod download;
pub mod engine;
pub mod filesystems;
pub mod firmware;
pub mod metadata;
pub mod minisign;
pub mod mount;
pub mod status;

#[cfg(test)]
pub(crate) mod testutils;

/// neuralupgrade version as provided by environment variables at build time
pub const NEURALUPGRADE_VERSION: &str = match option_env!("NEURALUPGRADE_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

/// Everything a command needs, assembled from the command line and the configuration file.
pub struct Neuralupgrade {
    ctx: EngineContext,
    repository: Repository,
    update_tmpdir: PathBuf,
    verify: bool,
    pubkey: Option<PathBuf>,
}

impl Neuralupgrade {
    pub fn new(args: &Cli) -> Result<Self, NeuralupgradeError> {
        let file = FileConfig::load(args.config.as_deref())?;

        let architecture = match args.platform.architecture {
            Some(architecture) => architecture,
            None => SystemArchitecture::current().structured(
                ExecutionEnvironmentError::UnsupportedArchitecture {
                    arch: std::env::consts::ARCH.into(),
                    bootloader: "neuralupgrade",
                },
            )?,
        };
        let bootloader = match args.platform.bootloader {
            Some(bootloader) => bootloader,
            None => Bootloader::detect_running()?,
        };

        let fs_args = &args.filesystems;
        let filesystems = Filesystems::new(
            filesystem(
                &fs_args.efisys_label,
                fs_args.efisys_dev.as_deref(),
                fs_args.efisys_mountpoint.as_deref(),
            ),
            filesystem(
                &fs_args.a_label,
                fs_args.a_dev.as_deref(),
                fs_args.a_mountpoint.as_deref(),
            ),
            filesystem(
                &fs_args.b_label,
                fs_args.b_dev.as_deref(),
                fs_args.b_mountpoint.as_deref(),
            ),
        )?;

        let backups = BackupPolicy::new(
            args.platform
                .backup_count
                .or(file.backup_count)
                .unwrap_or(BACKUP_COUNT_DEFAULT),
            args.platform
                .backup_max_age_days
                .or(file.backup_max_age_days)
                .unwrap_or(BACKUP_MAX_AGE_DAYS_DEFAULT),
        );

        let repo_args = &args.repository;
        let repository = Repository {
            os_filename_format: repo_args.os_filename_format.clone(),
            esp_filename_format: repo_args.esp_filename_format.clone(),
            ..Repository::new(
                repo_args
                    .repository
                    .clone()
                    .or(file.repository)
                    .unwrap_or_else(|| REPOSITORY_URL_DEFAULT.into()),
                architecture,
            )
        };

        let pubkey = repo_args
            .pubkey
            .clone()
            .or(file.pubkey)
            .or_else(|| {
                let default = PathBuf::from(PUBKEY_PATH_DEFAULT);
                default.exists().then_some(default)
            });

        Ok(Self {
            ctx: EngineContext {
                backups,
                extra_kernel_params: args.platform.extra_kernel_params.clone(),
                ..EngineContext::new(filesystems, bootloader, architecture)
            },
            repository,
            update_tmpdir: repo_args.update_tmpdir.clone(),
            verify: !repo_args.no_verify,
            pubkey,
        })
    }

    /// Runs the subcommand, printing its output as YAML.
    pub fn execute(&self, command: &Commands) -> Result<(), NeuralupgradeError> {
        match command {
            Commands::Show { targets } => {
                let mut output = serde_yaml::Mapping::new();
                for target in targets {
                    let shown = status::show(&self.ctx, &self.repository, target)
                        .message(format!("Failed to show '{target}'"))?;
                    output.insert(
                        target.to_string().into(),
                        serde_yaml::to_value(shown).structured(InternalError::SerializeReport)?,
                    );
                }
                print_yaml(&output)
            }

            Commands::Download {
                version,
                kind,
                output,
            } => {
                let directory = output.as_deref().unwrap_or(&self.update_tmpdir);
                let path = self.download(*kind, version, directory)?;
                println!("{}", path.display());
                Ok(())
            }

            Commands::Check { targets, version } => {
                let checks =
                    status::check_versions(&self.ctx, &self.repository, targets, version)?;
                for check in checks.iter().filter(|c| !c.up_to_date) {
                    info!("'{}' is not up to date", check.target);
                }
                print_yaml(&checks)
            }

            Commands::Apply {
                targets,
                os_tar,
                os_version,
                esp_tar,
                esp_version,
                default_boot_label,
                no_update_default_boot_label,
            } => {
                let os_tarball = match (os_tar, os_version) {
                    (Some(path), _) => Some(path.clone()),
                    (None, Some(version)) => Some(self.download(
                        UpdateType::Os,
                        version,
                        &self.update_tmpdir,
                    )?),
                    (None, None) => None,
                };
                let esp_tarball = match (esp_tar, esp_version) {
                    (Some(path), _) => Some(path.clone()),
                    (None, Some(version)) => Some(self.download(
                        UpdateType::Esp,
                        version,
                        &self.update_tmpdir,
                    )?),
                    (None, None) => None,
                };
                engine::apply_updates(
                    &self.ctx,
                    &UpdateRequest {
                        targets: targets.iter().copied().collect(),
                        os_tarball,
                        esp_tarball,
                        verify: self.verify,
                        pubkey: self.pubkey.clone(),
                        default_boot_label: default_boot_label.clone(),
                        skip_default_boot_label_update: *no_update_default_boot_label,
                    },
                )
            }

            Commands::SetDefault { label } => engine::set_default_boot_label(&self.ctx, label),
        }
    }

    fn download(
        &self,
        kind: UpdateType,
        version: &str,
        directory: &Path,
    ) -> Result<PathBuf, NeuralupgradeError> {
        if !self.verify {
            warn!("Signature verification is disabled");
        }
        self.repository.download(
            kind,
            version,
            directory,
            self.verify,
            self.pubkey.as_deref(),
            self.ctx.verifier.as_ref(),
        )
    }
}

fn filesystem(label: &str, device: Option<&Path>, mountpoint: Option<&Path>) -> Filesystem {
    let mut filesystem = Filesystem::new(label);
    if let Some(device) = device {
        filesystem = filesystem.with_device(device);
    }
    if let Some(mountpoint) = mountpoint {
        filesystem = filesystem.with_mountpoint(mountpoint);
    }
    filesystem
}

fn print_yaml(value: &impl serde::Serialize) -> Result<(), NeuralupgradeError> {
    let rendered = serde_yaml::to_string(value).structured(InternalError::SerializeReport)?;
    print!("{rendered}");
    Ok(())
}
