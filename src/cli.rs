use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    path::PathBuf,
};

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

use neuralupgrade_api::constants::{
    A_LABEL_DEFAULT, B_LABEL_DEFAULT, EFISYS_LABEL_DEFAULT, ESP_FILENAME_FORMAT_DEFAULT,
    LATEST_VERSION, OS_FILENAME_FORMAT_DEFAULT, UPDATE_TMPDIR_DEFAULT,
};
use osutils::arch::SystemArchitecture;

use crate::{
    download::UpdateType,
    engine::Target,
    firmware::Bootloader,
    status::{CheckTarget, ShowTarget},
    NEURALUPGRADE_VERSION,
};

#[derive(Parser, Debug)]
#[clap(version = NEURALUPGRADE_VERSION, about = "Update psyopsOS A/B partitions and the ESP")]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Info)]
    pub verbosity: LevelFilter,

    /// Configuration file [default: /etc/psyopsOS/neuralupgrade.conf]
    #[arg(global = true, short, long)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub filesystems: FilesystemArgs,

    #[command(flatten)]
    pub platform: PlatformArgs,

    #[command(flatten)]
    pub repository: RepositoryArgs,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Overrides for locating the three filesystems.
#[derive(Args, Debug)]
pub struct FilesystemArgs {
    #[arg(global = true, long, default_value = EFISYS_LABEL_DEFAULT)]
    pub efisys_label: String,

    /// Device of the ESP [default: looked up by label]
    #[arg(global = true, long)]
    pub efisys_dev: Option<PathBuf>,

    /// Mountpoint of the ESP [default: looked up in /etc/fstab]
    #[arg(global = true, long)]
    pub efisys_mountpoint: Option<PathBuf>,

    #[arg(global = true, long, default_value = A_LABEL_DEFAULT)]
    pub a_label: String,

    #[arg(global = true, long)]
    pub a_dev: Option<PathBuf>,

    #[arg(global = true, long)]
    pub a_mountpoint: Option<PathBuf>,

    #[arg(global = true, long, default_value = B_LABEL_DEFAULT)]
    pub b_label: String,

    #[arg(global = true, long)]
    pub b_dev: Option<PathBuf>,

    #[arg(global = true, long)]
    pub b_mountpoint: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct PlatformArgs {
    /// Bootloader to manage [default: detected from the running system]
    #[arg(global = true, long, value_enum)]
    pub bootloader: Option<Bootloader>,

    /// Architecture of the payloads [default: the running CPU]
    #[arg(global = true, long)]
    pub architecture: Option<SystemArchitecture>,

    /// Kernel parameters appended to both OS boot entries
    #[arg(global = true, long)]
    pub extra_kernel_params: Option<String>,

    /// Boot configuration backups always kept (at least 10) [default: 10]
    #[arg(global = true, long)]
    pub backup_count: Option<usize>,

    /// Delete backups beyond the kept count once older than this [default: 30]
    #[arg(global = true, long)]
    pub backup_max_age_days: Option<u64>,
}

#[derive(Args, Debug)]
pub struct RepositoryArgs {
    /// Base URL of the update repository [default: https://psyops.micahrl.com/os]
    #[arg(global = true, long)]
    pub repository: Option<String>,

    #[arg(global = true, long, default_value = OS_FILENAME_FORMAT_DEFAULT)]
    pub os_filename_format: String,

    #[arg(global = true, long, default_value = ESP_FILENAME_FORMAT_DEFAULT)]
    pub esp_filename_format: String,

    /// Directory downloads are saved to
    #[arg(global = true, long, default_value = UPDATE_TMPDIR_DEFAULT)]
    pub update_tmpdir: PathBuf,

    /// Do not verify signatures of payloads
    #[arg(global = true, long)]
    pub no_verify: bool,

    /// Minisign public key [default: /etc/psyopsOS/minisign.pubkey]
    #[arg(global = true, long)]
    pub pubkey: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show installed and published versions
    ///
    /// Targets: system, booted, nonbooted, a, b, efisys, latest (or latest-os), latest-esp, or
    /// the path to a minisig file.
    Show {
        #[clap(default_value = "system")]
        targets: Vec<ShowTarget>,
    },

    /// Download a payload and its signature from the repository
    Download {
        /// Version to download
        #[clap(long, default_value = LATEST_VERSION)]
        version: String,

        #[clap(long = "type", value_enum, default_value = "os")]
        kind: UpdateType,

        /// Directory to save to [default: --update-tmpdir]
        output: Option<PathBuf>,
    },

    /// Check whether installed versions match a published version
    Check {
        #[clap(long = "target", value_enum, default_value = "nonbooted")]
        targets: Vec<CheckTarget>,

        #[clap(long, default_value = LATEST_VERSION)]
        version: String,
    },

    /// Apply updates to the OS partitions and the ESP
    Apply {
        #[clap(value_enum, required = true)]
        targets: Vec<Target>,

        /// Local OS tarball
        #[clap(long, conflicts_with = "os_version")]
        os_tar: Option<PathBuf>,

        /// Download this OS version instead of passing --os-tar
        #[clap(long)]
        os_version: Option<String>,

        /// Local ESP tarball
        #[clap(long, conflicts_with = "esp_version")]
        esp_tar: Option<PathBuf>,

        /// Download this ESP version instead of passing --esp-tar
        #[clap(long)]
        esp_version: Option<String>,

        /// Label to boot next [default: the updated nonbooted side, or unchanged]
        #[clap(long)]
        default_boot_label: Option<String>,

        /// Keep the current default boot label after updating the nonbooted side
        #[clap(long)]
        no_update_default_boot_label: bool,
    },

    /// Set the label the bootloader boots by default
    SetDefault { label: String },
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Show { .. } => "show",
            Commands::Download { .. } => "download",
            Commands::Check { .. } => "check",
            Commands::Apply { .. } => "apply",
            Commands::SetDefault { .. } => "set-default",
        }
    }
}

impl Display for Commands {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.name())
    }
}
