use const_format::formatcp;

// Partition layout

/// Label of the EFI system partition.
pub const EFISYS_LABEL_DEFAULT: &str = "PSYOPSOSEFI";

/// Label of OS partition A.
pub const A_LABEL_DEFAULT: &str = "psyopsOS-A";

/// Label of OS partition B.
pub const B_LABEL_DEFAULT: &str = "psyopsOS-B";

// Host paths

/// Table of mount intents consulted when a mountpoint is not given.
pub const FSTAB_PATH: &str = "/etc/fstab";

/// Kernel command line of the running system.
pub const PROC_CMDLINE_PATH: &str = "/proc/cmdline";

/// Kernel command line key naming the booted OS partition label.
pub const BOOTED_SIDE_CMDLINE_KEY: &str = "psyopsos";

/// Present only on systems booted through UEFI.
pub const EFI_FIRMWARE_PATH: &str = "/sys/firmware/efi";

/// Model string exposed by device tree platforms.
pub const DEVICE_TREE_MODEL_PATH: &str = "/proc/device-tree/model";

/// Substring of the device tree model identifying a Raspberry Pi.
pub const RASPBERRY_PI_MODEL: &str = "Raspberry Pi";

/// Path to load the neuralupgrade config from.
pub const CONFIG_PATH_DEFAULT: &str = "/etc/psyopsOS/neuralupgrade.conf";

/// Section of the config file holding neuralupgrade settings.
pub const CONFIG_SECTION: &str = "neuralupgrade";

/// Minisign public key used to verify payloads.
pub const PUBKEY_PATH_DEFAULT: &str = "/etc/psyopsOS/minisign.pubkey";

// Metadata

/// Prefix of the signed comment line in a minisig file.
pub const TRUSTED_COMMENT_PREFIX: &str = "trusted comment: ";

/// Prefix of the metadata comment embedded in boot configuration files.
pub const BOOT_INFO_COMMENT_PREFIX: &str = "# neuralupgrade-info: ";

/// Signature extension appended to payload file names.
pub const MINISIG_EXTENSION: &str = "minisig";

/// Copy of the applied OS tarball signature kept on each OS partition.
pub const OS_SIGNATURE_FILENAME: &str = formatcp!("psyopsOS.tar.{MINISIG_EXTENSION}");

/// Copy of the applied ESP tarball signature kept on the EFI system partition.
pub const ESP_SIGNATURE_FILENAME: &str = formatcp!("psyopsESP.tar.{MINISIG_EXTENSION}");

/// Manifest listing extra EFI programs shipped in the ESP tarball.
pub const ESP_MANIFEST_FILENAME: &str = "manifest.json";

/// Format of `last_updated` and of the boot script self identification line.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Format used to suffix temporary and backup files.
pub const BACKUP_TIMESTAMP_FORMAT: &str = formatcp!("{TIMESTAMP_FORMAT}%.6f");

/// Backups always kept regardless of age.
pub const BACKUP_COUNT_DEFAULT: usize = 10;

/// Backups beyond the kept count are deleted once older than this.
pub const BACKUP_MAX_AGE_DAYS_DEFAULT: u64 = 30;

// Mounting

/// Unmount attempts before falling back to a lazy unmount.
pub const UMOUNT_ATTEMPTS: u32 = 3;

/// Delay between unmount attempts.
pub const UMOUNT_RETRY_DELAY_SECS: u64 = 1;

// Boot configuration

/// GRUB configuration path relative to the EFI system partition.
pub const GRUB_CONFIG_RELATIVE_PATH: &str = "grub/grub.cfg";

/// Timeout in seconds before the default entry boots.
pub const BOOT_MENU_TIMEOUT_SECS: u32 = 5;

/// Kernel parameters used for GRUB boot entries.
pub const GRUB_KERNEL_PARAMS_DEFAULT: &str = "earlyprintk=dbgp console=tty0 console=ttyS0,115200";

/// Kernel parameters used for U-Boot boot entries.
pub const UBOOT_KERNEL_PARAMS_DEFAULT: &str =
    "earlyprintk=dbgp console=tty0 console=ttyAMA0,115200 loglevel=7";

pub const RPI_CONFIG_TXT_RELATIVE_PATH: &str = "config.txt";
pub const UBOOT_BOOT_CMD_RELATIVE_PATH: &str = "boot.cmd";
pub const UBOOT_BOOT_SCR_RELATIVE_PATH: &str = "boot.scr";

// Downloads

pub const REPOSITORY_URL_DEFAULT: &str = "https://psyops.micahrl.com/os";
pub const OS_FILENAME_FORMAT_DEFAULT: &str = "psyopsOS.{architecture}.{version}.tar";
pub const ESP_FILENAME_FORMAT_DEFAULT: &str = "psyopsESP.{architecture}.{version}.tar";
pub const UPDATE_TMPDIR_DEFAULT: &str = "/tmp";

/// Version name resolving to the newest published payload.
pub const LATEST_VERSION: &str = "latest";
