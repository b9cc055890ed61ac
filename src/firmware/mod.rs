//! Bootloaders and their configuration on the EFI system partition.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use log::{debug, info};

use neuralupgrade_api::{
    constants::{
        DEVICE_TREE_MODEL_PATH, EFI_FIRMWARE_PATH, GRUB_CONFIG_RELATIVE_PATH,
        RASPBERRY_PI_MODEL, UBOOT_BOOT_CMD_RELATIVE_PATH,
    },
    error::{ExecutionEnvironmentError, InvalidInputError, NeuralupgradeError},
    status::PartitionMetadata,
};
use osutils::arch::SystemArchitecture;

use crate::{
    filesystems::Filesystems,
    metadata::{self, BootInfoSource},
    minisign::SignatureVerifier,
};

pub mod filewriter;
mod grub;
mod uboot;

use filewriter::BackupPolicy;

/// The two supported boot chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Bootloader {
    /// GRUB on UEFI PCs
    Grub,

    /// U-Boot on Raspberry Pi
    #[value(name = "uboot")]
    UBoot,
}

/// Everything needed to render the boot configuration.
#[derive(Debug)]
pub struct BootConfig<'a> {
    pub filesystems: &'a Filesystems,

    /// Where the EFI system partition is mounted.
    pub esp: &'a Path,

    pub default_boot_label: &'a str,
    pub updated: NaiveDateTime,
    pub backups: &'a BackupPolicy,

    /// Appended to the built-in kernel parameters of both OS entries.
    pub extra_kernel_params: Option<&'a str>,
}

impl BootConfig<'_> {
    fn kernel_params(&self, base: &str) -> String {
        match self.extra_kernel_params.map(str::trim) {
            Some(extra) if !extra.is_empty() => format!("{base} {extra}"),
            _ => base.to_owned(),
        }
    }
}

/// A full refresh of the EFI system partition.
pub struct EspUpdate<'a> {
    pub config: BootConfig<'a>,

    /// Optional ESP tarball with extra EFI programs.
    pub tarball: Option<&'a Path>,

    pub verify: bool,
    pub pubkey: Option<&'a Path>,
    pub verifier: &'a dyn SignatureVerifier,
    pub architecture: SystemArchitecture,
}

impl Bootloader {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Grub => "grub",
            Self::UBoot => "uboot",
        }
    }

    /// Works out the bootloader of the running system.
    pub fn detect_running() -> Result<Self, NeuralupgradeError> {
        Self::detect(Path::new(EFI_FIRMWARE_PATH), Path::new(DEVICE_TREE_MODEL_PATH))
    }

    /// UEFI systems boot through GRUB. Raspberry Pis, recognised by their device tree model,
    /// boot through U-Boot.
    pub fn detect(efi_path: &Path, model_path: &Path) -> Result<Self, NeuralupgradeError> {
        if efi_path.exists() {
            debug!("Found '{}', using GRUB", efi_path.display());
            return Ok(Self::Grub);
        }
        if let Ok(model) = std::fs::read_to_string(model_path) {
            if model.contains(RASPBERRY_PI_MODEL) {
                debug!("Device tree model is '{}', using U-Boot", model.trim_end_matches('\0'));
                return Ok(Self::UBoot);
            }
        }
        Err(NeuralupgradeError::new(
            ExecutionEnvironmentError::UnknownFirmware,
        ))
    }

    /// The file carrying the boot info comment.
    pub fn config_path(&self, esp: &Path) -> PathBuf {
        match self {
            Self::Grub => esp.join(GRUB_CONFIG_RELATIVE_PATH),
            Self::UBoot => esp.join(UBOOT_BOOT_CMD_RELATIVE_PATH),
        }
    }

    /// Reinstalls the bootloader and writes its configuration.
    pub fn update(&self, update: &EspUpdate) -> Result<(), NeuralupgradeError> {
        info!(
            "Updating {} on '{}', default boot label '{}'",
            self.name(),
            update.config.esp.display(),
            update.config.default_boot_label
        );
        match self {
            Self::Grub => grub::update(update),
            Self::UBoot => uboot::update(update),
        }
    }

    /// Rewrites only the boot configuration.
    pub fn write_config(&self, config: &BootConfig) -> Result<(), NeuralupgradeError> {
        info!(
            "Setting default boot label to '{}' in {} configuration",
            config.default_boot_label,
            self.name()
        );
        match self {
            Self::Grub => grub::write_config(config),
            Self::UBoot => uboot::write_config(config),
        }
    }

    /// The default boot label recorded in the boot configuration on `esp`.
    pub fn read_default_boot_label(&self, esp: &Path) -> Result<String, NeuralupgradeError> {
        let path = self.config_path(esp);
        if !path.exists() {
            return Err(NeuralupgradeError::new(
                InvalidInputError::CannotInferDefaultBootLabel { path },
            ));
        }
        metadata::parse_boot_info_comment(BootInfoSource::File(&path))
            .map_err(NeuralupgradeError::new)?
            .remove("default_boot_label")
            .ok_or_else(|| {
                NeuralupgradeError::new(InvalidInputError::CannotInferDefaultBootLabel { path })
            })
    }

    /// The boot info comment and the ESP tarball signature, each read independently.
    pub fn partition_metadata(&self, esp: &Path) -> (PartitionMetadata, PartitionMetadata) {
        let boot_info =
            metadata::parse_boot_info_comment(BootInfoSource::File(&self.config_path(esp)));
        let signature = match self {
            Self::Grub => grub::signature_metadata(esp),
            // Nothing is extracted onto a U-Boot ESP, so there is no signature to read
            Self::UBoot => Ok(Default::default()),
        };
        (boot_info, signature)
    }
}
