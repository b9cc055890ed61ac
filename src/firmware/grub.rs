use std::{collections::BTreeMap, path::Path};

use indoc::formatdoc;
use log::{debug, warn};
use serde::Deserialize;

use neuralupgrade_api::{
    constants::{
        BOOT_MENU_TIMEOUT_SECS, ESP_MANIFEST_FILENAME, ESP_SIGNATURE_FILENAME,
        GRUB_CONFIG_RELATIVE_PATH, GRUB_KERNEL_PARAMS_DEFAULT, TIMESTAMP_FORMAT,
    },
    error::{NeuralupgradeError, ReportError, ServicingError},
    status::PartitionMetadata,
};
use osutils::{
    archive::{self, Ownership},
    dependencies::{Dependency, DependencyResultExt},
    files,
};

use crate::{
    metadata::{self, SignatureSource},
    minisign,
};

use super::{filewriter, BootConfig, EspUpdate};

/// Extra EFI programs shipped in the ESP tarball, keyed by path on the ESP.
#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
struct EspManifest {
    #[serde(default)]
    extra_programs: BTreeMap<String, String>,
}

impl EspManifest {
    /// Reads the manifest on `esp`. An ESP without one has no extra programs.
    fn read(esp: &Path) -> Result<Self, NeuralupgradeError> {
        let path = esp.join(ESP_MANIFEST_FILENAME);
        let error = || ServicingError::ReadManifest {
            path: path.display().to_string(),
        };
        match files::read_if_exists(&path).structured(error())? {
            None => Ok(Self::default()),
            Some(contents) => serde_json::from_slice(&contents).structured(error()),
        }
    }
}

pub(super) fn update(update: &EspUpdate) -> Result<(), NeuralupgradeError> {
    let esp = update.config.esp;

    if let Some(tarball) = update.tarball {
        if update.verify {
            update.verifier.verify(tarball, update.pubkey)?;
        }
    }

    Dependency::GrubInstall
        .cmd()
        .with_arg(format!(
            "--target={}",
            update.architecture.grub_efi_target()
        ))
        .with_arg(format!("--efi-directory={}", esp.display()))
        .with_arg(format!("--boot-directory={}", esp.display()))
        .with_arg("--removable")
        .run_and_check()
        .message(format!("Failed to install GRUB to '{}'", esp.display()))?;

    if let Some(tarball) = update.tarball {
        // FAT cannot hold owners or permissions
        archive::extract(tarball, esp, Ownership::Discard).structured(
            ServicingError::ExtractTarball {
                tarball: tarball.display().to_string(),
                destination: esp.display().to_string(),
            },
        )?;

        let signature = minisign::signature_path(tarball);
        let marker = esp.join(ESP_SIGNATURE_FILENAME);
        if signature.exists() {
            files::copy_file(&signature, &marker).structured(ServicingError::CopySignature {
                from: signature.display().to_string(),
                to: marker.display().to_string(),
            })?;
        } else {
            warn!(
                "No signature at '{}', the ESP will not record its version",
                signature.display()
            );
        }
    }
    files::sync();

    write_config(&update.config)
}

pub(super) fn write_config(config: &BootConfig) -> Result<(), NeuralupgradeError> {
    let manifest = EspManifest::read(config.esp)?;
    let path = config.esp.join(GRUB_CONFIG_RELATIVE_PATH);
    let error = || ServicingError::WriteBootConfig {
        path: path.display().to_string(),
    };

    if let Some(parent) = path.parent() {
        files::create_dirs(parent).structured(error())?;
    }
    let rendered = render(config, &manifest);
    let written = filewriter::write_file_carefully(&path, rendered, config.updated, config.backups)
        .structured(error())?;
    debug!(
        "{} '{}'",
        if written { "Wrote" } else { "Unchanged" },
        path.display()
    );
    Ok(())
}

pub(super) fn signature_metadata(esp: &Path) -> PartitionMetadata {
    metadata::parse_trusted_comment(SignatureSource::File(&esp.join(ESP_SIGNATURE_FILENAME)))
}

fn render(config: &BootConfig, manifest: &EspManifest) -> String {
    let last_updated = config.updated.format(TIMESTAMP_FORMAT).to_string();
    let extra_programs = manifest
        .extra_programs
        .keys()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",");
    let info = metadata::render_boot_info_comment([
        ("last_updated", last_updated.as_str()),
        ("default_boot_label", config.default_boot_label),
        ("extra_programs", extra_programs.as_str()),
    ]);

    let mut cfg = formatdoc! {r#"
        # psyopsOS grub.cfg

        #### The next line is used by neuralupgrade to show information about the current configuration.
        {info}
        ####

        set default="{default}"
        set timeout={BOOT_MENU_TIMEOUT_SECS}

        insmod all_video
        set gfxmode=auto
        serial --speed=115200 --unit=0 --word=8 --parity=no --stop=1
        terminal_input console serial
        terminal_output console serial

        menuentry "Welcome to psyopsOS. GRUB configuration last updated: {last_updated}" {{
            echo "Welcome to psyopsOS. GRUB configuration last updated: {last_updated}"
        }}

        "#,
        default = config.default_boot_label,
    };

    let kernel_params = config.kernel_params(GRUB_KERNEL_PARAMS_DEFAULT);
    for label in [config.filesystems.a.label(), config.filesystems.b.label()] {
        cfg.push_str(&formatdoc! {r#"
            menuentry "{label}" {{
                search --no-floppy --label {label} --set root
                linux /kernel ro psyopsos={label} {kernel_params}
                initrd /initramfs
            }}

            "#,
        });
    }

    let efisys = config.filesystems.efisys.label();
    for (path, title) in &manifest.extra_programs {
        cfg.push_str(&formatdoc! {r#"
            menuentry "{title}" {{
                insmod part_gpt
                insmod fat
                insmod chain
                search --no-floppy --label {efisys} --set root
                chainloader {path}
            }}

            "#,
        });
    }

    cfg.push_str(indoc::indoc! {r#"
        menuentry "UEFI fwsetup" {
            fwsetup
        }

        menuentry "Reboot" {
            reboot
        }

        menuentry "Poweroff" {
            halt
        }

        menuentry "Exit GRUB" {
            exit
        }
    "#});
    cfg
}
