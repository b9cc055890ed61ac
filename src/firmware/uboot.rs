use std::path::{Path, PathBuf};

use indoc::{formatdoc, indoc};
use log::{debug, warn};

use neuralupgrade_api::{
    constants::{
        BOOT_MENU_TIMEOUT_SECS, RPI_CONFIG_TXT_RELATIVE_PATH, TIMESTAMP_FORMAT,
        UBOOT_BOOT_CMD_RELATIVE_PATH, UBOOT_BOOT_SCR_RELATIVE_PATH, UBOOT_KERNEL_PARAMS_DEFAULT,
    },
    error::{
        ExecutionEnvironmentError, NeuralupgradeError, ReportError, ServicingError,
    },
};
use osutils::{
    arch::SystemArchitecture,
    dependencies::{Dependency, DependencyResultExt},
    files,
};

use super::{filewriter, BootConfig, Bootloader, EspUpdate};

/// RAM addresses the boot script loads into.
const KERNEL_ADDR_R: &str = "0x80200000";
const RAMDISK_ADDR_R: &str = "0x82200000";
const DTB_ADDR_R: &str = "0x8a200000";
const DTBO_1_ADDR_R: &str = "0x8a100000";

/// Device tree and overlay, as installed on the OS partitions.
const DTB_PATH: &str = "/dtbs/bcm2711-rpi-4-b.dtb";
const DTBO_PATH: &str = "/dtbs/overlays/disable-bt.dtbo";

/// U-Boot and Raspberry Pi firmware files copied to the root of the ESP, relative to the
/// host root.
const FIRMWARE_FILES: &[&str] = &[
    "usr/share/u-boot/rpi_arm64/u-boot.bin",
    "boot/start4.elf",
    "boot/fixup4.dat",
];

const CONFIG_TXT: &str = indoc! {"
    # psyopsOS Raspberry Pi config.txt

    arm_64bit=1
    arm_boost=1

    # Smallest GPU memory split that still boots reliably
    gpu_mem=64

    # Frees the PL011 UART from bluetooth. U-Boot applies the overlay itself, but the firmware
    # still has to set up the pins.
    dtoverlay=disable-bt

    enable_uart=1
    # Early boot messages over serial, before U-Boot is loaded
    uart_2ndstage=1

    # Boot into U-Boot
    kernel=u-boot.bin
"};

pub(super) fn update(update: &EspUpdate) -> Result<(), NeuralupgradeError> {
    if update.architecture != SystemArchitecture::Aarch64 {
        return Err(NeuralupgradeError::new(
            ExecutionEnvironmentError::UnsupportedArchitecture {
                arch: update.architecture.to_string(),
                bootloader: Bootloader::UBoot.name(),
            },
        ));
    }
    if let Some(tarball) = update.tarball {
        warn!(
            "ESP tarballs are not supported with U-Boot, ignoring '{}'",
            tarball.display()
        );
    }

    install_firmware(Path::new("/"), update.config.esp)?;
    files::sync();
    write_config(&update.config)
}

/// Copies U-Boot, the Raspberry Pi firmware, device trees and overlays from the host rooted at
/// `root` onto the ESP. U-Boot needs the device tree before any kernel is loaded.
fn install_firmware(root: &Path, esp: &Path) -> Result<(), NeuralupgradeError> {
    let copy = |from: &Path, to: PathBuf| {
        debug!("Copying '{}' to '{}'", from.display(), to.display());
        files::copy_file(from, &to).structured(ServicingError::CopyFirmware {
            path: from.display().to_string(),
        })
    };

    for file in FIRMWARE_FILES {
        let from = root.join(file);
        let name = from.file_name().structured(ServicingError::CopyFirmware {
            path: from.display().to_string(),
        })?;
        copy(&from, esp.join(name))?;
    }

    for (pattern, destination) in [
        ("boot/*.dtb", esp.to_path_buf()),
        ("boot/overlays/*.dtbo", esp.join("overlays")),
    ] {
        let pattern = format!(
            "{}/{pattern}",
            glob::Pattern::escape(&root.to_string_lossy()).trim_end_matches('/')
        );
        let matches = glob::glob(&pattern).structured(ServicingError::CopyFirmware {
            path: pattern.clone(),
        })?;
        for from in matches.filter_map(Result::ok) {
            if let Some(name) = from.file_name() {
                copy(&from, destination.join(name))?;
            }
        }
    }
    Ok(())
}

pub(super) fn write_config(config: &BootConfig) -> Result<(), NeuralupgradeError> {
    write_config_with(config, compile_boot_script)
}

/// Compiles boot.cmd in a scratch directory before touching the ESP. boot.scr only finds its
/// boot device while the first line of boot.cmd matches the `last_updated` it was compiled
/// with, so neither file is replaced unless compilation succeeded.
fn write_config_with(
    config: &BootConfig,
    compile: impl FnOnce(&Path, &Path) -> Result<(), NeuralupgradeError>,
) -> Result<(), NeuralupgradeError> {
    let boot_cmd = render_boot_cmd(config);
    let compile_error = || ServicingError::CompileBootScript {
        path: config.esp.join(UBOOT_BOOT_CMD_RELATIVE_PATH).display().to_string(),
    };
    let scratch = tempfile::tempdir().structured(compile_error())?;
    let source = scratch.path().join(UBOOT_BOOT_CMD_RELATIVE_PATH);
    let compiled = scratch.path().join(UBOOT_BOOT_SCR_RELATIVE_PATH);
    std::fs::write(&source, &boot_cmd).structured(compile_error())?;
    compile(&source, &compiled)?;
    let boot_scr = std::fs::read(&compiled).structured(compile_error())?;

    let write = |relative: &str, contents: &[u8]| {
        let path = config.esp.join(relative);
        filewriter::write_file_carefully(&path, contents, config.updated, config.backups)
            .structured(ServicingError::WriteBootConfig {
                path: path.display().to_string(),
            })
    };
    write(RPI_CONFIG_TXT_RELATIVE_PATH, CONFIG_TXT.as_bytes())?;
    write(UBOOT_BOOT_SCR_RELATIVE_PATH, &boot_scr)?;
    write(UBOOT_BOOT_CMD_RELATIVE_PATH, boot_cmd.as_bytes())?;
    Ok(())
}

fn compile_boot_script(source: &Path, compiled: &Path) -> Result<(), NeuralupgradeError> {
    Dependency::Mkimage
        .cmd()
        .with_arg("-A")
        .with_arg("arm")
        .with_arg("-T")
        .with_arg("script")
        .with_arg("-C")
        .with_arg("none")
        .with_arg("-n")
        .with_arg("psyopsOS Boot Script")
        .with_arg("-d")
        .with_arg(source)
        .with_arg(compiled)
        .run_and_check()
        .message(format!("Failed to compile '{}'", source.display()))
}

/// Renders boot.cmd. Its first line must stay `# <last_updated>`: the script finds its own
/// boot device by comparing that line with the `last_updated` variable it sets.
fn render_boot_cmd(config: &BootConfig) -> String {
    let last_updated = config.updated.format(TIMESTAMP_FORMAT).to_string();
    let info = crate::metadata::render_boot_info_comment([
        ("last_updated", last_updated.as_str()),
        ("default_boot_label", config.default_boot_label),
    ]);
    let kernel_params = config.kernel_params(UBOOT_KERNEL_PARAMS_DEFAULT);

    let mut script = formatdoc! {r#"
        # {last_updated}
        # LEAVE THE LINE ABOVE ALONE, the script compares it against last_updated below.

        # psyopsOS boot.cmd, generated by neuralupgrade

        #### The next line is used by neuralupgrade to show information about the current configuration.
        {info}
        ####

        # The length of this variable name is part of the comparison offset below
        setenv last_updated {last_updated}

        setenv psyopsOS_A_label {a}
        setenv psyopsOS_B_label {b}
        setenv default_boot_label {default}

        setenv kernel_addr_r {KERNEL_ADDR_R}
        setenv ramdisk_addr_r {RAMDISK_ADDR_R}
        setenv dtb_addr_r {DTB_ADDR_R}
        setenv dtbo_1_addr_r {DTBO_1_ADDR_R}

        setenv kernel_params "{kernel_params}"

        "#,
        a = config.filesystems.a.label(),
        b = config.filesystems.b.label(),
        default = config.default_boot_label,
    };

    script.push_str(PROBE);
    for side in ["A", "B"] {
        script.push_str(&boot_side(side));
    }
    script.push_str(&formatdoc! {r#"
        setenv default_bootcmd "echo psyopsOS: default boot label ${{default_boot_label}} not found; exit"
        if test "${{default_boot_label}}" = "${{psyopsOS_A_label}}" && test "${{psyopsOS_A_partnum}}" != ""; then
            setenv default_bootcmd "run boot_psyopsOS_A"
        fi
        if test "${{default_boot_label}}" = "${{psyopsOS_B_label}}" && test "${{psyopsOS_B_partnum}}" != ""; then
            setenv default_bootcmd "run boot_psyopsOS_B"
        fi

        echo "psyopsOS: booting ${{default_boot_label}} in {BOOT_MENU_TIMEOUT_SECS} seconds, press Ctrl-C for a shell"
        for i in {countdown}; do
            echo "${{i}}..."
            if sleep 1; then true; else exit; fi
        done
        run default_bootcmd

        # Only reached if booting failed
        exit
        "#,
        countdown = (1..=BOOT_MENU_TIMEOUT_SECS)
            .rev()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(" "),
    });
    script
}

/// Finds the boot device by self identification, then the A and B partitions on it.
const PROBE: &str = indoc! {r#"
    echo "psyopsOS: boot configuration last updated ${last_updated}"
    usb start

    setenv bootdev_type ""
    setenv bootdev_num ""
    for devtype in mmc usb; do
        for devnum in 0 1 2; do
            if ${devtype} dev ${devnum}; then
                if load ${devtype} ${devnum}:1 ${kernel_addr_r} /boot.cmd; then
                    # Skip the leading '# ' of the loaded file
                    setexpr header_timestamp_r ${kernel_addr_r} + 0x2
                    # Skip 'last_updated=' of the exported variable
                    env export -t ${ramdisk_addr_r} last_updated
                    setexpr this_timestamp_r ${ramdisk_addr_r} + 0xd
                    # Timestamps are 15 bytes
                    if cmp.b ${header_timestamp_r} ${this_timestamp_r} 0xf; then
                        echo "psyopsOS: found our boot.cmd on ${devtype} ${devnum}"
                        setenv bootdev_type ${devtype}
                        setenv bootdev_num ${devnum}
                    fi
                fi
            fi
        done
    done

    if test "${bootdev_type}" = ""; then
        echo "psyopsOS: boot device not found"
        exit
    fi

    setenv psyopsOS_A_partnum ""
    setenv psyopsOS_B_partnum ""
    for partnum in 2 3 4 5 6 7 8; do
        if load ${bootdev_type} ${bootdev_num}:${partnum} ${kernel_addr_r} ${psyopsOS_A_label}; then
            setenv psyopsOS_A_partnum ${partnum}
        elif load ${bootdev_type} ${bootdev_num}:${partnum} ${kernel_addr_r} ${psyopsOS_B_label}; then
            setenv psyopsOS_B_partnum ${partnum}
        fi
    done

    if test "${psyopsOS_A_partnum}" = "" && test "${psyopsOS_B_partnum}" = ""; then
        echo "psyopsOS: no psyopsOS partitions found"
        exit
    fi

"#};

/// The command booting one side, defined as a variable so that it can be run later.
fn boot_side(side: &str) -> String {
    let part = format!("${{bootdev_type}} ${{bootdev_num}}:${{psyopsOS_{side}_partnum}}");
    formatdoc! {r#"
        setenv boot_psyopsOS_{side} "
          echo Booting ${{psyopsOS_{side}_label}};
          setenv bootargs \"psyopsos=${{psyopsOS_{side}_label}} ${{kernel_params}}\" &&
          ext4load {part} ${{kernel_addr_r}} /kernel &&
          ext4load {part} ${{ramdisk_addr_r}} /initramfs &&
          setenv initrdsize \${{filesize}} &&
          ext4load {part} ${{dtb_addr_r}} {DTB_PATH} &&
          fdt addr ${{dtb_addr_r}} &&
          fdt resize &&
          ext4load {part} ${{dtbo_1_addr_r}} {DTBO_PATH} &&
          fdt apply ${{dtbo_1_addr_r}} &&
          booti ${{kernel_addr_r}} ${{ramdisk_addr_r}}:\${{initrdsize}} ${{dtb_addr_r}}
        "

        "#,
    }
}
