//! Applying OS and ESP payloads to the three filesystems.
//!
//! An update runs through planning, mounting, applying and boot configuration. Each
//! filesystem is mounted at most once per run, and every mount is released at the end
//! whether or not the update succeeded.

use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
};

use chrono::Local;
use log::{debug, info, warn};

use neuralupgrade_api::{
    constants::OS_SIGNATURE_FILENAME,
    error::{
        InternalError, InvalidInputError, NeuralupgradeError, NeuralupgradeResultExt, ReportError,
        ServicingError,
    },
};
use osutils::{
    archive::{self, Ownership},
    files,
};

use crate::{
    filesystems::{Filesystems, Slot},
    firmware::{BootConfig, EspUpdate},
    minisign,
    mount::MountTable,
};

mod context;

pub use context::EngineContext;

/// What an update can be applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum)]
pub enum Target {
    /// OS partition A
    A,

    /// OS partition B
    B,

    /// Whichever OS partition is not running
    Nonbooted,

    /// The EFI system partition
    Efisys,
}

impl Target {
    pub fn name(&self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
            Self::Nonbooted => "nonbooted",
            Self::Efisys => "efisys",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A request to update some set of targets.
#[derive(Debug, Clone, Default)]
pub struct UpdateRequest {
    pub targets: BTreeSet<Target>,

    /// OS tarball, required when any OS partition is targeted.
    pub os_tarball: Option<PathBuf>,

    /// Optional ESP tarball extracted onto the EFI system partition.
    pub esp_tarball: Option<PathBuf>,

    /// Verify tarballs against their `.minisig` before extracting them.
    pub verify: bool,

    pub pubkey: Option<PathBuf>,

    /// Label to boot next. Must be one of the OS partition labels.
    pub default_boot_label: Option<String>,

    /// Keep the current default boot label when updating the nonbooted side.
    pub skip_default_boot_label_update: bool,
}

/// The validated shape of an `UpdateRequest`.
#[derive(Debug, PartialEq, Eq)]
struct Plan {
    nonbooted: bool,
    sides: Vec<Slot>,
    efisys: bool,

    /// Read the default boot label from the current boot configuration before changing
    /// anything, so that a bootloader reinstall keeps it.
    detect_existing_label: bool,
}

impl Plan {
    fn new(filesystems: &Filesystems, request: &UpdateRequest) -> Result<Self, NeuralupgradeError> {
        let targets = &request.targets;
        let nonbooted = targets.contains(&Target::Nonbooted);
        if nonbooted && (targets.contains(&Target::A) || targets.contains(&Target::B)) {
            return Err(NeuralupgradeError::new(
                InvalidInputError::NonbootedWithExplicitSide,
            ));
        }

        let sides = [(Target::A, Slot::A), (Target::B, Slot::B)]
            .into_iter()
            .filter(|(target, _)| targets.contains(target))
            .map(|(_, slot)| slot)
            .collect::<Vec<_>>();

        if (nonbooted || !sides.is_empty()) && request.os_tarball.is_none() {
            return Err(NeuralupgradeError::new(InvalidInputError::MissingOsTarball {
                targets: targets
                    .iter()
                    .filter(|t| **t != Target::Efisys)
                    .map(Target::name)
                    .collect::<Vec<_>>()
                    .join(", "),
            }));
        }

        if let Some(ref label) = request.default_boot_label {
            check_default_boot_label(filesystems, label)?;
        }

        let efisys = targets.contains(&Target::Efisys);
        let promotes_nonbooted = nonbooted && !request.skip_default_boot_label_update;
        Ok(Self {
            nonbooted,
            sides,
            efisys,
            detect_existing_label: efisys
                && request.default_boot_label.is_none()
                && !promotes_nonbooted,
        })
    }
}

fn check_default_boot_label(
    filesystems: &Filesystems,
    label: &str,
) -> Result<(), NeuralupgradeError> {
    if label == filesystems.a.label() || label == filesystems.b.label() {
        return Ok(());
    }
    Err(NeuralupgradeError::new(
        InvalidInputError::InvalidDefaultBootLabel {
            label: label.into(),
            a: filesystems.a.label().into(),
            b: filesystems.b.label().into(),
        },
    ))
}

/// Applies `request`. Mounts are always released; if releasing fails too, the release
/// failures are attached to the original error.
pub fn apply_updates(
    ctx: &EngineContext,
    request: &UpdateRequest,
) -> Result<(), NeuralupgradeError> {
    let plan = Plan::new(&ctx.filesystems, request)?;
    debug!("Update plan: {plan:?}");

    let mut mounts = MountTable::new(ctx.mounts.as_ref());
    let result = run(ctx, request, &plan, &mut mounts);
    let cleanup = NeuralupgradeError::aggregate(mounts.release_all());

    match (result, cleanup) {
        (Ok(()), None) => Ok(()),
        (Ok(()), Some(cleanup)) => {
            Err(cleanup).message("Update applied, but releasing mounts failed")
        }
        (Err(e), None) => Err(e),
        (Err(e), Some(cleanup)) => Err(e.secondary_error_context(cleanup)),
    }
}

/// Changes only the default boot label.
pub fn set_default_boot_label(ctx: &EngineContext, label: &str) -> Result<(), NeuralupgradeError> {
    apply_updates(
        ctx,
        &UpdateRequest {
            default_boot_label: Some(label.into()),
            ..Default::default()
        },
    )
}

fn run(
    ctx: &EngineContext,
    request: &UpdateRequest,
    plan: &Plan,
    mounts: &mut MountTable,
) -> Result<(), NeuralupgradeError> {
    let updated = Local::now().naive_local();
    let filesystems = &ctx.filesystems;
    let mut default_boot_label = request.default_boot_label.clone();

    if plan.detect_existing_label {
        let esp = mounts.writable(&filesystems.efisys)?;
        let label = ctx.bootloader.read_default_boot_label(&esp)?;
        check_default_boot_label(filesystems, &label)?;
        debug!("Keeping existing default boot label '{label}'");
        default_boot_label = Some(label);
    }

    if plan.nonbooted {
        let sides = ctx.sides()?;
        let target = filesystems.os_partition(&sides.nonbooted)?;
        let mountpoint = mounts.writable(target)?;
        apply_ostar(ctx, request, &mountpoint)?;
        info!("Updated nonbooted side '{}'", sides.nonbooted);
        if request.skip_default_boot_label_update {
            debug!("Not changing the default boot label");
        } else if default_boot_label.is_none() {
            default_boot_label = Some(sides.nonbooted);
        }
    }

    for slot in &plan.sides {
        let target = filesystems.slot(*slot);
        let mountpoint = mounts.writable(target)?;
        apply_ostar(ctx, request, &mountpoint)?;
        info!("Updated '{}'", target.label());
    }

    if plan.efisys {
        let esp = mounts.writable(&filesystems.efisys)?;
        let label = default_boot_label.structured(InternalError::Internal(
            "no default boot label for ESP update",
        ))?;
        ctx.bootloader.update(&EspUpdate {
            config: boot_config(ctx, &esp, &label, updated),
            tarball: request.esp_tarball.as_deref(),
            verify: request.verify,
            pubkey: request.pubkey.as_deref(),
            verifier: ctx.verifier.as_ref(),
            architecture: ctx.architecture,
        })?;
        info!("Updated ESP, default boot label '{label}'");
    } else if let Some(label) = default_boot_label {
        let esp = mounts.writable(&filesystems.efisys)?;
        ctx.bootloader
            .write_config(&boot_config(ctx, &esp, &label, updated))?;
        info!("Set default boot label to '{label}'");
    } else if request.esp_tarball.is_some() {
        warn!("ESP tarball given but 'efisys' is not a target, ignoring it");
    }
    files::sync();
    Ok(())
}

fn boot_config<'a>(
    ctx: &'a EngineContext,
    esp: &'a Path,
    label: &'a str,
    updated: chrono::NaiveDateTime,
) -> BootConfig<'a> {
    BootConfig {
        filesystems: &ctx.filesystems,
        esp,
        default_boot_label: label,
        updated,
        backups: &ctx.backups,
        extra_kernel_params: ctx.extra_kernel_params.as_deref(),
    }
}

/// Verifies the OS tarball, extracts it over `mountpoint` and records its signature there.
fn apply_ostar(
    ctx: &EngineContext,
    request: &UpdateRequest,
    mountpoint: &Path,
) -> Result<(), NeuralupgradeError> {
    let tarball = request.os_tarball.as_deref().structured(InternalError::Internal(
        "OS tarball missing after planning",
    ))?;

    if request.verify {
        ctx.verifier.verify(tarball, request.pubkey.as_deref())?;
    } else {
        warn!("Not verifying '{}'", tarball.display());
    }

    info!("Extracting '{}' to '{}'", tarball.display(), mountpoint.display());
    archive::extract(tarball, mountpoint, Ownership::Preserve).structured(
        ServicingError::ExtractTarball {
            tarball: tarball.display().to_string(),
            destination: mountpoint.display().to_string(),
        },
    )?;

    let signature = minisign::signature_path(tarball);
    let marker = mountpoint.join(OS_SIGNATURE_FILENAME);
    if signature.exists() {
        files::copy_file(&signature, &marker).structured(ServicingError::CopySignature {
            from: signature.display().to_string(),
            to: marker.display().to_string(),
        })?;
    } else {
        warn!(
            "No signature at '{}', '{}' will not record its version",
            signature.display(),
            mountpoint.display()
        );
    }
    files::sync();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::MetadataExt, path::Path};

    use neuralupgrade_api::error::{ErrorKind, MountError, VerificationError};

    use super::*;
    use crate::{
        metadata::{self, SignatureSource},
        status,
    };

    const OS_SIGNATURE: &str = "untrusted comment: signature from minisign secret key\n\
        RUQf6LRCGA9i5+7r0/Ex5UX3WhqjxB2h3aGybQ3Rj1vMh8hDv6XmYj06ZvwBFt7eUJeHlxvmGFUuUOAQ4aoLVJH0dGH0NnYgVAA=\n\
        trusted comment: type=psyopsOS filename=psyopsOS.x86_64.20240301-120000.tar \
        version=20240301-120000 kernel=6.6.14-0-lts alpine=3.19\n\
        8CCbrK7+hnJUmHHEapC0jqb6wfyTmxIAiDRVZ8Ki9zzuN1aBoo4lmhGJ4jbiEJxnmvX0cybOUGa+cTkYOUpMCg==\n";

    /// Writes an OS tarball holding a kernel and an initramfs, with its signature next to it.
    /// Entries are owned by whoever owns `dir`, so extracting with ownership works unprivileged.
    fn os_tarball(dir: &Path) -> PathBuf {
        let owner = fs::metadata(dir).unwrap();
        let path = dir.join("psyopsOS.x86_64.20240301-120000.tar");
        let mut builder = tar::Builder::new(fs::File::create(&path).unwrap());
        for (name, contents) in [("kernel", "new kernel"), ("initramfs", "new initramfs")] {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_uid(owner.uid().into());
            header.set_gid(owner.gid().into());
            header.set_mtime(1_709_294_400);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.finish().unwrap();
        fs::write(minisign::signature_path(&path), OS_SIGNATURE).unwrap();
        path
    }

    fn grub_cfg_with_label(esp: &Path, label: &str) {
        fs::create_dir_all(esp.join("grub")).unwrap();
        fs::write(
            esp.join("grub/grub.cfg"),
            format!(
                "# neuralupgrade-info: last_updated=20240101-000000 default_boot_label={label} \
                extra_programs=\n"
            ),
        )
        .unwrap();
    }

    fn request(targets: &[Target], tarball: Option<PathBuf>) -> UpdateRequest {
        UpdateRequest {
            targets: targets.iter().copied().collect(),
            os_tarball: tarball,
            verify: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_plan() {
        let filesystems = Filesystems::default();
        let tarball = Some(PathBuf::from("/tmp/os.tar"));

        let error = Plan::new(
            &filesystems,
            &request(&[Target::Nonbooted, Target::A], tarball.clone()),
        )
        .unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::InvalidInput(InvalidInputError::NonbootedWithExplicitSide)
        ));

        let error = Plan::new(&filesystems, &request(&[Target::B], None)).unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::InvalidInput(InvalidInputError::MissingOsTarball { .. })
        ));

        // An ESP update alone needs no OS tarball and keeps the existing label
        let plan = Plan::new(&filesystems, &request(&[Target::Efisys], None)).unwrap();
        assert_eq!(
            plan,
            Plan {
                nonbooted: false,
                sides: vec![],
                efisys: true,
                detect_existing_label: true,
            }
        );

        // Updating nonbooted alongside the ESP promotes nonbooted instead
        let plan = Plan::new(
            &filesystems,
            &request(&[Target::Efisys, Target::Nonbooted], tarball.clone()),
        )
        .unwrap();
        assert!(!plan.detect_existing_label);

        // Unless promotion is skipped
        let mut skipped = request(&[Target::Efisys, Target::Nonbooted], tarball.clone());
        skipped.skip_default_boot_label_update = true;
        assert!(Plan::new(&filesystems, &skipped).unwrap().detect_existing_label);

        let plan = Plan::new(&filesystems, &request(&[Target::B, Target::A], tarball.clone()))
            .unwrap();
        assert_eq!(plan.sides, vec![Slot::A, Slot::B]);

        let mut explicit = request(&[Target::Efisys], None);
        explicit.default_boot_label = Some("PSYOPSOSEFI".into());
        let error = Plan::new(&filesystems, &explicit).unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::InvalidInput(InvalidInputError::InvalidDefaultBootLabel { .. })
        ));
    }

    #[test]
    fn test_update_nonbooted_then_show() {
        let root = tempfile::tempdir().unwrap();
        let (ctx, mounts, verifier) = EngineContext::fake(root.path(), "X", "EFI", "X", "Y");
        let y = ctx.filesystems.b.mountpoint().unwrap().to_path_buf();
        let esp = ctx.filesystems.efisys.mountpoint().unwrap().to_path_buf();
        grub_cfg_with_label(&esp, "X");
        let tarball = os_tarball(root.path());

        let sides = ctx.sides().unwrap();
        assert_eq!((sides.booted.as_str(), sides.nonbooted.as_str()), ("X", "Y"));

        apply_updates(&ctx, &request(&[Target::Nonbooted], Some(tarball.clone()))).unwrap();

        assert_eq!(fs::read_to_string(y.join("kernel")).unwrap(), "new kernel");
        assert_eq!(
            metadata::parse_trusted_comment(SignatureSource::File(
                &y.join(OS_SIGNATURE_FILENAME)
            ))
            .unwrap()["version"],
            "20240301-120000"
        );
        assert_eq!(ctx.bootloader.read_default_boot_label(&esp).unwrap(), "Y");
        assert_eq!(verifier.verified(), vec![tarball]);
        assert!(mounts.is_idle());
        // Y for the update, the ESP for the boot label
        assert_eq!(mounts.mount_count(), 2);

        let report = status::show_booted(&ctx).unwrap();
        assert!(report.os_partition("Y").unwrap().next_boot);
        assert!(!report.os_partition("X").unwrap().next_boot);
        assert!(report.os_partition("X").unwrap().running);
        assert!(report.error.is_none());
    }

    #[test]
    fn test_skip_default_boot_label_update() {
        let root = tempfile::tempdir().unwrap();
        let (ctx, mounts, _) = EngineContext::fake(root.path(), "X", "EFI", "X", "Y");
        let esp = ctx.filesystems.efisys.mountpoint().unwrap().to_path_buf();
        grub_cfg_with_label(&esp, "X");
        let before = fs::read_to_string(esp.join("grub/grub.cfg")).unwrap();

        let mut skipped = request(&[Target::Nonbooted], Some(os_tarball(root.path())));
        skipped.skip_default_boot_label_update = true;
        apply_updates(&ctx, &skipped).unwrap();

        assert_eq!(fs::read_to_string(esp.join("grub/grub.cfg")).unwrap(), before);
        assert_eq!(mounts.mount_count(), 1);
    }

    #[test]
    fn test_explicit_label_wins_and_efisys_mounted_once() {
        let root = tempfile::tempdir().unwrap();
        let (ctx, mounts, _) = EngineContext::fake(root.path(), "X", "EFI", "X", "Y");
        let esp = ctx.filesystems.efisys.mountpoint().unwrap().to_path_buf();

        let mut explicit = request(&[Target::A, Target::B], Some(os_tarball(root.path())));
        explicit.default_boot_label = Some("X".into());
        apply_updates(&ctx, &explicit).unwrap();

        assert_eq!(ctx.bootloader.read_default_boot_label(&esp).unwrap(), "X");
        for side in [&ctx.filesystems.a, &ctx.filesystems.b] {
            assert!(side.mountpoint().unwrap().join("initramfs").is_file());
        }
        assert_eq!(mounts.mount_count(), 3);
        assert!(mounts.is_idle());
    }

    #[test]
    fn test_ab_update_leaves_boot_label_alone() {
        let root = tempfile::tempdir().unwrap();
        let (ctx, mounts, _) = EngineContext::fake(root.path(), "X", "EFI", "X", "Y");
        let esp = ctx.filesystems.efisys.mountpoint().unwrap().to_path_buf();

        apply_updates(&ctx, &request(&[Target::B], Some(os_tarball(root.path())))).unwrap();
        assert!(!esp.join("grub/grub.cfg").exists());
        assert_eq!(mounts.mount_count(), 1);
    }

    #[test]
    fn test_efisys_without_config_fails_cleanly() {
        let root = tempfile::tempdir().unwrap();
        let (ctx, mounts, _) = EngineContext::fake(root.path(), "X", "EFI", "X", "Y");
        let esp = ctx.filesystems.efisys.mountpoint().unwrap().to_path_buf();

        let error = apply_updates(&ctx, &request(&[Target::Efisys], None)).unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::InvalidInput(InvalidInputError::CannotInferDefaultBootLabel { .. })
        ));
        assert_eq!(fs::read_dir(&esp).unwrap().count(), 0);
        assert!(mounts.is_idle());
    }

    #[test]
    fn test_verification_failure_leaves_partition_unchanged() {
        let root = tempfile::tempdir().unwrap();
        let (ctx, mounts, verifier) = EngineContext::fake(root.path(), "X", "EFI", "X", "Y");
        let y = ctx.filesystems.b.mountpoint().unwrap().to_path_buf();
        let esp = ctx.filesystems.efisys.mountpoint().unwrap().to_path_buf();
        fs::write(y.join("kernel"), "old kernel").unwrap();
        grub_cfg_with_label(&esp, "X");
        let tarball = os_tarball(root.path());
        verifier.reject(&tarball);

        let error = apply_updates(&ctx, &request(&[Target::Nonbooted], Some(tarball))).unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::Verification(VerificationError::SignatureVerificationFailed { .. })
        ));
        assert_eq!(fs::read_to_string(y.join("kernel")).unwrap(), "old kernel");
        assert!(!y.join("initramfs").exists());
        assert!(!y.join(OS_SIGNATURE_FILENAME).exists());
        assert_eq!(ctx.bootloader.read_default_boot_label(&esp).unwrap(), "X");
        assert!(mounts.is_idle());
    }

    #[test]
    fn test_no_verify_skips_verifier() {
        let root = tempfile::tempdir().unwrap();
        let (ctx, _, verifier) = EngineContext::fake(root.path(), "X", "EFI", "X", "Y");
        let tarball = os_tarball(root.path());
        verifier.reject(&tarball);

        let mut unverified = request(&[Target::A], Some(tarball));
        unverified.verify = false;
        apply_updates(&ctx, &unverified).unwrap();
        assert!(verifier.verified().is_empty());
    }

    #[test]
    fn test_cleanup_failures_are_aggregated() {
        let root = tempfile::tempdir().unwrap();
        let (ctx, mounts, _) = EngineContext::fake(root.path(), "X", "EFI", "X", "Y");
        let esp = ctx.filesystems.efisys.mountpoint().unwrap().to_path_buf();
        grub_cfg_with_label(&esp, "X");
        mounts.fail_umount(ctx.filesystems.b.mountpoint().unwrap());
        mounts.fail_umount(&esp);

        // Cleanup failure after a successful update
        let tarball = os_tarball(root.path());
        let error =
            apply_updates(&ctx, &request(&[Target::Nonbooted], Some(tarball.clone()))).unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::Cleanup(_)));
        assert_eq!(error.related().len(), 2);

        // Cleanup failure while handling an update failure reports both
        let (ctx, mounts, verifier) = EngineContext::fake(root.path(), "X", "EFI", "X", "Y");
        mounts.fail_umount(ctx.filesystems.b.mountpoint().unwrap());
        verifier.reject(&tarball);
        let error = apply_updates(&ctx, &request(&[Target::B], Some(tarball))).unwrap_err();
        assert!(matches!(error.kind(), ErrorKind::Verification(_)));
        assert_eq!(error.related().len(), 1);
        assert!(matches!(error.related()[0].kind(), ErrorKind::Cleanup(_)));
        assert!(matches!(
            error.related()[0].related()[0].kind(),
            ErrorKind::Mount(MountError::Umount { .. })
        ));
    }

    #[test]
    fn test_set_default_boot_label() {
        let root = tempfile::tempdir().unwrap();
        let (ctx, mounts, _) = EngineContext::fake(root.path(), "X", "EFI", "X", "Y");
        let esp = ctx.filesystems.efisys.mountpoint().unwrap().to_path_buf();

        set_default_boot_label(&ctx, "Y").unwrap();
        assert_eq!(ctx.bootloader.read_default_boot_label(&esp).unwrap(), "Y");
        assert_eq!(mounts.mount_count(), 1);

        set_default_boot_label(&ctx, "Z").unwrap_err();
        assert_eq!(ctx.bootloader.read_default_boot_label(&esp).unwrap(), "Y");
    }
}
