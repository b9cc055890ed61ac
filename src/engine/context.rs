use std::path::PathBuf;

use neuralupgrade_api::{constants::PROC_CMDLINE_PATH, error::NeuralupgradeError};
use osutils::arch::SystemArchitecture;

use crate::{
    filesystems::{Filesystems, Sides},
    firmware::{filewriter::BackupPolicy, Bootloader},
    minisign::{Minisign, SignatureVerifier},
    mount::{HostMounts, MountOps},
};

/// The host neuralupgrade is servicing.
pub struct EngineContext {
    pub filesystems: Filesystems,

    pub bootloader: Bootloader,

    /// Architecture of the published payloads to use, and of the GRUB target.
    pub architecture: SystemArchitecture,

    /// Retention of boot configuration backups on the ESP.
    pub backups: BackupPolicy,

    /// Kernel command line naming the booted side.
    pub kernel_cmdline: PathBuf,

    /// Appended to the kernel parameters of both boot entries.
    pub extra_kernel_params: Option<String>,

    pub mounts: Box<dyn MountOps>,

    pub verifier: Box<dyn SignatureVerifier>,
}

impl EngineContext {
    /// A context acting on the running host.
    pub fn new(
        filesystems: Filesystems,
        bootloader: Bootloader,
        architecture: SystemArchitecture,
    ) -> Self {
        Self {
            filesystems,
            bootloader,
            architecture,
            backups: BackupPolicy::default(),
            kernel_cmdline: PROC_CMDLINE_PATH.into(),
            extra_kernel_params: None,
            mounts: Box::new(HostMounts::default()),
            verifier: Box::new(Minisign),
        }
    }

    /// Works out which OS partition is running.
    pub fn sides(&self) -> Result<Sides, NeuralupgradeError> {
        Sides::detect(&self.filesystems, &self.kernel_cmdline)
    }
}

#[cfg(test)]
impl EngineContext {
    /// A context over directories under `root`, with in-memory mounts and verification.
    pub(crate) fn fake(
        root: &std::path::Path,
        booted: &str,
        efisys: &str,
        a: &str,
        b: &str,
    ) -> (
        Self,
        std::sync::Arc<crate::testutils::FakeMounts>,
        std::sync::Arc<crate::testutils::ScriptedVerifier>,
    ) {
        use std::sync::Arc;

        use crate::testutils::{self, FakeMounts, ScriptedVerifier};

        let cmdline = root.join("cmdline");
        std::fs::write(&cmdline, format!("ro quiet psyopsos={booted}\n")).unwrap();
        let mounts = Arc::new(FakeMounts::default());
        let verifier = Arc::new(ScriptedVerifier::default());
        let ctx = Self {
            kernel_cmdline: cmdline,
            mounts: Box::new(Arc::clone(&mounts)),
            verifier: Box::new(Arc::clone(&verifier)),
            ..Self::new(
                testutils::filesystems_under(&root.join("mnt"), efisys, a, b),
                Bootloader::Grub,
                SystemArchitecture::X86_64,
            )
        };
        (ctx, mounts, verifier)
    }
}
