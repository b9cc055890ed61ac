use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use log::info;

use neuralupgrade_api::{
    constants::MINISIG_EXTENSION,
    error::{NeuralupgradeError, NeuralupgradeResultExt, VerificationError},
};
use osutils::dependencies::{Dependency, DependencyError};

/// Checks a payload against its detached signature.
pub trait SignatureVerifier: Send + Sync {
    /// Verifies `file` against the signature at `signature_path(file)`. `pubkey` of `None`
    /// uses the verifier's default key.
    fn verify(&self, file: &Path, pubkey: Option<&Path>) -> Result<(), NeuralupgradeError>;
}

/// Verifies with the `minisign` tool.
#[derive(Debug, Default, Clone, Copy)]
pub struct Minisign;

impl SignatureVerifier for Minisign {
    fn verify(&self, file: &Path, pubkey: Option<&Path>) -> Result<(), NeuralupgradeError> {
        info!("Verifying '{}'", file.display());
        let mut cmd = Dependency::Minisign.cmd();
        cmd.arg("-V");
        if let Some(pubkey) = pubkey {
            cmd.arg("-p").arg(pubkey);
        }
        cmd.arg("-m").arg(file);
        cmd.arg("-x").arg(signature_path(file));

        match cmd.run_and_check() {
            Ok(()) => Ok(()),
            Err(e) if matches!(*e, DependencyError::ExecutionFailed { .. }) => {
                Err(NeuralupgradeError::with_source(
                    VerificationError::SignatureVerificationFailed {
                        path: file.display().to_string(),
                    },
                    (*e).into(),
                ))
            }
            Err(e) => Err(NeuralupgradeError::from(*e))
                .message(format!("Failed to verify '{}'", file.display())),
        }
    }
}

/// Detached signature path of `file`, e.g. `psyopsOS.tar` => `psyopsOS.tar.minisig`.
pub fn signature_path(file: impl AsRef<Path>) -> PathBuf {
    let mut path = OsString::from(file.as_ref().as_os_str());
    path.push(".");
    path.push(MINISIG_EXTENSION);
    path.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_path() {
        assert_eq!(
            signature_path("/tmp/psyopsOS.x86_64.20240301-120000.tar"),
            PathBuf::from("/tmp/psyopsOS.x86_64.20240301-120000.tar.minisig")
        );
        assert_eq!(
            signature_path("relative/psyopsESP.tar"),
            PathBuf::from("relative/psyopsESP.tar.minisig")
        );
    }
}
