use std::{
    borrow::Cow,
    fmt::{Debug, Formatter, Write},
    panic::Location,
    path::PathBuf,
};

use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;

/// A partition, device or mountpoint could not be located.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionError {
    #[error("No unique block device found with label '{label}'")]
    DeviceNotFound { label: String },
    #[error(
        "No mountpoint found in '{fstab}' for device '{device}' or 'LABEL={label}', \
        pass the mountpoint explicitly"
    )]
    MountpointNotFound {
        label: String,
        device: String,
        fstab: String,
    },
    #[error("Could not determine the booted side from '{path}', expected '{key}=<label>'")]
    BootedSideUnknown { path: String, key: String },
    #[error("Label '{label}' is not one of the OS partition labels '{a}' or '{b}'")]
    NotAnOsLabel { label: String, a: String, b: String },
}

/// Mounting, remounting or unmounting a filesystem failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum MountError {
    #[error("Failed to mount '{device}' at '{mountpoint}'")]
    Mount { device: String, mountpoint: String },
    #[error("Failed to remount '{mountpoint}' as '{mode}'")]
    Remount { mountpoint: String, mode: String },
    #[error("Failed to unmount '{mountpoint}' after {attempts} attempts")]
    Umount { mountpoint: String, attempts: u32 },
    #[error("Failed to query where '{device}' is mounted")]
    QueryMounts { device: String },
    #[error("Filesystem '{label}' is already held read-only and cannot be reused for writing")]
    HeldReadOnly { label: String },
}

/// A payload failed signature verification.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationError {
    #[error("Signature verification failed for '{path}'")]
    SignatureVerificationFailed { path: String },
}

/// Embedded metadata could not be read or parsed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataError {
    #[error("No trusted comment found in signature")]
    NoTrustedComment,
    #[error("Signature file '{path}' is empty")]
    EmptySignatureFile { path: String },
    #[error("No neuralupgrade-info comment found in '{path}'")]
    MissingBootInfoComment { path: String },
    #[error("Comment does not start with the neuralupgrade-info prefix: '{comment}'")]
    InvalidBootInfoComment { comment: String },
    #[error("Exactly one metadata source must be given, got {count}")]
    InvalidSource { count: usize },
    #[error("missing minisig at '{path}'")]
    MissingSignature { path: String },
    #[error("missing file at '{path}'")]
    MissingFile { path: String },
    #[error("Failed to read '{path}': {reason}")]
    ReadFile { path: String, reason: String },
    #[error("Partition '{label}' is unavailable: {reason}")]
    PartitionUnavailable { label: String, reason: String },
}

/// The caller asked for something that cannot be done.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidInputError {
    #[error("Target 'nonbooted' cannot be combined with explicit 'a' or 'b' targets")]
    NonbootedWithExplicitSide,
    #[error("An OS tarball is required to update targets {targets}")]
    MissingOsTarball { targets: String },
    #[error("Cannot infer default boot label: no boot configuration at '{path}', pass --default-boot-label")]
    CannotInferDefaultBootLabel { path: PathBuf },
    #[error("Default boot label '{label}' is not one of '{a}' or '{b}'")]
    InvalidDefaultBootLabel { label: String, a: String, b: String },
    #[error("Filesystem labels must be distinct, got efisys '{efisys}', a '{a}', b '{b}'")]
    DuplicateLabels { efisys: String, a: String, b: String },
    #[error("Failed to load configuration file '{path}'")]
    LoadConfig { path: PathBuf },
    #[error("Invalid value for '{key}' in configuration file '{path}'")]
    InvalidConfigValue { path: PathBuf, key: String },
}

/// Some step of an update failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ServicingError {
    #[error("Failed to extract '{tarball}' to '{destination}'")]
    ExtractTarball { tarball: String, destination: String },
    #[error("Failed to copy signature '{from}' to '{to}'")]
    CopySignature { from: String, to: String },
    #[error("Failed to write boot configuration '{path}'")]
    WriteBootConfig { path: String },
    #[error("Failed to compile boot script '{path}'")]
    CompileBootScript { path: String },
    #[error("Failed to copy firmware file '{path}'")]
    CopyFirmware { path: String },
    #[error("Failed to read the extra programs manifest '{path}'")]
    ReadManifest { path: String },
    #[error("Failed to download '{url}'")]
    Download { url: String },
    #[error("Command '{binary}' failed: {explanation}")]
    CommandFailed {
        binary: &'static str,
        explanation: String,
    },
    #[error("Could not execute '{binary}'")]
    CommandCouldNotExecute { binary: &'static str },
}

/// The host is missing something neuralupgrade needs.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionEnvironmentError {
    #[error("Required binary '{binary}' was not found")]
    MissingBinary { binary: &'static str },
    #[error("Unable to detect firmware platform, pass --bootloader")]
    UnknownFirmware,
    #[error("Architecture '{arch}' is not supported by '{bootloader}'")]
    UnsupportedArchitecture {
        arch: String,
        bootloader: &'static str,
    },
}

/// Releasing resources failed.
#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum CleanupError {
    #[error("{count} error(s) occurred while releasing resources")]
    Aggregated { count: usize },
}

#[derive(Debug, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalError {
    #[error("Internal error: {0}")]
    Internal(&'static str),
    #[error("Failed to serialize report")]
    SerializeReport,
}

/// Each variant of `ErrorKind` is a user-meaningful category of failure.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum ErrorKind {
    /// A label, device or mountpoint could not be resolved. The user must supply an override.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// A mount operation failed.
    #[error(transparent)]
    Mount(#[from] MountError),

    /// A payload could not be verified.
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// Embedded metadata required by the operation was missing or malformed.
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    /// Some step of an update failed.
    #[error(transparent)]
    Servicing(#[from] ServicingError),

    #[error(transparent)]
    ExecutionEnvironment(#[from] ExecutionEnvironmentError),

    /// Releasing mounts failed. The individual failures are attached as related errors.
    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error(transparent)]
    Internal(#[from] InternalError),
}

#[derive(Debug)]
struct NeuralupgradeErrorInner {
    kind: ErrorKind,
    location: &'static Location<'static>,
    source: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, &'static Location<'static>)>,
    related: Vec<NeuralupgradeError>,
}

pub struct NeuralupgradeError(Box<NeuralupgradeErrorInner>);
impl NeuralupgradeError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        Self::build(kind.into(), None, Location::caller())
    }

    #[track_caller]
    pub fn with_source(kind: impl Into<ErrorKind>, source: anyhow::Error) -> Self {
        Self::build(kind.into(), Some(source), Location::caller())
    }

    fn build(
        kind: ErrorKind,
        source: Option<anyhow::Error>,
        location: &'static Location<'static>,
    ) -> Self {
        NeuralupgradeError(Box::new(NeuralupgradeErrorInner {
            kind,
            location,
            source,
            context: Vec::new(),
            related: Vec::new(),
        }))
    }

    /// Combine every error collected while releasing resources into one. Returns `None` when
    /// nothing failed.
    #[track_caller]
    pub fn aggregate(errors: Vec<NeuralupgradeError>) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let mut aggregated = Self::new(CleanupError::Aggregated {
            count: errors.len(),
        });
        aggregated.0.related = errors;
        Some(aggregated)
    }

    /// Attach an error that was raised while handling this one. Both are reported.
    #[track_caller]
    pub fn secondary_error_context(mut self, secondary: NeuralupgradeError) -> Self {
        self.0.context.push((
            format!(
                "While handling the error, an additional error was caught: {}",
                secondary.kind()
            )
            .into(),
            Location::caller(),
        ));
        self.0.related.push(secondary);
        self
    }

    /// Returns a reference to the inner ErrorKind.
    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }

    /// Errors attached through aggregation or as secondary errors.
    pub fn related(&self) -> &[NeuralupgradeError] {
        &self.0.related
    }
}

pub trait ReportError<T, K> {
    /// Convert this error into a structured NeuralupgradeError.
    fn structured(self, kind: K) -> Result<T, NeuralupgradeError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, NeuralupgradeError> {
        match self {
            Some(t) => Ok(t),
            None => Err(NeuralupgradeError::build(
                kind.into(),
                None,
                Location::caller(),
            )),
        }
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, NeuralupgradeError> {
        match self {
            Ok(o) => Ok(o),
            Err(e) => Err(NeuralupgradeError::build(
                kind.into(),
                Some(e.into()),
                Location::caller(),
            )),
        }
    }
}

pub trait NeuralupgradeResultExt<T> {
    /// Attach a context message to the error.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, NeuralupgradeError>;
}
impl<T> NeuralupgradeResultExt<T> for Result<T, NeuralupgradeError> {
    #[track_caller]
    fn message(mut self, context: impl Into<Cow<'static, str>>) -> Result<T, NeuralupgradeError> {
        if let Err(ref mut e) = self {
            e.0.context.push((context.into(), Location::caller()));
        }
        self
    }
}

/// Writes `text` as entry `index` of a numbered list.
fn write_entry(f: &mut Formatter<'_>, index: usize, text: &str) -> std::fmt::Result {
    let mut lines = text.lines();
    write!(f, "{index:>5}: {}", lines.next().unwrap_or_default())?;
    for line in lines {
        write!(f, "\n       {line}")?;
    }
    Ok(())
}

impl Debug for NeuralupgradeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let at = |location: &Location<'_>| format!("{}:{}", location.file(), location.line());
        write!(f, "{} at {}", self.0.kind, at(self.0.location))?;

        if !self.0.context.is_empty() {
            f.write_str("\n\nContext:\n")?;
            for (index, (context, location)) in self.0.context.iter().enumerate() {
                write_entry(f, index, context)?;
                writeln!(f, " at {}", at(location))?;
            }
        }

        if let Some(ref source) = self.0.source {
            f.write_str("\n\nCaused by:\n")?;
            for (index, cause) in source.chain().enumerate() {
                write_entry(f, index, &cause.to_string())?;
                f.write_char('\n')?;
            }
        }

        for (index, related) in self.0.related.iter().enumerate() {
            writeln!(f, "\n\nRelated error {}:", index + 1)?;
            for line in format!("{related:?}").lines() {
                writeln!(f, "    {line}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn test_error_debug() {
        let error = Err::<(), _>(anyhow::anyhow!("z"))
            .context("x\ny")
            .structured(InternalError::Internal("w"))
            .unwrap_err();
        assert_eq!(
            format!("{error:?}"),
            format!(
                "Internal error: w at {}:{}\n\nCaused by:\n    0: x\n       y\n    1: z\n",
                error.0.location.file(),
                error.0.location.line(),
            ),
        );
    }

    #[test]
    fn test_aggregate() {
        assert!(NeuralupgradeError::aggregate(Vec::new()).is_none());

        let aggregated = NeuralupgradeError::aggregate(vec![
            NeuralupgradeError::new(MountError::Umount {
                mountpoint: "/mnt/a".into(),
                attempts: 3,
            }),
            NeuralupgradeError::new(MountError::Remount {
                mountpoint: "/mnt/efisys".into(),
                mode: "ro".into(),
            }),
        ])
        .unwrap();
        assert_eq!(
            aggregated.kind(),
            &ErrorKind::Cleanup(CleanupError::Aggregated { count: 2 })
        );
        assert_eq!(aggregated.related().len(), 2);

        let rendered = format!("{aggregated:?}");
        assert!(rendered.contains("Failed to unmount '/mnt/a' after 3 attempts"));
        assert!(rendered.contains("Failed to remount '/mnt/efisys' as 'ro'"));
    }

    #[test]
    fn test_secondary_error_context() {
        let primary = NeuralupgradeError::new(VerificationError::SignatureVerificationFailed {
            path: "/tmp/psyopsOS.tar".into(),
        });
        let cleanup = NeuralupgradeError::aggregate(vec![NeuralupgradeError::new(
            MountError::Umount {
                mountpoint: "/mnt/b".into(),
                attempts: 3,
            },
        )])
        .unwrap();

        let combined = primary.secondary_error_context(cleanup);
        assert!(matches!(
            combined.kind(),
            ErrorKind::Verification(VerificationError::SignatureVerificationFailed { .. })
        ));
        assert_eq!(combined.related().len(), 1);
        assert_eq!(combined.related()[0].related().len(), 1);
        assert!(format!("{combined:?}").contains("/mnt/b"));
    }
}
