//! Running the host tools neuralupgrade depends on.
//!
//! Every invocation goes through [`Dependency::cmd`], which resolves the tool on `$PATH`, logs
//! the command line, and turns failures into a [`DependencyError`] carrying the captured output.

use std::{
    borrow::Cow,
    ffi::{OsStr, OsString},
    io,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{self, ExitStatus},
};

use log::{debug, trace};
use strum_macros::IntoStaticStr;

use neuralupgrade_api::error::{
    ExecutionEnvironmentError, NeuralupgradeError, NeuralupgradeResultExt, ServicingError,
};

#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("'{dependency}' is not installed: {source}")]
    NotFound {
        dependency: Dependency,
        #[source]
        source: which::Error,
    },

    #[error("'{dependency}' could not be started: {inner}")]
    CouldNotExecute {
        dependency: Dependency,
        #[source]
        inner: io::Error,
    },

    #[error("'{command}' {explanation}\n{output}")]
    ExecutionFailed {
        dependency: Dependency,
        command: String,
        code: Option<i32>,
        explanation: String,
        output: String,
    },
}

impl DependencyError {
    /// Exit code of a command that ran and failed.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ExecutionFailed { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<DependencyError> for NeuralupgradeError {
    #[track_caller]
    fn from(value: DependencyError) -> Self {
        match value {
            DependencyError::NotFound { dependency, source } => NeuralupgradeError::with_source(
                ExecutionEnvironmentError::MissingBinary {
                    binary: dependency.name(),
                },
                source.into(),
            ),
            DependencyError::CouldNotExecute { dependency, inner } => {
                NeuralupgradeError::with_source(
                    ServicingError::CommandCouldNotExecute {
                        binary: dependency.name(),
                    },
                    inner.into(),
                )
            }
            DependencyError::ExecutionFailed {
                dependency,
                explanation,
                output,
                ..
            } => NeuralupgradeError::with_source(
                ServicingError::CommandFailed {
                    binary: dependency.name(),
                    explanation,
                },
                anyhow::anyhow!(output),
            ),
        }
    }
}

pub trait DependencyResultExt<T> {
    /// Converts into a structured error and attaches `context`.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, NeuralupgradeError>;
}

impl<T> DependencyResultExt<T> for Result<T, Box<DependencyError>> {
    #[track_caller]
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, NeuralupgradeError> {
        self.map_err(|e| NeuralupgradeError::from(*e))
            .message(context)
    }
}

/// Host tools neuralupgrade shells out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Dependency {
    Blkid,
    Findmnt,
    #[strum(serialize = "grub-install")]
    GrubInstall,
    Minisign,
    Mkimage,
    Mount,
    Mountpoint,
    Umount,
    #[cfg(test)]
    DoesNotExist,
    #[cfg(test)]
    Echo,
    #[cfg(test)]
    False,
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Dependency {
    /// Executable name, e.g. `grub-install`.
    pub fn name(&self) -> &'static str {
        self.into()
    }

    fn locate(&self) -> Result<PathBuf, Box<DependencyError>> {
        which::which(self.name()).map_err(|source| {
            Box::new(DependencyError::NotFound {
                dependency: *self,
                source,
            })
        })
    }

    pub fn cmd(&self) -> Command {
        Command {
            dependency: *self,
            args: Vec::new(),
        }
    }
}

/// One invocation of a [`Dependency`].
pub struct Command {
    dependency: Dependency,
    args: Vec<OsString>,
}

impl Command {
    pub fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.args.push(arg.as_ref().into());
        self
    }

    pub fn with_arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.arg(arg);
        self
    }

    pub fn args(&mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> &mut Self {
        self.args.extend(args.into_iter().map(|a| a.as_ref().into()));
        self
    }

    /// Runs to completion and fails unless the command exits with status 0.
    pub fn run_and_check(&self) -> Result<(), Box<DependencyError>> {
        self.run()?.check()
    }

    /// Like [`Command::run_and_check`], returning stdout.
    pub fn output_and_check(&self) -> Result<String, Box<DependencyError>> {
        let captured = self.run()?;
        captured.check()?;
        Ok(captured.stdout)
    }

    /// The command line as it would be typed, with arguments containing spaces quoted.
    pub fn render(&self) -> String {
        let mut rendered = self.dependency.name().to_owned();
        for arg in &self.args {
            let arg = arg.to_string_lossy();
            rendered.push(' ');
            if arg.contains(' ') {
                rendered.push_str(&format!("'{arg}'"));
            } else {
                rendered.push_str(&arg);
            }
        }
        rendered
    }

    fn run(&self) -> Result<Captured, Box<DependencyError>> {
        let command = self.render();
        debug!("Running '{command}'");
        let output = process::Command::new(self.dependency.locate()?)
            .args(&self.args)
            .output()
            .map_err(|inner| DependencyError::CouldNotExecute {
                dependency: self.dependency,
                inner,
            })?;
        let captured = Captured {
            dependency: self.dependency,
            command,
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into(),
            stderr: String::from_utf8_lossy(&output.stderr).into(),
        };
        trace!(
            "'{}' {}\n{}",
            captured.command,
            captured.explain(),
            captured.report()
        );
        Ok(captured)
    }
}

/// Exit status and output of a finished command.
struct Captured {
    dependency: Dependency,
    command: String,
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl Captured {
    fn check(&self) -> Result<(), Box<DependencyError>> {
        if self.status.success() {
            return Ok(());
        }
        let report = self.report();
        Err(Box::new(DependencyError::ExecutionFailed {
            dependency: self.dependency,
            command: self.command.clone(),
            code: self.status.code(),
            explanation: self.explain(),
            output: if report.is_empty() {
                "(no output)".into()
            } else {
                report
            },
        }))
    }

    /// Non-empty streams, each under a heading.
    fn report(&self) -> String {
        let mut report = String::new();
        for (name, text) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            if !text.is_empty() {
                report.push_str(&format!("{name}:\n{text}\n"));
            }
        }
        report
    }

    fn explain(&self) -> String {
        match (self.status.code(), self.status.signal()) {
            (Some(code), _) => format!("exited with status {code}"),
            (None, Some(signal)) => format!("was killed by signal {signal}"),
            (None, None) => "exited abnormally".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use neuralupgrade_api::error::ErrorKind;

    use super::*;

    #[test]
    fn test_render() {
        let mut cmd = Dependency::GrubInstall.cmd();
        cmd.arg("--target=x86_64-efi")
            .args(["--efi-directory", "/mnt/psyopsOS/efisys"])
            .arg("--removable");
        assert_eq!(
            cmd.render(),
            "grub-install --target=x86_64-efi --efi-directory /mnt/psyopsOS/efisys --removable"
        );

        let cmd = Dependency::Mkimage.cmd().with_arg("psyopsOS Boot Script");
        assert_eq!(cmd.render(), "mkimage 'psyopsOS Boot Script'");
    }

    #[test]
    fn test_output_and_check() {
        let stdout = Dependency::Echo
            .cmd()
            .with_arg("psyopsos=psyopsOS-A")
            .with_arg("ro")
            .output_and_check()
            .unwrap();
        assert_eq!(stdout, "psyopsos=psyopsOS-A ro\n");

        let error = Dependency::False.cmd().run_and_check().unwrap_err();
        assert_eq!(error.exit_code(), Some(1));
        let rendered = error.to_string();
        assert!(rendered.contains("'false' exited with status 1"));
        assert!(rendered.contains("(no output)"));
    }

    #[test]
    fn test_missing_dependency() {
        let error = Dependency::DoesNotExist.cmd().run_and_check().unwrap_err();
        assert!(matches!(*error, DependencyError::NotFound { .. }));
        assert_eq!(error.exit_code(), None);

        let error = Err::<(), _>(error).message("Probing").unwrap_err();
        assert!(matches!(
            error.kind(),
            ErrorKind::ExecutionEnvironment(ExecutionEnvironmentError::MissingBinary {
                binary: "doesnotexist"
            })
        ));
    }

    #[test]
    fn test_failed_dependency_is_servicing_error() {
        let error: NeuralupgradeError =
            (*Dependency::False.cmd().run_and_check().unwrap_err()).into();
        assert!(matches!(
            error.kind(),
            ErrorKind::Servicing(ServicingError::CommandFailed { binary: "false", .. })
        ));
    }
}
