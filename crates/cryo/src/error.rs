//! Error and warning taxonomy for a freeze run
//!
//! Every fatal failure carries the pipeline [`Step`] it happened in and a
//! [`FailureKind`] naming the offending entity. Components return
//! `Result<T, FailureKind>` and the orchestrator attaches the step.
//! Non-fatal problems are collected as [`Warning`]s and returned with the
//! manifest.

use std::{fmt, io, path::PathBuf};

use thiserror::Error;

/// Pipeline step of a freeze run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Init,
    Discover,
    Build,
    Copy,
    Assemble,
}

impl Step {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Discover => "discover",
            Self::Build => "build",
            Self::Copy => "copy",
            Self::Assemble => "assemble",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fatal error returned by [`crate::freezer::Freezer::freeze`]
#[derive(Debug, Error)]
#[error("{step} step failed: {kind}")]
pub struct FreezeError {
    pub step: Step,
    #[source]
    pub kind: FailureKind,
}

impl FreezeError {
    pub fn new(step: Step, kind: FailureKind) -> Self {
        Self { step, kind }
    }

    /// Shorthand for a request validation failure
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::new(
            Step::Init,
            FailureKind::RequestInvalid {
                reason: reason.into(),
            },
        )
    }
}

/// What went wrong, and with which entity
#[derive(Debug, Error)]
pub enum FailureKind {
    #[error("invalid freeze request: {reason}")]
    RequestInvalid { reason: String },

    #[error("no module named '{name}' (imported by {importer})")]
    ModuleNotFound { importer: String, name: String },

    #[error("cannot compile module '{module}' ({}): {message}", path.display())]
    CompileError {
        module: String,
        path: PathBuf,
        message: String,
    },

    #[error("bytecode compiler failed: {message}")]
    Compiler { message: String },

    #[error("cannot find library '{name}' required by {}", binary.display())]
    DependencyNotFound { binary: PathBuf, name: String },

    #[error("cannot find base executable '{name}'")]
    BaseNotFound { name: String },

    #[error("cannot find init script '{name}'")]
    InitScriptNotFound { name: String },

    #[error("cannot query Python runtime {}: {message}", python.display())]
    Runtime { python: PathBuf, message: String },

    #[error("cannot write archive: {message}")]
    Archive { message: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FailureKind {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<zip::result::ZipError> for FailureKind {
    fn from(err: zip::result::ZipError) -> Self {
        Self::Archive {
            message: err.to_string(),
        }
    }
}

/// Non-fatal problem recorded during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    /// An optional import could not be resolved
    MissingModule { importer: String, name: String },
    /// A shared library needed by an extension module was not found
    DependencyNotFound { binary: PathBuf, name: String },
    /// Two different files would be copied to the same target name
    DependencyConflict {
        target: PathBuf,
        kept: PathBuf,
        skipped: PathBuf,
    },
    /// The base executable format has no resource section for an icon
    IconUnsupported { executable: PathBuf, reason: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingModule { importer, name } => {
                write!(f, "missing module '{name}' imported from {importer}")
            }
            Self::DependencyNotFound { binary, name } => {
                write!(
                    f,
                    "cannot find library '{name}' required by {}",
                    binary.display()
                )
            }
            Self::DependencyConflict {
                target,
                kept,
                skipped,
            } => write!(
                f,
                "{} already provided by {}; skipping {}",
                target.display(),
                kept.display(),
                skipped.display()
            ),
            Self::IconUnsupported { executable, reason } => {
                write!(f, "icon not embedded in {}: {reason}", executable.display())
            }
        }
    }
}
