//! Freezes Python programs into self-contained executables.
//!
//! [`freezer::Freezer`] drives the pipeline: [`finder::ModuleFinder`]
//! discovers the modules a script needs, [`archive::ArchiveBuilder`] compiles
//! them into a zip archive, [`dependencies::DependencyCopier`] copies native
//! extensions and their shared libraries, and
//! [`assembler::ExecutableAssembler`] writes the launcher executables.

pub mod archive;
pub mod assembler;
pub mod bases;
pub mod compiler;
pub mod config;
pub mod dependencies;
pub mod error;
pub mod finder;
pub mod freezer;
pub mod fs_util;
pub mod icon;
pub mod import_scanner;
pub mod introspect;
pub mod module_graph;
pub mod path_rewriter;
pub mod request;
pub mod resolver;
pub mod runtime;
pub mod stdlib_detection;

pub use error::{FailureKind, FreezeError, Step, Warning};
pub use freezer::{FreezeManifest, Freezer, freeze};
pub use request::{Executable, FreezeRequest};
