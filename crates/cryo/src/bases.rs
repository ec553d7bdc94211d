//! Locating base stubs and init scripts
//!
//! Base stubs are prebuilt launcher executables; init scripts are the Python
//! bootstrap each launcher runs before the frozen entry point. Both ship in
//! directories next to the installed `cryo` binary.

use std::{
    env::consts::{ARCH, EXE_SUFFIX, OS},
    path::{Path, PathBuf},
};

use log::debug;

use crate::error::FailureKind;

/// Finds base stubs and init scripts by name
pub trait BaseResolver {
    fn find_base(&self, name: &str) -> Result<PathBuf, FailureKind>;
    fn find_init_script(&self, name: &str) -> Result<PathBuf, FailureKind>;
}

/// Directories holding the shipped stubs and init scripts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    pub bases_dir: PathBuf,
    pub initscripts_dir: PathBuf,
}

impl InstallLayout {
    pub fn new(bases_dir: impl Into<PathBuf>, initscripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            bases_dir: bases_dir.into(),
            initscripts_dir: initscripts_dir.into(),
        }
    }

    /// `bases/` and `initscripts/` under `root`
    pub fn under(root: &Path) -> Self {
        Self::new(root.join("bases"), root.join("initscripts"))
    }

    /// Layout next to the running executable
    pub fn from_current_exe() -> Result<Self, FailureKind> {
        let exe = std::env::current_exe().map_err(|e| FailureKind::io("<current executable>", e))?;
        let root = exe.parent().unwrap_or_else(|| Path::new("."));
        Ok(Self::under(root))
    }

    fn base_candidates(&self, name: &str) -> Vec<PathBuf> {
        let mut candidates = vec![self.bases_dir.join(name)];
        if !EXE_SUFFIX.is_empty() && !name.ends_with(EXE_SUFFIX) {
            candidates.push(self.bases_dir.join(format!("{name}{EXE_SUFFIX}")));
        }
        candidates.push(
            self.bases_dir
                .join(format!("{name}-{OS}-{ARCH}{EXE_SUFFIX}")),
        );
        candidates
    }
}

impl BaseResolver for InstallLayout {
    fn find_base(&self, name: &str) -> Result<PathBuf, FailureKind> {
        let path = Path::new(name);
        if path.is_absolute() {
            return if path.is_file() {
                Ok(path.to_path_buf())
            } else {
                Err(FailureKind::BaseNotFound {
                    name: name.to_owned(),
                })
            };
        }
        let found = self.base_candidates(name).into_iter().find(|c| c.is_file());
        match found {
            Some(base) => {
                debug!("Using base {}", base.display());
                Ok(base)
            }
            None => Err(FailureKind::BaseNotFound {
                name: name.to_owned(),
            }),
        }
    }

    fn find_init_script(&self, name: &str) -> Result<PathBuf, FailureKind> {
        let path = Path::new(name);
        let candidates = if path.is_absolute() {
            vec![path.to_path_buf()]
        } else {
            vec![
                self.initscripts_dir.join(format!("{name}.py")),
                self.initscripts_dir.join(name),
            ]
        };
        candidates
            .into_iter()
            .find(|c| c.is_file())
            .ok_or_else(|| FailureKind::InitScriptNotFound {
                name: name.to_owned(),
            })
    }
}

/// Executable extension of a base stub, taken from its own file name
pub fn native_extension(base: &Path) -> Option<&str> {
    base.extension()
        .and_then(|e| e.to_str())
        .filter(|e| e.eq_ignore_ascii_case("exe"))
}
