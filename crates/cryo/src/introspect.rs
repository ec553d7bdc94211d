//! Shared-library dependencies of native binaries
//!
//! Reads the dynamic import tables of ELF, PE and Mach-O files with goblin
//! and locates each library the way the platform loader would.

use std::{
    fs,
    path::{Path, PathBuf},
};

use goblin::{Object, mach::Mach};
use log::{debug, trace};

use crate::error::FailureKind;

/// One entry of a binary's dynamic import table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedLibrary {
    /// Name as recorded in the binary (soname, DLL name, install name)
    pub name: String,
    /// Where the loader would find it; `None` if nowhere
    pub path: Option<PathBuf>,
}

/// Lists the shared libraries a binary links against directly
pub trait DependencyIntrospector {
    fn list_direct_dependencies(&self, binary: &Path) -> Result<Vec<LinkedLibrary>, FailureKind>;
}

#[cfg(not(windows))]
const DEFAULT_LIBRARY_DIRS: &[&str] = &[
    "/lib",
    "/usr/lib",
    "/lib64",
    "/usr/lib64",
    "/lib/x86_64-linux-gnu",
    "/usr/lib/x86_64-linux-gnu",
    "/lib/aarch64-linux-gnu",
    "/usr/lib/aarch64-linux-gnu",
    "/usr/local/lib",
];
#[cfg(windows)]
const DEFAULT_LIBRARY_DIRS: &[&str] = &[];

/// Introspector backed by goblin's object parsers
#[derive(Debug, Clone, Default)]
pub struct GoblinIntrospector {
    /// Searched after the binary's own paths and before the system defaults
    search_dirs: Vec<PathBuf>,
}

impl GoblinIntrospector {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }

    /// Search path from the environment variable the platform loader reads
    #[must_use]
    pub fn with_loader_path(mut self) -> Self {
        let var = if cfg!(windows) {
            "PATH"
        } else if cfg!(target_os = "macos") {
            "DYLD_LIBRARY_PATH"
        } else {
            "LD_LIBRARY_PATH"
        };
        if let Some(value) = std::env::var_os(var) {
            self.search_dirs
                .extend(std::env::split_paths(&value).filter(|p| !p.as_os_str().is_empty()));
        }
        self
    }

    fn locate(&self, name: &str, first: &[PathBuf]) -> Option<PathBuf> {
        let candidate = Path::new(name);
        if candidate.is_absolute() {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }
        first
            .iter()
            .chain(&self.search_dirs)
            .cloned()
            .chain(DEFAULT_LIBRARY_DIRS.iter().map(PathBuf::from))
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    }

    fn elf_dependencies(
        &self,
        binary: &Path,
        elf: &goblin::elf::Elf<'_>,
    ) -> Vec<LinkedLibrary> {
        let origin = binary.parent().unwrap_or_else(|| Path::new("."));
        let expand = |entry: &str| -> Vec<PathBuf> {
            entry
                .split(':')
                .filter(|p| !p.is_empty())
                .map(|p| {
                    PathBuf::from(
                        p.replace("$ORIGIN", &origin.to_string_lossy())
                            .replace("${ORIGIN}", &origin.to_string_lossy()),
                    )
                })
                .collect()
        };
        // DT_RPATH is ignored when DT_RUNPATH is present
        let rpaths: Vec<PathBuf> = if elf.runpaths.is_empty() {
            elf.rpaths.iter().flat_map(|r| expand(r)).collect()
        } else {
            elf.runpaths.iter().flat_map(|r| expand(r)).collect()
        };

        elf.libraries
            .iter()
            .map(|name| LinkedLibrary {
                name: (*name).to_owned(),
                path: self.locate(name, &rpaths),
            })
            .collect()
    }

    fn pe_dependencies(&self, binary: &Path, pe: &goblin::pe::PE<'_>) -> Vec<LinkedLibrary> {
        let own_dir = vec![binary.parent().unwrap_or_else(|| Path::new(".")).to_path_buf()];
        pe.libraries
            .iter()
            // API sets are resolved inside the loader
            .filter(|name| !name.to_ascii_lowercase().starts_with("api-ms-win-"))
            .map(|name| LinkedLibrary {
                name: (*name).to_owned(),
                path: self.locate(name, &own_dir),
            })
            .collect()
    }

    fn macho_dependencies(
        &self,
        binary: &Path,
        macho: &goblin::mach::MachO<'_>,
    ) -> Vec<LinkedLibrary> {
        let loader_dir = binary.parent().unwrap_or_else(|| Path::new("."));
        let loader_dir = loader_dir.to_string_lossy();
        let rpaths: Vec<PathBuf> = macho
            .rpaths
            .iter()
            .map(|r| {
                PathBuf::from(
                    r.replace("@loader_path", &loader_dir)
                        .replace("@executable_path", &loader_dir),
                )
            })
            .collect();

        macho
            .libs
            .iter()
            .filter(|name| **name != "self")
            .map(|name| {
                let path = if let Some(rest) = name.strip_prefix("@rpath/") {
                    rpaths.iter().map(|dir| dir.join(rest)).find(|p| p.is_file())
                } else if let Some(rest) = name
                    .strip_prefix("@loader_path/")
                    .or_else(|| name.strip_prefix("@executable_path/"))
                {
                    let path = Path::new(loader_dir.as_ref()).join(rest);
                    path.is_file().then_some(path)
                } else {
                    self.locate(name, &[])
                };
                LinkedLibrary {
                    name: (*name).to_owned(),
                    path,
                }
            })
            .collect()
    }
}

impl DependencyIntrospector for GoblinIntrospector {
    fn list_direct_dependencies(&self, binary: &Path) -> Result<Vec<LinkedLibrary>, FailureKind> {
        let bytes = fs::read(binary).map_err(|e| FailureKind::io(binary, e))?;
        let libraries = match Object::parse(&bytes) {
            Ok(Object::Elf(elf)) => self.elf_dependencies(binary, &elf),
            Ok(Object::PE(pe)) => self.pe_dependencies(binary, &pe),
            Ok(Object::Mach(Mach::Binary(macho))) => self.macho_dependencies(binary, &macho),
            Ok(_) => {
                debug!(
                    "{} is not a single-architecture native binary; no dependencies listed",
                    binary.display()
                );
                Vec::new()
            }
            Err(e) => {
                debug!("Cannot parse {}: {e}", binary.display());
                Vec::new()
            }
        };
        trace!(
            "{} links against {:?}",
            binary.display(),
            libraries.iter().map(|l| l.name.as_str()).collect::<Vec<_>>()
        );
        Ok(libraries)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_non_binary_has_no_dependencies() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("notes.txt");
        fs::write(&path, "plain text")?;
        let deps = GoblinIntrospector::default().list_direct_dependencies(&path)?;
        assert!(deps.is_empty());
        Ok(())
    }

    #[test]
    fn test_unreadable_binary_is_io_error() {
        let err = GoblinIntrospector::default()
            .list_direct_dependencies(Path::new("/nonexistent/libcryo-test.so"))
            .expect_err("missing file");
        assert!(matches!(err, FailureKind::Io { .. }));
    }

    #[test]
    fn test_locate_prefers_binary_paths() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let first = temp_dir.path().join("first");
        let second = temp_dir.path().join("second");
        fs::create_dir_all(&first)?;
        fs::create_dir_all(&second)?;
        fs::write(first.join("libdemo.so.1"), b"")?;
        fs::write(second.join("libdemo.so.1"), b"")?;

        let introspector = GoblinIntrospector::new(vec![second.clone()]);
        assert_eq!(
            introspector.locate("libdemo.so.1", std::slice::from_ref(&first)),
            Some(first.join("libdemo.so.1"))
        );
        assert_eq!(
            introspector.locate("libdemo.so.1", &[]),
            Some(second.join("libdemo.so.1"))
        );
        assert_eq!(introspector.locate("libabsent-cryo.so", &[]), None);
        Ok(())
    }
}
