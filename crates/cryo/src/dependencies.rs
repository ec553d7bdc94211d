//! Copying native files into the target directory
//!
//! [`DependencyCopier`] collects every file that ends up next to the
//! executables: extension modules, the shared libraries they (and the base
//! stub) link against, and user-listed extra files. Files are keyed by their
//! canonical source path, so a library needed by several binaries is copied
//! once.

use std::{
    fs,
    path::{Path, PathBuf},
};

use indexmap::IndexMap;
use log::{debug, trace};
use rustc_hash::{FxHashMap, FxHashSet};
use sha2::{Digest, Sha256};

use crate::{
    error::{FailureKind, Warning},
    fs_util::copy_atomic,
    introspect::DependencyIntrospector,
    request::BinaryFilters,
    resolver::canonicalize_path,
};

/// Why a file is being copied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRole {
    /// A shared library some binary links against
    Library,
    /// A native extension module
    Extension,
    /// A file listed by the user
    Data,
}

/// A physical file slated for copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyFile {
    /// Canonical absolute source path
    pub source: PathBuf,
    /// Path relative to the target directory
    pub target: PathBuf,
    pub role: FileRole,
}

/// Library name with trailing version numbers dropped: `libssl.so.3` is
/// `libssl.so`. Windows names compare case-insensitively.
fn normalized_name(name: &str) -> String {
    let name = match name.find(".so.") {
        Some(index) => &name[..index + 3],
        None => name,
    };
    if cfg!(windows) {
        name.to_ascii_lowercase()
    } else {
        name.to_owned()
    }
}

/// Collects files to copy and the shared-library closure of binaries
pub struct DependencyCopier<'a> {
    introspector: &'a dyn DependencyIntrospector,
    filters: BinaryFilters,
    files: IndexMap<PathBuf, DependencyFile>,
    /// Target path to the source that claimed it
    targets: FxHashMap<PathBuf, PathBuf>,
    /// Binaries whose dependencies were already listed
    processed: FxHashSet<PathBuf>,
    warnings: Vec<Warning>,
}

impl std::fmt::Debug for DependencyCopier<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyCopier")
            .field("filters", &self.filters)
            .field("files", &self.files.len())
            .field("warnings", &self.warnings)
            .finish_non_exhaustive()
    }
}

impl<'a> DependencyCopier<'a> {
    pub fn new(introspector: &'a dyn DependencyIntrospector, filters: BinaryFilters) -> Self {
        Self {
            introspector,
            filters,
            files: IndexMap::new(),
            targets: FxHashMap::default(),
            processed: FxHashSet::default(),
            warnings: Vec::new(),
        }
    }

    /// Whether a library called `name` found at `path` should be copied
    pub fn should_copy(&self, name: &str, path: &Path) -> bool {
        let name = normalized_name(name);
        if self.filters.includes.iter().any(|n| normalized_name(n) == name) {
            return true;
        }
        if self.filters.excludes.iter().any(|n| normalized_name(n) == name) {
            return false;
        }
        let dir = path.parent().unwrap_or(path);
        if self.filters.path_includes.iter().any(|p| dir.starts_with(p)) {
            return true;
        }
        if self.filters.path_excludes.iter().any(|p| dir.starts_with(p)) {
            return false;
        }
        true
    }

    /// Schedule `source` to be copied to `target`.
    ///
    /// Returns `false` when nothing new was scheduled: the source is already
    /// scheduled, or another file already claims the target. Identical
    /// content under the same target is silently shared; differing content
    /// keeps the first file and records a warning.
    pub fn add_file(
        &mut self,
        source: &Path,
        target: impl Into<PathBuf>,
        role: FileRole,
    ) -> Result<bool, FailureKind> {
        let source = canonicalize_path(source.to_path_buf());
        let target = target.into();
        if self.files.contains_key(&source) {
            return Ok(false);
        }
        if let Some(kept) = self.targets.get(&target) {
            if file_digest(kept)? != file_digest(&source)? {
                self.warnings.push(Warning::DependencyConflict {
                    target,
                    kept: kept.clone(),
                    skipped: source,
                });
            }
            return Ok(false);
        }

        debug!("Scheduling {} as {}", source.display(), target.display());
        self.targets.insert(target.clone(), source.clone());
        self.files.insert(
            source.clone(),
            DependencyFile {
                source,
                target,
                role,
            },
        );
        Ok(true)
    }

    /// Schedule the shared-library closure of `binary`.
    ///
    /// With `fatal`, a library that cannot be located fails the run;
    /// otherwise it is recorded as a warning.
    pub fn add_binary_dependencies(&mut self, binary: &Path, fatal: bool) -> Result<(), FailureKind> {
        let mut pending = vec![canonicalize_path(binary.to_path_buf())];
        while let Some(current) = pending.pop() {
            if !self.processed.insert(current.clone()) {
                continue;
            }
            for library in self.introspector.list_direct_dependencies(&current)? {
                let Some(path) = library.path else {
                    if self.is_excluded_name(&library.name) {
                        trace!("{} is excluded; not looking for it", library.name);
                        continue;
                    }
                    if fatal {
                        return Err(FailureKind::DependencyNotFound {
                            binary: current,
                            name: library.name,
                        });
                    }
                    self.warnings.push(Warning::DependencyNotFound {
                        binary: current.clone(),
                        name: library.name,
                    });
                    continue;
                };
                if !self.should_copy(&library.name, &path) {
                    trace!("Skipping system library {}", path.display());
                    continue;
                }
                // Copied under the name the binary asks for
                let target = Path::new(&library.name)
                    .file_name()
                    .map_or_else(|| PathBuf::from(&library.name), PathBuf::from);
                self.add_file(&path, target, FileRole::Library)?;
                pending.push(canonicalize_path(path));
            }
        }
        Ok(())
    }

    fn is_excluded_name(&self, name: &str) -> bool {
        let name = normalized_name(name);
        self.filters.excludes.iter().any(|n| normalized_name(n) == name)
    }

    pub fn files(&self) -> impl Iterator<Item = &DependencyFile> {
        self.files.values()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Copy every scheduled file below `target_dir`
    pub fn copy_all(&self, target_dir: &Path) -> Result<Vec<DependencyFile>, FailureKind> {
        let mut copied = Vec::with_capacity(self.files.len());
        for file in self.files.values() {
            let dest = target_dir.join(&file.target);
            trace!("Copying {} to {}", file.source.display(), dest.display());
            copy_atomic(&file.source, &dest)?;
            copied.push(file.clone());
        }
        Ok(copied)
    }

    /// Sorted target names of copied libraries and extension modules, one per line
    pub fn listing(&self) -> String {
        let mut names: Vec<String> = self
            .files
            .values()
            .filter(|f| f.role != FileRole::Data)
            .map(|f| f.target.to_string_lossy().into_owned())
            .collect();
        names.sort();
        let mut listing = names.join("\n");
        if !listing.is_empty() {
            listing.push('\n');
        }
        listing
    }

    pub fn into_warnings(self) -> Vec<Warning> {
        self.warnings
    }
}

fn file_digest(path: &Path) -> Result<Vec<u8>, FailureKind> {
    let data = fs::read(path).map_err(|e| FailureKind::io(path, e))?;
    Ok(Sha256::digest(&data).to_vec())
}
