//! Strongly typed description of a freeze run
//!
//! A [`FreezeRequest`] is built once through [`FreezeRequestBuilder`],
//! validated at construction, and then only read by the engine.

use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use rustc_hash::FxHashSet;

use crate::{
    error::FreezeError,
    path_rewriter::{PathRewriter, ReplaceRule},
};

/// Base stub used when neither the request nor the executable names one
pub const DEFAULT_BASE: &str = "Console";
/// Init script for self-contained bundles
pub const DEFAULT_INIT_SCRIPT: &str = "Console";
/// Init script that keeps the host interpreter's search path
pub const KEEP_PATH_INIT_SCRIPT: &str = "ConsoleKeepPath";

/// Bytecode optimization level, as the runtime's `-O` flag counts it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum OptimizeLevel {
    /// Plain compilation
    #[default]
    None,
    /// `-O`: assert statements and `__debug__` blocks are removed
    StripAsserts,
    /// `-OO`: additionally removes doc strings
    StripDocstrings,
}

impl OptimizeLevel {
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::None => 0,
            Self::StripAsserts => 1,
            Self::StripDocstrings => 2,
        }
    }
}

impl TryFrom<u8> for OptimizeLevel {
    type Error = FreezeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::StripAsserts),
            2 => Ok(Self::StripDocstrings),
            other => Err(FreezeError::invalid(format!(
                "optimization level must be 0, 1 or 2, got {other}"
            ))),
        }
    }
}

/// Extra file stored verbatim in the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZipInclude {
    pub source: PathBuf,
    pub archive_name: String,
}

impl ZipInclude {
    /// A bare path is stored under its file name
    pub fn from_path(source: impl Into<PathBuf>) -> Result<Self, FreezeError> {
        let source = source.into();
        let Some(name) = source.file_name() else {
            return Err(FreezeError::invalid(format!(
                "zip include {} has no file name",
                source.display()
            )));
        };
        let archive_name = name.to_string_lossy().into_owned();
        Ok(Self {
            source,
            archive_name,
        })
    }

    pub fn with_name(source: impl Into<PathBuf>, archive_name: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            archive_name: archive_name.into(),
        }
    }

    /// Parse `path` or `path=archiveName`
    pub fn parse(spec: &str) -> Result<Self, FreezeError> {
        match spec.split_once('=') {
            Some((path, name)) if !path.is_empty() && !name.is_empty() => {
                Ok(Self::with_name(path, name))
            }
            Some(_) => Err(FreezeError::invalid(format!(
                "zip include '{spec}' is not of the form path=archiveName"
            ))),
            None => Self::from_path(spec),
        }
    }
}

/// One entry point to produce
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Executable {
    pub script: Option<PathBuf>,
    pub target_name: Option<String>,
    pub base: Option<String>,
    pub init_script: Option<String>,
    pub icon: Option<PathBuf>,
}

impl Executable {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: Some(script.into()),
            ..Self::default()
        }
    }

    /// An executable with no script of its own; only explicitly included
    /// modules end up in the bundle
    pub fn named(target_name: impl Into<String>) -> Self {
        Self {
            target_name: Some(target_name.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_target_name(mut self, name: impl Into<String>) -> Self {
        self.target_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    #[must_use]
    pub fn with_init_script(mut self, init_script: impl Into<String>) -> Self {
        self.init_script = Some(init_script.into());
        self
    }

    #[must_use]
    pub fn with_icon(mut self, icon: impl Into<PathBuf>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    /// Target stem known before the base stub is resolved
    fn provisional_stem(&self) -> Option<String> {
        let name = match (&self.target_name, &self.script) {
            (Some(name), _) => PathBuf::from(name),
            (None, Some(script)) => script.clone(),
            (None, None) => return None,
        };
        name.file_stem().map(|s| s.to_string_lossy().into_owned())
    }
}

/// Shared-library copy filters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryFilters {
    /// Library names always copied (version numbers ignored)
    pub includes: Vec<String>,
    /// Library names never copied (version numbers ignored)
    pub excludes: Vec<String>,
    /// Directories whose libraries are always copied
    pub path_includes: Vec<PathBuf>,
    /// Directories whose libraries are assumed present on the target
    pub path_excludes: Vec<PathBuf>,
}

impl BinaryFilters {
    /// System libraries every target machine is expected to provide
    pub fn platform_default() -> Self {
        if cfg!(windows) {
            let windir = std::env::var_os("WINDIR").map_or_else(
                || PathBuf::from(r"C:\Windows"),
                PathBuf::from,
            );
            Self {
                excludes: vec!["comctl32.dll".to_owned(), "oci.dll".to_owned()],
                path_excludes: vec![windir.join("system32"), windir.join("winsxs")],
                ..Self::default()
            }
        } else {
            Self {
                excludes: vec!["libclntsh.so".to_owned(), "libwtc9.so".to_owned()],
                path_excludes: ["/lib", "/lib32", "/lib64", "/usr/lib", "/usr/lib32", "/usr/lib64"]
                    .into_iter()
                    .map(PathBuf::from)
                    .collect(),
                ..Self::default()
            }
        }
    }

    #[must_use]
    pub fn merged(mut self, other: Self) -> Self {
        self.includes.extend(other.includes);
        self.excludes.extend(other.excludes);
        self.path_includes.extend(other.path_includes);
        self.path_excludes.extend(other.path_excludes);
        self
    }
}

/// Immutable configuration of one freeze run
#[derive(Debug, Clone)]
pub struct FreezeRequest {
    pub(crate) executables: Vec<Executable>,
    pub(crate) includes: IndexSet<String>,
    pub(crate) excludes: IndexSet<String>,
    pub(crate) packages: IndexSet<String>,
    pub(crate) path_rewriter: PathRewriter,
    pub(crate) compress: bool,
    pub(crate) optimize: OptimizeLevel,
    pub(crate) copy_dependent_files: bool,
    pub(crate) append_script_to_exe: bool,
    pub(crate) init_script: Option<String>,
    pub(crate) base: Option<String>,
    pub(crate) target_dir: PathBuf,
    pub(crate) include_path: Vec<PathBuf>,
    pub(crate) default_path: Vec<PathBuf>,
    pub(crate) zip_includes: Vec<ZipInclude>,
    pub(crate) include_files: Vec<(PathBuf, PathBuf)>,
    pub(crate) icon: Option<PathBuf>,
    pub(crate) ext_list_file: Option<PathBuf>,
    pub(crate) bin_filters: BinaryFilters,
    pub(crate) silent: bool,
}

impl FreezeRequest {
    pub fn builder() -> FreezeRequestBuilder {
        FreezeRequestBuilder::default()
    }

    pub fn executables(&self) -> &[Executable] {
        &self.executables
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    pub fn optimize(&self) -> OptimizeLevel {
        self.optimize
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    pub fn copy_dependent_files(&self) -> bool {
        self.copy_dependent_files
    }

    pub fn silent(&self) -> bool {
        self.silent
    }

    /// Excluded names that are not overridden by an explicit include.
    ///
    /// Include wins: a name (or an ancestor of a name) that is also listed in
    /// the include set is not excluded.
    pub(crate) fn is_excluded(&self, module: &str) -> bool {
        let overridden = self.includes.iter().chain(&self.packages).any(|include| {
            include == module
                || include
                    .strip_prefix(module)
                    .is_some_and(|rest| rest.starts_with('.'))
        });
        if overridden {
            return false;
        }
        self.excludes.iter().any(|exclude| {
            module == exclude
                || module
                    .strip_prefix(exclude.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }

    /// Init script to use when an executable does not name one
    pub(crate) fn default_init_script(&self) -> &str {
        match &self.init_script {
            Some(name) => name,
            None if self.copy_dependent_files => DEFAULT_INIT_SCRIPT,
            None => KEEP_PATH_INIT_SCRIPT,
        }
    }

    pub(crate) fn default_base(&self) -> &str {
        self.base.as_deref().unwrap_or(DEFAULT_BASE)
    }
}

/// Builder for [`FreezeRequest`]
#[derive(Debug, Clone)]
pub struct FreezeRequestBuilder {
    executables: Vec<Executable>,
    includes: Vec<String>,
    excludes: Vec<String>,
    packages: Vec<String>,
    replace_paths: Vec<ReplaceRule>,
    compress: bool,
    optimize: OptimizeLevel,
    copy_dependent_files: bool,
    append_script_to_exe: bool,
    init_script: Option<String>,
    base: Option<String>,
    target_dir: Option<PathBuf>,
    include_path: Vec<PathBuf>,
    default_path: Vec<PathBuf>,
    zip_includes: Vec<ZipInclude>,
    include_files: Vec<(PathBuf, PathBuf)>,
    icon: Option<PathBuf>,
    ext_list_file: Option<PathBuf>,
    bin_filters: BinaryFilters,
    silent: bool,
}

impl Default for FreezeRequestBuilder {
    fn default() -> Self {
        Self {
            executables: Vec::new(),
            includes: Vec::new(),
            excludes: Vec::new(),
            packages: Vec::new(),
            replace_paths: Vec::new(),
            compress: false,
            optimize: OptimizeLevel::None,
            copy_dependent_files: true,
            append_script_to_exe: true,
            init_script: None,
            base: None,
            target_dir: None,
            include_path: Vec::new(),
            default_path: Vec::new(),
            zip_includes: Vec::new(),
            include_files: Vec::new(),
            icon: None,
            ext_list_file: None,
            bin_filters: BinaryFilters::default(),
            silent: false,
        }
    }
}

impl FreezeRequestBuilder {
    #[must_use]
    pub fn executable(mut self, executable: Executable) -> Self {
        self.executables.push(executable);
        self
    }

    #[must_use]
    pub fn include_modules<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.includes.extend(names.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn exclude_modules<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excludes.extend(names.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn packages<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages.extend(names.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn replace_paths(mut self, rules: impl IntoIterator<Item = ReplaceRule>) -> Self {
        self.replace_paths.extend(rules);
        self
    }

    #[must_use]
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    #[must_use]
    pub fn optimize(mut self, level: OptimizeLevel) -> Self {
        self.optimize = level;
        self
    }

    #[must_use]
    pub fn copy_dependent_files(mut self, copy: bool) -> Self {
        self.copy_dependent_files = copy;
        self
    }

    #[must_use]
    pub fn append_script_to_exe(mut self, append: bool) -> Self {
        self.append_script_to_exe = append;
        self
    }

    #[must_use]
    pub fn init_script(mut self, name: impl Into<String>) -> Self {
        self.init_script = Some(name.into());
        self
    }

    #[must_use]
    pub fn base(mut self, name: impl Into<String>) -> Self {
        self.base = Some(name.into());
        self
    }

    #[must_use]
    pub fn target_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.target_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn include_path(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.include_path.extend(dirs);
        self
    }

    #[must_use]
    pub fn default_path(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.default_path.extend(dirs);
        self
    }

    #[must_use]
    pub fn zip_include(mut self, include: ZipInclude) -> Self {
        self.zip_includes.push(include);
        self
    }

    #[must_use]
    pub fn include_file(mut self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        self.include_files.push((source.into(), target.into()));
        self
    }

    #[must_use]
    pub fn icon(mut self, icon: impl Into<PathBuf>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    #[must_use]
    pub fn ext_list_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ext_list_file = Some(path.into());
        self
    }

    #[must_use]
    pub fn bin_filters(mut self, filters: BinaryFilters) -> Self {
        self.bin_filters = filters;
        self
    }

    #[must_use]
    pub fn silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Validate and freeze the configuration
    pub fn build(self) -> Result<FreezeRequest, FreezeError> {
        if self.executables.is_empty() {
            return Err(FreezeError::invalid("at least one executable is required"));
        }

        let mut stems = FxHashSet::default();
        for (index, executable) in self.executables.iter().enumerate() {
            let Some(stem) = executable.provisional_stem() else {
                return Err(FreezeError::invalid(format!(
                    "executable #{} needs a script or an explicit target name",
                    index + 1
                )));
            };
            if stem.is_empty() {
                return Err(FreezeError::invalid(format!(
                    "executable #{} has an empty target name",
                    index + 1
                )));
            }
            if !stems.insert(stem.clone()) {
                return Err(FreezeError::invalid(format!(
                    "two executables would be written as '{stem}'"
                )));
            }
        }

        for name in self
            .includes
            .iter()
            .chain(&self.excludes)
            .chain(&self.packages)
        {
            validate_module_name(name)?;
        }

        for (source, target) in &self.include_files {
            if target.is_absolute()
                || target
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(FreezeError::invalid(format!(
                    "include file {} must target a path inside the target directory, got {}",
                    source.display(),
                    target.display()
                )));
            }
        }

        let target_dir = self.target_dir.unwrap_or_else(|| PathBuf::from("dist"));

        Ok(FreezeRequest {
            executables: self.executables,
            includes: self.includes.into_iter().collect(),
            excludes: self.excludes.into_iter().collect(),
            packages: self.packages.into_iter().collect(),
            path_rewriter: PathRewriter::new(self.replace_paths),
            compress: self.compress,
            optimize: self.optimize,
            copy_dependent_files: self.copy_dependent_files,
            append_script_to_exe: self.append_script_to_exe,
            init_script: self.init_script,
            base: self.base,
            target_dir,
            include_path: self.include_path,
            default_path: self.default_path,
            zip_includes: self.zip_includes,
            include_files: self.include_files,
            icon: self.icon,
            ext_list_file: self.ext_list_file,
            bin_filters: BinaryFilters::platform_default().merged(self.bin_filters),
            silent: self.silent,
        })
    }
}

fn validate_module_name(name: &str) -> Result<(), FreezeError> {
    let valid = !name.is_empty()
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c == '_' || c.is_alphabetic())
                && chars.all(|c| c == '_' || c.is_alphanumeric())
        });
    if valid {
        Ok(())
    } else {
        Err(FreezeError::invalid(format!(
            "'{name}' is not a valid module name"
        )))
    }
}

/// Split a comma separated module list, dropping empty items
pub fn split_module_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Split a platform path-separator joined directory list
pub fn split_path_list(list: &str) -> Vec<PathBuf> {
    std::env::split_paths(list)
        .filter(|p| !p.as_os_str().is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_requires_script_or_target_name() {
        let err = FreezeRequest::builder()
            .executable(Executable::default())
            .build()
            .expect_err("executable without script or name");
        assert!(err.to_string().contains("script or an explicit target name"));

        FreezeRequest::builder()
            .executable(Executable::named("tool"))
            .include_modules(["pkg.hidden"])
            .build()
            .expect("a target name alone is enough");
    }

    #[test]
    fn test_duplicate_targets_rejected() {
        let err = FreezeRequest::builder()
            .executable(Executable::new("a/app.py"))
            .executable(Executable::new("b/app.py"))
            .build()
            .expect_err("both would be written as app");
        assert!(err.to_string().contains("'app'"));
    }

    #[test]
    fn test_invalid_module_names_rejected() {
        for bad in ["", "pkg..mod", "1abc", "has-dash"] {
            let result = FreezeRequest::builder()
                .executable(Executable::new("app.py"))
                .include_modules([bad])
                .build();
            assert!(result.is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_include_wins_over_exclude() {
        let request = FreezeRequest::builder()
            .executable(Executable::new("app.py"))
            .include_modules(["pkg.hidden", "shared"])
            .exclude_modules(["pkg", "shared", "tkinter"])
            .build()
            .expect("valid request");

        assert!(!request.is_excluded("shared"));
        assert!(!request.is_excluded("pkg"));
        assert!(!request.is_excluded("pkg.hidden"));
        assert!(request.is_excluded("pkg.other"));
        assert!(request.is_excluded("tkinter"));
        assert!(request.is_excluded("tkinter.ttk"));
        assert!(!request.is_excluded("tkinterx"));
    }

    #[test]
    fn test_default_init_script_follows_copy_flag() {
        let request = FreezeRequest::builder()
            .executable(Executable::new("app.py"))
            .copy_dependent_files(false)
            .build()
            .expect("valid request");
        assert_eq!(request.default_init_script(), KEEP_PATH_INIT_SCRIPT);

        let request = FreezeRequest::builder()
            .executable(Executable::new("app.py"))
            .build()
            .expect("valid request");
        assert_eq!(request.default_init_script(), DEFAULT_INIT_SCRIPT);
    }

    #[test]
    fn test_zip_include_specs() {
        assert_eq!(
            ZipInclude::parse("data/config.json").expect("bare path"),
            ZipInclude::with_name("data/config.json", "config.json")
        );
        assert_eq!(
            ZipInclude::parse("data/config.json=cfg/app.json").expect("pair"),
            ZipInclude::with_name("data/config.json", "cfg/app.json")
        );
        assert!(ZipInclude::parse("data=").is_err());
    }

    #[test]
    fn test_optimize_levels() {
        assert_eq!(OptimizeLevel::try_from(2).expect("valid"), OptimizeLevel::StripDocstrings);
        assert!(OptimizeLevel::try_from(3).is_err());
    }

    #[test]
    fn test_split_lists() {
        assert_eq!(split_module_list("a, b,,c.d"), vec!["a", "b", "c.d"]);
        let joined = std::env::join_paths(["/one", "/two"]).expect("joinable");
        assert_eq!(
            split_path_list(&joined.to_string_lossy()),
            vec![PathBuf::from("/one"), PathBuf::from("/two")]
        );
    }
}
