use std::path::{Path, PathBuf};

use indexmap::IndexSet;
use log::{debug, trace, warn};
use rustc_hash::FxHashMap;

use crate::runtime::RuntimeInfo;

/// How a module was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleKind {
    /// A `.py` file
    Source,
    /// A `.pyc` file with no source next to it
    Bytecode,
    /// Compiled into the interpreter
    Builtin,
    /// A native extension module
    Extension,
    /// A directory with an `__init__` module
    Package,
    /// A directory without `__init__`, possibly split across search roots
    NamespacePackage,
}

impl ModuleKind {
    pub const fn is_package(self) -> bool {
        matches!(self, Self::Package | Self::NamespacePackage)
    }

    /// Single-letter code used in the manifest report
    pub const fn code(self) -> char {
        match self {
            Self::Source | Self::Bytecode => 'm',
            Self::Builtin => 'b',
            Self::Extension => 'e',
            Self::Package | Self::NamespacePackage => 'P',
        }
    }
}

/// Result of resolving one dotted module name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    pub kind: ModuleKind,
    /// File the module is loaded from; `None` for built-ins and namespace packages
    pub origin: Option<PathBuf>,
    /// Directories searched for submodules; empty unless a package
    pub package_path: Vec<PathBuf>,
    /// Search path entry the top-level package was found in
    pub search_root: Option<PathBuf>,
}

impl ResolvedModule {
    fn file(kind: ModuleKind, origin: PathBuf, search_root: &Path) -> Self {
        Self {
            kind,
            origin: Some(origin),
            package_path: Vec::new(),
            search_root: Some(search_root.to_path_buf()),
        }
    }

    fn builtin() -> Self {
        Self {
            kind: ModuleKind::Builtin,
            origin: None,
            package_path: Vec::new(),
            search_root: None,
        }
    }
}

/// Finds modules on a request-scoped search path
#[derive(Debug)]
pub struct ModuleResolver<'a> {
    runtime: &'a RuntimeInfo,
    search_dirs: Vec<PathBuf>,
    /// Negative results are cached too
    cache: FxHashMap<String, Option<ResolvedModule>>,
}

/// Canonicalize a path, falling back to the path itself
pub(crate) fn canonicalize_path(path: PathBuf) -> PathBuf {
    match path.canonicalize() {
        Ok(canonical) => canonical,
        Err(e) => {
            warn!("Failed to canonicalize path {}: {}", path.display(), e);
            path
        }
    }
}

impl<'a> ModuleResolver<'a> {
    pub fn new(runtime: &'a RuntimeInfo, search_dirs: Vec<PathBuf>) -> Self {
        Self {
            runtime,
            search_dirs,
            cache: FxHashMap::default(),
        }
    }

    /// Assemble the search path: script directories, then `include_path`,
    /// then `default_path`, then the runtime's own `sys.path`.
    ///
    /// Entries are canonicalized and deduplicated, keeping the first
    /// occurrence. Entries that are not directories are dropped.
    pub fn search_path<'p>(
        script_dirs: impl IntoIterator<Item = &'p Path>,
        include_path: &[PathBuf],
        default_path: &[PathBuf],
        runtime: &RuntimeInfo,
    ) -> Vec<PathBuf> {
        let mut unique_dirs = IndexSet::new();
        let candidates = script_dirs
            .into_iter()
            .map(Path::to_path_buf)
            .chain(include_path.iter().cloned())
            .chain(default_path.iter().cloned())
            .chain(runtime.sys_path.iter().cloned());

        for dir in candidates {
            // An empty parent means the current directory
            let dir = if dir.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                dir
            };
            if !dir.is_dir() {
                debug!("Skipping search path entry {}: not a directory", dir.display());
                continue;
            }
            unique_dirs.insert(canonicalize_path(dir));
        }

        unique_dirs.into_iter().collect()
    }

    /// Resolve an absolute dotted module name.
    ///
    /// Submodules are looked up in their parent package's path, so a parent
    /// that is not a package makes the name unresolvable.
    pub fn resolve(&mut self, name: &str) -> Option<ResolvedModule> {
        if let Some(cached) = self.cache.get(name) {
            return cached.clone();
        }

        let resolved = match name.rsplit_once('.') {
            _ if self.runtime.is_builtin(name) => Some(ResolvedModule::builtin()),
            None => self.find_in(name, &self.search_dirs, None),
            Some((parent, tail)) => match self.resolve(parent) {
                Some(parent) if parent.kind.is_package() => {
                    self.find_in(tail, &parent.package_path, parent.search_root.as_deref())
                }
                _ => None,
            },
        };

        match &resolved {
            Some(module) => debug!(
                "Resolved {name} as {:?} at {}",
                module.kind,
                module
                    .origin
                    .as_deref()
                    .map_or_else(|| "<none>".into(), Path::to_string_lossy)
            ),
            None => trace!("Cannot resolve {name}"),
        }
        self.cache.insert(name.to_owned(), resolved.clone());
        resolved
    }

    /// Look for `part` in each of `dirs`, in order.
    ///
    /// In each directory a regular package wins over an extension module,
    /// which wins over a source file, which wins over bytecode. Bare
    /// directories are collected as namespace portions and only used if no
    /// directory holds a regular module.
    fn find_in(
        &self,
        part: &str,
        dirs: &[PathBuf],
        inherited_root: Option<&Path>,
    ) -> Option<ResolvedModule> {
        let mut portions = Vec::new();
        let mut namespace_root = None;

        for dir in dirs {
            let root = inherited_root.unwrap_or(dir);
            let package_dir = dir.join(part);

            for init in ["__init__.py", "__init__.pyc"] {
                let init_path = package_dir.join(init);
                if init_path.is_file() {
                    return Some(ResolvedModule {
                        kind: ModuleKind::Package,
                        origin: Some(canonicalize_path(init_path)),
                        package_path: vec![canonicalize_path(package_dir)],
                        search_root: Some(root.to_path_buf()),
                    });
                }
            }

            for suffix in &self.runtime.extension_suffixes {
                let candidate = dir.join(format!("{part}{suffix}"));
                if candidate.is_file() {
                    return Some(ResolvedModule::file(
                        ModuleKind::Extension,
                        canonicalize_path(candidate),
                        root,
                    ));
                }
            }

            let source = dir.join(format!("{part}.py"));
            if source.is_file() {
                return Some(ResolvedModule::file(
                    ModuleKind::Source,
                    canonicalize_path(source),
                    root,
                ));
            }

            let bytecode = dir.join(format!("{part}.pyc"));
            if bytecode.is_file() {
                return Some(ResolvedModule::file(
                    ModuleKind::Bytecode,
                    canonicalize_path(bytecode),
                    root,
                ));
            }

            if package_dir.is_dir() {
                portions.push(canonicalize_path(package_dir));
                namespace_root.get_or_insert_with(|| root.to_path_buf());
            }
        }

        if portions.is_empty() {
            return None;
        }
        Some(ResolvedModule {
            kind: ModuleKind::NamespacePackage,
            origin: None,
            package_path: portions,
            search_root: namespace_root,
        })
    }
}

/// Turn a relative import into an absolute module name.
///
/// `level` counts the leading dots; one dot names the importer's own package.
/// Returns `None` when the import climbs above the top-level package.
pub fn resolve_relative(
    importer: &str,
    importer_is_package: bool,
    level: u32,
    module: Option<&str>,
) -> Option<String> {
    let mut parts: Vec<&str> = importer.split('.').collect();
    if !importer_is_package {
        parts.pop();
    }
    for _ in 1..level {
        parts.pop()?;
    }
    if parts.is_empty() {
        return None;
    }
    if let Some(module) = module.filter(|m| !m.is_empty()) {
        parts.push(module);
    }
    Some(parts.join("."))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn create_test_file(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    fn runtime() -> RuntimeInfo {
        let mut runtime = RuntimeInfo::new((3, 11), [0xa7, 0x0d, 0x0d, 0x0a]);
        runtime.builtin_modules.extend(["sys".to_owned(), "_io".to_owned()]);
        runtime.extension_suffixes = vec![".cpython-311-x86_64-linux-gnu.so".to_owned(), ".so".to_owned()];
        runtime
    }

    #[test]
    fn test_package_wins_over_module() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        create_test_file(&root.join("foo/__init__.py"), "# Package")?;
        create_test_file(&root.join("foo.py"), "# Module")?;

        let runtime = runtime();
        let mut resolver = ModuleResolver::new(&runtime, vec![root.canonicalize()?]);
        let resolved = resolver.resolve("foo").expect("foo resolves");
        assert_eq!(resolved.kind, ModuleKind::Package);
        assert_eq!(resolved.origin, Some(root.join("foo/__init__.py").canonicalize()?));
        assert_eq!(resolved.package_path, vec![root.join("foo").canonicalize()?]);
        Ok(())
    }

    #[test]
    fn test_search_order_first_match_wins() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        let entry_dir = root.join("src/app");
        create_test_file(&entry_dir.join("main.py"), "# Main")?;
        create_test_file(&entry_dir.join("helper.py"), "# Helper")?;
        let include = root.join("lib");
        create_test_file(&include.join("helper.py"), "# Other helper")?;
        create_test_file(&include.join("only_here.py"), "")?;

        let mut runtime = runtime();
        runtime.sys_path = vec![root.join("missing-site-packages")];
        let dirs = ModuleResolver::search_path(
            [entry_dir.as_path()],
            std::slice::from_ref(&include),
            &[],
            &runtime,
        );
        assert_eq!(dirs, vec![entry_dir.canonicalize()?, include.canonicalize()?]);

        let mut resolver = ModuleResolver::new(&runtime, dirs);
        let helper = resolver.resolve("helper").expect("helper resolves");
        assert_eq!(helper.origin, Some(entry_dir.join("helper.py").canonicalize()?));
        assert_eq!(helper.search_root, Some(entry_dir.canonicalize()?));
        let only = resolver.resolve("only_here").expect("only_here resolves");
        assert_eq!(only.search_root, Some(include.canonicalize()?));
        Ok(())
    }

    #[test]
    fn test_submodules_resolve_through_parent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        create_test_file(&root.join("myapp/__init__.py"), "")?;
        create_test_file(&root.join("myapp/utils/__init__.py"), "")?;
        create_test_file(&root.join("myapp/utils/helpers.py"), "")?;
        create_test_file(&root.join("plain.py"), "")?;

        let runtime = runtime();
        let mut resolver = ModuleResolver::new(&runtime, vec![root.canonicalize()?]);
        let helpers = resolver.resolve("myapp.utils.helpers").expect("resolves");
        assert_eq!(helpers.kind, ModuleKind::Source);
        assert_eq!(helpers.origin, Some(root.join("myapp/utils/helpers.py").canonicalize()?));
        assert_eq!(helpers.search_root, Some(root.canonicalize()?));
        assert!(resolver.resolve("plain.sub").is_none());
        assert!(resolver.resolve("myapp.missing").is_none());
        Ok(())
    }

    #[test]
    fn test_builtin_extension_and_bytecode() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();
        create_test_file(&root.join("_speedups.cpython-311-x86_64-linux-gnu.so"), "\x7fELF")?;
        create_test_file(&root.join("compiled.pyc"), "")?;

        let runtime = runtime();
        let mut resolver = ModuleResolver::new(&runtime, vec![root.canonicalize()?]);
        assert_eq!(resolver.resolve("sys").map(|m| m.kind), Some(ModuleKind::Builtin));
        assert_eq!(
            resolver.resolve("_speedups").map(|m| m.kind),
            Some(ModuleKind::Extension)
        );
        assert_eq!(
            resolver.resolve("compiled").map(|m| m.kind),
            Some(ModuleKind::Bytecode)
        );
        Ok(())
    }

    #[test]
    fn test_namespace_package_spans_roots() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let first = temp_dir.path().join("first");
        let second = temp_dir.path().join("second");
        create_test_file(&first.join("ns/alpha.py"), "")?;
        create_test_file(&second.join("ns/beta.py"), "")?;

        let runtime = runtime();
        let mut resolver =
            ModuleResolver::new(&runtime, vec![first.canonicalize()?, second.canonicalize()?]);
        let ns = resolver.resolve("ns").expect("namespace package");
        assert_eq!(ns.kind, ModuleKind::NamespacePackage);
        assert_eq!(ns.origin, None);
        assert_eq!(ns.package_path.len(), 2);
        assert!(resolver.resolve("ns.alpha").is_some());
        let beta = resolver.resolve("ns.beta").expect("second portion");
        assert_eq!(beta.origin, Some(second.join("ns/beta.py").canonicalize()?));
        Ok(())
    }

    #[test]
    fn test_relative_names() {
        assert_eq!(
            resolve_relative("pkg.sub.mod", false, 1, Some("sibling")),
            Some("pkg.sub.sibling".to_owned())
        );
        assert_eq!(
            resolve_relative("pkg.sub.mod", false, 2, Some("other")),
            Some("pkg.other".to_owned())
        );
        assert_eq!(
            resolve_relative("pkg.sub", true, 1, None),
            Some("pkg.sub".to_owned())
        );
        assert_eq!(
            resolve_relative("pkg.sub", true, 1, Some("deeper.mod")),
            Some("pkg.sub.deeper.mod".to_owned())
        );
        assert_eq!(resolve_relative("pkg.mod", false, 3, Some("x")), None);
        assert_eq!(resolve_relative("app__main__", false, 1, Some("x")), None);
    }
}
