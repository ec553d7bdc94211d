//! Discovery of the modules a frozen program needs
//!
//! [`ModuleFinder`] walks imports breadth first, starting from entry scripts
//! and explicitly included names, and records every module it reaches in a
//! [`ModuleGraph`].

use std::{collections::VecDeque, fs, path::Path};

use indexmap::{IndexMap, IndexSet};
use log::{debug, trace, warn};
use walkdir::WalkDir;

use crate::{
    error::{FailureKind, Warning},
    import_scanner::{ImportForm, ImportStatement, scan_imports},
    module_graph::{EdgeKind, ModuleGraph, ModuleRecord},
    request::FreezeRequest,
    resolver::{ModuleResolver, resolve_relative},
    runtime::RuntimeInfo,
    stdlib_detection::is_stdlib_module,
};

/// Importer name used for modules listed in the include set
pub const INCLUDE_MODULES_IMPORTER: &str = "<include_modules>";
/// Importer name used for submodules pulled in by the packages list
pub const PACKAGES_IMPORTER: &str = "<packages>";

/// Everything discovery produced
#[derive(Debug)]
pub struct DiscoveryResult {
    pub graph: ModuleGraph,
    /// Unresolvable optional imports: missing name to importers
    pub missing: IndexMap<String, IndexSet<String>>,
    pub warnings: Vec<Warning>,
}

/// Breadth-first import graph builder
#[derive(Debug)]
pub struct ModuleFinder<'a> {
    resolver: ModuleResolver<'a>,
    runtime: &'a RuntimeInfo,
    request: &'a FreezeRequest,
    graph: ModuleGraph,
    queue: VecDeque<String>,
    missing: IndexMap<String, IndexSet<String>>,
}

impl<'a> ModuleFinder<'a> {
    pub fn new(
        runtime: &'a RuntimeInfo,
        request: &'a FreezeRequest,
        search_dirs: Vec<std::path::PathBuf>,
    ) -> Self {
        Self {
            resolver: ModuleResolver::new(runtime, search_dirs),
            runtime,
            request,
            graph: ModuleGraph::new(),
            queue: VecDeque::new(),
            missing: IndexMap::new(),
        }
    }

    /// Add a script file under an explicit module name
    pub fn include_file(&mut self, path: &Path, name: &str) -> Result<(), FailureKind> {
        if !path.is_file() {
            return Err(FailureKind::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "script not found"),
            ));
        }
        let origin = crate::resolver::canonicalize_path(path.to_path_buf());
        debug!("Including {} as {name}", origin.display());
        self.graph.add_module(ModuleRecord::from_file(name, &origin));
        self.queue.push_back(name.to_owned());
        Ok(())
    }

    /// Add a module by name; it must exist
    pub fn include_module(&mut self, name: &str) -> Result<(), FailureKind> {
        self.import_module(name, INCLUDE_MODULES_IMPORTER, EdgeKind::Required)
            .map(drop)
    }

    /// Add a package and every module found below it on disk
    pub fn include_package(&mut self, name: &str) -> Result<(), FailureKind> {
        if !self.import_module(name, INCLUDE_MODULES_IMPORTER, EdgeKind::Required)? {
            return Ok(());
        }
        let Some(package) = self.graph.get(name) else {
            return Ok(());
        };
        if !package.is_package() {
            debug!("{name} is a plain module; nothing below it to include");
            return Ok(());
        }

        let mut submodules = IndexSet::new();
        for dir in package.package_path.clone() {
            for entry in WalkDir::new(&dir)
                .min_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| e.file_name() != "__pycache__")
                .filter_map(Result::ok)
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Ok(relative) = entry.path().strip_prefix(&dir) else {
                    continue;
                };
                if let Some(submodule) = self.submodule_name(name, relative) {
                    submodules.insert(submodule);
                }
            }
        }

        for submodule in submodules {
            self.import_module(&submodule, PACKAGES_IMPORTER, EdgeKind::Required)?;
        }
        Ok(())
    }

    /// Dotted name for a file below a package directory, if it is a module
    fn submodule_name(&self, package: &str, relative: &Path) -> Option<String> {
        let file_name = relative.file_name()?.to_str()?;
        let stem = if let Some(suffix) = self.runtime.extension_suffix(file_name) {
            file_name.strip_suffix(suffix)?
        } else if let Some(stem) = file_name.strip_suffix(".py") {
            stem
        } else {
            return None;
        };

        let mut parts = vec![package.to_owned()];
        if let Some(parent) = relative.parent() {
            for component in parent.components() {
                parts.push(component.as_os_str().to_str()?.to_owned());
            }
        }
        if stem != "__init__" {
            parts.push(stem.to_owned());
        }
        let name = parts.join(".");
        name.split('.')
            .all(is_identifier)
            .then_some(name)
    }

    /// Process the queue until every reachable module has been scanned
    pub fn run(mut self) -> Result<DiscoveryResult, FailureKind> {
        while let Some(name) = self.queue.pop_front() {
            let Some(record) = self.graph.get(&name) else {
                continue;
            };
            let Some(origin) = record.origin.clone() else {
                continue;
            };
            if origin.extension().and_then(|e| e.to_str()) != Some("py") {
                continue;
            }
            let is_package = record.is_package();

            trace!("Scanning {name} ({})", origin.display());
            let bytes = fs::read(&origin).map_err(|e| FailureKind::io(&origin, e))?;
            let source = String::from_utf8_lossy(&bytes);
            let imports = match scan_imports(&source) {
                Ok(imports) => imports,
                Err(e) => {
                    // The build step reports the compile failure
                    warn!("Cannot parse {}: {e}", origin.display());
                    continue;
                }
            };

            for import in &imports {
                self.process_import(&name, is_package, import)?;
            }
        }

        if self.graph.has_cycles() {
            debug!("Import graph contains cycles");
        }

        let warnings = self
            .missing
            .iter()
            .map(|(name, importers)| Warning::MissingModule {
                importer: importers.iter().cloned().collect::<Vec<_>>().join(", "),
                name: name.clone(),
            })
            .collect();

        Ok(DiscoveryResult {
            graph: self.graph,
            missing: self.missing,
            warnings,
        })
    }

    fn process_import(
        &mut self,
        importer: &str,
        importer_is_package: bool,
        import: &ImportStatement,
    ) -> Result<(), FailureKind> {
        let kind = if import.optional {
            EdgeKind::Optional
        } else {
            EdgeKind::Required
        };

        let target = if import.level > 0 {
            let Some(absolute) = resolve_relative(
                importer,
                importer_is_package,
                import.level,
                import.module.as_deref(),
            ) else {
                let dots = ".".repeat(import.level as usize);
                let name = format!("{dots}{}", import.module.as_deref().unwrap_or_default());
                return self.record_missing(&name, importer, kind);
            };
            absolute
        } else {
            let Some(module) = import.module.clone() else {
                return Ok(());
            };
            module
        };

        let present = self.import_module(&target, importer, kind)?;
        if !present || import.form != ImportForm::From || import.is_star() {
            return Ok(());
        }
        if self.graph.get(&target).is_some_and(ModuleRecord::is_package) {
            for name in &import.names {
                self.probe_submodule(&format!("{target}.{name}"), importer, kind);
            }
        }
        Ok(())
    }

    /// Import `name` on behalf of `importer`; returns whether it is in the graph
    fn import_module(
        &mut self,
        name: &str,
        importer: &str,
        kind: EdgeKind,
    ) -> Result<bool, FailureKind> {
        if self.graph.contains(name) {
            self.graph.add_import(importer, name, kind);
            return Ok(!self.graph.get(name).is_some_and(|m| m.excluded));
        }

        if self.request.is_excluded(name) {
            if let Some(resolved) = self.resolver.resolve(name) {
                debug!("Excluding {name}");
                self.graph.add_module(ModuleRecord {
                    excluded: true,
                    ..ModuleRecord::from_resolved(name, resolved)
                });
                self.graph.add_import(importer, name, kind);
            }
            return Ok(false);
        }

        if self.missing.contains_key(name) {
            self.record_missing(name, importer, kind)?;
            return Ok(false);
        }

        // Submodules need their package first
        if let Some((parent, _)) = name.rsplit_once('.')
            && !self.import_module(parent, importer, kind)?
        {
            return Ok(false);
        }

        let Some(resolved) = self.resolver.resolve(name) else {
            // `import os.path`: a name bound inside a plain module, not a submodule
            if let Some((parent, _)) = name.rsplit_once('.')
                && self.graph.get(parent).is_some_and(|m| !m.is_package())
            {
                debug!("{name} is an attribute of module {parent}");
                return Ok(false);
            }
            self.record_missing(name, importer, kind)?;
            return Ok(false);
        };

        self.graph.add_module(ModuleRecord::from_resolved(name, resolved));
        self.graph.add_import(importer, name, kind);
        if let Some((parent, _)) = name.rsplit_once('.') {
            self.graph.add_import(name, parent, EdgeKind::Required);
        }
        self.queue.push_back(name.to_owned());
        Ok(true)
    }

    /// `from pkg import name` where `name` may be a submodule or an attribute
    fn probe_submodule(&mut self, name: &str, importer: &str, kind: EdgeKind) {
        if self.graph.contains(name) {
            self.graph.add_import(importer, name, kind);
            return;
        }
        if self.request.is_excluded(name) {
            return;
        }
        match self.resolver.resolve(name) {
            Some(resolved) => {
                self.graph.add_module(ModuleRecord::from_resolved(name, resolved));
                self.graph.add_import(importer, name, kind);
                if let Some((parent, _)) = name.rsplit_once('.') {
                    self.graph.add_import(name, parent, EdgeKind::Required);
                }
                self.queue.push_back(name.to_owned());
            }
            None => trace!("{name} is not a submodule; assuming an attribute"),
        }
    }

    fn record_missing(
        &mut self,
        name: &str,
        importer: &str,
        kind: EdgeKind,
    ) -> Result<(), FailureKind> {
        if kind == EdgeKind::Required {
            return Err(FailureKind::ModuleNotFound {
                importer: importer.to_owned(),
                name: name.to_owned(),
            });
        }
        if is_stdlib_module(name, self.runtime.minor_version()) {
            debug!("Optional platform module {name} not available (imported by {importer})");
            return Ok(());
        }
        self.missing
            .entry(name.to_owned())
            .or_default()
            .insert(importer.to_owned());
        Ok(())
    }
}

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    chars
        .next()
        .is_some_and(|c| c == '_' || c.is_alphabetic())
        && chars.all(|c| c == '_' || c.is_alphanumeric())
}
