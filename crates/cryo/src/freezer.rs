//! The freeze pipeline
//!
//! A [`Freezer`] runs `Init -> Discover -> Build -> Copy -> Assemble` once.
//! Nothing is written to the target directory before discovery succeeds;
//! every later write is atomic, and a failure leaves earlier outputs in place.

use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
};

use log::{Level, debug, log, warn};
use walkdir::WalkDir;

use crate::{
    archive::ArchiveBuilder,
    assembler::{AssemblyInput, ExecutableAssembler, target_name},
    bases::{BaseResolver, InstallLayout},
    compiler::{PythonCompiler, SourceCompiler},
    dependencies::{DependencyCopier, FileRole},
    error::{FailureKind, FreezeError, Step, Warning},
    finder::{DiscoveryResult, ModuleFinder},
    fs_util::write_atomic,
    introspect::{DependencyIntrospector, GoblinIntrospector},
    module_graph::ModuleGraph,
    request::FreezeRequest,
    resolver::{ModuleKind, ModuleResolver},
    runtime::RuntimeInfo,
};

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezeState {
    Init,
    Discover,
    Build,
    Copy,
    Assemble,
    Done,
    Failed(Step),
}

/// One file written below the target directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// File it was copied or built from; `None` for generated files
    pub source: Option<PathBuf>,
    pub target: PathBuf,
}

/// One module placed in the bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrozenModule {
    pub name: String,
    pub kind: ModuleKind,
    pub origin: Option<PathBuf>,
}

/// What a successful run produced
#[derive(Debug, Clone, Default)]
pub struct FreezeManifest {
    /// Every file written, in write order
    pub files: Vec<ManifestEntry>,
    pub executables: Vec<PathBuf>,
    /// Frozen modules, sorted by name
    pub modules: Vec<FrozenModule>,
    pub warnings: Vec<Warning>,
}

impl FreezeManifest {
    /// Module table followed by the missing-module list
    pub fn report(&self) -> String {
        let mut out = String::new();
        let width = self
            .modules
            .iter()
            .map(|m| m.name.len())
            .max()
            .unwrap_or(0)
            .max(4);
        let _ = writeln!(out, "  {:<width$}  File", "Name");
        let _ = writeln!(out, "  {:<width$}  ----", "----");
        for module in &self.modules {
            let origin = module
                .origin
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let line = format!("{} {:<width$}  {origin}", module.kind.code(), module.name);
            let _ = writeln!(out, "{}", line.trim_end());
        }

        let missing: Vec<_> = self
            .warnings
            .iter()
            .filter_map(|w| match w {
                Warning::MissingModule { importer, name } => Some((name, importer)),
                _ => None,
            })
            .collect();
        if !missing.is_empty() {
            out.push_str("\nMissing modules:\n");
            for (name, importer) in missing {
                let _ = writeln!(out, "? {name} imported from {importer}");
            }
            out.push_str(
                "This is not necessarily a problem - the modules may not be needed on this platform.\n",
            );
        }
        out
    }
}

/// Executable with its base, init script and file name resolved
#[derive(Debug, Clone)]
struct PlannedExecutable {
    script: Option<PathBuf>,
    target_name: String,
    stem: String,
    base: PathBuf,
    init_script: PathBuf,
    icon: Option<PathBuf>,
}

impl PlannedExecutable {
    fn init_module(&self) -> String {
        format!("{}__init__", self.stem)
    }

    fn main_module(&self) -> String {
        format!("{}__main__", self.stem)
    }
}

/// Runs one freeze
pub struct Freezer<'a> {
    request: &'a FreezeRequest,
    runtime: RuntimeInfo,
    compiler: Box<dyn SourceCompiler>,
    introspector: Box<dyn DependencyIntrospector>,
    bases: Box<dyn BaseResolver>,
    state: FreezeState,
}

impl std::fmt::Debug for Freezer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Freezer")
            .field("target_dir", &self.request.target_dir)
            .field("runtime", &self.runtime.version)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<'a> Freezer<'a> {
    pub fn new(
        request: &'a FreezeRequest,
        runtime: RuntimeInfo,
        compiler: Box<dyn SourceCompiler>,
        introspector: Box<dyn DependencyIntrospector>,
        bases: Box<dyn BaseResolver>,
    ) -> Self {
        Self {
            request,
            runtime,
            compiler,
            introspector,
            bases,
            state: FreezeState::Init,
        }
    }

    pub fn state(&self) -> FreezeState {
        self.state
    }

    fn progress_level(&self) -> Level {
        if self.request.silent {
            Level::Debug
        } else {
            Level::Info
        }
    }

    fn enter(&mut self, state: FreezeState) {
        self.state = state;
        if let FreezeState::Discover | FreezeState::Build | FreezeState::Copy | FreezeState::Assemble = state {
            log!(self.progress_level(), "{state:?} step");
        }
    }

    fn fail(&mut self, step: Step, kind: FailureKind) -> FreezeError {
        self.state = FreezeState::Failed(step);
        FreezeError::new(step, kind)
    }

    /// Run every step and return the manifest
    pub fn freeze(&mut self) -> Result<FreezeManifest, FreezeError> {
        self.enter(FreezeState::Init);
        let plans = self.plan().map_err(|kind| self.fail(Step::Init, kind))?;

        self.enter(FreezeState::Discover);
        let discovery = self
            .discover(&plans)
            .map_err(|kind| self.fail(Step::Discover, kind))?;
        let DiscoveryResult {
            graph,
            missing: _,
            warnings,
        } = discovery;
        let mut manifest = FreezeManifest {
            modules: frozen_modules(&graph),
            warnings,
            ..FreezeManifest::default()
        };
        for warning in &manifest.warnings {
            warn!("{warning}");
        }

        self.enter(FreezeState::Build);
        let (archive, extensions) = self
            .build(&graph)
            .map_err(|kind| self.fail(Step::Build, kind))?;

        self.enter(FreezeState::Copy);
        self.copy(&plans, &extensions, &mut manifest)
            .map_err(|kind| self.fail(Step::Copy, kind))?;

        self.enter(FreezeState::Assemble);
        self.assemble(&plans, &archive, &mut manifest)
            .map_err(|kind| self.fail(Step::Assemble, kind))?;

        self.enter(FreezeState::Done);
        log!(
            self.progress_level(),
            "Froze {} modules into {} executable(s) in {}",
            manifest.modules.len(),
            manifest.executables.len(),
            self.request.target_dir.display()
        );
        Ok(manifest)
    }

    /// Resolve bases, init scripts and file names before touching anything
    fn plan(&self) -> Result<Vec<PlannedExecutable>, FailureKind> {
        self.request
            .executables
            .iter()
            .map(|executable| {
                let base = self
                    .bases
                    .find_base(executable.base.as_deref().unwrap_or(self.request.default_base()))?;
                let init_script = self.bases.find_init_script(
                    executable
                        .init_script
                        .as_deref()
                        .unwrap_or(self.request.default_init_script()),
                )?;
                let target_name =
                    target_name(executable, &base).ok_or_else(|| FailureKind::RequestInvalid {
                        reason: "executable needs a script or an explicit target name".to_owned(),
                    })?;
                let stem = Path::new(&target_name)
                    .file_stem()
                    .map_or_else(|| target_name.clone(), |s| s.to_string_lossy().into_owned());
                Ok(PlannedExecutable {
                    script: executable.script.clone(),
                    target_name,
                    stem,
                    base,
                    init_script,
                    icon: executable.icon.clone().or_else(|| self.request.icon.clone()),
                })
            })
            .collect()
    }

    fn discover(&self, plans: &[PlannedExecutable]) -> Result<DiscoveryResult, FailureKind> {
        let script_dirs: Vec<&Path> = plans
            .iter()
            .filter_map(|p| p.script.as_deref())
            .map(|script| script.parent().unwrap_or_else(|| Path::new(".")))
            .collect();
        let search_dirs = ModuleResolver::search_path(
            script_dirs,
            &self.request.include_path,
            &self.request.default_path,
            &self.runtime,
        );
        debug!("Module search path: {search_dirs:?}");

        let mut finder = ModuleFinder::new(&self.runtime, self.request, search_dirs);
        for plan in plans {
            finder.include_file(&plan.init_script, &plan.init_module())?;
            if let Some(script) = &plan.script {
                finder.include_file(script, &plan.main_module())?;
            }
        }
        for name in &self.request.includes {
            finder.include_module(name)?;
        }
        for name in &self.request.packages {
            finder.include_package(name)?;
        }
        finder.run()
    }

    /// Compile the archive; returns it with the extension modules to copy
    /// as `(origin, target file name)`
    fn build(&mut self, graph: &ModuleGraph) -> Result<(Vec<u8>, Vec<(PathBuf, String)>), FailureKind> {
        let mut archive = ArchiveBuilder::new(
            &self.runtime,
            &self.request.path_rewriter,
            self.request.optimize,
            self.request.compress,
        );
        let mut extensions = Vec::new();

        for record in graph.modules() {
            archive.add_module(self.compiler.as_mut(), record)?;
            if record.kind != ModuleKind::Extension {
                continue;
            }
            let Some(origin) = record.origin.as_ref() else {
                continue;
            };
            let file_name = origin
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if record.name.contains('.') {
                let suffix = self.runtime.extension_suffix(&file_name).unwrap_or_default();
                let target = format!("{}{suffix}", record.name);
                archive.add_extension_loader(self.compiler.as_mut(), &record.name, &target)?;
                extensions.push((origin.clone(), target));
            } else {
                extensions.push((origin.clone(), file_name));
            }
        }

        for include in &self.request.zip_includes {
            archive.add_zip_include(include)?;
        }
        let bytes = archive.finish()?;
        Ok((bytes, extensions))
    }

    fn copy(
        &self,
        plans: &[PlannedExecutable],
        extensions: &[(PathBuf, String)],
        manifest: &mut FreezeManifest,
    ) -> Result<(), FailureKind> {
        let mut filters = self.request.bin_filters.clone();
        if let Some(library) = &self.runtime.shared_library {
            filters.includes.push(library.clone());
        }
        let mut copier = DependencyCopier::new(self.introspector.as_ref(), filters);
        let copy_dependencies = self.request.copy_dependent_files;
        if !copy_dependencies {
            debug!("Shared-library dependencies are not copied");
        }

        if copy_dependencies {
            for plan in plans {
                copier.add_binary_dependencies(&plan.base, true)?;
            }
        }
        for (origin, target) in extensions {
            copier.add_file(origin, target, FileRole::Extension)?;
            if copy_dependencies {
                copier.add_binary_dependencies(origin, false)?;
            }
        }
        for (source, target) in &self.request.include_files {
            add_include_file(&mut copier, source, target)?;
        }

        let target_dir = &self.request.target_dir;
        for file in copier.copy_all(target_dir)? {
            debug!("Copied {} to {}", file.source.display(), file.target.display());
            manifest.files.push(ManifestEntry {
                source: Some(file.source),
                target: target_dir.join(file.target),
            });
        }

        if let Some(list_file) = &self.request.ext_list_file {
            write_atomic(list_file, copier.listing().as_bytes())?;
            manifest.files.push(ManifestEntry {
                source: None,
                target: list_file.clone(),
            });
        }

        let warnings = copier.into_warnings();
        for warning in &warnings {
            warn!("{warning}");
        }
        manifest.warnings.extend(warnings);
        Ok(())
    }

    fn assemble(
        &self,
        plans: &[PlannedExecutable],
        archive: &[u8],
        manifest: &mut FreezeManifest,
    ) -> Result<(), FailureKind> {
        let target_dir = &self.request.target_dir;
        let mut assembler = ExecutableAssembler::new(target_dir);
        let appended = self.request.append_script_to_exe;

        for plan in plans {
            let path = assembler.assemble(AssemblyInput {
                base: &plan.base,
                target_name: &plan.target_name,
                icon: plan.icon.as_deref(),
                archive: appended.then_some(archive),
            })?;
            manifest.files.push(ManifestEntry {
                source: Some(plan.base.clone()),
                target: path.clone(),
            });
            manifest.executables.push(path);
        }
        if !appended {
            let path = assembler.write_library(archive)?;
            manifest.files.push(ManifestEntry {
                source: None,
                target: path,
            });
        }

        manifest.warnings.extend(assembler.into_warnings());
        Ok(())
    }
}

/// Schedule a file, or every file below a directory, for verbatim copy
fn add_include_file(
    copier: &mut DependencyCopier<'_>,
    source: &Path,
    target: &Path,
) -> Result<(), FailureKind> {
    if !source.is_dir() {
        if !source.exists() {
            return Err(FailureKind::io(
                source,
                std::io::Error::new(std::io::ErrorKind::NotFound, "include file not found"),
            ));
        }
        copier.add_file(source, target, FileRole::Data)?;
        return Ok(());
    }
    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(source).to_path_buf();
            FailureKind::io(path, e.into())
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(source) {
            copier.add_file(entry.path(), target.join(relative), FileRole::Data)?;
        }
    }
    Ok(())
}

fn frozen_modules(graph: &ModuleGraph) -> Vec<FrozenModule> {
    let mut modules: Vec<FrozenModule> = graph
        .modules()
        .map(|record| FrozenModule {
            name: record.name.clone(),
            kind: record.kind,
            origin: record.origin.clone(),
        })
        .collect();
    modules.sort_by(|a, b| a.name.cmp(&b.name));
    modules
}

/// Freeze `request` against the interpreter at `python`, using the bases and
/// init scripts installed next to the running executable
pub fn freeze(request: &FreezeRequest, python: &Path) -> Result<FreezeManifest, FreezeError> {
    let runtime = RuntimeInfo::probe(python).map_err(|kind| FreezeError::new(Step::Init, kind))?;
    let layout = InstallLayout::from_current_exe().map_err(|kind| FreezeError::new(Step::Init, kind))?;
    let introspector = GoblinIntrospector::new(runtime.library_dirs.clone()).with_loader_path();
    let compiler = PythonCompiler::new(runtime.executable.clone());

    Freezer::new(
        request,
        runtime,
        Box::new(compiler),
        Box::new(introspector),
        Box::new(layout),
    )
    .freeze()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_report_lists_modules_and_missing() {
        let manifest = FreezeManifest {
            modules: vec![
                FrozenModule {
                    name: "app__main__".to_owned(),
                    kind: ModuleKind::Source,
                    origin: Some(PathBuf::from("/src/app.py")),
                },
                FrozenModule {
                    name: "pkg".to_owned(),
                    kind: ModuleKind::Package,
                    origin: Some(PathBuf::from("/src/pkg/__init__.py")),
                },
                FrozenModule {
                    name: "sys".to_owned(),
                    kind: ModuleKind::Builtin,
                    origin: None,
                },
            ],
            warnings: vec![Warning::MissingModule {
                importer: "pkg".to_owned(),
                name: "simplejson".to_owned(),
            }],
            ..FreezeManifest::default()
        };

        insta::assert_snapshot!(manifest.report(), @r"
          Name         File
          ----         ----
        m app__main__  /src/app.py
        P pkg          /src/pkg/__init__.py
        b sys

        Missing modules:
        ? simplejson imported from pkg
        This is not necessarily a problem - the modules may not be needed on this platform.
        ");
    }

    #[test]
    fn test_init_and_main_module_names() {
        let plan = PlannedExecutable {
            script: Some(PathBuf::from("app.py")),
            target_name: "app.exe".to_owned(),
            stem: "app".to_owned(),
            base: PathBuf::from("Console.exe"),
            init_script: PathBuf::from("Console.py"),
            icon: None,
        };
        assert_eq!(plan.init_module(), "app__init__");
        assert_eq!(plan.main_module(), "app__main__");
    }
}
