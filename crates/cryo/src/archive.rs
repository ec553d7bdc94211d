//! Building the bytecode archive
//!
//! Frozen modules are stored as `.pyc` files in a zip archive the runtime's
//! zip importer can load from. Entry order follows insertion order, and every
//! entry carries a fixed timestamp so identical inputs give identical bytes.

use std::{
    fs,
    io::{Cursor, Write},
    path::Path,
    time::UNIX_EPOCH,
};

use cow_utils::CowUtils;
use indexmap::IndexMap;
use log::{debug, trace, warn};
use walkdir::WalkDir;
use zip::{CompressionMethod, DateTime, ZipWriter, write::SimpleFileOptions};

use crate::{
    compiler::{CompileError, SourceCompiler, pyc_bytes},
    error::FailureKind,
    module_graph::ModuleRecord,
    path_rewriter::PathRewriter,
    request::{OptimizeLevel, ZipInclude},
    resolver::ModuleKind,
    runtime::RuntimeInfo,
};

/// Archive name of a module's bytecode
pub fn archive_name(module: &str, is_package: bool) -> String {
    let path = module.cow_replace('.', "/");
    if is_package {
        format!("{path}/__init__.pyc")
    } else {
        format!("{path}.pyc")
    }
}

/// Source of the loader placed in the archive for an extension module that
/// lives inside a package. The extension itself sits next to the executable.
fn extension_loader_source(file_name: &str) -> String {
    format!(
        r#"def __bootstrap__():
    global __bootstrap__
    import importlib.machinery, importlib.util, os, sys
    path = os.path.join(os.path.dirname(sys.executable), {file_name:?})
    loader = importlib.machinery.ExtensionFileLoader(__name__, path)
    spec = importlib.util.spec_from_file_location(__name__, path, loader=loader)
    module = importlib.util.module_from_spec(spec)
    sys.modules[__name__] = module
    loader.exec_module(module)
__bootstrap__()
"#
    )
}

/// Collects archive entries and writes the zip
#[derive(Debug)]
pub struct ArchiveBuilder<'a> {
    runtime: &'a RuntimeInfo,
    rewriter: &'a PathRewriter,
    optimize: OptimizeLevel,
    compress: bool,
    entries: IndexMap<String, Vec<u8>>,
}

impl<'a> ArchiveBuilder<'a> {
    pub fn new(
        runtime: &'a RuntimeInfo,
        rewriter: &'a PathRewriter,
        optimize: OptimizeLevel,
        compress: bool,
    ) -> Self {
        Self {
            runtime,
            rewriter,
            optimize,
            compress,
            entries: IndexMap::new(),
        }
    }

    /// Add the bytecode of one discovered module.
    ///
    /// Built-ins, extensions and namespace packages contribute nothing here.
    pub fn add_module(
        &mut self,
        compiler: &mut dyn SourceCompiler,
        record: &ModuleRecord,
    ) -> Result<(), FailureKind> {
        let Some(origin) = record.origin.as_deref() else {
            return Ok(());
        };
        if matches!(record.kind, ModuleKind::Builtin | ModuleKind::Extension) {
            return Ok(());
        }

        let name = archive_name(&record.name, record.is_package());
        let source = fs::read(origin).map_err(|e| FailureKind::io(origin, e))?;

        if origin.extension().and_then(|e| e.to_str()) == Some("pyc") {
            if source.get(..4) != Some(&self.runtime.magic_number[..]) {
                warn!(
                    "{} was compiled for a different runtime version",
                    origin.display()
                );
            }
            trace!("Copying bytecode {} as {name}", origin.display());
            self.entries.insert(name, source);
            return Ok(());
        }

        let filename = self.rewriter.rewrite(origin, record.search_root.as_deref());
        let code = compiler
            .compile(&source, &filename.to_string_lossy(), self.optimize)
            .map_err(|e| match e {
                CompileError::Backend(message) => FailureKind::Compiler { message },
                syntax @ CompileError::Syntax { .. } => FailureKind::CompileError {
                    module: record.name.clone(),
                    path: origin.to_path_buf(),
                    message: syntax.to_string(),
                },
            })?;

        let mtime = source_mtime(origin);
        let size = u32::try_from(source.len()).unwrap_or(u32::MAX);
        trace!("Compiled {} as {name} ({} bytes)", record.name, code.len());
        self.entries
            .insert(name, pyc_bytes(self.runtime.magic_number, &code, mtime, size));
        Ok(())
    }

    /// Archive a loader for an extension module copied as `file_name`
    pub fn add_extension_loader(
        &mut self,
        compiler: &mut dyn SourceCompiler,
        module: &str,
        file_name: &str,
    ) -> Result<(), FailureKind> {
        let source = extension_loader_source(file_name);
        let code = compiler
            .compile(source.as_bytes(), module, self.optimize)
            .map_err(|e| FailureKind::Compiler {
                message: e.to_string(),
            })?;
        let size = u32::try_from(source.len()).unwrap_or(u32::MAX);
        self.entries.insert(
            archive_name(module, false),
            pyc_bytes(self.runtime.magic_number, &code, 0, size),
        );
        Ok(())
    }

    /// Store a file, or every file below a directory, verbatim
    pub fn add_zip_include(&mut self, include: &ZipInclude) -> Result<(), FailureKind> {
        let source = include.source.as_path();
        if !source.is_dir() {
            let data = fs::read(source).map_err(|e| FailureKind::io(source, e))?;
            self.entries.insert(include.archive_name.clone(), data);
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
            let Ok(relative) = entry.path().strip_prefix(source) else {
                continue;
            };
            let name = format!(
                "{}/{}",
                include.archive_name.trim_end_matches('/'),
                archive_path(relative)
            );
            let data = fs::read(entry.path()).map_err(|e| FailureKind::io(entry.path(), e))?;
            self.entries.insert(name, data);
        }
        Ok(())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(name, data)| (name.as_str(), data.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize the archive
    pub fn finish(self) -> Result<Vec<u8>, FailureKind> {
        let method = if self.compress {
            CompressionMethod::Deflated
        } else {
            CompressionMethod::Stored
        };
        let options = SimpleFileOptions::default()
            .compression_method(method)
            .last_modified_time(DateTime::default());

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in &self.entries {
            writer.start_file(name.as_str(), options)?;
            writer.write_all(data).map_err(|e| FailureKind::Archive {
                message: format!("{name}: {e}"),
            })?;
        }
        let bytes = writer.finish()?.into_inner();
        debug!(
            "Archive holds {} entries ({} bytes, {})",
            self.entries.len(),
            bytes.len(),
            if self.compress { "deflated" } else { "stored" }
        );
        Ok(bytes)
    }
}

/// Relative path with `/` separators
fn archive_path(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn source_mtime(path: &Path) -> u32 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs() as u32)
}
