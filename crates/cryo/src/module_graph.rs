//! Storage for discovered modules and the imports between them

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use petgraph::{
    algo::is_cyclic_directed,
    graph::{DiGraph, NodeIndex},
};
use rustc_hash::FxHashMap;

use crate::resolver::{ModuleKind, ResolvedModule};

/// Tag on an import edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EdgeKind {
    /// Guarded import; failing to resolve it is a warning
    Optional,
    /// Executed unconditionally when the importer is imported
    Required,
}

/// A discovered module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    /// Dotted module name
    pub name: String,
    pub kind: ModuleKind,
    pub origin: Option<PathBuf>,
    /// Search path entry the module was found under
    pub search_root: Option<PathBuf>,
    pub package_path: Vec<PathBuf>,
    /// Directly imported module names
    pub imports: IndexMap<String, EdgeKind>,
    /// Named by the exclude set; recorded but never frozen
    pub excluded: bool,
}

impl ModuleRecord {
    pub fn from_resolved(name: impl Into<String>, resolved: ResolvedModule) -> Self {
        Self {
            name: name.into(),
            kind: resolved.kind,
            origin: resolved.origin,
            search_root: resolved.search_root,
            package_path: resolved.package_path,
            imports: IndexMap::new(),
            excluded: false,
        }
    }

    /// A module read from an explicit file rather than the search path
    pub fn from_file(name: impl Into<String>, origin: &Path) -> Self {
        Self {
            name: name.into(),
            kind: ModuleKind::Source,
            origin: Some(origin.to_path_buf()),
            search_root: origin.parent().map(Path::to_path_buf),
            package_path: Vec::new(),
            imports: IndexMap::new(),
            excluded: false,
        }
    }

    pub fn is_package(&self) -> bool {
        self.kind.is_package()
    }

    /// Enclosing package name, if any
    pub fn parent(&self) -> Option<&str> {
        self.name.rsplit_once('.').map(|(parent, _)| parent)
    }
}

/// Directed import graph; nodes keep insertion order
#[derive(Debug, Default)]
pub struct ModuleGraph {
    graph: DiGraph<ModuleRecord, EdgeKind>,
    index: FxHashMap<String, NodeIndex>,
}

impl ModuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record; an existing record with the same name is kept
    pub fn add_module(&mut self, record: ModuleRecord) -> NodeIndex {
        if let Some(&existing) = self.index.get(&record.name) {
            return existing;
        }
        let name = record.name.clone();
        let node = self.graph.add_node(record);
        self.index.insert(name, node);
        node
    }

    /// Record that `importer` imports `imported`.
    ///
    /// Both modules must already be in the graph. A required edge upgrades an
    /// existing optional one.
    pub fn add_import(&mut self, importer: &str, imported: &str, kind: EdgeKind) {
        let (Some(&from), Some(&to)) = (self.index.get(importer), self.index.get(imported)) else {
            return;
        };
        if from == to {
            return;
        }
        match self.graph.find_edge(from, to) {
            Some(edge) => {
                let existing = &mut self.graph[edge];
                *existing = (*existing).max(kind);
            }
            None => {
                self.graph.add_edge(from, to, kind);
            }
        }
        let record = &mut self.graph[from];
        let entry = record.imports.entry(imported.to_owned()).or_insert(kind);
        *entry = (*entry).max(kind);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ModuleRecord> {
        self.index.get(name).map(|&node| &self.graph[node])
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Modules to freeze, in discovery order
    pub fn modules(&self) -> impl Iterator<Item = &ModuleRecord> {
        self.graph.node_weights().filter(|record| !record.excluded)
    }

    /// Modules that were found but suppressed by the exclude set
    pub fn excluded(&self) -> impl Iterator<Item = &ModuleRecord> {
        self.graph.node_weights().filter(|record| record.excluded)
    }

    pub fn has_cycles(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }
}
