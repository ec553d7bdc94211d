//! Rewriting of source paths embedded into compiled bytecode
//!
//! Frozen code objects carry the file name they were compiled from, which
//! shows up in tracebacks. Replacement rules strip the build machine's
//! filesystem layout from those names so bundles are reproducible.

use std::path::{Component, Path, PathBuf};

use crate::error::FreezeError;

/// Left-hand side of a replacement rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPrefix {
    /// `*`: matches any path not matched by an earlier rule
    Wildcard,
    /// A literal directory prefix
    Literal(PathBuf),
}

/// One `prefix=replacement` directive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceRule {
    pub prefix: PathPrefix,
    pub replacement: String,
}

impl ReplaceRule {
    pub fn new(prefix: PathPrefix, replacement: impl Into<String>) -> Self {
        Self {
            prefix,
            replacement: replacement.into(),
        }
    }

    /// Parse a single `path=replacement` directive
    pub fn parse(directive: &str) -> Result<Self, FreezeError> {
        let Some((from, to)) = directive.split_once('=') else {
            return Err(FreezeError::invalid(format!(
                "replace-paths directive '{directive}' is not of the form path=replacement"
            )));
        };
        if from.is_empty() {
            return Err(FreezeError::invalid(format!(
                "replace-paths directive '{directive}' has an empty path"
            )));
        }
        let prefix = if from == "*" {
            PathPrefix::Wildcard
        } else {
            PathPrefix::Literal(PathBuf::from(from))
        };
        Ok(Self::new(prefix, to))
    }

    /// Parse a list of directives joined by commas or the platform path separator
    pub fn parse_list(directives: &str) -> Result<Vec<Self>, FreezeError> {
        split_directives(directives).map(Self::parse).collect()
    }
}

/// Individual directives of a comma or path-separator joined list
pub fn split_directives(directives: &str) -> impl Iterator<Item = &str> {
    directives
        .split(|c| c == ',' || c == PATH_LIST_SEPARATOR)
        .filter(|d| !d.is_empty())
}

#[cfg(windows)]
const PATH_LIST_SEPARATOR: char = ';';
#[cfg(not(windows))]
const PATH_LIST_SEPARATOR: char = ':';

/// Ordered set of replacement rules; first match wins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathRewriter {
    rules: Vec<ReplaceRule>,
}

impl PathRewriter {
    pub fn new(rules: Vec<ReplaceRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rewrite `path` for embedding.
    ///
    /// `search_root` is the search path entry the module's top-level package
    /// was found in; a wildcard rule replaces it. Without a root the wildcard
    /// replaces the file's own directory. Paths no rule matches come back
    /// unchanged.
    pub fn rewrite(&self, path: &Path, search_root: Option<&Path>) -> PathBuf {
        for rule in &self.rules {
            let prefix = match &rule.prefix {
                PathPrefix::Wildcard => match search_root.or_else(|| path.parent()) {
                    Some(root) if path.starts_with(root) => root,
                    _ => continue,
                },
                PathPrefix::Literal(prefix) => prefix.as_path(),
            };
            // Path::strip_prefix matches whole components only
            if let Ok(rest) = path.strip_prefix(prefix) {
                return join_replacement(&rule.replacement, rest);
            }
        }
        path.to_path_buf()
    }
}

fn join_replacement(replacement: &str, rest: &Path) -> PathBuf {
    let rest: PathBuf = rest
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    if replacement.is_empty() {
        rest
    } else {
        Path::new(replacement).join(rest)
    }
}
