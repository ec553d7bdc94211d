//! Description of the target Python runtime
//!
//! The engine never inspects the interpreter it runs under; everything it
//! needs to know about the runtime being frozen is captured once in a
//! [`RuntimeInfo`], either by probing an interpreter or by constructing one
//! directly.

use std::{
    path::{Path, PathBuf},
    process::Command,
};

use indexmap::IndexSet;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

const PROBE_SCRIPT: &str = r#"
import importlib.machinery, importlib.util, json, sys, sysconfig
libdir = sysconfig.get_config_var("LIBDIR")
print(json.dumps({
    "version": list(sys.version_info[:2]),
    "magic_number": list(importlib.util.MAGIC_NUMBER),
    "sys_path": [p for p in sys.path if p],
    "builtin_modules": sorted(sys.builtin_module_names),
    "extension_suffixes": importlib.machinery.EXTENSION_SUFFIXES,
    "library_dirs": [libdir] if libdir else [],
    "shared_library": sysconfig.get_config_var("INSTSONAME"),
    "executable": sys.executable,
}))
"#;

/// What the freezer needs to know about the runtime it bundles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeInfo {
    /// `(major, minor)`
    pub version: (u8, u8),
    /// First four bytes of every `.pyc` the runtime accepts
    pub magic_number: [u8; 4],
    /// Default module search locations, in order
    pub sys_path: Vec<PathBuf>,
    /// Modules compiled into the interpreter itself
    pub builtin_modules: IndexSet<String>,
    /// File suffixes of extension modules, most specific first
    pub extension_suffixes: Vec<String>,
    /// Directories holding the runtime's own shared libraries
    #[serde(default)]
    pub library_dirs: Vec<PathBuf>,
    /// Shared library name of the interpreter, when built shared
    #[serde(default)]
    pub shared_library: Option<String>,
    pub executable: PathBuf,
}

impl RuntimeInfo {
    /// A runtime with no search path, built-ins or extension suffixes;
    /// callers fill in what they know
    pub fn new(version: (u8, u8), magic_number: [u8; 4]) -> Self {
        Self {
            version,
            magic_number,
            sys_path: Vec::new(),
            builtin_modules: IndexSet::new(),
            extension_suffixes: Vec::new(),
            library_dirs: Vec::new(),
            shared_library: None,
            executable: PathBuf::from("python3"),
        }
    }

    /// Query `python` for its layout
    pub fn probe(python: &Path) -> Result<Self, FailureKind> {
        let runtime_error = |message: String| FailureKind::Runtime {
            python: python.to_path_buf(),
            message,
        };

        let output = Command::new(python)
            .args(["-c", PROBE_SCRIPT])
            .output()
            .map_err(|e| runtime_error(format!("failed to start: {e}")))?;
        if !output.status.success() {
            return Err(runtime_error(format!(
                "exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let info: Self = serde_json::from_slice(&output.stdout)
            .map_err(|e| runtime_error(format!("unexpected probe output: {e}")))?;
        debug!(
            "Probed Python {}.{} at {} ({} search path entries)",
            info.version.0,
            info.version.1,
            info.executable.display(),
            info.sys_path.len()
        );
        Ok(info)
    }

    /// Minor version, the form ruff's stdlib tables are keyed by
    pub fn minor_version(&self) -> u8 {
        self.version.1
    }

    pub fn is_builtin(&self, module: &str) -> bool {
        self.builtin_modules.contains(module)
    }

    /// Extension suffix `file_name` ends with, if it is an extension module
    pub fn extension_suffix<'a>(&'a self, file_name: &str) -> Option<&'a str> {
        self.extension_suffixes
            .iter()
            .map(String::as_str)
            .find(|suffix| file_name.ends_with(suffix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_probe_output() {
        let json = r#"{
            "version": [3, 11],
            "magic_number": [167, 13, 13, 10],
            "sys_path": ["/usr/lib/python311.zip", "/usr/lib/python3.11"],
            "builtin_modules": ["_io", "sys", "posix"],
            "extension_suffixes": [".cpython-311-x86_64-linux-gnu.so", ".abi3.so", ".so"],
            "library_dirs": ["/usr/lib"],
            "shared_library": "libpython3.11.so.1.0",
            "executable": "/usr/bin/python3.11"
        }"#;
        let info: RuntimeInfo = serde_json::from_str(json).expect("valid probe output");
        assert_eq!(info.minor_version(), 11);
        assert_eq!(info.magic_number, [167, 13, 13, 10]);
        assert!(info.is_builtin("sys"));
        assert!(!info.is_builtin("os"));
        assert_eq!(
            info.extension_suffix("_ssl.cpython-311-x86_64-linux-gnu.so"),
            Some(".cpython-311-x86_64-linux-gnu.so")
        );
        assert_eq!(info.extension_suffix("mod.py"), None);
    }

    #[test]
    fn test_probe_missing_interpreter() {
        let err = RuntimeInfo::probe(Path::new("/nonexistent/python-for-cryo-tests"))
            .expect_err("interpreter does not exist");
        assert!(matches!(err, FailureKind::Runtime { .. }));
    }
}
