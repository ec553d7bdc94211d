//! Standard library detection utilities

use ruff_python_stdlib::sys;

/// Check if a module name represents a Python standard library module
///
/// This uses ruff's stdlib database and handles both direct matches and
/// submodules (e.g., both "os" and "os.path" are recognized).
///
/// # Arguments
/// * `module_name` - The module name to check
/// * `minor_version` - The Python 3 minor version (e.g., 11 for Python 3.11)
pub fn is_stdlib_module(module_name: &str, minor_version: u8) -> bool {
    if module_name == "__future__" {
        return true;
    }

    if sys::is_known_standard_library(minor_version, module_name) {
        return true;
    }

    module_name
        .split('.')
        .next()
        .is_some_and(|top_level| sys::is_known_standard_library(minor_version, top_level))
}
