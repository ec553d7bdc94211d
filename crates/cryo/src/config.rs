//! Layered configuration for the `cryo` front end
//!
//! Sources, lowest precedence first: built-in defaults, the user config
//! (`<config dir>/cryo/cryo.toml`), the project `cryo.toml` or an explicit
//! `--config` file, `CRYO_*` environment variables, then command-line flags.
//! Scalar settings from a later layer replace earlier ones; lists accumulate.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow};
use etcetera::{BaseStrategy, choose_base_strategy};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{
    path_rewriter::ReplaceRule,
    request::{BinaryFilters, Executable, FreezeRequest, OptimizeLevel, ZipInclude},
};

pub const PROJECT_CONFIG: &str = "cryo.toml";

/// An extra file or directory copied verbatim into the target directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludeFile {
    pub source: PathBuf,
    /// Relative to the target directory; defaults to the source's file name
    #[serde(default)]
    pub target: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Config {
    pub python: Option<PathBuf>,
    pub target_dir: Option<PathBuf>,
    pub base_name: Option<String>,
    pub init_script: Option<String>,
    pub icon: Option<PathBuf>,
    pub compress: Option<bool>,
    pub optimize: Option<u8>,
    pub copy_dependent_files: Option<bool>,
    pub append_script_to_exe: Option<bool>,
    pub silent: Option<bool>,
    pub ext_list_file: Option<PathBuf>,
    pub include_modules: Vec<String>,
    pub exclude_modules: Vec<String>,
    pub packages: Vec<String>,
    pub include_path: Vec<PathBuf>,
    pub default_path: Vec<PathBuf>,
    /// `path=replacement` directives; `*` matches any path
    pub replace_paths: Vec<String>,
    /// `path` or `path=archiveName`
    pub zip_includes: Vec<String>,
    pub include_files: Vec<IncludeFile>,
    pub bin_includes: Vec<String>,
    pub bin_excludes: Vec<String>,
    pub bin_path_includes: Vec<PathBuf>,
    pub bin_path_excludes: Vec<PathBuf>,
}

fn override_with<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(anyhow!("{name} must be a boolean, got '{other}'")),
    }
}

impl Config {
    /// Read one TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// `cryo/cryo.toml` under the platform's user config directory
    pub fn user_config_path() -> Option<PathBuf> {
        choose_base_strategy()
            .ok()
            .map(|strategy| strategy.config_dir().join("cryo").join(PROJECT_CONFIG))
    }

    /// Load every file layer plus the environment.
    ///
    /// An explicit path must exist; the user and project files are optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(user) = Self::user_config_path()
            && user.is_file()
        {
            debug!("Loading user config {}", user.display());
            config.merge(Self::from_file(&user)?);
        }

        let project = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Some(PathBuf::from(PROJECT_CONFIG)).filter(|p| p.is_file()),
        };
        if let Some(project) = project {
            debug!("Loading config {}", project.display());
            config.merge(Self::from_file(&project)?);
        }

        config.apply_env()?;
        Ok(config)
    }

    /// Layer `other` on top of `self`
    pub fn merge(&mut self, other: Self) {
        override_with(&mut self.python, other.python);
        override_with(&mut self.target_dir, other.target_dir);
        override_with(&mut self.base_name, other.base_name);
        override_with(&mut self.init_script, other.init_script);
        override_with(&mut self.icon, other.icon);
        override_with(&mut self.compress, other.compress);
        override_with(&mut self.optimize, other.optimize);
        override_with(&mut self.copy_dependent_files, other.copy_dependent_files);
        override_with(&mut self.append_script_to_exe, other.append_script_to_exe);
        override_with(&mut self.silent, other.silent);
        override_with(&mut self.ext_list_file, other.ext_list_file);
        self.include_modules.extend(other.include_modules);
        self.exclude_modules.extend(other.exclude_modules);
        self.packages.extend(other.packages);
        self.include_path.extend(other.include_path);
        self.default_path.extend(other.default_path);
        self.replace_paths.extend(other.replace_paths);
        self.zip_includes.extend(other.zip_includes);
        self.include_files.extend(other.include_files);
        self.bin_includes.extend(other.bin_includes);
        self.bin_excludes.extend(other.bin_excludes);
        self.bin_path_includes.extend(other.bin_path_includes);
        self.bin_path_excludes.extend(other.bin_path_excludes);
    }

    /// Apply `CRYO_*` variables from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply `CRYO_*` variables from `lookup`
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(python) = lookup("CRYO_PYTHON") {
            self.python = Some(PathBuf::from(python));
        }
        if let Some(dir) = lookup("CRYO_TARGET_DIR") {
            self.target_dir = Some(PathBuf::from(dir));
        }
        if let Some(base) = lookup("CRYO_BASE_NAME") {
            self.base_name = Some(base);
        }
        if let Some(value) = lookup("CRYO_COMPRESS") {
            self.compress = Some(parse_bool("CRYO_COMPRESS", &value)?);
        }
        if let Some(value) = lookup("CRYO_OPTIMIZE") {
            let level = value
                .trim()
                .parse()
                .with_context(|| format!("CRYO_OPTIMIZE must be 0, 1 or 2, got '{value}'"))?;
            self.optimize = Some(level);
        }
        Ok(())
    }

    /// Build the request for `executables`
    pub fn to_request(&self, executables: Vec<Executable>) -> Result<FreezeRequest> {
        let optimize = OptimizeLevel::try_from(self.optimize.unwrap_or(0))?;
        let replace_paths = self
            .replace_paths
            .iter()
            .map(|d| ReplaceRule::parse(d))
            .collect::<Result<Vec<_>, _>>()?;

        let mut builder = FreezeRequest::builder()
            .include_modules(&self.include_modules)
            .exclude_modules(&self.exclude_modules)
            .packages(&self.packages)
            .replace_paths(replace_paths)
            .compress(self.compress.unwrap_or(false))
            .optimize(optimize)
            .copy_dependent_files(self.copy_dependent_files.unwrap_or(true))
            .append_script_to_exe(self.append_script_to_exe.unwrap_or(true))
            .include_path(self.include_path.iter().cloned())
            .default_path(self.default_path.iter().cloned())
            .silent(self.silent.unwrap_or(false))
            .bin_filters(BinaryFilters {
                includes: self.bin_includes.clone(),
                excludes: self.bin_excludes.clone(),
                path_includes: self.bin_path_includes.clone(),
                path_excludes: self.bin_path_excludes.clone(),
            });

        for executable in executables {
            builder = builder.executable(executable);
        }
        if let Some(dir) = &self.target_dir {
            builder = builder.target_dir(dir);
        }
        if let Some(base) = &self.base_name {
            builder = builder.base(base);
        }
        if let Some(init_script) = &self.init_script {
            builder = builder.init_script(init_script);
        }
        if let Some(icon) = &self.icon {
            builder = builder.icon(icon);
        }
        if let Some(list) = &self.ext_list_file {
            builder = builder.ext_list_file(list);
        }
        for spec in &self.zip_includes {
            builder = builder.zip_include(ZipInclude::parse(spec)?);
        }
        for file in &self.include_files {
            let target = match &file.target {
                Some(target) => target.clone(),
                None => file
                    .source
                    .file_name()
                    .map(PathBuf::from)
                    .ok_or_else(|| anyhow!("include file {} has no file name", file.source.display()))?,
            };
            builder = builder.include_file(&file.source, target);
        }

        Ok(builder.build()?)
    }
}
