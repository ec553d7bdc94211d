use std::{
    io::Write,
    path::PathBuf,
    process::ExitCode,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use cryo::{
    config::{Config, IncludeFile},
    freezer::freeze,
    path_rewriter::split_directives,
    request::{Executable, split_module_list, split_path_list},
};
use log::{error, info};

#[cfg(windows)]
const DEFAULT_PYTHON: &str = "python";
#[cfg(not(windows))]
const DEFAULT_PYTHON: &str = "python3";

/// Freeze a Python script into a self-contained executable
#[derive(Parser, Debug)]
#[command(name = "cryo", version, about)]
struct Cli {
    /// Entry script to freeze
    script: Vec<PathBuf>,

    /// Optimize bytecode: -O strips asserts, -OO also strips doc strings
    #[arg(short = 'O', action = clap::ArgAction::Count)]
    optimize: u8,

    /// Compress the module archive
    #[arg(short = 'c', long)]
    compress: bool,

    /// Only log warnings and errors
    #[arg(short = 's', long)]
    silent: bool,

    /// Log every resolved module and copied file
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Base stub to build the executable from
    #[arg(long)]
    base_name: Option<String>,

    /// Init script the launcher runs before the entry script
    #[arg(long)]
    init_script: Option<String>,

    /// Directory to write the frozen program to
    #[arg(long)]
    target_dir: Option<PathBuf>,

    /// File name of the executable
    #[arg(long)]
    target_name: Option<String>,

    /// Do not copy the shared libraries extensions and the base depend on
    #[arg(long)]
    no_copy_deps: bool,

    /// Write the archive as library.zip instead of appending it
    #[arg(long)]
    no_append: bool,

    /// Directories searched after the include path and before the runtime's own, separator joined; repeatable
    #[arg(long)]
    default_path: Vec<String>,

    /// Directories searched before the default path, separator joined; repeatable
    #[arg(long)]
    include_path: Vec<String>,

    /// Path rewriting directives `path=replacement`; `*` matches any path
    #[arg(long)]
    replace_paths: Option<String>,

    /// Modules to include even if not imported, comma separated
    #[arg(long)]
    include_modules: Option<String>,

    /// Modules to leave out, comma separated
    #[arg(long)]
    exclude_modules: Option<String>,

    /// Packages to include with every submodule, comma separated
    #[arg(long)]
    packages: Option<String>,

    /// Write the names of copied dependent files to this file
    #[arg(long)]
    ext_list_file: Option<PathBuf>,

    /// Extra archive entry: `path` or `path=archiveName`
    #[arg(short = 'z', long = "zip-include")]
    zip_includes: Vec<String>,

    /// Extra file copied into the target directory: `path` or `path=target`
    #[arg(long = "include-file")]
    include_files: Vec<String>,

    /// Shared libraries always copied, comma separated
    #[arg(long)]
    bin_includes: Option<String>,

    /// Shared libraries never copied, comma separated
    #[arg(long)]
    bin_excludes: Option<String>,

    /// Icon embedded into Windows executables
    #[arg(long)]
    icon: Option<PathBuf>,

    /// Python interpreter whose runtime is frozen
    #[arg(long)]
    python: Option<PathBuf>,

    /// Configuration file instead of ./cryo.toml
    #[arg(long)]
    config: Option<PathBuf>,
}

impl Cli {
    fn validate(&self) -> Result<()> {
        if self.script.len() > 1 {
            bail!("only one script can be specified");
        }
        let has_modules = self
            .include_modules
            .as_deref()
            .is_some_and(|m| !split_module_list(m).is_empty());
        if self.script.is_empty() && !has_modules && !self.no_copy_deps {
            bail!("script or a list of modules must be specified");
        }
        if self.script.is_empty() && self.target_name.is_none() {
            bail!("script or a target name must be specified");
        }
        Ok(())
    }

    /// Command-line layer of the configuration
    fn overrides(&self) -> Result<Config> {
        let list = |value: &Option<String>| value.as_deref().map(split_module_list).unwrap_or_default();
        let paths = |values: &[String]| -> Vec<PathBuf> {
            values.iter().flat_map(|v| split_path_list(v)).collect()
        };

        let include_files = self
            .include_files
            .iter()
            .map(|spec| match spec.split_once('=') {
                Some((source, target)) if !source.is_empty() && !target.is_empty() => Ok(IncludeFile {
                    source: PathBuf::from(source),
                    target: Some(PathBuf::from(target)),
                }),
                Some(_) => bail!("include file '{spec}' is not of the form path=target"),
                None => Ok(IncludeFile {
                    source: PathBuf::from(spec),
                    target: None,
                }),
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Config {
            python: self.python.clone(),
            target_dir: self.target_dir.clone(),
            base_name: self.base_name.clone(),
            init_script: self.init_script.clone(),
            icon: self.icon.clone(),
            compress: self.compress.then_some(true),
            optimize: (self.optimize > 0).then_some(self.optimize),
            copy_dependent_files: self.no_copy_deps.then_some(false),
            append_script_to_exe: self.no_append.then_some(false),
            silent: self.silent.then_some(true),
            ext_list_file: self.ext_list_file.clone(),
            include_modules: list(&self.include_modules),
            exclude_modules: list(&self.exclude_modules),
            packages: list(&self.packages),
            include_path: paths(&self.include_path),
            default_path: paths(&self.default_path),
            replace_paths: self
                .replace_paths
                .as_deref()
                .map(|d| split_directives(d).map(str::to_owned).collect())
                .unwrap_or_default(),
            zip_includes: self.zip_includes.clone(),
            include_files,
            bin_includes: list(&self.bin_includes),
            bin_excludes: list(&self.bin_excludes),
            ..Config::default()
        })
    }

    fn executable(&self) -> Executable {
        let mut executable = match self.script.first() {
            Some(script) => Executable::new(script),
            None => Executable::default(),
        };
        if let Some(name) = &self.target_name {
            executable = executable.with_target_name(name);
        }
        executable
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.silent {
        "warn"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    cli.validate()?;

    let mut config = Config::load(cli.config.as_deref())?;
    config.merge(cli.overrides()?);

    let request = config.to_request(vec![cli.executable()])?;
    let python = config
        .python
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PYTHON));
    let manifest = freeze(&request, &python)
        .with_context(|| format!("Failed to freeze into {}", request.target_dir().display()))?;

    if !request.silent() {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(manifest.report().as_bytes())?;
        stdout.flush()?;
    }
    for executable in &manifest.executables {
        info!("Wrote {}", executable.display());
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("cryo").chain(args.iter().copied()))
            .expect("arguments should parse")
    }

    #[test]
    fn test_search_path_flags_are_repeatable() {
        let joined = std::env::join_paths(["lib/a", "lib/b"]).expect("joinable paths");
        let joined = joined.to_str().expect("utf-8 paths");
        let cli = parse(&[
            "app.py",
            "--include-path",
            joined,
            "--include-path",
            "vendor",
            "--default-path",
            "site",
            "--default-path",
            "extra",
        ]);

        let config = cli.overrides().expect("valid overrides");
        assert_eq!(
            config.include_path,
            vec![
                PathBuf::from("lib/a"),
                PathBuf::from("lib/b"),
                PathBuf::from("vendor")
            ]
        );
        assert_eq!(
            config.default_path,
            vec![PathBuf::from("site"), PathBuf::from("extra")]
        );
    }

    #[test]
    fn test_front_end_validation() {
        assert!(parse(&["app.py"]).validate().is_ok());
        assert!(parse(&["a.py", "b.py"]).validate().is_err());
        assert!(parse(&["--target-name", "tool"]).validate().is_err());
        assert!(
            parse(&["--target-name", "tool", "--include-modules", "pkg.hidden"])
                .validate()
                .is_ok()
        );
        assert!(parse(&["--include-modules", "pkg.hidden"]).validate().is_err());
    }
}
