#![allow(clippy::disallowed_methods)]

use std::{
    collections::HashMap,
    fs,
    io::{Cursor, Read},
    path::{Path, PathBuf},
};

use cryo::{
    Executable, FailureKind, FreezeRequest, Freezer, Step,
    assembler::{LIBRARY_ZIP, appended_archive},
    bases::InstallLayout,
    compiler::{CompileError, SourceCompiler},
    error::FreezeError,
    freezer::{FreezeManifest, FreezeState},
    introspect::{DependencyIntrospector, LinkedLibrary},
    path_rewriter::ReplaceRule,
    request::OptimizeLevel,
    runtime::RuntimeInfo,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

const MAGIC: [u8; 4] = [0xcb, 0x0d, 0x0d, 0x0a];
const EXT_SUFFIX: &str = ".cpython-312-x86_64-linux-gnu.so";

/// Emits `<level>:<filename>\n<source>`; rejects what ruff cannot parse
#[derive(Debug, Default)]
struct FakeCompiler;

impl SourceCompiler for FakeCompiler {
    fn compile(
        &mut self,
        source: &[u8],
        filename: &str,
        optimize: OptimizeLevel,
    ) -> Result<Vec<u8>, CompileError> {
        let text = String::from_utf8_lossy(source);
        if let Err(e) = ruff_python_parser::parse_module(&text) {
            return Err(CompileError::Syntax {
                message: e.to_string(),
                line: 1,
            });
        }
        let mut out = format!("{}:{filename}\n", optimize.as_u8()).into_bytes();
        out.extend_from_slice(source);
        Ok(out)
    }
}

/// Dependencies keyed by binary file name
#[derive(Debug, Default, Clone)]
struct FixtureIntrospector {
    deps: HashMap<String, Vec<LinkedLibrary>>,
}

impl FixtureIntrospector {
    fn with(mut self, binary: &str, libraries: Vec<LinkedLibrary>) -> Self {
        self.deps.insert(binary.to_owned(), libraries);
        self
    }
}

impl DependencyIntrospector for FixtureIntrospector {
    fn list_direct_dependencies(&self, binary: &Path) -> Result<Vec<LinkedLibrary>, FailureKind> {
        let name = binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(self.deps.get(&name).cloned().unwrap_or_default())
    }
}

/// Scratch project: sources under `src/`, bases and init scripts under
/// `install/`, output in `dist/`
struct Project {
    temp_dir: TempDir,
}

impl Project {
    fn new() -> Self {
        let project = Self {
            temp_dir: TempDir::new().unwrap(),
        };
        project.write("install/bases/Console", "launcher-stub");
        project.write("install/initscripts/Console.py", "import sys\n");
        project.write("install/initscripts/ConsoleKeepPath.py", "import sys\n");
        project
    }

    fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.path(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn dist(&self) -> PathBuf {
        self.path("dist")
    }

    fn builder(&self) -> cryo::request::FreezeRequestBuilder {
        FreezeRequest::builder().target_dir(self.dist())
    }

    fn freezer<'a>(
        &self,
        request: &'a FreezeRequest,
        introspector: FixtureIntrospector,
    ) -> Freezer<'a> {
        let mut runtime = RuntimeInfo::new((3, 12), MAGIC);
        runtime.builtin_modules.extend(["sys".to_owned(), "builtins".to_owned()]);
        runtime.extension_suffixes = vec![EXT_SUFFIX.to_owned(), ".so".to_owned()];
        Freezer::new(
            request,
            runtime,
            Box::new(FakeCompiler),
            Box::new(introspector),
            Box::new(InstallLayout::under(&self.path("install"))),
        )
    }

    fn freeze(&self, request: &FreezeRequest) -> Result<FreezeManifest, FreezeError> {
        self.freezer(request, FixtureIntrospector::default()).freeze()
    }
}

fn module_names(manifest: &FreezeManifest) -> Vec<&str> {
    manifest.modules.iter().map(|m| m.name.as_str()).collect()
}

fn archive_entry(archive: &[u8], name: &str) -> Vec<u8> {
    let mut zip = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
    let mut file = zip.by_name(name).unwrap();
    let mut data = Vec::new();
    file.read_to_end(&mut data).unwrap();
    data
}

fn archive_names(archive: &[u8]) -> Vec<String> {
    let zip = zip::ZipArchive::new(Cursor::new(archive)).unwrap();
    let mut names: Vec<String> = zip.file_names().map(str::to_owned).collect();
    names.sort();
    names
}

#[test]
fn test_builtin_only_script_produces_one_executable() {
    let project = Project::new();
    let script = project.write("src/app.py", "import sys\nprint(sys.argv)\n");
    let request = project
        .builder()
        .executable(Executable::new(&script))
        .build()
        .unwrap();

    let manifest = project.freeze(&request).unwrap();

    assert_eq!(module_names(&manifest), vec!["app__init__", "app__main__", "sys"]);
    assert_eq!(manifest.executables, vec![project.dist().join("app")]);
    // Only the executable itself; no libraries, no library.zip
    assert_eq!(manifest.files.len(), 1);
    assert!(manifest.warnings.is_empty());
    assert!(!project.dist().join(LIBRARY_ZIP).exists());

    let image = fs::read(project.dist().join("app")).unwrap();
    assert!(image.starts_with(b"launcher-stub"));
    let archive = appended_archive(&image).expect("archive appended");
    assert_eq!(
        archive_names(archive),
        vec!["app__init__.pyc".to_owned(), "app__main__.pyc".to_owned()]
    );
}

#[test]
fn test_archived_bytecode_is_compiler_output() {
    let project = Project::new();
    let script = project.write("src/app.py", "x = 1\n");
    let request = project
        .builder()
        .executable(Executable::new(&script))
        .optimize(OptimizeLevel::StripDocstrings)
        .build()
        .unwrap();

    project.freeze(&request).unwrap();

    let image = fs::read(project.dist().join("app")).unwrap();
    let entry = archive_entry(appended_archive(&image).unwrap(), "app__main__.pyc");
    let origin = fs::canonicalize(&script).unwrap();
    let expected = FakeCompiler
        .compile(b"x = 1\n", &origin.to_string_lossy(), OptimizeLevel::StripDocstrings)
        .unwrap();
    assert_eq!(&entry[..4], &MAGIC);
    assert_eq!(&entry[16..], &expected[..]);
}

#[test]
fn test_script_without_imports_discovers_only_itself() {
    let project = Project::new();
    // An init script with no imports leaves the entry script alone
    project.write("install/initscripts/Bare.py", "");
    let script = project.write("src/app.py", "print('hello')\n");
    let request = project
        .builder()
        .executable(Executable::new(&script))
        .init_script("Bare")
        .build()
        .unwrap();

    let manifest = project.freeze(&request).unwrap();

    assert_eq!(module_names(&manifest), vec!["app__init__", "app__main__"]);
}

#[test]
fn test_missing_required_import_is_fatal_before_any_write() {
    let project = Project::new();
    let script = project.write("src/app.py", "import missing_mod\n");
    let request = project
        .builder()
        .executable(Executable::new(&script))
        .build()
        .unwrap();

    let mut freezer = project.freezer(&request, FixtureIntrospector::default());
    let err = freezer.freeze().unwrap_err();

    assert_eq!(err.step, Step::Discover);
    match &err.kind {
        FailureKind::ModuleNotFound { importer, name } => {
            assert_eq!(importer, "app__main__");
            assert_eq!(name, "missing_mod");
        }
        other => panic!("unexpected failure: {other:?}"),
    }
    assert_eq!(freezer.state(), FreezeState::Failed(Step::Discover));
    assert!(!project.dist().exists());
}

#[test]
fn test_dotted_import_through_plain_module_freezes() {
    let project = Project::new();
    let script = project.write("src/app.py", "import os.path\nprint(os.path.sep)\n");
    project.write("src/os.py", "import posixpath as path\n");
    project.write("src/posixpath.py", "sep = '/'\n");
    let request = project
        .builder()
        .executable(Executable::new(&script))
        .build()
        .unwrap();

    let manifest = project.freeze(&request).unwrap();

    // `os.path` is an attribute of the plain module `os`: required, resolved, no warning
    assert_eq!(
        module_names(&manifest),
        vec!["app__init__", "app__main__", "os", "posixpath", "sys"]
    );
    assert!(manifest.warnings.is_empty());
}

#[test]
fn test_missing_import_under_main_guard_is_fatal() {
    let project = Project::new();
    let script = project.write(
        "src/app.py",
        "def main():\n    pass\n\nif __name__ == \"__main__\":\n    import cli_helpers\n    main()\n",
    );
    let request = project
        .builder()
        .executable(Executable::new(&script))
        .build()
        .unwrap();

    // The guarded body runs on start-up, so its imports are required
    let err = project.freeze(&request).unwrap_err();

    assert_eq!(err.step, Step::Discover);
    assert!(matches!(
        &err.kind,
        FailureKind::ModuleNotFound { importer, name }
            if importer == "app__main__" && name == "cli_helpers"
    ));
}

#[test]
fn test_missing_optional_import_is_warning() {
    let project = Project::new();
    let script = project.write(
        "src/app.py",
        "try:\n    import simplejson as json\nexcept ImportError:\n    json = None\n",
    );
    let request = project
        .builder()
        .executable(Executable::new(&script))
        .build()
        .unwrap();

    let manifest = project.freeze(&request).unwrap();

    assert_eq!(manifest.warnings.len(), 1);
    assert!(manifest.report().contains("? simplejson imported from app__main__"));
}

#[test]
fn test_exclusion_keeps_descendant_imported_elsewhere() {
    let project = Project::new();
    let script = project.write("src/app.py", "import a\nimport b\n");
    project.write("src/a.py", "import shared\nimport only_a\n");
    project.write("src/b.py", "import shared\n");
    project.write("src/shared.py", "");
    project.write("src/only_a.py", "");
    let request = project
        .builder()
        .executable(Executable::new(&script))
        .exclude_modules(["a"])
        .build()
        .unwrap();

    let manifest = project.freeze(&request).unwrap();

    assert_eq!(
        module_names(&manifest),
        vec!["app__init__", "app__main__", "b", "shared", "sys"]
    );
}

#[test]
fn test_included_module_without_script() {
    let project = Project::new();
    project.write("src/pkg/__init__.py", "");
    project.write("src/pkg/hidden.py", "from . import helper\n");
    project.write("src/pkg/helper.py", "");
    project.write("src/pkg/unused.py", "");
    let request = project
        .builder()
        .executable(Executable::named("tool"))
        .include_modules(["pkg.hidden"])
        .include_path([project.path("src")])
        .build()
        .unwrap();

    let manifest = project.freeze(&request).unwrap();

    assert_eq!(
        module_names(&manifest),
        vec!["pkg", "pkg.helper", "pkg.hidden", "sys", "tool__init__"]
    );
    let image = fs::read(project.dist().join("tool")).unwrap();
    assert_eq!(
        archive_names(appended_archive(&image).unwrap()),
        vec![
            "pkg/__init__.pyc".to_owned(),
            "pkg/helper.pyc".to_owned(),
            "pkg/hidden.pyc".to_owned(),
            "tool__init__.pyc".to_owned(),
        ]
    );
}

#[test]
fn test_wildcard_rewrites_embedded_paths() {
    let project = Project::new();
    let script = project.write("src/app.py", "import pkg.mod\n");
    project.write("src/pkg/__init__.py", "");
    project.write("src/pkg/mod.py", "VALUE = 1\n");
    let request = project
        .builder()
        .executable(Executable::new(&script))
        .replace_paths([ReplaceRule::parse("*=<SANITIZED>").unwrap()])
        .build()
        .unwrap();

    project.freeze(&request).unwrap();

    let image = fs::read(project.dist().join("app")).unwrap();
    let entry = archive_entry(appended_archive(&image).unwrap(), "pkg/mod.pyc");
    let embedded = String::from_utf8_lossy(&entry[16..]);
    let expected = Path::new("<SANITIZED>").join("pkg").join("mod.py");
    assert!(
        embedded.starts_with(&format!("0:{}\n", expected.display())),
        "embedded filename was {embedded:?}"
    );
}

#[test]
fn test_shared_library_of_two_extensions_copied_once() {
    let project = Project::new();
    let script = project.write("src/app.py", "import fast\nimport pkg.speed\n");
    project.write(&format!("src/fast{EXT_SUFFIX}"), "ext-fast");
    project.write("src/pkg/__init__.py", "");
    project.write(&format!("src/pkg/speed{EXT_SUFFIX}"), "ext-speed");
    let shared = project.write("libs/libshared.so.1", "shared-library");
    let list_file = project.path("extlist.txt");
    let request = project
        .builder()
        .executable(Executable::new(&script))
        .ext_list_file(&list_file)
        .build()
        .unwrap();

    let library = LinkedLibrary {
        name: "libshared.so.1".to_owned(),
        path: Some(shared),
    };
    let introspector = FixtureIntrospector::default()
        .with(&format!("fast{EXT_SUFFIX}"), vec![library.clone()])
        .with(&format!("speed{EXT_SUFFIX}"), vec![library]);
    let manifest = project.freezer(&request, introspector).freeze().unwrap();

    let dist = project.dist();
    let copies = manifest
        .files
        .iter()
        .filter(|f| f.target == dist.join("libshared.so.1"))
        .count();
    assert_eq!(copies, 1);
    assert_eq!(fs::read(dist.join("libshared.so.1")).unwrap(), b"shared-library");
    assert_eq!(fs::read(dist.join(format!("fast{EXT_SUFFIX}"))).unwrap(), b"ext-fast");
    assert_eq!(
        fs::read(dist.join(format!("pkg.speed{EXT_SUFFIX}"))).unwrap(),
        b"ext-speed"
    );
    assert_eq!(
        fs::read_to_string(&list_file).unwrap(),
        format!("fast{EXT_SUFFIX}\nlibshared.so.1\npkg.speed{EXT_SUFFIX}\n")
    );

    // The package extension is reached through a loader in the archive
    let image = fs::read(dist.join("app")).unwrap();
    let names = archive_names(appended_archive(&image).unwrap());
    assert!(names.contains(&"pkg/speed.pyc".to_owned()));
    assert!(!names.iter().any(|n| n.starts_with("fast")));
}

#[test]
fn test_unlocatable_base_dependency_is_fatal() {
    let project = Project::new();
    let script = project.write("src/app.py", "");
    let introspector = FixtureIntrospector::default().with(
        "Console",
        vec![LinkedLibrary {
            name: "libpython3.12.so.1.0".to_owned(),
            path: None,
        }],
    );

    let request = project
        .builder()
        .executable(Executable::new(&script))
        .build()
        .unwrap();
    let err = project
        .freezer(&request, introspector.clone())
        .freeze()
        .unwrap_err();
    assert_eq!(err.step, Step::Copy);
    assert!(matches!(
        err.kind,
        FailureKind::DependencyNotFound { ref name, .. } if name == "libpython3.12.so.1.0"
    ));

    // Without dependency copying the base is never inspected
    let request = project
        .builder()
        .executable(Executable::new(&script))
        .copy_dependent_files(false)
        .build()
        .unwrap();
    let manifest = project.freezer(&request, introspector).freeze().unwrap();
    assert_eq!(manifest.executables.len(), 1);
}

#[test]
fn test_archive_written_beside_executable_when_not_appended() {
    let project = Project::new();
    let script = project.write("src/app.py", "import sys\n");
    let request = project
        .builder()
        .executable(Executable::new(&script))
        .append_script_to_exe(false)
        .compress(true)
        .build()
        .unwrap();

    let manifest = project.freeze(&request).unwrap();

    let dist = project.dist();
    assert_eq!(fs::read(dist.join("app")).unwrap(), b"launcher-stub");
    let archive = fs::read(dist.join(LIBRARY_ZIP)).unwrap();
    assert_eq!(
        archive_names(&archive),
        vec!["app__init__.pyc".to_owned(), "app__main__.pyc".to_owned()]
    );
    assert!(manifest.files.iter().any(|f| f.target == dist.join(LIBRARY_ZIP)));
}

#[test]
fn test_unknown_base_fails_in_init() {
    let project = Project::new();
    let script = project.write("src/app.py", "");
    let request = project
        .builder()
        .executable(Executable::new(&script).with_base("Missing"))
        .build()
        .unwrap();

    let err = project.freeze(&request).unwrap_err();

    assert_eq!(err.step, Step::Init);
    assert!(matches!(err.kind, FailureKind::BaseNotFound { ref name } if name == "Missing"));
    assert!(!project.dist().exists());
}

#[test]
fn test_syntax_error_names_module_and_path() {
    let project = Project::new();
    let script = project.write("src/app.py", "import bad\n");
    let bad = project.write("src/bad.py", "def broken(:\n    pass\n");
    let request = project
        .builder()
        .executable(Executable::new(&script))
        .build()
        .unwrap();

    let err = project.freeze(&request).unwrap_err();

    assert_eq!(err.step, Step::Build);
    match err.kind {
        FailureKind::CompileError { module, path, .. } => {
            assert_eq!(module, "bad");
            assert_eq!(path, fs::canonicalize(bad).unwrap());
        }
        other => panic!("unexpected failure: {other:?}"),
    }
}

#[test]
fn test_include_files_and_zip_includes() {
    let project = Project::new();
    let script = project.write("src/app.py", "");
    let readme = project.write("README.txt", "read me");
    project.write("data/templates/base.html", "<html/>");
    let request = project
        .builder()
        .executable(Executable::new(&script))
        .include_file(&readme, "docs/README.txt")
        .zip_include(cryo::request::ZipInclude::from_path(project.path("data")).unwrap())
        .build()
        .unwrap();

    project.freeze(&request).unwrap();

    let dist = project.dist();
    assert_eq!(fs::read_to_string(dist.join("docs/README.txt")).unwrap(), "read me");
    let image = fs::read(dist.join("app")).unwrap();
    let archive = appended_archive(&image).unwrap();
    assert_eq!(archive_entry(archive, "data/templates/base.html"), b"<html/>");
}
