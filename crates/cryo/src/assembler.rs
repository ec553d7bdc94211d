//! Writing the launcher executables
//!
//! An executable is the base stub, optionally with an icon embedded and the
//! module archive appended. An appended archive is followed by a fixed-size
//! trailer so the launcher can find it without scanning:
//!
//! ```text
//! [ base stub ][ zip archive ][ offset: u64 LE ][ length: u64 LE ][ "CRYOZIP\0" ]
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::{Level, debug, log_enabled, trace, warn};

use crate::{
    bases::native_extension,
    error::{FailureKind, Warning},
    fs_util::{write_atomic, write_executable_atomic},
    icon::{IconError, describe_resources, embed_icon},
    request::Executable,
};

/// Archive file name used when the archive is not appended
pub const LIBRARY_ZIP: &str = "library.zip";
/// Last eight bytes of an executable carrying an appended archive
pub const TRAILER_MAGIC: [u8; 8] = *b"CRYOZIP\0";
pub const TRAILER_LEN: usize = 24;

/// Concatenate `archive` onto `image`, followed by the trailer
pub fn append_archive(image: &[u8], archive: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(image.len() + archive.len() + TRAILER_LEN);
    out.extend_from_slice(image);
    out.extend_from_slice(archive);
    out.extend_from_slice(&(image.len() as u64).to_le_bytes());
    out.extend_from_slice(&(archive.len() as u64).to_le_bytes());
    out.extend_from_slice(&TRAILER_MAGIC);
    out
}

/// Locate an appended archive by its trailer
pub fn appended_archive(image: &[u8]) -> Option<&[u8]> {
    let trailer_start = image.len().checked_sub(TRAILER_LEN)?;
    let trailer = &image[trailer_start..];
    if trailer[16..] != TRAILER_MAGIC {
        return None;
    }
    let offset = usize::try_from(u64::from_le_bytes(trailer[..8].try_into().ok()?)).ok()?;
    let length = usize::try_from(u64::from_le_bytes(trailer[8..16].try_into().ok()?)).ok()?;
    let end = offset.checked_add(length)?;
    (end == trailer_start).then(|| &image[offset..end])
}

/// File name an executable is written under.
///
/// An explicit target name is used verbatim; otherwise the script's stem
/// gets the base stub's own extension (`.exe` on Windows, none elsewhere).
pub fn target_name(executable: &Executable, base: &Path) -> Option<String> {
    if let Some(name) = &executable.target_name {
        return Some(name.clone());
    }
    let stem = executable.script.as_deref()?.file_stem()?.to_string_lossy();
    Some(match native_extension(base) {
        Some(extension) => format!("{stem}.{extension}"),
        None => stem.into_owned(),
    })
}

/// Everything needed to write one executable
#[derive(Debug, Clone, Copy)]
pub struct AssemblyInput<'a> {
    pub base: &'a Path,
    pub target_name: &'a str,
    pub icon: Option<&'a Path>,
    /// Appended when present
    pub archive: Option<&'a [u8]>,
}

/// Writes executables into one target directory
#[derive(Debug)]
pub struct ExecutableAssembler<'a> {
    target_dir: &'a Path,
    warnings: Vec<Warning>,
}

impl<'a> ExecutableAssembler<'a> {
    pub fn new(target_dir: &'a Path) -> Self {
        Self {
            target_dir,
            warnings: Vec::new(),
        }
    }

    /// Write one executable and return its path
    pub fn assemble(&mut self, input: AssemblyInput<'_>) -> Result<PathBuf, FailureKind> {
        let path = self.target_dir.join(input.target_name);
        let mut image = fs::read(input.base).map_err(|e| FailureKind::io(input.base, e))?;

        if let Some(icon) = input.icon {
            let ico = fs::read(icon).map_err(|e| FailureKind::io(icon, e))?;
            match embed_icon(&image, &ico) {
                Ok(patched) => {
                    debug!("Embedded icon {} in {}", icon.display(), path.display());
                    if log_enabled!(Level::Trace)
                        && let Ok(tree) = describe_resources(&patched)
                    {
                        trace!("Resources of {}:\n{tree}", path.display());
                    }
                    image = patched;
                }
                Err(e) => self.unsupported_icon(&path, &e),
            }
        }

        if let Some(archive) = input.archive {
            image = append_archive(&image, archive);
        }

        write_executable_atomic(&path, &image)?;
        debug!(
            "Wrote {} ({} bytes) from base {}",
            path.display(),
            image.len(),
            input.base.display()
        );
        Ok(path)
    }

    fn unsupported_icon(&mut self, executable: &Path, error: &IconError) {
        let warning = Warning::IconUnsupported {
            executable: executable.to_path_buf(),
            reason: error.to_string(),
        };
        warn!("{warning}");
        self.warnings.push(warning);
    }

    /// Write the archive next to the executables
    pub fn write_library(&self, archive: &[u8]) -> Result<PathBuf, FailureKind> {
        let path = self.target_dir.join(LIBRARY_ZIP);
        write_atomic(&path, archive)?;
        debug!("Wrote {} ({} bytes)", path.display(), archive.len());
        Ok(path)
    }

    pub fn into_warnings(self) -> Vec<Warning> {
        self.warnings
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_trailer_locates_archive() {
        let image = append_archive(b"\x7fELF-stub", b"PK-archive-bytes");
        assert_eq!(&image[..9], b"\x7fELF-stub");
        assert_eq!(appended_archive(&image), Some(&b"PK-archive-bytes"[..]));
        assert_eq!(appended_archive(b"\x7fELF-stub"), None);

        let mut tampered = image.clone();
        tampered[9] = b'X';
        let len = tampered.len();
        tampered[len - TRAILER_LEN] = 3;
        assert_eq!(appended_archive(&tampered), None);
    }

    #[test]
    fn test_target_names() {
        let script = Executable::new("src/app.py");
        assert_eq!(
            target_name(&script, Path::new("bases/Console")),
            Some("app".to_owned())
        );
        assert_eq!(
            target_name(&script, Path::new("bases/Console.exe")),
            Some("app.exe".to_owned())
        );
        let named = Executable::new("src/app.py").with_target_name("tool");
        assert_eq!(
            target_name(&named, Path::new("bases/Console.exe")),
            Some("tool".to_owned())
        );
        assert_eq!(target_name(&Executable::default(), Path::new("Console")), None);
    }

    #[test]
    fn test_assemble_appends_and_sets_mode() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let base = temp_dir.path().join("Console");
        fs::write(&base, b"stub-bytes")?;
        let target_dir = temp_dir.path().join("dist");

        let mut assembler = ExecutableAssembler::new(&target_dir);
        let path = assembler.assemble(AssemblyInput {
            base: &base,
            target_name: "app",
            icon: None,
            archive: Some(b"zip"),
        })?;

        assert_eq!(path, target_dir.join("app"));
        let written = fs::read(&path)?;
        assert_eq!(appended_archive(&written), Some(&b"zip"[..]));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o755);
        }
        assert!(assembler.into_warnings().is_empty());
        Ok(())
    }

    #[test]
    fn test_icon_on_elf_base_is_warning() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let base = temp_dir.path().join("Console");
        let mut elf = vec![0x7f, b'E', b'L', b'F', 2, 1, 1, 0];
        elf.resize(64, 0);
        fs::write(&base, &elf)?;
        let icon = temp_dir.path().join("app.ico");
        fs::write(&icon, [0, 0, 1, 0, 0, 0])?;

        let mut assembler = ExecutableAssembler::new(temp_dir.path());
        let path = assembler.assemble(AssemblyInput {
            base: &base,
            target_name: "app",
            icon: Some(&icon),
            archive: None,
        })?;

        assert_eq!(fs::read(&path)?, elf);
        let warnings = assembler.into_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(matches!(&warnings[0], Warning::IconUnsupported { executable, .. } if *executable == path));
        Ok(())
    }

    #[test]
    fn test_library_written_beside_executables() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let assembler = ExecutableAssembler::new(temp_dir.path());
        let path = assembler.write_library(b"archive")?;
        assert_eq!(path, temp_dir.path().join(LIBRARY_ZIP));
        assert_eq!(fs::read(path)?, b"archive");
        Ok(())
    }
}
