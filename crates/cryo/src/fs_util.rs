//! Output file helpers
//!
//! Every file the freezer produces is written to a temporary file in the
//! destination directory and renamed into place, so a failed run never
//! leaves a truncated file at a final path.

use std::{
    fs,
    io::Write,
    path::Path,
};

use tempfile::NamedTempFile;

use crate::error::FailureKind;

fn temp_in(path: &Path) -> Result<NamedTempFile, FailureKind> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| FailureKind::io(dir, e))?;
    NamedTempFile::new_in(dir).map_err(|e| FailureKind::io(dir, e))
}

fn persist(temp: NamedTempFile, path: &Path) -> Result<(), FailureKind> {
    temp.persist(path)
        .map(drop)
        .map_err(|e| FailureKind::io(path, e.error))
}

fn write_temp(path: &Path, data: &[u8]) -> Result<NamedTempFile, FailureKind> {
    let mut temp = temp_in(path)?;
    temp.write_all(data)
        .and_then(|()| temp.flush())
        .map_err(|e| FailureKind::io(path, e))?;
    Ok(temp)
}

/// Write `data` to `path` atomically
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), FailureKind> {
    let temp = write_temp(path, data)?;
    persist(temp, path)
}

/// Write `data` to `path` atomically as an executable (0o755).
///
/// The mode is set before the rename, so the final path never holds a
/// file without execute bits. No-op for the mode where permission bits do
/// not exist.
pub fn write_executable_atomic(path: &Path, data: &[u8]) -> Result<(), FailureKind> {
    let temp = write_temp(path, data)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o755))
            .map_err(|e| FailureKind::io(path, e))?;
    }
    persist(temp, path)
}

/// Copy `source` to `dest` atomically, keeping its permission bits
pub fn copy_atomic(source: &Path, dest: &Path) -> Result<(), FailureKind> {
    let temp = temp_in(dest)?;
    fs::copy(source, temp.path()).map_err(|e| FailureKind::io(source, e))?;
    persist(temp, dest)
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_write_creates_parents_and_replaces() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("nested/dir/out.bin");
        write_atomic(&path, b"first")?;
        write_atomic(&path, b"second")?;
        assert_eq!(fs::read(&path)?, b"second");
        let leftovers = fs::read_dir(path.parent().expect("has parent"))?.count();
        assert_eq!(leftovers, 1);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_keeps_mode() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("lib.so");
        fs::write(&source, b"ELF")?;
        fs::set_permissions(&source, fs::Permissions::from_mode(0o750))?;

        let dest = temp_dir.path().join("out/lib.so");
        copy_atomic(&source, &dest)?;
        assert_eq!(fs::metadata(&dest)?.permissions().mode() & 0o777, 0o750);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_lands_with_mode_set() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("dist/app");
        fs::create_dir_all(temp_dir.path().join("dist"))?;
        fs::write(&path, b"stale")?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        write_executable_atomic(&path, b"launcher")?;
        assert_eq!(fs::read(&path)?, b"launcher");
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o755);
        let leftovers = fs::read_dir(temp_dir.path().join("dist"))?.count();
        assert_eq!(leftovers, 1);
        Ok(())
    }
}
