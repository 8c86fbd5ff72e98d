//! Filesystem helpers shared by the registry and the deployer.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{Error, IoResultExt, Result};

/// Copy a file or directory tree to `target`, replacing whatever is there.
pub fn copy_path(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    if exists_no_follow(target) {
        remove_path(target)?;
    }

    if source.is_dir() {
        copy_dir_recursive(source, target)
    } else {
        copy_file_with_metadata(source, target)
    }
}

/// Remove a file, symlink or directory tree. Symlinks are removed, never
/// followed.
pub fn remove_path(path: &Path) -> Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::io(path, e)),
    };

    if metadata.is_dir() {
        fs::remove_dir_all(path).at(path)
    } else {
        // Directory symlinks on Windows need remove_dir.
        fs::remove_file(path)
            .or_else(|e| if cfg!(windows) { fs::remove_dir(path) } else { Err(e) })
            .at(path)
    }
}

/// True if anything (including a dangling symlink) occupies `path`.
pub fn exists_no_follow(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Write `contents` next to `target` in a temp file and rename it into place,
/// so readers never observe a half-written file.
pub fn write_atomic(target: &Path, contents: &[u8]) -> Result<()> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).at(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir).at(dir)?;
    temp.write_all(contents).at(target)?;
    temp.as_file().sync_all().at(target)?;
    temp.persist(target).map_err(|e| Error::io(target, e.error))?;
    Ok(())
}

/// Copy a single file through a temp file in the target's directory, so
/// `target` is either the old or the new content, never a partial write.
pub fn copy_atomic(source: &Path, target: &Path) -> Result<()> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).at(dir)?;

    let temp = tempfile::NamedTempFile::new_in(dir).at(dir)?;
    copy_file_with_metadata(source, temp.path())?;
    temp.as_file().sync_all().at(target)?;
    temp.persist(target).map_err(|e| Error::io(target, e.error))?;
    Ok(())
}

pub fn copy_file_with_metadata(source: &Path, target: &Path) -> Result<()> {
    fs::copy(source, target).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            Error::PermissionDenied {
                path: target.to_path_buf(),
            }
        } else {
            Error::io(source, e)
        }
    })?;

    // Best effort: keep the source's modification time.
    let metadata = source.metadata().at(source)?;
    if let Ok(mtime) = metadata.modified() {
        filetime::set_file_mtime(target, filetime::FileTime::from_system_time(mtime)).at(target)?;
    }

    Ok(())
}

pub fn copy_dir_recursive(source: &Path, target: &Path) -> Result<()> {
    fs::create_dir_all(target).at(target)?;

    for entry in fs::read_dir(source).at(source)? {
        let entry = entry.at(source)?;
        let source_path = entry.path();
        let target_path = target.join(entry.file_name());

        if source_path.is_dir() {
            copy_dir_recursive(&source_path, &target_path)?;
        } else {
            copy_file_with_metadata(&source_path, &target_path)?;
        }
    }

    let permissions = source.metadata().at(source)?.permissions();
    fs::set_permissions(target, permissions).at(target)?;

    Ok(())
}

/// Mark a file executable for its owner, group and others.
#[cfg(unix)]
pub fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = fs::metadata(path).at(path)?.permissions();
    permissions.set_mode(permissions.mode() | 0o111);
    fs::set_permissions(path, permissions).at(path)
}

#[cfg(not(unix))]
pub fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(_path: &Path) -> bool {
    false
}
