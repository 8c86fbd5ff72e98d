//! Timestamped, append-only backups under `<repo>/backups/<name>/`.

use chrono::{Local, NaiveDateTime};
use fs_extra::dir::CopyOptions;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cfg::Layout;
use crate::error::{Error, IoResultExt, Result};
use crate::files;

const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%6f";
const STAMP_LEN: usize = 22;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    /// Directory entry name, e.g. `20240501-101530-123456-linux`.
    pub id: String,
    pub path: PathBuf,
    /// Platform the backup was taken from, or `repo` for repository copies.
    pub label: String,
    pub created: Option<NaiveDateTime>,
    pub size: u64,
}

/// Copy `source` into a new backup slot for `entry` and return its path.
/// Symlinks are followed; an existing backup is never overwritten.
pub fn create(layout: &Layout, entry: &str, label: &str, source: &Path) -> Result<PathBuf> {
    let dir = layout.backups_dir().join(entry);
    fs::create_dir_all(&dir).at(&dir)?;

    let stamp = Local::now().format(STAMP_FORMAT).to_string();
    let base = format!("{stamp}-{label}");
    let mut dest = dir.join(&base);
    let mut attempt = 1;
    while files::exists_no_follow(&dest) {
        dest = dir.join(format!("{base}-{attempt}"));
        attempt += 1;
    }

    if source.is_dir() {
        let mut options = CopyOptions::new();
        options.copy_inside = true;
        fs_extra::dir::copy(source, &dest, &options).map_err(|e| Error::Io {
            path: source.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e.to_string()),
        })?;
    } else {
        files::copy_file_with_metadata(source, &dest)?;
    }

    tracing::info!("Backed up {} to {}", source.display(), dest.display());
    Ok(dest)
}

/// Backups of `entry`, oldest first.
pub fn list(layout: &Layout, entry: &str) -> Result<Vec<BackupInfo>> {
    let dir = layout.backups_dir().join(entry);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut backups = Vec::new();
    for item in fs::read_dir(&dir).at(&dir)? {
        let item = item.at(&dir)?;
        let id = item.file_name().to_string_lossy().into_owned();
        let path = item.path();
        let (created, label) = parse_id(&id);
        backups.push(BackupInfo {
            size: size_of(&path),
            id,
            path,
            label,
            created,
        });
    }

    backups.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(backups)
}

fn parse_id(id: &str) -> (Option<NaiveDateTime>, String) {
    let Some(stamp) = id.get(..STAMP_LEN) else {
        return (None, String::new());
    };
    let created = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok();

    // `<stamp>-<label>` or `<stamp>-<label>-<n>` after a collision.
    let rest = id.get(STAMP_LEN + 1..).unwrap_or_default();
    let label = match rest.rsplit_once('-') {
        Some((label, n)) if n.chars().all(|c| c.is_ascii_digit()) => label,
        _ => rest,
    };
    (created, label.to_string())
}

fn size_of(path: &Path) -> u64 {
    if path.is_dir() {
        fs_extra::dir::get_size(path).unwrap_or(0)
    } else {
        path.metadata().map(|m| m.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_backups_never_collide() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path());
        let file = temp.path().join("bashrc");
        fs::write(&file, "one").unwrap();

        let first = create(&layout, "bashrc", "linux", &file).unwrap();
        fs::write(&file, "two").unwrap();
        let second = create(&layout, "bashrc", "linux", &file).unwrap();
        assert_ne!(first, second);

        let backups = list(&layout, "bashrc").unwrap();
        assert_eq!(backups.len(), 2);
        assert!(backups.iter().all(|b| b.label == "linux"));
        assert!(backups[0].created.is_some());
        assert_eq!(fs::read_to_string(&backups[1].path).unwrap(), "two");
    }

    #[test]
    fn test_directory_backup() {
        let temp = TempDir::new().unwrap();
        let layout = Layout::new(temp.path().join("repo"));
        let dir = temp.path().join("nvim");
        fs::create_dir_all(dir.join("lua")).unwrap();
        fs::write(dir.join("lua/init.lua"), "return {}").unwrap();

        let dest = create(&layout, "nvim", "macos", &dir).unwrap();
        assert_eq!(fs::read_to_string(dest.join("lua/init.lua")).unwrap(), "return {}");
        assert!(list(&layout, "nvim").unwrap()[0].size > 0);
    }

    #[test]
    fn test_parse_id_with_collision_suffix() {
        let (created, label) = parse_id("20240501-101530-123456-windows-2");
        assert!(created.is_some());
        assert_eq!(label, "windows");
        assert_eq!(parse_id("junk").1, "");
    }

    #[test]
    fn test_list_missing_is_empty() {
        let temp = TempDir::new().unwrap();
        assert!(list(&Layout::new(temp.path()), "nothing").unwrap().is_empty());
    }
}
