use blake3::Hasher;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use walkdir::WalkDir;

use crate::error::{Error, IoResultExt, Result};

/// Fingerprint of an in-memory buffer.
pub fn hash_bytes(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Fingerprint of a file or directory tree, following symlinks.
///
/// Directories hash each file's relative path followed by its content, in
/// sorted order, so two trees with the same layout and bytes fingerprint
/// identically regardless of where they live.
pub fn hash_path(path: &Path) -> Result<String> {
    let metadata = std::fs::metadata(path).at(path)?;
    if metadata.is_dir() {
        hash_dir(path)
    } else {
        let mut hasher = Hasher::new();
        feed_file(&mut hasher, path)?;
        Ok(hasher.finalize().to_hex().to_string())
    }
}

/// Like [`hash_path`] but `None` when the path does not resolve to anything.
pub fn hash_if_exists(path: &Path) -> Result<Option<String>> {
    if path.exists() {
        hash_path(path).map(Some)
    } else {
        Ok(None)
    }
}

fn hash_dir(root: &Path) -> Result<String> {
    let mut hasher = Hasher::new();

    for entry in WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
    {
        let entry = entry.map_err(|e| Error::Io {
            path: root.to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        hasher.update(rel.to_string_lossy().replace('\\', "/").as_bytes());
        hasher.update(&[0]);
        feed_file(&mut hasher, entry.path())?;
    }

    Ok(hasher.finalize().to_hex().to_string())
}

fn feed_file(hasher: &mut Hasher, path: &Path) -> Result<()> {
    let file = File::open(path).at(path)?;
    let mut reader = BufReader::new(file);
    let mut buffer = [0; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer).at(path)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(())
}
