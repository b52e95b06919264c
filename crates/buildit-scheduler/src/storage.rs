//! On-disk layout and durable writes.
//!
//! ```text
//! <root>/items.json
//! <root>/items/<item-id>/config.json
//! <root>/items/<item-id>/nextBuildNumber
//! <root>/items/<item-id>/builds/<n>/build.json
//! <root>/items/<item-id>/builds/<n>/log
//! <root>/items/<item-id>/builds/<n>/archive/
//! <root>/items/<item-id>/lastSuccessful
//! <root>/items/<item-id>/lastStable
//! <root>/workspace/<item-id>/
//! ```
//!
//! Everything is keyed by the stable item id, never by name.

use buildit_core::{ResourceId, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn items_file(&self) -> PathBuf {
        self.root.join("items.json")
    }

    pub fn item_dir(&self, id: ResourceId) -> PathBuf {
        self.root.join("items").join(id.to_string())
    }

    pub fn workspace(&self, id: ResourceId) -> PathBuf {
        self.root.join("workspace").join(id.to_string())
    }
}

/// Write `bytes` to `path` so that readers see either the old or the new
/// contents: temp file, fsync, rename, fsync of the directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = parent_dir(path)?;
    std::fs::create_dir_all(dir)?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = dir.join(format!(".{file_name}.tmp"));

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)?;
    fsync_dir(dir)?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Read a JSON file; a missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Remove a file, treating a missing file as success.
pub fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Remove a directory tree, treating a missing directory as success.
pub fn remove_dir_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

fn parent_dir(path: &Path) -> io::Result<&Path> {
    path.parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("value");

        write_atomic(&path, b"1").unwrap();
        write_atomic(&path, b"2").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "2");
        assert!(!dir.path().join("nested").join(".value.tmp").exists());
    }

    #[test]
    fn test_read_json_missing_is_none() {
        let dir = tempdir().unwrap();
        let value: Option<Vec<u32>> = read_json(&dir.path().join("absent.json")).unwrap();
        assert!(value.is_none());

        let path = dir.path().join("present.json");
        write_json_atomic(&path, &vec![1u32, 2]).unwrap();
        let value: Option<Vec<u32>> = read_json(&path).unwrap();
        assert_eq!(value, Some(vec![1, 2]));
    }

    #[test]
    fn test_layout_is_keyed_by_id() {
        let layout = Layout::new("/data");
        let id = ResourceId::new();
        assert_eq!(layout.item_dir(id), PathBuf::from(format!("/data/items/{id}")));
        assert_eq!(layout.workspace(id), PathBuf::from(format!("/data/workspace/{id}")));
    }
}
