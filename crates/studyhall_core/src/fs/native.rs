//! Disk-backed [`FileSystem`] (not available on WASM).

use std::fs;
use std::io::{Error, ErrorKind, Result};
use std::path::Path;

use super::FileSystem;

/// Maps every operation onto `std::fs`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RealFileSystem;

impl FileSystem for RealFileSystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        fs::write(path, content)
    }

    fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
    }

    fn replace(&self, from: &Path, to: &Path) -> Result<()> {
        if !from.is_file() {
            return Err(Error::new(
                ErrorKind::NotFound,
                format!("nothing to move at {}", from.display()),
            ));
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        // Atomic on the same filesystem; an existing `to` is swapped out
        fs::rename(from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_swaps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFileSystem;
        let from = dir.path().join("manifest.json.partial");
        let to = dir.path().join("manifest.json");
        fs.write(&to, b"old").unwrap();
        fs.write(&from, b"new").unwrap();

        fs.replace(&from, &to).unwrap();
        assert_eq!(fs.read(&to).unwrap(), b"new");
        assert!(!fs.exists(&from));
    }

    #[test]
    fn test_replace_into_new_directory() {
        let dir = tempfile::tempdir().unwrap();
        let fs = RealFileSystem;
        let from = dir.path().join("tag.json.partial");
        let to = dir.path().join("resources/tag/algebra.json");
        fs.write(&from, br#"{"name":"algebra"}"#).unwrap();

        fs.replace(&from, &to).unwrap();
        assert!(!fs.exists(&from));
        assert_eq!(fs.read_to_string(&to).unwrap(), r#"{"name":"algebra"}"#);
    }

    #[test]
    fn test_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let there = dir.path().join("there");
        RealFileSystem.write(&there, b"kept").unwrap();
        let err = RealFileSystem
            .replace(&dir.path().join("gone"), &there)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(RealFileSystem.read(&there).unwrap(), b"kept");
    }
}
