//! In-memory [`FileSystem`], used by tests and by callers that want a
//! bundle without touching disk.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Error, ErrorKind, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use super::FileSystem;

#[derive(Debug, Default)]
struct Tree {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
}

impl Tree {
    fn add_dirs(&mut self, dir: Option<&Path>) {
        let mut current = dir;
        while let Some(dir) = current {
            if dir.as_os_str().is_empty() || !self.dirs.insert(dir.to_path_buf()) {
                break;
            }
            current = dir.parent();
        }
    }

    fn require_parent(&self, path: &Path) -> Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() && !self.dirs.contains(parent) => {
                Err(Error::new(
                    ErrorKind::NotFound,
                    format!("no directory {}", parent.display()),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Files and directories kept in a shared map. Clones see the same tree.
#[derive(Clone, Debug, Default)]
pub struct InMemoryFileSystem {
    tree: Arc<RwLock<Tree>>,
}

impl InMemoryFileSystem {
    /// An empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file, creating its directories.
    pub fn with_file(self, path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) -> Self {
        {
            let path = path.into();
            let mut tree = self.tree.write().unwrap_or_else(|e| e.into_inner());
            tree.add_dirs(path.parent());
            tree.files.insert(path, content.into());
        }
        self
    }

    /// Every stored file, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.tree.read().unwrap_or_else(|e| e.into_inner()).files.keys().cloned().collect()
    }
}

impl FileSystem for InMemoryFileSystem {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.tree
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no file {}", path.display())))
    }

    fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        let mut tree = self.tree.write().unwrap_or_else(|e| e.into_inner());
        tree.require_parent(path)?;
        tree.files.insert(path.to_path_buf(), content.to_vec());
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        match self.tree.write().unwrap_or_else(|e| e.into_inner()).files.remove(path) {
            Some(_) => Ok(()),
            None => Err(Error::new(ErrorKind::NotFound, format!("no file {}", path.display()))),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        let tree = self.tree.read().unwrap_or_else(|e| e.into_inner());
        tree.files.contains_key(path) || tree.dirs.contains(path)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut tree = self.tree.write().unwrap_or_else(|e| e.into_inner());
        if tree.files.contains_key(path) {
            return Err(Error::new(
                ErrorKind::AlreadyExists,
                format!("{} is a file", path.display()),
            ));
        }
        tree.add_dirs(Some(path));
        Ok(())
    }

    fn replace(&self, from: &Path, to: &Path) -> Result<()> {
        let mut tree = self.tree.write().unwrap_or_else(|e| e.into_inner());
        let content = tree.files.remove(from).ok_or_else(|| {
            Error::new(ErrorKind::NotFound, format!("nothing to move at {}", from.display()))
        })?;
        tree.add_dirs(to.parent());
        tree.files.insert(to.to_path_buf(), content);
        Ok(())
    }
}
