//! Byte-level file access for snapshot bundles.
//!
//! The packer writes bundles and [`crate::bundle::FsBundleSource`] reads them
//! back; both go through [`AsyncFileSystem`] so the same code runs against
//! the real disk and the in-memory store used in tests. Synchronous backends
//! implement [`FileSystem`] and are lifted with [`SyncToAsyncFs`].

mod async_fs;
mod memory;
#[cfg(not(target_arch = "wasm32"))]
mod native;

pub use async_fs::{AsyncFileSystem, BoxFuture, SyncToAsyncFs};
pub use memory::InMemoryFileSystem;
#[cfg(not(target_arch = "wasm32"))]
pub use native::RealFileSystem;

use std::io::{Error, ErrorKind, Result};
use std::path::Path;

/// Blocking file access. Implementations must be shareable across threads.
pub trait FileSystem: Send + Sync {
    /// Whole contents of a file.
    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Replace a file's contents, creating it if needed. The parent directory
    /// must exist.
    fn write(&self, path: &Path, content: &[u8]) -> Result<()>;

    /// Delete a file. Fails with `NotFound` when it is missing.
    fn remove(&self, path: &Path) -> Result<()>;

    /// Whether a file or directory exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Create `path` and its missing parents.
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Move `from` onto `to` in one step, replacing any file already at `to`
    /// and creating missing parents of `to`.
    ///
    /// Readers of `to` see either the old or the new contents, never neither.
    /// Fails with `NotFound` when `from` is missing; `to` is untouched on
    /// failure.
    fn replace(&self, from: &Path, to: &Path) -> Result<()>;

    /// Contents of a UTF-8 text file.
    fn read_to_string(&self, path: &Path) -> Result<String> {
        String::from_utf8(self.read(path)?).map_err(|e| Error::new(ErrorKind::InvalidData, e))
    }
}
