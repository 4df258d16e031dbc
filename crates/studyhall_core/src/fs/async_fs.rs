use std::future::Future;
use std::io::Result;
use std::path::Path;
use std::pin::Pin;

use super::FileSystem;

/// A boxed, `Send` future, used by every object-safe async trait in the crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Async counterpart of [`FileSystem`].
///
/// Methods return [`BoxFuture`] so the trait stays usable as
/// `dyn AsyncFileSystem`.
pub trait AsyncFileSystem: Send + Sync {
    /// See [`FileSystem::read`].
    fn read<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Vec<u8>>>;

    /// See [`FileSystem::write`].
    fn write<'a>(&'a self, path: &'a Path, content: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// See [`FileSystem::remove`].
    fn remove<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>>;

    /// See [`FileSystem::exists`].
    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, bool>;

    /// See [`FileSystem::create_dir_all`].
    fn create_dir_all<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>>;

    /// See [`FileSystem::replace`].
    fn replace<'a>(&'a self, from: &'a Path, to: &'a Path) -> BoxFuture<'a, Result<()>>;

    /// See [`FileSystem::read_to_string`].
    fn read_to_string<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            String::from_utf8(self.read(path).await?)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }
}

/// Runs a synchronous [`FileSystem`] behind the async interface. Every call
/// completes on the polling thread.
#[derive(Clone, Debug, Default)]
pub struct SyncToAsyncFs<F: FileSystem> {
    inner: F,
}

impl<F: FileSystem> SyncToAsyncFs<F> {
    /// Wrap `fs`.
    pub fn new(fs: F) -> Self {
        Self { inner: fs }
    }

    /// The wrapped filesystem.
    pub fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: FileSystem> AsyncFileSystem for SyncToAsyncFs<F> {
    fn read<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move { self.inner.read(path) })
    }

    fn write<'a>(&'a self, path: &'a Path, content: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.inner.write(path, content) })
    }

    fn remove<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.inner.remove(path) })
    }

    fn exists<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, bool> {
        Box::pin(async move { self.inner.exists(path) })
    }

    fn create_dir_all<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.inner.create_dir_all(path) })
    }

    fn replace<'a>(&'a self, from: &'a Path, to: &'a Path) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.inner.replace(from, to) })
    }

    fn read_to_string<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move { self.inner.read_to_string(path) })
    }
}
