//! Test utilities for studyhall_core
//!
//! Fault-injecting wrappers around the in-memory store and filesystem, plus
//! helpers for seeding a live course.

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::DataLayerConfig;
use crate::data::{DataLayerProvider, ExternalClients, ProviderRegistry};
use crate::fs::{FileSystem, InMemoryFileSystem};
use crate::store::{
    BoxFuture, DocQuery, Document, DocumentStore, MemoryStore, SecurityDocument, StoreError,
    StoreResult,
};

/// A [`MemoryStore`] whose namespace creation fails for chosen names.
#[derive(Clone, Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            failing: Arc::default(),
        }
    }

    /// Make `create_namespace(namespace)` fail until cleared.
    pub fn fail_namespace(&self, namespace: &str) {
        self.failing.lock().unwrap().insert(namespace.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }
}

impl DocumentStore for FaultyStore {
    fn ping(&self) -> BoxFuture<'_, StoreResult<()>> {
        self.inner.ping()
    }

    fn authenticate<'a>(
        &'a self,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        self.inner.authenticate(username, password)
    }

    fn create_namespace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        if self.failing.lock().unwrap().contains(name) {
            return Box::pin(async move {
                Err(StoreError::Unavailable(format!("injected failure for {}", name)))
            });
        }
        self.inner.create_namespace(name)
    }

    fn delete_namespace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        self.inner.delete_namespace(name)
    }

    fn namespace_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, StoreResult<bool>> {
        self.inner.namespace_exists(name)
    }

    fn list_namespaces<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, StoreResult<Vec<String>>> {
        self.inner.list_namespaces(prefix)
    }

    fn get_doc<'a>(
        &'a self,
        namespace: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<Document>>> {
        self.inner.get_doc(namespace, id)
    }

    fn put_doc<'a>(
        &'a self,
        namespace: &'a str,
        id: &'a str,
        body: &'a serde_json::Value,
        expected_rev: Option<&'a str>,
    ) -> BoxFuture<'a, StoreResult<Document>> {
        self.inner.put_doc(namespace, id, body, expected_rev)
    }

    fn delete_doc<'a>(
        &'a self,
        namespace: &'a str,
        id: &'a str,
        expected_rev: &'a str,
    ) -> BoxFuture<'a, StoreResult<()>> {
        self.inner.delete_doc(namespace, id, expected_rev)
    }

    fn list_docs<'a>(
        &'a self,
        namespace: &'a str,
        query: &'a DocQuery,
    ) -> BoxFuture<'a, StoreResult<Vec<Document>>> {
        self.inner.list_docs(namespace, query)
    }

    fn get_security<'a>(
        &'a self,
        namespace: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<SecurityDocument>>> {
        self.inner.get_security(namespace)
    }

    fn put_security<'a>(
        &'a self,
        namespace: &'a str,
        security: &'a SecurityDocument,
    ) -> BoxFuture<'a, StoreResult<()>> {
        self.inner.put_security(namespace, security)
    }
}

/// An [`InMemoryFileSystem`] refusing writes to paths containing a marker.
#[derive(Clone, Default)]
pub struct FaultyFs {
    pub inner: InMemoryFileSystem,
    marker: Arc<Mutex<Option<String>>>,
    replace_suffix: Arc<Mutex<Option<String>>>,
}

impl FaultyFs {
    pub fn new(inner: InMemoryFileSystem) -> Self {
        Self {
            inner,
            ..Default::default()
        }
    }

    /// Fail replaces whose target ends with `suffix`; writes still succeed.
    pub fn fail_replace_onto(&self, suffix: Option<&str>) {
        *self.replace_suffix.lock().unwrap() = suffix.map(str::to_string);
    }

    /// Fail writes whose path contains `marker`; `None` heals the filesystem.
    pub fn fail_writes_containing(&self, marker: Option<&str>) {
        *self.marker.lock().unwrap() = marker.map(str::to_string);
    }

    fn check(&self, path: &Path) -> io::Result<()> {
        if let Some(marker) = self.marker.lock().unwrap().as_deref()
            && path.to_string_lossy().contains(marker)
        {
            return Err(io::Error::other(format!(
                "injected write failure for {}",
                path.display()
            )));
        }
        Ok(())
    }
}

impl FileSystem for FaultyFs {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.inner.read(path)
    }

    fn write(&self, path: &Path, content: &[u8]) -> io::Result<()> {
        self.check(path)?;
        self.inner.write(path, content)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.inner.remove(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path)
    }

    fn replace(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.check(to)?;
        if let Some(suffix) = self.replace_suffix.lock().unwrap().as_deref()
            && to.to_string_lossy().ends_with(suffix)
        {
            return Err(io::Error::other(format!(
                "injected replace failure for {}",
                to.display()
            )));
        }
        self.inner.replace(from, to)
    }
}

/// A live provider over `store`, logged in as `username`.
///
/// The account must already exist in the store.
pub async fn live_provider(
    store: Arc<dyn DocumentStore>,
    username: &str,
    password: &str,
) -> Arc<DataLayerProvider> {
    let config = DataLayerConfig::live("memory://studyhall").with_credentials(username, password);
    ProviderRegistry::new()
        .initialize(config, ExternalClients::new().with_store(store))
        .await
        .unwrap()
}
