//! Storage abstraction for the live document database.
//!
//! This module defines the [`DocumentStore`] trait, the client interface the live
//! driver and the provisioning controller use to reach a replicated document
//! database, and the [`AccountEventLog`] trait for the append-only account log.
//!
//! # Storage Model
//!
//! The store is partitioned into *namespaces* (one per course, classroom and
//! account). Each namespace holds:
//! 1. **Documents**: JSON bodies addressed by id, versioned by an opaque revision
//! 2. **A security document**: the access rules for the namespace
//!
//! Writes follow a revision model: updating a document requires the revision the
//! writer last read, and a stale revision is reported as a conflict. There is no
//! cross-document transaction.
//!
//! Implementations: [`MemoryStore`] (tests, guests) and `SqliteStore` (feature
//! `sqlite`).

mod memory;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use sqlite::SqliteStore;

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::ConnectionConfig;
use crate::error::StudyError;
pub use crate::fs::BoxFuture;

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reported by a document store client.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The namespace does not exist.
    #[error("Namespace '{0}' does not exist")]
    NamespaceNotFound(String),

    /// Creating a namespace that already exists.
    #[error("Namespace '{0}' already exists")]
    NamespaceExists(String),

    /// The namespace exists but the document does not.
    #[error("Document '{id}' not found in '{namespace}'")]
    DocumentNotFound {
        /// Namespace searched.
        namespace: String,
        /// Missing document.
        id: String,
    },

    /// `expected_rev` did not match the stored revision.
    #[error("Document '{id}' in '{namespace}' has a newer revision")]
    Conflict {
        /// Namespace of the document.
        namespace: String,
        /// Document whose revision moved on.
        id: String,
    },

    /// Creating an account whose username is taken.
    #[error("Account '{0}' already exists")]
    AccountExists(String),

    /// The request was malformed.
    #[error("Invalid request: {0}")]
    Invalid(String),

    /// The store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A body did not (de)serialize.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The SQLite backend failed.
    #[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<StoreError> for StudyError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NamespaceNotFound(_) | StoreError::DocumentNotFound { .. } => {
                StudyError::NotFound(err.to_string())
            }
            StoreError::Conflict { id, .. } => StudyError::Conflict(id),
            StoreError::NamespaceExists(_) | StoreError::AccountExists(_) | StoreError::Invalid(_) => {
                StudyError::Validation(err.to_string())
            }
            StoreError::Serialization(e) => StudyError::Serialization(e.to_string()),
            StoreError::Unavailable(_) => StudyError::BackendUnavailable(err.to_string()),
            #[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
            StoreError::Sqlite(_) => StudyError::BackendUnavailable(err.to_string()),
        }
    }
}

/// A stored JSON document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Document id, unique within its namespace.
    pub id: String,
    /// Opaque revision, `"<generation>-<digest>"`.
    pub rev: String,
    /// Milliseconds since Unix epoch of the last write.
    pub updated_at: i64,
    /// JSON contents.
    pub body: serde_json::Value,
}

impl Document {
    /// Deserialize the body into a record type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> StoreResult<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }
}

/// Compute the revision that follows `previous` for `body`.
pub(crate) fn next_revision(previous: Option<&str>, body: &serde_json::Value) -> String {
    let generation = previous
        .and_then(|rev| rev.split_once('-'))
        .and_then(|(generation, _)| generation.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    let mut hasher = Sha256::new();
    hasher.update(body.to_string().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{}-{}", generation, &digest[..16])
}

/// Names and roles allowed by a security document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityMembers {
    /// Usernames.
    #[serde(default)]
    pub names: Vec<String>,
    /// Role names.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Access rules of a namespace.
///
/// Server administrators always have access; `admins` may change the namespace's
/// design and security, `members` may read and write documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityDocument {
    /// May change the namespace's design and security.
    #[serde(default)]
    pub admins: SecurityMembers,
    /// May read and write documents.
    #[serde(default)]
    pub members: SecurityMembers,
}

impl SecurityDocument {
    /// Read/write for exactly `username` and no role.
    pub fn private_to(username: &str) -> Self {
        Self {
            admins: SecurityMembers::default(),
            members: SecurityMembers {
                names: vec![username.to_string()],
                roles: Vec::new(),
            },
        }
    }

    /// Whether `username` is granted member access by name.
    pub fn allows(&self, username: &str) -> bool {
        self.members.names.iter().any(|n| n == username)
            || self.admins.names.iter().any(|n| n == username)
    }
}

/// Listing query over a namespace, ordered by document id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocQuery {
    /// Only ids starting with this prefix.
    pub prefix: String,
    /// Only ids strictly greater than this one.
    pub start_after: Option<String>,
    /// Maximum number of documents returned.
    pub limit: usize,
}

impl DocQuery {
    /// First `limit` documents whose id starts with `prefix`.
    pub fn prefix(prefix: impl Into<String>, limit: usize) -> Self {
        Self {
            prefix: prefix.into(),
            start_after: None,
            limit,
        }
    }

    /// Resume after `id`; `None` starts from the beginning.
    pub fn after(mut self, id: Option<String>) -> Self {
        self.start_after = id;
        self
    }
}

/// Client interface to the replicated document database.
///
/// Object-safe: every method returns a boxed future so drivers can hold an
/// `Arc<dyn DocumentStore>`.
pub trait DocumentStore: Send + Sync {
    /// Check that the store is reachable.
    fn ping(&self) -> BoxFuture<'_, StoreResult<()>>;

    /// Check a username/password pair.
    fn authenticate<'a>(&'a self, username: &'a str, password: &'a str)
    -> BoxFuture<'a, StoreResult<bool>>;

    /// Create a namespace. Fails with [`StoreError::NamespaceExists`] if present.
    fn create_namespace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, StoreResult<()>>;

    /// Delete a namespace and everything in it.
    fn delete_namespace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, StoreResult<()>>;

    /// Whether the namespace exists.
    fn namespace_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, StoreResult<bool>>;

    /// Names of all namespaces starting with `prefix`, sorted.
    fn list_namespaces<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, StoreResult<Vec<String>>>;

    /// Fetch a document; `Ok(None)` if the namespace exists but the document does not.
    fn get_doc<'a>(&'a self, namespace: &'a str, id: &'a str)
    -> BoxFuture<'a, StoreResult<Option<Document>>>;

    /// Create or update a document.
    ///
    /// `expected_rev` must be `None` when creating and the current revision when
    /// updating; anything else is a [`StoreError::Conflict`].
    fn put_doc<'a>(
        &'a self,
        namespace: &'a str,
        id: &'a str,
        body: &'a serde_json::Value,
        expected_rev: Option<&'a str>,
    ) -> BoxFuture<'a, StoreResult<Document>>;

    /// Delete a document at its current revision.
    fn delete_doc<'a>(
        &'a self,
        namespace: &'a str,
        id: &'a str,
        expected_rev: &'a str,
    ) -> BoxFuture<'a, StoreResult<()>>;

    /// List documents in id order.
    fn list_docs<'a>(&'a self, namespace: &'a str, query: &'a DocQuery)
    -> BoxFuture<'a, StoreResult<Vec<Document>>>;

    /// Security document of a namespace, `None` if it never got one.
    fn get_security<'a>(&'a self, namespace: &'a str)
    -> BoxFuture<'a, StoreResult<Option<SecurityDocument>>>;

    /// Replace the security document of a namespace.
    fn put_security<'a>(
        &'a self,
        namespace: &'a str,
        security: &'a SecurityDocument,
    ) -> BoxFuture<'a, StoreResult<()>>;
}

/// An entry of the account-event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountEvent {
    /// Position in the log, strictly increasing from 1.
    pub seq: u64,
    /// Id of the account document, `org.couchdb.user:<username>`.
    pub account_id: String,
    /// Whether the account was deleted.
    #[serde(default)]
    pub deleted: bool,
}

/// A never-ending stream of account events.
pub type AccountEventStream = Pin<Box<dyn Stream<Item = StoreResult<AccountEvent>> + Send>>;

/// Append-only, replayable account-event log.
pub trait AccountEventLog: Send + Sync {
    /// Stream every event with `seq > origin`, then keep following new ones.
    fn subscribe(&self, origin: u64) -> BoxFuture<'_, StoreResult<AccountEventStream>>;
}

/// Opens store clients for the live backend.
pub trait StoreConnector: Send + Sync {
    /// Open a client for `connection`, failing if the store is unreachable.
    fn connect<'a>(
        &'a self,
        connection: &'a ConnectionConfig,
    ) -> BoxFuture<'a, StoreResult<Arc<dyn DocumentStore>>>;
}

/// Connector handing out an already-open store, whatever the endpoint.
#[derive(Clone)]
pub struct StaticConnector {
    store: Arc<dyn DocumentStore>,
}

impl StaticConnector {
    /// Always hand out `store`.
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

impl StoreConnector for StaticConnector {
    fn connect<'a>(
        &'a self,
        _connection: &'a ConnectionConfig,
    ) -> BoxFuture<'a, StoreResult<Arc<dyn DocumentStore>>> {
        Box::pin(async move {
            self.store.ping().await?;
            Ok(self.store.clone())
        })
    }
}
