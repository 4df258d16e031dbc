//! In-memory document store.
//!
//! This provides a simple in-memory implementation of [`DocumentStore`] and
//! [`AccountEventLog`] for use in tests, development, and anonymous guest
//! sessions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Notify;

use crate::model::account_id;

use super::{
    AccountEvent, AccountEventLog, AccountEventStream, BoxFuture, DocQuery, Document,
    DocumentStore, SecurityDocument, StoreError, StoreResult, next_revision,
};

/// In-memory document store.
///
/// Thread-safe via `RwLock`; data is lost when the last clone is dropped.
/// Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    /// namespace -> (doc id -> document)
    namespaces: RwLock<HashMap<String, BTreeMap<String, Document>>>,
    security: RwLock<HashMap<String, SecurityDocument>>,
    /// username -> password
    accounts: RwLock<HashMap<String, String>>,
    /// Account log; `events[i].seq == i + 1`
    events: RwLock<Vec<AccountEvent>>,
    appended: Notify,
    unavailable: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with [`StoreError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Register an account and append its creation event to the log.
    pub fn create_account(&self, username: &str, password: &str) -> StoreResult<AccountEvent> {
        self.check_available()?;
        if username.is_empty() || username.contains(':') {
            return Err(StoreError::Invalid(format!("invalid username '{}'", username)));
        }
        {
            let mut accounts = self.inner.accounts.write().unwrap_or_else(|e| e.into_inner());
            if accounts.contains_key(username) {
                return Err(StoreError::AccountExists(username.to_string()));
            }
            accounts.insert(username.to_string(), password.to_string());
        }
        Ok(self.append_account_event(&account_id(username), false))
    }

    /// Remove an account and append its deletion event.
    pub fn delete_account(&self, username: &str) -> StoreResult<AccountEvent> {
        self.check_available()?;
        self.inner.accounts.write().unwrap_or_else(|e| e.into_inner()).remove(username);
        Ok(self.append_account_event(&account_id(username), true))
    }

    /// Append a raw event to the account log.
    pub fn append_account_event(&self, account_id: &str, deleted: bool) -> AccountEvent {
        let event = {
            let mut events = self.inner.events.write().unwrap_or_else(|e| e.into_inner());
            let event = AccountEvent {
                seq: events.len() as u64 + 1,
                account_id: account_id.to_string(),
                deleted,
            };
            events.push(event.clone());
            event
        };
        self.inner.appended.notify_waiters();
        event
    }

    /// Number of documents in a namespace (0 if absent).
    pub fn doc_count(&self, namespace: &str) -> usize {
        self.inner
            .namespaces
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(namespace)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn with_namespace<T>(
        &self,
        namespace: &str,
        f: impl FnOnce(&mut BTreeMap<String, Document>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.check_available()?;
        let mut namespaces = self.inner.namespaces.write().unwrap_or_else(|e| e.into_inner());
        let docs = namespaces
            .get_mut(namespace)
            .ok_or_else(|| StoreError::NamespaceNotFound(namespace.to_string()))?;
        f(docs)
    }
}

impl DocumentStore for MemoryStore {
    fn ping(&self) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move { self.check_available() })
    }

    fn authenticate<'a>(
        &'a self,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move {
            self.check_available()?;
            let accounts = self.inner.accounts.read().unwrap_or_else(|e| e.into_inner());
            Ok(accounts.get(username).is_some_and(|p| p == password))
        })
    }

    fn create_namespace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            let mut namespaces = self.inner.namespaces.write().unwrap_or_else(|e| e.into_inner());
            if namespaces.contains_key(name) {
                return Err(StoreError::NamespaceExists(name.to_string()));
            }
            namespaces.insert(name.to_string(), BTreeMap::new());
            Ok(())
        })
    }

    fn delete_namespace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            let removed = self.inner.namespaces.write().unwrap_or_else(|e| e.into_inner()).remove(name);
            self.inner.security.write().unwrap_or_else(|e| e.into_inner()).remove(name);
            removed
                .map(|_| ())
                .ok_or_else(|| StoreError::NamespaceNotFound(name.to_string()))
        })
    }

    fn namespace_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.inner.namespaces.read().unwrap_or_else(|e| e.into_inner()).contains_key(name))
        })
    }

    fn list_namespaces<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, StoreResult<Vec<String>>> {
        Box::pin(async move {
            self.check_available()?;
            let namespaces = self.inner.namespaces.read().unwrap_or_else(|e| e.into_inner());
            let mut names: Vec<String> = namespaces
                .keys()
                .filter(|name| name.starts_with(prefix))
                .cloned()
                .collect();
            names.sort();
            Ok(names)
        })
    }

    fn get_doc<'a>(
        &'a self,
        namespace: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<Document>>> {
        Box::pin(async move { self.with_namespace(namespace, |docs| Ok(docs.get(id).cloned())) })
    }

    fn put_doc<'a>(
        &'a self,
        namespace: &'a str,
        id: &'a str,
        body: &'a serde_json::Value,
        expected_rev: Option<&'a str>,
    ) -> BoxFuture<'a, StoreResult<Document>> {
        Box::pin(async move {
            self.with_namespace(namespace, |docs| {
                let current = docs.get(id).map(|doc| doc.rev.as_str());
                if current != expected_rev {
                    return Err(StoreError::Conflict {
                        namespace: namespace.to_string(),
                        id: id.to_string(),
                    });
                }
                let doc = Document {
                    id: id.to_string(),
                    rev: next_revision(current, body),
                    updated_at: chrono::Utc::now().timestamp_millis(),
                    body: body.clone(),
                };
                docs.insert(id.to_string(), doc.clone());
                Ok(doc)
            })
        })
    }

    fn delete_doc<'a>(
        &'a self,
        namespace: &'a str,
        id: &'a str,
        expected_rev: &'a str,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.with_namespace(namespace, |docs| match docs.get(id) {
                None => Err(StoreError::DocumentNotFound {
                    namespace: namespace.to_string(),
                    id: id.to_string(),
                }),
                Some(doc) if doc.rev != expected_rev => Err(StoreError::Conflict {
                    namespace: namespace.to_string(),
                    id: id.to_string(),
                }),
                Some(_) => {
                    docs.remove(id);
                    Ok(())
                }
            })
        })
    }

    fn list_docs<'a>(
        &'a self,
        namespace: &'a str,
        query: &'a DocQuery,
    ) -> BoxFuture<'a, StoreResult<Vec<Document>>> {
        Box::pin(async move {
            self.with_namespace(namespace, |docs| {
                Ok(docs
                    .values()
                    .filter(|doc| doc.id.starts_with(&query.prefix))
                    .filter(|doc| {
                        query
                            .start_after
                            .as_ref()
                            .is_none_or(|after| doc.id.as_str() > after.as_str())
                    })
                    .take(query.limit)
                    .cloned()
                    .collect())
            })
        })
    }

    fn get_security<'a>(
        &'a self,
        namespace: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<SecurityDocument>>> {
        Box::pin(async move {
            self.check_available()?;
            if !self.inner.namespaces.read().unwrap_or_else(|e| e.into_inner()).contains_key(namespace) {
                return Err(StoreError::NamespaceNotFound(namespace.to_string()));
            }
            Ok(self.inner.security.read().unwrap_or_else(|e| e.into_inner()).get(namespace).cloned())
        })
    }

    fn put_security<'a>(
        &'a self,
        namespace: &'a str,
        security: &'a SecurityDocument,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            if !self.inner.namespaces.read().unwrap_or_else(|e| e.into_inner()).contains_key(namespace) {
                return Err(StoreError::NamespaceNotFound(namespace.to_string()));
            }
            self.inner
                .security
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(namespace.to_string(), security.clone());
            Ok(())
        })
    }
}

impl AccountEventLog for MemoryStore {
    fn subscribe(&self, origin: u64) -> BoxFuture<'_, StoreResult<AccountEventStream>> {
        Box::pin(async move {
            self.check_available()?;
            let inner = self.inner.clone();
            let stream = futures::stream::unfold((inner, origin), |(inner, last)| async move {
                loop {
                    // Register interest before checking so an append in between is not missed
                    let appended = inner.appended.notified();
                    let next = inner.events.read().unwrap_or_else(|e| e.into_inner()).get(last as usize).cloned();
                    if let Some(event) = next {
                        drop(appended);
                        let seq = event.seq;
                        return Some((Ok(event), (inner, seq)));
                    }
                    appended.await;
                }
            });
            Ok(Box::pin(stream) as AccountEventStream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_requires_current_revision() {
        let store = MemoryStore::new();
        store.create_namespace("ns").await.unwrap();

        let first = store.put_doc("ns", "a", &json!({"v": 1}), None).await.unwrap();
        let stale = store.put_doc("ns", "a", &json!({"v": 2}), None).await;
        assert!(matches!(stale, Err(StoreError::Conflict { .. })));

        let second = store
            .put_doc("ns", "a", &json!({"v": 2}), Some(&first.rev))
            .await
            .unwrap();
        assert_ne!(first.rev, second.rev);
        assert_eq!(store.get_doc("ns", "a").await.unwrap().unwrap().body["v"], 2);
    }

    #[tokio::test]
    async fn test_create_namespace_reports_existing() {
        let store = MemoryStore::new();
        store.create_namespace("userdb-61").await.unwrap();
        let again = store.create_namespace("userdb-61").await;
        assert!(matches!(again, Err(StoreError::NamespaceExists(_))));
    }

    #[tokio::test]
    async fn test_list_docs_paginates_in_id_order() {
        let store = MemoryStore::new();
        store.create_namespace("ns").await.unwrap();
        for id in ["c-3", "c-1", "TAG-x", "c-2"] {
            store.put_doc("ns", id, &json!({}), None).await.unwrap();
        }

        let first = store.list_docs("ns", &DocQuery::prefix("c-", 2)).await.unwrap();
        let ids: Vec<_> = first.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["c-1", "c-2"]);

        let rest = store
            .list_docs("ns", &DocQuery::prefix("c-", 2).after(Some("c-2".into())))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, "c-3");
    }

    #[tokio::test]
    async fn test_subscription_replays_then_follows() {
        let store = MemoryStore::new();
        store.create_account("alice", "pw").unwrap();
        store.create_account("bob", "pw").unwrap();

        let mut stream = store.subscribe(0).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().account_id, "org.couchdb.user:alice");
        assert_eq!(stream.next().await.unwrap().unwrap().account_id, "org.couchdb.user:bob");

        let writer = store.clone();
        tokio::spawn(async move {
            writer.create_account("carol", "pw").unwrap();
        });
        let followed = stream.next().await.unwrap().unwrap();
        assert_eq!(followed.seq, 3);
        assert_eq!(followed.account_id, "org.couchdb.user:carol");
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_calls() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.ping().await, Err(StoreError::Unavailable(_))));
        assert!(store.subscribe(0).await.is_err());
    }
}
