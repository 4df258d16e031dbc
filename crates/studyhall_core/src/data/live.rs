//! Live backend driver.
//!
//! Wraps a [`DocumentStore`] client with typed record access. Record bodies are
//! stored without their `updatedAt` field; reads fill it in from the document's
//! write time so the value always reflects the backend's own metadata.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::Session;
use crate::error::{Result, StudyError};
use crate::store::{DocQuery, Document, DocumentStore, StoreError};

/// Read-modify-write attempts before a revision conflict is surfaced.
const MAX_CONFLICT_RETRIES: usize = 3;

/// Page size used when a listing has to be read to the end.
pub(crate) const SCAN_PAGE_SIZE: usize = 100;

const UPDATED_AT_FIELD: &str = "updatedAt";

pub(crate) struct LiveDriver {
    store: Arc<dyn DocumentStore>,
    admin_username: String,
    session: Session,
}

/// A decoded record together with the revision it was read at.
pub(crate) struct Versioned<T> {
    pub value: T,
    pub rev: String,
}

impl LiveDriver {
    pub(crate) fn new(store: Arc<dyn DocumentStore>, admin_username: String, session: Session) -> Self {
        Self {
            store,
            admin_username,
            session,
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub(crate) fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn admin_username(&self) -> &str {
        &self.admin_username
    }

    /// Whether the current session is the platform administrator.
    pub(crate) fn session_is_admin(&self) -> bool {
        self.session
            .username()
            .is_some_and(|name| name == self.admin_username)
    }

    /// Username of the current session, or `PermissionDenied` when logged out.
    pub(crate) fn require_session(&self, operation: &str) -> Result<String> {
        self.session.username().ok_or_else(|| {
            StudyError::PermissionDenied(format!("{} requires a logged-in user", operation))
        })
    }

    pub(crate) async fn get<T: DeserializeOwned>(&self, namespace: &str, id: &str) -> Result<Option<Versioned<T>>> {
        match self.store.get_doc(namespace, id).await? {
            Some(doc) => Ok(Some(Versioned {
                value: decode(&doc)?,
                rev: doc.rev,
            })),
            None => Ok(None),
        }
    }

    /// Fetch a record that must exist.
    pub(crate) async fn fetch<T: DeserializeOwned>(&self, namespace: &str, id: &str) -> Result<Versioned<T>> {
        self.get(namespace, id)
            .await?
            .ok_or_else(|| StudyError::NotFound(format!("'{}' in '{}'", id, namespace)))
    }

    pub(crate) async fn put<T: Serialize + DeserializeOwned>(
        &self,
        namespace: &str,
        id: &str,
        value: &T,
        expected_rev: Option<&str>,
    ) -> Result<T> {
        let body = encode(value)?;
        let doc = self.store.put_doc(namespace, id, &body, expected_rev).await?;
        decode(&doc)
    }

    pub(crate) async fn delete(&self, namespace: &str, id: &str, rev: &str) -> Result<()> {
        Ok(self.store.delete_doc(namespace, id, rev).await?)
    }

    /// Read-modify-write a record, retrying on revision conflicts.
    ///
    /// `apply` receives the current value (`None` if absent) and returns the
    /// value to write, or `None` to leave the document untouched.
    pub(crate) async fn modify<T, F>(&self, namespace: &str, id: &str, mut apply: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Option<T>) -> Result<Option<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.get::<T>(namespace, id).await?;
            let rev = current.as_ref().map(|v| v.rev.clone());
            let Some(next) = apply(current.map(|v| v.value))? else {
                return Ok(None);
            };
            match self.store.put_doc(namespace, id, &encode(&next)?, rev.as_deref()).await {
                Ok(doc) => return decode(&doc).map(Some),
                Err(StoreError::Conflict { .. }) if attempt < MAX_CONFLICT_RETRIES => {
                    log::debug!("Revision conflict on {}/{}, retrying", namespace, id);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// One page of records whose id starts with `prefix`.
    pub(crate) async fn list_page<T: DeserializeOwned>(
        &self,
        namespace: &str,
        prefix: &str,
        start_after: Option<String>,
        limit: usize,
    ) -> Result<Vec<(String, T)>> {
        let query = DocQuery::prefix(prefix, limit).after(start_after);
        self.store
            .list_docs(namespace, &query)
            .await?
            .iter()
            .map(|doc| Ok((doc.id.clone(), decode(doc)?)))
            .collect()
    }

    /// Every record whose id starts with `prefix`, read page by page.
    pub(crate) async fn list_all<T: DeserializeOwned>(&self, namespace: &str, prefix: &str) -> Result<Vec<T>> {
        let mut records = Vec::new();
        let mut start_after = None;
        loop {
            let page = self
                .list_page::<T>(namespace, prefix, start_after.take(), SCAN_PAGE_SIZE)
                .await?;
            let exhausted = page.len() < SCAN_PAGE_SIZE;
            start_after = page.last().map(|(id, _)| id.clone());
            records.extend(page.into_iter().map(|(_, record)| record));
            if exhausted {
                return Ok(records);
            }
        }
    }

    /// Whether a namespace exists.
    pub(crate) async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        Ok(self.store.namespace_exists(namespace).await?)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    let mut body = serde_json::to_value(value)?;
    if let Some(object) = body.as_object_mut() {
        object.remove(UPDATED_AT_FIELD);
    }
    Ok(body)
}

fn decode<T: DeserializeOwned>(doc: &Document) -> Result<T> {
    let mut body = doc.body.clone();
    if let (Some(object), Some(updated_at)) = (
        body.as_object_mut(),
        DateTime::<Utc>::from_timestamp_millis(doc.updated_at),
    ) {
        object.insert(UPDATED_AT_FIELD.to_string(), serde_json::to_value(updated_at)?);
    }
    Ok(serde_json::from_value(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Tag;
    use crate::store::MemoryStore;

    fn driver() -> LiveDriver {
        LiveDriver::new(Arc::new(MemoryStore::new()), "admin".into(), Session::default())
    }

    #[tokio::test]
    async fn test_updated_at_comes_from_document_metadata() {
        let driver = driver();
        driver.store().create_namespace("coursedb-c1").await.unwrap();

        let mut tag = Tag::new("algebra", "c1", "alice");
        tag.updated_at = Some(DateTime::from_timestamp(0, 0).unwrap());
        let stored = driver.put("coursedb-c1", "TAG-algebra", &tag, None).await.unwrap();

        let raw = driver.store().get_doc("coursedb-c1", "TAG-algebra").await.unwrap().unwrap();
        assert!(raw.body.get("updatedAt").is_none());
        assert_eq!(
            stored.updated_at,
            DateTime::from_timestamp_millis(raw.updated_at)
        );
    }

    #[tokio::test]
    async fn test_modify_creates_and_skips() {
        let driver = driver();
        driver.store().create_namespace("coursedb-c1").await.unwrap();

        let created = driver
            .modify::<Tag, _>("coursedb-c1", "TAG-x", |current| {
                assert!(current.is_none());
                Ok(Some(Tag::new("x", "c1", "alice")))
            })
            .await
            .unwrap();
        assert!(created.is_some());

        let untouched = driver
            .modify::<Tag, _>("coursedb-c1", "TAG-x", |_| Ok(None))
            .await
            .unwrap();
        assert!(untouched.is_none());
    }

    #[tokio::test]
    async fn test_list_all_walks_every_page() {
        let driver = driver();
        driver.store().create_namespace("ns").await.unwrap();
        for i in 0..(SCAN_PAGE_SIZE + 5) {
            let tag = Tag::new(format!("t{:04}", i), "c1", "alice");
            driver
                .put("ns", &format!("TAG-t{:04}", i), &tag, None)
                .await
                .unwrap();
        }
        let all: Vec<Tag> = driver.list_all("ns", "TAG-").await.unwrap();
        assert_eq!(all.len(), SCAN_PAGE_SIZE + 5);
        assert_eq!(all[0].name, "t0000");
    }
}
