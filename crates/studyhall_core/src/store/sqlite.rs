//! SQLite-backed document store.
//!
//! This module provides a persistent [`DocumentStore`] and [`AccountEventLog`]
//! using a single SQLite database: namespaces, documents, security documents,
//! accounts and the account-event log each get a table.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Notify;

use crate::model::account_id;

use super::{
    AccountEvent, AccountEventLog, AccountEventStream, BoxFuture, DocQuery, Document,
    DocumentStore, SecurityDocument, StoreError, StoreResult, next_revision,
};

/// How often a caught-up subscription re-checks the log for rows written by
/// other processes.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Events fetched per query while replaying the log.
const REPLAY_BATCH: i64 = 256;

/// SQLite-backed document store.
///
/// # Thread Safety
///
/// The connection is wrapped in a `Mutex` for thread-safe access.
/// SQLite itself is used in serialized threading mode.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<SqliteInner>,
}

struct SqliteInner {
    conn: Mutex<Connection>,
    appended: Notify,
    poll_interval: Duration,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or if schema
    /// initialization fails.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Create an in-memory SQLite database for testing.
    ///
    /// Data is lost when the storage is dropped.
    pub fn in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        let store = Self {
            inner: Arc::new(SqliteInner {
                conn: Mutex::new(conn),
                appended: Notify::new(),
                poll_interval: DEFAULT_POLL_INTERVAL,
            }),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS namespaces (
                name TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS documents (
                namespace TEXT NOT NULL REFERENCES namespaces(name) ON DELETE CASCADE,
                id TEXT NOT NULL,
                rev TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, id)
            );

            CREATE TABLE IF NOT EXISTS security (
                namespace TEXT PRIMARY KEY REFERENCES namespaces(name) ON DELETE CASCADE,
                body TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS accounts (
                username TEXT PRIMARY KEY,
                -- PHC-encoded argon2id hash, salt included
                password_hash TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            -- Append-only; seq is the replay position
            CREATE TABLE IF NOT EXISTS account_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(())
    }

    /// Register an account and append its creation event to the log.
    pub fn create_account(&self, username: &str, password: &str) -> StoreResult<AccountEvent> {
        if username.is_empty() || username.contains(':') {
            return Err(StoreError::Invalid(format!("invalid username '{}'", username)));
        }
        let password_hash = hash_password(password)?;
        let now = chrono::Utc::now().timestamp_millis();
        let account_id = account_id(username);
        let event = {
            let mut conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
            let tx = conn.transaction()?;
            let exists: Option<String> = tx
                .query_row(
                    "SELECT username FROM accounts WHERE username = ?",
                    [username],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(StoreError::AccountExists(username.to_string()));
            }
            tx.execute(
                "INSERT INTO accounts (username, password_hash, created_at) VALUES (?, ?, ?)",
                params![username, password_hash, now],
            )?;
            let event = append_event(&tx, &account_id, false, now)?;
            tx.commit()?;
            event
        };
        self.inner.appended.notify_waiters();
        Ok(event)
    }

    /// Remove an account and append its deletion event.
    pub fn delete_account(&self, username: &str) -> StoreResult<AccountEvent> {
        let now = chrono::Utc::now().timestamp_millis();
        let event = {
            let mut conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM accounts WHERE username = ?", [username])?;
            let event = append_event(&tx, &account_id(username), true, now)?;
            tx.commit()?;
            event
        };
        self.inner.appended.notify_waiters();
        Ok(event)
    }

    fn read_events_after(&self, seq: u64) -> StoreResult<Vec<AccountEvent>> {
        let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT seq, account_id, deleted FROM account_events WHERE seq > ? ORDER BY seq ASC LIMIT ?",
        )?;
        let events = stmt
            .query_map(params![seq as i64, REPLAY_BATCH], |row| {
                Ok(AccountEvent {
                    seq: row.get::<_, i64>(0)? as u64,
                    account_id: row.get(1)?,
                    deleted: row.get::<_, i64>(2)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn namespace_present(conn: &Connection, name: &str) -> StoreResult<bool> {
        Ok(conn
            .query_row("SELECT 1 FROM namespaces WHERE name = ?", [name], |_| Ok(()))
            .optional()?
            .is_some())
    }

    fn require_namespace(conn: &Connection, name: &str) -> StoreResult<()> {
        if Self::namespace_present(conn, name)? {
            Ok(())
        } else {
            Err(StoreError::NamespaceNotFound(name.to_string()))
        }
    }
}

fn hash_password(password: &str) -> StoreResult<String> {
    let config = argon2::Config {
        lanes: 1,
        mem_cost: 19_456,
        time_cost: 2,
        variant: argon2::Variant::Argon2id,
        version: argon2::Version::Version13,
        ..Default::default()
    };
    let salt = uuid::Uuid::new_v4();
    argon2::hash_encoded(password.as_bytes(), salt.as_bytes(), &config)
        .map_err(|e| StoreError::Invalid(format!("cannot hash password: {}", e)))
}

fn verify_password(encoded: &str, password: &str) -> bool {
    match argon2::verify_encoded(encoded, password.as_bytes()) {
        Ok(matches) => matches,
        Err(e) => {
            log::warn!("Unreadable password hash: {}", e);
            false
        }
    }
}

fn append_event(
    conn: &Connection,
    account_id: &str,
    deleted: bool,
    now: i64,
) -> StoreResult<AccountEvent> {
    conn.execute(
        "INSERT INTO account_events (account_id, deleted, created_at) VALUES (?, ?, ?)",
        params![account_id, deleted as i64, now],
    )?;
    Ok(AccountEvent {
        seq: conn.last_insert_rowid() as u64,
        account_id: account_id.to_string(),
        deleted,
    })
}

fn row_to_document(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_document(raw: (String, String, String, i64)) -> StoreResult<Document> {
    let (id, rev, body, updated_at) = raw;
    Ok(Document {
        id,
        rev,
        updated_at,
        body: serde_json::from_str(&body)?,
    })
}

impl DocumentStore for SqliteStore {
    fn ping(&self) -> BoxFuture<'_, StoreResult<()>> {
        Box::pin(async move {
            let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }

    fn authenticate<'a>(
        &'a self,
        username: &'a str,
        password: &'a str,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move {
            let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
            let stored: Option<String> = conn
                .query_row(
                    "SELECT password_hash FROM accounts WHERE username = ?",
                    [username],
                    |row| row.get(0),
                )
                .optional()?;
            drop(conn);
            Ok(stored.is_some_and(|encoded| verify_password(&encoded, password)))
        })
    }

    fn create_namespace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO namespaces (name, created_at) VALUES (?, ?)",
                params![name, chrono::Utc::now().timestamp_millis()],
            )?;
            if inserted == 0 {
                return Err(StoreError::NamespaceExists(name.to_string()));
            }
            Ok(())
        })
    }

    fn delete_namespace<'a>(&'a self, name: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let mut conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM documents WHERE namespace = ?", [name])?;
            tx.execute("DELETE FROM security WHERE namespace = ?", [name])?;
            let removed = tx.execute("DELETE FROM namespaces WHERE name = ?", [name])?;
            tx.commit()?;
            if removed == 0 {
                return Err(StoreError::NamespaceNotFound(name.to_string()));
            }
            Ok(())
        })
    }

    fn namespace_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move {
            let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
            Self::namespace_present(&conn, name)
        })
    }

    fn list_namespaces<'a>(&'a self, prefix: &'a str) -> BoxFuture<'a, StoreResult<Vec<String>>> {
        Box::pin(async move {
            let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
            // length() and substr() both count characters, so unicode prefixes line up
            let mut stmt = conn.prepare(
                "SELECT name FROM namespaces WHERE substr(name, 1, length(?1)) = ?1 ORDER BY name",
            )?;
            let names = stmt
                .query_map(params![prefix], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
    }

    fn get_doc<'a>(
        &'a self,
        namespace: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<Document>>> {
        Box::pin(async move {
            let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
            Self::require_namespace(&conn, namespace)?;
            let raw = conn
                .query_row(
                    "SELECT id, rev, body, updated_at FROM documents WHERE namespace = ? AND id = ?",
                    params![namespace, id],
                    row_to_document,
                )
                .optional()?;
            raw.map(decode_document).transpose()
        })
    }

    fn put_doc<'a>(
        &'a self,
        namespace: &'a str,
        id: &'a str,
        body: &'a serde_json::Value,
        expected_rev: Option<&'a str>,
    ) -> BoxFuture<'a, StoreResult<Document>> {
        Box::pin(async move {
            let mut conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
            let tx = conn.transaction()?;
            Self::require_namespace(&tx, namespace)?;
            let current: Option<String> = tx
                .query_row(
                    "SELECT rev FROM documents WHERE namespace = ? AND id = ?",
                    params![namespace, id],
                    |row| row.get(0),
                )
                .optional()?;
            if current.as_deref() != expected_rev {
                return Err(StoreError::Conflict {
                    namespace: namespace.to_string(),
                    id: id.to_string(),
                });
            }
            let doc = Document {
                id: id.to_string(),
                rev: next_revision(current.as_deref(), body),
                updated_at: chrono::Utc::now().timestamp_millis(),
                body: body.clone(),
            };
            tx.execute(
                "INSERT OR REPLACE INTO documents (namespace, id, rev, body, updated_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![namespace, id, doc.rev, body.to_string(), doc.updated_at],
            )?;
            tx.commit()?;
            Ok(doc)
        })
    }

    fn delete_doc<'a>(
        &'a self,
        namespace: &'a str,
        id: &'a str,
        expected_rev: &'a str,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
            Self::require_namespace(&conn, namespace)?;
            let current: Option<String> = conn
                .query_row(
                    "SELECT rev FROM documents WHERE namespace = ? AND id = ?",
                    params![namespace, id],
                    |row| row.get(0),
                )
                .optional()?;
            match current {
                None => Err(StoreError::DocumentNotFound {
                    namespace: namespace.to_string(),
                    id: id.to_string(),
                }),
                Some(rev) if rev != expected_rev => Err(StoreError::Conflict {
                    namespace: namespace.to_string(),
                    id: id.to_string(),
                }),
                Some(_) => {
                    conn.execute(
                        "DELETE FROM documents WHERE namespace = ? AND id = ?",
                        params![namespace, id],
                    )?;
                    Ok(())
                }
            }
        })
    }

    fn list_docs<'a>(
        &'a self,
        namespace: &'a str,
        query: &'a DocQuery,
    ) -> BoxFuture<'a, StoreResult<Vec<Document>>> {
        Box::pin(async move {
            let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
            Self::require_namespace(&conn, namespace)?;
            let mut stmt = conn.prepare(
                "SELECT id, rev, body, updated_at FROM documents
                 WHERE namespace = ?1 AND substr(id, 1, length(?2)) = ?2 AND id > ?3
                 ORDER BY id ASC LIMIT ?4",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        namespace,
                        query.prefix,
                        query.start_after.as_deref().unwrap_or(""),
                        query.limit as i64
                    ],
                    row_to_document,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(decode_document).collect()
        })
    }

    fn get_security<'a>(
        &'a self,
        namespace: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<SecurityDocument>>> {
        Box::pin(async move {
            let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
            Self::require_namespace(&conn, namespace)?;
            let body: Option<String> = conn
                .query_row(
                    "SELECT body FROM security WHERE namespace = ?",
                    [namespace],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
        })
    }

    fn put_security<'a>(
        &'a self,
        namespace: &'a str,
        security: &'a SecurityDocument,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let body = serde_json::to_string(security)?;
            let conn = self.inner.conn.lock().unwrap_or_else(|e| e.into_inner());
            Self::require_namespace(&conn, namespace)?;
            conn.execute(
                "INSERT OR REPLACE INTO security (namespace, body) VALUES (?, ?)",
                params![namespace, body],
            )?;
            Ok(())
        })
    }
}

impl AccountEventLog for SqliteStore {
    fn subscribe(&self, origin: u64) -> BoxFuture<'_, StoreResult<AccountEventStream>> {
        Box::pin(async move {
            // Surface an unreadable log at subscription time
            self.read_events_after(origin)?;

            let store = self.clone();
            let stream = futures::stream::unfold(
                (store, origin, std::collections::VecDeque::<AccountEvent>::new()),
                |(store, last, mut buffered)| async move {
                    loop {
                        if let Some(event) = buffered.pop_front() {
                            let seq = event.seq;
                            return Some((Ok(event), (store, seq, buffered)));
                        }
                        let appended = store.inner.appended.notified();
                        match store.read_events_after(last) {
                            Ok(events) if !events.is_empty() => {
                                buffered.extend(events);
                            }
                            Ok(_) => {
                                // Rows may also come from other processes, so poll as well
                                let _ = tokio::time::timeout(store.inner.poll_interval, appended).await;
                            }
                            Err(e) => {
                                drop(appended);
                                return Some((Err(e), (store, last, buffered)));
                            }
                        }
                    }
                },
            );
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
    async fn test_documents_round_trip_with_revisions() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_namespace("coursedb-c1").await.unwrap();

        let doc = store
            .put_doc("coursedb-c1", "c-1", &json!({"shape": "math"}), None)
            .await
            .unwrap();
        let fetched = store.get_doc("coursedb-c1", "c-1").await.unwrap().unwrap();
        assert_eq!(fetched.rev, doc.rev);
        assert_eq!(fetched.body["shape"], "math");

        let conflict = store
            .put_doc("coursedb-c1", "c-1", &json!({}), Some("1-stale"))
            .await;
        assert!(matches!(conflict, Err(StoreError::Conflict { .. })));

        store.delete_doc("coursedb-c1", "c-1", &doc.rev).await.unwrap();
        assert!(store.get_doc("coursedb-c1", "c-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prefix_listing_handles_unicode_ids() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_namespace("userdb-c3a9").await.unwrap();
        store.create_namespace("coursedb-café").await.unwrap();
        store.create_namespace("coursedb-cafe").await.unwrap();
        for id in ["cardH-café-x", "cardH-café-y", "cardH-cafe-x", "sr-café-x"] {
            store.put_doc("userdb-c3a9", id, &json!({}), None).await.unwrap();
        }

        let page = |prefix: &str| DocQuery::prefix(prefix, 10);
        let ids = |docs: Vec<Document>| docs.into_iter().map(|d| d.id).collect::<Vec<_>>();
        assert_eq!(
            ids(store.list_docs("userdb-c3a9", &page("cardH-café-")).await.unwrap()),
            vec!["cardH-café-x", "cardH-café-y"]
        );
        assert_eq!(
            ids(store.list_docs("userdb-c3a9", &page("cardH-cafe-")).await.unwrap()),
            vec!["cardH-cafe-x"]
        );
        assert_eq!(
            ids(store
                .list_docs("userdb-c3a9", &page("cardH-café-").after(Some("cardH-café-x".into())))
                .await
                .unwrap()),
            vec!["cardH-café-y"]
        );
        assert_eq!(
            store.list_namespaces("coursedb-caf").await.unwrap(),
            vec!["coursedb-cafe", "coursedb-café"]
        );
        assert_eq!(
            store.list_namespaces("coursedb-café").await.unwrap(),
            vec!["coursedb-café"]
        );
    }

    #[tokio::test]
    async fn test_missing_namespace_is_reported() {
        let store = SqliteStore::in_memory().unwrap();
        let result = store.get_doc("userdb-00", "x").await;
        assert!(matches!(result, Err(StoreError::NamespaceNotFound(_))));
    }

    #[tokio::test]
    async fn test_namespace_creation_is_exclusive() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_namespace("userdb-616c696365").await.unwrap();
        let again = store.create_namespace("userdb-616c696365").await;
        assert!(matches!(again, Err(StoreError::NamespaceExists(_))));
        assert_eq!(
            store.list_namespaces("userdb-").await.unwrap(),
            vec!["userdb-616c696365".to_string()]
        );
    }

    #[tokio::test]
    async fn test_accounts_authenticate_and_log_events() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_account("alice", "secret").unwrap();
        assert!(store.authenticate("alice", "secret").await.unwrap());
        assert!(!store.authenticate("alice", "wrong").await.unwrap());
        assert!(!store.authenticate("nobody", "secret").await.unwrap());

        store.delete_account("alice").unwrap();
        let mut stream = store.subscribe(0).await.unwrap();
        let created = stream.next().await.unwrap().unwrap();
        let deleted = stream.next().await.unwrap().unwrap();
        assert!(!created.deleted);
        assert!(deleted.deleted);
        assert_eq!(deleted.seq, created.seq + 1);
    }

    #[tokio::test]
    async fn test_passwords_are_stored_as_salted_argon2() {
        let store = SqliteStore::in_memory().unwrap();
        store.create_account("alice", "secret").unwrap();
        store.create_account("bob", "secret").unwrap();

        let hashes: Vec<String> = {
            let conn = store.inner.conn.lock().unwrap();
            let mut stmt = conn
                .prepare("SELECT password_hash FROM accounts ORDER BY username")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap()
        };
        assert_eq!(hashes.len(), 2);
        assert!(hashes.iter().all(|h| h.starts_with("$argon2id$") && !h.contains("secret")));
        assert_ne!(hashes[0], hashes[1]);
        assert!(store.authenticate("bob", "secret").await.unwrap());
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_namespace("ns").await.unwrap();
            store
                .put_security("ns", &SecurityDocument::private_to("alice"))
                .await
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        let security = store.get_security("ns").await.unwrap().unwrap();
        assert!(security.allows("alice"));
    }
}
