//! Replaying the account-event log is safe: restarts and duplicate events
//! converge on one private namespace per account.

use std::sync::Arc;

use studyhall_core::config::ProvisioningConfig;
use studyhall_core::model::user_namespace;
use studyhall_core::provisioning::{ControllerHealth, ProvisioningController, ProvisioningStats};
use studyhall_core::store::{AccountEventLog, DocumentStore, MemoryStore, SecurityDocument};
use tokio_util::sync::CancellationToken;

/// Run a fresh controller until its health reports `processed` accounts up
/// to `last_seq`, then cancel it.
async fn run_until(
    store: Arc<dyn DocumentStore>,
    log: Arc<dyn AccountEventLog>,
    config: ProvisioningConfig,
    processed: u64,
    last_seq: u64,
) -> ProvisioningStats {
    let controller = Arc::new(ProvisioningController::new(store, log, config).unwrap());
    let mut health = controller.health();
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let controller = controller.clone();
        let cancel = cancel.clone();
        async move { controller.run(&cancel).await }
    });

    health
        .wait_for(|h| match h {
            ControllerHealth::Running {
                processed: p,
                last_seq: s,
                ..
            } => *p == processed && *s == last_seq,
            _ => false,
        })
        .await
        .unwrap();
    cancel.cancel();
    task.await.unwrap().unwrap()
}

async fn assert_private(store: &dyn DocumentStore, username: &str) {
    assert_eq!(
        store.get_security(&user_namespace(username)).await.unwrap(),
        Some(SecurityDocument::private_to(username))
    );
}

#[tokio::test]
async fn restart_with_duplicate_events_keeps_one_namespace_per_account() {
    let store = MemoryStore::new();
    store.create_account("alice", "pw").unwrap();
    store.create_account("bob", "pw").unwrap();

    let first = run_until(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        ProvisioningConfig::default(),
        2,
        2,
    )
    .await;
    assert_eq!(first.failed, 0);

    // The same account reported again, plus a deletion that must not undo anything
    store.append_account_event("org.couchdb.user:alice", false);
    store.append_account_event("org.couchdb.user:alice", false);
    store.delete_account("bob").unwrap();

    let second = run_until(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        ProvisioningConfig::default(),
        4,
        5,
    )
    .await;
    assert_eq!(second.failed, 0);

    assert_eq!(
        store.list_namespaces("userdb-").await.unwrap(),
        {
            let mut expected = vec![user_namespace("alice"), user_namespace("bob")];
            expected.sort();
            expected
        }
    );
    assert_private(&store, "alice").await;
    assert_private(&store, "bob").await;
}

#[tokio::test]
async fn concurrent_duplicates_for_one_account_converge() {
    let store = MemoryStore::new();
    store.create_account("carol", "pw").unwrap();
    for _ in 0..7 {
        store.append_account_event("org.couchdb.user:carol", false);
    }

    let stats = run_until(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        ProvisioningConfig {
            max_concurrency: 8,
            ..Default::default()
        },
        8,
        8,
    )
    .await;

    assert_eq!(stats.failed, 0);
    assert_eq!(
        store.list_namespaces("userdb-").await.unwrap(),
        vec![user_namespace("carol")]
    );
    assert_private(&store, "carol").await;
}

#[tokio::test]
async fn tampered_security_is_restored_on_replay() {
    let store = MemoryStore::new();
    store.create_account("dave", "pw").unwrap();
    run_until(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        ProvisioningConfig::default(),
        1,
        1,
    )
    .await;

    let ns = user_namespace("dave");
    store
        .put_security(&ns, &SecurityDocument::private_to("mallory"))
        .await
        .unwrap();

    run_until(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        ProvisioningConfig::default(),
        1,
        1,
    )
    .await;
    assert_private(&store, "dave").await;
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use studyhall_core::store::SqliteStore;

    #[tokio::test]
    async fn replay_survives_reopening_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("studyhall.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.create_account("alice", "pw").unwrap();
            run_until(
                Arc::new(store.clone()),
                Arc::new(store.clone()),
                ProvisioningConfig::default(),
                1,
                1,
            )
            .await;
        }

        let store = SqliteStore::open(&path).unwrap();
        store.create_account("bob", "pw").unwrap();
        let stats = run_until(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            ProvisioningConfig::default(),
            2,
            2,
        )
        .await;

        assert_eq!(stats.failed, 0);
        let mut expected = vec![user_namespace("alice"), user_namespace("bob")];
        expected.sort();
        assert_eq!(store.list_namespaces("userdb-").await.unwrap(), expected);
        assert_private(&store, "alice").await;
        assert_private(&store, "bob").await;
    }
}
