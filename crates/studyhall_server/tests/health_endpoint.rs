use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use studyhall_core::ControllerHealth;
use studyhall_core::ProvisioningController;
use studyhall_core::model::user_namespace;
use studyhall_core::store::{DocumentStore, SqliteStore};
use studyhall_server::config::Config;
use studyhall_server::handlers::{StatusState, status::health};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn health_reports_accounts_provisioned_from_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("studyhall.db");
    let config = Config::from_lookup(|key| match key {
        "DATABASE_PATH" => Some(db.to_string_lossy().into_owned()),
        "PROVISIONING_CONCURRENCY" => Some("2".to_string()),
        _ => None,
    })
    .unwrap();

    let store = SqliteStore::open(&config.database_path).unwrap();
    store.create_account("alice", "pw").unwrap();
    store.create_account("bob", "pw").unwrap();

    let controller = Arc::new(
        ProvisioningController::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            config.provisioning(),
        )
        .unwrap(),
    );
    let state = StatusState {
        health: controller.health(),
    };
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let controller = controller.clone();
        let cancel = cancel.clone();
        async move { controller.run(&cancel).await }
    });

    let mut watcher = controller.health();
    watcher
        .wait_for(|h| matches!(h, ControllerHealth::Running { processed: 2, .. }))
        .await
        .unwrap();

    let response = health(State(state.clone())).await.into_response();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(store.namespace_exists(&user_namespace("alice")).await.unwrap());
    assert!(store.namespace_exists(&user_namespace("bob")).await.unwrap());

    cancel.cancel();
    task.await.unwrap().unwrap();
    let response = health(State(state)).await.into_response();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}
