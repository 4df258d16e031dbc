//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use studyhall_core::config::DataLayerConfig;
use studyhall_core::data::{CourseHandle, DataLayerProvider, ExternalClients, ProviderRegistry};
use studyhall_core::model::{Card, CourseConfig, NewCard, PageRequest};
use studyhall_core::provisioning::ProvisioningController;
use studyhall_core::store::MemoryStore;

pub const PASSWORD: &str = "correct horse";

/// A live provider over `store` whose session is `username`, creating the
/// account if needed.
pub async fn live_provider(store: &MemoryStore, username: &str) -> Arc<DataLayerProvider> {
    let _ = store.create_account(username, PASSWORD);
    let config = DataLayerConfig::live("memory://studyhall").with_credentials(username, PASSWORD);
    ProviderRegistry::new()
        .initialize(config, ExternalClients::new().with_store(Arc::new(store.clone())))
        .await
        .unwrap()
}

/// A live provider without a session.
pub async fn anonymous_provider(store: &MemoryStore) -> Arc<DataLayerProvider> {
    ProviderRegistry::new()
        .initialize(
            DataLayerConfig::live("memory://studyhall"),
            ExternalClients::new().with_store(Arc::new(store.clone())),
        )
        .await
        .unwrap()
}

/// Create `username` and provision its private namespace right away.
pub async fn provisioned_user(store: &MemoryStore, username: &str) {
    let _ = store.create_account(username, PASSWORD);
    let controller = ProvisioningController::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Default::default(),
    )
    .unwrap();
    controller.provision_account(username).await.unwrap();
}

/// Course `c1` owned by the session user, with six tagged math cards.
pub async fn algebra_course(provider: &DataLayerProvider, owner: &str) -> CourseHandle {
    let course = provider
        .create_course(CourseConfig::new("c1", "Algebra", owner).with_shape("math"))
        .await
        .unwrap();
    let cards = [
        (900.0, vec!["algebra"]),
        (1000.0, vec!["algebra", "fractions"]),
        (1150.0, vec!["algebra"]),
        (1400.0, vec!["algebra", "advanced"]),
        (1700.0, vec!["geometry"]),
        (2000.0, vec!["geometry", "advanced"]),
    ];
    for (i, (elo, tags)) in cards.into_iter().enumerate() {
        let mut card = NewCard::new("math", owner)
            .field("question", format!("question {}", i))
            .field("answer", i as i64)
            .elo(elo);
        for tag in tags {
            card = card.tag(tag);
        }
        course.add_card(card).await.unwrap();
    }
    course
}

/// Every card of a course, following pagination.
pub async fn all_cards(course: &CourseHandle, page_size: usize) -> Vec<Card> {
    let mut cards = Vec::new();
    let mut page = Some(PageRequest::first(page_size));
    while let Some(request) = page {
        let result = course.list_cards(request).await.unwrap();
        cards.extend(result.items);
        page = result.next;
    }
    cards
}
