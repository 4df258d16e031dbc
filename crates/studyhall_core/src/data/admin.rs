//! Platform administration handle.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::cancel::CancelScope;
use super::live::LiveDriver;
use crate::error::Result;
use crate::model::{
    CLASSROOM_NAMESPACE_PREFIX, COURSE_NAMESPACE_PREFIX, USER_NAMESPACE_PREFIX, course_namespace,
    username_from_namespace,
};

/// Platform-wide listings and course removal. Only handed to the platform
/// administrator.
#[derive(Clone)]
pub struct AdminHandle {
    driver: Arc<LiveDriver>,
    scope: CancelScope,
}

impl AdminHandle {
    pub(crate) fn new(driver: Arc<LiveDriver>, scope: CancelScope) -> Self {
        Self { driver, scope }
    }

    /// Bind this handle to a caller-owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.scope = self.scope.with_caller(token);
        self
    }

    async fn namespaces(&self, prefix: &str) -> Result<Vec<String>> {
        self.scope
            .race(async { Ok(self.driver.store().list_namespaces(prefix).await?) })
            .await
    }

    /// Usernames with a provisioned private namespace, sorted by namespace.
    pub async fn list_users(&self) -> Result<Vec<String>> {
        Ok(self
            .namespaces(USER_NAMESPACE_PREFIX)
            .await?
            .iter()
            .filter_map(|ns| username_from_namespace(ns))
            .collect())
    }

    /// Ids of every course, sorted.
    pub async fn list_courses(&self) -> Result<Vec<String>> {
        Ok(strip_all(self.namespaces(COURSE_NAMESPACE_PREFIX).await?, COURSE_NAMESPACE_PREFIX))
    }

    /// Ids of every classroom, sorted.
    pub async fn list_classrooms(&self) -> Result<Vec<String>> {
        Ok(strip_all(
            self.namespaces(CLASSROOM_NAMESPACE_PREFIX).await?,
            CLASSROOM_NAMESPACE_PREFIX,
        ))
    }

    /// Delete a course and all of its documents.
    pub async fn remove_course(&self, course_id: &str) -> Result<()> {
        self.scope.check()?;
        self.driver
            .store()
            .delete_namespace(&course_namespace(course_id))
            .await?;
        log::info!("Removed course {}", course_id);
        Ok(())
    }
}

fn strip_all(namespaces: Vec<String>, prefix: &str) -> Vec<String> {
    namespaces
        .into_iter()
        .filter_map(|ns| ns.strip_prefix(prefix).map(str::to_string))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProvisioningConfig;
    use crate::error::StudyError;
    use crate::model::{ClassroomConfig, CourseConfig, user_namespace};
    use crate::provisioning::ProvisioningController;
    use crate::store::{DocumentStore, MemoryStore};
    use crate::test_utils::live_provider;

    async fn admin_over(store: &MemoryStore) -> Arc<crate::data::DataLayerProvider> {
        store.create_account("admin", "root").unwrap();
        live_provider(Arc::new(store.clone()), "admin", "root").await
    }

    #[tokio::test]
    async fn test_list_users_sees_provisioned_accounts() {
        let store = MemoryStore::new();
        let provider = admin_over(&store).await;
        let controller = ProvisioningController::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            ProvisioningConfig::default(),
        )
        .unwrap();
        for name in ["bob", "alice", "zoë"] {
            store.create_account(name, "pw").unwrap();
            controller.provision_account(name).await.unwrap();
        }
        // Not a hex-encoded name
        store.create_namespace("userdb-zz").await.unwrap();

        let admin = provider.get_admin().unwrap();
        assert_eq!(admin.list_users().await.unwrap(), vec!["alice", "bob", "zoë"]);
        assert!(store.namespace_exists(&user_namespace("zoë")).await.unwrap());
    }

    #[tokio::test]
    async fn test_courses_and_classrooms_are_listed_and_removed() {
        let store = MemoryStore::new();
        let provider = admin_over(&store).await;
        provider
            .create_course(CourseConfig::new("c2", "Geometry", "admin"))
            .await
            .unwrap();
        provider
            .create_course(CourseConfig::new("c1", "Algebra", "admin"))
            .await
            .unwrap();
        provider
            .create_classroom(ClassroomConfig::new("r1", "Period 1", "admin"))
            .await
            .unwrap();

        let admin = provider.get_admin().unwrap();
        assert_eq!(admin.list_courses().await.unwrap(), vec!["c1", "c2"]);
        assert_eq!(admin.list_classrooms().await.unwrap(), vec!["r1"]);

        admin.remove_course("c1").await.unwrap();
        assert_eq!(admin.list_courses().await.unwrap(), vec!["c2"]);
        assert!(matches!(provider.get_course("c1").unwrap().get_config().await, Err(StudyError::NotFound(_))));
        assert!(matches!(admin.remove_course("c1").await, Err(StudyError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancelled_admin_calls_touch_nothing() {
        let store = MemoryStore::new();
        let provider = admin_over(&store).await;
        provider
            .create_course(CourseConfig::new("c1", "Algebra", "admin"))
            .await
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let admin = provider.get_admin().unwrap().with_cancellation(token);
        assert!(matches!(admin.remove_course("c1").await, Err(StudyError::Cancelled)));
        assert!(matches!(admin.list_users().await, Err(StudyError::Cancelled)));

        provider.teardown();
        let fresh = provider.get_admin();
        assert!(fresh.is_err());
        assert!(store.namespace_exists(&course_namespace("c1")).await.unwrap());
    }
}
