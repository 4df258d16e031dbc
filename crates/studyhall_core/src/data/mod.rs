//! The data layer: one interface over the live and snapshot backends.
//!
//! A [`DataLayerProvider`] is created from a [`DataLayerConfig`](crate::config::DataLayerConfig)
//! through a [`ProviderRegistry`] (or the process-wide [`initialize`] /
//! [`teardown`] pair) and hands out per-course, per-user, per-classroom and
//! admin handles. The backend is fixed at initialization:
//!
//! - **Live**: a [`DocumentStore`](crate::store::DocumentStore) client; every
//!   operation is available, subject to the session's permissions.
//! - **Snapshot**: one packed course read through a
//!   [`BundleSource`](crate::bundle::BundleSource); every mutation fails with
//!   [`StudyError::ReadOnlyViolation`](crate::error::StudyError::ReadOnlyViolation)
//!   before reaching the backend.

mod admin;
mod cancel;
mod classroom;
mod course;
mod live;
mod provider;
mod snapshot;
mod user;

pub use admin::AdminHandle;
pub use classroom::{ClassroomHandle, ClassroomRole};
pub use course::CourseHandle;
pub use provider::{DataLayerProvider, ExternalClients, ProviderRegistry, initialize, initialize_with, teardown};
pub use user::{UserHandle, UserReader};

use std::sync::{Arc, RwLock};

/// Identity of the logged-in user, shared by every handle of one provider.
#[derive(Debug, Clone, Default)]
pub(crate) struct Session(Arc<RwLock<Option<String>>>);

impl Session {
    pub(crate) fn username(&self) -> Option<String> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set(&self, username: &str) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = Some(username.to_string());
    }

    pub(crate) fn clear(&self) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
