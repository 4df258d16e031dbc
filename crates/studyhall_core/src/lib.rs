#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Snapshot bundle format (manifest, resources, sources)
pub mod bundle;

/// Configuration options
pub mod config;

/// Data layer provider and backend drivers
pub mod data;

/// Error (common error types)
pub mod error;

/// Filesystem abstraction
pub mod fs;

/// Course, card, tag, learner and classroom records
pub mod model;

/// Static export of live courses into snapshot bundles
pub mod packer;

/// Per-user namespace provisioning
pub mod provisioning;

/// Study session scheduling
pub mod scheduler;

/// Document store and account-event log
pub mod store;

#[cfg(test)]
pub mod test_utils;

pub use config::{DataLayerConfig, StudyhallConfig};
pub use data::DataLayerProvider;
pub use error::{Result, StudyError};
pub use packer::{ExportReport, StaticPacker};
pub use provisioning::{ControllerHealth, ProvisioningController};
pub use scheduler::{Scheduler, SessionRequest, StudySessionItem};
