//! Snapshot bundle format.
//!
//! A bundle is a directory (or URL prefix) holding one `manifest.json` and a set
//! of content-addressed resource files:
//!
//! ```text
//! manifest.json
//! resources/config/<sha256>.json
//! resources/tag/<sha256>.json
//! resources/card/<sha256>.json
//! ```
//!
//! The manifest is written last by the packer, so a bundle without a manifest
//! is incomplete and never read. Resource files are immutable: identical bytes
//! always land at the same location.

mod source;

pub use source::{BundleSource, FsBundleSource, ManifestLocation};
#[cfg(feature = "http")]
pub use source::HttpBundleSource;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, StudyError};

/// File name of the bundle root.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Directory holding resource files, relative to the manifest.
pub const RESOURCES_DIR: &str = "resources";

/// Kind of a bundled resource. Ordering is the manifest index order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// The course configuration.
    Config,
    /// A tag document.
    Tag,
    /// A card document.
    Card,
}

impl ResourceKind {
    /// Name used in resource paths and the manifest.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Config => "config",
            ResourceKind::Tag => "tag",
            ResourceKind::Card => "card",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the manifest's resource index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    /// What the resource holds.
    pub kind: ResourceKind,
    /// Document id in the source course (`CourseConfig`, tag name, card id).
    pub id: String,
    /// Location relative to the manifest.
    pub location: String,
    /// Lowercase hex SHA-256 of the resource bytes.
    pub sha256: String,
    /// Size of the resource.
    pub bytes: u64,
}

impl ResourceEntry {
    /// Build the entry for `content` stored under its content address.
    pub fn for_content(kind: ResourceKind, id: impl Into<String>, content: &[u8]) -> Self {
        let sha256 = sha256_hex(content);
        Self {
            kind,
            id: id.into(),
            location: resource_location(kind, &sha256),
            sha256,
            bytes: content.len() as u64,
        }
    }

    /// Check that `content` is what this entry describes.
    pub fn verify(&self, content: &[u8]) -> Result<()> {
        let actual = sha256_hex(content);
        if actual != self.sha256 {
            return Err(StudyError::Integrity {
                location: self.location.clone(),
                expected: self.sha256.clone(),
                actual,
            });
        }
        Ok(())
    }
}

/// Root manifest of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Must equal [`Manifest::CURRENT_VERSION`].
    pub format_version: u32,
    /// Exported course.
    pub course_id: String,
    /// When the bundle was packed.
    pub exported_at: DateTime<Utc>,
    /// Every resource of the bundle, sorted by kind then id.
    pub resource_index: Vec<ResourceEntry>,
}

impl Manifest {
    /// Current manifest format version
    pub const CURRENT_VERSION: u32 = 1;

    /// An empty manifest at the current format version.
    pub fn new(course_id: impl Into<String>, exported_at: DateTime<Utc>) -> Self {
        Self {
            format_version: Self::CURRENT_VERSION,
            course_id: course_id.into(),
            exported_at,
            resource_index: Vec::new(),
        }
    }

    /// Sort the index by `(kind, id)`.
    pub fn sort_index(&mut self) {
        self.resource_index
            .sort_by(|a, b| (a.kind, a.id.as_str()).cmp(&(b.kind, b.id.as_str())));
    }

    /// Entries of one kind, in index order.
    pub fn entries(&self, kind: ResourceKind) -> impl Iterator<Item = &ResourceEntry> {
        self.resource_index.iter().filter(move |e| e.kind == kind)
    }

    /// Look up one resource.
    pub fn find(&self, kind: ResourceKind, id: &str) -> Option<&ResourceEntry> {
        self.resource_index
            .iter()
            .find(|e| e.kind == kind && e.id == id)
    }

    /// Parse and check a manifest.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)?;
        if manifest.format_version != Self::CURRENT_VERSION {
            return Err(StudyError::Configuration(format!(
                "unsupported bundle format version {}",
                manifest.format_version
            )));
        }
        for entry in &manifest.resource_index {
            check_relative_location(&entry.location)?;
        }
        Ok(manifest)
    }

    /// Serialize with a stable layout (pretty JSON, trailing newline).
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Content address of a resource, relative to the manifest.
pub fn resource_location(kind: ResourceKind, sha256: &str) -> String {
    format!("{}/{}/{}.json", RESOURCES_DIR, kind, sha256)
}

/// Reject locations that could escape the bundle root.
pub(crate) fn check_relative_location(location: &str) -> Result<()> {
    let escapes = location.is_empty()
        || location.starts_with('/')
        || location.starts_with('\\')
        || location.contains("://")
        || location.split(['/', '\\']).any(|segment| segment == "..");
    if escapes {
        return Err(StudyError::Validation(format!(
            "resource location '{}' is outside the bundle",
            location
        )));
    }
    Ok(())
}
