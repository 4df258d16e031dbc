//! Snapshot backend driver.
//!
//! Serves one packed course from a bundle. The manifest, the configuration and
//! the tag catalog are loaded when the provider starts; cards are fetched on
//! first access, verified against their manifest hash and cached.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;

use crate::bundle::{BundleSource, Manifest, ManifestLocation, ResourceEntry, ResourceKind};
use crate::error::{Result, StudyError};
use crate::model::{COURSE_CONFIG_DOC, Card, CourseConfig, Tag};

pub(crate) struct SnapshotDriver {
    location: ManifestLocation,
    source: Arc<dyn BundleSource>,
    manifest: Manifest,
    config: CourseConfig,
    tags: BTreeMap<String, Tag>,
    /// Card id -> manifest entry, in key order.
    cards: BTreeMap<String, ResourceEntry>,
    cache: RwLock<HashMap<String, Card>>,
}

impl SnapshotDriver {
    /// Load a bundle's manifest and eager resources.
    ///
    /// A manifest that cannot be fetched or parsed is a configuration error.
    pub(crate) async fn open(location: ManifestLocation, source: Arc<dyn BundleSource>) -> Result<Self> {
        let raw = source.fetch(&location.manifest()).await.map_err(|e| {
            StudyError::Configuration(format!(
                "cannot load manifest at {}: {}",
                location.manifest(),
                e
            ))
        })?;
        let manifest = Manifest::from_json(&raw).map_err(|e| {
            StudyError::Configuration(format!(
                "invalid manifest at {}: {}",
                location.manifest(),
                e
            ))
        })?;

        let config_entry = manifest
            .find(ResourceKind::Config, COURSE_CONFIG_DOC)
            .ok_or_else(|| {
                StudyError::Configuration(format!(
                    "bundle for course '{}' has no configuration resource",
                    manifest.course_id
                ))
            })?;
        let config: CourseConfig = fetch_resource(&location, source.as_ref(), config_entry).await?;

        let mut tags = BTreeMap::new();
        for entry in manifest.entries(ResourceKind::Tag) {
            let tag: Tag = fetch_resource(&location, source.as_ref(), entry).await?;
            tags.insert(tag.name.clone(), tag);
        }

        let cards = manifest
            .entries(ResourceKind::Card)
            .map(|entry| (entry.id.clone(), entry.clone()))
            .collect();

        log::info!(
            "Opened snapshot of course {} ({} resources, exported {})",
            manifest.course_id,
            manifest.resource_index.len(),
            manifest.exported_at
        );

        Ok(Self {
            location,
            source,
            manifest,
            config,
            tags,
            cards,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub(crate) fn course_id(&self) -> &str {
        &self.manifest.course_id
    }

    pub(crate) fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub(crate) fn config(&self) -> &CourseConfig {
        &self.config
    }

    pub(crate) fn tag(&self, name: &str) -> Result<&Tag> {
        self.tags
            .get(name)
            .ok_or_else(|| StudyError::NotFound(format!("tag '{}'", name)))
    }

    pub(crate) fn tags(&self) -> impl Iterator<Item = &Tag> {
        self.tags.values()
    }

    /// Up to `limit` card ids strictly after `start_after`.
    pub(crate) fn card_ids_after(&self, start_after: Option<&str>, limit: usize) -> Vec<String> {
        let range = match start_after {
            Some(after) => self
                .cards
                .range::<str, _>((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded)),
            None => self.cards.range::<str, _>(..),
        };
        range.take(limit).map(|(id, _)| id.clone()).collect()
    }

    pub(crate) async fn card(&self, card_id: &str) -> Result<Card> {
        let cached = self.cache.read().unwrap_or_else(|e| e.into_inner()).get(card_id).cloned();
        if let Some(card) = cached {
            return Ok(card);
        }
        let entry = self
            .cards
            .get(card_id)
            .ok_or_else(|| StudyError::NotFound(format!("card '{}'", card_id)))?;
        let card: Card = fetch_resource(&self.location, self.source.as_ref(), entry).await?;
        self.cache
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(card_id.to_string(), card.clone());
        Ok(card)
    }
}

/// Fetch, verify and decode one resource.
async fn fetch_resource<T: DeserializeOwned>(
    location: &ManifestLocation,
    source: &dyn BundleSource,
    entry: &ResourceEntry,
) -> Result<T> {
    let bytes = source.fetch(&location.resolve(&entry.location)?).await?;
    entry.verify(&bytes)?;
    Ok(serde_json::from_slice(&bytes)?)
}
