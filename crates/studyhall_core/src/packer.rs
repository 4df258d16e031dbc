//! Static export of a live course into a snapshot bundle.
//!
//! The packer reads a course through a live [`DataLayerProvider`] and writes
//! a content-addressed bundle (see [`crate::bundle`]):
//!
//! 1. the configuration, every tag and every card are written as resource
//!    files named by their SHA-256, one page of cards in memory at a time,
//!    with bounded concurrent writes inside a page;
//! 2. `manifest.json` is written last, to a temporary file that then
//!    atomically replaces the previous one.
//!
//! Any failure aborts the export with [`StudyError::Export`] naming the
//! resource, and leaves any previous manifest untouched. Re-packing an
//! unchanged course produces byte-identical output.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::bundle::{MANIFEST_FILE, Manifest, ResourceEntry, ResourceKind, sha256_hex};
use crate::data::DataLayerProvider;
use crate::error::{Result, StudyError};
use crate::fs::AsyncFileSystem;
use crate::model::{COURSE_CONFIG_DOC, PageRequest};

/// Tuning knobs for [`StaticPacker`].
#[derive(Debug, Clone)]
pub struct PackOptions {
    /// Manifest timestamp. Defaults to the latest modification time of the
    /// exported documents.
    pub exported_at: Option<DateTime<Utc>>,
    /// Cards read per page.
    pub page_size: usize,
    /// Resource writes in flight at once.
    pub write_concurrency: usize,
}

impl Default for PackOptions {
    fn default() -> Self {
        Self {
            exported_at: None,
            page_size: 100,
            write_concurrency: 8,
        }
    }
}

/// Outcome of a successful export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportReport {
    /// Exported course.
    pub course_id: String,
    /// Where the manifest was written.
    pub manifest_path: PathBuf,
    /// Resources written by this run.
    pub resources_written: usize,
    /// Resources already present with the right content.
    pub resources_reused: usize,
    /// Bytes written, manifest included.
    pub bytes_written: u64,
    /// Timestamp recorded in the manifest.
    pub exported_at: DateTime<Utc>,
}

/// Result of storing one resource.
struct Stored {
    entry: ResourceEntry,
    reused: bool,
}

/// Writes snapshot bundles through an [`AsyncFileSystem`].
pub struct StaticPacker<FS> {
    fs: FS,
    options: PackOptions,
}

impl<FS: AsyncFileSystem> StaticPacker<FS> {
    /// A packer writing through `fs` with default options.
    pub fn new(fs: FS) -> Self {
        Self {
            fs,
            options: PackOptions::default(),
        }
    }

    /// Override the default [`PackOptions`].
    pub fn with_options(mut self, options: PackOptions) -> Self {
        self.options = options;
        self
    }

    /// Export `course_id` from a live provider into `output_dir`.
    pub async fn pack(
        &self,
        course_id: &str,
        provider: &DataLayerProvider,
        output_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ExportReport> {
        if provider.is_read_only() {
            return Err(StudyError::Configuration(
                "cannot pack from a read-only source".into(),
            ));
        }
        if self.options.page_size == 0 || self.options.write_concurrency == 0 {
            return Err(StudyError::Configuration(
                "page_size and write_concurrency must be at least 1".into(),
            ));
        }
        let course = provider.get_course(course_id)?.with_cancellation(cancel.clone());
        ensure_not_cancelled(cancel)?;

        self.fs
            .create_dir_all(output_dir)
            .await
            .map_err(|e| StudyError::from(e).in_export("output directory"))?;

        let mut stored: Vec<Stored> = Vec::new();
        let mut latest: Option<DateTime<Utc>> = None;

        let config = course
            .get_config()
            .await
            .map_err(|e| e.in_export("config"))?;
        latest = latest.max(config.updated_at);
        stored.push(
            self.store(output_dir, ResourceKind::Config, COURSE_CONFIG_DOC, &config)
                .await
                .map_err(|e| e.in_export("config"))?,
        );

        let tags = course.list_tags().await.map_err(|e| e.in_export("tag listing"))?;
        for tag in &tags {
            latest = latest.max(tag.updated_at);
        }
        stored.extend(
            self.store_all(
                output_dir,
                ResourceKind::Tag,
                tags.iter().map(|t| (t.name.clone(), t)),
                cancel,
            )
            .await?,
        );

        let mut page = Some(PageRequest::first(self.options.page_size));
        while let Some(request) = page {
            ensure_not_cancelled(cancel)?;
            let cards = course
                .list_cards(request)
                .await
                .map_err(|e| e.in_export("card listing"))?;
            for card in &cards.items {
                latest = latest.max(card.updated_at);
            }
            stored.extend(
                self.store_all(
                    output_dir,
                    ResourceKind::Card,
                    cards.items.iter().map(|c| (c.id.clone(), c)),
                    cancel,
                )
                .await?,
            );
            page = cards.next;
        }

        let exported_at = self
            .options
            .exported_at
            .or(latest)
            .unwrap_or(DateTime::UNIX_EPOCH);
        let mut manifest = Manifest::new(course_id, exported_at);
        let resources_reused = stored.iter().filter(|s| s.reused).count();
        let mut bytes_written: u64 = stored
            .iter()
            .filter(|s| !s.reused)
            .map(|s| s.entry.bytes)
            .sum();
        let resources_written = stored.len() - resources_reused;
        manifest.resource_index = stored.into_iter().map(|s| s.entry).collect();
        manifest.sort_index();

        // Last chance to abort without publishing anything
        ensure_not_cancelled(cancel)?;
        let manifest_path = output_dir.join(MANIFEST_FILE);
        let bytes = manifest.to_json_bytes()?;
        self.replace_file(&manifest_path, &bytes)
            .await
            .map_err(|e| e.in_export("manifest"))?;
        bytes_written += bytes.len() as u64;

        log::info!(
            "Packed course {} into {} ({} written, {} reused)",
            course_id,
            output_dir.display(),
            resources_written,
            resources_reused
        );

        Ok(ExportReport {
            course_id: course_id.to_string(),
            manifest_path,
            resources_written,
            resources_reused,
            bytes_written,
            exported_at,
        })
    }

    /// Store a batch of records with bounded concurrency.
    async fn store_all<'r, T, I>(
        &self,
        output_dir: &Path,
        kind: ResourceKind,
        records: I,
        cancel: &CancellationToken,
    ) -> Result<Vec<Stored>>
    where
        T: Serialize + Sync + 'r,
        I: Iterator<Item = (String, &'r T)>,
    {
        ensure_not_cancelled(cancel)?;
        futures::stream::iter(records)
            .map(|(id, record)| async move {
                self.store(output_dir, kind, &id, record)
                    .await
                    .map_err(|e| e.in_export(format!("{} {}", kind, id)))
            })
            .buffer_unordered(self.options.write_concurrency)
            .try_collect()
            .await
    }

    /// Write one record under its content address, reusing an identical file.
    async fn store<T: Serialize>(
        &self,
        output_dir: &Path,
        kind: ResourceKind,
        id: &str,
        record: &T,
    ) -> Result<Stored> {
        let bytes = serde_json::to_vec(record)?;
        let entry = ResourceEntry::for_content(kind, id, &bytes);
        let path = output_dir.join(&entry.location);

        if self.fs.exists(&path).await {
            match self.fs.read(&path).await {
                Ok(existing) if sha256_hex(&existing) == entry.sha256 => {
                    return Ok(Stored {
                        entry,
                        reused: true,
                    });
                }
                Ok(_) => log::warn!("Replacing corrupt resource {}", path.display()),
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(parent) = path.parent() {
            self.fs.create_dir_all(parent).await?;
        }
        self.replace_file(&path, &bytes).await?;
        Ok(Stored {
            entry,
            reused: false,
        })
    }

    /// Write `bytes` to a temporary sibling, then swap it over `path`.
    async fn replace_file(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = partial_path(path);
        self.fs.write(&tmp, bytes).await?;
        if let Err(e) = self.fs.replace(&tmp, path).await {
            let _ = self.fs.remove(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".{}.partial", uuid::Uuid::new_v4().simple()));
    PathBuf::from(name)
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(StudyError::Cancelled);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FileSystem, SyncToAsyncFs};
    use crate::model::{CourseConfig, NewCard};
    use crate::store::MemoryStore;
    use crate::test_utils::{FaultyFs, live_provider};
    use std::sync::Arc;

    async fn seeded_provider() -> Arc<DataLayerProvider> {
        let store = MemoryStore::new();
        store.create_account("alice", "pw").unwrap();
        let provider = live_provider(Arc::new(store), "alice", "pw").await;
        let course = provider
            .create_course(CourseConfig::new("c1", "Algebra", "alice").with_shape("math"))
            .await
            .unwrap();
        for i in 0..5 {
            course
                .add_card(
                    NewCard::new("math", "alice")
                        .field("question", format!("{} + 1", i))
                        .tag("algebra"),
                )
                .await
                .unwrap();
        }
        provider
    }

    #[tokio::test]
    async fn test_repack_is_byte_identical() {
        let provider = seeded_provider().await;
        let fs = FaultyFs::default();
        let packer = StaticPacker::new(SyncToAsyncFs::new(fs.clone())).with_options(PackOptions {
            page_size: 2,
            ..Default::default()
        });
        let out = Path::new("bundle");
        let cancel = CancellationToken::new();

        let first = packer.pack("c1", &provider, out, &cancel).await.unwrap();
        assert_eq!(first.resources_written, 7);
        let manifest = fs.inner.read(&first.manifest_path).unwrap();

        let second = packer.pack("c1", &provider, out, &cancel).await.unwrap();
        assert_eq!(second.resources_written, 0);
        assert_eq!(second.resources_reused, 7);
        assert_eq!(fs.inner.read(&second.manifest_path).unwrap(), manifest);
        assert!(
            !fs.inner
                .paths()
                .iter()
                .any(|p| p.to_string_lossy().ends_with(".partial"))
        );
    }

    #[tokio::test]
    async fn test_failed_resource_write_publishes_no_manifest() {
        let provider = seeded_provider().await;
        let fs = FaultyFs::default();
        fs.fail_writes_containing(Some("resources/card"));
        let packer = StaticPacker::new(SyncToAsyncFs::new(fs.clone()));

        let err = packer
            .pack("c1", &provider, Path::new("bundle"), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            StudyError::Export { resource, .. } => assert!(resource.starts_with("card ")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!fs.inner.exists(Path::new("bundle/manifest.json")));
    }

    #[tokio::test]
    async fn test_failed_repack_keeps_previous_manifest() {
        let provider = seeded_provider().await;
        let fs = FaultyFs::default();
        let packer = StaticPacker::new(SyncToAsyncFs::new(fs.clone()));
        let out = Path::new("bundle");
        let cancel = CancellationToken::new();
        let report = packer.pack("c1", &provider, out, &cancel).await.unwrap();
        let before = fs.inner.read(&report.manifest_path).unwrap();

        provider
            .get_course("c1")
            .unwrap()
            .add_card(NewCard::new("math", "alice").field("question", "new"))
            .await
            .unwrap();
        fs.fail_writes_containing(Some("resources/card"));
        assert!(packer.pack("c1", &provider, out, &cancel).await.is_err());
        assert_eq!(fs.inner.read(&report.manifest_path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_cancelled_pack_writes_nothing() {
        let provider = seeded_provider().await;
        let fs = FaultyFs::default();
        let packer = StaticPacker::new(SyncToAsyncFs::new(fs.clone()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = packer.pack("c1", &provider, Path::new("bundle"), &cancel).await;
        assert!(matches!(result, Err(StudyError::Cancelled)));
        assert!(fs.inner.paths().is_empty());
    }

    #[tokio::test]
    async fn test_failed_manifest_swap_keeps_previous_manifest() {
        let provider = seeded_provider().await;
        let fs = FaultyFs::default();
        let packer = StaticPacker::new(SyncToAsyncFs::new(fs.clone()));
        let out = Path::new("bundle");
        let cancel = CancellationToken::new();
        let report = packer.pack("c1", &provider, out, &cancel).await.unwrap();
        let before = fs.inner.read(&report.manifest_path).unwrap();

        provider
            .get_course("c1")
            .unwrap()
            .add_card(NewCard::new("math", "alice").field("question", "new"))
            .await
            .unwrap();
        fs.fail_replace_onto(Some(MANIFEST_FILE));
        let err = packer.pack("c1", &provider, out, &cancel).await.unwrap_err();
        assert!(matches!(err, StudyError::Export { ref resource, .. } if resource == "manifest"));

        assert_eq!(fs.inner.read(&report.manifest_path).unwrap(), before);
        assert!(
            !fs.inner
                .paths()
                .iter()
                .any(|p| p.to_string_lossy().ends_with(".partial"))
        );

        fs.fail_replace_onto(None);
        let healed = packer.pack("c1", &provider, out, &cancel).await.unwrap();
        assert_ne!(fs.inner.read(&healed.manifest_path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_repack_on_disk_replaces_manifest() {
        let provider = seeded_provider().await;
        let dir = tempfile::tempdir().unwrap();
        let packer = StaticPacker::new(SyncToAsyncFs::new(crate::fs::RealFileSystem));
        let cancel = CancellationToken::new();

        let first = packer.pack("c1", &provider, dir.path(), &cancel).await.unwrap();
        let before = std::fs::read(&first.manifest_path).unwrap();

        provider
            .get_course("c1")
            .unwrap()
            .add_card(NewCard::new("math", "alice").field("question", "new"))
            .await
            .unwrap();
        let second = packer.pack("c1", &provider, dir.path(), &cancel).await.unwrap();
        assert_eq!(second.resources_written, 1);
        assert_eq!(second.resources_reused, 7);

        let after = std::fs::read(&second.manifest_path).unwrap();
        assert_ne!(after, before);
        let manifest = Manifest::from_json(&after).unwrap();
        assert_eq!(manifest.entries(ResourceKind::Card).count(), 6);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }
}
