//! Fetch primitives for reading bundles.

use std::path::{Path, PathBuf};

use super::check_relative_location;
use crate::error::{Result, StudyError};
use crate::fs::{AsyncFileSystem, BoxFuture};

/// Where a bundle's manifest lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestLocation {
    /// Local filesystem path.
    Path(PathBuf),
    /// `http://` or `https://` URL.
    Url(String),
}

impl ManifestLocation {
    /// Parse a configured manifest location. `http://` and `https://` are URLs,
    /// anything without a scheme is a filesystem path.
    pub fn parse(location: &str) -> Result<Self> {
        let location = location.trim();
        if location.is_empty() {
            return Err(StudyError::Configuration("empty manifest location".into()));
        }
        if location.starts_with("http://") || location.starts_with("https://") {
            return Ok(ManifestLocation::Url(location.to_string()));
        }
        if let Some((scheme, _)) = location.split_once("://") {
            return Err(StudyError::Configuration(format!(
                "unsupported manifest scheme '{}'",
                scheme
            )));
        }
        Ok(ManifestLocation::Path(PathBuf::from(location)))
    }

    /// Whether the bundle is fetched over the network.
    pub fn is_remote(&self) -> bool {
        matches!(self, ManifestLocation::Url(_))
    }

    /// The location to hand to [`BundleSource::fetch`] for the manifest itself.
    pub fn manifest(&self) -> String {
        match self {
            ManifestLocation::Path(path) => path.to_string_lossy().into_owned(),
            ManifestLocation::Url(url) => url.clone(),
        }
    }

    /// Resolve a manifest-relative resource location.
    pub fn resolve(&self, relative: &str) -> Result<String> {
        check_relative_location(relative)?;
        Ok(match self {
            ManifestLocation::Path(path) => path
                .parent()
                .unwrap_or_else(|| Path::new(""))
                .join(relative)
                .to_string_lossy()
                .into_owned(),
            ManifestLocation::Url(url) => {
                let base = url.rsplit_once('/').map(|(base, _)| base).unwrap_or(url);
                format!("{}/{}", base, relative)
            }
        })
    }
}

/// Fetch primitive used by the snapshot driver.
///
/// Locations are absolute: a filesystem path or a URL, already resolved
/// against the manifest by the caller.
pub trait BundleSource: Send + Sync {
    /// Whole contents at `location`. Missing resources are `NotFound`.
    fn fetch<'a>(&'a self, location: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;
}

/// Reads bundles through an [`AsyncFileSystem`].
#[derive(Debug, Clone, Default)]
pub struct FsBundleSource<FS> {
    fs: FS,
}

impl<FS: AsyncFileSystem> FsBundleSource<FS> {
    /// Read bundles through `fs`.
    pub fn new(fs: FS) -> Self {
        Self { fs }
    }
}

impl<FS: AsyncFileSystem> BundleSource for FsBundleSource<FS> {
    fn fetch<'a>(&'a self, location: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            self.fs
                .read(Path::new(location))
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound => {
                        StudyError::NotFound(format!("{}: {}", location, e))
                    }
                    _ => StudyError::BackendUnavailable(format!("{}: {}", location, e)),
                })
        })
    }
}

/// Fetches bundles over HTTP(S).
#[cfg(feature = "http")]
#[derive(Debug, Clone, Default)]
pub struct HttpBundleSource {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpBundleSource {
    /// A source with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// A source sharing an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
impl BundleSource for HttpBundleSource {
    fn fetch<'a>(&'a self, location: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(async move {
            let response = self
                .client
                .get(location)
                .send()
                .await
                .map_err(|e| StudyError::BackendUnavailable(format!("{}: {}", location, e)))?;

            let status = response.status();
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(StudyError::NotFound(location.to_string()));
            }
            if !status.is_success() {
                return Err(StudyError::BackendUnavailable(format!(
                    "{}: HTTP {}",
                    location, status
                )));
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| StudyError::BackendUnavailable(format!("{}: {}", location, e)))?;
            Ok(body.to_vec())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{InMemoryFileSystem, SyncToAsyncFs};

    #[test]
    fn test_parse_locations() {
        assert_eq!(
            ManifestLocation::parse("https://cdn.example.org/c1/manifest.json").unwrap(),
            ManifestLocation::Url("https://cdn.example.org/c1/manifest.json".into())
        );
        assert_eq!(
            ManifestLocation::parse("out/c1/manifest.json").unwrap(),
            ManifestLocation::Path(PathBuf::from("out/c1/manifest.json"))
        );
        assert!(ManifestLocation::parse("ftp://host/manifest.json").is_err());
        assert!(ManifestLocation::parse("").is_err());
    }

    #[test]
    fn test_resolve_relative_to_manifest() {
        let url = ManifestLocation::parse("https://cdn.example.org/c1/manifest.json").unwrap();
        assert_eq!(
            url.resolve("resources/card/ab.json").unwrap(),
            "https://cdn.example.org/c1/resources/card/ab.json"
        );

        let path = ManifestLocation::parse("out/c1/manifest.json").unwrap();
        assert_eq!(
            PathBuf::from(path.resolve("resources/tag/cd.json").unwrap()),
            PathBuf::from("out/c1/resources/tag/cd.json")
        );
        assert!(path.resolve("../other/manifest.json").is_err());
    }

    #[tokio::test]
    async fn test_fs_source_maps_missing_file_to_not_found() {
        let fs = InMemoryFileSystem::new().with_file("b/manifest.json", "{}");
        let source = FsBundleSource::new(SyncToAsyncFs::new(fs));

        assert_eq!(source.fetch("b/manifest.json").await.unwrap(), b"{}".to_vec());
        assert!(matches!(
            source.fetch("b/missing.json").await,
            Err(StudyError::NotFound(_))
        ));
    }
}
