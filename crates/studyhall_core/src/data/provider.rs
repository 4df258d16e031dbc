//! Provider lifecycle and the single-flight registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use futures::future::Shared;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::admin::AdminHandle;
use super::cancel::CancelScope;
use super::classroom::{ClassroomHandle, ClassroomRole};
use super::course::CourseHandle;
use super::live::LiveDriver;
use super::snapshot::SnapshotDriver;
use super::user::{UserHandle, UserReader};
use super::Session;
use crate::bundle::{BundleSource, FsBundleSource, Manifest, ManifestLocation};
use crate::config::{BackendConfig, ConnectionConfig, DataLayerConfig};
use crate::error::{Result, StudyError};
use crate::fs::BoxFuture;
use crate::model::{
    CLASSROOM_CONFIG_DOC, COURSE_CONFIG_DOC, ClassroomConfig, CourseConfig, classroom_namespace,
    course_namespace,
};
use crate::store::{DocumentStore, StaticConnector, StoreConnector};

/// Clients the data layer cannot create on its own.
///
/// The live backend needs a [`StoreConnector`]. The snapshot backend falls
/// back to the local filesystem for paths (and to HTTP for URLs with the
/// `http` feature) when no [`BundleSource`] is given.
#[derive(Clone, Default)]
pub struct ExternalClients {
    /// Opens the live store.
    pub connector: Option<Arc<dyn StoreConnector>>,
    /// Fetches snapshot bundles.
    pub bundle_source: Option<Arc<dyn BundleSource>>,
}

impl ExternalClients {
    /// No clients; backends fall back to their defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the live store through `connector`.
    pub fn with_connector(mut self, connector: Arc<dyn StoreConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use an already-open store whatever the configured endpoint.
    pub fn with_store(self, store: Arc<dyn DocumentStore>) -> Self {
        self.with_connector(Arc::new(StaticConnector::new(store)))
    }

    /// Fetch bundles through `source`.
    pub fn with_bundle_source(mut self, source: Arc<dyn BundleSource>) -> Self {
        self.bundle_source = Some(source);
        self
    }
}

enum Backend {
    Live(Arc<LiveDriver>),
    Snapshot(Arc<SnapshotDriver>),
}

/// The single entry point to course, user, classroom and admin data.
pub struct DataLayerProvider {
    config: DataLayerConfig,
    backend: Backend,
    cancel: CancellationToken,
}

impl DataLayerProvider {
    /// Connect to the configured backend.
    async fn open(config: DataLayerConfig, clients: ExternalClients, cancel: CancellationToken) -> Result<Self> {
        config.validate()?;
        let backend = match &config.backend {
            BackendConfig::Live { connection } => {
                let connector = clients.connector.clone().ok_or_else(|| {
                    StudyError::Configuration("live backend requires a document store connector".into())
                })?;
                let session = Session::default();
                let store = connect_live(connector.as_ref(), connection, &session).await?;
                Backend::Live(Arc::new(LiveDriver::new(
                    store,
                    config.admin_username.clone(),
                    session,
                )))
            }
            BackendConfig::Snapshot { manifest_location } => {
                let location = ManifestLocation::parse(manifest_location)?;
                let source = match clients.bundle_source.clone() {
                    Some(source) => source,
                    None => default_bundle_source(&location)?,
                };
                Backend::Snapshot(Arc::new(SnapshotDriver::open(location, source).await?))
            }
        };
        Ok(Self {
            config,
            backend,
            cancel,
        })
    }

    /// Configuration the provider was initialized with.
    pub fn config(&self) -> &DataLayerConfig {
        &self.config
    }

    /// `true` for the snapshot backend.
    pub fn is_read_only(&self) -> bool {
        matches!(self.backend, Backend::Snapshot(_))
    }

    /// Whether [`teardown`] ran; every handle then fails with `Cancelled`.
    pub fn is_torn_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Manifest of the bundle being served, in snapshot mode.
    pub fn snapshot_manifest(&self) -> Option<&Manifest> {
        match &self.backend {
            Backend::Snapshot(snapshot) => Some(snapshot.manifest()),
            Backend::Live(_) => None,
        }
    }

    fn scope(&self) -> Result<CancelScope> {
        let scope = CancelScope::new(self.cancel.clone());
        scope.ensure_open()?;
        Ok(scope)
    }

    fn live(&self, operation: &str) -> Result<&Arc<LiveDriver>> {
        match &self.backend {
            Backend::Live(driver) => Ok(driver),
            Backend::Snapshot(_) => Err(StudyError::read_only(operation)),
        }
    }

    /// Handle to a course. Lookups happen lazily on the handle; in snapshot
    /// mode only the packed course exists.
    pub fn get_course(&self, course_id: &str) -> Result<CourseHandle> {
        let scope = self.scope()?;
        match &self.backend {
            Backend::Live(driver) => Ok(CourseHandle::live(driver.clone(), course_id, scope)),
            Backend::Snapshot(snapshot) if snapshot.course_id() == course_id => {
                Ok(CourseHandle::snapshot(snapshot.clone(), scope))
            }
            Backend::Snapshot(_) => Err(StudyError::NotFound(format!("course '{}'", course_id))),
        }
    }

    /// Handle to the session user. In snapshot mode this is an anonymous guest.
    pub fn get_user(&self) -> Result<UserHandle> {
        let scope = self.scope()?;
        Ok(match &self.backend {
            Backend::Live(driver) => UserHandle::live(driver.clone(), scope),
            Backend::Snapshot(_) => UserHandle::guest(scope),
        })
    }

    /// Read-only view of `username`'s private data. Platform admin only.
    pub fn create_user_reader_for(&self, username: &str) -> Result<UserReader> {
        let scope = self.scope()?;
        match &self.backend {
            Backend::Live(driver) if driver.session_is_admin() => {
                Ok(UserReader::new(driver.clone(), username, scope))
            }
            _ => Err(StudyError::PermissionDenied(
                "reading another user's data requires the platform admin".into(),
            )),
        }
    }

    /// Open a classroom in the given role. Snapshot bundles carry no classrooms.
    pub async fn get_classroom(&self, classroom_id: &str, role: ClassroomRole) -> Result<ClassroomHandle> {
        let scope = self.scope()?;
        match &self.backend {
            Backend::Live(driver) => ClassroomHandle::open(driver.clone(), classroom_id, role, scope).await,
            Backend::Snapshot(_) => Err(StudyError::NotFound(format!("classroom '{}'", classroom_id))),
        }
    }

    /// Platform administration. Platform admin only.
    pub fn get_admin(&self) -> Result<AdminHandle> {
        let scope = self.scope()?;
        match &self.backend {
            Backend::Live(driver) if driver.session_is_admin() => Ok(AdminHandle::new(driver.clone(), scope)),
            _ => Err(StudyError::PermissionDenied(
                "administration requires the platform admin".into(),
            )),
        }
    }

    /// Create a course namespace and its configuration document.
    ///
    /// The session must be the course's creator or the platform admin.
    pub async fn create_course(&self, config: CourseConfig) -> Result<CourseHandle> {
        let scope = self.scope()?;
        let driver = self.live("create a course")?;
        validate_id("course", &config.course_id)?;
        let username = driver.require_session("create a course")?;
        if username != config.creator && !driver.session_is_admin() {
            return Err(StudyError::PermissionDenied(format!(
                "'{}' may not create a course owned by '{}'",
                username, config.creator
            )));
        }

        scope.check()?;
        let namespace = course_namespace(&config.course_id);
        driver.store().create_namespace(&namespace).await?;
        driver.put(&namespace, COURSE_CONFIG_DOC, &config, None).await?;
        log::info!("Created course {} for {}", config.course_id, config.creator);
        Ok(CourseHandle::live(driver.clone(), &config.course_id, scope))
    }

    /// Create a classroom. The session must be one of its teachers or the
    /// platform admin.
    pub async fn create_classroom(&self, config: ClassroomConfig) -> Result<ClassroomHandle> {
        let scope = self.scope()?;
        let driver = self.live("create a classroom")?;
        validate_id("classroom", &config.classroom_id)?;
        let username = driver.require_session("create a classroom")?;
        if !config.is_teacher(&username) && !driver.session_is_admin() {
            return Err(StudyError::PermissionDenied(format!(
                "'{}' is not a teacher of classroom '{}'",
                username, config.classroom_id
            )));
        }

        scope.check()?;
        let namespace = classroom_namespace(&config.classroom_id);
        driver.store().create_namespace(&namespace).await?;
        driver.put(&namespace, CLASSROOM_CONFIG_DOC, &config, None).await?;
        log::info!("Created classroom {}", config.classroom_id);
        ClassroomHandle::open(driver.clone(), &config.classroom_id, ClassroomRole::Teacher, scope).await
    }

    /// Cancel in-flight backend calls and refuse new ones. Idempotent.
    pub fn teardown(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            log::info!("Data layer provider torn down");
        }
    }
}

async fn connect_live(
    connector: &dyn StoreConnector,
    connection: &ConnectionConfig,
    session: &Session,
) -> Result<Arc<dyn DocumentStore>> {
    let unreachable = |e: crate::store::StoreError| {
        StudyError::Configuration(format!("cannot reach {}: {}", connection.endpoint, e))
    };
    let store = connector.connect(connection).await.map_err(unreachable)?;
    store.ping().await.map_err(unreachable)?;

    if let (Some(username), Some(password)) = (&connection.username, &connection.password) {
        let accepted = store
            .authenticate(username, password)
            .await
            .map_err(unreachable)?;
        if !accepted {
            return Err(StudyError::Configuration(format!(
                "authentication failed for '{}' at {}",
                username, connection.endpoint
            )));
        }
        session.set(username);
    }
    log::info!("Connected to live store at {}", connection.endpoint);
    Ok(store)
}

fn default_bundle_source(location: &ManifestLocation) -> Result<Arc<dyn BundleSource>> {
    match location {
        #[cfg(feature = "http")]
        ManifestLocation::Url(_) => Ok(Arc::new(crate::bundle::HttpBundleSource::new())),
        #[cfg(not(feature = "http"))]
        ManifestLocation::Url(url) => Err(StudyError::Configuration(format!(
            "cannot fetch {}: built without the `http` feature",
            url
        ))),
        #[cfg(not(target_arch = "wasm32"))]
        ManifestLocation::Path(_) => Ok(Arc::new(FsBundleSource::new(
            crate::fs::SyncToAsyncFs::new(crate::fs::RealFileSystem),
        ))),
        #[cfg(target_arch = "wasm32")]
        ManifestLocation::Path(path) => Err(StudyError::Configuration(format!(
            "no bundle source configured for {}",
            path.display()
        ))),
    }
}

fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() || id.chars().any(|c| c.is_whitespace() || c == '/' || c.is_control()) {
        return Err(StudyError::Validation(format!("invalid {} id '{}'", kind, id)));
    }
    Ok(())
}

// ============================================================================
// Registry
// ============================================================================

type InitFuture = Shared<BoxFuture<'static, Result<Arc<DataLayerProvider>>>>;

enum RegistryState {
    Empty,
    Initializing {
        config: DataLayerConfig,
        attempt: u64,
        future: InitFuture,
        cancel: CancellationToken,
    },
    Ready {
        config: DataLayerConfig,
        provider: Arc<DataLayerProvider>,
    },
}

/// Owns at most one provider and guarantees a single initialization in flight.
///
/// Concurrent [`initialize`](ProviderRegistry::initialize) calls with the same
/// configuration share one attempt and observe the same outcome. Once a
/// provider is ready, the same configuration returns it again and any other
/// configuration is refused until [`teardown`](ProviderRegistry::teardown).
pub struct ProviderRegistry {
    state: Mutex<RegistryState>,
    attempts: AtomicU64,
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::Empty),
            attempts: AtomicU64::new(0),
        }
    }

    /// Initialize the provider once. Concurrent and later calls with the same
    /// configuration share the result, a different configuration fails with
    /// `Configuration`. A failed attempt is not cached.
    pub async fn initialize(
        &self,
        config: DataLayerConfig,
        clients: ExternalClients,
    ) -> Result<Arc<DataLayerProvider>> {
        config.validate()?;

        let (attempt, future) = {
            let mut state = self.state.lock().await;
            match &*state {
                RegistryState::Ready {
                    config: current,
                    provider,
                } => {
                    if *current == config {
                        return Ok(provider.clone());
                    }
                    return Err(StudyError::Configuration(
                        "data layer already initialized with a different configuration".into(),
                    ));
                }
                RegistryState::Initializing {
                    config: current,
                    attempt,
                    future,
                    ..
                } => {
                    if *current != config {
                        return Err(StudyError::Configuration(
                            "data layer initialization already in progress with a different configuration"
                                .into(),
                        ));
                    }
                    (*attempt, future.clone())
                }
                RegistryState::Empty => {
                    let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
                    let cancel = CancellationToken::new();
                    let future = Self::start(config.clone(), clients, cancel.clone());
                    *state = RegistryState::Initializing {
                        config: config.clone(),
                        attempt,
                        future: future.clone(),
                        cancel,
                    };
                    log::debug!("Starting data layer initialization #{}", attempt);
                    (attempt, future)
                }
            }
        };

        let result = future.await;

        let mut state = self.state.lock().await;
        if let RegistryState::Initializing { attempt: current, .. } = &*state
            && *current == attempt
        {
            *state = match &result {
                Ok(provider) => RegistryState::Ready {
                    config,
                    provider: provider.clone(),
                },
                Err(e) => {
                    log::warn!("Data layer initialization failed: {}", e);
                    RegistryState::Empty
                }
            };
        }
        result
    }

    fn start(config: DataLayerConfig, clients: ExternalClients, cancel: CancellationToken) -> InitFuture {
        let future: BoxFuture<'static, Result<Arc<DataLayerProvider>>> = Box::pin(async move {
            let open = DataLayerProvider::open(config, clients, cancel.child_token());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StudyError::Cancelled),
                provider = open => provider.map(Arc::new),
            }
        });
        future.shared()
    }

    /// The ready provider, if any.
    pub async fn current(&self) -> Option<Arc<DataLayerProvider>> {
        match &*self.state.lock().await {
            RegistryState::Ready { provider, .. } => Some(provider.clone()),
            _ => None,
        }
    }

    /// Tear down the provider or cancel the initialization in flight, then
    /// accept a new initialization. Idempotent.
    pub async fn teardown(&self) {
        let previous = std::mem::replace(&mut *self.state.lock().await, RegistryState::Empty);
        match previous {
            RegistryState::Empty => {}
            RegistryState::Initializing { cancel, .. } => cancel.cancel(),
            RegistryState::Ready { provider, .. } => provider.teardown(),
        }
    }
}

fn global() -> &'static ProviderRegistry {
    static REGISTRY: OnceLock<ProviderRegistry> = OnceLock::new();
    REGISTRY.get_or_init(ProviderRegistry::new)
}

/// Initialize the process-wide provider with default clients.
pub async fn initialize(config: DataLayerConfig) -> Result<Arc<DataLayerProvider>> {
    global().initialize(config, ExternalClients::default()).await
}

/// Initialize the process-wide provider with explicit clients.
pub async fn initialize_with(config: DataLayerConfig, clients: ExternalClients) -> Result<Arc<DataLayerProvider>> {
    global().initialize(config, clients).await
}

/// Tear down the process-wide provider.
pub async fn teardown() {
    global().teardown().await
}
