//! Per-user handles: the session's own [`UserHandle`] and the privileged
//! read-only [`UserReader`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::cancel::CancelScope;
use super::live::LiveDriver;
use super::Session;
use crate::error::{Result, StudyError};
use crate::fs::BoxFuture;
use crate::model::{
    COURSE_CONFIG_DOC, CardHistory, CardRecord, CourseRegistration, CourseRegistrations,
    DEFAULT_ELO, REGISTRATIONS_DOC, RegistrationStatus, ScheduledReview, card_history_doc,
    course_namespace, scheduled_review_doc, user_namespace,
};
use crate::scheduler::LearnerProgress;

const CARD_HISTORY_PREFIX: &str = "cardH-";
const SCHEDULED_REVIEW_PREFIX: &str = "sr-";

/// Reads over one learner's private namespace. A namespace that has not been
/// provisioned yet reads as empty.
#[derive(Clone)]
struct LearnerRecords {
    driver: Arc<LiveDriver>,
    namespace: String,
}

impl LearnerRecords {
    fn new(driver: Arc<LiveDriver>, username: &str) -> Self {
        Self {
            driver,
            namespace: user_namespace(username),
        }
    }

    async fn registrations(&self) -> Result<CourseRegistrations> {
        match self.driver.get(&self.namespace, REGISTRATIONS_DOC).await {
            Ok(found) => Ok(found.map(|r| r.value).unwrap_or_default()),
            Err(StudyError::NotFound(_)) => Ok(CourseRegistrations::default()),
            Err(e) => Err(e),
        }
    }

    async fn card_history(&self, course_id: &str, card_id: &str) -> Result<Option<CardHistory>> {
        match self
            .driver
            .get::<CardHistory>(&self.namespace, &card_history_doc(course_id, card_id))
            .await
        {
            Ok(found) => Ok(found.map(|h| h.value)),
            Err(StudyError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn seen_cards(&self, course_id: &str) -> Result<Vec<String>> {
        let prefix = format!("{}{}-", CARD_HISTORY_PREFIX, course_id);
        let histories = self.list::<CardHistory>(&prefix).await?;
        Ok(histories
            .into_iter()
            .filter(|h| h.course_id == course_id)
            .map(|h| h.card_id)
            .collect())
    }

    async fn due_reviews(&self, course_id: &str, now: DateTime<Utc>) -> Result<Vec<ScheduledReview>> {
        let prefix = format!("{}{}-", SCHEDULED_REVIEW_PREFIX, course_id);
        let mut due: Vec<ScheduledReview> = self
            .list::<ScheduledReview>(&prefix)
            .await?
            .into_iter()
            .filter(|r| r.course_id == course_id && r.review_time <= now)
            .collect();
        due.sort_by(|a, b| {
            a.review_time
                .cmp(&b.review_time)
                .then_with(|| a.card_id.cmp(&b.card_id))
        });
        Ok(due)
    }

    async fn list<T: serde::de::DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        match self.driver.list_all(&self.namespace, prefix).await {
            Err(StudyError::NotFound(_)) => Ok(Vec::new()),
            other => other,
        }
    }

    async fn course_elo(&self, course_id: &str) -> Result<Option<f64>> {
        Ok(self
            .registrations()
            .await?
            .courses
            .into_iter()
            .find(|r| r.course_id == course_id && r.status == RegistrationStatus::Active)
            .map(|r| r.elo))
    }

    /// Read-modify-write in the learner's namespace. A namespace that does not
    /// exist yet is still being provisioned, which is a transient condition.
    async fn modify<T, F>(&self, id: &str, apply: F) -> Result<Option<T>>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
        F: FnMut(Option<T>) -> Result<Option<T>>,
    {
        if !self.driver.namespace_exists(&self.namespace).await? {
            return Err(StudyError::BackendUnavailable(format!(
                "namespace {} is not provisioned yet",
                self.namespace
            )));
        }
        self.driver.modify(&self.namespace, id, apply).await
    }
}

enum UserBackend {
    Live {
        driver: Arc<LiveDriver>,
        session: Session,
    },
    /// Anonymous visitor of a read-only snapshot.
    Guest,
}

/// The session user's view of their own learner data.
pub struct UserHandle {
    backend: UserBackend,
    scope: CancelScope,
}

impl UserHandle {
    pub(crate) fn live(driver: Arc<LiveDriver>, scope: CancelScope) -> Self {
        let session = driver.session().clone();
        Self {
            backend: UserBackend::Live { driver, session },
            scope,
        }
    }

    pub(crate) fn guest(scope: CancelScope) -> Self {
        Self {
            backend: UserBackend::Guest,
            scope,
        }
    }

    /// Bind this handle to a caller-owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.scope = self.scope.with_caller(token);
        self
    }

    /// `true` in snapshot mode, where nobody can log in.
    pub fn is_guest(&self) -> bool {
        matches!(self.backend, UserBackend::Guest)
    }

    /// Authenticate and make `username` the session identity.
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let UserBackend::Live { driver, session } = &self.backend else {
            return Err(StudyError::read_only("log in"));
        };
        let accepted = self
            .scope
            .race(async { Ok(driver.store().authenticate(username, password).await?) })
            .await?;
        if !accepted {
            return Err(StudyError::PermissionDenied(format!(
                "invalid credentials for '{}'",
                username
            )));
        }
        session.set(username);
        log::info!("User {} logged in", username);
        Ok(())
    }

    /// Forget the session identity.
    pub fn logout(&self) {
        if let UserBackend::Live { session, .. } = &self.backend {
            session.clear();
        }
    }

    /// Whether someone is logged in.
    pub fn is_logged_in(&self) -> bool {
        self.username().is_some()
    }

    /// The session identity, if any.
    pub fn username(&self) -> Option<String> {
        match &self.backend {
            UserBackend::Live { session, .. } => session.username(),
            UserBackend::Guest => None,
        }
    }

    fn records(&self, operation: &str) -> Result<Option<LearnerRecords>> {
        self.scope.ensure_open()?;
        match &self.backend {
            UserBackend::Live { driver, .. } => {
                let username = driver.require_session(operation)?;
                Ok(Some(LearnerRecords::new(driver.clone(), &username)))
            }
            UserBackend::Guest => Ok(None),
        }
    }

    fn writable_records(&self, operation: &str) -> Result<LearnerRecords> {
        match self.records(operation)? {
            Some(records) => Ok(records),
            None => Err(StudyError::read_only(operation)),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Registrations of the logged-in learner; empty for guests.
    pub async fn course_registrations(&self) -> Result<CourseRegistrations> {
        match self.records("read course registrations")? {
            Some(records) => self.scope.race(records.registrations()).await,
            None => Ok(CourseRegistrations::default()),
        }
    }

    /// History of one card, `None` if never presented.
    pub async fn card_history(&self, course_id: &str, card_id: &str) -> Result<Option<CardHistory>> {
        match self.records("read card history")? {
            Some(records) => self.scope.race(records.card_history(course_id, card_id)).await,
            None => Ok(None),
        }
    }

    /// Ids of the cards of `course_id` this user has been shown.
    pub async fn seen_cards(&self, course_id: &str) -> Result<Vec<String>> {
        match self.records("read card history")? {
            Some(records) => self.scope.race(records.seen_cards(course_id)).await,
            None => Ok(Vec::new()),
        }
    }

    /// Reviews of `course_id` due at `now`, earliest first.
    pub async fn due_reviews(&self, course_id: &str, now: DateTime<Utc>) -> Result<Vec<ScheduledReview>> {
        match self.records("read scheduled reviews")? {
            Some(records) => self.scope.race(records.due_reviews(course_id, now)).await,
            None => Ok(Vec::new()),
        }
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Register for a course, or reactivate a dropped registration.
    pub async fn register_for_course(&self, course_id: &str) -> Result<()> {
        let records = self.writable_records("register for a course")?;
        let config_exists = self
            .scope
            .race(async {
                match records
                    .driver
                    .get::<serde_json::Value>(&course_namespace(course_id), COURSE_CONFIG_DOC)
                    .await
                {
                    Ok(found) => Ok(found.is_some()),
                    Err(StudyError::NotFound(_)) => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await?;
        if !config_exists {
            return Err(StudyError::NotFound(format!("course '{}'", course_id)));
        }

        self.scope.check()?;
        records
            .modify::<CourseRegistrations, _>(REGISTRATIONS_DOC, |current| {
                let mut registrations = current.unwrap_or_default();
                match registrations.courses.iter_mut().find(|r| r.course_id == course_id) {
                    Some(existing) if existing.status == RegistrationStatus::Active => return Ok(None),
                    Some(existing) => existing.status = RegistrationStatus::Active,
                    None => registrations.courses.push(CourseRegistration {
                        course_id: course_id.to_string(),
                        elo: DEFAULT_ELO,
                        status: RegistrationStatus::Active,
                    }),
                }
                Ok(Some(registrations))
            })
            .await?;
        Ok(())
    }

    /// Mark a registration dropped. History is kept.
    pub async fn drop_course(&self, course_id: &str) -> Result<()> {
        let records = self.writable_records("drop a course")?;
        self.scope.check()?;
        records
            .modify::<CourseRegistrations, _>(REGISTRATIONS_DOC, |current| {
                let mut registrations = current.unwrap_or_default();
                let registration = registrations
                    .courses
                    .iter_mut()
                    .find(|r| r.course_id == course_id)
                    .ok_or_else(|| StudyError::NotFound(format!("registration for '{}'", course_id)))?;
                if registration.status == RegistrationStatus::Dropped {
                    return Ok(None);
                }
                registration.status = RegistrationStatus::Dropped;
                Ok(Some(registrations))
            })
            .await?;
        Ok(())
    }

    /// Store the learner's new rating in a course.
    pub async fn update_course_elo(&self, course_id: &str, elo: f64) -> Result<()> {
        if !elo.is_finite() {
            return Err(StudyError::Validation(format!("invalid rating {}", elo)));
        }
        let records = self.writable_records("update a course rating")?;
        self.scope.check()?;
        records
            .modify::<CourseRegistrations, _>(REGISTRATIONS_DOC, |current| {
                let mut registrations = current.unwrap_or_default();
                let registration = registrations
                    .courses
                    .iter_mut()
                    .find(|r| r.course_id == course_id)
                    .ok_or_else(|| StudyError::NotFound(format!("registration for '{}'", course_id)))?;
                registration.elo = elo;
                Ok(Some(registrations))
            })
            .await?;
        Ok(())
    }

    /// Append a presentation record to the card's history.
    pub async fn record_card_view(&self, course_id: &str, card_id: &str, record: CardRecord) -> Result<()> {
        let records = self.writable_records("record a card view")?;
        self.scope.check()?;
        records
            .modify::<CardHistory, _>(&card_history_doc(course_id, card_id), |current| {
                let mut history = current.unwrap_or_else(|| CardHistory {
                    course_id: course_id.to_string(),
                    card_id: card_id.to_string(),
                    records: Vec::new(),
                });
                history.records.push(record.clone());
                Ok(Some(history))
            })
            .await?;
        Ok(())
    }

    /// Store the next review date chosen by the spaced-repetition policy,
    /// replacing any earlier one for the same card.
    pub async fn schedule_review(&self, review: ScheduledReview) -> Result<()> {
        let records = self.writable_records("schedule a review")?;
        self.scope.check()?;
        let id = scheduled_review_doc(&review.course_id, &review.card_id);
        records
            .modify::<ScheduledReview, _>(&id, |_| Ok(Some(review.clone())))
            .await?;
        Ok(())
    }

    /// Forget a scheduled review. Missing reviews are ignored.
    pub async fn remove_scheduled_review(&self, course_id: &str, card_id: &str) -> Result<()> {
        let records = self.writable_records("remove a scheduled review")?;
        self.scope.check()?;
        let id = scheduled_review_doc(course_id, card_id);
        let existing = match records.driver.get::<ScheduledReview>(&records.namespace, &id).await {
            Ok(existing) => existing,
            Err(StudyError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        if let Some(existing) = existing {
            match records.driver.delete(&records.namespace, &id, &existing.rev).await {
                Ok(()) | Err(StudyError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl LearnerProgress for UserHandle {
    fn course_elo<'a>(&'a self, course_id: &'a str) -> BoxFuture<'a, Result<Option<f64>>> {
        Box::pin(async move {
            match self.records("read course registrations")? {
                Some(records) => self.scope.race(records.course_elo(course_id)).await,
                None => Ok(None),
            }
        })
    }

    fn seen_cards<'a>(&'a self, course_id: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(UserHandle::seen_cards(self, course_id))
    }

    fn due_reviews<'a>(
        &'a self,
        course_id: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<ScheduledReview>>> {
        Box::pin(UserHandle::due_reviews(self, course_id, now))
    }
}

/// Read-only view of another user's private namespace, for administrators.
#[derive(Clone)]
pub struct UserReader {
    username: String,
    records: LearnerRecords,
    scope: CancelScope,
}

impl UserReader {
    pub(crate) fn new(driver: Arc<LiveDriver>, username: &str, scope: CancelScope) -> Self {
        Self {
            username: username.to_string(),
            records: LearnerRecords::new(driver, username),
            scope,
        }
    }

    /// Bind this reader to a caller-owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.scope = self.scope.with_caller(token);
        self
    }

    /// Learner whose records are read.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// See [`UserHandle::course_registrations`].
    pub async fn course_registrations(&self) -> Result<CourseRegistrations> {
        self.scope.race(self.records.registrations()).await
    }

    /// See [`UserHandle::card_history`].
    pub async fn card_history(&self, course_id: &str, card_id: &str) -> Result<Option<CardHistory>> {
        self.scope.race(self.records.card_history(course_id, card_id)).await
    }

    /// See [`UserHandle::seen_cards`].
    pub async fn seen_cards(&self, course_id: &str) -> Result<Vec<String>> {
        self.scope.race(self.records.seen_cards(course_id)).await
    }

    /// See [`UserHandle::due_reviews`].
    pub async fn due_reviews(&self, course_id: &str, now: DateTime<Utc>) -> Result<Vec<ScheduledReview>> {
        self.scope.race(self.records.due_reviews(course_id, now)).await
    }
}

impl LearnerProgress for UserReader {
    fn course_elo<'a>(&'a self, course_id: &'a str) -> BoxFuture<'a, Result<Option<f64>>> {
        Box::pin(self.scope.race(self.records.course_elo(course_id)))
    }

    fn seen_cards<'a>(&'a self, course_id: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(UserReader::seen_cards(self, course_id))
    }

    fn due_reviews<'a>(
        &'a self,
        course_id: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<ScheduledReview>>> {
        Box::pin(UserReader::due_reviews(self, course_id, now))
    }
}
