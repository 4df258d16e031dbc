//! Per-course handle.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::cancel::CancelScope;
use super::live::{LiveDriver, Versioned};
use super::snapshot::SnapshotDriver;
use crate::error::{Result, StudyError};
use crate::model::{
    CARD_DOC_PREFIX, COURSE_CONFIG_DOC, Card, CardElo, CourseConfig, DEFAULT_ELO, NewCard, Page,
    PageRequest, TAG_DOC_PREFIX, Tag, course_namespace, tag_doc,
};

/// Access to one course, on whichever backend the provider runs.
///
/// Reads race the provider's cancellation token (and the caller's, see
/// [`CourseHandle::with_cancellation`]). Mutations touching several documents
/// check for cancellation once before their first write and then run to
/// completion.
#[derive(Clone)]
pub struct CourseHandle {
    course_id: String,
    backend: CourseBackend,
    scope: CancelScope,
}

#[derive(Clone)]
enum CourseBackend {
    Live(LiveCourse),
    Snapshot(Arc<SnapshotDriver>),
}

impl CourseHandle {
    pub(crate) fn live(driver: Arc<LiveDriver>, course_id: &str, scope: CancelScope) -> Self {
        Self {
            course_id: course_id.to_string(),
            backend: CourseBackend::Live(LiveCourse {
                driver,
                course_id: course_id.to_string(),
                namespace: course_namespace(course_id),
            }),
            scope,
        }
    }

    pub(crate) fn snapshot(driver: Arc<SnapshotDriver>, scope: CancelScope) -> Self {
        Self {
            course_id: driver.course_id().to_string(),
            backend: CourseBackend::Snapshot(driver),
            scope,
        }
    }

    /// Bind this handle to a caller-owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.scope = self.scope.with_caller(token);
        self
    }

    /// Id of the open course.
    pub fn course_id(&self) -> &str {
        &self.course_id
    }

    /// `true` when served from a snapshot bundle.
    pub fn is_read_only(&self) -> bool {
        matches!(self.backend, CourseBackend::Snapshot(_))
    }

    fn live_for(&self, operation: &str) -> Result<&LiveCourse> {
        self.scope.ensure_open()?;
        match &self.backend {
            CourseBackend::Live(live) => Ok(live),
            CourseBackend::Snapshot(_) => Err(StudyError::read_only(operation)),
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// The course configuration document.
    pub async fn get_config(&self) -> Result<CourseConfig> {
        self.scope
            .race(async {
                match &self.backend {
                    CourseBackend::Live(live) => live.config().await.map(|c| c.value),
                    CourseBackend::Snapshot(snapshot) => Ok(snapshot.config().clone()),
                }
            })
            .await
    }

    /// One card. `NotFound` if it does not exist.
    pub async fn get_card(&self, card_id: &str) -> Result<Card> {
        self.scope
            .race(async {
                match &self.backend {
                    CourseBackend::Live(live) => live.card(card_id).await.map(|c| c.value),
                    CourseBackend::Snapshot(snapshot) => snapshot.card(card_id).await,
                }
            })
            .await
    }

    /// One tag. `NotFound` if it does not exist.
    pub async fn get_tag(&self, name: &str) -> Result<Tag> {
        self.scope
            .race(async {
                match &self.backend {
                    CourseBackend::Live(live) => live.tag(name).await.map(|t| t.value),
                    CourseBackend::Snapshot(snapshot) => snapshot.tag(name).cloned(),
                }
            })
            .await
    }

    /// Ids of the cards carrying `tag`, in tagging order.
    pub async fn list_cards_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        Ok(self.get_tag(tag).await?.tagged_cards)
    }

    /// Every tag of the course, ordered by name.
    pub async fn list_tags(&self) -> Result<Vec<Tag>> {
        self.scope
            .race(async {
                match &self.backend {
                    CourseBackend::Live(live) => {
                        live.driver.list_all(&live.namespace, TAG_DOC_PREFIX).await
                    }
                    CourseBackend::Snapshot(snapshot) => Ok(snapshot.tags().cloned().collect()),
                }
            })
            .await
    }

    /// One page of card ids in key order.
    pub async fn list_card_ids(&self, page: PageRequest) -> Result<Page<String>> {
        validate_page(&page)?;
        let limit = page.limit;
        let ids = self
            .scope
            .race(async {
                match &self.backend {
                    CourseBackend::Live(live) => Ok(live
                        .driver
                        .list_page::<serde_json::Value>(
                            &live.namespace,
                            CARD_DOC_PREFIX,
                            page.start_after,
                            limit,
                        )
                        .await?
                        .into_iter()
                        .map(|(id, _)| id)
                        .collect()),
                    CourseBackend::Snapshot(snapshot) => {
                        Ok(snapshot.card_ids_after(page.start_after.as_deref(), limit))
                    }
                }
            })
            .await?;
        Ok(paginate(ids, limit, |id| id.clone()))
    }

    /// One page of cards in key order.
    pub async fn list_cards(&self, page: PageRequest) -> Result<Page<Card>> {
        validate_page(&page)?;
        let limit = page.limit;
        let cards = self
            .scope
            .race(async {
                match &self.backend {
                    CourseBackend::Live(live) => Ok(live
                        .driver
                        .list_page::<Card>(&live.namespace, CARD_DOC_PREFIX, page.start_after, limit)
                        .await?
                        .into_iter()
                        .map(|(_, card)| card)
                        .collect()),
                    CourseBackend::Snapshot(snapshot) => {
                        let ids = snapshot.card_ids_after(page.start_after.as_deref(), limit);
                        futures::future::try_join_all(ids.iter().map(|id| snapshot.card(id))).await
                    }
                }
            })
            .await?;
        Ok(paginate(cards, limit, |card| card.id.clone()))
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Add a card and register it with each of its tags.
    pub async fn add_card(&self, card: NewCard) -> Result<Card> {
        let live = self.live_for("add a card")?;
        live.add_card(card, &self.scope).await
    }

    /// Remove a card. Removal is terminal; the card's id is also dropped from
    /// every tag that listed it.
    pub async fn remove_card(&self, card_id: &str) -> Result<()> {
        let live = self.live_for("remove a card")?;
        live.remove_card(card_id, &self.scope).await
    }

    /// Create a tag, or return the existing tag of that name.
    pub async fn create_tag(&self, name: &str, author: &str) -> Result<Tag> {
        let live = self.live_for("create a tag")?;
        live.create_tag(name, author, &self.scope).await
    }

    /// Tag a card. With `update_elo`, the card gets a per-tag rating seeded
    /// from its global rating.
    pub async fn add_tag_to_card(&self, card_id: &str, tag: &str, update_elo: bool) -> Result<()> {
        let live = self.live_for("tag a card")?;
        live.add_tag_to_card(card_id, tag, update_elo, &self.scope).await
    }

    /// Untag a card, dropping its per-tag rating.
    pub async fn remove_tag_from_card(&self, card_id: &str, tag: &str) -> Result<()> {
        let live = self.live_for("untag a card")?;
        live.remove_tag_from_card(card_id, tag, &self.scope).await
    }

    /// Replace a card's rating.
    pub async fn update_card_elo(&self, card_id: &str, elo: CardElo) -> Result<Card> {
        let live = self.live_for("update a card rating")?;
        live.update_card_elo(card_id, elo, &self.scope).await
    }
}

fn validate_page(page: &PageRequest) -> Result<()> {
    if page.limit == 0 {
        return Err(StudyError::Validation("page limit must be at least 1".into()));
    }
    Ok(())
}

fn paginate<T>(items: Vec<T>, limit: usize, key: impl Fn(&T) -> String) -> Page<T> {
    let next = if items.len() == limit {
        items.last().map(|last| PageRequest {
            start_after: Some(key(last)),
            limit,
        })
    } else {
        None
    };
    Page { items, next }
}

fn validate_tag_name(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(StudyError::Validation(format!("invalid tag name '{}'", name)));
    }
    Ok(())
}

/// Course operations against the live store.
#[derive(Clone)]
struct LiveCourse {
    driver: Arc<LiveDriver>,
    course_id: String,
    namespace: String,
}

impl LiveCourse {
    async fn config(&self) -> Result<Versioned<CourseConfig>> {
        self.driver.fetch(&self.namespace, COURSE_CONFIG_DOC).await
    }

    async fn card(&self, card_id: &str) -> Result<Versioned<Card>> {
        self.driver.fetch(&self.namespace, card_id).await
    }

    async fn tag(&self, name: &str) -> Result<Versioned<Tag>> {
        self.driver.fetch(&self.namespace, &tag_doc(name)).await
    }

    /// Check that the session may edit this course and return its config.
    async fn authorize(&self, operation: &str) -> Result<(String, CourseConfig)> {
        let username = self.driver.require_session(operation)?;
        let config = self.config().await?.value;
        if !config.can_edit(&username) && !self.driver.session_is_admin() {
            return Err(StudyError::PermissionDenied(format!(
                "'{}' may not {} in course '{}'",
                username, operation, self.course_id
            )));
        }
        Ok((username, config))
    }

    async fn add_card(&self, new: NewCard, scope: &CancelScope) -> Result<Card> {
        let (_, config) = scope.race(self.authorize("add a card")).await?;
        if !config.accepts_shape(&new.shape) {
            return Err(StudyError::Validation(format!(
                "course '{}' has no data shape '{}'",
                self.course_id, new.shape
            )));
        }
        let mut tags: Vec<String> = Vec::new();
        for tag in new.tags {
            validate_tag_name(&tag)?;
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        let card = Card {
            id: format!("{}{}", CARD_DOC_PREFIX, uuid::Uuid::now_v7().simple()),
            course_id: self.course_id.clone(),
            shape: new.shape,
            fields: new.fields,
            tags,
            author: new.author,
            elo: CardElo::new(new.elo_hint.unwrap_or(DEFAULT_ELO)),
            created_at: Utc::now(),
            updated_at: None,
        };

        scope.check()?;
        let stored = self.driver.put(&self.namespace, &card.id, &card, None).await?;
        for tag in &stored.tags {
            self.link_tag(tag, &stored.id, &stored.author).await?;
        }
        log::debug!("Added card {} to course {}", stored.id, self.course_id);
        Ok(stored)
    }

    async fn remove_card(&self, card_id: &str, scope: &CancelScope) -> Result<()> {
        let card = scope
            .race(async {
                self.authorize("remove a card").await?;
                self.card(card_id).await
            })
            .await?;

        scope.check()?;
        self.driver.delete(&self.namespace, card_id, &card.rev).await?;
        for tag in &card.value.tags {
            self.unlink_tag(tag, card_id).await?;
        }
        log::debug!("Removed card {} from course {}", card_id, self.course_id);
        Ok(())
    }

    async fn create_tag(&self, name: &str, author: &str, scope: &CancelScope) -> Result<Tag> {
        validate_tag_name(name)?;
        scope.race(self.authorize("create a tag")).await?;
        scope.check()?;
        let created = self
            .driver
            .modify::<Tag, _>(&self.namespace, &tag_doc(name), |current| match current {
                Some(_) => Ok(None),
                None => Ok(Some(Tag::new(name, self.course_id.as_str(), author))),
            })
            .await?;
        match created {
            Some(tag) => Ok(tag),
            None => self.tag(name).await.map(|t| t.value),
        }
    }

    async fn add_tag_to_card(
        &self,
        card_id: &str,
        tag: &str,
        update_elo: bool,
        scope: &CancelScope,
    ) -> Result<()> {
        validate_tag_name(tag)?;
        let username = scope
            .race(async {
                let (username, _) = self.authorize("tag a card").await?;
                self.card(card_id).await?;
                Ok(username)
            })
            .await?;

        scope.check()?;
        self.driver
            .modify::<Card, _>(&self.namespace, card_id, |current| {
                let mut card = current.ok_or_else(|| StudyError::NotFound(card_id.to_string()))?;
                let mut changed = false;
                if !card.has_tag(tag) {
                    card.tags.push(tag.to_string());
                    changed = true;
                }
                if update_elo && !card.elo.tags.contains_key(tag) {
                    let global = card.elo.global;
                    card.elo.tags.insert(tag.to_string(), global);
                    changed = true;
                }
                Ok(changed.then_some(card))
            })
            .await?;
        self.link_tag(tag, card_id, &username).await
    }

    async fn remove_tag_from_card(&self, card_id: &str, tag: &str, scope: &CancelScope) -> Result<()> {
        scope
            .race(async {
                self.authorize("untag a card").await?;
                self.card(card_id).await
            })
            .await?;

        scope.check()?;
        self.driver
            .modify::<Card, _>(&self.namespace, card_id, |current| {
                let mut card = current.ok_or_else(|| StudyError::NotFound(card_id.to_string()))?;
                if !card.has_tag(tag) {
                    return Ok(None);
                }
                card.tags.retain(|t| t != tag);
                card.elo.tags.remove(tag);
                Ok(Some(card))
            })
            .await?;
        self.unlink_tag(tag, card_id).await
    }

    async fn update_card_elo(&self, card_id: &str, elo: CardElo, scope: &CancelScope) -> Result<Card> {
        scope.race(self.authorize("update a card rating")).await?;
        scope.check()?;
        let updated = self
            .driver
            .modify::<Card, _>(&self.namespace, card_id, |current| {
                let mut card = current.ok_or_else(|| StudyError::NotFound(card_id.to_string()))?;
                card.elo = elo.clone();
                Ok(Some(card))
            })
            .await?;
        updated.ok_or_else(|| StudyError::NotFound(card_id.to_string()))
    }

    /// Append `card_id` to a tag, creating the tag on first use.
    async fn link_tag(&self, tag: &str, card_id: &str, author: &str) -> Result<()> {
        self.driver
            .modify::<Tag, _>(&self.namespace, &tag_doc(tag), |current| {
                let mut record = current.unwrap_or_else(|| Tag::new(tag, self.course_id.as_str(), author));
                if record.tagged_cards.iter().any(|id| id == card_id) {
                    return Ok(None);
                }
                record.tagged_cards.push(card_id.to_string());
                Ok(Some(record))
            })
            .await?;
        Ok(())
    }

    async fn unlink_tag(&self, tag: &str, card_id: &str) -> Result<()> {
        self.driver
            .modify::<Tag, _>(&self.namespace, &tag_doc(tag), |current| {
                let Some(mut record) = current else {
                    return Ok(None);
                };
                let before = record.tagged_cards.len();
                record.tagged_cards.retain(|id| id != card_id);
                Ok((record.tagged_cards.len() != before).then_some(record))
            })
            .await?;
        Ok(())
    }
}
