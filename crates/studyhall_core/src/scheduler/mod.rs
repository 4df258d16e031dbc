//! Study session scheduling.
//!
//! [`Scheduler::schedule`] turns a time budget into an ordered list of study
//! items for one learner in one course:
//!
//! 1. The budget becomes an item count, `budget / expected_seconds_per_item`.
//! 2. Candidates are the course's cards matching the tag filter.
//! 3. Due reviews among the candidates come first, up to
//!    `count * review_ratio`.
//! 4. Unseen cards fill the remaining slots, ranked by a [`CandidateRanker`]
//!    toward the learner's rating (or the requested difficulty).
//! 5. If unseen cards run out, further due reviews take the leftover slots.
//!
//! What makes a review "due" is decided elsewhere; the scheduler only reads
//! the due dates through [`LearnerProgress`].

mod ranking;
mod tag_filter;

pub use ranking::{Candidate, CandidateRanker, EloProximityRanker};
pub use tag_filter::TagFilter;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::data::CourseHandle;
use crate::error::{Result, StudyError};
use crate::fs::BoxFuture;
use crate::model::{Card, PageRequest, ScheduledReview};

/// What the scheduler needs to know about a learner.
pub trait LearnerProgress: Send + Sync {
    /// The learner's rating in an active registration for `course_id`.
    fn course_elo<'a>(&'a self, course_id: &'a str) -> BoxFuture<'a, Result<Option<f64>>>;

    /// Cards of `course_id` the learner has been shown.
    fn seen_cards<'a>(&'a self, course_id: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;

    /// Reviews due at `now`, earliest first.
    fn due_reviews<'a>(
        &'a self,
        course_id: &'a str,
        now: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<Vec<ScheduledReview>>>;
}

/// Requested difficulty of new material.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DifficultyPreference {
    /// Only new cards rated within `[min, max]`.
    Range {
        /// Lowest accepted rating.
        min: f64,
        /// Highest accepted rating.
        max: f64,
    },
    /// Prefer new cards rated near `elo`.
    Target {
        /// Rating to aim for.
        elo: f64,
    },
}

/// Parameters of one study session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Restrict candidates to cards matching this filter.
    pub tag_filter: Option<TagFilter>,
    /// Override the learner's rating as the difficulty target.
    pub difficulty: Option<DifficultyPreference>,
    /// Length of the session in seconds.
    pub time_budget_secs: u64,
    /// Reference time for due reviews.
    pub now: DateTime<Utc>,
}

impl SessionRequest {
    /// A session of `time_budget_secs` over the whole course, due as of now.
    pub fn new(time_budget_secs: u64) -> Self {
        Self {
            tag_filter: None,
            difficulty: None,
            time_budget_secs,
            now: Utc::now(),
        }
    }

    /// Only schedule cards matching `filter`.
    pub fn with_filter(mut self, filter: TagFilter) -> Self {
        self.tag_filter = Some(filter);
        self
    }

    /// Target `difficulty` instead of the learner's rating.
    pub fn with_difficulty(mut self, difficulty: DifficultyPreference) -> Self {
        self.difficulty = Some(difficulty);
        self
    }

    /// Evaluate due reviews as of `now`.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

/// Why a card is part of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Not yet seen by the learner.
    New,
    /// Due for review.
    Review,
}

/// One entry of a study session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudySessionItem {
    /// Course the card belongs to.
    pub course_id: String,
    /// Scheduled card.
    pub card_id: String,
    /// New material or a review.
    pub kind: ItemKind,
    /// Global rating of the card.
    pub elo: f64,
    /// Tags of the card.
    pub tags: Vec<String>,
    /// Shape of the card, for picking a renderer.
    pub shape: String,
}

impl StudySessionItem {
    fn from_card(card: &Card, kind: ItemKind) -> Self {
        Self {
            course_id: card.course_id.clone(),
            card_id: card.id.clone(),
            kind,
            elo: card.elo.global,
            tags: card.tags.clone(),
            shape: card.shape.clone(),
        }
    }
}

/// Builds study sessions for one learner and course.
pub struct Scheduler {
    config: SchedulerConfig,
    ranker: Arc<dyn CandidateRanker>,
}

impl Scheduler {
    /// Create a scheduler using the default [`EloProximityRanker`].
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let ranker = Arc::new(EloProximityRanker::new(config.elo_band_width, config.tie_break));
        Ok(Self { config, ranker })
    }

    /// Replace the ranking strategy (builder pattern).
    pub fn with_ranker(mut self, ranker: Arc<dyn CandidateRanker>) -> Self {
        self.ranker = ranker;
        self
    }

    /// Settings this scheduler was built with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Number of items a budget allows.
    pub fn item_count(&self, time_budget_secs: u64) -> usize {
        (time_budget_secs / u64::from(self.config.expected_seconds_per_item)) as usize
    }

    /// Build a study session. An empty session is a valid result.
    pub async fn schedule(
        &self,
        course: &CourseHandle,
        learner: &dyn LearnerProgress,
        request: SessionRequest,
    ) -> Result<Vec<StudySessionItem>> {
        if let Some(DifficultyPreference::Range { min, max }) = request.difficulty
            && (min.is_nan() || max.is_nan() || min > max)
        {
            return Err(StudyError::Validation(format!(
                "difficulty range [{}, {}] is empty",
                min, max
            )));
        }

        let count = self.item_count(request.time_budget_secs);
        if count == 0 {
            return Ok(Vec::new());
        }

        let candidates = self.candidates(course, request.tag_filter.as_ref()).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let course_id = course.course_id();
        let seen: HashSet<String> = learner.seen_cards(course_id).await?.into_iter().collect();
        let due = learner.due_reviews(course_id, request.now).await?;

        let by_id: HashMap<&str, &Card> = candidates.iter().map(|c| (c.id.as_str(), c)).collect();
        let mut reviews: Vec<&Card> = Vec::new();
        for review in &due {
            if let Some(&card) = by_id.get(review.card_id.as_str())
                && !reviews.iter().any(|r| r.id == card.id)
            {
                reviews.push(card);
            }
        }
        let due_ids: HashSet<&str> = reviews.iter().map(|c| c.id.as_str()).collect();

        let review_quota = ((count as f64) * self.config.review_ratio).floor() as usize;
        let first_reviews = reviews.len().min(review_quota).min(count);

        let fresh: Vec<Candidate> = candidates
            .iter()
            .enumerate()
            .filter(|(_, card)| !seen.contains(&card.id) && !due_ids.contains(card.id.as_str()))
            .filter(|(_, card)| match request.difficulty {
                Some(DifficultyPreference::Range { min, max }) => {
                    (min..=max).contains(&card.elo.global)
                }
                _ => true,
            })
            .map(|(position, card)| Candidate {
                card: card.clone(),
                position,
            })
            .collect();

        let target = self.target_elo(course_id, learner, request.difficulty, &fresh).await?;
        let new_slots = count - first_reviews;
        let ranked = match target {
            Some(target) => self.ranker.rank(fresh, target),
            None => fresh,
        };

        let mut items: Vec<StudySessionItem> = reviews[..first_reviews]
            .iter()
            .map(|card| StudySessionItem::from_card(card, ItemKind::Review))
            .collect();
        items.extend(
            ranked
                .iter()
                .take(new_slots)
                .map(|c| StudySessionItem::from_card(&c.card, ItemKind::New)),
        );
        let leftover = count - items.len();
        items.extend(
            reviews[first_reviews..]
                .iter()
                .take(leftover)
                .map(|card| StudySessionItem::from_card(card, ItemKind::Review)),
        );

        log::debug!(
            "Scheduled {} items for course {} ({} due, {} new candidates)",
            items.len(),
            course_id,
            reviews.len(),
            ranked.len()
        );
        Ok(items)
    }

    /// Cards matching `filter`, in enumeration order.
    async fn candidates(&self, course: &CourseHandle, filter: Option<&TagFilter>) -> Result<Vec<Card>> {
        let matches = |card: &Card| filter.is_none_or(|f| f.matches(&card.tags));

        if let Some(anchors) = filter.and_then(TagFilter::anchor_tags) {
            let mut ids: Vec<String> = Vec::new();
            for tag in &anchors {
                match course.list_cards_by_tag(tag).await {
                    Ok(tagged) => {
                        for id in tagged {
                            if !ids.contains(&id) {
                                ids.push(id);
                            }
                        }
                    }
                    Err(StudyError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }

            let mut cards = Vec::with_capacity(ids.len());
            for id in ids {
                match course.get_card(&id).await {
                    Ok(card) if matches(&card) => cards.push(card),
                    Ok(_) => {}
                    Err(StudyError::NotFound(_)) => {
                        log::debug!("Card {} disappeared during scheduling", id);
                    }
                    Err(e) => return Err(e),
                }
            }
            return Ok(cards);
        }

        let mut cards = Vec::new();
        let mut page = Some(PageRequest::first(self.config.page_size));
        while let Some(request) = page {
            let result = course.list_cards(request).await?;
            cards.extend(result.items.into_iter().filter(|card| matches(card)));
            page = result.next;
        }
        Ok(cards)
    }

    /// Rating new cards are ranked toward: the requested target, else the
    /// learner's course rating (clamped into a requested range), else the
    /// median of the candidates.
    async fn target_elo(
        &self,
        course_id: &str,
        learner: &dyn LearnerProgress,
        difficulty: Option<DifficultyPreference>,
        fresh: &[Candidate],
    ) -> Result<Option<f64>> {
        if let Some(DifficultyPreference::Target { elo }) = difficulty {
            return Ok(Some(elo));
        }
        let base = match learner.course_elo(course_id).await? {
            Some(elo) => Some(elo),
            None => ranking::median_elo(fresh),
        };
        Ok(match difficulty {
            Some(DifficultyPreference::Range { min, max }) => base.map(|elo| elo.clamp(min, max)),
            _ => base,
        })
    }
}
