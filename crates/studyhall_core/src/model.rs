//! Course, card, tag, learner and classroom records.
//!
//! These types are the backend-independent shape of course data. The live driver
//! stores them as JSON document bodies and the static packer writes them verbatim
//! as bundle resources, so a card read from either backend compares equal.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Starting rating for cards and learners without history.
pub const DEFAULT_ELO: f64 = 1000.0;

/// Document id of a course's configuration document.
pub const COURSE_CONFIG_DOC: &str = "CourseConfig";
/// Prefix of card document ids.
pub const CARD_DOC_PREFIX: &str = "c-";
/// Prefix of tag document ids.
pub const TAG_DOC_PREFIX: &str = "TAG-";

/// Document id of a tag.
pub fn tag_doc(name: &str) -> String {
    format!("{}{}", TAG_DOC_PREFIX, name)
}

/// Prefix of every course namespace.
pub const COURSE_NAMESPACE_PREFIX: &str = "coursedb-";
/// Prefix of every classroom namespace.
pub const CLASSROOM_NAMESPACE_PREFIX: &str = "classdb-";

/// Namespace holding a course's documents.
pub fn course_namespace(course_id: &str) -> String {
    format!("{}{}", COURSE_NAMESPACE_PREFIX, course_id)
}

/// Namespace holding a classroom's documents.
pub fn classroom_namespace(classroom_id: &str) -> String {
    format!("{}{}", CLASSROOM_NAMESPACE_PREFIX, classroom_id)
}

/// Prefix of account ids in the account-event log.
pub const ACCOUNT_ID_PREFIX: &str = "org.couchdb.user:";

/// Account-log id of `username`.
pub fn account_id(username: &str) -> String {
    format!("{}{}", ACCOUNT_ID_PREFIX, username)
}

/// Username behind an account-log id; `None` for other ids or an empty name.
pub fn username_from_account_id(account_id: &str) -> Option<&str> {
    account_id
        .strip_prefix(ACCOUNT_ID_PREFIX)
        .filter(|name| !name.is_empty())
}

/// Prefix of per-user namespaces.
pub const USER_NAMESPACE_PREFIX: &str = "userdb-";

/// Private namespace of `username`: the prefix followed by the hex-encoded
/// UTF-8 bytes of the name.
pub fn user_namespace(username: &str) -> String {
    format!("{}{}", USER_NAMESPACE_PREFIX, hex::encode(username.as_bytes()))
}

/// Inverse of [`user_namespace`]; `None` for names that are not user namespaces.
pub fn username_from_namespace(namespace: &str) -> Option<String> {
    let encoded = namespace.strip_prefix(USER_NAMESPACE_PREFIX)?;
    String::from_utf8(hex::decode(encoded).ok()?).ok()
}

/// A content shape a course accepts cards for (e.g. `"math.SingleDigitAddition"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataShape {
    /// Shape identifier, unique within a course.
    pub name: String,
    /// Question types able to render this shape.
    #[serde(default)]
    pub question_types: Vec<String>,
}

impl DataShape {
    /// A shape with no registered question types.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            question_types: Vec::new(),
        }
    }
}

/// Course configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseConfig {
    /// Unique course id, also the suffix of its namespace.
    pub course_id: String,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Username of the account that created the course.
    pub creator: String,
    /// Usernames allowed to administer the course.
    #[serde(default)]
    pub admins: Vec<String>,
    /// Usernames allowed to moderate content.
    #[serde(default)]
    pub moderators: Vec<String>,
    /// Shapes cards of this course may take.
    #[serde(default)]
    pub data_shapes: Vec<DataShape>,
    /// Whether guests may read the course.
    #[serde(default)]
    pub public: bool,
    /// Set on every write after creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CourseConfig {
    /// Create a minimal configuration owned by `creator`.
    pub fn new(course_id: impl Into<String>, name: impl Into<String>, creator: impl Into<String>) -> Self {
        Self {
            course_id: course_id.into(),
            name: name.into(),
            description: String::new(),
            creator: creator.into(),
            admins: Vec::new(),
            moderators: Vec::new(),
            data_shapes: Vec::new(),
            public: false,
            updated_at: None,
        }
    }

    /// Register a content shape (builder pattern).
    pub fn with_shape(mut self, shape: impl Into<String>) -> Self {
        self.data_shapes.push(DataShape::new(shape));
        self
    }

    /// Whether `username` may mutate this course.
    pub fn can_edit(&self, username: &str) -> bool {
        self.creator == username
            || self.admins.iter().any(|a| a == username)
            || self.moderators.iter().any(|m| m == username)
    }

    /// Whether cards of `shape` may be added.
    pub fn accepts_shape(&self, shape: &str) -> bool {
        self.data_shapes.iter().any(|s| s.name == shape)
    }
}

/// Difficulty rating of a card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardElo {
    /// Course-wide rating.
    pub global: f64,
    /// Number of rated interactions behind `global`.
    #[serde(default)]
    pub count: u32,
    /// Per-tag ratings, seeded from `global` when a tag is attached with elo update.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, f64>,
}

impl CardElo {
    /// A rating with no history and no per-tag entries.
    pub fn new(global: f64) -> Self {
        Self {
            global,
            count: 0,
            tags: BTreeMap::new(),
        }
    }
}

impl Default for CardElo {
    fn default() -> Self {
        Self::new(DEFAULT_ELO)
    }
}

/// An atomic unit of study content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    /// Card id, unique within the course.
    pub id: String,
    /// Owning course.
    pub course_id: String,
    /// Name of the card's [`DataShape`].
    pub shape: String,
    /// Shape-specific content.
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// Attached tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Username of the author.
    pub author: String,
    /// Difficulty rating.
    #[serde(default)]
    pub elo: CardElo,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Card {
    /// Whether `tag` is attached to this card.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// A course-scoped classifier. `tagged_cards` keeps insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    /// Tag name, unique within the course.
    pub name: String,
    /// Owning course.
    pub course_id: String,
    /// Username of the author.
    pub author: String,
    /// Ids of the tagged cards.
    #[serde(default)]
    pub tagged_cards: Vec<String>,
    /// Time of the last update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Tag {
    /// An empty tag.
    pub fn new(name: impl Into<String>, course_id: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            course_id: course_id.into(),
            author: author.into(),
            tagged_cards: Vec::new(),
            updated_at: None,
        }
    }
}

/// Fields of a new card (the `addCard` arguments minus the course).
#[derive(Debug, Clone, Default)]
pub struct NewCard {
    /// Name of the card's [`DataShape`].
    pub shape: String,
    /// Shape-specific content.
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// Username of the author.
    pub author: String,
    /// Attached tags.
    pub tags: Vec<String>,
    /// Initial rating; [`DEFAULT_ELO`] when absent.
    pub elo_hint: Option<f64>,
}

impl NewCard {
    /// A card of `shape` with no fields or tags.
    pub fn new(shape: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            shape: shape.into(),
            author: author.into(),
            ..Default::default()
        }
    }

    /// Set one content field.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Attach a tag on creation.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Start the card at `elo`.
    pub fn elo(mut self, elo: f64) -> Self {
        self.elo_hint = Some(elo);
        self
    }
}

/// Cursor-based page request used by every paginated listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    /// Return entries strictly after this key.
    pub start_after: Option<String>,
    /// Maximum number of entries to return.
    pub limit: usize,
}

impl PageRequest {
    /// The first page of a listing.
    pub fn first(limit: usize) -> Self {
        Self {
            start_after: None,
            limit,
        }
    }
}

/// One page of results plus the cursor for the next one.
#[derive(Debug, Clone)]
pub struct Page<T> {
    /// Entries of this page, in key order.
    pub items: Vec<T>,
    /// `None` once the listing is exhausted.
    pub next: Option<PageRequest>,
}

// ============================================================================
// Learner records (stored in the learner's private namespace)
// ============================================================================

/// Document id of a learner's course registrations.
pub const REGISTRATIONS_DOC: &str = "CourseRegistrations";

/// Document id of a card history record.
pub fn card_history_doc(course_id: &str, card_id: &str) -> String {
    format!("cardH-{}-{}", course_id, card_id)
}

/// Document id of a scheduled review.
pub fn scheduled_review_doc(course_id: &str, card_id: &str) -> String {
    format!("sr-{}-{}", course_id, card_id)
}

/// Whether a learner still follows a course.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    /// Registered and studying.
    Active,
    /// Dropped by the learner; history is kept.
    Dropped,
}

/// A learner's registration in one course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseRegistration {
    /// Owning course.
    pub course_id: String,
    /// The learner's estimated skill in this course.
    pub elo: f64,
    /// Current state of the registration.
    pub status: RegistrationStatus,
}

/// Every course registration of one learner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CourseRegistrations {
    /// One entry per course, dropped ones included.
    #[serde(default)]
    pub courses: Vec<CourseRegistration>,
}

/// One presentation of a card to a learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardRecord {
    /// When the card was shown.
    pub presented_at: DateTime<Utc>,
    /// Outcome, when the card was answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct: Option<bool>,
    /// Time spent on the card.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_spent_ms: Option<u64>,
}

/// All presentations of one card to one learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardHistory {
    /// Owning course.
    pub course_id: String,
    /// Card the record refers to.
    pub card_id: String,
    /// Oldest first.
    #[serde(default)]
    pub records: Vec<CardRecord>,
}

/// A review due date produced by the (external) spaced-repetition policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledReview {
    /// Owning course.
    pub course_id: String,
    /// Card the record refers to.
    pub card_id: String,
    /// When the review becomes due.
    pub review_time: DateTime<Utc>,
}

// ============================================================================
// Classrooms
// ============================================================================

/// Document id of a classroom's configuration.
pub const CLASSROOM_CONFIG_DOC: &str = "ClassroomConfig";

/// Material assigned to a classroom.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssignedContent {
    /// A whole course.
    Course {
        /// Assigned course.
        course_id: String,
    },
    /// The cards of one tag within a course.
    Tag {
        /// Course holding the tag.
        course_id: String,
        /// Assigned tag.
        tag: String,
    },
}

/// Classroom configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassroomConfig {
    /// Unique classroom id.
    pub classroom_id: String,
    /// Display name.
    pub name: String,
    /// Usernames of the teachers.
    #[serde(default)]
    pub teachers: Vec<String>,
    /// Usernames of the enrolled students.
    #[serde(default)]
    pub students: Vec<String>,
    /// Material assigned to the students.
    #[serde(default)]
    pub assigned_content: Vec<AssignedContent>,
}

impl ClassroomConfig {
    /// A classroom taught by `teacher` with no students.
    pub fn new(classroom_id: impl Into<String>, name: impl Into<String>, teacher: impl Into<String>) -> Self {
        Self {
            classroom_id: classroom_id.into(),
            name: name.into(),
            teachers: vec![teacher.into()],
            students: Vec::new(),
            assigned_content: Vec::new(),
        }
    }

    /// Whether `username` teaches this classroom.
    pub fn is_teacher(&self, username: &str) -> bool {
        self.teachers.iter().any(|t| t == username)
    }

    /// Whether `username` teaches or studies here.
    pub fn is_member(&self, username: &str) -> bool {
        self.is_teacher(username) || self.students.iter().any(|s| s == username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_course_editors() {
        let mut config = CourseConfig::new("c1", "Algebra", "alice");
        config.moderators.push("bob".into());

        assert!(config.can_edit("alice"));
        assert!(config.can_edit("bob"));
        assert!(!config.can_edit("mallory"));
    }

    #[test]
    fn test_card_json_uses_camel_case() {
        let card = Card {
            id: "c-1".into(),
            course_id: "c1".into(),
            shape: "math.Addition".into(),
            fields: serde_json::Map::new(),
            tags: vec!["algebra".into()],
            author: "alice".into(),
            elo: CardElo::new(1200.0),
            created_at: DateTime::from_timestamp(0, 0).unwrap(),
            updated_at: None,
        };
        let json = serde_json::to_value(&card).unwrap();
        assert_eq!(json["courseId"], "c1");
        assert_eq!(json["elo"]["global"], 1200.0);
        assert!(json.get("updatedAt").is_none());
    }

    #[test]
    fn test_user_namespace_is_hex_encoded() {
        assert_eq!(user_namespace("alice"), "userdb-616c696365");
        assert_eq!(
            username_from_namespace("userdb-616c696365").as_deref(),
            Some("alice")
        );
        assert_eq!(username_from_namespace("userdb-zz"), None);
        assert_eq!(username_from_namespace("coursedb-c1"), None);
    }

    #[test]
    fn test_assigned_content_is_tagged() {
        let content = AssignedContent::Tag {
            course_id: "c1".into(),
            tag: "algebra".into(),
        };
        let json = serde_json::to_value(&content).unwrap();
        assert_eq!(json["kind"], "tag");
    }
}
