//! Core type definitions for the Kindred engine.
//!
//! Identity newtypes, the relationship stage ladder, and the action
//! vocabulary the trigger evaluator consumes. All types are serializable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity Types
// ---------------------------------------------------------------------------

/// Unique identifier for a user, supplied by the identity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    /// Create a new random user ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a persona the user holds a relationship with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersonaId(pub Uuid);

impl PersonaId {
    /// Create a new random persona ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PersonaId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PersonaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a scheduled narrative event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    /// Create a new random event ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authored identifier of an episode (static content, e.g. `"first_spark"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeId(pub String);

impl EpisodeId {
    /// Wrap an authored episode name.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl From<&str> for EpisodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authored identifier of a scene within an episode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SceneId(pub String);

impl From<&str> for SceneId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SceneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authored identifier of a trigger rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub String);

impl From<&str> for RuleId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Relationship Stage
// ---------------------------------------------------------------------------

/// Coarse relationship category, derived from affection via the ordered
/// thresholds in [`crate::config::StageLadder`]. Variant order matters:
/// `PartialOrd` follows progression.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Fresh relationship, nothing unlocked beyond the seed episode.
    Stranger,
    /// A few interactions in.
    Acquaintance,
    /// Regular back-and-forth.
    Friend,
    /// Trusted confidant.
    Confidant,
    /// Deepest available stage.
    Partner,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stranger => "stranger",
            Self::Acquaintance => "acquaintance",
            Self::Friend => "friend",
            Self::Confidant => "confidant",
            Self::Partner => "partner",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// Mood
// ---------------------------------------------------------------------------

/// Self-reported user mood attached to messaging actions. Certain moods can
/// force a trigger rule to fire unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    /// No particular mood.
    Neutral,
    /// Upbeat.
    Happy,
    /// Seeking company.
    Lonely,
    /// Down.
    Sad,
    /// Teasing.
    Playful,
    /// Irritated.
    Annoyed,
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Payload of a user action, tagged by action type.
///
/// The enumeration is closed over the action types the trigger evaluator
/// knows; anything else deserializes into [`ActionData::Unknown`] so that
/// newer clients don't break older servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionData {
    /// Free-form chat message sent to the persona.
    Message {
        /// Message text.
        text: String,
        /// Self-reported mood.
        mood: Mood,
    },
    /// The user opened the app.
    AppOpened {
        /// Self-reported mood, when the client provides one.
        #[serde(default)]
        mood: Option<Mood>,
    },
    /// The user sent the persona a gift.
    GiftSent {
        /// Catalog identifier of the gift.
        gift_id: String,
    },
    /// The user finished an episode.
    EpisodeFinished {
        /// Which episode.
        episode: EpisodeId,
    },
    /// Action type this build doesn't recognize. Recorded but matches no
    /// trigger rule.
    #[serde(other)]
    Unknown,
}

impl ActionData {
    /// The action-type tag used for trigger rule matching.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::AppOpened { .. } => "app_opened",
            Self::GiftSent { .. } => "gift_sent",
            Self::EpisodeFinished { .. } => "episode_finished",
            Self::Unknown => "unknown",
        }
    }

    /// The mood carried by this action, if any.
    #[must_use]
    pub fn mood(&self) -> Option<Mood> {
        match self {
            Self::Message { mood, .. } => Some(*mood),
            Self::AppOpened { mood } => *mood,
            _ => None,
        }
    }
}

/// An incoming user action as the trigger evaluator sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    /// Authenticated user.
    pub user: UserId,
    /// Persona the action is directed at.
    pub persona: PersonaId,
    /// Typed payload.
    pub data: ActionData,
    /// When the action was accepted.
    pub at: DateTime<Utc>,
}

impl ActionEvent {
    /// Build an action stamped with the current wall-clock time.
    #[must_use]
    pub fn now(user: UserId, persona: PersonaId, data: ActionData) -> Self {
        Self {
            user,
            persona,
            data,
            at: Utc::now(),
        }
    }
}
