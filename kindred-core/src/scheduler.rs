//! Scheduled narrative events.
//!
//! The scheduler is a durable queue of future-dated events with pull-based
//! delivery: nothing ticks, callers ask "what's due" and due-ness is a
//! query against stored timestamps. Events created while a client is
//! offline simply become due retroactively. The storage operations live on
//! [`crate::store::EngineStore`]; this module owns the event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EventId, PersonaId, RuleId, UserId};

/// Delivery status of a scheduled event.
///
/// Lifecycle: `Pending` → `Delivered` (exactly once, compare-and-set
/// guarded) or `Pending` → `Cancelled` when superseded. Terminal states
/// never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Waiting for its due time.
    Pending,
    /// Handed to a caller; not revocable.
    Delivered,
    /// Superseded before delivery.
    Cancelled,
}

impl EventStatus {
    /// Stable string form used in the database.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the database string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "delivered" => Some(Self::Delivered),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A future-dated narrative event, exclusively owned by the scheduler.
/// Read-only to callers once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    /// Event id.
    pub id: EventId,
    /// Recipient user.
    pub user: UserId,
    /// Persona the event speaks as.
    pub persona: PersonaId,
    /// Renderer-facing event type (`delayed_message`, `episode_invite`, ...).
    pub event_type: String,
    /// When the event becomes due.
    pub scheduled_for: DateTime<Utc>,
    /// Opaque renderer payload.
    pub payload: serde_json::Value,
    /// Delivery status.
    pub status: EventStatus,
    /// The trigger rule that created this event, when one did.
    pub trigger_rule: Option<RuleId>,
}

impl ScheduledEvent {
    /// Whether the event is due at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Pending && self.scheduled_for <= now
    }
}
