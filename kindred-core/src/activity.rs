//! Append-only activity log.
//!
//! Every handled action is recorded here. Trigger rules may read recent
//! entries as lookback condition inputs (e.g. "quiet for N hours"); the
//! evaluator never writes to the log itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ActionEvent, PersonaId, UserId};

/// One recorded action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    /// Acting user.
    pub user: UserId,
    /// Persona targeted.
    pub persona: PersonaId,
    /// Action-type tag (`message`, `app_opened`, ...).
    pub kind: String,
    /// Raw action payload, kept as JSON for forward compatibility.
    pub data: serde_json::Value,
    /// When the action was accepted.
    pub at: DateTime<Utc>,
}

impl ActivityEntry {
    /// Build a log entry from an accepted action.
    ///
    /// # Errors
    /// Returns [`crate::EngineError::Serialization`] if the payload cannot
    /// be encoded.
    pub fn from_action(action: &ActionEvent) -> crate::error::Result<Self> {
        let data = serde_json::to_value(&action.data)
            .map_err(|e| crate::EngineError::Serialization(e.to_string()))?;
        Ok(Self {
            user: action.user,
            persona: action.persona,
            kind: action.data.kind().to_string(),
            data,
            at: action.at,
        })
    }
}

/// Most recent activity timestamp in a slice of entries, if any.
#[must_use]
pub fn latest_activity(entries: &[ActivityEntry]) -> Option<DateTime<Utc>> {
    entries.iter().map(|e| e.at).max()
}
