//! Error types for the Kindred engine.
//!
//! No failure here is fatal to the process; everything is per-request.

use thiserror::Error;

use crate::types::{EpisodeId, EventId, PersonaId, UserId};

/// Top-level error type for all engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No relationship state exists for this (user, persona) pair.
    /// Only raised by pure reads; mutating paths create default state.
    #[error("No relationship state for user {user} / persona {persona}")]
    StateNotFound {
        /// The user queried.
        user: UserId,
        /// The persona queried.
        persona: PersonaId,
    },

    /// Referenced episode does not exist in the content library.
    #[error("Unknown episode: {0}")]
    UnknownEpisode(EpisodeId),

    /// Referenced scheduled event does not exist.
    #[error("Unknown event: {0}")]
    UnknownEvent(EventId),

    /// The episode's unlock gate is unmet. User-actionable, not an anomaly.
    #[error("Episode locked: {0}")]
    Locked(EpisodeId),

    /// Unlock requires a token deduction the economy gate refused.
    #[error("Payment required to unlock episode {0}")]
    PaymentRequired(EpisodeId),

    /// The submitted choice is not among the current beat's options.
    #[error("Invalid choice '{choice}' in episode {episode}")]
    InvalidChoice {
        /// The episode being played.
        episode: EpisodeId,
        /// The rejected option id.
        choice: String,
    },

    /// The current beat is a choice point; it cannot be skipped.
    #[error("A choice is required at the current beat of episode {0}")]
    ChoiceRequired(EpisodeId),

    /// The event was already delivered (or cancelled); the concurrent
    /// caller that won the compare-and-set got the content.
    #[error("Event already delivered: {0}")]
    AlreadyDelivered(EventId),

    /// Compare-and-set retries exhausted on a contended row.
    #[error("Store contention on {operation}, retries exhausted")]
    Busy {
        /// Which operation gave up.
        operation: &'static str,
    },

    /// An external collaborator could not be reached. Transient; safe to
    /// retry from the caller side.
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),

    /// SQLite persistence error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration or content-definition error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, EngineError>;
