//! # Kindred Core
//!
//! Relationship progression and narrative event scheduling engine.
//!
//! Every (user, persona) pair gets a durable [`RelationshipState`]:
//! affection, stage, unlocked and completed episodes, and free-form story
//! flags. Incoming actions run through the declarative
//! [`trigger::TriggerEvaluator`], which may schedule a single future
//! narrative event (a delayed in-character message, an episode invite).
//! Delivery is pull-based: clients ask the [`store::EngineStore`] what's
//! due and events become due retroactively after any offline stretch. The
//! [`scenario::ScenarioResolver`] drives scripted episodes beat by beat,
//! folding choices back into relationship state.
//!
//! ## Concurrency contract
//!
//! Every operation is a bounded synchronous read/write against SQLite.
//! Affection deltas for one key serialize through a version counter with
//! bounded retries; event delivery transitions are compare-and-set, so
//! concurrent polls deliver each event exactly once.

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod activity;
pub mod config;
pub mod error;
pub mod relationship;
pub mod scenario;
pub mod scheduler;
pub mod store;
pub mod trigger;
pub mod types;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use relationship::{EpisodePosition, FlagMutations, RelationshipState};
pub use scenario::{BeatView, EpisodeLibrary, ScenarioResolver};
pub use scheduler::{EventStatus, ScheduledEvent};
pub use store::EngineStore;
pub use trigger::{TriggerEvaluator, TriggerSet};
pub use types::*;
