//! Relationship state, the one mutable shared resource in the engine.
//!
//! One record per (user, persona). Affection drives the stage and unlock
//! eligibility; the unlocked/completed episode sets only ever grow.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::StageLadder;
use crate::types::{EpisodeId, PersonaId, SceneId, Stage, UserId};

/// Free-form, additive story flags.
pub type FlagMutations = BTreeMap<String, serde_json::Value>;

/// Position inside an in-progress episode. The resolver reconstructs its
/// whole state machine from this alone; there is no separate session table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodePosition {
    /// The episode being played.
    pub episode: EpisodeId,
    /// Current scene.
    pub scene: SceneId,
    /// Index of the current beat within the scene.
    pub beat: usize,
}

/// Durable per-(user, persona) relationship record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipState {
    /// Owning user.
    pub user: UserId,
    /// The persona this relationship is with.
    pub persona: PersonaId,
    /// Relationship-strength counter. Never negative; decrements clamp to 0.
    pub affection: u32,
    /// Stage derived from affection. Recomputed on every affection change.
    pub stage: Stage,
    /// Episodes available to play. Monotonically growing.
    pub unlocked_episodes: BTreeSet<EpisodeId>,
    /// Episodes finished at least once. Always a subset of `unlocked_episodes`.
    pub completed_episodes: BTreeSet<EpisodeId>,
    /// In-progress episode position, if any.
    pub current_episode: Option<EpisodePosition>,
    /// Free-form story flags, merged additively.
    pub story_flags: FlagMutations,
    /// Last time an action touched this relationship.
    pub last_interaction_at: DateTime<Utc>,
    /// Optimistic-concurrency counter, bumped by the store on every write.
    pub version: u64,
}

impl RelationshipState {
    /// Fresh relationship: zero affection, stranger, seed episode unlocked.
    #[must_use]
    pub fn fresh(user: UserId, persona: PersonaId, seed_episode: EpisodeId, now: DateTime<Utc>) -> Self {
        let mut unlocked = BTreeSet::new();
        unlocked.insert(seed_episode);
        Self {
            user,
            persona,
            affection: 0,
            stage: Stage::Stranger,
            unlocked_episodes: unlocked,
            completed_episodes: BTreeSet::new(),
            current_episode: None,
            story_flags: BTreeMap::new(),
            last_interaction_at: now,
            version: 0,
        }
    }

    /// Apply a signed affection delta, clamping at 0, and re-derive the
    /// stage. Clamping happens per application, so a -10 followed by +3
    /// from affection 5 lands on 3, not on -2 summed then clamped.
    pub fn apply_affection(&mut self, delta: i32, ladder: &StageLadder) {
        self.affection = if delta >= 0 {
            self.affection.saturating_add(delta as u32)
        } else {
            self.affection.saturating_sub(delta.unsigned_abs())
        };
        self.stage = ladder.stage_for(self.affection);
    }

    /// Merge story-flag mutations. Additive: existing keys are overwritten,
    /// absent keys inserted, nothing removed.
    pub fn merge_flags(&mut self, mutations: &FlagMutations) {
        for (key, value) in mutations {
            self.story_flags.insert(key.clone(), value.clone());
        }
    }

    /// Add an episode to the unlocked set. Idempotent.
    pub fn unlock(&mut self, episode: EpisodeId) {
        self.unlocked_episodes.insert(episode);
    }

    /// Whether the record satisfies its structural invariants.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let completed_subset = self
            .completed_episodes
            .is_subset(&self.unlocked_episodes);
        let current_unlocked = self
            .current_episode
            .as_ref()
            .is_none_or(|pos| self.unlocked_episodes.contains(&pos.episode));
        completed_subset && current_unlocked
    }
}
