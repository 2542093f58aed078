//! The request-facing facade.
//!
//! One [`NarrativeService`] per process wires the store, the immutable
//! rule table, the episode catalogue, and the collaborator ports into the
//! operations the route layer exposes. Every operation is a bounded
//! synchronous call; handlers stay stateless and share the service.

use chrono::Utc;
use rand::Rng;
use tracing::{info, instrument, warn};

use kindred_core::activity::ActivityEntry;
use kindred_core::scenario::{BeatView, EpisodeLibrary, ScenarioResolver};
use kindred_core::trigger::{TriggerEvaluator, TriggerSet};
use kindred_core::types::{ActionEvent, EpisodeId, EventId, PersonaId, UserId};
use kindred_core::{
    EngineConfig, EngineStore, RelationshipState, Result, ScheduledEvent,
};

use crate::ports::{EconomyGate, MemoryFragment, MemoryRecall};

/// How far back the evaluator looks when a rule has an activity condition.
const LOOKBACK_HOURS: i64 = 72;

/// The engine's exposed operations, bound to one store and one content set.
pub struct NarrativeService {
    store: EngineStore,
    rules: TriggerSet,
    library: EpisodeLibrary,
    config: EngineConfig,
    gate: Box<dyn EconomyGate>,
    recall: Box<dyn MemoryRecall>,
}

impl std::fmt::Debug for NarrativeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NarrativeService")
            .field("rules", &self.rules.rules.len())
            .field("episodes", &self.library.all().len())
            .finish_non_exhaustive()
    }
}

impl NarrativeService {
    /// Assemble the service from its parts.
    #[must_use]
    pub fn new(
        store: EngineStore,
        rules: TriggerSet,
        library: EpisodeLibrary,
        config: EngineConfig,
        gate: Box<dyn EconomyGate>,
        recall: Box<dyn MemoryRecall>,
    ) -> Self {
        Self {
            store,
            rules,
            library,
            config,
            gate,
            recall,
        }
    }

    /// The underlying store, for operational tooling.
    #[must_use]
    pub fn store(&self) -> &EngineStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // Actions and events
    // ------------------------------------------------------------------

    /// Ingest one user action: log it, stamp the relationship, and run the
    /// trigger table. Returns the scheduled event's id when a rule fired;
    /// only the id, so the content stays a surprise until delivery.
    ///
    /// # Errors
    ///
    /// Returns [`kindred_core::EngineError::Busy`] under store contention.
    #[instrument(skip(self, rng), fields(user = %action.user, action = action.data.kind()))]
    pub fn handle_action<R: Rng>(
        &self,
        action: &ActionEvent,
        rng: &mut R,
    ) -> Result<Option<EventId>> {
        let state = self.store.state_or_default(action.user, action.persona)?;
        // Lookback conditions judge the quiet stretch before this action,
        // so the log is read before the action lands in it.
        let recent = self.store.recent_activity(
            action.user,
            action.persona,
            action.at - chrono::Duration::hours(LOOKBACK_HOURS),
        )?;
        self.store
            .record_activity(&ActivityEntry::from_action(action)?)?;
        self.store.touch(action.user, action.persona, action.at)?;
        let evaluator = TriggerEvaluator::new(&self.rules, &self.config.probability);
        let Some(event) = evaluator.evaluate(action, &state, &recent, action.at, rng) else {
            return Ok(None);
        };
        self.store.insert_event(&event)?;
        info!(event = %event.id, "Action scheduled a narrative event");
        Ok(Some(event.id))
    }

    /// Events due for delivery right now, earliest first.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn pending_events(&self, user: UserId) -> Result<Vec<ScheduledEvent>> {
        self.store.list_due(user, Utc::now())
    }

    /// Deliver one event and hand back its renderable content. Safe under
    /// concurrent polling: one caller wins, the rest see
    /// [`kindred_core::EngineError::AlreadyDelivered`].
    ///
    /// # Errors
    ///
    /// [`kindred_core::EngineError::AlreadyDelivered`] or
    /// [`kindred_core::EngineError::UnknownEvent`].
    pub fn process_event(&self, event: EventId) -> Result<serde_json::Value> {
        self.store.mark_delivered(event)
    }

    // ------------------------------------------------------------------
    // Relationship state
    // ------------------------------------------------------------------

    /// Snapshot of the relationship, creating the default record on first
    /// access.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn state(&self, user: UserId, persona: PersonaId) -> Result<RelationshipState> {
        self.store.state_or_default(user, persona)
    }

    // ------------------------------------------------------------------
    // Episodes
    // ------------------------------------------------------------------

    /// Unlock an episode, resolving its gate: affection floor first, then
    /// the token cost through the economy gate. Nothing is written if the
    /// charge fails; an already-unlocked episode returns early and is
    /// never charged again, so retrying after a transient failure is safe.
    /// If the unlock write itself fails after a successful charge, the
    /// tokens are refunded before the failure is surfaced.
    ///
    /// # Errors
    ///
    /// [`kindred_core::EngineError::Locked`] below the affection floor;
    /// [`kindred_core::EngineError::PaymentRequired`] when the charge is
    /// refused.
    #[instrument(skip(self), fields(%user, %episode))]
    pub fn unlock_episode(
        &self,
        user: UserId,
        persona: PersonaId,
        episode: &EpisodeId,
    ) -> Result<RelationshipState> {
        let definition = self.library.episode(episode)?;
        let state = self.store.state_or_default(user, persona)?;
        if state.unlocked_episodes.contains(episode) {
            return Ok(state);
        }
        if state.affection < definition.unlock.min_affection {
            warn!(
                affection = state.affection,
                floor = definition.unlock.min_affection,
                "Unlock below affection floor"
            );
            return Err(kindred_core::EngineError::Locked(episode.clone()));
        }
        let Some(cost) = definition.unlock.token_cost else {
            return self.store.unlock_episode(user, persona, episode);
        };
        self.gate.charge(user, episode, cost)?;
        match self.store.unlock_episode(user, persona, episode) {
            Ok(state) => Ok(state),
            Err(err) => {
                if let Err(refund_err) = self.gate.refund(user, cost) {
                    warn!(cost, error = %refund_err, "Refund after a failed unlock write failed too");
                }
                Err(err)
            }
        }
    }

    /// Start an episode. Pending invitations of superseded types are
    /// cancelled; the started scenario replaces them.
    ///
    /// # Errors
    ///
    /// [`kindred_core::EngineError::Locked`] when not unlocked.
    pub fn start_episode(
        &self,
        user: UserId,
        persona: PersonaId,
        episode: &EpisodeId,
    ) -> Result<BeatView> {
        let resolver = ScenarioResolver::new(&self.store, &self.library, &self.config);
        let view = resolver.start_episode(user, persona, episode)?;
        for event_type in &self.config.delivery.supersede_on_start {
            self.store.cancel_pending_for(user, persona, event_type)?;
        }
        Ok(view)
    }

    /// Apply a choice at the current beat.
    ///
    /// # Errors
    ///
    /// [`kindred_core::EngineError::InvalidChoice`] for an unknown option.
    pub fn apply_choice(
        &self,
        user: UserId,
        persona: PersonaId,
        choice: &str,
    ) -> Result<BeatView> {
        ScenarioResolver::new(&self.store, &self.library, &self.config)
            .apply_choice(user, persona, choice)
    }

    /// Advance past a narration beat.
    ///
    /// # Errors
    ///
    /// [`kindred_core::EngineError::ChoiceRequired`] at a choice point.
    pub fn advance(&self, user: UserId, persona: PersonaId) -> Result<BeatView> {
        ScenarioResolver::new(&self.store, &self.library, &self.config).advance(user, persona)
    }

    /// Resume an in-progress episode, if any.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub fn resume(&self, user: UserId, persona: PersonaId) -> Result<Option<BeatView>> {
        self.store.state_or_default(user, persona)?;
        ScenarioResolver::new(&self.store, &self.library, &self.config).resume(user, persona)
    }

    // ------------------------------------------------------------------
    // Conversation context
    // ------------------------------------------------------------------

    /// Prior-conversation fragments for response generation. Passed
    /// through opaquely from the retrieval service.
    ///
    /// # Errors
    ///
    /// [`kindred_core::EngineError::Unavailable`] when retrieval is down.
    pub fn conversation_context(
        &self,
        query: &str,
        persona: PersonaId,
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<MemoryFragment>> {
        self.recall.recall(query, persona, threshold, top_k)
    }
}
