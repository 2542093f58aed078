//! Declarative trigger rules and their evaluator.
//!
//! A rule maps one action type to at most one future narrative event:
//! condition + probability + delay. The rule table is immutable data
//! loaded at process start; evaluation is a pure function of the action,
//! the relationship state, recent activity, and an injected random source,
//! so tests can pin outcomes with a seeded RNG.
//!
//! The fire rate is not the rule's flat base probability: it is modulated
//! by the affection tier (lower affection, lower rate), except for
//! configured moods that force an unconditional fire. At most one event is
//! produced per action, whichever matching rule fires first in declaration
//! order, to keep notification volume bounded.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::activity::{latest_activity, ActivityEntry};
use crate::config::ProbabilityConfig;
use crate::error::{EngineError, Result};
use crate::relationship::RelationshipState;
use crate::scheduler::{EventStatus, ScheduledEvent};
use crate::types::{ActionEvent, EventId, Mood, RuleId, Stage};

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

/// Declarative predicate over relationship state, mood, and recent
/// activity. Deliberately small; this is not a scripting language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Always true.
    Always,
    /// Affection at or above a floor.
    MinAffection(u32),
    /// Affection at or below a ceiling.
    MaxAffection(u32),
    /// Relationship stage at or beyond the given one.
    StageAtLeast(Stage),
    /// The action carries this mood.
    MoodIs(Mood),
    /// A story flag is set truthy.
    FlagSet(String),
    /// No recorded activity within the lookback window.
    QuietForHours(u32),
    /// All sub-conditions hold.
    All(Vec<Condition>),
    /// At least one sub-condition holds.
    Any(Vec<Condition>),
    /// Negation.
    Not(Box<Condition>),
}

impl Condition {
    /// Evaluate against the current context.
    #[must_use]
    pub fn eval(
        &self,
        state: &RelationshipState,
        mood: Option<Mood>,
        recent: &[ActivityEntry],
        now: DateTime<Utc>,
    ) -> bool {
        match self {
            Self::Always => true,
            Self::MinAffection(min) => state.affection >= *min,
            Self::MaxAffection(max) => state.affection <= *max,
            Self::StageAtLeast(stage) => state.stage >= *stage,
            Self::MoodIs(wanted) => mood == Some(*wanted),
            Self::FlagSet(flag) => state
                .story_flags
                .get(flag)
                .is_some_and(|v| v.as_bool().unwrap_or(true)),
            Self::QuietForHours(hours) => latest_activity(recent)
                .is_none_or(|at| now - at >= Duration::hours(i64::from(*hours))),
            Self::All(subs) => subs.iter().all(|c| c.eval(state, mood, recent, now)),
            Self::Any(subs) => subs.iter().any(|c| c.eval(state, mood, recent, now)),
            Self::Not(sub) => !sub.eval(state, mood, recent, now),
        }
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// One declarative trigger rule. Immutable configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRule {
    /// Rule id, for attribution on the scheduled event.
    pub id: RuleId,
    /// Action-type tag this rule listens to (`message`, `app_opened`, ...).
    pub action: String,
    /// Gate condition.
    #[serde(default = "default_condition")]
    pub condition: Condition,
    /// Base fire probability in `[0, 1]`, before tier modulation.
    pub base_probability: f64,
    /// Delivery delay bounds in seconds; the actual delay is uniform
    /// within them.
    pub delay_secs: DelayRange,
    /// Event type stamped on the scheduled event.
    pub event_type: String,
    /// Renderer payload template.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Moods that force this rule to fire with probability 1 regardless of
    /// tier modulation.
    #[serde(default)]
    pub unconditional_moods: Vec<Mood>,
}

fn default_condition() -> Condition {
    Condition::Always
}

/// Inclusive delay bounds in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    /// Minimum delay.
    pub min: u64,
    /// Maximum delay.
    pub max: u64,
}

/// The immutable rule table, in declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerSet {
    /// Rules; order is the match order.
    #[serde(default)]
    pub rules: Vec<TriggerRule>,
}

impl TriggerSet {
    /// Load a rule table from a TOML string.
    ///
    /// # Errors
    /// Returns [`EngineError::Config`] if the TOML is invalid or a rule is
    /// malformed (probability out of range, inverted delay bounds).
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let set: Self = toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))?;
        set.validate()?;
        Ok(set)
    }

    /// Load a rule table from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            if !(0.0..=1.0).contains(&rule.base_probability) {
                return Err(EngineError::Config(format!(
                    "rule {}: base_probability out of [0, 1]",
                    rule.id
                )));
            }
            if rule.delay_secs.min > rule.delay_secs.max {
                return Err(EngineError::Config(format!(
                    "rule {}: delay bounds inverted",
                    rule.id
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Evaluates the rule table against one incoming action.
#[derive(Debug)]
pub struct TriggerEvaluator<'a> {
    rules: &'a TriggerSet,
    probability: &'a ProbabilityConfig,
}

impl<'a> TriggerEvaluator<'a> {
    /// Bind to a rule table and tier configuration.
    #[must_use]
    pub fn new(rules: &'a TriggerSet, probability: &'a ProbabilityConfig) -> Self {
        Self { rules, probability }
    }

    /// Effective probability of `rule` for this action and state.
    #[must_use]
    pub fn effective_probability(
        &self,
        rule: &TriggerRule,
        state: &RelationshipState,
        mood: Option<Mood>,
    ) -> f64 {
        if mood.is_some_and(|m| rule.unconditional_moods.contains(&m)) {
            return 1.0;
        }
        rule.base_probability * self.probability.multiplier_for(state.affection)
    }

    /// Map an action to zero or one future event.
    ///
    /// Walks the rules in declaration order, keeping only those whose
    /// action type and condition match, and draws once per candidate until
    /// one fires. The returned event is `Pending` and not yet persisted;
    /// the caller owns inserting it and handing back only the id.
    pub fn evaluate<R: Rng>(
        &self,
        action: &ActionEvent,
        state: &RelationshipState,
        recent: &[ActivityEntry],
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Option<ScheduledEvent> {
        let mood = action.data.mood();
        for rule in &self.rules.rules {
            if rule.action != action.data.kind() {
                continue;
            }
            if !rule.condition.eval(state, mood, recent, now) {
                continue;
            }
            let probability = self.effective_probability(rule, state, mood);
            let draw: f64 = rng.gen();
            if draw >= probability {
                continue;
            }
            let delay = rng.gen_range(rule.delay_secs.min..=rule.delay_secs.max);
            let event = ScheduledEvent {
                id: EventId::new(),
                user: action.user,
                persona: action.persona,
                event_type: rule.event_type.clone(),
                scheduled_for: now + Duration::seconds(delay as i64),
                payload: rule.payload.clone(),
                status: EventStatus::Pending,
                trigger_rule: Some(rule.id.clone()),
            };
            debug!(
                rule = %rule.id,
                user = %action.user,
                action = action.data.kind(),
                probability,
                delay_secs = delay,
                "Trigger fired"
            );
            return Some(event);
        }
        None
    }
}
