//! Configuration for the Kindred engine.
//!
//! Maps directly to `kindred.toml`. Stage thresholds and affection-tier
//! probability multipliers are deliberately configuration, not constants:
//! they are product-tuning knobs, not correctness properties.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::types::Stage;

/// Top-level engine configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Stage ladder derived from affection.
    #[serde(default)]
    pub stages: StageLadder,
    /// Affection-tier probability modulation for trigger rules.
    #[serde(default)]
    pub probability: ProbabilityConfig,
    /// Delivery retry and supersession settings.
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Persistence / SQLite settings.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// New-relationship seeding.
    #[serde(default)]
    pub onboarding: OnboardingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns [`EngineError::Config`] if the TOML is invalid or the
    /// ladder/tier tables are not monotone.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    fn validate(&self) -> Result<()> {
        self.stages.validate()?;
        self.probability.validate()
    }
}

// ---------------------------------------------------------------------------
// Stage ladder
// ---------------------------------------------------------------------------

/// One rung of the stage ladder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageStep {
    /// Minimum affection for this stage.
    pub min_affection: u32,
    /// Stage granted at that affection.
    pub stage: Stage,
}

/// Ordered affection thresholds mapping to relationship stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageLadder {
    /// Steps in ascending `min_affection` order; the first must start at 0.
    pub steps: Vec<StageStep>,
}

impl StageLadder {
    /// Derive the stage for a given affection value.
    #[must_use]
    pub fn stage_for(&self, affection: u32) -> Stage {
        self.steps
            .iter()
            .rev()
            .find(|step| affection >= step.min_affection)
            .map_or(Stage::Stranger, |step| step.stage)
    }

    fn validate(&self) -> Result<()> {
        if self.steps.is_empty() || self.steps[0].min_affection != 0 {
            return Err(EngineError::Config(
                "stage ladder must start at affection 0".to_string(),
            ));
        }
        let ascending = self
            .steps
            .windows(2)
            .all(|w| w[0].min_affection < w[1].min_affection && w[0].stage < w[1].stage);
        if !ascending {
            return Err(EngineError::Config(
                "stage ladder must be strictly ascending".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for StageLadder {
    fn default() -> Self {
        Self {
            steps: vec![
                StageStep {
                    min_affection: 0,
                    stage: Stage::Stranger,
                },
                StageStep {
                    min_affection: 10,
                    stage: Stage::Acquaintance,
                },
                StageStep {
                    min_affection: 30,
                    stage: Stage::Friend,
                },
                StageStep {
                    min_affection: 60,
                    stage: Stage::Confidant,
                },
                StageStep {
                    min_affection: 100,
                    stage: Stage::Partner,
                },
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Probability tiers
// ---------------------------------------------------------------------------

/// One step of the affection-tier probability multiplier function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbabilityTier {
    /// Minimum affection for this tier.
    pub min_affection: u32,
    /// Multiplier applied to a rule's base probability, in `[0, 1]`.
    pub multiplier: f64,
}

/// Monotone step function modulating trigger fire rates by affection.
/// Lower affection means a lower effective fire rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbabilityConfig {
    /// Tiers in ascending `min_affection` order.
    pub tiers: Vec<ProbabilityTier>,
}

impl ProbabilityConfig {
    /// Multiplier for a given affection value.
    #[must_use]
    pub fn multiplier_for(&self, affection: u32) -> f64 {
        self.tiers
            .iter()
            .rev()
            .find(|tier| affection >= tier.min_affection)
            .map_or(1.0, |tier| tier.multiplier)
    }

    fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() || self.tiers[0].min_affection != 0 {
            return Err(EngineError::Config(
                "probability tiers must start at affection 0".to_string(),
            ));
        }
        let monotone = self.tiers.windows(2).all(|w| {
            w[0].min_affection < w[1].min_affection && w[0].multiplier <= w[1].multiplier
        });
        if !monotone {
            return Err(EngineError::Config(
                "probability tiers must be ascending and monotone".to_string(),
            ));
        }
        if self.tiers.iter().any(|t| !(0.0..=1.0).contains(&t.multiplier)) {
            return Err(EngineError::Config(
                "probability multipliers must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ProbabilityConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                ProbabilityTier {
                    min_affection: 0,
                    multiplier: 0.25,
                },
                ProbabilityTier {
                    min_affection: 10,
                    multiplier: 0.5,
                },
                ProbabilityTier {
                    min_affection: 30,
                    multiplier: 0.75,
                },
                ProbabilityTier {
                    min_affection: 60,
                    multiplier: 1.0,
                },
            ],
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Retry and supersession behavior of the delivery/mutation paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Max internal retries when a compare-and-set loses a race.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff between retries in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Event types cancelled when an episode starts (a started scenario
    /// supersedes pending invitations to one).
    #[serde(default = "default_superseded")]
    pub supersede_on_start: Vec<String>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_backoff_ms: default_backoff_ms(),
            supersede_on_start: default_superseded(),
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Persistence / SQLite configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Use WAL mode for concurrent reads.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            wal_mode: true,
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Onboarding
// ---------------------------------------------------------------------------

/// New-relationship seeding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnboardingConfig {
    /// Episode unlocked for every fresh relationship.
    #[serde(default = "default_seed_episode")]
    pub seed_episode: String,
}

impl Default for OnboardingConfig {
    fn default() -> Self {
        Self {
            seed_episode: default_seed_episode(),
        }
    }
}

// ---------------------------------------------------------------------------
// Serde default helpers
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    25
}
fn default_busy_timeout() -> u32 {
    5000
}
fn default_superseded() -> Vec<String> {
    vec!["episode_invite".to_string()]
}
fn default_seed_episode() -> String {
    "first_spark".to_string()
}
