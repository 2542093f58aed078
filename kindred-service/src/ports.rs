//! Collaborator ports.
//!
//! The engine trusts an authenticated `UserId` from the identity provider
//! and consumes two external capabilities through these traits: the
//! economy gate (token deductions for premium unlocks) and semantic memory
//! recall (ranked prior conversation fragments, passed through opaquely
//! into persona response generation). The in-memory implementations here
//! back the test suites; production wires real clients.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use kindred_core::types::{EpisodeId, PersonaId, UserId};
use kindred_core::{EngineError, Result};

// ---------------------------------------------------------------------------
// Economy gate
// ---------------------------------------------------------------------------

/// Resolves token-cost deductions for premium episode unlocks.
pub trait EconomyGate: Send + Sync {
    /// Deduct `amount` tokens from the user's balance.
    ///
    /// # Errors
    ///
    /// [`EngineError::PaymentRequired`] on insufficient balance (the
    /// unlock aborts); [`EngineError::Unavailable`] when the gate can't
    /// be reached (transient, retryable).
    fn charge(&self, user: UserId, episode: &EpisodeId, amount: u32) -> Result<()>;

    /// Return `amount` tokens to the user, compensating a charge whose
    /// follow-up write failed.
    ///
    /// # Errors
    ///
    /// [`EngineError::Unavailable`] when the gate can't be reached; the
    /// caller logs and surfaces the original failure either way.
    fn refund(&self, user: UserId, amount: u32) -> Result<()>;
}

/// In-memory token ledger.
#[derive(Debug, Default)]
pub struct LedgerGate {
    balances: Mutex<HashMap<UserId, u32>>,
}

impl LedgerGate {
    /// Ledger with one pre-funded user.
    #[must_use]
    pub fn with_balance(user: UserId, tokens: u32) -> Self {
        let gate = Self::default();
        gate.balances.lock().insert(user, tokens);
        gate
    }

    /// Current balance of a user.
    #[must_use]
    pub fn balance(&self, user: UserId) -> u32 {
        self.balances.lock().get(&user).copied().unwrap_or(0)
    }
}

impl EconomyGate for LedgerGate {
    fn charge(&self, user: UserId, episode: &EpisodeId, amount: u32) -> Result<()> {
        let mut balances = self.balances.lock();
        let balance = balances.entry(user).or_insert(0);
        if *balance < amount {
            return Err(EngineError::PaymentRequired(episode.clone()));
        }
        *balance -= amount;
        Ok(())
    }

    fn refund(&self, user: UserId, amount: u32) -> Result<()> {
        let mut balances = self.balances.lock();
        let balance = balances.entry(user).or_insert(0);
        *balance = balance.saturating_add(amount);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Semantic memory recall
// ---------------------------------------------------------------------------

/// A ranked prior-conversation fragment. The engine never interprets
/// these; they ride along into response generation untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryFragment {
    /// Fragment text.
    pub text: String,
    /// Similarity score from the retrieval service.
    pub score: f32,
}

/// Semantic memory retrieval over prior conversations with a persona.
pub trait MemoryRecall: Send + Sync {
    /// Fragments relevant to `query`, best first, scores at or above
    /// `threshold`, at most `top_k` of them.
    ///
    /// # Errors
    ///
    /// [`EngineError::Unavailable`] when the retrieval service is down.
    fn recall(
        &self,
        query: &str,
        persona: PersonaId,
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<MemoryFragment>>;
}

/// Recall that remembers nothing. Fine for tests and for personas without
/// conversation history.
#[derive(Debug, Default)]
pub struct NoRecall;

impl MemoryRecall for NoRecall {
    fn recall(
        &self,
        _query: &str,
        _persona: PersonaId,
        _threshold: f32,
        _top_k: usize,
    ) -> Result<Vec<MemoryFragment>> {
        Ok(Vec::new())
    }
}

/// Canned recall returning fixed fragments, for tests.
#[derive(Debug, Default)]
pub struct FixedRecall {
    /// Fragments returned for every query.
    pub fragments: Vec<MemoryFragment>,
}

impl MemoryRecall for FixedRecall {
    fn recall(
        &self,
        _query: &str,
        _persona: PersonaId,
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<MemoryFragment>> {
        Ok(self
            .fragments
            .iter()
            .filter(|f| f.score >= threshold)
            .take(top_k)
            .cloned()
            .collect())
    }
}
