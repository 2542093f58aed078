//! # Kindred Service
//!
//! Application layer over `kindred-core`: the [`NarrativeService`] facade
//! binds one engine store, one trigger table, and one episode catalogue to
//! the operations a route handler calls, and the [`ports`] module holds the
//! traits for the collaborators the engine does not own (the token ledger,
//! the conversation-memory retriever).

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod ports;
pub mod service;

pub use ports::{EconomyGate, FixedRecall, LedgerGate, MemoryFragment, MemoryRecall, NoRecall};
pub use service::NarrativeService;
