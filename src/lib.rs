//! Simulated smartphone data engine for fictional characters.
//!
//! Generates a phone snapshot (messages, browser history, wallet, notes,
//! trips, social feed) for a character via an LLM, then keeps it in sync with
//! an ongoing conversation through incremental reconciliation. Snapshots are
//! versioned in a bounded ledger and persisted to a primary store with a
//! file-cache fallback.

pub mod config;
pub mod error;
pub mod history;
pub mod llm_client;
pub mod phone;
pub mod reconcile;
pub mod session;
pub mod store;
pub mod unread;

pub use error::PhoneError;
pub use phone::PhoneData;
pub use session::{ChatTurn, PhoneSession, UpdateOutcome};
