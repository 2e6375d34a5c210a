//! Conversation-driven goal and habit coaching core.
//!
//! The engine routes every inbound chat message to exactly one handler,
//! which may attach a structured proposal to its reply. Proposals move
//! through an explicit accept/apply/discard lifecycle with step-level
//! resume, and habit completions flow through a single deduplicating
//! ledger whatever path they arrive by.

pub mod config;
pub mod context;
pub mod db;
pub mod engine;
pub mod error;
pub mod extractor;
pub mod focus;
pub mod handlers;
pub mod ledger;
pub mod lifecycle;
pub mod progress;
pub mod prompts;
pub mod proposal;
pub mod provider;
pub mod router;
pub mod types;

pub use config::CoachConfig;
pub use engine::{CoachEngine, MessageOutcome};
pub use error::CoachError;
pub use handlers::HandlerKind;
pub use proposal::Proposal;
pub use provider::{HttpModelProvider, ModelProvider};
