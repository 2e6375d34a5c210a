//! The conversation engine: one entry point per user action.
//!
//! `handle_message` serializes work per thread with an async mutex, so two
//! messages racing on the same thread are processed one after the other and
//! the second sees the first's reply in its context window. Different
//! threads never block each other.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::context;
use crate::db::CoachDb;
use crate::error::CoachError;
use crate::extractor::{self, ExtractionSummary};
use crate::handlers::{HandlerDeps, HandlerKind};
use crate::ledger::{CompletionOutcome, Ledger};
use crate::lifecycle::{self, ApplyResult};
use crate::proposal::{self, Proposal};
use crate::provider::ModelProvider;
use crate::router;
use crate::types::Role;

/// What one inbound message produced.
#[derive(Debug)]
pub struct MessageOutcome {
    /// Handler that answered.
    pub handler: HandlerKind,
    /// Human-readable reply text (proposal stripped).
    pub text: String,
    /// Structured proposal, if the handler produced one.
    pub proposal: Option<Proposal>,
    /// Key for lifecycle actions on the proposal.
    pub proposal_key: Option<String>,
    /// Completions extracted and logged from the message.
    pub extraction: ExtractionSummary,
}

pub struct CoachEngine {
    db: Arc<CoachDb>,
    provider: Arc<dyn ModelProvider>,
    ledger: Ledger,
    thread_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CoachEngine {
    pub fn new(db: Arc<CoachDb>, provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            db,
            provider,
            ledger: Ledger::new(),
            thread_locks: DashMap::new(),
        }
    }

    /// Process one inbound chat message end to end: persist it, route it to
    /// exactly one handler, record any proposal, and persist the reply.
    pub async fn handle_message(
        &self,
        user_id: &str,
        thread_id: &str,
        message: &str,
        explicit_handler: Option<HandlerKind>,
    ) -> Result<MessageOutcome, CoachError> {
        let lock = self
            .thread_locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let ctx = context::assemble(&self.db, user_id, thread_id)?;
        self.db.insert_message(
            &Uuid::new_v4().to_string(),
            thread_id,
            user_id,
            Role::User.as_str(),
            message,
        )?;

        let deps = HandlerDeps {
            db: &self.db,
            provider: self.provider.as_ref(),
            ledger: &self.ledger,
        };

        // Completion claims are logged exactly once per message, before
        // routing, whichever handler answers it. Handlers read the ledger;
        // none of them extract again.
        let extraction = extractor::extract_and_log(
            &self.db,
            self.provider.as_ref(),
            &self.ledger,
            user_id,
            message,
            ctx.timezone,
            ctx.today,
        )
        .await?;

        let result = router::route(&deps, &ctx, message, explicit_handler).await?;

        let (stored_reply, proposal_key) = match &result.proposal {
            Some(p) => {
                let key = Uuid::new_v4().to_string();
                lifecycle::propose(&self.db, thread_id, &key, p)?;
                (proposal::encode(&result.text, p), Some(key))
            }
            None => (result.text.clone(), None),
        };
        self.db.insert_message(
            &Uuid::new_v4().to_string(),
            thread_id,
            user_id,
            Role::Assistant.as_str(),
            &stored_reply,
        )?;

        Ok(MessageOutcome {
            handler: result.kind,
            text: result.text,
            proposal: result.proposal,
            proposal_key,
            extraction,
        })
    }

    pub fn accept_proposal(&self, thread_id: &str, proposal_key: &str) -> Result<(), CoachError> {
        lifecycle::accept(&self.db, thread_id, proposal_key)
    }

    pub fn discard_proposal(&self, thread_id: &str, proposal_key: &str) -> Result<(), CoachError> {
        lifecycle::discard(&self.db, thread_id, proposal_key)
    }

    pub fn apply_proposal(
        &self,
        user_id: &str,
        thread_id: &str,
        proposal_key: &str,
    ) -> Result<ApplyResult, CoachError> {
        let ctx = context::assemble(&self.db, user_id, thread_id)?;
        lifecycle::apply(
            &self.db,
            &self.ledger,
            thread_id,
            proposal_key,
            user_id,
            ctx.today,
        )
    }

    /// Manual completion logging (the click-through path).
    pub fn log_completion(
        &self,
        user_id: &str,
        habit_id: &str,
        date: chrono::NaiveDate,
    ) -> Result<CompletionOutcome, CoachError> {
        let goal_ids = self.db.goal_ids_for_habit(habit_id)?;
        self.ledger.log_completion(
            &self.db,
            habit_id,
            user_id,
            date,
            goal_ids.first().map(String::as_str),
        )
    }

    pub fn db(&self) -> &CoachDb {
        &self.db
    }
}
