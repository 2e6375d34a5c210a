//! Conversation handlers: one specialist per coaching concern.
//!
//! Exactly one handler produces the response to any inbound message. Each
//! handler renders its own template, makes one model call, and parses the
//! output fail-closed: unparseable output degrades to a plain-text reply,
//! never an error and never a fabricated proposal.

mod master;
mod prioritize;
mod review_progress;
mod suggest_goals;
mod surprise;

use crate::context::ConversationContext;
use crate::db::CoachDb;
use crate::error::CoachError;
use crate::ledger::Ledger;
use crate::proposal::Proposal;
use crate::provider::ModelProvider;
use crate::types::ChatMessage;

/// The five handlers. `Master` is the conversational default; the rest are
/// specialists reachable by explicit selection, intent keywords, or a
/// Master handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Master,
    SuggestGoals,
    ReviewProgress,
    PrioritizeOptimize,
    SurpriseMe,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::SuggestGoals => "suggest_goals",
            Self::ReviewProgress => "review_progress",
            Self::PrioritizeOptimize => "prioritize_optimize",
            Self::SurpriseMe => "surprise_me",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "master" => Some(Self::Master),
            "suggest_goals" => Some(Self::SuggestGoals),
            "review_progress" => Some(Self::ReviewProgress),
            "prioritize_optimize" => Some(Self::PrioritizeOptimize),
            "surprise_me" => Some(Self::SurpriseMe),
            _ => None,
        }
    }
}

/// Keyword-based intent match, checked before falling back to Master.
/// Phrases are matched case-insensitively against the whole message; the
/// first matching handler wins.
pub fn match_intent(message: &str) -> Option<HandlerKind> {
    const INTENTS: &[(HandlerKind, &[&str])] = &[
        (
            HandlerKind::SuggestGoals,
            &["suggest a goal", "suggest goals", "goal ideas", "new goal"],
        ),
        (
            HandlerKind::ReviewProgress,
            &["review my progress", "how am i doing", "progress review"],
        ),
        (
            HandlerKind::PrioritizeOptimize,
            &["prioritize", "reprioritize", "what should i focus on", "rank my goals"],
        ),
        (
            HandlerKind::SurpriseMe,
            &["surprise me", "tell me something", "any insights"],
        ),
    ];

    let lowered = message.to_lowercase();
    for (kind, phrases) in INTENTS {
        if phrases.iter().any(|p| lowered.contains(p)) {
            return Some(*kind);
        }
    }
    None
}

/// What a handler produced: the text reply, an optional structured proposal,
/// and (Master only) a recommended handoff target.
#[derive(Debug)]
pub struct HandlerResult {
    pub kind: HandlerKind,
    pub text: String,
    pub proposal: Option<Proposal>,
    pub suggested_handler: Option<HandlerKind>,
}

/// Shared capabilities handed to every handler invocation.
pub struct HandlerDeps<'a> {
    pub db: &'a CoachDb,
    pub provider: &'a dyn ModelProvider,
    pub ledger: &'a Ledger,
}

/// Run one handler against the assembled context and inbound message.
pub async fn run(
    kind: HandlerKind,
    deps: &HandlerDeps<'_>,
    ctx: &ConversationContext,
    message: &str,
) -> Result<HandlerResult, CoachError> {
    match kind {
        HandlerKind::Master => master::run(deps, ctx, message).await,
        HandlerKind::SuggestGoals => suggest_goals::run(deps, ctx, message).await,
        HandlerKind::ReviewProgress => review_progress::run(deps, ctx, message).await,
        HandlerKind::PrioritizeOptimize => prioritize::run(deps, ctx, message).await,
        HandlerKind::SurpriseMe => surprise::run(deps, ctx, message).await,
    }
}

/// The message history sent to the model: the context window plus the new
/// user message (which is persisted before routing, but the context window
/// was captured first).
pub(crate) fn conversation(ctx: &ConversationContext, message: &str) -> Vec<ChatMessage> {
    let mut messages = ctx.recent_messages.clone();
    messages.push(ChatMessage::user(message));
    messages
}
