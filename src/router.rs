//! Routing: exactly one handler answers every inbound message.
//!
//! Resolution order is explicit selection, then intent keywords, then the
//! Master handler. When Master recommends a handoff, the target runs once
//! and its result replaces Master's entirely; a handoff target never hands
//! off again. Provider failures surface as a single retryable error with no
//! automatic retry.

use crate::context::ConversationContext;
use crate::error::CoachError;
use crate::handlers::{self, HandlerDeps, HandlerKind, HandlerResult};

/// Route one inbound message to its handler and return that handler's
/// result.
pub async fn route(
    deps: &HandlerDeps<'_>,
    ctx: &ConversationContext,
    message: &str,
    explicit: Option<HandlerKind>,
) -> Result<HandlerResult, CoachError> {
    if let Some(kind) = explicit {
        log::debug!("Routing to {} (explicit selection)", kind.as_str());
        return handlers::run(kind, deps, ctx, message).await;
    }

    if let Some(kind) = handlers::match_intent(message) {
        log::debug!("Routing to {} (intent keywords)", kind.as_str());
        return handlers::run(kind, deps, ctx, message).await;
    }

    let master = handlers::run(HandlerKind::Master, deps, ctx, message).await?;
    match master.suggested_handler {
        Some(target) if target != HandlerKind::Master => {
            log::debug!("Master handed off to {}", target.as_str());
            // Single handoff: the specialist's result stands alone.
            handlers::run(target, deps, ctx, message).await
        }
        _ => Ok(master),
    }
}
