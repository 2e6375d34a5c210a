//! Master handler: the conversational default.
//!
//! Replies directly and may recommend a handoff to one specialist. The
//! handoff recommendation comes from the model's structured output; an
//! unknown or missing value means no handoff.

use serde::Deserialize;

use super::{conversation, HandlerDeps, HandlerKind, HandlerResult};
use crate::context::ConversationContext;
use crate::error::CoachError;
use crate::prompts::{self, full_template, MASTER_TEMPLATE};

#[derive(Debug, Deserialize)]
struct MasterOutput {
    #[serde(default)]
    reply: String,
    #[serde(default)]
    suggested_handler: Option<String>,
}

pub(super) async fn run(
    deps: &HandlerDeps<'_>,
    ctx: &ConversationContext,
    message: &str,
) -> Result<HandlerResult, CoachError> {
    let system_prompt = ctx.prompt_params().render(&full_template(MASTER_TEMPLATE));
    let response = deps
        .provider
        .complete(&system_prompt, &conversation(ctx, message))
        .await?;

    let (text, suggested_handler) = match parse(&response) {
        Some(output) => {
            let suggested = output
                .suggested_handler
                .as_deref()
                .and_then(HandlerKind::parse)
                // Master never hands off to itself.
                .filter(|k| *k != HandlerKind::Master);
            (output.reply, suggested)
        }
        None => (response, None),
    };

    Ok(HandlerResult {
        kind: HandlerKind::Master,
        text,
        proposal: None,
        suggested_handler,
    })
}

fn parse(response: &str) -> Option<MasterOutput> {
    let json = prompts::extract_json_object(response)?;
    let output: MasterOutput = serde_json::from_str(json).ok()?;
    if output.reply.is_empty() {
        return None;
    }
    Some(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context;
    use crate::db::CoachDb;
    use crate::ledger::Ledger;
    use crate::provider::testing::ScriptedProvider;

    fn test_ctx() -> (tempfile::TempDir, CoachDb, crate::context::ConversationContext) {
        let dir = tempfile::tempdir().unwrap();
        let db = CoachDb::open_at(&dir.path().join("test.db")).unwrap();
        let ctx = context::assemble(&db, "u1", "t1").unwrap();
        (dir, db, ctx)
    }

    #[tokio::test]
    async fn structured_reply_with_handoff() {
        let (_dir, db, ctx) = test_ctx();
        let provider = ScriptedProvider::new(vec![
            r#"{"reply": "Let's find you some goals.", "suggested_handler": "suggest_goals"}"#,
        ]);
        let ledger = Ledger::new();
        let deps = HandlerDeps {
            db: &db,
            provider: &provider,
            ledger: &ledger,
        };

        let result = run(&deps, &ctx, "I feel aimless").await.unwrap();
        assert_eq!(result.text, "Let's find you some goals.");
        assert_eq!(result.suggested_handler, Some(HandlerKind::SuggestGoals));
        assert!(result.proposal.is_none());
    }

    #[tokio::test]
    async fn plain_text_output_degrades_gracefully() {
        let (_dir, db, ctx) = test_ctx();
        let provider = ScriptedProvider::new(vec!["Just keep at it!"]);
        let ledger = Ledger::new();
        let deps = HandlerDeps {
            db: &db,
            provider: &provider,
            ledger: &ledger,
        };

        let result = run(&deps, &ctx, "hi").await.unwrap();
        assert_eq!(result.text, "Just keep at it!");
        assert!(result.suggested_handler.is_none());
    }

    #[tokio::test]
    async fn unknown_handoff_target_is_ignored() {
        let (_dir, db, ctx) = test_ctx();
        let provider = ScriptedProvider::new(vec![
            r#"{"reply": "hm", "suggested_handler": "therapist"}"#,
        ]);
        let ledger = Ledger::new();
        let deps = HandlerDeps {
            db: &db,
            provider: &provider,
            ledger: &ledger,
        };

        let result = run(&deps, &ctx, "hi").await.unwrap();
        assert!(result.suggested_handler.is_none());
    }
}
