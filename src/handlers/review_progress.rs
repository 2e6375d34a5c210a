//! Progress-review handler.
//!
//! The engine runs completion extraction before routing, so claims like
//! "I ran today" are already in the ledger by the time this handler reads
//! it. The review facts (per-habit completion and streak) come straight
//! from the ledger; the model only writes the narrative around them. The
//! proposal carries the ledger facts, never model output.

use super::{conversation, HandlerDeps, HandlerKind, HandlerResult};
use crate::context::ConversationContext;
use crate::error::CoachError;
use crate::prompts::{self, full_template, REVIEW_PROGRESS_TEMPLATE};
use crate::proposal::{HabitReviewItem, Proposal};

pub(super) async fn run(
    deps: &HandlerDeps<'_>,
    ctx: &ConversationContext,
    message: &str,
) -> Result<HandlerResult, CoachError> {
    let mut items = Vec::with_capacity(ctx.habits.len());
    for habit in &ctx.habits {
        items.push(HabitReviewItem {
            habit_id: habit.id.clone(),
            title: habit.title.clone(),
            completed_today: deps
                .ledger
                .completed_on(deps.db, &habit.id, &ctx.user_id, ctx.today)?,
            streak: deps
                .ledger
                .streak(deps.db, &habit.id, &ctx.user_id, ctx.today)?,
        });
    }

    let facts = if items.is_empty() {
        "No active habits yet.".to_string()
    } else {
        items
            .iter()
            .map(|i| {
                format!(
                    "- {}: {} today, streak {}",
                    i.title,
                    if i.completed_today { "done" } else { "not done" },
                    i.streak
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut params = ctx.prompt_params();
    params.extra_context = format!("Today's review facts (ground truth):\n{facts}");
    let system_prompt = params.render(&full_template(REVIEW_PROGRESS_TEMPLATE));

    let response = deps
        .provider
        .complete(&system_prompt, &conversation(ctx, message))
        .await?;
    let text = parse_reply(&response).unwrap_or(response);

    let proposal = (!items.is_empty()).then_some(Proposal::HabitReview { items });

    Ok(HandlerResult {
        kind: HandlerKind::ReviewProgress,
        text,
        proposal,
        suggested_handler: None,
    })
}

fn parse_reply(response: &str) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct ReviewOutput {
        #[serde(default)]
        reply: String,
    }

    let json = prompts::extract_json_object(response)?;
    let output: ReviewOutput = serde_json::from_str(json).ok()?;
    (!output.reply.is_empty()).then_some(output.reply)
}
