//! Surprise-me handler: one non-obvious insight per invocation.

use serde::Deserialize;

use super::{conversation, HandlerDeps, HandlerKind, HandlerResult};
use crate::context::ConversationContext;
use crate::error::CoachError;
use crate::prompts::{self, full_template, SURPRISE_TEMPLATE};
use crate::proposal::Proposal;

#[derive(Debug, Deserialize)]
struct SurpriseOutput {
    #[serde(default)]
    reply: String,
    insight: Option<AiInsight>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiInsight {
    title: String,
    #[serde(default)]
    explanation: String,
    #[serde(default)]
    confidence: u32,
    #[serde(default)]
    related_metrics: Vec<String>,
}

pub(super) async fn run(
    deps: &HandlerDeps<'_>,
    ctx: &ConversationContext,
    message: &str,
) -> Result<HandlerResult, CoachError> {
    let system_prompt = ctx
        .prompt_params()
        .render(&full_template(SURPRISE_TEMPLATE));
    let response = deps
        .provider
        .complete(&system_prompt, &conversation(ctx, message))
        .await?;

    let Some(output) = parse(&response) else {
        return Ok(HandlerResult {
            kind: HandlerKind::SurpriseMe,
            text: response,
            proposal: None,
            suggested_handler: None,
        });
    };

    let proposal = output
        .insight
        .filter(|i| !i.title.trim().is_empty())
        .map(|i| Proposal::Insight {
            title: i.title,
            explanation: i.explanation,
            confidence: i.confidence.min(100) as u8,
            related_metrics: i.related_metrics,
        });

    Ok(HandlerResult {
        kind: HandlerKind::SurpriseMe,
        text: output.reply,
        proposal,
        suggested_handler: None,
    })
}

fn parse(response: &str) -> Option<SurpriseOutput> {
    let json = prompts::extract_json_object(response)?;
    let output: SurpriseOutput = serde_json::from_str(json).ok()?;
    if output.reply.is_empty() {
        return None;
    }
    Some(output)
}
