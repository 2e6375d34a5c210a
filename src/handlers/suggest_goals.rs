//! Goal-suggestion handler: proposes new goals with supporting habits.
//!
//! The model's suggestions become a `GoalSuggestions` proposal; nothing is
//! created until the user accepts and applies it. Suggestions duplicating an
//! active goal title are dropped here rather than surfaced.

use serde::Deserialize;

use super::{conversation, HandlerDeps, HandlerKind, HandlerResult};
use crate::context::ConversationContext;
use crate::error::CoachError;
use crate::prompts::{self, full_template, SUGGEST_GOALS_TEMPLATE};
use crate::proposal::{GoalSuggestion, Proposal};
use crate::types::{GoalDraft, HabitDraft, StartTimeline};

#[derive(Debug, Deserialize)]
struct SuggestOutput {
    #[serde(default)]
    reply: String,
    #[serde(default)]
    suggestions: Vec<AiSuggestion>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiSuggestion {
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    life_metric: Option<String>,
    #[serde(default)]
    start_timeline: String,
    #[serde(default)]
    target_date: Option<String>,
    #[serde(default)]
    habits: Vec<AiHabit>,
}

#[derive(Debug, Deserialize)]
struct AiHabit {
    title: String,
    #[serde(default)]
    description: Option<String>,
}

pub(super) async fn run(
    deps: &HandlerDeps<'_>,
    ctx: &ConversationContext,
    message: &str,
) -> Result<HandlerResult, CoachError> {
    let system_prompt = ctx
        .prompt_params()
        .render(&full_template(SUGGEST_GOALS_TEMPLATE));
    let response = deps
        .provider
        .complete(&system_prompt, &conversation(ctx, message))
        .await?;

    let Some(output) = parse(&response) else {
        return Ok(HandlerResult {
            kind: HandlerKind::SuggestGoals,
            text: response,
            proposal: None,
            suggested_handler: None,
        });
    };

    let suggestions: Vec<GoalSuggestion> = output
        .suggestions
        .into_iter()
        .filter(|s| !s.title.trim().is_empty())
        .filter(|s| {
            let duplicate = ctx
                .goals
                .iter()
                .any(|g| g.goal.title.eq_ignore_ascii_case(s.title.trim()));
            if duplicate {
                log::debug!("Dropping suggestion duplicating active goal '{}'", s.title);
            }
            !duplicate
        })
        .map(|s| GoalSuggestion {
            goal: GoalDraft {
                title: s.title.trim().to_string(),
                description: s.description,
                life_metric: s.life_metric,
                start_timeline: StartTimeline::parse_lenient(&s.start_timeline),
                target_date: s.target_date.and_then(|d| d.trim().parse().ok()),
            },
            habits: s
                .habits
                .into_iter()
                .filter(|h| !h.title.trim().is_empty())
                .map(|h| HabitDraft {
                    title: h.title.trim().to_string(),
                    description: h.description,
                })
                .collect(),
        })
        .collect();

    let proposal =
        (!suggestions.is_empty()).then_some(Proposal::GoalSuggestions { suggestions });

    Ok(HandlerResult {
        kind: HandlerKind::SuggestGoals,
        text: output.reply,
        proposal,
        suggested_handler: None,
    })
}

fn parse(response: &str) -> Option<SuggestOutput> {
    let json = prompts::extract_json_object(response)?;
    let output: SuggestOutput = serde_json::from_str(json).ok()?;
    if output.reply.is_empty() {
        return None;
    }
    Some(output)
}
