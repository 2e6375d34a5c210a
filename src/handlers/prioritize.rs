//! Prioritize/optimize handler.
//!
//! Asks the model for a focus ranking and optional habit swaps, then
//! validates every referenced id against the working set. Entries naming
//! unknown goals or habits are dropped, not trusted; ranks are renumbered
//! after filtering so the proposal always carries a contiguous 1..N
//! ranking.

use serde::Deserialize;

use super::{conversation, HandlerDeps, HandlerKind, HandlerResult};
use crate::context::ConversationContext;
use crate::error::CoachError;
use crate::prompts::{self, full_template, PRIORITIZE_TEMPLATE};
use crate::proposal::{HabitReplacement, Proposal, RankedGoal};
use crate::types::HabitDraft;

#[derive(Debug, Deserialize)]
struct PrioritizeOutput {
    #[serde(default)]
    reply: String,
    #[serde(default)]
    ranking: Vec<AiRankedGoal>,
    #[serde(default)]
    replacements: Vec<AiReplacement>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiRankedGoal {
    goal_id: String,
    rank: u32,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiReplacement {
    goal_id: String,
    old_habit_id: String,
    new_habit: AiNewHabit,
    #[serde(default)]
    rationale: String,
}

#[derive(Debug, Deserialize)]
struct AiNewHabit {
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
        .render(&full_template(PRIORITIZE_TEMPLATE));
    let response = deps
        .provider
        .complete(&system_prompt, &conversation(ctx, message))
        .await?;

    let Some(output) = parse(&response) else {
        return Ok(HandlerResult {
            kind: HandlerKind::PrioritizeOptimize,
            text: response,
            proposal: None,
            suggested_handler: None,
        });
    };

    let mut ranking: Vec<AiRankedGoal> = output
        .ranking
        .into_iter()
        .filter(|r| {
            let known = ctx.has_goal(&r.goal_id);
            if !known {
                log::warn!("Dropping ranking entry for unknown goal {}", r.goal_id);
            }
            known
        })
        .collect();
    ranking.sort_by_key(|r| r.rank);
    ranking.dedup_by(|a, b| a.goal_id == b.goal_id);
    let ranking: Vec<RankedGoal> = ranking
        .into_iter()
        .enumerate()
        .map(|(i, r)| RankedGoal {
            goal_id: r.goal_id,
            rank: (i + 1) as u32,
            reason: r.reason,
        })
        .collect();

    let replacements: Vec<HabitReplacement> = output
        .replacements
        .into_iter()
        .filter(|r| {
            let known = ctx.has_goal(&r.goal_id)
                && ctx.has_habit(&r.old_habit_id)
                && !r.new_habit.title.trim().is_empty();
            if !known {
                log::warn!(
                    "Dropping replacement for goal {} / habit {}",
                    r.goal_id,
                    r.old_habit_id
                );
            }
            known
        })
        .map(|r| HabitReplacement {
            goal_id: r.goal_id,
            old_habit_id: r.old_habit_id,
            new_habit: HabitDraft {
                title: r.new_habit.title.trim().to_string(),
                description: r.new_habit.description,
            },
            rationale: r.rationale,
        })
        .collect();

    let proposal = (!ranking.is_empty()).then_some(Proposal::Optimization {
        ranking,
        replacements,
    });

    Ok(HandlerResult {
        kind: HandlerKind::PrioritizeOptimize,
        text: output.reply,
        proposal,
        suggested_handler: None,
    })
}

fn parse(response: &str) -> Option<PrioritizeOutput> {
    let json = prompts::extract_json_object(response)?;
    let output: PrioritizeOutput = serde_json::from_str(json).ok()?;
    if output.reply.is_empty() {
        return None;
    }
    Some(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context;
    use crate::db::{CoachDb, NewGoal};
    use crate::ledger::Ledger;
    use crate::provider::testing::ScriptedProvider;

    fn seeded_db() -> (tempfile::TempDir, CoachDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = CoachDb::open_at(&dir.path().join("test.db")).unwrap();
        for (goal_id, title) in [("g1", "Run a 10k"), ("g2", "Read more")] {
            db.insert_goal(&NewGoal {
                id: goal_id,
                user_id: "u1",
                title,
                description: None,
                life_metric: None,
                target_date: None,
            })
            .unwrap();
        }
        db.insert_habit("h1", "u1", "Morning Run", None).unwrap();
        db.associate_habit("g1", "h1").unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn unknown_ids_are_dropped_and_ranks_renumbered() {
        let (_dir, db) = seeded_db();
        let ctx = context::assemble(&db, "u1", "t1").unwrap();
        let provider = ScriptedProvider::new(vec![
            r#"{
                "reply": "Here's my take.",
                "ranking": [
                    {"goalId": "g-ghost", "rank": 1, "reason": "made up"},
                    {"goalId": "g2", "rank": 2, "reason": "quick win"},
                    {"goalId": "g1", "rank": 3, "reason": "long game"}
                ],
                "replacements": [
                    {"goalId": "g1", "oldHabitId": "h-ghost",
                     "newHabit": {"title": "Evening Run"}, "rationale": "x"},
                    {"goalId": "g1", "oldHabitId": "h1",
                     "newHabit": {"title": "Interval Training"}, "rationale": "plateau"}
                ]
            }"#,
        ]);
        let ledger = Ledger::new();
        let deps = HandlerDeps {
            db: &db,
            provider: &provider,
            ledger: &ledger,
        };

        let result = run(&deps, &ctx, "prioritize").await.unwrap();
        match result.proposal {
            Some(Proposal::Optimization {
                ranking,
                replacements,
            }) => {
                assert_eq!(ranking.len(), 2);
                assert_eq!(ranking[0].goal_id, "g2");
                assert_eq!(ranking[0].rank, 1);
                assert_eq!(ranking[1].goal_id, "g1");
                assert_eq!(ranking[1].rank, 2);

                assert_eq!(replacements.len(), 1);
                assert_eq!(replacements[0].old_habit_id, "h1");
                assert_eq!(replacements[0].new_habit.title, "Interval Training");
            }
            other => panic!("expected optimization, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn all_unknown_ranking_yields_no_proposal() {
        let (_dir, db) = seeded_db();
        let ctx = context::assemble(&db, "u1", "t1").unwrap();
        let provider = ScriptedProvider::new(vec![
            r#"{"reply": "ok", "ranking": [{"goalId": "nope", "rank": 1}]}"#,
        ]);
        let ledger = Ledger::new();
        let deps = HandlerDeps {
            db: &db,
            provider: &provider,
            ledger: &ledger,
        };

        let result = run(&deps, &ctx, "prioritize").await.unwrap();
        assert!(result.proposal.is_none());
        assert_eq!(result.text, "ok");
    }
}
