//! Proposal lifecycle: proposed → accepted → applying → applied, with
//! discard and apply-failure branches.
//!
//! State and step-level apply progress are persisted server-side keyed by
//! (thread, proposal key), so an apply interrupted by a crash or error can
//! be retried idempotently: completed steps are recorded the moment they
//! finish and are skipped on the next attempt. Applying an already-applied
//! proposal returns the recorded result without touching the store.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{CoachDb, DbProposalState, NewGoal};
use crate::error::CoachError;
use crate::focus;
use crate::ledger::Ledger;
use crate::proposal::Proposal;
use crate::types::StartTimeline;

/// Lifecycle states, stored as strings in the proposal row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalState {
    Proposed,
    Accepted,
    Discarded,
    Applying,
    Applied,
    ApplyFailed,
}

impl ProposalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Accepted => "accepted",
            Self::Discarded => "discarded",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::ApplyFailed => "apply_failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "proposed" => Some(Self::Proposed),
            "accepted" => Some(Self::Accepted),
            "discarded" => Some(Self::Discarded),
            "applying" => Some(Self::Applying),
            "applied" => Some(Self::Applied),
            "apply_failed" => Some(Self::ApplyFailed),
            _ => None,
        }
    }
}

/// Per-step apply progress, persisted after every completed step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ApplyProgress {
    GoalSuggestions { suggestions: Vec<SuggestionProgress> },
    Optimization {
        focus_replaced: bool,
        replacements: Vec<ReplacementProgress>,
    },
    HabitReview { logged: bool },
    Insight,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SuggestionProgress {
    goal_id: Option<String>,
    habits: Vec<HabitProgress>,
    focus_inserted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HabitProgress {
    habit_id: Option<String>,
    associated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ReplacementProgress {
    old_archived: bool,
    new_habit_id: Option<String>,
    associated: bool,
}

/// What an apply created, returned to the caller and recorded in the row
/// so re-applies can answer without redoing work.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResult {
    pub created_goal_ids: Vec<String>,
    pub created_habit_ids: Vec<String>,
    /// True when a focus insertion pushed the set past capacity.
    pub focus_overflow: bool,
}

/// Record a freshly produced proposal in the `proposed` state.
pub fn propose(
    db: &CoachDb,
    thread_id: &str,
    proposal_key: &str,
    proposal: &Proposal,
) -> Result<(), CoachError> {
    let json = serde_json::to_string(proposal)
        .expect("proposal serialization to JSON is infallible");
    db.upsert_proposal_state(
        thread_id,
        proposal_key,
        ProposalState::Proposed.as_str(),
        &json,
        None,
        None,
    )?;
    Ok(())
}

/// Accept a proposed proposal. Accepting twice is a no-op.
pub fn accept(db: &CoachDb, thread_id: &str, proposal_key: &str) -> Result<(), CoachError> {
    let row = load(db, thread_id, proposal_key)?;
    match state_of(&row)? {
        ProposalState::Accepted => Ok(()),
        ProposalState::Proposed => {
            db.upsert_proposal_state(
                thread_id,
                proposal_key,
                ProposalState::Accepted.as_str(),
                &row.proposal_json,
                row.progress_json.as_deref(),
                row.result_json.as_deref(),
            )?;
            Ok(())
        }
        other => Err(CoachError::InvalidProposalState {
            from: other.as_str().to_string(),
            action: "accept",
        }),
    }
}

/// Discard a proposal that has not been applied. Discarding twice is a
/// no-op; an applying or applied proposal cannot be discarded.
pub fn discard(db: &CoachDb, thread_id: &str, proposal_key: &str) -> Result<(), CoachError> {
    let row = load(db, thread_id, proposal_key)?;
    match state_of(&row)? {
        ProposalState::Discarded => Ok(()),
        ProposalState::Proposed | ProposalState::Accepted | ProposalState::ApplyFailed => {
            db.upsert_proposal_state(
                thread_id,
                proposal_key,
                ProposalState::Discarded.as_str(),
                &row.proposal_json,
                row.progress_json.as_deref(),
                row.result_json.as_deref(),
            )?;
            Ok(())
        }
        other => Err(CoachError::InvalidProposalState {
            from: other.as_str().to_string(),
            action: "discard",
        }),
    }
}

/// Apply an accepted proposal, step by step.
///
/// Progress is persisted after every completed step. A mid-apply failure
/// moves the row to `apply_failed` and surfaces `PartialApply`; retrying
/// resumes from the first incomplete step. A row stranded in `applying`
/// (process died mid-apply) may also be retried and resumes the same way.
/// Applying an applied proposal returns its recorded result.
pub fn apply(
    db: &CoachDb,
    ledger: &Ledger,
    thread_id: &str,
    proposal_key: &str,
    user_id: &str,
    today: chrono::NaiveDate,
) -> Result<ApplyResult, CoachError> {
    let row = load(db, thread_id, proposal_key)?;
    match state_of(&row)? {
        ProposalState::Applied => {
            let result = row
                .result_json
                .as_deref()
                .and_then(|json| serde_json::from_str(json).ok())
                .unwrap_or_default();
            return Ok(result);
        }
        ProposalState::Accepted | ProposalState::ApplyFailed | ProposalState::Applying => {}
        other => {
            return Err(CoachError::InvalidProposalState {
                from: other.as_str().to_string(),
                action: "apply",
            });
        }
    }

    let proposal: Proposal = serde_json::from_str(&row.proposal_json).map_err(|e| {
        CoachError::InvalidProposalState {
            from: format!("unreadable ({e})"),
            action: "apply",
        }
    })?;
    let mut progress = row
        .progress_json
        .as_deref()
        .and_then(|json| serde_json::from_str(json).ok())
        .unwrap_or_else(|| initial_progress(&proposal));

    save(db, &row, ProposalState::Applying, &progress, None)?;

    let mut result = ApplyResult::default();
    let outcome = run_steps(db, ledger, user_id, today, &row, &proposal, &mut progress, &mut result);

    match outcome {
        Ok(()) => {
            save(db, &row, ProposalState::Applied, &progress, Some(&result))?;
            Ok(result)
        }
        Err((failed_step, source)) => {
            save(db, &row, ProposalState::ApplyFailed, &progress, None)?;
            Err(CoachError::PartialApply {
                failed_step,
                created_goal_ids: created_goals(&progress),
                created_habit_ids: created_habits(&progress),
                source_message: source.to_string(),
            })
        }
    }
}

fn initial_progress(proposal: &Proposal) -> ApplyProgress {
    match proposal {
        Proposal::GoalSuggestions { suggestions } => ApplyProgress::GoalSuggestions {
            suggestions: suggestions
                .iter()
                .map(|s| SuggestionProgress {
                    habits: vec![HabitProgress::default(); s.habits.len()],
                    ..Default::default()
                })
                .collect(),
        },
        Proposal::Optimization { replacements, .. } => ApplyProgress::Optimization {
            focus_replaced: false,
            replacements: vec![ReplacementProgress::default(); replacements.len()],
        },
        Proposal::HabitReview { .. } => ApplyProgress::HabitReview { logged: false },
        Proposal::Insight { .. } => ApplyProgress::Insight,
    }
}

type StepError = (String, CoachError);

/// Persist the progress record while still in `applying`, so a crash after
/// this point resumes past the step that just finished.
fn checkpoint(
    db: &CoachDb,
    row: &DbProposalState,
    progress: &ApplyProgress,
) -> Result<(), StepError> {
    save(db, row, ProposalState::Applying, progress, None)
        .map_err(|e| ("record apply progress".to_string(), e))
}

fn run_steps(
    db: &CoachDb,
    ledger: &Ledger,
    user_id: &str,
    today: chrono::NaiveDate,
    row: &DbProposalState,
    proposal: &Proposal,
    progress: &mut ApplyProgress,
    result: &mut ApplyResult,
) -> Result<(), StepError> {
    match (proposal, progress) {
        (
            Proposal::GoalSuggestions { suggestions },
            ApplyProgress::GoalSuggestions {
                suggestions: suggestion_progress,
            },
        ) => {
            let snapshot = |sp: &Vec<SuggestionProgress>| ApplyProgress::GoalSuggestions {
                suggestions: sp.clone(),
            };
            for (i, suggestion) in suggestions.iter().enumerate() {
                let n = i + 1;
                let goal_id = match &suggestion_progress[i].goal_id {
                    Some(id) => id.clone(),
                    None => {
                        let id = Uuid::new_v4().to_string();
                        let target_date =
                            suggestion.goal.target_date.map(|d| d.to_string());
                        db.insert_goal(&NewGoal {
                            id: &id,
                            user_id,
                            title: &suggestion.goal.title,
                            description: suggestion.goal.description.as_deref(),
                            life_metric: suggestion.goal.life_metric.as_deref(),
                            target_date: target_date.as_deref(),
                        })
                        .map_err(|e| (format!("create goal {n}"), e.into()))?;
                        suggestion_progress[i].goal_id = Some(id.clone());
                        checkpoint(db, row, &snapshot(suggestion_progress))?;
                        id
                    }
                };
                result.created_goal_ids.push(goal_id.clone());

                for (j, habit) in suggestion.habits.iter().enumerate() {
                    let m = j + 1;
                    let habit_id = match &suggestion_progress[i].habits[j].habit_id {
                        Some(id) => id.clone(),
                        None => {
                            let id = Uuid::new_v4().to_string();
                            db.insert_habit(&id, user_id, &habit.title, habit.description.as_deref())
                                .map_err(|e| (format!("create habit {n}.{m}"), e.into()))?;
                            suggestion_progress[i].habits[j].habit_id = Some(id.clone());
                            checkpoint(db, row, &snapshot(suggestion_progress))?;
                            id
                        }
                    };
                    result.created_habit_ids.push(habit_id.clone());

                    if !suggestion_progress[i].habits[j].associated {
                        db.associate_habit(&goal_id, &habit_id)
                            .map_err(|e| (format!("associate habit {n}.{m}"), e.into()))?;
                        suggestion_progress[i].habits[j].associated = true;
                        checkpoint(db, row, &snapshot(suggestion_progress))?;
                    }
                }

                if suggestion.goal.start_timeline == StartTimeline::Now
                    && !suggestion_progress[i].focus_inserted
                {
                    let update = focus::add(db, user_id, &goal_id, None)
                        .map_err(|e| (format!("insert focus {n}"), e))?;
                    suggestion_progress[i].focus_inserted = true;
                    result.focus_overflow |= update.overflow_raised;
                    checkpoint(db, row, &snapshot(suggestion_progress))?;
                }
            }
            Ok(())
        }

        (
            Proposal::Optimization {
                ranking,
                replacements,
            },
            ApplyProgress::Optimization {
                focus_replaced,
                replacements: replacement_progress,
            },
        ) => {
            let snapshot = |fr: bool, rp: &Vec<ReplacementProgress>| ApplyProgress::Optimization {
                focus_replaced: fr,
                replacements: rp.clone(),
            };
            if !*focus_replaced {
                let ranked = ranking
                    .iter()
                    .map(|r| crate::types::FocusEntry {
                        goal_id: r.goal_id.clone(),
                        rank: r.rank,
                    })
                    .collect();
                let update = focus::set_all(db, user_id, ranked)
                    .map_err(|e| ("replace focus ranking".to_string(), e))?;
                *focus_replaced = true;
                result.focus_overflow |= update.overflow_raised;
                checkpoint(db, row, &snapshot(*focus_replaced, replacement_progress))?;
            }

            for (i, replacement) in replacements.iter().enumerate() {
                if !replacement_progress[i].old_archived {
                    let step = |e: crate::db::DbError| -> StepError {
                        (format!("archive habit {}", replacement.old_habit_id), e.into())
                    };
                    db.archive_association(&replacement.goal_id, &replacement.old_habit_id)
                        .map_err(step)?;
                    // The habit itself is only retired once no active goal
                    // still uses it; a habit shared with another goal keeps
                    // serving that goal.
                    let remaining =
                        db.goal_ids_for_habit(&replacement.old_habit_id).map_err(step)?;
                    if remaining.is_empty() {
                        db.archive_habit(&replacement.old_habit_id).map_err(step)?;
                    }
                    replacement_progress[i].old_archived = true;
                    checkpoint(db, row, &snapshot(*focus_replaced, replacement_progress))?;
                }

                let habit_id = match &replacement_progress[i].new_habit_id {
                    Some(id) => id.clone(),
                    None => {
                        let id = Uuid::new_v4().to_string();
                        db.insert_habit(
                            &id,
                            user_id,
                            &replacement.new_habit.title,
                            replacement.new_habit.description.as_deref(),
                        )
                        .map_err(|e| {
                            (format!("create replacement for {}", replacement.old_habit_id), e.into())
                        })?;
                        replacement_progress[i].new_habit_id = Some(id.clone());
                        checkpoint(db, row, &snapshot(*focus_replaced, replacement_progress))?;
                        id
                    }
                };
                result.created_habit_ids.push(habit_id.clone());

                if !replacement_progress[i].associated {
                    db.associate_habit(&replacement.goal_id, &habit_id)
                        .map_err(|e| {
                            (format!("associate replacement for {}", replacement.old_habit_id), e.into())
                        })?;
                    replacement_progress[i].associated = true;
                    checkpoint(db, row, &snapshot(*focus_replaced, replacement_progress))?;
                }
            }
            Ok(())
        }

        (Proposal::HabitReview { items }, ApplyProgress::HabitReview { logged }) => {
            if !*logged {
                for item in items.iter().filter(|i| i.completed_today) {
                    let goal_id = db
                        .goal_ids_for_habit(&item.habit_id)
                        .map_err(|e| (format!("log completion {}", item.habit_id), e.into()))?;
                    match ledger.log_completion(
                        db,
                        &item.habit_id,
                        user_id,
                        today,
                        goal_id.first().map(String::as_str),
                    ) {
                        Ok(_) => {}
                        // Already-logged completions are the expected case
                        // when the review confirmed a click-through.
                        Err(e) if e.is_conflict() => {}
                        Err(e) => {
                            return Err((format!("log completion {}", item.habit_id), e));
                        }
                    }
                }
                *logged = true;
                checkpoint(db, row, &ApplyProgress::HabitReview { logged: true })?;
            }
            Ok(())
        }

        // Insights carry no side effects; applying one only records the
        // state transition.
        (Proposal::Insight { .. }, ApplyProgress::Insight) => Ok(()),

        // Progress written for a different proposal shape. Start over with
        // a fresh progress record.
        (proposal, progress) => {
            log::warn!("Apply progress did not match proposal shape; resetting");
            *progress = initial_progress(proposal);
            run_steps(db, ledger, user_id, today, row, proposal, progress, result)
        }
    }
}

fn created_goals(progress: &ApplyProgress) -> Vec<String> {
    match progress {
        ApplyProgress::GoalSuggestions { suggestions } => suggestions
            .iter()
            .filter_map(|s| s.goal_id.clone())
            .collect(),
        _ => Vec::new(),
    }
}

fn created_habits(progress: &ApplyProgress) -> Vec<String> {
    match progress {
        ApplyProgress::GoalSuggestions { suggestions } => suggestions
            .iter()
            .flat_map(|s| s.habits.iter().filter_map(|h| h.habit_id.clone()))
            .collect(),
        ApplyProgress::Optimization { replacements, .. } => replacements
            .iter()
            .filter_map(|r| r.new_habit_id.clone())
            .collect(),
        _ => Vec::new(),
    }
}

fn load(db: &CoachDb, thread_id: &str, proposal_key: &str) -> Result<DbProposalState, CoachError> {
    db.get_proposal_state(thread_id, proposal_key)?
        .ok_or_else(|| CoachError::ProposalNotFound(proposal_key.to_string()))
}

fn state_of(row: &DbProposalState) -> Result<ProposalState, CoachError> {
    ProposalState::parse(&row.state).ok_or_else(|| CoachError::InvalidProposalState {
        from: row.state.clone(),
        action: "read",
    })
}

fn save(
    db: &CoachDb,
    row: &DbProposalState,
    state: ProposalState,
    progress: &ApplyProgress,
    result: Option<&ApplyResult>,
) -> Result<(), CoachError> {
    let progress_json = serde_json::to_string(progress)
        .expect("apply progress serialization to JSON is infallible");
    let result_json = result.map(|r| {
        serde_json::to_string(r).expect("apply result serialization to JSON is infallible")
    });
    db.upsert_proposal_state(
        &row.thread_id,
        &row.proposal_key,
        state.as_str(),
        &row.proposal_json,
        Some(&progress_json),
        result_json.as_deref(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::{GoalSuggestion, HabitReviewItem, RankedGoal};
    use crate::types::{FocusEntry, GoalDraft, HabitDraft};

    fn test_db() -> (tempfile::TempDir, CoachDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = CoachDb::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn date(s: &str) -> chrono::NaiveDate {
        s.parse().unwrap()
    }

    fn suggestion(title: &str, timeline: StartTimeline, habits: &[&str]) -> GoalSuggestion {
        GoalSuggestion {
            goal: GoalDraft {
                title: title.to_string(),
                description: None,
                life_metric: Some("health".to_string()),
                start_timeline: timeline,
                target_date: None,
            },
            habits: habits
                .iter()
                .map(|h| HabitDraft {
                    title: h.to_string(),
                    description: None,
                })
                .collect(),
        }
    }

    fn seeded(db: &CoachDb, proposal: &Proposal) {
        propose(db, "t1", "p1", proposal).unwrap();
    }

    #[test]
    fn accept_then_discard_transitions() {
        let (_dir, db) = test_db();
        let proposal = Proposal::Insight {
            title: "t".to_string(),
            explanation: "e".to_string(),
            confidence: 50,
            related_metrics: vec![],
        };
        seeded(&db, &proposal);

        accept(&db, "t1", "p1").unwrap();
        accept(&db, "t1", "p1").unwrap(); // idempotent
        discard(&db, "t1", "p1").unwrap();
        discard(&db, "t1", "p1").unwrap(); // idempotent

        // Discarded proposals cannot be accepted again.
        let err = accept(&db, "t1", "p1").unwrap_err();
        assert!(matches!(err, CoachError::InvalidProposalState { .. }));
    }

    #[test]
    fn apply_requires_acceptance_first() {
        let (_dir, db) = test_db();
        let ledger = Ledger::new();
        seeded(
            &db,
            &Proposal::GoalSuggestions {
                suggestions: vec![suggestion("Run a 10k", StartTimeline::Later, &[])],
            },
        );

        let err = apply(&db, &ledger, "t1", "p1", "u1", date("2024-03-10")).unwrap_err();
        assert!(matches!(
            err,
            CoachError::InvalidProposalState { action: "apply", .. }
        ));
    }

    #[test]
    fn apply_creates_goals_habits_and_focus_entries() {
        let (_dir, db) = test_db();
        let ledger = Ledger::new();
        seeded(
            &db,
            &Proposal::GoalSuggestions {
                suggestions: vec![suggestion(
                    "Run a 10k",
                    StartTimeline::Now,
                    &["Morning Run", "Stretch"],
                )],
            },
        );
        accept(&db, "t1", "p1").unwrap();

        let result = apply(&db, &ledger, "t1", "p1", "u1", date("2024-03-10")).unwrap();
        assert_eq!(result.created_goal_ids.len(), 1);
        assert_eq!(result.created_habit_ids.len(), 2);
        assert!(!result.focus_overflow);

        let goals = db.list_active_goals("u1").unwrap();
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].title, "Run a 10k");
        assert_eq!(db.habits_for_goal(&goals[0].id).unwrap().len(), 2);

        // startTimeline now put the goal in the focus set.
        let focus = focus::get(&db, "u1").unwrap();
        assert!(focus.contains(&result.created_goal_ids[0]));
    }

    #[test]
    fn reapplying_applied_proposal_returns_recorded_result() {
        let (_dir, db) = test_db();
        let ledger = Ledger::new();
        seeded(
            &db,
            &Proposal::GoalSuggestions {
                suggestions: vec![suggestion("Run a 10k", StartTimeline::Later, &["Morning Run"])],
            },
        );
        accept(&db, "t1", "p1").unwrap();

        let first = apply(&db, &ledger, "t1", "p1", "u1", date("2024-03-10")).unwrap();
        let second = apply(&db, &ledger, "t1", "p1", "u1", date("2024-03-10")).unwrap();

        assert_eq!(first.created_goal_ids, second.created_goal_ids);
        assert_eq!(first.created_habit_ids, second.created_habit_ids);
        // No duplicates were created.
        assert_eq!(db.list_active_goals("u1").unwrap().len(), 1);
        assert_eq!(db.list_active_habits("u1").unwrap().len(), 1);
    }

    #[test]
    fn retry_after_partial_failure_resumes_from_recorded_progress() {
        let (_dir, db) = test_db();
        let ledger = Ledger::new();
        let proposal = Proposal::GoalSuggestions {
            suggestions: vec![suggestion(
                "Run a 10k",
                StartTimeline::Later,
                &["Morning Run", "Stretch"],
            )],
        };
        seeded(&db, &proposal);

        // Simulate an apply that died after creating the goal and the first
        // habit: write those rows and the matching progress record, then
        // leave the proposal in apply_failed.
        db.insert_goal(&NewGoal {
            id: "g-done",
            user_id: "u1",
            title: "Run a 10k",
            description: None,
            life_metric: Some("health"),
            target_date: None,
        })
        .unwrap();
        db.insert_habit("h-done", "u1", "Morning Run", None).unwrap();
        db.associate_habit("g-done", "h-done").unwrap();
        let progress = serde_json::json!({
            "kind": "goal_suggestions",
            "suggestions": [{
                "goal_id": "g-done",
                "habits": [
                    {"habit_id": "h-done", "associated": true},
                    {"habit_id": null, "associated": false}
                ],
                "focus_inserted": false
            }]
        });
        let row = db.get_proposal_state("t1", "p1").unwrap().unwrap();
        db.upsert_proposal_state(
            "t1",
            "p1",
            "apply_failed",
            &row.proposal_json,
            Some(&progress.to_string()),
            None,
        )
        .unwrap();

        let result = apply(&db, &ledger, "t1", "p1", "u1", date("2024-03-10")).unwrap();

        // No second goal; only the missing habit was created.
        assert_eq!(db.list_active_goals("u1").unwrap().len(), 1);
        assert_eq!(result.created_goal_ids, vec!["g-done".to_string()]);
        let habits = db.habits_for_goal("g-done").unwrap();
        assert_eq!(habits.len(), 2);
        assert!(habits.iter().any(|h| h.title == "Stretch"));
        assert_eq!(result.created_habit_ids.len(), 2);
        assert_eq!(result.created_habit_ids[0], "h-done");

        let row = db.get_proposal_state("t1", "p1").unwrap().unwrap();
        assert_eq!(row.state, "applied");
    }

    #[test]
    fn apply_resumes_a_row_stranded_in_applying() {
        let (_dir, db) = test_db();
        let ledger = Ledger::new();
        seeded(
            &db,
            &Proposal::GoalSuggestions {
                suggestions: vec![suggestion("Run a 10k", StartTimeline::Later, &["Morning Run"])],
            },
        );

        // A process death mid-apply leaves the row in `applying` with the
        // goal already created and checkpointed.
        db.insert_goal(&NewGoal {
            id: "g-done",
            user_id: "u1",
            title: "Run a 10k",
            description: None,
            life_metric: Some("health"),
            target_date: None,
        })
        .unwrap();
        let progress = serde_json::json!({
            "kind": "goal_suggestions",
            "suggestions": [{
                "goal_id": "g-done",
                "habits": [{"habit_id": null, "associated": false}],
                "focus_inserted": false
            }]
        });
        let row = db.get_proposal_state("t1", "p1").unwrap().unwrap();
        db.upsert_proposal_state(
            "t1",
            "p1",
            "applying",
            &row.proposal_json,
            Some(&progress.to_string()),
            None,
        )
        .unwrap();

        let result = apply(&db, &ledger, "t1", "p1", "u1", date("2024-03-10")).unwrap();

        assert_eq!(result.created_goal_ids, vec!["g-done".to_string()]);
        assert_eq!(db.list_active_goals("u1").unwrap().len(), 1);
        assert_eq!(db.habits_for_goal("g-done").unwrap().len(), 1);
        let row = db.get_proposal_state("t1", "p1").unwrap().unwrap();
        assert_eq!(row.state, "applied");
    }

    #[test]
    fn failed_apply_records_progress_and_lands_in_apply_failed() {
        let (_dir, db) = test_db();
        let ledger = Ledger::new();
        db.insert_goal(&NewGoal {
            id: "g1",
            user_id: "u1",
            title: "Run a 10k",
            description: None,
            life_metric: None,
            target_date: None,
        })
        .unwrap();
        // Rank 3 with a single entry is not a contiguous ranking.
        seeded(
            &db,
            &Proposal::Optimization {
                ranking: vec![RankedGoal {
                    goal_id: "g1".to_string(),
                    rank: 3,
                    reason: String::new(),
                }],
                replacements: vec![],
            },
        );
        accept(&db, "t1", "p1").unwrap();

        let err = apply(&db, &ledger, "t1", "p1", "u1", date("2024-03-10")).unwrap_err();
        match err {
            CoachError::PartialApply { failed_step, .. } => {
                assert_eq!(failed_step, "replace focus ranking");
            }
            other => panic!("expected partial apply, got {other:?}"),
        }

        let row = db.get_proposal_state("t1", "p1").unwrap().unwrap();
        assert_eq!(row.state, "apply_failed");
        assert!(row.progress_json.is_some());
    }

    #[test]
    fn focus_insertion_at_capacity_raises_overflow_not_failure() {
        let (_dir, db) = test_db();
        let ledger = Ledger::new();
        // Fill the focus set to its default capacity of 3.
        for g in ["g1", "g2", "g3"] {
            focus::add(&db, "u1", g, None).unwrap();
        }
        seeded(
            &db,
            &Proposal::GoalSuggestions {
                suggestions: vec![suggestion("Run a 10k", StartTimeline::Now, &[])],
            },
        );
        accept(&db, "t1", "p1").unwrap();

        let result = apply(&db, &ledger, "t1", "p1", "u1", date("2024-03-10")).unwrap();
        assert!(result.focus_overflow);
        assert_eq!(focus::get(&db, "u1").unwrap().entries.len(), 4);

        let row = db.get_proposal_state("t1", "p1").unwrap().unwrap();
        assert_eq!(row.state, "applied");
    }

    #[test]
    fn optimization_apply_replaces_focus_and_swaps_habits() {
        let (_dir, db) = test_db();
        let ledger = Ledger::new();
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
        focus::set_all(
            &db,
            "u1",
            vec![
                FocusEntry {
                    goal_id: "g1".to_string(),
                    rank: 1,
                },
                FocusEntry {
                    goal_id: "g2".to_string(),
                    rank: 2,
                },
            ],
        )
        .unwrap();

        seeded(
            &db,
            &Proposal::Optimization {
                ranking: vec![
                    RankedGoal {
                        goal_id: "g2".to_string(),
                        rank: 1,
                        reason: String::new(),
                    },
                    RankedGoal {
                        goal_id: "g1".to_string(),
                        rank: 2,
                        reason: String::new(),
                    },
                ],
                replacements: vec![crate::proposal::HabitReplacement {
                    goal_id: "g1".to_string(),
                    old_habit_id: "h1".to_string(),
                    new_habit: HabitDraft {
                        title: "Interval Training".to_string(),
                        description: None,
                    },
                    rationale: String::new(),
                }],
            },
        );
        accept(&db, "t1", "p1").unwrap();

        let result = apply(&db, &ledger, "t1", "p1", "u1", date("2024-03-10")).unwrap();
        assert_eq!(result.created_habit_ids.len(), 1);

        let focus = focus::get(&db, "u1").unwrap();
        assert_eq!(focus.entries[0].goal_id, "g2");

        let habits = db.habits_for_goal("g1").unwrap();
        assert_eq!(habits.len(), 1);
        assert_eq!(habits[0].title, "Interval Training");
        assert!(db.get_habit("h1").unwrap().unwrap().archived);
    }

    #[test]
    fn replacement_keeps_habit_shared_with_another_goal() {
        let (_dir, db) = test_db();
        let ledger = Ledger::new();
        for (goal_id, title) in [("g1", "Run a 10k"), ("g2", "Stay active")] {
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
        db.associate_habit("g2", "h1").unwrap();

        seeded(
            &db,
            &Proposal::Optimization {
                ranking: vec![
                    RankedGoal {
                        goal_id: "g1".to_string(),
                        rank: 1,
                        reason: String::new(),
                    },
                    RankedGoal {
                        goal_id: "g2".to_string(),
                        rank: 2,
                        reason: String::new(),
                    },
                ],
                replacements: vec![crate::proposal::HabitReplacement {
                    goal_id: "g1".to_string(),
                    old_habit_id: "h1".to_string(),
                    new_habit: HabitDraft {
                        title: "Interval Training".to_string(),
                        description: None,
                    },
                    rationale: String::new(),
                }],
            },
        );
        accept(&db, "t1", "p1").unwrap();
        apply(&db, &ledger, "t1", "p1", "u1", date("2024-03-10")).unwrap();

        // g2 still uses the shared habit, so only g1's association went.
        assert!(!db.get_habit("h1").unwrap().unwrap().archived);
        assert!(db.habits_for_goal("g2").unwrap().iter().any(|h| h.id == "h1"));

        let g1_habits = db.habits_for_goal("g1").unwrap();
        assert_eq!(g1_habits.len(), 1);
        assert_eq!(g1_habits[0].title, "Interval Training");
    }

    #[test]
    fn habit_review_apply_logs_confirmed_completions_once() {
        let (_dir, db) = test_db();
        let ledger = Ledger::new();
        db.insert_habit("h1", "u1", "Morning Run", None).unwrap();
        let today = date("2024-03-10");

        // h1 was already logged through the manual path.
        ledger.log_completion(&db, "h1", "u1", today, None).unwrap();

        seeded(
            &db,
            &Proposal::HabitReview {
                items: vec![HabitReviewItem {
                    habit_id: "h1".to_string(),
                    title: "Morning Run".to_string(),
                    completed_today: true,
                    streak: 1,
                }],
            },
        );
        accept(&db, "t1", "p1").unwrap();

        // The duplicate is swallowed; the apply still succeeds.
        apply(&db, &ledger, "t1", "p1", "u1", today).unwrap();
        assert_eq!(db.completion_dates("h1", "u1", 10).unwrap().len(), 1);
    }

    #[test]
    fn unknown_proposal_key_is_not_found() {
        let (_dir, db) = test_db();
        let err = accept(&db, "t1", "missing").unwrap_err();
        assert!(matches!(err, CoachError::ProposalNotFound(_)));
    }
}
