//! Habit-completion extraction from free-form chat text.
//!
//! The model is asked for a constrained JSON array of completion claims;
//! malformed output fails closed to an empty list. Claims are matched
//! against candidate habit titles (exact case-insensitive first, substring
//! containment either direction as fallback); an unmatched claim is
//! dropped, never invented. Resolved claims are written through the ledger;
//! same-day conflicts are swallowed and only counted.

use chrono::{Duration, NaiveDate};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::db::{CoachDb, DbHabit};
use crate::error::CoachError;
use crate::ledger::Ledger;
use crate::prompts::{self, PromptParams, EXTRACTION_TEMPLATE};
use crate::provider::ModelProvider;
use crate::types::ChatMessage;

/// Upper bound on synthesized consecutive days for a date-less count claim.
const MAX_SYNTHESIZED_DAYS: u32 = 30;

/// A resolved completion claim: the habit it matched and the dates it
/// asserts.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionClaim {
    pub habit_id: String,
    pub habit_title_match: String,
    pub dates: Vec<NaiveDate>,
}

/// One completion actually written by `extract_and_log`.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedCompletion {
    pub habit_id: String,
    pub date: NaiveDate,
}

/// What extraction logged, and how many same-day duplicates it skipped.
/// Skipped conflicts are internal bookkeeping, not user-facing errors.
#[derive(Debug, Default)]
pub struct ExtractionSummary {
    pub logged: Vec<LoggedCompletion>,
    pub skipped_conflicts: u32,
}

#[derive(Debug, Deserialize)]
struct AiClaim {
    #[serde(default)]
    habit: String,
    #[serde(default)]
    dates: Vec<String>,
    #[serde(default)]
    occurrences: Option<u32>,
}

/// Extract structured completion claims from free-form text.
///
/// Date policy: explicit ISO dates are used verbatim; a bare occurrence
/// count synthesizes that many consecutive days ending `today`. That
/// synthesis is a deliberate heuristic, since the true historical dates are
/// unknowable from "I did it five times".
pub async fn extract(
    provider: &dyn ModelProvider,
    text: &str,
    candidates: &[DbHabit],
    timezone: Tz,
    today: NaiveDate,
) -> Result<Vec<CompletionClaim>, CoachError> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let mut context = format!("Today is {} ({}).\n\nCandidate habits:", today, timezone);
    for habit in candidates {
        context.push_str(&format!("\n- {}", habit.title));
    }

    let params = PromptParams {
        extra_context: context,
        ..Default::default()
    };
    let system_prompt = params.render(EXTRACTION_TEMPLATE);

    let response = provider
        .complete(&system_prompt, &[ChatMessage::user(text)])
        .await?;

    let Some(json) = prompts::extract_json_array(&response) else {
        log::warn!("Extraction output contained no JSON array; returning no claims");
        return Ok(Vec::new());
    };
    let ai_claims: Vec<AiClaim> = match serde_json::from_str(json) {
        Ok(claims) => claims,
        Err(e) => {
            log::warn!("Extraction output failed to parse, returning no claims: {e}");
            return Ok(Vec::new());
        }
    };

    let mut claims = Vec::new();
    for ai in ai_claims {
        let Some(habit) = match_candidate(&ai.habit, candidates) else {
            log::debug!("Dropping unmatched completion claim for '{}'", ai.habit);
            continue;
        };

        let mut dates: Vec<NaiveDate> = ai
            .dates
            .iter()
            .filter_map(|d| d.trim().parse::<NaiveDate>().ok())
            .collect();
        dates.dedup();

        if dates.is_empty() {
            let count = ai
                .occurrences
                .unwrap_or(1)
                .clamp(1, MAX_SYNTHESIZED_DAYS);
            dates = (0..count)
                .map(|i| today - Duration::days(i as i64))
                .collect();
        }

        claims.push(CompletionClaim {
            habit_id: habit.id.clone(),
            habit_title_match: habit.title.clone(),
            dates,
        });
    }

    Ok(claims)
}

/// Extract claims from `text` and write them through the ledger.
pub async fn extract_and_log(
    db: &CoachDb,
    provider: &dyn ModelProvider,
    ledger: &Ledger,
    user_id: &str,
    text: &str,
    timezone: Tz,
    today: NaiveDate,
) -> Result<ExtractionSummary, CoachError> {
    let candidates = db.list_active_habits(user_id)?;
    let claims = extract(provider, text, &candidates, timezone, today).await?;

    let mut summary = ExtractionSummary::default();
    for claim in claims {
        let goal_ids = db.goal_ids_for_habit(&claim.habit_id)?;
        let goal_id = goal_ids.first().map(String::as_str);

        for date in claim.dates {
            match ledger.log_completion(db, &claim.habit_id, user_id, date, goal_id) {
                Ok(_) => summary.logged.push(LoggedCompletion {
                    habit_id: claim.habit_id.clone(),
                    date,
                }),
                Err(e) if e.is_conflict() => {
                    log::debug!(
                        "Skipping duplicate completion for {} on {}",
                        claim.habit_id,
                        date
                    );
                    summary.skipped_conflicts += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    Ok(summary)
}

/// Exact case-insensitive title match first, then substring containment in
/// either direction.
fn match_candidate<'a>(claimed: &str, candidates: &'a [DbHabit]) -> Option<&'a DbHabit> {
    let needle = claimed.trim().to_lowercase();
    if needle.is_empty() {
        return None;
    }

    if let Some(exact) = candidates
        .iter()
        .find(|h| h.title.to_lowercase() == needle)
    {
        return Some(exact);
    }

    candidates.iter().find(|h| {
        let title = h.title.to_lowercase();
        title.contains(&needle) || needle.contains(&title)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::ScriptedProvider;

    fn habit(id: &str, title: &str) -> DbHabit {
        DbHabit {
            id: id.to_string(),
            user_id: "u1".to_string(),
            title: title.to_string(),
            description: None,
            archived: false,
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    fn test_db() -> (tempfile::TempDir, CoachDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = CoachDb::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn matches_run_claim_and_drops_unmatched() {
        // "I went for a run today and yesterday" with today = 2024-03-10.
        let provider = ScriptedProvider::new(vec![
            r#"[{"habit": "run", "dates": ["2024-03-10", "2024-03-09"]},
                {"habit": "meditate", "dates": ["2024-03-10"]}]"#,
        ]);
        let candidates = vec![habit("h1", "Morning Run"), habit("h2", "Read 10 pages")];

        let claims = extract(
            &provider,
            "I went for a run today and yesterday",
            &candidates,
            chrono_tz::UTC,
            date("2024-03-10"),
        )
        .await
        .unwrap();

        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].habit_title_match, "Morning Run");
        assert_eq!(
            claims[0].dates,
            vec![date("2024-03-10"), date("2024-03-09")]
        );
    }

    #[tokio::test]
    async fn exact_match_wins_over_substring() {
        let provider = ScriptedProvider::new(vec![
            r#"[{"habit": "read", "dates": ["2024-03-10"]}]"#,
        ]);
        let candidates = vec![habit("h1", "Read 10 pages"), habit("h2", "Read")];

        let claims = extract(&provider, "finished my read", &candidates, chrono_tz::UTC, date("2024-03-10"))
            .await
            .unwrap();
        assert_eq!(claims[0].habit_id, "h2");
    }

    #[tokio::test]
    async fn count_without_dates_synthesizes_consecutive_days() {
        let provider = ScriptedProvider::new(vec![
            r#"[{"habit": "Morning Run", "dates": [], "occurrences": 3}]"#,
        ]);
        let candidates = vec![habit("h1", "Morning Run")];

        let claims = extract(&provider, "ran three times this week", &candidates, chrono_tz::UTC, date("2024-03-10"))
            .await
            .unwrap();
        assert_eq!(
            claims[0].dates,
            vec![date("2024-03-10"), date("2024-03-09"), date("2024-03-08")]
        );
    }

    #[tokio::test]
    async fn malformed_output_fails_closed() {
        let provider = ScriptedProvider::new(vec!["I couldn't find any habits, sorry!"]);
        let candidates = vec![habit("h1", "Morning Run")];
        let claims = extract(&provider, "whatever", &candidates, chrono_tz::UTC, date("2024-03-10"))
            .await
            .unwrap();
        assert!(claims.is_empty());
    }

    #[tokio::test]
    async fn extract_and_log_swallows_conflicts() {
        let (_dir, db) = test_db();
        db.insert_habit("h1", "u1", "Morning Run", None).unwrap();
        let ledger = Ledger::new();

        // Pre-log 03-09 so one of the two claimed dates conflicts.
        ledger
            .log_completion(&db, "h1", "u1", date("2024-03-09"), None)
            .unwrap();

        let provider = ScriptedProvider::new(vec![
            r#"[{"habit": "Morning Run", "dates": ["2024-03-10", "2024-03-09"]}]"#,
        ]);
        let summary = extract_and_log(
            &db,
            &provider,
            &ledger,
            "u1",
            "ran today and yesterday",
            chrono_tz::UTC,
            date("2024-03-10"),
        )
        .await
        .unwrap();

        assert_eq!(summary.logged.len(), 1);
        assert_eq!(summary.logged[0].date, date("2024-03-10"));
        assert_eq!(summary.skipped_conflicts, 1);
    }

    #[tokio::test]
    async fn logged_completions_link_to_goal() {
        let (_dir, db) = test_db();
        db.insert_goal(&crate::db::NewGoal {
            id: "g1",
            user_id: "u1",
            title: "Run a 10k",
            description: None,
            life_metric: None,
            target_date: None,
        })
        .unwrap();
        db.insert_habit("h1", "u1", "Morning Run", None).unwrap();
        db.associate_habit("g1", "h1").unwrap();
        let ledger = Ledger::new();

        let provider = ScriptedProvider::new(vec![
            r#"[{"habit": "Morning Run", "dates": ["2024-03-10"]}]"#,
        ]);
        extract_and_log(
            &db,
            &provider,
            &ledger,
            "u1",
            "ran today",
            chrono_tz::UTC,
            date("2024-03-10"),
        )
        .await
        .unwrap();

        let goal = db.get_goal("g1").unwrap().unwrap();
        assert!(goal.progress > 0.0);
    }
}
