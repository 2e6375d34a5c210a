//! Goal progress: a persisted value in [0, 100] combining a habit-derived
//! component with a bounded manual offset.
//!
//! The habit component is `min(90, average(habit contribution))`, where each
//! habit contributes its completion rate over the trailing 30-day window.
//! A manual "set progress" does not discard the habit component; it is
//! stored as an offset on top of it, so later completions keep moving the
//! displayed value. The combined value is clamped to [0, 100] and persisted;
//! reads never recompute.

use chrono::{Duration, NaiveDate};

use crate::db::CoachDb;
use crate::error::CoachError;

/// The habit-derived component never exceeds this; the last stretch to 100
/// is always a deliberate act (manual set or target completion).
pub const HABIT_COMPONENT_CAP: f64 = 90.0;

/// Manual offsets are bounded so a single edit cannot swamp the habit signal.
pub const MANUAL_OFFSET_BOUND: f64 = 25.0;

/// Trailing window over which a habit's contribution is measured.
pub const CONTRIBUTION_WINDOW_DAYS: i64 = 30;

/// Returned by every progress-changing operation so callers can update
/// their view without a blanket re-fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct GoalProgressUpdate {
    pub goal_id: String,
    pub habit_component: f64,
    pub manual_offset: f64,
    pub progress: f64,
}

/// Combine the two components and clamp to the displayable range.
pub fn combined(habit_component: f64, manual_offset: f64) -> f64 {
    (habit_component + manual_offset).clamp(0.0, 100.0)
}

/// `min(90, average(contributions))`; zero when the goal has no habits.
pub fn habit_component(contributions: &[f64]) -> f64 {
    if contributions.is_empty() {
        return 0.0;
    }
    let avg = contributions.iter().sum::<f64>() / contributions.len() as f64;
    avg.min(HABIT_COMPONENT_CAP)
}

/// A habit's contribution percent: completions in the trailing window over
/// the window length, capped at 100.
fn habit_contribution(
    db: &CoachDb,
    habit_id: &str,
    user_id: &str,
    today: NaiveDate,
) -> Result<f64, CoachError> {
    let window_start = today - Duration::days(CONTRIBUTION_WINDOW_DAYS - 1);
    let completed = db.completions_since(habit_id, user_id, window_start)?;
    let pct = completed as f64 / CONTRIBUTION_WINDOW_DAYS as f64 * 100.0;
    Ok(pct.min(100.0))
}

/// Recompute and persist a goal's progress from its habits, retaining the
/// stored manual offset. Called incrementally after habit completions.
pub fn recompute_for_goal(
    db: &CoachDb,
    goal_id: &str,
    user_id: &str,
    today: NaiveDate,
) -> Result<GoalProgressUpdate, CoachError> {
    let goal = db
        .get_goal(goal_id)?
        .ok_or_else(|| CoachError::UnknownGoal(goal_id.to_string()))?;

    let habits = db.habits_for_goal(goal_id)?;
    let mut contributions = Vec::with_capacity(habits.len());
    for habit in &habits {
        contributions.push(habit_contribution(db, &habit.id, user_id, today)?);
    }

    let component = habit_component(&contributions);
    let progress = combined(component, goal.progress_manual);
    db.update_goal_progress(goal_id, component, goal.progress_manual, progress)?;

    Ok(GoalProgressUpdate {
        goal_id: goal_id.to_string(),
        habit_component: component,
        manual_offset: goal.progress_manual,
        progress,
    })
}

/// Overwrite displayed progress with a user-chosen value. The value is
/// decomposed into the current habit component plus a bounded manual offset,
/// so the habit signal keeps contributing afterwards.
pub fn set_manual(
    db: &CoachDb,
    goal_id: &str,
    user_id: &str,
    requested: f64,
    today: NaiveDate,
) -> Result<GoalProgressUpdate, CoachError> {
    let recomputed = recompute_for_goal(db, goal_id, user_id, today)?;

    let target = requested.clamp(0.0, 100.0);
    let offset =
        (target - recomputed.habit_component).clamp(-MANUAL_OFFSET_BOUND, MANUAL_OFFSET_BOUND);
    let progress = combined(recomputed.habit_component, offset);
    db.update_goal_progress(goal_id, recomputed.habit_component, offset, progress)?;

    Ok(GoalProgressUpdate {
        goal_id: goal_id.to_string(),
        habit_component: recomputed.habit_component,
        manual_offset: offset,
        progress,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewGoal;

    fn test_db() -> (tempfile::TempDir, CoachDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = CoachDb::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn seed_goal(db: &CoachDb, goal_id: &str) {
        db.insert_goal(&NewGoal {
            id: goal_id,
            user_id: "u1",
            title: "Run a 10k",
            description: None,
            life_metric: Some("health"),
            target_date: None,
        })
        .unwrap();
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn combined_always_clamps() {
        assert_eq!(combined(90.0, 25.0), 100.0);
        assert_eq!(combined(0.0, -25.0), 0.0);
        assert_eq!(combined(50.0, 10.0), 60.0);
        assert_eq!(combined(500.0, 500.0), 100.0);
    }

    #[test]
    fn habit_component_caps_at_ninety() {
        assert_eq!(habit_component(&[]), 0.0);
        assert_eq!(habit_component(&[100.0, 100.0]), HABIT_COMPONENT_CAP);
        assert_eq!(habit_component(&[30.0, 60.0]), 45.0);
    }

    #[test]
    fn recompute_reflects_completions_in_window() {
        let (_dir, db) = test_db();
        seed_goal(&db, "g1");
        db.insert_habit("h1", "u1", "Morning Run", None).unwrap();
        db.associate_habit("g1", "h1").unwrap();

        let today = date("2024-03-10");
        for (i, day) in ["2024-03-10", "2024-03-09", "2024-03-08"].iter().enumerate() {
            db.insert_completion(&format!("c{i}"), "h1", "u1", date(day), Some("g1"))
                .unwrap();
        }

        let update = recompute_for_goal(&db, "g1", "u1", today).unwrap();
        // 3 of 30 days → 10%.
        assert!((update.habit_component - 10.0).abs() < 1e-9);
        assert_eq!(update.progress, update.habit_component);

        // Persisted, not just returned.
        let goal = db.get_goal("g1").unwrap().unwrap();
        assert!((goal.progress - 10.0).abs() < 1e-9);
    }

    #[test]
    fn manual_set_keeps_bounded_offset() {
        let (_dir, db) = test_db();
        seed_goal(&db, "g1");
        db.insert_habit("h1", "u1", "Morning Run", None).unwrap();
        db.associate_habit("g1", "h1").unwrap();
        let today = date("2024-03-10");

        // No completions yet: component 0, request 80 → offset clamped to 25.
        let update = set_manual(&db, "g1", "u1", 80.0, today).unwrap();
        assert_eq!(update.manual_offset, MANUAL_OFFSET_BOUND);
        assert_eq!(update.progress, MANUAL_OFFSET_BOUND);

        // A completion afterwards still moves the displayed value.
        db.insert_completion("c1", "h1", "u1", today, Some("g1"))
            .unwrap();
        let update = recompute_for_goal(&db, "g1", "u1", today).unwrap();
        assert!(update.progress > MANUAL_OFFSET_BOUND);
    }

    #[test]
    fn manual_set_clamps_requested_range() {
        let (_dir, db) = test_db();
        seed_goal(&db, "g1");
        let today = date("2024-03-10");

        let update = set_manual(&db, "g1", "u1", 1000.0, today).unwrap();
        assert!(update.progress <= 100.0);
        let update = set_manual(&db, "g1", "u1", -50.0, today).unwrap();
        assert!(update.progress >= 0.0);
    }
}
