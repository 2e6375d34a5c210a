//! Habit completion ledger: at most one completion per (habit, user, day).
//!
//! Every call path that records completions goes through here: the manual
//! click, chat extraction, and review flows. The database's uniqueness
//! constraint is the invariant; the in-flight marker is an advisory guard
//! that stops a double-fired request from the same actor before it reaches
//! the store and surfaces a confusing conflict.

use chrono::{Duration, NaiveDate};
use dashmap::DashMap;

use crate::db::{CoachDb, DbCompletion, DbError};
use crate::error::CoachError;
use crate::progress::{self, GoalProgressUpdate};

/// Outcome of a logged completion. Carries the updated goal progress (when
/// the completion was linked to a goal) so callers never need a follow-up
/// fetch.
#[derive(Debug)]
pub struct CompletionOutcome {
    pub record: DbCompletion,
    pub progress: Option<GoalProgressUpdate>,
}

/// The ledger's request-level state: in-flight markers per (user, habit).
#[derive(Default)]
pub struct Ledger {
    inflight: DashMap<(String, String), ()>,
}

struct InFlightGuard<'a> {
    map: &'a DashMap<(String, String), ()>,
    key: (String, String),
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completion for `date`.
    ///
    /// A same-day duplicate returns `AlreadyCompletedToday` (an expected
    /// conflict, not a failure). A concurrent request for the same habit
    /// from the same actor returns `CompletionInFlight` without touching
    /// the store.
    pub fn log_completion(
        &self,
        db: &CoachDb,
        habit_id: &str,
        user_id: &str,
        date: NaiveDate,
        goal_id: Option<&str>,
    ) -> Result<CompletionOutcome, CoachError> {
        let key = (user_id.to_string(), habit_id.to_string());
        if self.inflight.insert(key.clone(), ()).is_some() {
            return Err(CoachError::CompletionInFlight {
                habit_id: habit_id.to_string(),
            });
        }
        let _guard = InFlightGuard {
            map: &self.inflight,
            key,
        };

        let record = db
            .insert_completion(
                &uuid::Uuid::new_v4().to_string(),
                habit_id,
                user_id,
                date,
                goal_id,
            )
            .map_err(|e| match e {
                DbError::DuplicateCompletion => CoachError::AlreadyCompletedToday {
                    habit_id: habit_id.to_string(),
                    date,
                },
                other => CoachError::Db(other),
            })?;

        let progress = match goal_id {
            Some(goal_id) => Some(progress::recompute_for_goal(db, goal_id, user_id, date)?),
            None => None,
        };

        Ok(CompletionOutcome { record, progress })
    }

    pub fn completed_on(
        &self,
        db: &CoachDb,
        habit_id: &str,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<bool, CoachError> {
        Ok(db.completion_exists(habit_id, user_id, date)?)
    }

    /// Consecutive-day completion count ending today. Zero when today is
    /// not yet logged.
    pub fn streak(
        &self,
        db: &CoachDb,
        habit_id: &str,
        user_id: &str,
        today: NaiveDate,
    ) -> Result<u32, CoachError> {
        let dates = db.completion_dates(habit_id, user_id, 366)?;
        let mut expected = today;
        let mut streak = 0u32;
        for date in dates {
            if date > expected {
                // Future-dated rows can't extend a streak ending today.
                continue;
            }
            if date == expected {
                streak += 1;
                expected -= Duration::days(1);
            } else {
                break;
            }
        }
        Ok(streak)
    }
}
