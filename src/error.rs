//! Error taxonomy for the coaching core.
//!
//! Errors are classified by how the caller should react:
//! - Retryable: model-call timeouts and network failures
//! - Conflict: expected conditions (duplicate completion) rendered as
//!   informational messages, never error banners
//! - Partial failure: multi-step apply that stopped midway, with enough
//!   detail for an idempotent retry
//! - Invalid input: rejected before any side effect

use chrono::NaiveDate;
use thiserror::Error;

use crate::db::DbError;
use crate::provider::ProviderError;

#[derive(Debug, Error)]
pub enum CoachError {
    // Transient/retryable
    #[error("Model provider error: {0}")]
    Provider(#[from] ProviderError),

    // Conflicts (expected, not exceptional)
    #[error("Habit {habit_id} already completed on {date}")]
    AlreadyCompletedToday { habit_id: String, date: NaiveDate },

    #[error("A completion request for habit {habit_id} is already in flight")]
    CompletionInFlight { habit_id: String },

    // Partial failure during multi-step apply
    #[error("Apply stopped at step '{failed_step}': {source_message}")]
    PartialApply {
        failed_step: String,
        created_goal_ids: Vec<String>,
        created_habit_ids: Vec<String>,
        source_message: String,
    },

    // Invalid input, rejected before any side effect
    #[error("Invalid ranking: {0}")]
    InvalidRanking(String),

    #[error("Proposal not found: {0}")]
    ProposalNotFound(String),

    #[error("Cannot {action} a proposal in state '{from}'")]
    InvalidProposalState { from: String, action: &'static str },

    #[error("Unknown goal referenced: {0}")]
    UnknownGoal(String),

    // Store faults
    #[error("Database error: {0}")]
    Db(#[from] DbError),
}

impl CoachError {
    /// Returns true if the caller should offer a "try again" action.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::PartialApply { .. } => true,
            _ => false,
        }
    }

    /// Returns true for expected conditions that should render as
    /// informational messages rather than errors.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyCompletedToday { .. } | Self::CompletionInFlight { .. }
        )
    }

    /// User-facing copy: conflicts and partial failures get specific
    /// messaging, transient failures a generic retry prompt.
    pub fn user_message(&self) -> String {
        match self {
            Self::Provider(_) => {
                "The coach is unreachable right now. Please try again.".to_string()
            }
            Self::AlreadyCompletedToday { date, .. } => {
                format!("Already done: this habit was logged for {}.", date)
            }
            Self::CompletionInFlight { .. } => {
                "That completion is still being saved.".to_string()
            }
            Self::PartialApply {
                failed_step,
                created_goal_ids,
                created_habit_ids,
                ..
            } => format!(
                "Applying stopped at '{}' after creating {} goal(s) and {} habit(s). \
                 Retrying will finish the remaining steps.",
                failed_step,
                created_goal_ids.len(),
                created_habit_ids.len()
            ),
            Self::InvalidRanking(msg) => format!("That ranking isn't valid: {}", msg),
            Self::ProposalNotFound(_) => "That suggestion is no longer available.".to_string(),
            Self::InvalidProposalState { from, action } => {
                format!("Can't {} this suggestion anymore (it is {}).", action, from)
            }
            Self::UnknownGoal(_) => "That goal doesn't exist anymore.".to_string(),
            Self::Db(_) => "Something went wrong saving your data.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_timeout_is_retryable() {
        let err = CoachError::Provider(ProviderError::Timeout(30));
        assert!(err.is_retryable());
        assert!(!err.is_conflict());
    }

    #[test]
    fn duplicate_completion_is_conflict_not_retryable() {
        let err = CoachError::AlreadyCompletedToday {
            habit_id: "h1".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 3, 10).unwrap(),
        };
        assert!(err.is_conflict());
        assert!(!err.is_retryable());
        assert!(err.user_message().contains("2024-03-10"));
    }

    #[test]
    fn partial_apply_message_counts_created_entities() {
        let err = CoachError::PartialApply {
            failed_step: "associate habit 2".to_string(),
            created_goal_ids: vec!["g1".to_string()],
            created_habit_ids: vec!["h1".to_string(), "h2".to_string()],
            source_message: "disk full".to_string(),
        };
        let msg = err.user_message();
        assert!(msg.contains("1 goal(s)"));
        assert!(msg.contains("2 habit(s)"));
        assert!(err.is_retryable());
    }
}
