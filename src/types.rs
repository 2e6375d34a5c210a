//! Shared domain types for the coaching core.
//!
//! Row-level types returned by the database live in `db.rs`; the types here
//! are the ones that cross module boundaries: chat messages, drafts carried
//! inside proposals, and the focus set snapshot.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// A single message in a conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Where a newly created goal lands relative to the focus set.
///
/// `Now` inserts the goal into the focus set on apply; `Soon` and `Later`
/// leave it in the backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartTimeline {
    Now,
    Soon,
    Later,
}

impl StartTimeline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Now => "now",
            Self::Soon => "soon",
            Self::Later => "later",
        }
    }

    /// Parse a model-provided timeline string. Unknown values fall back to
    /// `Later` so a garbled timeline never triggers focus-set side effects.
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "now" => Self::Now,
            "soon" => Self::Soon,
            _ => Self::Later,
        }
    }
}

/// A goal as proposed by a handler, before any entity exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalDraft {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Life-metric / category reference (e.g. "health", "career").
    #[serde(default)]
    pub life_metric: Option<String>,
    pub start_timeline: StartTimeline,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_date: Option<NaiveDate>,
}

/// A habit as proposed by a handler, before any entity exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HabitDraft {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// One entry of the ranked focus set. Ranks are 1-based and contiguous.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusEntry {
    pub goal_id: String,
    pub rank: u32,
}

/// Snapshot of a user's focus set plus its configured capacity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusSnapshot {
    pub entries: Vec<FocusEntry>,
    pub capacity: u8,
    /// True when the set currently holds more goals than its capacity.
    pub overflow: bool,
}

impl FocusSnapshot {
    pub fn contains(&self, goal_id: &str) -> bool {
        self.entries.iter().any(|e| e.goal_id == goal_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_str() {
        assert_eq!(Role::from_str("user"), Some(Role::User));
        assert_eq!(Role::from_str(Role::Assistant.as_str()), Some(Role::Assistant));
        assert_eq!(Role::from_str("system"), None);
    }

    #[test]
    fn timeline_parse_is_lenient() {
        assert_eq!(StartTimeline::parse_lenient("NOW"), StartTimeline::Now);
        assert_eq!(StartTimeline::parse_lenient(" soon "), StartTimeline::Soon);
        assert_eq!(StartTimeline::parse_lenient("whenever"), StartTimeline::Later);
    }

    #[test]
    fn goal_draft_serializes_camel_case() {
        let draft = GoalDraft {
            title: "Run a 10k".to_string(),
            description: None,
            life_metric: Some("health".to_string()),
            start_timeline: StartTimeline::Now,
            target_date: None,
        };
        let json = serde_json::to_string(&draft).unwrap();
        assert!(json.contains("\"startTimeline\":\"now\""));
        assert!(json.contains("\"lifeMetric\":\"health\""));
    }
}
