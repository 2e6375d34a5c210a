//! Conversation context assembly.
//!
//! Gathers everything a handler may need (profile, a capped window of
//! recent messages, the focus set, and the active goal/habit snapshot)
//! into one immutable object per inbound message. Pure reads; the context
//! is built once per routing decision and discarded with it.

use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;

use crate::db::{CoachDb, DbGoal, DbHabit, DbProposalState};
use crate::error::CoachError;
use crate::focus;
use crate::prompts::PromptParams;
use crate::proposal;
use crate::types::{ChatMessage, FocusSnapshot, Role};

/// Recent-message window passed to the model.
pub const RECENT_MESSAGE_LIMIT: u32 = 20;

/// An active goal together with its non-archived habits.
#[derive(Debug, Clone)]
pub struct GoalWithHabits {
    pub goal: DbGoal,
    pub habits: Vec<DbHabit>,
}

/// Bounded snapshot handed to exactly one handler per inbound message.
#[derive(Debug)]
pub struct ConversationContext {
    pub user_id: String,
    pub thread_id: String,
    pub profile: BTreeMap<String, String>,
    pub recent_messages: Vec<ChatMessage>,
    pub focus: FocusSnapshot,
    pub goals: Vec<GoalWithHabits>,
    /// All active habits for the user (extraction candidates).
    pub habits: Vec<DbHabit>,
    /// Proposal lifecycle rows for this thread, read back server-side.
    pub proposal_states: Vec<DbProposalState>,
    pub timezone: Tz,
    pub today: NaiveDate,
}

/// Build the context for one inbound message.
pub fn assemble(
    db: &CoachDb,
    user_id: &str,
    thread_id: &str,
) -> Result<ConversationContext, CoachError> {
    let profile = db.profile(user_id)?;
    let timezone = profile
        .get("timezone")
        .and_then(|tz| tz.parse::<Tz>().ok())
        .unwrap_or(chrono_tz::UTC);
    let today = Utc::now().with_timezone(&timezone).date_naive();

    let recent_messages = db
        .recent_messages(thread_id, RECENT_MESSAGE_LIMIT)?
        .into_iter()
        .filter_map(|row| {
            let role = Role::from_str(&row.role)?;
            // Assistant rows carry the encoded wire format; the prompt only
            // needs the human-readable part.
            let (text, _) = proposal::decode(&row.content);
            Some(ChatMessage {
                role,
                content: text,
            })
        })
        .collect();

    let focus = focus::get(db, user_id)?;

    let mut goals = Vec::new();
    for goal in db.list_active_goals(user_id)? {
        let habits = db.habits_for_goal(&goal.id)?;
        goals.push(GoalWithHabits { goal, habits });
    }

    let habits = db.list_active_habits(user_id)?;
    let proposal_states = db.list_proposal_states(thread_id)?;

    Ok(ConversationContext {
        user_id: user_id.to_string(),
        thread_id: thread_id.to_string(),
        profile,
        recent_messages,
        focus,
        goals,
        habits,
        proposal_states,
        timezone,
        today,
    })
}

impl ConversationContext {
    pub fn goal_title(&self, goal_id: &str) -> Option<&str> {
        self.goals
            .iter()
            .find(|g| g.goal.id == goal_id)
            .map(|g| g.goal.title.as_str())
    }

    pub fn has_goal(&self, goal_id: &str) -> bool {
        self.goals.iter().any(|g| g.goal.id == goal_id)
    }

    pub fn has_habit(&self, habit_id: &str) -> bool {
        self.habits.iter().any(|h| h.id == habit_id)
    }

    /// Render the shared prompt blocks. Handler-specific context goes in
    /// `extra_context` afterwards.
    pub fn prompt_params(&self) -> PromptParams {
        let profile = self
            .profile
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n");

        let focus_set = self
            .focus
            .entries
            .iter()
            .map(|e| {
                let title = self.goal_title(&e.goal_id).unwrap_or(e.goal_id.as_str());
                format!("{}. {} [{}]", e.rank, title, e.goal_id)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let working_set = self
            .goals
            .iter()
            .map(|g| {
                let mut block = format!(
                    "- {} [{}]: {:.0}% complete",
                    g.goal.title, g.goal.id, g.goal.progress
                );
                for habit in &g.habits {
                    block.push_str(&format!("\n    * {} [{}]", habit.title, habit.id));
                }
                block
            })
            .collect::<Vec<_>>()
            .join("\n");

        let recent_messages = self
            .recent_messages
            .iter()
            .map(|m| format!("{}: {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");

        PromptParams {
            profile,
            focus_set,
            working_set,
            recent_messages,
            extra_context: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NewGoal;
    use crate::proposal::{encode, Proposal};
    use crate::types::FocusEntry;

    fn test_db() -> (tempfile::TempDir, CoachDb) {
        let dir = tempfile::tempdir().unwrap();
        let db = CoachDb::open_at(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    fn seed(db: &CoachDb) {
        db.insert_goal(&NewGoal {
            id: "g1",
            user_id: "u1",
            title: "Run a 10k",
            description: None,
            life_metric: Some("health"),
            target_date: None,
        })
        .unwrap();
        db.insert_habit("h1", "u1", "Morning Run", None).unwrap();
        db.associate_habit("g1", "h1").unwrap();
        db.replace_focus(
            "u1",
            &[FocusEntry {
                goal_id: "g1".to_string(),
                rank: 1,
            }],
        )
        .unwrap();
        db.set_profile_value("u1", "name", "Sam").unwrap();
    }

    #[test]
    fn assembles_snapshot_and_prompt_blocks() {
        let (_dir, db) = test_db();
        seed(&db);
        db.insert_message("m1", "t1", "u1", "user", "hello").unwrap();

        let ctx = assemble(&db, "u1", "t1").unwrap();
        assert_eq!(ctx.goals.len(), 1);
        assert_eq!(ctx.habits.len(), 1);
        assert_eq!(ctx.focus.entries.len(), 1);
        assert_eq!(ctx.recent_messages.len(), 1);

        let params = ctx.prompt_params();
        assert!(params.profile.contains("name: Sam"));
        assert!(params.focus_set.contains("1. Run a 10k [g1]"));
        assert!(params.working_set.contains("Morning Run [h1]"));
        assert!(params.recent_messages.contains("user: hello"));
    }

    #[test]
    fn assistant_history_is_decoded_to_plain_text() {
        let (_dir, db) = test_db();
        let encoded = encode(
            "Here are some ideas.",
            &Proposal::GoalSuggestions {
                suggestions: vec![],
            },
        );
        db.insert_message("m1", "t1", "u1", "assistant", &encoded)
            .unwrap();

        let ctx = assemble(&db, "u1", "t1").unwrap();
        assert_eq!(ctx.recent_messages[0].content, "Here are some ideas.");
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let (_dir, db) = test_db();
        db.set_profile_value("u1", "timezone", "Mars/Olympus").unwrap();
        let ctx = assemble(&db, "u1", "t1").unwrap();
        assert_eq!(ctx.timezone, chrono_tz::UTC);
    }

    #[test]
    fn timezone_from_profile_is_used() {
        let (_dir, db) = test_db();
        db.set_profile_value("u1", "timezone", "America/New_York")
            .unwrap();
        let ctx = assemble(&db, "u1", "t1").unwrap();
        assert_eq!(ctx.timezone, chrono_tz::America::New_York);
    }
}
