//! SQLite-backed domain store for goals, habits, completions, focus entries,
//! chat history, and proposal lifecycle state.
//!
//! The database lives at `~/.coach/coach.db`. SQLite gives this layer exactly
//! what the core assumes of its store: per-statement atomic writes and
//! nothing more. No multi-entity transactions are used here; the proposal
//! lifecycle's apply path is deliberately built on single-entity writes with
//! step-level progress recording (see `lifecycle.rs`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode};
use serde::Serialize;
use thiserror::Error;

use crate::types::FocusEntry;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    /// A completion already exists for this (habit, user, date).
    /// Surfaced to callers as the distinct "already completed today"
    /// condition rather than a generic failure.
    #[error("Completion already recorded for this habit and date")]
    DuplicateCompletion,
}

/// A row from the `goals` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbGoal {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub life_metric: Option<String>,
    pub target_date: Option<String>,
    pub status: String,
    /// Habit-contribution component of progress, capped at 90.
    pub progress_habit: f64,
    /// Bounded manual offset applied on top of the habit component.
    pub progress_manual: f64,
    /// Combined, clamped value persisted for display.
    pub progress: f64,
    pub created_at: String,
    pub updated_at: String,
}

/// A row from the `habits` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbHabit {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub archived: bool,
    pub created_at: String,
}

/// A row from the `habit_completions` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCompletion {
    pub id: String,
    pub habit_id: String,
    pub user_id: String,
    pub completed_on: NaiveDate,
    pub goal_id: Option<String>,
    pub logged_at: String,
}

/// A row from the `chat_messages` table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbChatMessage {
    pub id: String,
    pub thread_id: String,
    pub user_id: String,
    pub role: String,
    pub content: String,
    pub created_at: String,
}

/// A row from the `proposal_states` table. Proposal lifecycle state is
/// persisted server-side, keyed by (thread, proposal key), so it survives
/// reloads without any client-local storage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DbProposalState {
    pub thread_id: String,
    pub proposal_key: String,
    pub state: String,
    pub proposal_json: String,
    pub progress_json: Option<String>,
    pub result_json: Option<String>,
    pub updated_at: String,
}

/// Fields for a new goal row. Progress starts at zero.
#[derive(Debug, Clone)]
pub struct NewGoal<'a> {
    pub id: &'a str,
    pub user_id: &'a str,
    pub title: &'a str,
    pub description: Option<&'a str>,
    pub life_metric: Option<&'a str>,
    pub target_date: Option<&'a str>,
}

/// Domain store handle. The connection is behind a non-poisoning mutex so a
/// panicking task can never wedge every subsequent store access.
pub struct CoachDb {
    conn: Mutex<Connection>,
}

impl CoachDb {
    /// Open (or create) the database at the default location.
    pub fn open() -> Result<Self, DbError> {
        let dir = db_dir()?;
        std::fs::create_dir_all(&dir).map_err(DbError::CreateDir)?;
        Self::open_at(&dir.join("coach.db"))
    }

    /// Open (or create) a database at an explicit path. Used by tests.
    pub fn open_at(path: &Path) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // -----------------------------------------------------------------
    // Profile
    // -----------------------------------------------------------------

    pub fn set_profile_value(&self, user_id: &str, key: &str, value: &str) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO profile (user_id, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, key) DO UPDATE SET value = excluded.value",
            params![user_id, key, value],
        )?;
        Ok(())
    }

    pub fn profile(&self, user_id: &str) -> Result<BTreeMap<String, String>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM profile WHERE user_id = ?1")?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut map = BTreeMap::new();
        for row in rows {
            let (k, v) = row?;
            map.insert(k, v);
        }
        Ok(map)
    }

    // -----------------------------------------------------------------
    // Goals
    // -----------------------------------------------------------------

    pub fn insert_goal(&self, goal: &NewGoal) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO goals (id, user_id, title, description, life_metric, target_date,
                                status, progress_habit, progress_manual, progress,
                                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'active', 0, 0, 0, ?7, ?7)",
            params![
                goal.id,
                goal.user_id,
                goal.title,
                goal.description,
                goal.life_metric,
                goal.target_date,
                now
            ],
        )?;
        Ok(())
    }

    pub fn get_goal(&self, id: &str) -> Result<Option<DbGoal>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", GOAL_SELECT))?;
        let mut rows = stmt.query_map(params![id], map_goal)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_active_goals(&self, user_id: &str) -> Result<Vec<DbGoal>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE user_id = ?1 AND status = 'active' ORDER BY created_at",
            GOAL_SELECT
        ))?;
        let rows = stmt.query_map(params![user_id], map_goal)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn update_goal_progress(
        &self,
        goal_id: &str,
        habit_component: f64,
        manual_offset: f64,
        progress: f64,
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE goals SET progress_habit = ?2, progress_manual = ?3, progress = ?4,
                              updated_at = ?5
             WHERE id = ?1",
            params![goal_id, habit_component, manual_offset, progress, now],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Habits
    // -----------------------------------------------------------------

    pub fn insert_habit(
        &self,
        id: &str,
        user_id: &str,
        title: &str,
        description: Option<&str>,
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO habits (id, user_id, title, description, archived, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![id, user_id, title, description, now],
        )?;
        Ok(())
    }

    pub fn get_habit(&self, id: &str) -> Result<Option<DbHabit>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{} WHERE id = ?1", HABIT_SELECT))?;
        let mut rows = stmt.query_map(params![id], map_habit)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_active_habits(&self, user_id: &str) -> Result<Vec<DbHabit>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE user_id = ?1 AND archived = 0 ORDER BY created_at",
            HABIT_SELECT
        ))?;
        let rows = stmt.query_map(params![user_id], map_habit)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn archive_habit(&self, id: &str) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.execute("UPDATE habits SET archived = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn associate_habit(&self, goal_id: &str, habit_id: &str) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO goal_habits (goal_id, habit_id, archived, created_at)
             VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(goal_id, habit_id) DO UPDATE SET archived = 0",
            params![goal_id, habit_id, now],
        )?;
        Ok(())
    }

    pub fn archive_association(&self, goal_id: &str, habit_id: &str) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE goal_habits SET archived = 1 WHERE goal_id = ?1 AND habit_id = ?2",
            params![goal_id, habit_id],
        )?;
        Ok(())
    }

    /// Goals a habit is actively associated with, oldest association first.
    pub fn goal_ids_for_habit(&self, habit_id: &str) -> Result<Vec<String>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT goal_id FROM goal_habits
             WHERE habit_id = ?1 AND archived = 0 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![habit_id], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn habits_for_goal(&self, goal_id: &str) -> Result<Vec<DbHabit>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT h.id, h.user_id, h.title, h.description, h.archived, h.created_at
             FROM habits h
             JOIN goal_habits gh ON gh.habit_id = h.id
             WHERE gh.goal_id = ?1 AND gh.archived = 0 AND h.archived = 0
             ORDER BY gh.created_at",
        )?;
        let rows = stmt.query_map(params![goal_id], map_habit)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    // -----------------------------------------------------------------
    // Habit completions
    // -----------------------------------------------------------------

    /// Insert a completion record. The UNIQUE(habit_id, user_id,
    /// completed_on) constraint enforces at-most-one completion per habit
    /// per calendar day; a violation maps to `DbError::DuplicateCompletion`.
    pub fn insert_completion(
        &self,
        id: &str,
        habit_id: &str,
        user_id: &str,
        completed_on: NaiveDate,
        goal_id: Option<&str>,
    ) -> Result<DbCompletion, DbError> {
        let logged_at = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO habit_completions (id, habit_id, user_id, completed_on, goal_id, logged_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                habit_id,
                user_id,
                completed_on.to_string(),
                goal_id,
                logged_at
            ],
        );
        match result {
            Ok(_) => Ok(DbCompletion {
                id: id.to_string(),
                habit_id: habit_id.to_string(),
                user_id: user_id.to_string(),
                completed_on,
                goal_id: goal_id.map(ToString::to_string),
                logged_at,
            }),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == ErrorCode::ConstraintViolation =>
            {
                Err(DbError::DuplicateCompletion)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn completion_exists(
        &self,
        habit_id: &str,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<bool, DbError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM habit_completions
             WHERE habit_id = ?1 AND user_id = ?2 AND completed_on = ?3",
            params![habit_id, user_id, date.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Completion dates for a habit, most recent first.
    pub fn completion_dates(
        &self,
        habit_id: &str,
        user_id: &str,
        limit: u32,
    ) -> Result<Vec<NaiveDate>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT completed_on FROM habit_completions
             WHERE habit_id = ?1 AND user_id = ?2
             ORDER BY completed_on DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![habit_id, user_id, limit], |row| {
            row.get::<_, String>(0)
        })?;
        let mut dates = Vec::new();
        for row in rows {
            if let Ok(date) = row?.parse::<NaiveDate>() {
                dates.push(date);
            }
        }
        Ok(dates)
    }

    pub fn completions_since(
        &self,
        habit_id: &str,
        user_id: &str,
        since: NaiveDate,
    ) -> Result<u32, DbError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM habit_completions
             WHERE habit_id = ?1 AND user_id = ?2 AND completed_on >= ?3",
            params![habit_id, user_id, since.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    // -----------------------------------------------------------------
    // Focus set
    // -----------------------------------------------------------------

    pub fn focus_entries(&self, user_id: &str) -> Result<Vec<FocusEntry>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT goal_id, rank FROM focus_entries WHERE user_id = ?1 ORDER BY rank",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(FocusEntry {
                goal_id: row.get(0)?,
                rank: row.get(1)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// Replace the user's focus set wholesale. The focus set is one logical
    /// entity; replacing it is a single keyed write from the store's
    /// perspective.
    pub fn replace_focus(&self, user_id: &str, entries: &[FocusEntry]) -> Result<(), DbError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM focus_entries WHERE user_id = ?1",
            params![user_id],
        )?;
        for entry in entries {
            tx.execute(
                "INSERT INTO focus_entries (user_id, goal_id, rank) VALUES (?1, ?2, ?3)",
                params![user_id, entry.goal_id, entry.rank],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Chat history
    // -----------------------------------------------------------------

    pub fn insert_message(
        &self,
        id: &str,
        thread_id: &str,
        user_id: &str,
        role: &str,
        content: &str,
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chat_messages (id, thread_id, user_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, thread_id, user_id, role, content, now],
        )?;
        Ok(())
    }

    /// The most recent `limit` messages of a thread, in chronological order.
    pub fn recent_messages(
        &self,
        thread_id: &str,
        limit: u32,
    ) -> Result<Vec<DbChatMessage>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, thread_id, user_id, role, content, created_at FROM chat_messages
             WHERE thread_id = ?1 ORDER BY rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![thread_id, limit], |row| {
            Ok(DbChatMessage {
                id: row.get(0)?,
                thread_id: row.get(1)?,
                user_id: row.get(2)?,
                role: row.get(3)?,
                content: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        let mut messages = rows.collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    // -----------------------------------------------------------------
    // Proposal lifecycle state
    // -----------------------------------------------------------------

    pub fn upsert_proposal_state(
        &self,
        thread_id: &str,
        proposal_key: &str,
        state: &str,
        proposal_json: &str,
        progress_json: Option<&str>,
        result_json: Option<&str>,
    ) -> Result<(), DbError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO proposal_states
                 (thread_id, proposal_key, state, proposal_json, progress_json, result_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(thread_id, proposal_key) DO UPDATE SET
                 state = excluded.state,
                 proposal_json = excluded.proposal_json,
                 progress_json = excluded.progress_json,
                 result_json = excluded.result_json,
                 updated_at = excluded.updated_at",
            params![
                thread_id,
                proposal_key,
                state,
                proposal_json,
                progress_json,
                result_json,
                now
            ],
        )?;
        Ok(())
    }

    pub fn get_proposal_state(
        &self,
        thread_id: &str,
        proposal_key: &str,
    ) -> Result<Option<DbProposalState>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE thread_id = ?1 AND proposal_key = ?2",
            PROPOSAL_SELECT
        ))?;
        let mut rows = stmt.query_map(params![thread_id, proposal_key], map_proposal_state)?;
        Ok(rows.next().transpose()?)
    }

    pub fn list_proposal_states(&self, thread_id: &str) -> Result<Vec<DbProposalState>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE thread_id = ?1 ORDER BY updated_at",
            PROPOSAL_SELECT
        ))?;
        let rows = stmt.query_map(params![thread_id], map_proposal_state)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}

const GOAL_SELECT: &str = "SELECT id, user_id, title, description, life_metric, target_date,
                                  status, progress_habit, progress_manual, progress,
                                  created_at, updated_at
                           FROM goals";

const HABIT_SELECT: &str =
    "SELECT id, user_id, title, description, archived, created_at FROM habits";

const PROPOSAL_SELECT: &str = "SELECT thread_id, proposal_key, state, proposal_json,
                                      progress_json, result_json, updated_at
                               FROM proposal_states";

fn map_goal(row: &rusqlite::Row) -> rusqlite::Result<DbGoal> {
    Ok(DbGoal {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        life_metric: row.get(4)?,
        target_date: row.get(5)?,
        status: row.get(6)?,
        progress_habit: row.get(7)?,
        progress_manual: row.get(8)?,
        progress: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn map_habit(row: &rusqlite::Row) -> rusqlite::Result<DbHabit> {
    Ok(DbHabit {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        archived: row.get::<_, i64>(4)? != 0,
        created_at: row.get(5)?,
    })
}

fn map_proposal_state(row: &rusqlite::Row) -> rusqlite::Result<DbProposalState> {
    Ok(DbProposalState {
        thread_id: row.get(0)?,
        proposal_key: row.get(1)?,
        state: row.get(2)?,
        proposal_json: row.get(3)?,
        progress_json: row.get(4)?,
        result_json: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn db_dir() -> Result<PathBuf, DbError> {
    dirs::home_dir()
        .map(|home| home.join(".coach"))
        .ok_or(DbError::HomeDirNotFound)
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS profile (
            user_id TEXT NOT NULL,
            key     TEXT NOT NULL,
            value   TEXT NOT NULL,
            PRIMARY KEY (user_id, key)
        );

        CREATE TABLE IF NOT EXISTS goals (
            id              TEXT PRIMARY KEY,
            user_id         TEXT NOT NULL,
            title           TEXT NOT NULL,
            description     TEXT,
            life_metric     TEXT,
            target_date     TEXT,
            status          TEXT NOT NULL DEFAULT 'active',
            progress_habit  REAL NOT NULL DEFAULT 0,
            progress_manual REAL NOT NULL DEFAULT 0,
            progress        REAL NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS habits (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            title       TEXT NOT NULL,
            description TEXT,
            archived    INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS goal_habits (
            goal_id    TEXT NOT NULL,
            habit_id   TEXT NOT NULL,
            archived   INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            PRIMARY KEY (goal_id, habit_id)
        );

        CREATE TABLE IF NOT EXISTS habit_completions (
            id           TEXT PRIMARY KEY,
            habit_id     TEXT NOT NULL,
            user_id      TEXT NOT NULL,
            completed_on TEXT NOT NULL,
            goal_id      TEXT,
            logged_at    TEXT NOT NULL,
            UNIQUE (habit_id, user_id, completed_on)
        );

        CREATE TABLE IF NOT EXISTS focus_entries (
            user_id TEXT NOT NULL,
            goal_id TEXT NOT NULL,
            rank    INTEGER NOT NULL,
            PRIMARY KEY (user_id, goal_id)
        );

        CREATE TABLE IF NOT EXISTS chat_messages (
            id         TEXT PRIMARY KEY,
            thread_id  TEXT NOT NULL,
            user_id    TEXT NOT NULL,
            role       TEXT NOT NULL,
            content    TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_chat_thread ON chat_messages (thread_id);

        CREATE TABLE IF NOT EXISTS proposal_states (
            thread_id     TEXT NOT NULL,
            proposal_key  TEXT NOT NULL,
            state         TEXT NOT NULL,
            proposal_json TEXT NOT NULL,
            progress_json TEXT,
            result_json   TEXT,
            updated_at    TEXT NOT NULL,
            PRIMARY KEY (thread_id, proposal_key)
        );",
    )
}
