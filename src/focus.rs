//! Focus set management: the ranked, capacity-bounded list of prioritized
//! goals.
//!
//! Capacity is enforced as a signal, not a gate: an add that pushes the set
//! past capacity still succeeds and raises an overflow signal so the
//! conversation layer can prompt a re-prioritization. Ranks are kept as a
//! contiguous 1..N permutation on every mutation.

use crate::db::CoachDb;
use crate::error::CoachError;
use crate::types::{FocusEntry, FocusSnapshot};

pub const MIN_CAPACITY: u8 = 3;
pub const MAX_CAPACITY: u8 = 5;
pub const DEFAULT_CAPACITY: u8 = 3;

const CAPACITY_PROFILE_KEY: &str = "focus_capacity";

/// Result of a focus-set mutation. `overflow_raised` is the non-blocking
/// overflow signal: the write went through, but the set now exceeds its
/// capacity and the caller should offer re-prioritization.
#[derive(Debug, Clone)]
pub struct FocusUpdate {
    pub snapshot: FocusSnapshot,
    pub overflow_raised: bool,
}

/// The user's configured capacity, clamped to the allowed 3..=5 range.
pub fn capacity(db: &CoachDb, user_id: &str) -> Result<u8, CoachError> {
    let profile = db.profile(user_id)?;
    let configured = profile
        .get(CAPACITY_PROFILE_KEY)
        .and_then(|v| v.parse::<u8>().ok())
        .unwrap_or(DEFAULT_CAPACITY);
    Ok(configured.clamp(MIN_CAPACITY, MAX_CAPACITY))
}

pub fn get(db: &CoachDb, user_id: &str) -> Result<FocusSnapshot, CoachError> {
    let entries = db.focus_entries(user_id)?;
    let capacity = capacity(db, user_id)?;
    let overflow = entries.len() > capacity as usize;
    Ok(FocusSnapshot {
        entries,
        capacity,
        overflow,
    })
}

/// Add a goal to the focus set, optionally at a specific 1-based rank
/// (appended otherwise). Adding beyond capacity succeeds and raises the
/// overflow signal. Adding a goal already present repositions it when a
/// rank is given and is a no-op otherwise.
pub fn add(
    db: &CoachDb,
    user_id: &str,
    goal_id: &str,
    rank: Option<u32>,
) -> Result<FocusUpdate, CoachError> {
    let mut entries = db.focus_entries(user_id)?;

    let already_present = entries.iter().any(|e| e.goal_id == goal_id);
    if already_present {
        if rank.is_none() {
            return finish(db, user_id, entries, false);
        }
        entries.retain(|e| e.goal_id != goal_id);
    }

    let position = rank
        .map(|r| (r.max(1) as usize - 1).min(entries.len()))
        .unwrap_or(entries.len());
    entries.insert(
        position,
        FocusEntry {
            goal_id: goal_id.to_string(),
            rank: 0, // renumbered below
        },
    );

    renumber(&mut entries);
    let capacity = capacity(db, user_id)?;
    let overflow = entries.len() > capacity as usize;
    if overflow {
        log::warn!(
            "Focus set for {} now holds {} goals (capacity {}); raising overflow signal",
            user_id,
            entries.len(),
            capacity
        );
    }
    db.replace_focus(user_id, &entries)?;
    finish(db, user_id, entries, overflow)
}

/// Remove a goal and renumber the remaining entries. Removing an absent
/// goal is a no-op.
pub fn remove(db: &CoachDb, user_id: &str, goal_id: &str) -> Result<FocusUpdate, CoachError> {
    let mut entries = db.focus_entries(user_id)?;
    let before = entries.len();
    entries.retain(|e| e.goal_id != goal_id);
    if entries.len() != before {
        renumber(&mut entries);
        db.replace_focus(user_id, &entries)?;
    }
    finish(db, user_id, entries, false)
}

/// Replace the ranking wholesale. Rejects duplicate goal ids and
/// non-contiguous ranks with `InvalidRanking` before any write.
pub fn set_all(
    db: &CoachDb,
    user_id: &str,
    mut ranked: Vec<FocusEntry>,
) -> Result<FocusUpdate, CoachError> {
    if ranked.is_empty() {
        return Err(CoachError::InvalidRanking(
            "ranking must contain at least one goal".to_string(),
        ));
    }

    for (i, entry) in ranked.iter().enumerate() {
        if ranked[..i].iter().any(|e| e.goal_id == entry.goal_id) {
            return Err(CoachError::InvalidRanking(format!(
                "goal {} appears more than once",
                entry.goal_id
            )));
        }
    }

    ranked.sort_by_key(|e| e.rank);
    for (i, entry) in ranked.iter().enumerate() {
        let expected = (i + 1) as u32;
        if entry.rank != expected {
            return Err(CoachError::InvalidRanking(format!(
                "ranks must be contiguous 1..{}; found {} at position {}",
                ranked.len(),
                entry.rank,
                expected
            )));
        }
    }

    let capacity = capacity(db, user_id)?;
    let overflow = ranked.len() > capacity as usize;
    db.replace_focus(user_id, &ranked)?;
    finish(db, user_id, ranked, overflow)
}

fn renumber(entries: &mut [FocusEntry]) {
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = (i + 1) as u32;
    }
}

fn finish(
    db: &CoachDb,
    user_id: &str,
    entries: Vec<FocusEntry>,
    overflow_raised: bool,
) -> Result<FocusUpdate, CoachError> {
    let capacity = capacity(db, user_id)?;
    let overflow = entries.len() > capacity as usize;
    Ok(FocusUpdate {
        snapshot: FocusSnapshot {
            entries,
            capacity,
            overflow,
        },
        overflow_raised,
    })
}
