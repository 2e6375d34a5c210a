//! Machine-actionable proposals and their wire codec.
//!
//! A proposal rides in the tail of the assistant's response text behind a
//! fixed delimiter; this is how proposals survive reloads without a
//! dedicated proposal table in the conversation transport. Decoding splits
//! on the *last* delimiter occurrence and fails closed: anything that does
//! not parse is plain text.

use serde::{Deserialize, Serialize};

use crate::types::{GoalDraft, HabitDraft};

/// Wire delimiter separating human-readable text from the proposal JSON.
pub const PROPOSAL_DELIMITER: &str = "---json---";

/// One (goal, habits) pair inside a goal-suggestion proposal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalSuggestion {
    pub goal: GoalDraft,
    #[serde(default)]
    pub habits: Vec<HabitDraft>,
}

/// One reviewed habit inside a habit-review proposal. `streak` is the real
/// consecutive-day count from the completion ledger, never a placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HabitReviewItem {
    pub habit_id: String,
    pub title: String,
    pub completed_today: bool,
    pub streak: u32,
}

/// One entry of a proposed focus-set ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedGoal {
    pub goal_id: String,
    pub rank: u32,
    #[serde(default)]
    pub reason: String,
}

/// A recommendation to swap one habit for another on a goal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HabitReplacement {
    pub goal_id: String,
    pub old_habit_id: String,
    pub new_habit: HabitDraft,
    #[serde(default)]
    pub rationale: String,
}

/// The structured, machine-actionable part of a handler response.
///
/// Discriminated by the `type` field; every consumption site matches
/// exhaustively. The singular `goal_suggestion` tag is accepted on decode
/// for messages written before the plural form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Proposal {
    #[serde(alias = "goal_suggestion")]
    GoalSuggestions { suggestions: Vec<GoalSuggestion> },
    HabitReview { items: Vec<HabitReviewItem> },
    Optimization {
        ranking: Vec<RankedGoal>,
        #[serde(default)]
        replacements: Vec<HabitReplacement>,
    },
    Insight {
        title: String,
        explanation: String,
        /// Confidence in [0, 100]; clamped on decode.
        confidence: u8,
        #[serde(default)]
        related_metrics: Vec<String>,
    },
}

impl Proposal {
    /// Stable name of the discriminant, for logging and state rows.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GoalSuggestions { .. } => "goal_suggestions",
            Self::HabitReview { .. } => "habit_review",
            Self::Optimization { .. } => "optimization",
            Self::Insight { .. } => "insight",
        }
    }

    /// Enforce value-range invariants that the wire format cannot.
    pub fn normalized(mut self) -> Self {
        if let Self::Insight { confidence, .. } = &mut self {
            *confidence = (*confidence).min(100);
        }
        self
    }
}

/// Append a proposal to response text behind the delimiter.
pub fn encode(text: &str, proposal: &Proposal) -> String {
    let json = serde_json::to_string(proposal)
        .expect("proposal serialization to JSON is infallible");
    format!("{}\n\n{}\n{}", text, PROPOSAL_DELIMITER, json)
}

/// Split encoded text back into (plain text, optional proposal).
///
/// Splits on the last delimiter occurrence. If the trailing segment does not
/// parse as a proposal the whole input is returned as plain text; decoding
/// never errors.
pub fn decode(encoded: &str) -> (String, Option<Proposal>) {
    let Some(idx) = encoded.rfind(PROPOSAL_DELIMITER) else {
        return (encoded.to_string(), None);
    };

    let tail = encoded[idx + PROPOSAL_DELIMITER.len()..].trim();
    match serde_json::from_str::<Proposal>(tail) {
        Ok(proposal) => {
            let head = &encoded[..idx];
            // Strip only the separator newlines added by encode.
            let head = head
                .strip_suffix("\n\n")
                .or_else(|| head.strip_suffix('\n'))
                .unwrap_or(head);
            (head.to_string(), Some(proposal.normalized()))
        }
        Err(e) => {
            log::warn!("Proposal tail failed to parse, treating as plain text: {e}");
            (encoded.to_string(), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StartTimeline;

    fn sample_suggestions() -> Proposal {
        Proposal::GoalSuggestions {
            suggestions: vec![GoalSuggestion {
                goal: GoalDraft {
                    title: "Run a 10k".to_string(),
                    description: Some("Spring race".to_string()),
                    life_metric: Some("health".to_string()),
                    start_timeline: StartTimeline::Now,
                    target_date: Some("2024-06-01".parse().unwrap()),
                },
                habits: vec![HabitDraft {
                    title: "Morning Run".to_string(),
                    description: None,
                }],
            }],
        }
    }

    #[test]
    fn round_trip_all_variants() {
        let proposals = vec![
            sample_suggestions(),
            Proposal::HabitReview {
                items: vec![HabitReviewItem {
                    habit_id: "h1".to_string(),
                    title: "Morning Run".to_string(),
                    completed_today: true,
                    streak: 4,
                }],
            },
            Proposal::Optimization {
                ranking: vec![RankedGoal {
                    goal_id: "g1".to_string(),
                    rank: 1,
                    reason: "closest to done".to_string(),
                }],
                replacements: vec![],
            },
            Proposal::Insight {
                title: "Morning momentum".to_string(),
                explanation: "Runs logged before 9am stick twice as often.".to_string(),
                confidence: 80,
                related_metrics: vec!["health".to_string()],
            },
        ];

        for proposal in proposals {
            let text = "Here's what I found.";
            let encoded = encode(text, &proposal);
            let (decoded_text, decoded) = decode(&encoded);
            assert_eq!(decoded_text, text);
            assert_eq!(decoded, Some(proposal));
        }
    }

    #[test]
    fn round_trip_preserves_trailing_newline_in_text() {
        let proposal = sample_suggestions();
        let text = "Two lines.\nSecond line.\n";
        let (decoded_text, decoded) = decode(&encode(text, &proposal));
        assert_eq!(decoded_text, text);
        assert!(decoded.is_some());
    }

    #[test]
    fn decode_plain_text_without_delimiter() {
        let (text, proposal) = decode("just a friendly reply");
        assert_eq!(text, "just a friendly reply");
        assert!(proposal.is_none());
    }

    #[test]
    fn decode_malformed_tail_is_plain_text() {
        let input = format!("reply\n\n{}\nnot json at all", PROPOSAL_DELIMITER);
        let (text, proposal) = decode(&input);
        assert_eq!(text, input);
        assert!(proposal.is_none());
    }

    #[test]
    fn decode_splits_on_last_delimiter() {
        let proposal = sample_suggestions();
        let text = format!("the wire format uses {} as its marker", PROPOSAL_DELIMITER);
        let encoded = encode(&text, &proposal);
        let (decoded_text, decoded) = decode(&encoded);
        assert_eq!(decoded_text, text);
        assert_eq!(decoded, Some(proposal));
    }

    #[test]
    fn decode_accepts_legacy_singular_tag() {
        let legacy = r#"{"type":"goal_suggestion","suggestions":[]}"#;
        let input = format!("old message\n\n{}\n{}", PROPOSAL_DELIMITER, legacy);
        let (_, proposal) = decode(&input);
        assert!(matches!(
            proposal,
            Some(Proposal::GoalSuggestions { suggestions }) if suggestions.is_empty()
        ));
    }

    #[test]
    fn insight_confidence_clamped_on_decode() {
        let over = r#"{"type":"insight","title":"t","explanation":"e","confidence":250}"#;
        let input = format!("x\n\n{}\n{}", PROPOSAL_DELIMITER, over);
        let (_, proposal) = decode(&input);
        match proposal {
            Some(Proposal::Insight { confidence, .. }) => assert_eq!(confidence, 100),
            other => panic!("expected insight, got {other:?}"),
        }
    }
}
