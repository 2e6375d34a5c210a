//! System-prompt templates and model-response parsing helpers.
//!
//! Each handler owns one fixed template with named placeholders. Rendering
//! goes through [`PromptParams`], a struct with one field per placeholder,
//! so placeholder coverage is checked by the compiler instead of by
//! sequential string replacement against an ad-hoc map.
//!
//! Response parsing is JSON-first and fail-closed: if no well-formed JSON
//! object can be pulled out of the model output, callers fall back to
//! treating the whole output as plain text.

/// Named parameters substituted into every handler template.
///
/// Empty blocks render as "(none)" so the model never sees a dangling
/// section header.
#[derive(Debug, Default, Clone)]
pub struct PromptParams {
    /// User profile key-value lines.
    pub profile: String,
    /// Current focus set, one ranked goal per line.
    pub focus_set: String,
    /// Active goals with their habits and progress.
    pub working_set: String,
    /// Capped window of recent conversation messages.
    pub recent_messages: String,
    /// Handler-specific context block (today's review facts, candidate
    /// habits, etc.). Empty for handlers that need none.
    pub extra_context: String,
}

impl PromptParams {
    /// Render a template by substituting every named placeholder.
    pub fn render(&self, template: &str) -> String {
        let fill = |s: &str| {
            if s.trim().is_empty() {
                "(none)".to_string()
            } else {
                s.to_string()
            }
        };
        template
            .replace("{{PROFILE}}", &fill(&self.profile))
            .replace("{{FOCUS_SET}}", &fill(&self.focus_set))
            .replace("{{WORKING_SET}}", &fill(&self.working_set))
            .replace("{{RECENT_MESSAGES}}", &fill(&self.recent_messages))
            .replace("{{CONTEXT}}", &fill(&self.extra_context))
    }
}

const SHARED_CONTEXT_BLOCK: &str = "\
## User profile
{{PROFILE}}

## Focus set (ranked priorities)
{{FOCUS_SET}}

## Active goals and habits
{{WORKING_SET}}

## Recent conversation
{{RECENT_MESSAGES}}

## Additional context
{{CONTEXT}}";

/// Master/default coach. May recommend a handoff to a specialist.
pub const MASTER_TEMPLATE: &str = "You are a supportive personal coach for goals and habits. Reply \
     conversationally and keep answers short and concrete.\n\n\
     Respond with a JSON object:\n\
     {\"reply\": \"<your message to the user>\", \
      \"suggested_handler\": \"suggest_goals\" | \"review_progress\" | \
      \"prioritize_optimize\" | \"surprise_me\" | null}\n\n\
     Set suggested_handler only when the user's message clearly calls for \
     that specialist; otherwise use null.\n\n";

/// Goal suggestion specialist.
pub const SUGGEST_GOALS_TEMPLATE: &str = "You are a coach proposing new goals. Suggest at most three goals, each \
     with one to three supporting habits. Use the user's profile and avoid \
     duplicating active goals.\n\n\
     Respond with a JSON object:\n\
     {\"reply\": \"<short rationale for the user>\", \
      \"suggestions\": [{\"title\": \"...\", \"description\": \"...\", \
      \"lifeMetric\": \"...\", \"startTimeline\": \"now\"|\"soon\"|\"later\", \
      \"targetDate\": \"YYYY-MM-DD\" or null, \
      \"habits\": [{\"title\": \"...\", \"description\": \"...\"}]}]}\n\n";

/// Progress review specialist. The review facts (per-habit completion and
/// streak, computed from the ledger) arrive in the context block.
pub const REVIEW_PROGRESS_TEMPLATE: &str = "You are a coach reviewing today's habit progress. The context block \
     contains the ground-truth review facts; do not invent completions or \
     streaks. Celebrate wins, be honest about gaps.\n\n\
     Respond with a JSON object:\n\
     {\"reply\": \"<your review message>\"}\n\n";

/// Focus prioritization specialist.
pub const PRIORITIZE_TEMPLATE: &str = "You are a coach re-prioritizing the user's focus set. Rank the active \
     goals by impact and momentum, and recommend habit swaps only where a \
     habit is clearly not serving its goal. Reference only goal and habit \
     ids present in the working set.\n\n\
     Respond with a JSON object:\n\
     {\"reply\": \"<explanation for the user>\", \
      \"ranking\": [{\"goalId\": \"...\", \"rank\": 1, \"reason\": \"...\"}], \
      \"replacements\": [{\"goalId\": \"...\", \"oldHabitId\": \"...\", \
      \"newHabit\": {\"title\": \"...\", \"description\": \"...\"}, \
      \"rationale\": \"...\"}]}\n\n";

/// Surprise-insight specialist.
pub const SURPRISE_TEMPLATE: &str = "You are a coach surfacing one non-obvious insight from the user's \
     goals, habits, and recent conversation. Pick something the user likely \
     has not noticed.\n\n\
     Respond with a JSON object:\n\
     {\"reply\": \"<your message>\", \
      \"insight\": {\"title\": \"...\", \"explanation\": \"...\", \
      \"confidence\": 0-100, \"relatedMetrics\": [\"...\"]}}\n\n";

/// Habit-completion extraction. Constrained output: a bare JSON array.
/// The context block carries today's date and the candidate habit titles.
pub const EXTRACTION_TEMPLATE: &str = "\
You extract habit-completion claims from a user's message.

{{CONTEXT}}

Respond with ONLY a JSON array, no prose:
[{\"habit\": \"<candidate title the claim refers to>\", \
\"dates\": [\"YYYY-MM-DD\", ...], \"occurrences\": <count>}]

Rules:
- Match claims against the candidate titles only; never invent a habit.
- Include explicit dates only when the message states them; resolve relative
  days (\"today\", \"yesterday\") against the date given above.
- When the message gives a count but no dates, leave dates empty and set
  occurrences to the count.
- Return [] when no claim matches a candidate habit.";

/// A handler template plus the shared context section.
pub fn full_template(head: &'static str) -> String {
    format!("{head}{SHARED_CONTEXT_BLOCK}")
}

/// Extract a JSON object from model output. Handles ```json fences, generic
/// fences, raw objects, and objects embedded in surrounding prose (balanced
/// brace scan, string-aware).
pub fn extract_json_object(response: &str) -> Option<&str> {
    if let Some(found) = fenced_block(response) {
        if found.starts_with('{') {
            return Some(found);
        }
    }

    let trimmed = response.trim();
    if trimmed.starts_with('{') {
        return Some(trimmed);
    }

    let start = response.find('{')?;
    balanced_slice(&response[start..], '{', '}')
}

/// Extract a JSON array from model output (same strategy as
/// [`extract_json_object`], for the extraction schema).
pub fn extract_json_array(response: &str) -> Option<&str> {
    if let Some(found) = fenced_block(response) {
        if found.starts_with('[') {
            return Some(found);
        }
    }

    let trimmed = response.trim();
    if trimmed.starts_with('[') {
        return Some(trimmed);
    }

    let start = response.find('[')?;
    balanced_slice(&response[start..], '[', ']')
}

fn fenced_block(response: &str) -> Option<&str> {
    if let Some(start) = response.find("```json") {
        let body_start = start + 7;
        if let Some(end) = response[body_start..].find("```") {
            return Some(response[body_start..body_start + end].trim());
        }
    }
    if let Some(start) = response.find("```") {
        let after_fence = start + 3;
        if let Some(nl) = response[after_fence..].find('\n') {
            let body_start = after_fence + nl + 1;
            if let Some(end) = response[body_start..].find("```") {
                return Some(response[body_start..body_start + end].trim());
            }
        }
    }
    None
}

/// Scan for a balanced `open`..`close` region, skipping string literals.
fn balanced_slice(candidate: &str, open: char, close: char) -> Option<&str> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (i, ch) in candidate.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Some(&candidate[..=i]);
            }
        }
    }
    None
}
