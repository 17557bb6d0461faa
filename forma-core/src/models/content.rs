//! Generated-content contract — what the model must return
//!
//! The generation service returns raw text. Turning it into a persistable
//! debrief is a two-gate process with distinct failures:
//! - **Parse gate** — the text must be JSON at all. Failure is
//!   `MalformedOutput` and carries a truncated snippet for diagnostics.
//! - **Schema gate** — the JSON must match this contract (shape + ranges).
//!   Failure is `SchemaValidation`.
//!
//! Raw model output is never silently coerced past either gate.

use serde::{Deserialize, Serialize};

use crate::error::DebriefError;

/// Max characters of raw output preserved in a `MalformedOutput` error.
const SNIPPET_LEN: usize = 200;

// ============================================================================
// Content structs
// ============================================================================

/// Validated output of one generation call. Decomposed into
/// `session_debriefs` columns at persist time — never stored as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedContent {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_highlights: Option<Vec<PrHighlight>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adherence_score: Option<i16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focus_areas: Option<Vec<FocusArea>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streak_context: Option<StreakContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overload_digest: Option<OverloadDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrHighlight {
    pub exercise_name: String,
    pub metric: String,
    pub summary: String,
    pub delta: f64,
    pub unit: String,
    pub current_value: f64,
    pub previous_value: f64,
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusArea {
    pub title: String,
    pub description: String,
    pub priority: u8,
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreakContext {
    pub current: u32,
    pub longest: u32,
    pub message: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverloadDigest {
    pub readiness: String,
    pub recommendation: String,
    pub next_steps: Vec<String>,
    pub caution_flags: Vec<String>,
}

// ============================================================================
// Parse + validate
// ============================================================================

/// Run raw model output through both gates.
pub fn parse_generated(raw: &str) -> Result<GeneratedContent, DebriefError> {
    let stripped = strip_code_fences(raw);

    // Parse gate: non-JSON output is MalformedOutput, with a snippet of the
    // original (unstripped) text.
    let value: serde_json::Value =
        serde_json::from_str(stripped).map_err(|_| DebriefError::MalformedOutput {
            snippet: snippet(raw),
        })?;

    // Schema gate: well-formed JSON of the wrong shape is SchemaValidation.
    let content: GeneratedContent = serde_json::from_value(value)
        .map_err(|e| DebriefError::SchemaValidation(e.to_string()))?;

    content.validate()?;
    Ok(content)
}

impl GeneratedContent {
    /// Range and non-emptiness checks serde cannot express.
    pub fn validate(&self) -> Result<(), DebriefError> {
        if self.summary.trim().is_empty() {
            return Err(DebriefError::SchemaValidation(
                "summary must not be empty".to_string(),
            ));
        }

        if let Some(score) = self.adherence_score {
            if !(0..=100).contains(&score) {
                return Err(DebriefError::SchemaValidation(format!(
                    "adherenceScore {} outside 0..=100",
                    score
                )));
            }
        }

        if let Some(highlights) = &self.pr_highlights {
            for h in highlights {
                if h.exercise_name.trim().is_empty() || h.metric.trim().is_empty() {
                    return Err(DebriefError::SchemaValidation(
                        "prHighlights entries need exerciseName and metric".to_string(),
                    ));
                }
            }
        }

        if let Some(areas) = &self.focus_areas {
            for a in areas {
                if a.title.trim().is_empty() {
                    return Err(DebriefError::SchemaValidation(
                        "focusAreas entries need a title".to_string(),
                    ));
                }
            }
        }

        if let Some(streak) = &self.streak_context {
            if streak.longest < streak.current {
                return Err(DebriefError::SchemaValidation(format!(
                    "streakContext.longest ({}) below current ({})",
                    streak.longest, streak.current
                )));
            }
        }

        Ok(())
    }
}

/// Models occasionally wrap JSON in a markdown fence despite the JSON
/// response mime type. Strip one outer fence if present.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn snippet(raw: &str) -> String {
    let s: String = raw.chars().take(SNIPPET_LEN).collect();
    if raw.chars().count() > SNIPPET_LEN {
        format!("{}…", s)
    } else {
        s
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> serde_json::Value {
        serde_json::json!({
            "summary": "Strong pull session — bar speed held up through all five sets."
        })
    }

    #[test]
    fn test_parse_minimal_content() {
        let raw = minimal_json().to_string();
        let content = parse_generated(&raw).expect("minimal content should parse");
        assert!(content.summary.starts_with("Strong pull session"));
        assert!(content.pr_highlights.is_none());
    }

    #[test]
    fn test_parse_full_content() {
        let raw = serde_json::json!({
            "summary": "Deadlift PR day.",
            "prHighlights": [{
                "exerciseName": "Deadlift",
                "metric": "1RM",
                "summary": "5kg over your previous best",
                "delta": 5.0,
                "unit": "kg",
                "currentValue": 180.0,
                "previousValue": 175.0,
                "emoji": "🏋️"
            }],
            "adherenceScore": 92,
            "focusAreas": [{
                "title": "Brace earlier",
                "description": "Breath timing slipped on the last set.",
                "priority": 1,
                "actions": ["Cue the brace before lift-off"]
            }],
            "streakContext": { "current": 4, "longest": 9, "message": "Four weeks straight.", "status": "building" },
            "overloadDigest": {
                "readiness": "moderate",
                "recommendation": "Hold the top set next week.",
                "nextSteps": ["Repeat 180 for a double"],
                "cautionFlags": []
            }
        })
        .to_string();

        let content = parse_generated(&raw).expect("full content should parse");
        assert_eq!(content.adherence_score, Some(92));
        assert_eq!(content.pr_highlights.as_ref().unwrap()[0].delta, 5.0);
        assert_eq!(content.streak_context.as_ref().unwrap().longest, 9);
    }

    #[test]
    fn test_non_json_is_malformed_output() {
        let result = parse_generated("Sure! Here is your debrief: great job today");
        match result {
            Err(DebriefError::MalformedOutput { snippet }) => {
                assert!(snippet.starts_with("Sure!"));
            }
            other => panic!("Expected MalformedOutput, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_shape_is_schema_validation_not_malformed() {
        // Valid JSON, but summary has the wrong type — must be the schema
        // gate, never the parse gate.
        let result = parse_generated(r#"{"summary": 42}"#);
        assert!(matches!(result, Err(DebriefError::SchemaValidation(_))));
    }

    #[test]
    fn test_missing_summary_is_schema_validation() {
        let result = parse_generated(r#"{"adherenceScore": 80}"#);
        assert!(matches!(result, Err(DebriefError::SchemaValidation(_))));
    }

    #[test]
    fn test_empty_summary_rejected() {
        let result = parse_generated(r#"{"summary": "   "}"#);
        assert!(matches!(result, Err(DebriefError::SchemaValidation(_))));
    }

    #[test]
    fn test_adherence_score_bounds() {
        let result = parse_generated(r#"{"summary": "ok", "adherenceScore": 101}"#);
        match result {
            Err(DebriefError::SchemaValidation(msg)) => assert!(msg.contains("101")),
            other => panic!("Expected SchemaValidation, got {:?}", other),
        }
    }

    #[test]
    fn test_streak_longest_below_current_rejected() {
        let raw = serde_json::json!({
            "summary": "ok",
            "streakContext": { "current": 7, "longest": 3, "message": "", "status": "building" }
        })
        .to_string();
        assert!(matches!(
            parse_generated(&raw),
            Err(DebriefError::SchemaValidation(_))
        ));
    }

    #[test]
    fn test_code_fenced_json_accepted() {
        let raw = format!("```json\n{}\n```", minimal_json());
        let content = parse_generated(&raw).expect("fenced JSON should parse");
        assert!(!content.summary.is_empty());
    }

    #[test]
    fn test_malformed_snippet_is_truncated() {
        let raw = "not json ".repeat(100);
        match parse_generated(&raw) {
            Err(DebriefError::MalformedOutput { snippet }) => {
                assert!(snippet.chars().count() <= 201, "snippet too long");
                assert!(snippet.ends_with('…'));
            }
            other => panic!("Expected MalformedOutput, got {:?}", other),
        }
    }
}
