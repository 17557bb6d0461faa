//! Prompt construction for session debriefs.

use crate::context::ContextPayload;

/// System + user text pair handed to the generation backend.
#[derive(Debug, Clone)]
pub struct PromptParts {
    pub system_text: String,
    pub user_text: String,
}

const SYSTEM_TEXT: &str = "\
You are a strength coach writing a short debrief of a completed workout \
session. Respond with a single JSON object and nothing else. Fields: \
\"summary\" (required, 2-4 encouraging sentences in plain language), \
\"prHighlights\" (optional array of {exerciseName, metric, summary, delta, \
unit, currentValue, previousValue, emoji}), \"adherenceScore\" (optional \
integer 0-100), \"focusAreas\" (optional array of {title, description, \
priority, actions}), \"streakContext\" (optional {current, longest, \
message, status}), \"overloadDigest\" (optional {readiness, recommendation, \
nextSteps, cautionFlags}). Only include a field when the session data \
supports it. Never invent numbers that are not in the data.";

/// Build the generation prompt from a gathered context payload.
pub fn build_prompt(context: &ContextPayload) -> PromptParts {
    let mut user_text = format!(
        "Write the debrief for this session.\n\nSession data:\n{}",
        serde_json::to_string_pretty(&context.stats).unwrap_or_else(|_| "{}".to_string())
    );

    if let Some(locale) = &context.locale {
        user_text.push_str(&format!("\n\nWrite in the language for locale {}.", locale));
    }
    if let Some(timezone) = &context.timezone {
        user_text.push_str(&format!(
            "\nInterpret dates and times in the {} timezone.",
            timezone
        ));
    }

    PromptParts {
        system_text: SYSTEM_TEXT.to_string(),
        user_text,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_context(locale: Option<&str>, timezone: Option<&str>) -> ContextPayload {
        ContextPayload {
            user_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            locale: locale.map(str::to_string),
            timezone: timezone.map(str::to_string),
            stats: serde_json::json!({
                "session": { "title": "Push day" },
                "history": { "totalSessions": 14 }
            }),
        }
    }

    #[test]
    fn test_prompt_embeds_session_stats() {
        let parts = build_prompt(&test_context(None, None));
        assert!(parts.user_text.contains("Push day"));
        assert!(parts.user_text.contains("totalSessions"));
    }

    #[test]
    fn test_system_text_names_the_contract_fields() {
        let parts = build_prompt(&test_context(None, None));
        for field in ["summary", "prHighlights", "adherenceScore", "focusAreas"] {
            assert!(
                parts.system_text.contains(field),
                "system text should mention {}",
                field
            );
        }
    }

    #[test]
    fn test_locale_and_timezone_directives() {
        let parts = build_prompt(&test_context(Some("de-DE"), Some("Europe/Berlin")));
        assert!(parts.user_text.contains("de-DE"));
        assert!(parts.user_text.contains("Europe/Berlin"));

        let bare = build_prompt(&test_context(None, None));
        assert!(!bare.user_text.contains("locale"));
        assert!(!bare.user_text.contains("timezone"));
    }
}
