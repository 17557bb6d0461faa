//! Single-debrief orchestrator — generate, validate, persist
//!
//! End-to-end flow for one session:
//! 1. skip-if-active short-circuit (idempotent no-op, no collaborator calls)
//! 2. gather context → build prompt → call the generation backend
//! 3. classify failures (rate limiting becomes its own retryable error)
//! 4. parse + schema-validate the raw output
//! 5. persist: recompute next version, supersede the prior active record,
//!    insert the new one — transactional when the store supports it, with a
//!    logged fallback to the bare statement sequence when it does not.
//!
//! Persistence retries exactly once when the (user, session, version)
//! uniqueness guard trips, recomputing the version. Generation runs either
//! on the caller's task or detached via `spawn_generate_task`.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::context::{gather_context, ContextPayload};
use crate::prompt::build_prompt;
use crate::subsystems::store::{self, DebriefRow};
use forma_core::config::{FormaConfig, PersistenceConfig};
use forma_core::generation::{
    classify_failure, FailureClass, GeminiGenerationClient, GenerationBackend, GenerationConfig,
    GenerationError, GenerationRequest,
};
use forma_core::models::{DebriefTrigger, GeneratedContent, SessionDebrief};
use forma_core::DebriefError;
use forma_core::models::content::parse_generated;

// ============================================================================
// PUBLIC API
// ============================================================================

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    /// When true and an active debrief already exists, return it untouched
    /// without contacting any collaborator.
    pub skip_if_active: bool,
    pub trigger: DebriefTrigger,
    pub correlation_id: Option<String>,
}

/// Result of one generation run. `content` and `context` are None on the
/// skip-if-active path, where nothing was generated.
#[derive(Debug)]
pub struct DebriefOutcome {
    pub debrief: SessionDebrief,
    pub content: Option<GeneratedContent>,
    pub context: Option<ContextPayload>,
}

/// Build the generation backend from application config.
pub fn create_backend_from_config(
    config: &FormaConfig,
) -> Result<Box<dyn GenerationBackend>, DebriefError> {
    let mut gen_config = GenerationConfig::new(
        None,
        config.generation.model.clone(),
        config.generation.temperature,
    );
    gen_config.max_retries = config.generation.max_retries;
    gen_config.retry_delay_ms = config.generation.retry_delay_ms;

    let client = GeminiGenerationClient::new(gen_config).map_err(|e| match e {
        GenerationError::MissingModel => {
            DebriefError::Configuration("generation.model is not set".to_string())
        }
        GenerationError::MissingApiKey => {
            DebriefError::Configuration("GOOGLE_API_KEY is not set".to_string())
        }
        other => DebriefError::Generation(other),
    })?;

    Ok(Box::new(client))
}

/// Generate a debrief for one session and persist it as the new active
/// version.
pub async fn generate_and_persist_debrief(
    pool: &PgPool,
    backend: &dyn GenerationBackend,
    persistence: &PersistenceConfig,
    options: GenerateOptions,
) -> Result<DebriefOutcome, DebriefError> {
    if options.skip_if_active {
        if let Some(existing) =
            store::find_active(pool, options.user_id, options.session_id).await?
        {
            tracing::info!(
                session_id = %options.session_id,
                version = existing.version,
                correlation_id = options.correlation_id.as_deref().unwrap_or("-"),
                "Active debrief exists, skipping generation"
            );
            return Ok(DebriefOutcome {
                debrief: existing,
                content: None,
                context: None,
            });
        }
    }

    let context = gather_context(
        pool,
        options.user_id,
        options.session_id,
        options.locale.as_deref(),
        options.timezone.as_deref(),
    )
    .await?;

    let parts = build_prompt(&context);
    let request = GenerationRequest {
        system_text: parts.system_text,
        user_text: parts.user_text,
    };

    let response = match backend.generate(&request).await {
        Ok(r) => r,
        Err(e) => {
            return Err(match classify_failure(&e) {
                FailureClass::RateLimited => DebriefError::RateLimited(e.to_string()),
                FailureClass::Unclassified => DebriefError::Generation(e),
            });
        }
    };

    let content = match parse_generated(&response.text) {
        Ok(c) => c,
        Err(e) => {
            if let DebriefError::MalformedOutput { snippet } = &e {
                tracing::error!(
                    session_id = %options.session_id,
                    snippet = %snippet,
                    "Model output was not JSON"
                );
            }
            return Err(e);
        }
    };

    let draft = DebriefDraft::assemble(&options, &content, backend.model());
    let record = persist_debrief(pool, persistence, &draft).await?;

    tracing::info!(
        session_id = %options.session_id,
        debrief_id = %record.id,
        version = record.version,
        trigger = options.trigger.as_str(),
        "Debrief persisted"
    );

    Ok(DebriefOutcome {
        debrief: record,
        content: Some(content),
        context: Some(context),
    })
}

/// Fire-and-forget variant for callers (e.g. the workout-save workflow)
/// that must not block or fail on generation. Errors are logged, never
/// propagated.
pub fn spawn_generate_task(
    pool: PgPool,
    backend: Arc<dyn GenerationBackend>,
    persistence: PersistenceConfig,
    options: GenerateOptions,
) {
    tokio::spawn(async move {
        let session_id = options.session_id;
        match generate_and_persist_debrief(&pool, backend.as_ref(), &persistence, options).await {
            Ok(outcome) => tracing::info!(
                session_id = %session_id,
                debrief_id = %outcome.debrief.id,
                "Background debrief generation completed"
            ),
            Err(e) => tracing::error!(
                session_id = %session_id,
                error = %e,
                "Background debrief generation failed"
            ),
        }
    });
}

// ============================================================================
// Draft assembly
// ============================================================================

/// Everything known about the new row before versioning. Version, parent
/// and regeneration count are resolved inside the persist sequence, from
/// the store state current at that moment.
#[derive(Debug, Clone)]
pub(crate) struct DebriefDraft {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub trigger: DebriefTrigger,
    pub summary: String,
    pub pr_highlights: Option<serde_json::Value>,
    pub adherence_score: Option<i16>,
    pub focus_areas: Option<serde_json::Value>,
    pub streak_context: Option<serde_json::Value>,
    pub overload_digest: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
}

impl DebriefDraft {
    pub(crate) fn assemble(
        options: &GenerateOptions,
        content: &GeneratedContent,
        model: &str,
    ) -> Self {
        Self {
            user_id: options.user_id,
            session_id: options.session_id,
            trigger: options.trigger,
            summary: content.summary.clone(),
            pr_highlights: opt_value(&content.pr_highlights),
            adherence_score: content.adherence_score,
            focus_areas: opt_value(&content.focus_areas),
            streak_context: opt_value(&content.streak_context),
            overload_digest: opt_value(&content.overload_digest),
            metadata: build_metadata(
                options.trigger,
                model,
                options.correlation_id.as_deref(),
                options.locale.as_deref(),
                options.timezone.as_deref(),
            ),
        }
    }
}

pub(crate) fn opt_value<T: Serialize>(value: &Option<T>) -> Option<serde_json::Value> {
    value.as_ref().and_then(|v| serde_json::to_value(v).ok())
}

pub(crate) fn build_metadata(
    trigger: DebriefTrigger,
    model: &str,
    correlation_id: Option<&str>,
    locale: Option<&str>,
    timezone: Option<&str>,
) -> serde_json::Value {
    serde_json::json!({
        "generatedAt": Utc::now().to_rfc3339(),
        "trigger": trigger.as_str(),
        "model": model,
        "correlationId": correlation_id,
        "locale": locale,
        "timezone": timezone,
    })
}

// ============================================================================
// Persistence
// ============================================================================

/// Persist with the single-shot version-collision retry: when two
/// concurrent generations allocate the same version, the uniqueness guard
/// rejects the loser and the whole sequence reruns once against the fresh
/// store state.
pub(crate) async fn persist_debrief(
    pool: &PgPool,
    persistence: &PersistenceConfig,
    draft: &DebriefDraft,
) -> Result<SessionDebrief, DebriefError> {
    match persist_once(pool, persistence, draft).await {
        Err(DebriefError::Storage(e)) if store::is_unique_violation(&e) => {
            tracing::warn!(
                session_id = %draft.session_id,
                "Version collided with a concurrent generation, retrying persist"
            );
            persist_once(pool, persistence, draft).await
        }
        other => other,
    }
}

async fn persist_once(
    pool: &PgPool,
    persistence: &PersistenceConfig,
    draft: &DebriefDraft,
) -> Result<SessionDebrief, DebriefError> {
    if !persistence.supports_transactions {
        return persist_sequential(pool, draft).await;
    }

    match persist_transactional(pool, draft).await {
        Err(DebriefError::Storage(e)) if store::is_nested_transaction_error(&e) => {
            tracing::warn!(
                session_id = %draft.session_id,
                "Store rejected the transaction wrapper, retrying bare (transaction fallback)"
            );
            persist_sequential(pool, draft).await
        }
        other => other,
    }
}

async fn persist_transactional(
    pool: &PgPool,
    draft: &DebriefDraft,
) -> Result<SessionDebrief, DebriefError> {
    let mut tx = pool.begin().await?;
    let record = persist_steps(&mut tx, draft).await?;
    tx.commit().await?;
    Ok(record)
}

/// Same statements as the transactional path, executed sequentially. The
/// consistency window is wider but supersession still always happens before
/// the insert.
async fn persist_sequential(
    pool: &PgPool,
    draft: &DebriefDraft,
) -> Result<SessionDebrief, DebriefError> {
    let mut conn = pool.acquire().await?;
    persist_steps(&mut conn, draft).await
}

async fn persist_steps(
    conn: &mut PgConnection,
    draft: &DebriefDraft,
) -> Result<SessionDebrief, DebriefError> {
    let next_version = store::max_version(&mut *conn, draft.user_id, draft.session_id).await? + 1;

    let prior = store::find_active(&mut *conn, draft.user_id, draft.session_id).await?;
    if let Some(p) = &prior {
        store::deactivate(&mut *conn, p.id).await?;
    }

    let prior_regenerations = prior.as_ref().map_or(0, |p| p.regeneration_count);
    let regeneration_count = if draft.trigger == DebriefTrigger::Regenerate {
        prior_regenerations + 1
    } else {
        prior_regenerations
    };

    let row = DebriefRow {
        user_id: draft.user_id,
        session_id: draft.session_id,
        version: next_version,
        summary: draft.summary.clone(),
        pr_highlights: draft.pr_highlights.clone(),
        adherence_score: draft.adherence_score,
        focus_areas: draft.focus_areas.clone(),
        streak_context: draft.streak_context.clone(),
        overload_digest: draft.overload_digest.clone(),
        metadata: draft.metadata.clone(),
        regeneration_count,
        parent_debrief_id: prior.as_ref().map(|p| p.id),
    };

    let record = store::insert_one(&mut *conn, &row).await?;
    Ok(record)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_options() -> GenerateOptions {
        GenerateOptions {
            user_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            locale: Some("en-US".to_string()),
            timezone: None,
            skip_if_active: false,
            trigger: DebriefTrigger::Manual,
            correlation_id: Some("req-123".to_string()),
        }
    }

    fn test_content() -> GeneratedContent {
        serde_json::from_value(serde_json::json!({
            "summary": "Good session.",
            "adherenceScore": 88,
            "streakContext": { "current": 2, "longest": 6, "message": "Keep going.", "status": "building" }
        }))
        .unwrap()
    }

    #[test]
    fn test_draft_decomposes_content_into_columns() {
        let options = test_options();
        let draft = DebriefDraft::assemble(&options, &test_content(), "gemini-2.0-flash");

        assert_eq!(draft.summary, "Good session.");
        assert_eq!(draft.adherence_score, Some(88));
        assert!(draft.pr_highlights.is_none());
        assert_eq!(draft.streak_context.as_ref().unwrap()["longest"], 6);
    }

    #[test]
    fn test_metadata_always_carries_timestamp_and_trigger() {
        let metadata = build_metadata(
            DebriefTrigger::Regenerate,
            "gemini-2.0-flash",
            Some("req-9"),
            None,
            Some("America/Denver"),
        );

        assert_eq!(metadata["trigger"], "regenerate");
        assert_eq!(metadata["model"], "gemini-2.0-flash");
        assert_eq!(metadata["correlationId"], "req-9");
        assert_eq!(metadata["timezone"], "America/Denver");
        assert!(metadata["locale"].is_null());
        assert!(
            metadata["generatedAt"].as_str().unwrap().contains('T'),
            "generatedAt should be RFC 3339"
        );
    }

    #[test]
    fn test_opt_value_passes_none_through() {
        assert!(opt_value::<serde_json::Value>(&None).is_none());
        let some = opt_value(&Some(vec![1, 2, 3])).unwrap();
        assert_eq!(some, serde_json::json!([1, 2, 3]));
    }
}
