//! Bulk-debrief orchestrator — fan-out with per-item fault isolation
//!
//! Generates debriefs for many sessions of one user. The contract is
//! isolation, not sequencing: one failing session never aborts its
//! siblings, and every failure is returned as data next to whatever
//! succeeded.
//!
//! Shape of a run:
//! - context gathering for all sessions concurrently (read-only I/O)
//! - generation calls strictly one at a time (the endpoint is rate-limited
//!   per caller)
//! - one aggregated persistence pass: one grouped max-version query, one
//!   grouped deactivation, then a single multi-row insert — chunked through
//!   the batch writer once the payload count passes
//!   `SINGLE_STATEMENT_MAX_ROWS`. If the aggregated insert fails, each row
//!   is retried individually so the batch still makes forward progress.

use futures::future::join_all;
use sqlx::PgPool;
use uuid::Uuid;

use crate::context::gather_context;
use crate::prompt::build_prompt;
use crate::subsystems::generate::{build_metadata, opt_value};
use crate::subsystems::store::{self, DebriefRow};
use crate::subsystems::writer;
use forma_core::config::PersistenceConfig;
use forma_core::generation::{classify_failure, FailureClass, GenerationBackend, GenerationRequest};
use forma_core::models::content::parse_generated;
use forma_core::models::{DebriefTrigger, GeneratedContent, SessionDebrief};
use forma_core::DebriefError;

/// Payload counts up to this go out as one plain multi-row insert; larger
/// batches go through the chunked writer.
pub(crate) const SINGLE_STATEMENT_MAX_ROWS: usize = 5;

// ============================================================================
// PUBLIC API
// ============================================================================

#[derive(Debug, Clone)]
pub struct BulkGenerateOptions {
    pub user_id: Uuid,
    pub session_ids: Vec<Uuid>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub skip_if_active: bool,
    pub trigger: DebriefTrigger,
    pub correlation_id: Option<String>,
}

/// One failed session. Carried as data — never thrown.
#[derive(Debug)]
pub struct BulkFailure {
    pub session_id: Uuid,
    pub error: DebriefError,
}

#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub debriefs: Vec<SessionDebrief>,
    pub errors: Vec<BulkFailure>,
}

/// Generate and persist debriefs for a batch of sessions.
///
/// Per-session failures land in `BulkOutcome::errors`. The outer `Err` is
/// reserved for batch-wide storage failures in the grouped persistence
/// statements, before any row of this batch has been written.
pub async fn bulk_generate_and_persist_debriefs(
    pool: &PgPool,
    backend: &dyn GenerationBackend,
    persistence: &PersistenceConfig,
    options: BulkGenerateOptions,
) -> Result<BulkOutcome, DebriefError> {
    let mut outcome = BulkOutcome::default();

    if options.session_ids.is_empty() {
        return Ok(outcome);
    }

    tracing::info!(
        sessions = options.session_ids.len(),
        trigger = options.trigger.as_str(),
        correlation_id = options.correlation_id.as_deref().unwrap_or("-"),
        "Bulk debrief generation started"
    );

    // Context gathering: all sessions concurrently, failures captured
    // per session.
    let user_id = options.user_id;
    let locale = options.locale.as_deref();
    let timezone = options.timezone.as_deref();

    let gathered = join_all(options.session_ids.iter().map(|&session_id| async move {
        let result = gather_context(pool, user_id, session_id, locale, timezone).await;
        (session_id, result)
    }))
    .await;

    let mut contexts = Vec::with_capacity(gathered.len());
    for (session_id, result) in gathered {
        match result {
            Ok(context) => contexts.push((session_id, context)),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Context gathering failed");
                outcome.errors.push(BulkFailure {
                    session_id,
                    error: e,
                });
            }
        }
    }

    // One grouped active-record lookup for the whole batch; feeds both the
    // skip-if-active check and supersession later.
    let context_ids: Vec<Uuid> = contexts.iter().map(|(id, _)| *id).collect();
    let actives = store::find_active_many(pool, user_id, &context_ids).await?;

    // Generation: strictly sequential, failures captured per session.
    let mut generated: Vec<(Uuid, GeneratedContent)> = Vec::with_capacity(contexts.len());
    for (session_id, context) in contexts {
        if options.skip_if_active {
            if let Some(active) = actives.get(&session_id) {
                tracing::info!(
                    session_id = %session_id,
                    version = active.version,
                    "Active debrief exists, skipping"
                );
                continue;
            }
        }

        let parts = build_prompt(&context);
        let request = GenerationRequest {
            system_text: parts.system_text,
            user_text: parts.user_text,
        };

        let content = match backend.generate(&request).await {
            Ok(response) => parse_generated(&response.text),
            Err(e) => Err(match classify_failure(&e) {
                FailureClass::RateLimited => DebriefError::RateLimited(e.to_string()),
                FailureClass::Unclassified => DebriefError::Generation(e),
            }),
        };

        match content {
            Ok(c) => generated.push((session_id, c)),
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Generation failed");
                outcome.errors.push(BulkFailure {
                    session_id,
                    error: e,
                });
            }
        }
    }

    if generated.is_empty() {
        return Ok(outcome);
    }

    persist_batch(
        pool,
        persistence,
        &options,
        backend.model(),
        &actives,
        generated,
        &mut outcome,
    )
    .await?;

    tracing::info!(
        written = outcome.debriefs.len(),
        failed = outcome.errors.len(),
        "Bulk debrief generation finished"
    );

    Ok(outcome)
}

// ============================================================================
// Aggregated persistence
// ============================================================================

async fn persist_batch(
    pool: &PgPool,
    persistence: &PersistenceConfig,
    options: &BulkGenerateOptions,
    model: &str,
    actives: &std::collections::HashMap<Uuid, SessionDebrief>,
    generated: Vec<(Uuid, GeneratedContent)>,
    outcome: &mut BulkOutcome,
) -> Result<(), DebriefError> {
    let generated_ids: Vec<Uuid> = generated.iter().map(|(id, _)| *id).collect();

    // One grouped next-version read for the whole batch.
    let versions = store::max_versions(pool, options.user_id, &generated_ids).await?;

    let rows: Vec<DebriefRow> = generated
        .into_iter()
        .map(|(session_id, content)| {
            let prior = actives.get(&session_id);
            let prior_regenerations = prior.map_or(0, |p| p.regeneration_count);
            let regeneration_count = if options.trigger == DebriefTrigger::Regenerate {
                prior_regenerations + 1
            } else {
                prior_regenerations
            };

            DebriefRow {
                user_id: options.user_id,
                session_id,
                version: versions.get(&session_id).copied().unwrap_or(0) + 1,
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
                regeneration_count,
                parent_debrief_id: prior.map(|p| p.id),
            }
        })
        .collect();

    // One grouped deactivation for every record this batch supersedes.
    let superseded: Vec<Uuid> = rows
        .iter()
        .filter_map(|row| row.parent_debrief_id)
        .collect();
    store::deactivate_many(pool, &superseded).await?;

    let inserted = if rows.len() > SINGLE_STATEMENT_MAX_ROWS {
        writer::insert_chunked(pool, &rows, persistence.insert_param_budget).await
    } else {
        store::insert_rows(pool, &rows).await
    };

    match inserted {
        Ok(records) => outcome.debriefs.extend(records),
        Err(e) => {
            // Best-effort forward progress: the aggregated insert failed as
            // a unit, so retry each payload on its own and only report the
            // rows that still fail.
            tracing::warn!(
                error = %e,
                rows = rows.len(),
                "Aggregated debrief insert failed, falling back to per-item inserts"
            );
            for row in &rows {
                match insert_row_with_version_retry(pool, row).await {
                    Ok(record) => outcome.debriefs.push(record),
                    Err(err) => {
                        tracing::warn!(
                            session_id = %row.session_id,
                            error = %err,
                            "Per-item debrief insert failed"
                        );
                        outcome.errors.push(BulkFailure {
                            session_id: row.session_id,
                            error: err,
                        });
                    }
                }
            }
        }
    }

    Ok(())
}

/// Insert one row, recomputing the version once if the uniqueness guard
/// reports a collision with a concurrent writer.
async fn insert_row_with_version_retry(
    pool: &PgPool,
    row: &DebriefRow,
) -> Result<SessionDebrief, DebriefError> {
    match store::insert_one(pool, row).await {
        Ok(record) => Ok(record),
        Err(e) if store::is_unique_violation(&e) => {
            tracing::warn!(
                session_id = %row.session_id,
                "Version collided with a concurrent generation, retrying insert"
            );
            let next_version = store::max_version(pool, row.user_id, row.session_id).await? + 1;
            let mut retry = row.clone();
            retry.version = next_version;
            Ok(store::insert_one(pool, &retry).await?)
        }
        Err(e) => Err(e.into()),
    }
}
