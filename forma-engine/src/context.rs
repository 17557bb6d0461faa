//! Context gathering — the read-only stats bundle behind every prompt
//!
//! Owned conceptually by the session-statistics collaborator; the pipeline
//! only needs the session row plus a couple of cheap history aggregates.
//! Idempotent: safe to call any number of times for the same session.

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use forma_core::models::WorkoutSession;
use forma_core::DebriefError;

/// Everything the prompt builder gets to see. `stats` is opaque to the
/// pipeline beyond being JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ContextPayload {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub stats: serde_json::Value,
}

pub async fn gather_context(
    pool: &PgPool,
    user_id: Uuid,
    session_id: Uuid,
    locale: Option<&str>,
    timezone: Option<&str>,
) -> Result<ContextPayload, DebriefError> {
    let session: Option<WorkoutSession> = sqlx::query_as(
        "SELECT id, user_id, title, started_at, completed_at, stats
         FROM workout_sessions
         WHERE id = $1 AND user_id = $2",
    )
    .bind(session_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?;

    let session = session.ok_or(DebriefError::SessionNotFound(session_id))?;

    #[derive(sqlx::FromRow)]
    struct HistoryTotals {
        total_sessions: i64,
        trailing_week_sessions: i64,
    }

    let totals: HistoryTotals = sqlx::query_as(
        "SELECT COUNT(*)::bigint AS total_sessions,
                COUNT(*) FILTER (WHERE completed_at > NOW() - INTERVAL '7 days')::bigint
                    AS trailing_week_sessions
         FROM workout_sessions
         WHERE user_id = $1 AND completed_at IS NOT NULL",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?;

    let stats = serde_json::json!({
        "session": {
            "title": session.title,
            "startedAt": session.started_at,
            "completedAt": session.completed_at,
            "stats": session.stats,
        },
        "history": {
            "totalSessions": totals.total_sessions,
            "trailingWeekSessions": totals.trailing_week_sessions,
        },
    });

    Ok(ContextPayload {
        user_id,
        session_id,
        locale: locale.map(str::to_string),
        timezone: timezone.map(str::to_string),
        stats,
    })
}
