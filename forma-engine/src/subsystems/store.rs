//! Storage primitives for session debriefs
//!
//! Every statement the pipeline issues lives here: active-record lookups,
//! next-version reads, deactivation (supersession), inserts, and the error
//! signatures the orchestrators retry on. Bulk variants are one grouped
//! statement over `ANY($n)` — never a query per record.
//!
//! Rows are append-only. The only UPDATE in this module flips `is_active`
//! off; version and summary are immutable once written.

use std::collections::HashMap;

use sqlx::{PgExecutor, PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use forma_core::models::SessionDebrief;

/// Bound parameters per inserted row. Chunk budgets divide by this.
pub const INSERT_PARAMS_PER_ROW: usize = 13;

const DEBRIEF_COLUMNS: &str = "id, user_id, session_id, version, summary, pr_highlights, \
     adherence_score, focus_areas, streak_context, overload_digest, metadata, is_active, \
     regeneration_count, parent_debrief_id, created_at, updated_at";

/// Insert payload for one debrief row. `is_active` is always true at insert
/// time; version, parent, and regeneration count are computed by the
/// orchestrators before the row reaches this module.
#[derive(Debug, Clone)]
pub struct DebriefRow {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub version: i32,
    pub summary: String,
    pub pr_highlights: Option<serde_json::Value>,
    pub adherence_score: Option<i16>,
    pub focus_areas: Option<serde_json::Value>,
    pub streak_context: Option<serde_json::Value>,
    pub overload_digest: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
    pub regeneration_count: i32,
    pub parent_debrief_id: Option<Uuid>,
}

// ============================================================================
// Lookups
// ============================================================================

/// The current active debrief for one (user, session) pair, if any.
pub async fn find_active<'e, E>(
    executor: E,
    user_id: Uuid,
    session_id: Uuid,
) -> Result<Option<SessionDebrief>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let query = format!(
        "SELECT {} FROM session_debriefs
         WHERE user_id = $1 AND session_id = $2 AND is_active = TRUE
         LIMIT 1",
        DEBRIEF_COLUMNS
    );

    sqlx::query_as(&query)
        .bind(user_id)
        .bind(session_id)
        .fetch_optional(executor)
        .await
}

/// Active debriefs for a whole batch, keyed by session id. One statement.
pub async fn find_active_many(
    pool: &PgPool,
    user_id: Uuid,
    session_ids: &[Uuid],
) -> Result<HashMap<Uuid, SessionDebrief>, sqlx::Error> {
    if session_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let query = format!(
        "SELECT {} FROM session_debriefs
         WHERE user_id = $1 AND session_id = ANY($2) AND is_active = TRUE",
        DEBRIEF_COLUMNS
    );

    let rows: Vec<SessionDebrief> = sqlx::query_as(&query)
        .bind(user_id)
        .bind(session_ids)
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(|d| (d.session_id, d)).collect())
}

/// Version history for one session, newest first. Read-only.
pub async fn list_history(
    pool: &PgPool,
    user_id: Uuid,
    session_id: Uuid,
    limit: i64,
) -> Result<Vec<SessionDebrief>, sqlx::Error> {
    let query = format!(
        "SELECT {} FROM session_debriefs
         WHERE user_id = $1 AND session_id = $2
         ORDER BY version DESC
         LIMIT $3",
        DEBRIEF_COLUMNS
    );

    sqlx::query_as(&query)
        .bind(user_id)
        .bind(session_id)
        .bind(limit)
        .fetch_all(pool)
        .await
}

// ============================================================================
// Version allocation
// ============================================================================

/// Highest version written for the pair so far, 0 when none.
pub async fn max_version<'e, E>(
    executor: E,
    user_id: Uuid,
    session_id: Uuid,
) -> Result<i32, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let row: (i32,) = sqlx::query_as(
        "SELECT COALESCE(MAX(version), 0)
         FROM session_debriefs
         WHERE user_id = $1 AND session_id = $2",
    )
    .bind(user_id)
    .bind(session_id)
    .fetch_one(executor)
    .await?;

    Ok(row.0)
}

/// Highest version per session across a batch. One grouped statement;
/// sessions with no debriefs yet are simply absent from the map.
pub async fn max_versions(
    pool: &PgPool,
    user_id: Uuid,
    session_ids: &[Uuid],
) -> Result<HashMap<Uuid, i32>, sqlx::Error> {
    if session_ids.is_empty() {
        return Ok(HashMap::new());
    }

    let rows: Vec<(Uuid, i32)> = sqlx::query_as(
        "SELECT session_id, MAX(version)
         FROM session_debriefs
         WHERE user_id = $1 AND session_id = ANY($2)
         GROUP BY session_id",
    )
    .bind(user_id)
    .bind(session_ids)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().collect())
}

// ============================================================================
// Supersession
// ============================================================================

pub async fn deactivate<'e, E>(executor: E, id: Uuid) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query("UPDATE session_debriefs SET is_active = FALSE, updated_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await?;

    Ok(())
}

/// Deactivate every superseded record in a batch with one statement.
pub async fn deactivate_many(pool: &PgPool, ids: &[Uuid]) -> Result<u64, sqlx::Error> {
    if ids.is_empty() {
        return Ok(0);
    }

    let result = sqlx::query(
        "UPDATE session_debriefs SET is_active = FALSE, updated_at = NOW() WHERE id = ANY($1)",
    )
    .bind(ids)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

// ============================================================================
// Inserts
// ============================================================================

pub async fn insert_one<'e, E>(executor: E, row: &DebriefRow) -> Result<SessionDebrief, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let query = format!(
        "INSERT INTO session_debriefs
             (user_id, session_id, version, summary, pr_highlights, adherence_score,
              focus_areas, streak_context, overload_digest, metadata, is_active,
              regeneration_count, parent_debrief_id)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
         RETURNING {}",
        DEBRIEF_COLUMNS
    );

    sqlx::query_as(&query)
        .bind(row.user_id)
        .bind(row.session_id)
        .bind(row.version)
        .bind(&row.summary)
        .bind(&row.pr_highlights)
        .bind(row.adherence_score)
        .bind(&row.focus_areas)
        .bind(&row.streak_context)
        .bind(&row.overload_digest)
        .bind(&row.metadata)
        .bind(true)
        .bind(row.regeneration_count)
        .bind(row.parent_debrief_id)
        .fetch_one(executor)
        .await
}

/// Multi-row insert, one statement, results in input order.
pub async fn insert_rows(
    pool: &PgPool,
    rows: &[DebriefRow],
) -> Result<Vec<SessionDebrief>, sqlx::Error> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO session_debriefs
             (user_id, session_id, version, summary, pr_highlights, adherence_score,
              focus_areas, streak_context, overload_digest, metadata, is_active,
              regeneration_count, parent_debrief_id) ",
    );

    builder.push_values(rows, |mut b, row| {
        b.push_bind(row.user_id)
            .push_bind(row.session_id)
            .push_bind(row.version)
            .push_bind(&row.summary)
            .push_bind(&row.pr_highlights)
            .push_bind(row.adherence_score)
            .push_bind(&row.focus_areas)
            .push_bind(&row.streak_context)
            .push_bind(&row.overload_digest)
            .push_bind(&row.metadata)
            .push_bind(true)
            .push_bind(row.regeneration_count)
            .push_bind(row.parent_debrief_id);
    });

    builder.push(" RETURNING ");
    builder.push(DEBRIEF_COLUMNS);

    builder
        .build_query_as::<SessionDebrief>()
        .fetch_all(pool)
        .await
}

// ============================================================================
// Error signatures
// ============================================================================

/// SQLSTATE 23505 — the (user_id, session_id, version) uniqueness guard
/// caught two concurrent generations computing the same next version.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// SQLSTATE 25001 or the classic message: the store refused the
/// transactional wrapper because a transaction is already running.
pub fn is_nested_transaction_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("25001")
                || db
                    .message()
                    .to_lowercase()
                    .contains("already a transaction in progress")
        }
        _ => false,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_database_errors_match_no_signature() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
        assert!(!is_nested_transaction_error(&sqlx::Error::RowNotFound));
        assert!(!is_unique_violation(&sqlx::Error::PoolClosed));
    }

    #[test]
    fn test_insert_params_per_row_matches_statement() {
        // The INSERT in insert_one binds $1..$13.
        assert_eq!(INSERT_PARAMS_PER_ROW, 13);
    }
}
