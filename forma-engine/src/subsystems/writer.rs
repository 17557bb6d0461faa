//! Chunked batch writer — statement-size-safe bulk inserts
//!
//! Some deployment backends reject a statement whose bound-parameter count
//! exceeds a fixed ceiling (Postgres caps at 65535). Given a flat list of
//! insert payloads and a call-site parameter budget, this module splits the
//! list so `rows × INSERT_PARAMS_PER_ROW ≤ budget`, issues one insert per
//! chunk, and concatenates the results in input order.

use sqlx::PgPool;

use crate::subsystems::store::{self, DebriefRow, INSERT_PARAMS_PER_ROW};
use forma_core::models::SessionDebrief;

/// Rows that fit in one statement under the given parameter budget.
/// Never 0 — a budget below one row still writes a row at a time.
pub fn rows_per_statement(param_budget: usize) -> usize {
    std::cmp::max(1, param_budget / INSERT_PARAMS_PER_ROW)
}

/// Insert all rows, one statement per chunk, preserving input order.
pub async fn insert_chunked(
    pool: &PgPool,
    rows: &[DebriefRow],
    param_budget: usize,
) -> Result<Vec<SessionDebrief>, sqlx::Error> {
    let per_statement = rows_per_statement(param_budget);
    let mut inserted = Vec::with_capacity(rows.len());

    for chunk in rows.chunks(per_statement) {
        tracing::debug!(
            chunk_rows = chunk.len(),
            per_statement = per_statement,
            "Writing debrief chunk"
        );
        inserted.extend(store::insert_rows(pool, chunk).await?);
    }

    Ok(inserted)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_fitting_70_rows_yields_two_statements_for_120() {
        let budget = 70 * INSERT_PARAMS_PER_ROW;
        assert_eq!(rows_per_statement(budget), 70);

        let payloads: Vec<u32> = (0..120).collect();
        let chunks: Vec<&[u32]> = payloads.chunks(rows_per_statement(budget)).collect();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 70);
        assert_eq!(chunks[1].len(), 50);

        // Concatenation preserves the original order.
        let flattened: Vec<u32> = chunks.into_iter().flatten().copied().collect();
        assert_eq!(flattened, payloads);
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_chunk() {
        let budget = 10 * INSERT_PARAMS_PER_ROW;
        let payloads: Vec<u32> = (0..30).collect();
        let chunks: Vec<&[u32]> = payloads.chunks(rows_per_statement(budget)).collect();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() == 10));
    }

    #[test]
    fn test_budget_below_one_row_still_makes_progress() {
        assert_eq!(rows_per_statement(INSERT_PARAMS_PER_ROW - 1), 1);
        assert_eq!(rows_per_statement(0), 1);
    }

    #[test]
    fn test_postgres_default_budget() {
        // 65535 bind parameters at 13 per row.
        assert_eq!(rows_per_statement(65535), 5041);
    }
}
