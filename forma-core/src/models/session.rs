use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A completed workout session, owned by the save workflow. The pipeline
/// only ever reads these rows while gathering prompt context.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkoutSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stats: serde_json::Value,
}
