use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// One persisted debrief version. Rows are append-only; the only mutation
/// the pipeline performs is flipping `is_active` off when superseded.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionDebrief {
    pub id: Uuid,
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
    pub is_active: bool,
    pub regeneration_count: i32,
    pub parent_debrief_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What caused a generation run. Recorded in row metadata; `Regenerate`
/// additionally bumps `regeneration_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebriefTrigger {
    Auto,
    Manual,
    Regenerate,
}

impl DebriefTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            DebriefTrigger::Auto => "auto",
            DebriefTrigger::Manual => "manual",
            DebriefTrigger::Regenerate => "regenerate",
        }
    }
}

impl FromStr for DebriefTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(DebriefTrigger::Auto),
            "manual" => Ok(DebriefTrigger::Manual),
            "regenerate" => Ok(DebriefTrigger::Regenerate),
            other => Err(format!("unknown trigger '{}'", other)),
        }
    }
}
