use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Replica key prefix for the active model selection.
pub const ACTIVE_MODEL_KEY_PREFIX: &str = "activeModel/";

/// Replica key for an active model selection id.
pub fn active_model_key(id: &str) -> String {
    format!("{ACTIVE_MODEL_KEY_PREFIX}{id}")
}

/// Reasoning-effort level for models that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

/// The client-wide active model selection. At most one exists at a time;
/// creation vs. update is disambiguated by whether a selection already exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveModel {
    pub id: String,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningEffort>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Full replacement of the selection's provider/model/reasoning fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveModelUpdate {
    pub id: String,
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<ReasoningEffort>,
    pub updated_at: DateTime<Utc>,
}
