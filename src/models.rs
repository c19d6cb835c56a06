use serde::{Deserialize, Serialize};

/// Entity records shared by both backends. Timestamps are unix-epoch
/// milliseconds; serialized names match the remote document layout.

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    pub uid: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "displayName")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default, rename = "hasMigrated")]
    pub has_migrated: bool,
    #[serde(rename = "createdAt")]
    pub created_at_ms: i64,
    #[serde(rename = "updatedAt")]
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub title: String,
    #[serde(rename = "session_type")]
    pub session_type: String,
    #[serde(rename = "started_at")]
    pub started_at_ms: i64,
    #[serde(default, rename = "ended_at")]
    pub ended_at_ms: Option<i64>,
    #[serde(rename = "createdAt")]
    pub created_at_ms: i64,
    #[serde(rename = "updatedAt")]
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Preset {
    pub id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub title: String,
    pub prompt: String,
    #[serde(rename = "isDefault")]
    pub is_default: bool,
    #[serde(rename = "createdAt")]
    pub created_at_ms: i64,
    #[serde(rename = "updatedAt")]
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub provider: String,
    #[serde(default, rename = "apiKey")]
    pub api_key: Option<String>,
    #[serde(default, rename = "selected_llm_model")]
    pub selected_llm_model: Option<String>,
    #[serde(default, rename = "selected_stt_model")]
    pub selected_stt_model: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at_ms: i64,
    #[serde(rename = "updatedAt")]
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AiMessage {
    pub id: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub tokens: Option<i64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(rename = "sent_at")]
    pub sent_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Summary {
    pub id: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub tldr: String,
    pub text: String,
    #[serde(rename = "bullet_json")]
    pub bullet_json: String,
    #[serde(rename = "action_json")]
    pub action_json: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, rename = "tokens_used")]
    pub tokens_used: Option<i64>,
    #[serde(rename = "generated_at")]
    pub generated_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Transcript {
    pub id: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub speaker: String,
    pub text: String,
    pub lang: String,
    #[serde(rename = "start_at")]
    pub start_at_ms: i64,
    #[serde(default, rename = "end_at")]
    pub end_at_ms: Option<i64>,
}

pub fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
