// src/models.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::generate_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Represents a message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(alias = "_id", default = "generate_id")]
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub edited: bool,
    #[serde(default)]
    pub regenerated: bool,
    #[serde(default, skip_serializing)]
    pub is_streaming: bool,
    #[serde(default, skip_serializing)]
    pub is_error: bool,
    #[serde(default, skip_serializing)]
    pub is_cancelled: bool,
    #[serde(default)]
    pub user_reaction: Option<String>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content.into())
    }

    /// An empty assistant message waiting for its stream or reply.
    pub fn placeholder(model: &str) -> Self {
        let mut message = Self::new(Role::Assistant, String::new());
        message.model = Some(model.to_string());
        message.is_streaming = true;
        message
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content.into())
    }

    fn new(role: Role, content: String) -> Self {
        Self {
            id: generate_id(),
            role,
            content,
            timestamp: Utc::now(),
            model: None,
            image: None,
            edited: false,
            regenerated: false,
            is_streaming: false,
            is_error: false,
            is_cancelled: false,
            user_reaction: None,
        }
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }
}

/// A full conversation as stored by the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// A row of the conversation list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl ModelInfo {
    pub fn new(key: &str, name: &str, description: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            description: Some(description.to_string()),
        }
    }
}

/// Catalog served when the backend cannot be asked.
pub fn default_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo::new("gpt-3.5", "GPT-3.5 Turbo", "Fast & efficient"),
        ModelInfo::new("gpt-4", "GPT-4 Turbo", "Most capable"),
        ModelInfo::new("claude-3", "Claude 3 Haiku", "Fast & safe"),
        ModelInfo::new("llama-3.1-8b", "Llama 3.1 8B", "Open source"),
    ]
}

/// Body shared by `/chat/message` and `/chat/stream`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub conversation_id: Option<String>,
    pub model: String,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt_override: Option<String>,
}

/// Standard `{success, data, error}` response wrapper.
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    #[serde(default)]
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<Value>,
}

/// Message as returned by the single-shot send endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyMessage {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReply {
    pub conversation_id: String,
    pub message: ReplyMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegeneratedContent {
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegenerateReply {
    pub message: RegeneratedContent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewResponse {
    pub id: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditReply {
    #[serde(default)]
    pub new_response: Option<NewResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Txt,
    Markdown,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Txt => "txt",
            ExportFormat::Markdown => "md",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Some(ExportFormat::Json),
            "txt" | "text" => Some(ExportFormat::Txt),
            "md" | "markdown" => Some(ExportFormat::Markdown),
            _ => None,
        }
    }
}

/// Either the exported document or, for text formats, where to download it.
#[derive(Debug, Clone, PartialEq)]
pub enum Export {
    Document(Value),
    DownloadUrl(String),
}

/// Logs details of each API call.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiCallLog {
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    pub request_summary: String,
    pub response_status: u16,
    pub response_time_ms: u128,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_deserializes_backend_shape() {
        let message: Message = serde_json::from_value(json!({
            "id": "m1",
            "role": "assistant",
            "content": "hello",
            "timestamp": "2024-05-01T10:00:00Z",
            "model": "gpt-4",
            "edited": true
        }))
        .unwrap();

        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.model.as_deref(), Some("gpt-4"));
        assert!(message.edited);
        assert!(!message.is_streaming);
        assert!(message.image.is_none());
    }

    #[test]
    fn test_chat_request_uses_camel_case_and_skips_missing_prompt() {
        let request = ChatRequest {
            message: "hi".into(),
            conversation_id: None,
            model: "gpt-4".into(),
            temperature: 0.5,
            system_prompt_override: None,
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(
            body,
            json!({"message": "hi", "conversationId": null, "model": "gpt-4", "temperature": 0.5})
        );
    }

    #[test]
    fn test_placeholder_starts_streaming_and_empty() {
        let message = Message::placeholder("gpt-4");
        assert!(message.is_streaming);
        assert!(message.content.is_empty());
        assert_eq!(message.role, Role::Assistant);
    }

    #[test]
    fn test_export_format_parse() {
        assert_eq!(ExportFormat::parse("MD"), Some(ExportFormat::Markdown));
        assert_eq!(ExportFormat::parse("pdf"), None);
    }
}
