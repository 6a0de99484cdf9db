use crate::{
    errors::{PalaverError, PalaverResult},
    logging::log_api_call,
    models::{
        ApiCallLog, ChatRequest, Conversation, ConversationSummary, EditReply, Envelope, Export,
        ExportFormat, ModelInfo, RegenerateReply, SendReply,
    },
    stream::StreamHandle,
};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use reqwest::{header, Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Instant;

/// Everything the chat state needs from the backend.
///
/// Implementations issue exactly one request per call and never retry.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn send_message(&self, request: &ChatRequest) -> PalaverResult<SendReply>;

    async fn open_stream(&self, request: &ChatRequest) -> PalaverResult<StreamHandle>;

    async fn regenerate_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        model: &str,
        temperature: f32,
    ) -> PalaverResult<RegenerateReply>;

    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
        model: &str,
        temperature: f32,
    ) -> PalaverResult<EditReply>;

    async fn add_reaction(
        &self,
        conversation_id: &str,
        message_id: &str,
        reaction: &str,
    ) -> PalaverResult<()>;

    async fn list_conversations(&self) -> PalaverResult<Vec<ConversationSummary>>;

    async fn get_conversation(&self, id: &str) -> PalaverResult<Conversation>;

    async fn delete_conversation(&self, id: &str) -> PalaverResult<()>;

    async fn rename_conversation(&self, id: &str, title: &str) -> PalaverResult<()>;

    async fn search_conversations(&self, query: &str) -> PalaverResult<Vec<ConversationSummary>>;

    async fn export_conversation(&self, id: &str, format: ExportFormat) -> PalaverResult<Export>;

    async fn get_models(&self) -> PalaverResult<Vec<ModelInfo>>;
}

/// HTTP client for the chat backend.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    fn builder(&self, method: Method, endpoint: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(endpoint))
            .header(header::CONTENT_TYPE, "application/json")
    }

    /// Sends the request and returns the raw JSON body of a 2xx response.
    async fn fetch(
        &self,
        builder: RequestBuilder,
        endpoint: &str,
        summary: &str,
    ) -> PalaverResult<Value> {
        let start_time = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| PalaverError::network_error(None, format!("Request failed: {}", e)))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        record_call(endpoint, summary, status, start_time);

        if !status.is_success() {
            return Err(status_error(status, &text));
        }

        serde_json::from_str(&text).map_err(|e| {
            PalaverError::network_error(
                Some(status.as_u16()),
                format!("Failed to parse API response: {}", e),
            )
        })
    }

    /// Sends the request and unwraps the `{success, data, error}` envelope.
    async fn execute<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        endpoint: &str,
        summary: &str,
    ) -> PalaverResult<Option<T>> {
        let body = self.fetch(builder, endpoint, summary).await?;
        let envelope: Envelope<T> = serde_json::from_value(body).map_err(|e| {
            PalaverError::network_error(None, format!("Unexpected response shape: {}", e))
        })?;

        if !envelope.success {
            let message = envelope
                .error
                .as_ref()
                .and_then(error_message)
                .unwrap_or_else(|| "Request failed".to_string());
            return Err(PalaverError::backend_error(message));
        }

        Ok(envelope.data)
    }

    async fn execute_data<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        endpoint: &str,
        summary: &str,
    ) -> PalaverResult<T> {
        self.execute(builder, endpoint, summary)
            .await?
            .ok_or_else(|| PalaverError::backend_error("Response missing expected data"))
    }
}

#[async_trait]
impl ChatBackend for ApiClient {
    async fn send_message(&self, request: &ChatRequest) -> PalaverResult<SendReply> {
        let endpoint = "/chat/message";
        let builder = self.builder(Method::POST, endpoint).json(request);
        self.execute_data(builder, endpoint, "send_message").await
    }

    async fn open_stream(&self, request: &ChatRequest) -> PalaverResult<StreamHandle> {
        let endpoint = "/chat/stream";
        let start_time = Instant::now();
        let response = self
            .builder(Method::POST, endpoint)
            .header(header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| PalaverError::network_error(None, format!("Request failed: {}", e)))?;

        let status = response.status();
        record_call(endpoint, "open_stream", status, start_time);

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }

        let chunks = response
            .bytes_stream()
            .map_ok(|bytes| bytes.to_vec())
            .map_err(PalaverError::from);
        Ok(StreamHandle::new(chunks))
    }

    async fn regenerate_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        model: &str,
        temperature: f32,
    ) -> PalaverResult<RegenerateReply> {
        let endpoint = "/chat/regenerate";
        let builder = self.builder(Method::POST, endpoint).json(&json!({
            "conversationId": conversation_id,
            "messageId": message_id,
            "model": model,
            "temperature": temperature,
        }));
        self.execute_data(builder, endpoint, "regenerate_message").await
    }

    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        content: &str,
        model: &str,
        temperature: f32,
    ) -> PalaverResult<EditReply> {
        let endpoint = format!("/chat/message/{}/{}", conversation_id, message_id);
        let builder = self.builder(Method::PUT, &endpoint).json(&json!({
            "content": content,
            "model": model,
            "temperature": temperature,
        }));
        Ok(self
            .execute(builder, &endpoint, "edit_message")
            .await?
            .unwrap_or_default())
    }

    async fn add_reaction(
        &self,
        conversation_id: &str,
        message_id: &str,
        reaction: &str,
    ) -> PalaverResult<()> {
        let endpoint = "/chat/reaction";
        let builder = self.builder(Method::POST, endpoint).json(&json!({
            "conversationId": conversation_id,
            "messageId": message_id,
            "reaction": reaction,
        }));
        self.execute::<Value>(builder, endpoint, "add_reaction").await?;
        Ok(())
    }

    async fn list_conversations(&self) -> PalaverResult<Vec<ConversationSummary>> {
        let endpoint = "/chat/conversations";
        let builder = self.builder(Method::GET, endpoint);
        Ok(self
            .execute(builder, endpoint, "list_conversations")
            .await?
            .unwrap_or_default())
    }

    async fn get_conversation(&self, id: &str) -> PalaverResult<Conversation> {
        let endpoint = format!("/chat/conversations/{}", id);
        let builder = self.builder(Method::GET, &endpoint);
        self.execute_data(builder, &endpoint, "get_conversation").await
    }

    async fn delete_conversation(&self, id: &str) -> PalaverResult<()> {
        let endpoint = format!("/chat/conversations/{}", id);
        let builder = self.builder(Method::DELETE, &endpoint);
        self.execute::<Value>(builder, &endpoint, "delete_conversation")
            .await?;
        Ok(())
    }

    async fn rename_conversation(&self, id: &str, title: &str) -> PalaverResult<()> {
        let endpoint = format!("/chat/conversations/{}/rename", id);
        let builder = self
            .builder(Method::PUT, &endpoint)
            .json(&json!({ "title": title }));
        self.execute::<Value>(builder, &endpoint, "rename_conversation")
            .await?;
        Ok(())
    }

    async fn search_conversations(&self, query: &str) -> PalaverResult<Vec<ConversationSummary>> {
        let endpoint = "/chat/search";
        let builder = self.builder(Method::GET, endpoint).query(&[("q", query)]);
        Ok(self
            .execute(builder, endpoint, "search_conversations")
            .await?
            .unwrap_or_default())
    }

    async fn export_conversation(&self, id: &str, format: ExportFormat) -> PalaverResult<Export> {
        let endpoint = format!("/chat/export/{}", id);
        match format {
            ExportFormat::Json => {
                let builder = self
                    .builder(Method::GET, &endpoint)
                    .query(&[("format", format.as_str())]);
                let body = self.fetch(builder, &endpoint, "export_conversation").await?;
                Ok(Export::Document(body))
            }
            // Text exports are downloaded by the caller; no request is made here.
            _ => Ok(Export::DownloadUrl(format!(
                "{}?format={}",
                self.url(&endpoint),
                format.as_str()
            ))),
        }
    }

    async fn get_models(&self) -> PalaverResult<Vec<ModelInfo>> {
        let endpoint = "/chat/models";
        let builder = self.builder(Method::GET, endpoint);
        self.execute_data(builder, endpoint, "get_models").await
    }
}

fn record_call(endpoint: &str, summary: &str, status: StatusCode, start_time: Instant) {
    log_api_call(&ApiCallLog {
        timestamp: Utc::now(),
        endpoint: endpoint.to_string(),
        request_summary: summary.to_string(),
        response_status: status.as_u16(),
        response_time_ms: start_time.elapsed().as_millis(),
    });
}

/// Pulls a readable message out of `{"message": ..}` or a bare string.
fn error_message(error: &Value) -> Option<String> {
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
}

fn status_error(status: StatusCode, body: &str) -> PalaverError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(error_message))
        .unwrap_or_else(|| "Request failed".to_string());
    PalaverError::network_error(Some(status.as_u16()), message)
}
