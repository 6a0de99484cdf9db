// src/app_state.rs

use crate::api::ChatBackend;
use crate::chat::ChatState;
use crate::config::{validate_settings, Config, Settings};
use crate::errors::{PalaverError, PalaverResult};
use crate::models::{default_models, ConversationSummary, Export, ExportFormat, ModelInfo};
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;

/// Everything the session owns: the active conversation, the conversation
/// list, the model catalog and the persisted settings.
pub struct AppState<B: ChatBackend + ?Sized> {
    backend: Arc<B>,
    chat: ChatState<B>,
    conversations: Vec<ConversationSummary>,
    models: Vec<ModelInfo>,
    config: Config,
    config_path: PathBuf,
}

impl<B: ChatBackend + ?Sized> AppState<B> {
    pub fn new(backend: Arc<B>, config: Config, config_path: PathBuf) -> Self {
        let mut chat = ChatState::new(backend.clone());
        chat.set_temperature(config.settings.temperature);
        chat.set_system_prompt(config.settings.system_prompt.clone());

        Self {
            backend,
            chat,
            conversations: Vec::new(),
            models: default_models(),
            config,
            config_path,
        }
    }

    pub fn chat(&self) -> &ChatState<B> {
        &self.chat
    }

    pub fn chat_mut(&mut self) -> &mut ChatState<B> {
        &mut self.chat
    }

    pub fn conversations(&self) -> &[ConversationSummary] {
        &self.conversations
    }

    pub fn models(&self) -> &[ModelInfo] {
        &self.models
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn settings(&self) -> &Settings {
        &self.config.settings
    }

    pub fn selected_model(&self) -> &str {
        &self.config.selected_model
    }

    /// Fetches the model catalog, keeping the built-in list when the backend
    /// fails or has nothing to offer.
    pub async fn load_models(&mut self) {
        match self.backend.get_models().await {
            Ok(models) if !models.is_empty() => {
                debug!("Loaded {} models", models.len());
                self.models = models;
            }
            Ok(_) => warn!("Backend returned an empty model list, keeping defaults"),
            Err(e) => warn!("Failed to load models, keeping defaults: {}", e),
        }
    }

    pub async fn refresh_conversations(&mut self) {
        match self.backend.list_conversations().await {
            Ok(conversations) => self.conversations = conversations,
            Err(e) => warn!("Failed to load conversations: {}", e),
        }
    }

    pub fn new_chat(&mut self) {
        self.chat.clear();
    }

    /// Sends with the selected model and streaming preference, refreshing the
    /// conversation list once the reply landed.
    pub async fn send(&mut self, text: &str) -> PalaverResult<()> {
        let model = self.config.selected_model.clone();
        let streaming = self.config.settings.streaming_enabled;
        self.chat.send(text, &model, streaming).await?;

        if self.chat.error().is_none() && self.chat.conversation_id().is_some() {
            self.refresh_conversations().await;
        }
        Ok(())
    }

    pub async fn regenerate(&mut self, message_id: &str) -> PalaverResult<()> {
        let model = self.config.selected_model.clone();
        self.chat.regenerate(message_id, &model).await
    }

    pub async fn edit(&mut self, message_id: &str, new_content: &str) -> PalaverResult<()> {
        let model = self.config.selected_model.clone();
        self.chat.edit(message_id, new_content, &model).await
    }

    pub async fn load_conversation(&mut self, id: &str) -> PalaverResult<()> {
        self.chat.load_conversation(id).await
    }

    /// Removes the conversation once the backend confirms. Returns whether it was deleted.
    pub async fn delete_conversation(&mut self, id: &str) -> bool {
        match self.backend.delete_conversation(id).await {
            Ok(()) => {
                self.conversations.retain(|c| c.id != id);
                if self.chat.conversation_id() == Some(id) {
                    self.chat.clear();
                }
                info!("Deleted conversation {}", id);
                true
            }
            Err(e) => {
                warn!("Failed to delete conversation {}: {}", id, e);
                false
            }
        }
    }

    /// Records a reaction on the backend, then on the local message.
    pub async fn react(&mut self, message_id: &str, reaction: &str) -> PalaverResult<bool> {
        let Some(conversation_id) = self.chat.conversation_id().map(str::to_string) else {
            return Ok(false);
        };
        if !self.chat.messages().iter().any(|m| m.id == message_id) {
            return Err(PalaverError::MessageNotFound {
                id: message_id.to_string(),
            });
        }

        match self
            .backend
            .add_reaction(&conversation_id, message_id, reaction)
            .await
        {
            Ok(()) => {
                self.chat.set_reaction(message_id, reaction)?;
                Ok(true)
            }
            Err(e) => {
                warn!("Failed to add reaction to {}: {}", message_id, e);
                Ok(false)
            }
        }
    }

    pub async fn rename_conversation(&mut self, id: &str, title: &str) -> bool {
        match self.backend.rename_conversation(id, title).await {
            Ok(()) => {
                if let Some(row) = self.conversations.iter_mut().find(|c| c.id == id) {
                    row.title = Some(title.to_string());
                }
                true
            }
            Err(e) => {
                warn!("Failed to rename conversation {}: {}", id, e);
                false
            }
        }
    }

    pub async fn search_conversations(&self, query: &str) -> PalaverResult<Vec<ConversationSummary>> {
        self.backend.search_conversations(query).await
    }

    pub async fn export_conversation(&self, id: &str, format: ExportFormat) -> PalaverResult<Export> {
        self.backend.export_conversation(id, format).await
    }

    /// Switches the active model. Only keys from the catalog are accepted.
    pub fn select_model(&mut self, key: &str) -> PalaverResult<()> {
        if !self.models.iter().any(|m| m.key == key) {
            return Err(PalaverError::config_error(format!("Unknown model '{}'", key)));
        }
        let mut updated = self.config.clone();
        updated.selected_model = key.to_string();
        self.config.update(updated, &self.config_path)
    }

    pub fn update_settings(&mut self, settings: Settings) -> PalaverResult<()> {
        validate_settings(&settings)?;
        let mut updated = self.config.clone();
        updated.settings = settings;
        self.config.update(updated, &self.config_path)?;

        self.chat.set_temperature(self.config.settings.temperature);
        self.chat
            .set_system_prompt(self.config.settings.system_prompt.clone());
        Ok(())
    }

    pub fn reset_settings(&mut self) -> PalaverResult<()> {
        self.update_settings(Settings::default())
    }
}
