// src/chat.rs

//! Conversation state: the ordered message list and the lifecycle of the one
//! request allowed in flight at a time.

use crate::api::ChatBackend;
use crate::constants::SEND_ERROR_MESSAGE;
use crate::errors::{PalaverError, PalaverResult};
use crate::models::{ChatRequest, Message, SendReply};
use crate::stream::{decode_stream, StreamResult};
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    Idle,
    Sending,
    Streaming,
    Completing,
    Cancelling,
}

/// Changes pushed to whoever renders the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Appended(Message),
    ContentUpdated { message_id: String, content: String },
    Replaced(Message),
    Truncated { len: usize },
    Loaded { conversation_id: String, count: usize },
    Phase(SendPhase),
    Reset,
}

#[derive(Debug, Default)]
struct ControlState {
    in_flight: bool,
    cancellable: bool,
    token: Option<CancellationToken>,
    cancel_requested: bool,
    clear_requested: bool,
}

/// Cloneable remote for the request in flight. Lets the UI stop a stream or
/// reset the conversation while `ChatState` is busy awaiting the backend.
#[derive(Debug, Clone, Default)]
pub struct ChatControl {
    inner: Arc<Mutex<ControlState>>,
}

impl ChatControl {
    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests cancellation of the active stream. Returns false when idle or
    /// when the request in flight is not a stream.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        Self::cancel_locked(&mut state)
    }

    /// Cancels whatever is in flight and empties the conversation once it
    /// unwinds. Returns false when idle; use `ChatState::clear` then.
    pub fn clear(&self) -> bool {
        let mut state = self.lock();
        if !state.in_flight {
            return false;
        }
        state.clear_requested = true;
        Self::cancel_locked(&mut state);
        true
    }

    fn cancel_locked(state: &mut ControlState) -> bool {
        if !state.in_flight || !state.cancellable {
            return false;
        }
        state.cancel_requested = true;
        if let Some(token) = &state.token {
            token.cancel();
        }
        true
    }

    pub fn is_active(&self) -> bool {
        self.lock().in_flight
    }

    fn begin(&self, cancellable: bool) {
        let mut state = self.lock();
        state.in_flight = true;
        state.cancellable = cancellable;
        state.cancel_requested = false;
        state.clear_requested = false;
        state.token = None;
    }

    fn attach(&self, token: CancellationToken) {
        let mut state = self.lock();
        if state.cancel_requested {
            token.cancel();
        }
        state.token = Some(token);
    }

    /// Ends the lifecycle; returns whether a clear was requested meanwhile.
    fn finish(&self) -> bool {
        let mut state = self.lock();
        state.in_flight = false;
        state.cancellable = false;
        state.token = None;
        state.cancel_requested = false;
        std::mem::take(&mut state.clear_requested)
    }
}

fn emit(events: &Option<mpsc::UnboundedSender<ChatEvent>>, event: ChatEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// Owns the message list of the active conversation.
///
/// Every mutation goes through `&mut self`, so there is exactly one writer.
/// Failures of send, regenerate and edit are absorbed into the state (an error
/// message or the `error` field); the returned `Err` is reserved for misuse such
/// as sending while busy or naming a message that does not exist.
pub struct ChatState<B: ChatBackend + ?Sized> {
    backend: Arc<B>,
    messages: Vec<Message>,
    conversation_id: Option<String>,
    phase: SendPhase,
    error: Option<String>,
    temperature: f32,
    system_prompt: Option<String>,
    control: ChatControl,
    events: Option<mpsc::UnboundedSender<ChatEvent>>,
}

impl<B: ChatBackend + ?Sized> ChatState<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            messages: Vec::new(),
            conversation_id: None,
            phase: SendPhase::Idle,
            error: None,
            temperature: crate::constants::DEFAULT_TEMPERATURE,
            system_prompt: None,
            control: ChatControl::default(),
            events: None,
        }
    }

    /// Starts delivering `ChatEvent`s. A later call replaces the earlier subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ChatEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn control(&self) -> ChatControl {
        self.control.clone()
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn phase(&self) -> SendPhase {
        self.phase
    }

    pub fn is_loading(&self) -> bool {
        self.phase != SendPhase::Idle
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_temperature(&mut self, temperature: f32) {
        self.temperature = temperature;
    }

    pub fn set_system_prompt(&mut self, system_prompt: Option<String>) {
        self.system_prompt = system_prompt;
    }

    /// Sends `text` and fills in the assistant reply, streamed or in one piece.
    pub async fn send(&mut self, text: &str, model: &str, streaming: bool) -> PalaverResult<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        self.begin(streaming)?;

        self.push(Message::user(text));
        self.push(Message::placeholder(model));
        let slot = self.messages.len() - 1;

        let request = ChatRequest {
            message: text.to_string(),
            conversation_id: self.conversation_id.clone(),
            model: model.to_string(),
            temperature: self.temperature,
            system_prompt_override: self.system_prompt.clone(),
        };

        if streaming {
            self.stream_reply(slot, &request).await;
        } else {
            self.complete_reply(slot, &request).await;
        }

        self.end();
        Ok(())
    }

    async fn stream_reply(&mut self, slot: usize, request: &ChatRequest) {
        let handle = match self.backend.open_stream(request).await {
            Ok(handle) => handle,
            Err(e) => return self.fail_reply(slot, e),
        };
        self.control.attach(handle.cancel_token());
        self.set_phase(SendPhase::Streaming);

        let result = {
            let messages = &mut self.messages;
            let events = &self.events;
            decode_stream(handle, |content| {
                let message = &mut messages[slot];
                message.content = content.to_string();
                emit(
                    events,
                    ChatEvent::ContentUpdated {
                        message_id: message.id.clone(),
                        content: content.to_string(),
                    },
                );
            })
            .await
        };

        match result {
            Ok(StreamResult {
                content,
                conversation_id,
                message_id,
            }) => {
                if conversation_id.is_some() {
                    self.conversation_id = conversation_id;
                }
                let mut message = self.messages[slot].clone();
                message.content = content;
                message.is_streaming = false;
                if let Some(id) = message_id {
                    message.id = id;
                }
                self.replace(slot, message);
            }
            Err(PalaverError::Cancelled { content }) => {
                self.set_phase(SendPhase::Cancelling);
                info!("Stream cancelled by user");
                let mut message = self.messages[slot].clone();
                message.content = content;
                message.is_streaming = false;
                message.is_cancelled = true;
                self.replace(slot, message);
            }
            Err(e) => self.fail_reply(slot, e),
        }
    }

    async fn complete_reply(&mut self, slot: usize, request: &ChatRequest) {
        self.set_phase(SendPhase::Completing);
        match self.backend.send_message(request).await {
            Ok(SendReply {
                conversation_id,
                message: reply,
            }) => {
                self.conversation_id = Some(conversation_id);
                let previous = &self.messages[slot];
                let message = Message {
                    id: reply.id,
                    content: reply.content,
                    timestamp: reply.timestamp.unwrap_or_else(Utc::now),
                    model: reply.model.or_else(|| previous.model.clone()),
                    image: reply.image,
                    is_streaming: false,
                    ..previous.clone()
                };
                self.replace(slot, message);
            }
            Err(e) => self.fail_reply(slot, e),
        }
    }

    fn fail_reply(&mut self, slot: usize, error: PalaverError) {
        warn!("Chat request failed: {}", error);
        self.error = Some(error.to_string());
        let mut message = self.messages[slot].clone();
        message.content = SEND_ERROR_MESSAGE.to_string();
        message.is_error = true;
        message.is_streaming = false;
        self.replace(slot, message);
    }

    /// Asks the backend for a new answer to `message_id` and swaps it in place.
    /// Does nothing before the conversation has a backend id.
    pub async fn regenerate(&mut self, message_id: &str, model: &str) -> PalaverResult<()> {
        let Some(conversation_id) = self.conversation_id.clone() else {
            return Ok(());
        };
        let index = self.position(message_id)?;
        self.begin(false)?;
        self.set_phase(SendPhase::Completing);

        match self
            .backend
            .regenerate_message(&conversation_id, message_id, model, self.temperature)
            .await
        {
            Ok(reply) => {
                let mut message = self.messages[index].clone();
                message.content = reply.message.content;
                message.model = Some(model.to_string());
                message.regenerated = true;
                message.is_error = false;
                self.replace(index, message);
            }
            Err(e) => {
                warn!("Failed to regenerate message {}: {}", message_id, e);
                self.error = Some(e.to_string());
            }
        }

        self.end();
        Ok(())
    }

    /// Rewrites `message_id`, dropping every message after it, and appends the
    /// backend's fresh answer when there is one.
    pub async fn edit(&mut self, message_id: &str, new_content: &str, model: &str) -> PalaverResult<()> {
        let Some(conversation_id) = self.conversation_id.clone() else {
            return Ok(());
        };
        let index = self.position(message_id)?;
        self.begin(false)?;

        self.messages.truncate(index + 1);
        emit(&self.events, ChatEvent::Truncated { len: index + 1 });

        let mut edited = self.messages[index].clone();
        edited.content = new_content.to_string();
        edited.edited = true;
        self.replace(index, edited);

        self.set_phase(SendPhase::Completing);
        match self
            .backend
            .edit_message(&conversation_id, message_id, new_content, model, self.temperature)
            .await
        {
            Ok(reply) => {
                if let Some(response) = reply.new_response {
                    let mut message = Message::assistant(response.content);
                    message.id = response.id;
                    message.model = Some(model.to_string());
                    self.push(message);
                }
            }
            Err(e) => {
                warn!("Failed to edit message {}: {}", message_id, e);
                self.error = Some(e.to_string());
                let mut message = Message::assistant(SEND_ERROR_MESSAGE);
                message.is_error = true;
                self.push(message);
            }
        }

        self.end();
        Ok(())
    }

    /// Stops the active stream, keeping what has arrived.
    pub fn cancel(&self) -> bool {
        self.control.cancel()
    }

    /// Forgets the conversation. Never touches the backend.
    pub fn clear(&mut self) {
        self.control.finish();
        self.reset();
        self.set_phase(SendPhase::Idle);
    }

    /// Replaces the local list with the backend's record of conversation `id`.
    /// On failure the current state is kept and the error recorded.
    pub async fn load_conversation(&mut self, id: &str) -> PalaverResult<()> {
        self.begin(false)?;
        self.set_phase(SendPhase::Completing);

        match self.backend.get_conversation(id).await {
            Ok(conversation) => {
                self.messages = conversation.messages;
                self.conversation_id = Some(id.to_string());
                emit(
                    &self.events,
                    ChatEvent::Loaded {
                        conversation_id: id.to_string(),
                        count: self.messages.len(),
                    },
                );
                debug!("Loaded conversation {} ({} messages)", id, self.messages.len());
            }
            Err(e) => {
                warn!("Failed to load conversation {}: {}", id, e);
                self.error = Some(e.to_string());
            }
        }

        self.end();
        Ok(())
    }

    /// Records the user's reaction locally; the backend call belongs to the caller.
    pub fn set_reaction(&mut self, message_id: &str, reaction: &str) -> PalaverResult<()> {
        let index = self.position(message_id)?;
        let mut message = self.messages[index].clone();
        message.user_reaction = Some(reaction.to_string());
        self.replace(index, message);
        Ok(())
    }

    fn begin(&mut self, cancellable: bool) -> PalaverResult<()> {
        if self.phase != SendPhase::Idle {
            return Err(PalaverError::Busy);
        }
        self.control.begin(cancellable);
        self.error = None;
        self.set_phase(SendPhase::Sending);
        Ok(())
    }

    fn end(&mut self) {
        if self.control.finish() {
            self.reset();
        }
        self.set_phase(SendPhase::Idle);
    }

    fn reset(&mut self) {
        self.messages.clear();
        self.conversation_id = None;
        self.error = None;
        emit(&self.events, ChatEvent::Reset);
    }

    fn position(&self, message_id: &str) -> PalaverResult<usize> {
        self.messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or_else(|| PalaverError::MessageNotFound {
                id: message_id.to_string(),
            })
    }

    fn push(&mut self, message: Message) {
        emit(&self.events, ChatEvent::Appended(message.clone()));
        self.messages.push(message);
    }

    fn replace(&mut self, index: usize, message: Message) {
        emit(&self.events, ChatEvent::Replaced(message.clone()));
        self.messages[index] = message;
    }

    fn set_phase(&mut self, phase: SendPhase) {
        if self.phase != phase {
            self.phase = phase;
            emit(&self.events, ChatEvent::Phase(phase));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{
        Conversation, ConversationSummary, EditReply, Export, ExportFormat, ModelInfo,
        NewResponse, RegenerateReply, RegeneratedContent, ReplyMessage, Role,
    };
    use crate::stream::StreamHandle;
    use async_trait::async_trait;
    use futures::channel::mpsc::{unbounded, UnboundedSender};
    use std::collections::VecDeque;

    /// Scripted backend: every call pops the next queued answer.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub streams: Mutex<VecDeque<PalaverResult<StreamHandle>>>,
        pub replies: Mutex<VecDeque<PalaverResult<SendReply>>>,
        pub regenerations: Mutex<VecDeque<PalaverResult<RegenerateReply>>>,
        pub edits: Mutex<VecDeque<PalaverResult<EditReply>>>,
        pub conversations: Mutex<VecDeque<PalaverResult<Conversation>>>,
        pub lists: Mutex<VecDeque<PalaverResult<Vec<ConversationSummary>>>>,
        pub models: Mutex<VecDeque<PalaverResult<Vec<ModelInfo>>>>,
        pub acks: Mutex<VecDeque<PalaverResult<()>>>,
        pub requests: Mutex<Vec<ChatRequest>>,
        pub calls: Mutex<Vec<String>>,
    }

    fn next<T>(queue: &Mutex<VecDeque<PalaverResult<T>>>) -> PalaverResult<T> {
        queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PalaverError::backend_error("no scripted response")))
    }

    impl FakeBackend {
        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatBackend for FakeBackend {
        async fn send_message(&self, request: &ChatRequest) -> PalaverResult<SendReply> {
            self.record("send_message");
            self.requests.lock().unwrap().push(request.clone());
            next(&self.replies)
        }

        async fn open_stream(&self, request: &ChatRequest) -> PalaverResult<StreamHandle> {
            self.record("open_stream");
            self.requests.lock().unwrap().push(request.clone());
            next(&self.streams)
        }

        async fn regenerate_message(
            &self,
            _conversation_id: &str,
            _message_id: &str,
            _model: &str,
            _temperature: f32,
        ) -> PalaverResult<RegenerateReply> {
            self.record("regenerate_message");
            next(&self.regenerations)
        }

        async fn edit_message(
            &self,
            _conversation_id: &str,
            _message_id: &str,
            _content: &str,
            _model: &str,
            _temperature: f32,
        ) -> PalaverResult<EditReply> {
            self.record("edit_message");
            next(&self.edits)
        }

        async fn add_reaction(&self, _: &str, _: &str, _: &str) -> PalaverResult<()> {
            self.record("add_reaction");
            next(&self.acks)
        }

        async fn list_conversations(&self) -> PalaverResult<Vec<ConversationSummary>> {
            self.record("list_conversations");
            next(&self.lists)
        }

        async fn get_conversation(&self, _id: &str) -> PalaverResult<Conversation> {
            self.record("get_conversation");
            next(&self.conversations)
        }

        async fn delete_conversation(&self, _id: &str) -> PalaverResult<()> {
            self.record("delete_conversation");
            next(&self.acks)
        }

        async fn rename_conversation(&self, _id: &str, _title: &str) -> PalaverResult<()> {
            self.record("rename_conversation");
            next(&self.acks)
        }

        async fn search_conversations(&self, _query: &str) -> PalaverResult<Vec<ConversationSummary>> {
            self.record("search_conversations");
            next(&self.lists)
        }

        async fn export_conversation(&self, id: &str, format: ExportFormat) -> PalaverResult<Export> {
            self.record("export_conversation");
            Ok(Export::DownloadUrl(format!("fake://{}.{}", id, format.as_str())))
        }

        async fn get_models(&self) -> PalaverResult<Vec<ModelInfo>> {
            self.record("get_models");
            next(&self.models)
        }
    }

    pub(crate) fn frame(json: &str) -> PalaverResult<Vec<u8>> {
        Ok(format!("data: {}\n\n", json).into_bytes())
    }

    fn live_stream() -> (UnboundedSender<PalaverResult<Vec<u8>>>, StreamHandle) {
        let (tx, rx) = unbounded();
        (tx, StreamHandle::new(rx))
    }

    fn closed_stream(frames: &[&str]) -> StreamHandle {
        let items: Vec<_> = frames.iter().map(|f| frame(f)).collect();
        StreamHandle::new(futures::stream::iter(items))
    }

    pub(crate) fn reply(conversation_id: &str, id: &str, content: &str) -> SendReply {
        SendReply {
            conversation_id: conversation_id.to_string(),
            message: ReplyMessage {
                id: id.to_string(),
                content: content.to_string(),
                timestamp: None,
                model: Some("gpt-4".to_string()),
                image: None,
            },
        }
    }

    fn stored(id: &str, role: Role, content: &str) -> Message {
        let mut message = match role {
            Role::User => Message::user(content),
            Role::Assistant => Message::assistant(content),
        };
        message.id = id.to_string();
        message
    }

    fn four_message_conversation() -> Conversation {
        Conversation {
            id: "c1".to_string(),
            title: Some("Greetings".to_string()),
            messages: vec![
                stored("m1", Role::User, "hello"),
                stored("m2", Role::Assistant, "hi"),
                stored("m3", Role::User, "how are you"),
                stored("m4", Role::Assistant, "fine"),
            ],
            created_at: None,
        }
    }

    async fn wait_for_content(events: &mut mpsc::UnboundedReceiver<ChatEvent>) -> String {
        while let Some(event) = events.recv().await {
            if let ChatEvent::ContentUpdated { content, .. } = event {
                return content;
            }
        }
        panic!("event channel closed before any content arrived");
    }

    #[tokio::test]
    async fn test_streaming_send_adopts_server_ids() {
        let backend = FakeBackend::default();
        backend.streams.lock().unwrap().push_back(Ok(closed_stream(&[
            r#"{"content":"Hi"}"#,
            r#"{"content":"Hi there"}"#,
            r#"{"done":true,"conversationId":"c1","messageId":"m1"}"#,
        ])));
        let mut state = ChatState::new(Arc::new(backend));

        state.send("hello", "gpt-4", true).await.unwrap();

        let messages = state.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].content, "Hi there");
        assert_eq!(messages[1].id, "m1");
        assert!(!messages[1].is_streaming);
        assert!(!messages[1].is_error);
        assert_eq!(state.conversation_id(), Some("c1"));
        assert_eq!(state.phase(), SendPhase::Idle);
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_freezes_content() {
        let (tx, handle) = live_stream();
        let backend = FakeBackend::default();
        backend.streams.lock().unwrap().push_back(Ok(handle));
        let mut state = ChatState::new(Arc::new(backend));
        let mut events = state.subscribe();
        let control = state.control();

        let driver = async {
            tx.unbounded_send(frame(r#"{"content":"Hi"}"#)).unwrap();
            assert_eq!(wait_for_content(&mut events).await, "Hi");
            assert!(control.cancel());
            let _ = tx.unbounded_send(frame(r#"{"content":"Hi there"}"#));
            let _ = tx.unbounded_send(frame(
                r#"{"done":true,"conversationId":"c1","messageId":"m1"}"#,
            ));
        };
        let (result, _) = tokio::join!(state.send("hello", "gpt-4", true), driver);
        result.unwrap();

        let assistant = &state.messages()[1];
        assert_eq!(assistant.content, "Hi");
        assert!(!assistant.is_streaming);
        assert!(assistant.is_cancelled);
        assert!(!assistant.is_error);
        assert_eq!(state.conversation_id(), None);
        assert_eq!(state.error(), None);

        let mut late_updates = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ChatEvent::ContentUpdated { .. }) {
                late_updates += 1;
            }
        }
        assert_eq!(late_updates, 0);
    }

    #[tokio::test]
    async fn test_clear_mid_stream_resets_everything() {
        let (tx, handle) = live_stream();
        let backend = FakeBackend::default();
        backend.replies.lock().unwrap().push_back(Ok(reply("c0", "a0", "earlier")));
        backend.streams.lock().unwrap().push_back(Ok(handle));
        let mut state = ChatState::new(Arc::new(backend));

        state.send("first", "gpt-4", false).await.unwrap();
        assert_eq!(state.conversation_id(), Some("c0"));

        let mut events = state.subscribe();
        let control = state.control();
        let driver = async {
            tx.unbounded_send(frame(r#"{"content":"partial"}"#)).unwrap();
            wait_for_content(&mut events).await;
            assert!(control.clear());
            let _ = tx.unbounded_send(frame(r#"{"content":"more"}"#));
        };
        let (result, _) = tokio::join!(state.send("second", "gpt-4", true), driver);
        result.unwrap();

        assert!(state.messages().is_empty());
        assert_eq!(state.conversation_id(), None);
        assert_eq!(state.phase(), SendPhase::Idle);

        state.clear();
        assert!(state.messages().is_empty());
        assert_eq!(state.conversation_id(), None);
    }

    #[test]
    fn test_control_cancel_before_attach() {
        let control = ChatControl::default();
        assert!(!control.cancel());
        assert!(!control.is_active());

        control.begin(true);
        assert!(control.is_active());
        assert!(control.cancel());

        let token = CancellationToken::new();
        control.attach(token.clone());
        assert!(token.is_cancelled());
        assert!(!control.finish());
        assert!(!control.is_active());
    }

    #[test]
    fn test_control_clear_is_reported_once() {
        let control = ChatControl::default();
        control.begin(true);
        assert!(control.clear());
        assert!(control.finish());
        assert!(!control.finish());
    }

    #[test]
    fn test_control_cannot_cancel_non_stream_request() {
        let control = ChatControl::default();
        control.begin(false);
        assert!(!control.cancel());

        let token = CancellationToken::new();
        control.attach(token.clone());
        assert!(!token.is_cancelled());

        assert!(control.clear());
        assert!(control.finish());
    }

    #[tokio::test]
    async fn test_control_clear_while_idle_keeps_history() {
        let backend = Arc::new(FakeBackend::default());
        {
            let mut replies = backend.replies.lock().unwrap();
            replies.push_back(Ok(reply("c1", "a1", "one")));
            replies.push_back(Ok(reply("c1", "a2", "two")));
        }
        let mut state = ChatState::new(backend.clone());
        state.send("first", "gpt-4", false).await.unwrap();

        assert!(!state.control().clear());
        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.conversation_id(), Some("c1"));

        state.send("second", "gpt-4", false).await.unwrap();

        let contents: Vec<_> = state.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "one", "second", "two"]);
        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[1].conversation_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_sequential_sends_do_not_interleave() {
        let backend = Arc::new(FakeBackend::default());
        {
            let mut replies = backend.replies.lock().unwrap();
            replies.push_back(Ok(reply("c1", "a1", "one")));
            replies.push_back(Ok(reply("c1", "a2", "two")));
        }
        let mut state = ChatState::new(backend.clone());

        state.send("first", "gpt-4", false).await.unwrap();
        assert_eq!(state.phase(), SendPhase::Idle);
        assert_eq!(state.messages().len(), 2);

        state.send("second", "gpt-4", false).await.unwrap();

        let contents: Vec<_> = state.messages().iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "one", "second", "two"]);
        assert_eq!(state.messages()[3].id, "a2");

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[0].conversation_id, None);
        assert_eq!(requests[1].conversation_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_failed_send_shows_error_message() {
        let backend = FakeBackend::default();
        backend
            .replies
            .lock()
            .unwrap()
            .push_back(Err(PalaverError::network_error(Some(500), "boom")));
        let mut state = ChatState::new(Arc::new(backend));

        state.send("hello", "gpt-4", false).await.unwrap();

        let assistant = &state.messages()[1];
        assert_eq!(assistant.content, SEND_ERROR_MESSAGE);
        assert!(assistant.is_error);
        assert!(!assistant.is_streaming);
        assert!(state.error().is_some());
        assert_eq!(state.phase(), SendPhase::Idle);
    }

    #[tokio::test]
    async fn test_failed_stream_open_shows_error_message() {
        let backend = FakeBackend::default();
        backend
            .streams
            .lock()
            .unwrap()
            .push_back(Err(PalaverError::network_error(Some(502), "bad gateway")));
        let mut state = ChatState::new(Arc::new(backend));

        state.send("hello", "gpt-4", true).await.unwrap();

        let assistant = &state.messages()[1];
        assert_eq!(assistant.content, SEND_ERROR_MESSAGE);
        assert!(assistant.is_error);
        assert!(!assistant.is_cancelled);
    }

    #[tokio::test]
    async fn test_blank_input_is_ignored() {
        let backend = Arc::new(FakeBackend::default());
        let mut state = ChatState::new(backend.clone());
        state.send("   ", "gpt-4", true).await.unwrap();
        assert!(state.messages().is_empty());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_edit_truncates_and_appends_new_response() {
        let backend = FakeBackend::default();
        backend
            .conversations
            .lock()
            .unwrap()
            .push_back(Ok(four_message_conversation()));
        backend.edits.lock().unwrap().push_back(Ok(EditReply {
            new_response: Some(NewResponse {
                id: "m5".to_string(),
                content: "a fresh answer".to_string(),
            }),
        }));
        let mut state = ChatState::new(Arc::new(backend));
        state.load_conversation("c1").await.unwrap();
        assert_eq!(state.messages().len(), 4);

        state.edit("m2", "new text", "gpt-4").await.unwrap();

        let messages = state.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].id, "m1");
        assert_eq!(messages[1].content, "new text");
        assert!(messages[1].edited);
        assert_eq!(messages[2].id, "m5");
        assert_eq!(messages[2].role, Role::Assistant);
        assert_eq!(messages[2].content, "a fresh answer");
    }

    #[tokio::test]
    async fn test_edit_without_new_response_ends_at_edited_message() {
        let backend = FakeBackend::default();
        backend
            .conversations
            .lock()
            .unwrap()
            .push_back(Ok(four_message_conversation()));
        backend.edits.lock().unwrap().push_back(Ok(EditReply::default()));
        let mut state = ChatState::new(Arc::new(backend));
        state.load_conversation("c1").await.unwrap();

        state.edit("m2", "new text", "gpt-4").await.unwrap();

        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.messages()[1].content, "new text");
        assert!(state.messages()[1].edited);
    }

    #[tokio::test]
    async fn test_edit_requires_conversation() {
        let backend = Arc::new(FakeBackend::default());
        let mut state = ChatState::new(backend.clone());
        state.edit("m2", "new text", "gpt-4").await.unwrap();
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_regenerate_replaces_in_place() {
        let backend = Arc::new(FakeBackend::default());
        backend
            .conversations
            .lock()
            .unwrap()
            .push_back(Ok(four_message_conversation()));
        backend.regenerations.lock().unwrap().push_back(Ok(RegenerateReply {
            message: RegeneratedContent {
                content: "better".to_string(),
            },
        }));
        let mut state = ChatState::new(backend.clone());
        state.load_conversation("c1").await.unwrap();

        state.regenerate("m2", "gpt-4").await.unwrap();

        let ids: Vec<_> = state.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3", "m4"]);
        assert_eq!(state.messages()[1].content, "better");
        assert!(state.messages()[1].regenerated);
        assert_eq!(state.messages()[3].content, "fine");
    }

    #[tokio::test]
    async fn test_regenerate_without_conversation_is_noop() {
        let backend = Arc::new(FakeBackend::default());
        let mut state = ChatState::new(backend.clone());
        state.regenerate("m2", "gpt-4").await.unwrap();
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_regenerate_failure_keeps_messages() {
        let backend = Arc::new(FakeBackend::default());
        backend
            .conversations
            .lock()
            .unwrap()
            .push_back(Ok(four_message_conversation()));
        backend
            .regenerations
            .lock()
            .unwrap()
            .push_back(Err(PalaverError::network_error(None, "offline")));
        let mut state = ChatState::new(backend.clone());
        state.load_conversation("c1").await.unwrap();

        state.regenerate("m2", "gpt-4").await.unwrap();

        assert_eq!(state.messages()[1].content, "hi");
        assert!(!state.messages()[1].regenerated);
        assert!(state.error().is_some());
    }

    #[tokio::test]
    async fn test_unknown_message_is_reported() {
        let backend = Arc::new(FakeBackend::default());
        backend
            .conversations
            .lock()
            .unwrap()
            .push_back(Ok(four_message_conversation()));
        let mut state = ChatState::new(backend.clone());
        state.load_conversation("c1").await.unwrap();

        let err = state.regenerate("missing", "gpt-4").await.unwrap_err();
        assert!(matches!(err, PalaverError::MessageNotFound { .. }));
        assert_eq!(state.phase(), SendPhase::Idle);
    }

    #[tokio::test]
    async fn test_failed_load_leaves_state_untouched() {
        let backend = FakeBackend::default();
        backend.replies.lock().unwrap().push_back(Ok(reply("c1", "a1", "one")));
        backend
            .conversations
            .lock()
            .unwrap()
            .push_back(Err(PalaverError::network_error(Some(404), "not found")));
        let mut state = ChatState::new(Arc::new(backend));
        state.send("first", "gpt-4", false).await.unwrap();

        state.load_conversation("c2").await.unwrap();

        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.conversation_id(), Some("c1"));
        assert!(state.error().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_set_reaction() {
        let backend = FakeBackend::default();
        backend
            .conversations
            .lock()
            .unwrap()
            .push_back(Ok(four_message_conversation()));
        let mut state = ChatState::new(Arc::new(backend));
        state.load_conversation("c1").await.unwrap();

        state.set_reaction("m2", "like").unwrap();
        assert_eq!(state.messages()[1].user_reaction.as_deref(), Some("like"));
    }
}
