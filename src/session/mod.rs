//! Conversation view state and the send/regenerate pipeline.
//!
//! A [`ChatSession`] owns the in-memory message list of one conversation and
//! runs at most one turn at a time. Each turn opens a chat stream through a
//! [`ChatBackend`], folds decoded increments into a fresh assistant message,
//! and persists that message once after the stream ends.

mod gate;
mod message;

pub use gate::SessionHandle;
pub use message::{ChatMessage, SendOptions, SessionEvent, TurnSummary};

use std::sync::Arc;
use std::time::Instant;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::client::ChatBackend;
use crate::error::ChatError;
use crate::observability::log_turn_complete;
use crate::storage::{MessageStore, NewMessage};
use crate::stream::{decode_stream, DecoderLimits, FinalMessage, StreamItem};
use crate::util::{conversation_title, DEFAULT_TITLE};
use crate::wire::{ApiMessage, ChatRequest, Role};

use gate::TurnGuard;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
struct LastRequest {
    message: String,
    options: SendOptions,
}

struct SessionState {
    conversation_id: Option<Uuid>,
    title: String,
    messages: Vec<ChatMessage>,
    last_request: Option<LastRequest>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            conversation_id: None,
            title: DEFAULT_TITLE.to_string(),
            messages: Vec::new(),
            last_request: None,
        }
    }

    fn message_mut(&mut self, id: Uuid) -> Option<&mut ChatMessage> {
        self.messages.iter_mut().rev().find(|message| message.id == id)
    }

    fn remove_message(&mut self, id: Uuid) -> bool {
        match self.messages.iter().rposition(|message| message.id == id) {
            Some(idx) => {
                self.messages.remove(idx);
                true
            }
            None => false,
        }
    }

    /// History sent upstream: every non-empty message in order.
    fn history(&self) -> Vec<ApiMessage> {
        self.messages
            .iter()
            .filter(|message| !message.content.is_empty())
            .map(|message| ApiMessage::new(message.role, message.content.clone()))
            .collect()
    }
}

/// One conversation view backed by a store and a chat backend.
pub struct ChatSession<S, B> {
    store: Arc<S>,
    backend: Arc<B>,
    limits: DecoderLimits,
    model: Option<String>,
    handle: SessionHandle,
    events: broadcast::Sender<SessionEvent>,
    state: Mutex<SessionState>,
}

impl<S, B> ChatSession<S, B>
where
    S: MessageStore,
    B: ChatBackend,
{
    #[must_use]
    pub fn new(store: Arc<S>, backend: Arc<B>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            backend,
            limits: DecoderLimits::default(),
            model: None,
            handle: SessionHandle::new(),
            events,
            state: Mutex::new(SessionState::new()),
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: DecoderLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Model name forwarded in each request. The proxy may ignore it.
    #[must_use]
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.handle.is_loading()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state.lock().messages.clone()
    }

    #[must_use]
    pub fn title(&self) -> String {
        self.state.lock().title.clone()
    }

    #[must_use]
    pub fn conversation_id(&self) -> Option<Uuid> {
        self.state.lock().conversation_id
    }

    fn emit(&self, event: SessionEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    /// Create a new persisted conversation and make it the current one.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::Busy` while a turn is running, or the store error.
    pub async fn start_conversation(&self) -> Result<Uuid, ChatError> {
        let _guard = self.handle.try_begin()?;
        let conversation = self.store.create_conversation(DEFAULT_TITLE).await?;
        {
            let mut state = self.state.lock();
            *state = SessionState::new();
            state.conversation_id = Some(conversation.id);
            state.title.clone_from(&conversation.title);
        }
        self.emit(SessionEvent::TitleChanged(conversation.title));
        Ok(conversation.id)
    }

    /// Replace the session contents with a stored conversation.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::NotFound` for an unknown id, `ChatError::Busy`
    /// while a turn is running, or the store error.
    pub async fn load(&self, conversation_id: Uuid) -> Result<(), ChatError> {
        let _guard = self.handle.try_begin()?;
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {conversation_id}")))?;
        let mut stored = self.store.list_messages(conversation_id).await?;
        stored.sort_by_key(|message| message.created_at);

        {
            let mut state = self.state.lock();
            *state = SessionState::new();
            state.conversation_id = Some(conversation.id);
            state.title.clone_from(&conversation.title);
            state.messages = stored.into_iter().map(ChatMessage::from).collect();
        }
        tracing::debug!(%conversation_id, "conversation loaded");
        self.emit(SessionEvent::TitleChanged(conversation.title));
        Ok(())
    }

    /// Send a user message and stream the assistant reply.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::InvalidRequest` for a blank message,
    /// `ChatError::Busy` while another turn runs, and the transport, decode,
    /// cancellation or store error that ended the turn.
    pub async fn send(&self, message: &str, options: SendOptions) -> Result<TurnSummary, ChatError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ChatError::InvalidRequest("Message is empty".to_string()));
        }
        let guard = self.handle.try_begin()?;

        let user_message = ChatMessage::user(message);
        let (conversation_id, new_title) = {
            let mut state = self.state.lock();
            state.last_request = Some(LastRequest {
                message: message.to_string(),
                options,
            });
            let is_first = state.messages.is_empty();
            state.messages.push(user_message.clone());
            let new_title = is_first.then(|| {
                let title = conversation_title(message);
                state.title.clone_from(&title);
                title
            });
            (state.conversation_id, new_title)
        };
        self.emit(SessionEvent::MessageAdded(user_message));
        if let Some(title) = &new_title {
            self.emit(SessionEvent::TitleChanged(title.clone()));
        }

        if let Some(conversation_id) = conversation_id {
            if let Err(err) = self
                .persist_user_turn(conversation_id, message, new_title.as_deref())
                .await
            {
                return Err(self.fail_turn(None, err));
            }
        }

        self.run_turn(&guard, options).await
    }

    async fn persist_user_turn(
        &self,
        conversation_id: Uuid,
        message: &str,
        new_title: Option<&str>,
    ) -> Result<(), ChatError> {
        self.store
            .insert_message(NewMessage::new(conversation_id, Role::User, message))
            .await?;
        if let Some(title) = new_title {
            self.store.update_title(conversation_id, title).await?;
        }
        Ok(())
    }

    /// Re-run the assistant turn for the last sent message.
    ///
    /// When the last user message in the history is the recorded one, the
    /// replies after it are dropped from memory and from the store. Otherwise
    /// the recorded message is appended again. A new reply is then streamed
    /// with the recorded options.
    ///
    /// # Errors
    ///
    /// Returns `ChatError::NothingToRegenerate` when nothing was sent yet,
    /// `ChatError::Busy` while another turn runs, or the turn's error.
    pub async fn regenerate(&self) -> Result<TurnSummary, ChatError> {
        let Some(last) = self.state.lock().last_request.clone() else {
            return Err(ChatError::NothingToRegenerate);
        };
        let guard = self.handle.try_begin()?;

        let (conversation_id, removed, replayed) = {
            let mut state = self.state.lock();
            let anchor = state
                .messages
                .iter()
                .rposition(|message| message.role == Role::User)
                .filter(|idx| state.messages[*idx].content == last.message);
            let keep = anchor.map_or(state.messages.len(), |idx| idx + 1);
            let removed: Vec<Uuid> = state
                .messages
                .drain(keep..)
                .map(|message| message.id)
                .collect();
            let replayed = anchor.is_none().then(|| {
                let user_message = ChatMessage::user(last.message.clone());
                state.messages.push(user_message.clone());
                user_message
            });
            (state.conversation_id, removed, replayed)
        };
        for message_id in &removed {
            self.emit(SessionEvent::MessageRemoved {
                message_id: *message_id,
            });
        }
        if let Some(user_message) = &replayed {
            self.emit(SessionEvent::MessageAdded(user_message.clone()));
        }

        if let Some(conversation_id) = conversation_id {
            let cleaned = self
                .rewind_stored_turn(conversation_id, replayed.as_ref())
                .await;
            if let Err(err) = cleaned {
                return Err(self.fail_turn(None, err));
            }
        }

        tracing::debug!(
            removed = removed.len(),
            replayed = replayed.is_some(),
            message_chars = last.message.chars().count(),
            "regenerating reply"
        );
        self.run_turn(&guard, last.options).await
    }

    /// Delete the stored reply when it follows the last stored user message,
    /// or store the replayed user message when it was not in the history.
    async fn rewind_stored_turn(
        &self,
        conversation_id: Uuid,
        replayed: Option<&ChatMessage>,
    ) -> Result<(), ChatError> {
        if let Some(user_message) = replayed {
            self.store
                .insert_message(NewMessage::new(
                    conversation_id,
                    Role::User,
                    user_message.content.clone(),
                ))
                .await?;
            return Ok(());
        }

        let Some(reply) = self.store.latest_assistant_message(conversation_id).await? else {
            return Ok(());
        };
        let stored = self.store.list_messages(conversation_id).await?;
        let last_user = stored
            .iter()
            .rposition(|message| message.role == Role::User);
        let reply_pos = stored.iter().position(|message| message.id == reply.id);
        if reply_pos > last_user {
            self.store.delete_message(reply.id).await?;
        }
        Ok(())
    }

    async fn run_turn(
        &self,
        guard: &TurnGuard,
        options: SendOptions,
    ) -> Result<TurnSummary, ChatError> {
        let start = Instant::now();
        let (conversation_id, history) = {
            let state = self.state.lock();
            (state.conversation_id, state.history())
        };
        let request = ChatRequest {
            messages: history,
            model: self.model.clone(),
            search: options.search,
            think: options.think,
        };

        let token = guard.token();
        let opened = tokio::select! {
            biased;
            () = token.cancelled() => Err(ChatError::Cancelled),
            opened = self.backend.open_stream(&request) => opened,
        };
        let byte_stream = match opened {
            Ok(stream) => stream,
            Err(err) => return Err(self.fail_turn(None, err)),
        };

        let assistant = ChatMessage::assistant();
        let message_id = assistant.id;
        self.state.lock().messages.push(assistant.clone());
        self.emit(SessionEvent::MessageAdded(assistant));

        let mut decoded = decode_stream(byte_stream, self.limits);
        let mut increments = 0usize;
        let outcome: Result<FinalMessage, ChatError> = loop {
            let item = tokio::select! {
                biased;
                () = token.cancelled() => break Err(ChatError::Cancelled),
                item = decoded.next() => item,
            };
            match item {
                Some(Ok(StreamItem::Increment(increment))) => {
                    increments += 1;
                    if let Some(message) = self.state.lock().message_mut(message_id) {
                        message.apply(&increment);
                    }
                    self.emit(SessionEvent::Increment {
                        message_id,
                        increment,
                    });
                }
                Some(Ok(StreamItem::Done)) => {}
                Some(Ok(StreamItem::Finished(final_message))) => break Ok(final_message),
                Some(Err(err)) => break Err(err),
                None => {
                    break Err(ChatError::Transport(
                        "response stream ended unexpectedly".to_string(),
                    ))
                }
            }
        };
        drop(decoded);

        let final_message = match outcome {
            Ok(final_message) => final_message,
            Err(err) => return Err(self.fail_turn(Some(message_id), err)),
        };

        if let Some(message) = self.state.lock().message_mut(message_id) {
            message.content.clone_from(&final_message.content);
            message.thinking.clone_from(&final_message.reasoning);
        }

        let mut persisted = false;
        if let Some(conversation_id) = conversation_id {
            if !final_message.content.is_empty() {
                let stored = self
                    .store
                    .insert_message(NewMessage::new(
                        conversation_id,
                        Role::Assistant,
                        final_message.content.clone(),
                    ))
                    .await;
                if let Err(err) = stored {
                    return Err(self.fail_turn(Some(message_id), err));
                }
                persisted = true;
            }
        }

        self.emit(SessionEvent::TurnFinished { message_id });
        log_turn_complete(
            conversation_id,
            increments,
            &final_message.reasoning,
            &final_message.content,
            persisted,
            start,
        );

        Ok(TurnSummary {
            message_id,
            content: final_message.content,
            thinking: final_message.reasoning,
            increments,
            persisted,
            elapsed: start.elapsed(),
        })
    }

    fn fail_turn(&self, message_id: Option<Uuid>, err: ChatError) -> ChatError {
        if let Some(message_id) = message_id {
            if self.state.lock().remove_message(message_id) {
                self.emit(SessionEvent::MessageRemoved { message_id });
            }
        }
        match &err {
            ChatError::Cancelled => tracing::info!("chat turn cancelled"),
            other => tracing::warn!(error = %other, "chat turn failed"),
        }
        self.emit(SessionEvent::TurnFailed {
            message: err.user_message(),
        });
        err
    }
}
