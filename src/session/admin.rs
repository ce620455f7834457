use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::info;

use crate::errors::ChatError;
use crate::models::{ConversationId, Message, MessageId, Roster};
use crate::reconciler::Reconciler;

use super::{ChatBackend, ChatSession, SessionConfig, SessionEvent, ViewHandle, Viewer};

/// Human-agent view over one conversation at a time.
pub struct AdminConsole {
    backend: ChatBackend,
    agent_id: String,
    config: SessionConfig,
    reconciler: Arc<Mutex<Reconciler>>,
    active: Option<ChatSession>,
}

impl AdminConsole {
    pub fn new(backend: ChatBackend, agent_id: impl Into<String>, config: SessionConfig) -> Self {
        let reconciler = Arc::new(Mutex::new(Reconciler::new(backend.service.responder().clone())));
        Self { backend, agent_id: agent_id.into(), config, reconciler, active: None }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Closes the current conversation, if any, and opens `conversation_id`.
    ///
    /// The previous session's subscription and pending work are released
    /// before the new one subscribes. On failure no conversation is open.
    pub async fn select_conversation(
        &mut self,
        conversation_id: ConversationId,
        owner_id: &str,
    ) -> Result<mpsc::UnboundedReceiver<SessionEvent>, ChatError> {
        self.close_active().await;

        let roster =
            Roster::new(conversation_id, owner_id, self.backend.service.responder().id());
        let viewer = Viewer::HumanAgent { agent_id: self.agent_id.clone() };
        let (session, events) =
            ChatSession::open(&self.backend, self.reconciler.clone(), roster, viewer, self.config)
                .await?;
        info!(agent = %self.agent_id, conversation = %session.conversation_id(), "agent joined conversation");
        self.active = Some(session);
        Ok(events)
    }

    pub fn active(&self) -> Option<&ChatSession> {
        self.active.as_ref()
    }

    pub fn view(&self) -> Option<ViewHandle> {
        self.active.as_ref().map(ChatSession::view)
    }

    fn session(&self) -> Result<&ChatSession, ChatError> {
        self.active.as_ref().ok_or(ChatError::NoActiveConversation)
    }

    pub async fn send(&self, text: &str) -> Result<Message, ChatError> {
        self.session()?.send_message(text).await
    }

    pub async fn edit_message(&self, id: &MessageId, text: &str) -> Result<Message, ChatError> {
        self.session()?.edit_message(id, text).await
    }

    pub async fn refresh(&self) -> Result<(), ChatError> {
        self.session()?.refresh().await
    }

    /// Leaves the current conversation and forgets its view state.
    pub async fn close_active(&mut self) {
        if let Some(session) = self.active.take() {
            let cid = session.conversation_id().clone();
            session.close().await;
            self.reconciler.lock().unwrap_or_else(|p| p.into_inner()).discard(&cid);
        }
    }

    pub async fn close(mut self) {
        self.close_active().await;
    }
}
