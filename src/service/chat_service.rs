use std::sync::Arc;

use tracing::{error, info, warn};

use crate::errors::ChatError;
use crate::models::{Message, MessageId, MessageRecord, Roster};
use crate::responder::Responder;
use crate::store::MessageStore;

const MAX_MESSAGE_LENGTH: usize = 8000;

/// Result of loading a conversation for display.
#[derive(Debug, Clone)]
pub struct InitialLoad {
    pub history: Vec<Message>,
    /// The conversation was empty and the welcome could not be stored.
    pub welcome_pending: bool,
}

/// Request/response operations against the message store for one roster.
#[derive(Clone)]
pub struct ChatService {
    store: Arc<dyn MessageStore>,
    responder: Responder,
}

impl ChatService {
    pub fn new(store: Arc<dyn MessageStore>, responder: Responder) -> Self {
        Self { store, responder }
    }

    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    /// Trims and checks a message body before anything is shown or written.
    pub fn validate(&self, text: &str) -> Result<String, ChatError> {
        let body = text.trim();
        if body.is_empty() {
            return Err(ChatError::EmptyField { field_name: "message".to_string() });
        }
        if body.len() > MAX_MESSAGE_LENGTH {
            return Err(ChatError::FieldTooLong {
                field_name: "message".to_string(),
                max_length: MAX_MESSAGE_LENGTH,
                actual_length: body.len(),
            });
        }
        Ok(body.to_string())
    }

    /// Health check plus full history. Never writes.
    pub async fn load_history(&self, roster: &Roster) -> Result<Vec<Message>, ChatError> {
        self.store.health_check().await.map_err(|e| {
            error!(conversation = %roster.conversation_id, "chat service health check failed: {e}");
            ChatError::unavailable("Please try again later.")
        })?;
        self.fetch(roster).await
    }

    /// [`load_history`](Self::load_history) for the conversation owner. An
    /// empty conversation gets the responder's welcome, stored once; later
    /// loads find it in the history.
    pub async fn load_initial(&self, roster: &Roster) -> Result<InitialLoad, ChatError> {
        let history = self.load_history(roster).await?;
        if !history.is_empty() {
            return Ok(InitialLoad { history, welcome_pending: false });
        }

        let welcome = roster.new_message(self.responder.id(), self.responder.welcome_text());
        match self.store.insert_message(&welcome).await {
            Ok(record) => {
                info!(conversation = %roster.conversation_id, "welcome message stored");
                let welcome = roster.resolve(record)?;
                Ok(InitialLoad { history: vec![welcome], welcome_pending: false })
            }
            Err(e) => {
                warn!(conversation = %roster.conversation_id, "failed to store welcome message: {e}");
                Ok(InitialLoad { history: Vec::new(), welcome_pending: true })
            }
        }
    }

    /// Current history; malformed records are logged and skipped.
    pub async fn fetch(&self, roster: &Roster) -> Result<Vec<Message>, ChatError> {
        let records = self.store.fetch_messages(&roster.conversation_id).await?;
        Ok(resolve_all(roster, records))
    }

    /// Stores a message authored by `author_id`. `body` must already be validated.
    pub async fn send(
        &self,
        roster: &Roster,
        author_id: &str,
        body: &str,
    ) -> Result<Message, ChatError> {
        let record = self.store.insert_message(&roster.new_message(author_id, body)).await?;
        roster
            .resolve(record)
            .map_err(|e| ChatError::write_failed(format!("store returned an invalid message: {e}")))
    }

    pub async fn edit(
        &self,
        roster: &Roster,
        id: &MessageId,
        text: &str,
    ) -> Result<Message, ChatError> {
        let body = self.validate(text)?;
        let record = self.store.update_message(id, &body).await?;
        roster
            .resolve(record)
            .map_err(|e| ChatError::write_failed(format!("store returned an invalid message: {e}")))
    }
}

fn resolve_all(roster: &Roster, records: Vec<MessageRecord>) -> Vec<Message> {
    records
        .into_iter()
        .filter_map(|record| {
            let id = record.id.clone();
            roster
                .resolve(record)
                .map_err(|e| warn!(id = %id, "skipping stored message: {e}"))
                .ok()
        })
        .collect()
}
