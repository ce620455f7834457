use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ChatError;

/// Server-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        MessageId(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        ConversationId(s.to_string())
    }
}

/// Identifier of a locally shown message that the store has not acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientTempId(Uuid);

impl ClientTempId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientTempId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ClientTempId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "local:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Participant {
    EndUser,
    AutomatedResponder,
    HumanAgent,
}

impl Participant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Participant::EndUser => "end-user",
            Participant::AutomatedResponder => "automated-responder",
            Participant::HumanAgent => "human-agent",
        }
    }
}

impl std::fmt::Display for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message the store has acknowledged. Identity is by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub participant: Participant,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Stored message as it travels over REST and the realtime channel.
///
/// `user_id` is the author; the participant kind is resolved against a
/// [`Roster`] once the record crosses into the crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Body of a store insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub conversation_id: String,
    pub user_id: String,
    pub message: String,
}

/// Who is who in one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    pub conversation_id: ConversationId,
    pub owner_id: String,
    pub responder_id: String,
}

impl Roster {
    pub fn new(
        conversation_id: ConversationId,
        owner_id: impl Into<String>,
        responder_id: impl Into<String>,
    ) -> Self {
        Self { conversation_id, owner_id: owner_id.into(), responder_id: responder_id.into() }
    }

    pub fn classify(&self, author_id: &str) -> Participant {
        if author_id == self.responder_id {
            Participant::AutomatedResponder
        } else if author_id == self.owner_id {
            Participant::EndUser
        } else {
            Participant::HumanAgent
        }
    }

    /// Validates a wire record and lifts it into a [`Message`].
    pub fn resolve(&self, record: MessageRecord) -> Result<Message, ChatError> {
        if record.id.trim().is_empty() {
            return Err(ChatError::malformed("record has an empty id"));
        }
        if record.user_id.trim().is_empty() {
            return Err(ChatError::malformed(format!("record {} has no author", record.id)));
        }
        if record.conversation_id != self.conversation_id.0 {
            return Err(ChatError::malformed(format!(
                "record {} belongs to conversation '{}', expected '{}'",
                record.id, record.conversation_id, self.conversation_id
            )));
        }
        Ok(Message {
            participant: self.classify(&record.user_id),
            id: MessageId(record.id),
            conversation_id: ConversationId(record.conversation_id),
            body: record.message,
            created_at: record.created_at,
        })
    }

    pub fn new_message(&self, author_id: &str, body: &str) -> NewMessage {
        NewMessage {
            conversation_id: self.conversation_id.0.clone(),
            user_id: author_id.to_string(),
            message: body.to_string(),
        }
    }
}

/// Key of an entry in the rendered view.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryKey {
    Pending(ClientTempId),
    Confirmed(MessageId),
}

impl std::fmt::Display for EntryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKey::Pending(temp) => write!(f, "{temp}"),
            EntryKey::Confirmed(id) => write!(f, "{id}"),
        }
    }
}

/// One row of the rendered conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewEntry {
    pub key: EntryKey,
    pub participant: Participant,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl ViewEntry {
    pub fn is_pending(&self) -> bool {
        matches!(self.key, EntryKey::Pending(_))
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        match &self.key {
            EntryKey::Confirmed(id) => Some(id),
            EntryKey::Pending(_) => None,
        }
    }
}

impl From<&Message> for ViewEntry {
    fn from(m: &Message) -> Self {
        Self {
            key: EntryKey::Confirmed(m.id.clone()),
            participant: m.participant,
            body: m.body.clone(),
            created_at: m.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PushKind {
    Insert,
    Update,
}

/// A change notification delivered by the realtime channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub kind: PushKind,
    pub record: MessageRecord,
}

/// `{ "success": .., "data": .., "error": .. }` envelope used by the chat API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    #[serde(default)]
    pub success: bool,
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessage {
    pub message: String,
}
