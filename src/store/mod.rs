pub mod http_store;
pub mod memory_store;

use async_trait::async_trait;

use crate::errors::ChatError;
use crate::models::{ConversationId, MessageId, MessageRecord, NewMessage};

pub use http_store::HttpMessageStore;
pub use memory_store::InMemoryStore;

/// The external message store, as far as the chat views depend on it.
///
/// Reads fail with [`ChatError::ServiceUnavailable`]; writes fail with
/// [`ChatError::WriteFailed`].
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn health_check(&self) -> Result<(), ChatError>;

    /// All messages of a conversation, oldest first. Empty if there are none.
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageRecord>, ChatError>;

    /// Stores a message and returns it with its server-assigned id and timestamp.
    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRecord, ChatError>;

    async fn update_message(&self, id: &MessageId, body: &str)
        -> Result<MessageRecord, ChatError>;
}
