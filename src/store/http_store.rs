use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::errors::ChatError;
use crate::models::{
    ApiResponse, ConversationId, EditMessage, HealthResponse, MessageId, MessageRecord, NewMessage,
};
use crate::store::MessageStore;

/// REST client for the chat API.
#[derive(Debug, Clone)]
pub struct HttpMessageStore {
    client: Client,
    base_url: String,
}

impl HttpMessageStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ChatError> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| ChatError::Config {
            key: "CHAT_REQUEST_TIMEOUT_SECS".to_string(),
            reason: format!("failed to build HTTP client: {e}"),
        })?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Reads an `ApiResponse<T>` body, turning HTTP and envelope errors into `fail`.
async fn read_envelope<T: DeserializeOwned>(
    resp: Response,
    fail: fn(String) -> ChatError,
) -> Result<ApiResponse<T>, ChatError> {
    let status = resp.status();
    let body = resp.text().await.map_err(|e| fail(format!("Network error: {e}")))?;

    if !status.is_success() {
        let reason = serde_json::from_str::<ApiResponse<serde_json::Value>>(&body)
            .ok()
            .and_then(|env| env.error)
            .unwrap_or_else(|| format!("HTTP error! status: {status}"));
        return Err(fail(reason));
    }

    let envelope: ApiResponse<T> =
        serde_json::from_str(&body).map_err(|e| fail(format!("Parse error: {e}")))?;
    if let Some(err) = envelope.error.clone().filter(|_| !envelope.success) {
        return Err(fail(err));
    }
    Ok(envelope)
}

#[async_trait]
impl MessageStore for HttpMessageStore {
    async fn health_check(&self) -> Result<(), ChatError> {
        let resp = self
            .client
            .get(self.url("/api/health"))
            .send()
            .await
            .map_err(|e| ChatError::unavailable(format!("Network error: {e}")))?;

        if !resp.status().is_success() {
            return Err(ChatError::unavailable(format!("Health check returned {}", resp.status())));
        }
        let health: HealthResponse = resp
            .json()
            .await
            .map_err(|e| ChatError::unavailable(format!("Parse error: {e}")))?;
        if health.status != "OK" {
            return Err(ChatError::unavailable(format!("Service reports status '{}'", health.status)));
        }
        Ok(())
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageRecord>, ChatError> {
        let resp = self
            .client
            .get(self.url(&format!("/messages/{conversation_id}")))
            .send()
            .await
            .map_err(|e| {
                error!("Failed to fetch messages for conversation {conversation_id}: {e}");
                ChatError::unavailable(format!("Network error: {e}"))
            })?;

        let envelope: ApiResponse<Vec<MessageRecord>> =
            read_envelope(resp, |reason| ChatError::unavailable(reason)).await?;
        let records = envelope.data.unwrap_or_default();
        debug!(conversation = %conversation_id, count = records.len(), "messages fetched");
        Ok(records)
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRecord, ChatError> {
        let resp = self
            .client
            .post(self.url("/messages"))
            .json(message)
            .send()
            .await
            .map_err(|e| {
                error!("Failed to insert message into {}: {e}", message.conversation_id);
                ChatError::write_failed(format!("Network error: {e}"))
            })?;

        read_envelope::<MessageRecord>(resp, |reason| ChatError::write_failed(reason))
            .await?
            .data
            .ok_or_else(|| ChatError::write_failed("Response did not include the stored message"))
    }

    async fn update_message(
        &self,
        id: &MessageId,
        body: &str,
    ) -> Result<MessageRecord, ChatError> {
        let resp = self
            .client
            .patch(self.url(&format!("/messages/{id}")))
            .json(&EditMessage { message: body.to_string() })
            .send()
            .await
            .map_err(|e| {
                error!("Failed to update message {id}: {e}");
                ChatError::write_failed(format!("Network error: {e}"))
            })?;

        read_envelope::<MessageRecord>(resp, |reason| ChatError::write_failed(reason))
            .await?
            .data
            .ok_or_else(|| ChatError::write_failed("Response did not include the updated message"))
    }
}
