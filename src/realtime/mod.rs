//! Realtime push notifications for a single conversation.

pub mod ws_channel;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::errors::ChatError;
use crate::models::{ConversationId, PushEvent};

pub use ws_channel::WsPushChannel;

const LEAVE_GRACE: Duration = Duration::from_secs(1);

/// Source of INSERT/UPDATE notifications for stored messages.
///
/// Delivery is at-least-once with best-effort ordering and may stop silently;
/// callers treat the REST store as authoritative.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<Subscription, ChatError>;
}

/// A live subscription. Dropping it tears the background task down;
/// [`Subscription::unsubscribe`] additionally lets it leave the channel cleanly.
pub struct Subscription {
    events: mpsc::Receiver<PushEvent>,
    task: Option<JoinHandle<()>>,
    leave: Option<oneshot::Sender<()>>,
}

impl Subscription {
    pub fn new(
        events: mpsc::Receiver<PushEvent>,
        task: JoinHandle<()>,
        leave: Option<oneshot::Sender<()>>,
    ) -> Self {
        Self { events, task: Some(task), leave }
    }

    /// Next event, or `None` once the channel has gone away.
    pub async fn next(&mut self) -> Option<PushEvent> {
        self.events.recv().await
    }

    pub async fn unsubscribe(mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        match self.leave.take() {
            Some(leave) => {
                if leave.send(()).is_err() {
                    task.abort();
                    return;
                }
                let abort = task.abort_handle();
                if tokio::time::timeout(LEAVE_GRACE, task).await.is_err() {
                    debug!("realtime task did not leave in time; aborting");
                    abort.abort();
                }
            }
            None => task.abort(),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("active", &self.task.is_some()).finish()
    }
}

/// Channel used when no realtime endpoint is configured. Sessions fall back to
/// polling the store.
#[derive(Debug, Clone, Default)]
pub struct DisabledChannel;

#[async_trait]
impl PushChannel for DisabledChannel {
    async fn subscribe(&self, _conversation_id: &ConversationId) -> Result<Subscription, ChatError> {
        Err(ChatError::subscription("realtime endpoint is not configured"))
    }
}
