//! In-process message store that also acts as its own realtime channel.
//!
//! Used for offline runs of the binary and for driving sessions in tests. Every
//! failure the real services can show is injectable: an unreachable API,
//! rejected writes, pushes that never arrive and subscriptions that cannot be
//! established.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::errors::ChatError;
use crate::models::{ConversationId, MessageId, MessageRecord, NewMessage, PushEvent, PushKind};
use crate::realtime::{PushChannel, Subscription};
use crate::store::MessageStore;

const PUSH_BUFFER: usize = 256;

#[derive(Debug, Default)]
struct Records {
    rows: Vec<MessageRecord>,
    next_id: u64,
    last_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct InMemoryStore {
    records: Mutex<Records>,
    pushes: broadcast::Sender<PushEvent>,
    offline: AtomicBool,
    fail_writes: AtomicBool,
    drop_pushes: AtomicBool,
    refuse_subscriptions: AtomicBool,
    inserts: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (pushes, _) = broadcast::channel(PUSH_BUFFER);
        Self {
            records: Mutex::new(Records::default()),
            pushes,
            offline: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            drop_pushes: AtomicBool::new(false),
            refuse_subscriptions: AtomicBool::new(false),
            inserts: AtomicUsize::new(0),
        }
    }

    /// Health checks and reads fail while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Writes still succeed but no push is emitted for them.
    pub fn set_drop_pushes(&self, drop: bool) {
        self.drop_pushes.store(drop, Ordering::SeqCst);
    }

    pub fn set_refuse_subscriptions(&self, refuse: bool) {
        self.refuse_subscriptions.store(refuse, Ordering::SeqCst);
    }

    /// Number of successful inserts so far.
    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn records(&self, conversation_id: &ConversationId) -> Vec<MessageRecord> {
        self.lock()
            .rows
            .iter()
            .filter(|r| r.conversation_id == conversation_id.0)
            .cloned()
            .collect()
    }

    /// Stores a record written by someone else (another tab, an agent) and
    /// pushes it like any other write.
    pub fn inject(&self, message: NewMessage) -> MessageRecord {
        let record = self.store(message);
        self.publish(PushKind::Insert, &record);
        record
    }

    /// Re-delivers an existing record, as an at-least-once channel may.
    pub fn redeliver(&self, record: &MessageRecord) {
        let _ = self.pushes.send(PushEvent { kind: PushKind::Insert, record: record.clone() });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Records> {
        // A panic while holding the lock leaves the rows intact; keep serving them.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn store(&self, message: NewMessage) -> MessageRecord {
        let mut records = self.lock();
        records.next_id += 1;

        // Strictly increasing timestamps keep store order and created_at order equal.
        let now = Utc::now();
        let created_at = match records.last_created_at {
            Some(last) if last >= now => last + Duration::microseconds(1),
            _ => now,
        };
        records.last_created_at = Some(created_at);

        let record = MessageRecord {
            id: format!("mem-{}", records.next_id),
            conversation_id: message.conversation_id,
            user_id: message.user_id,
            message: message.message,
            created_at,
        };
        records.rows.push(record.clone());
        self.inserts.fetch_add(1, Ordering::SeqCst);
        record
    }

    fn publish(&self, kind: PushKind, record: &MessageRecord) {
        if self.drop_pushes.load(Ordering::SeqCst) {
            debug!(id = %record.id, "push dropped");
            return;
        }
        // No receivers is fine: nobody is watching.
        let _ = self.pushes.send(PushEvent { kind, record: record.clone() });
    }

    fn check_online(&self) -> Result<(), ChatError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChatError::unavailable("in-memory store is offline"));
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<(), ChatError> {
        if self.offline.load(Ordering::SeqCst) || self.fail_writes.load(Ordering::SeqCst) {
            return Err(ChatError::write_failed("in-memory store rejected the write"));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn health_check(&self) -> Result<(), ChatError> {
        self.check_online()
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessageRecord>, ChatError> {
        self.check_online()?;
        Ok(self.records(conversation_id))
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<MessageRecord, ChatError> {
        self.check_writable()?;
        let record = self.store(message.clone());
        self.publish(PushKind::Insert, &record);
        Ok(record)
    }

    async fn update_message(
        &self,
        id: &MessageId,
        body: &str,
    ) -> Result<MessageRecord, ChatError> {
        self.check_writable()?;
        let record = {
            let mut records = self.lock();
            let row = records
                .rows
                .iter_mut()
                .find(|r| r.id == id.0)
                .ok_or_else(|| ChatError::write_failed(format!("message {id} not found")))?;
            row.message = body.to_string();
            row.clone()
        };
        self.publish(PushKind::Update, &record);
        Ok(record)
    }
}

#[async_trait]
impl PushChannel for InMemoryStore {
    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<Subscription, ChatError> {
        if self.refuse_subscriptions.load(Ordering::SeqCst) {
            return Err(ChatError::subscription("in-memory channel refused the subscription"));
        }

        let mut pushes = self.pushes.subscribe();
        let (tx, rx) = mpsc::channel(PUSH_BUFFER);
        let conversation = conversation_id.0.clone();
        let task = tokio::spawn(async move {
            loop {
                match pushes.recv().await {
                    Ok(event) if event.record.conversation_id == conversation => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "in-memory subscriber lagged; pushes lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(Subscription::new(rx, task, None))
    }
}
