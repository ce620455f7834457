//! Scoped chat sessions.
//!
//! A [`ChatSession`] lives exactly as long as a conversation view is open. It
//! owns the push subscription (or the polling fallback), the delayed
//! auto-reply task, and a handle on the [`Reconciler`] that renders the view.
//! Closing or dropping the session releases all of them.

pub mod admin;

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::errors::ChatError;
use crate::models::{
    ClientTempId, ConversationId, Message, MessageId, Participant, PushEvent, PushKind, Roster,
    ViewEntry,
};
use crate::realtime::{PushChannel, Subscription};
use crate::reconciler::{Reconciler, ReplyState};
use crate::service::chat_service::{ChatService, InitialLoad};

pub use admin::AdminConsole;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Delay before the automated responder answers.
    pub thinking_delay: Duration,
    /// REST refresh period while realtime pushes are unavailable.
    pub poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { thinking_delay: Duration::from_millis(1500), poll_interval: Duration::from_secs(3) }
    }
}

/// Who is looking at the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Viewer {
    /// The conversation owner, served by the automated responder.
    EndUser { user_id: String },
    HumanAgent { agent_id: String },
}

impl Viewer {
    pub fn author_id(&self) -> &str {
        match self {
            Viewer::EndUser { user_id } => user_id,
            Viewer::HumanAgent { agent_id } => agent_id,
        }
    }

    pub fn participant(&self) -> Participant {
        match self {
            Viewer::EndUser { .. } => Participant::EndUser,
            Viewer::HumanAgent { .. } => Participant::HumanAgent,
        }
    }
}

/// Notifications for whoever renders the session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The message list changed; re-read it.
    ViewChanged,
    /// Transient, non-blocking problem such as a failed send.
    Notice(ChatError),
    /// Realtime pushes are unavailable; the session is polling the store.
    Degraded(ChatError),
}

/// The collaborators every session talks to.
#[derive(Clone)]
pub struct ChatBackend {
    pub service: ChatService,
    pub channel: Arc<dyn PushChannel>,
}

impl ChatBackend {
    pub fn new(service: ChatService, channel: Arc<dyn PushChannel>) -> Self {
        Self { service, channel }
    }
}

/// Read access to a session's rendered conversation.
#[derive(Clone)]
pub struct ViewHandle {
    reconciler: Arc<Mutex<Reconciler>>,
    conversation_id: ConversationId,
}

impl ViewHandle {
    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn snapshot(&self) -> Vec<ViewEntry> {
        lock(&self.reconciler).messages(&self.conversation_id)
    }
}

fn lock(reconciler: &Mutex<Reconciler>) -> MutexGuard<'_, Reconciler> {
    reconciler.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Shared {
    service: ChatService,
    reconciler: Arc<Mutex<Reconciler>>,
    roster: Roster,
    viewer: Viewer,
    config: SessionConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    pending_reply: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn reconciler(&self) -> MutexGuard<'_, Reconciler> {
        lock(&self.reconciler)
    }

    fn conversation(&self) -> &ConversationId {
        &self.roster.conversation_id
    }

    fn emit(&self, event: SessionEvent) {
        // The renderer may already be gone while the session winds down.
        let _ = self.events.send(event);
    }

    fn take_pending_reply(&self) -> Option<JoinHandle<()>> {
        self.pending_reply.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    fn apply_push(&self, event: PushEvent) {
        let kind = event.kind;
        let message = match self.roster.resolve(event.record) {
            Ok(message) => message,
            Err(e) => {
                warn!(conversation = %self.conversation(), "dropping push: {e}");
                return;
            }
        };
        let outcome = self.reconciler().on_remote_push(kind, &message);
        if outcome.changed_view() {
            self.emit(SessionEvent::ViewChanged);
        }
    }

    async fn refresh(&self) -> Result<(), ChatError> {
        let messages = self.service.fetch(&self.roster).await?;
        let changed = self.reconciler().merge_snapshot(self.conversation(), &messages);
        if changed {
            self.emit(SessionEvent::ViewChanged);
        }
        Ok(())
    }

    async fn deliver_auto_reply(&self, thinking: ClientTempId, user_text: &str) {
        let cid = self.conversation().clone();
        if self.reconciler().has_auto_replied(&cid) {
            info!(conversation = %cid, "auto-reply already present; not sending another");
            if self.reconciler().clear_thinking(&cid) {
                self.emit(SessionEvent::ViewChanged);
            }
            return;
        }

        let responder = self.service.responder().clone();
        let reply = responder.reply_for(user_text);
        match self.service.send(&self.roster, responder.id(), reply).await {
            Ok(message) => {
                {
                    let mut reconciler = self.reconciler();
                    reconciler.record_auto_reply(&cid);
                    reconciler.confirm_local(thinking, &message);
                    reconciler.clear_thinking(&cid);
                }
                info!(conversation = %cid, id = %message.id, "auto-reply sent");
                self.emit(SessionEvent::ViewChanged);
            }
            Err(e) => {
                {
                    let mut reconciler = self.reconciler();
                    reconciler.release_auto_reply(&cid);
                    reconciler.clear_thinking(&cid);
                }
                warn!(conversation = %cid, "auto-reply failed: {e}");
                self.emit(SessionEvent::ViewChanged);
                self.emit(SessionEvent::Notice(e));
            }
        }
    }
}

/// An open conversation view.
pub struct ChatSession {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    listener: Option<JoinHandle<()>>,
}

impl ChatSession {
    /// Subscribes, loads the history and starts listening for changes.
    ///
    /// A failed subscription degrades the session to polling; a failed load
    /// is returned as [`ChatError::ServiceUnavailable`] and releases the
    /// subscription again.
    pub async fn open(
        backend: &ChatBackend,
        reconciler: Arc<Mutex<Reconciler>>,
        roster: Roster,
        viewer: Viewer,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), ChatError> {
        let cid = roster.conversation_id.clone();

        // Subscribe before loading so nothing written in between is missed.
        let subscription = backend.channel.subscribe(&cid).await;
        if let Err(e) = &subscription {
            warn!(conversation = %cid, "realtime unavailable, falling back to polling: {e}");
        }

        // Only the owner's widget greets; an agent merely looking must not write.
        let load = match viewer {
            Viewer::EndUser { .. } => backend.service.load_initial(&roster).await?,
            Viewer::HumanAgent { .. } => InitialLoad {
                history: backend.service.load_history(&roster).await?,
                welcome_pending: false,
            },
        };
        {
            let mut r = lock(&reconciler);
            r.load_initial(&cid, load.history);
            if load.welcome_pending {
                r.show_local_welcome(&cid);
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            service: backend.service.clone(),
            reconciler,
            roster,
            viewer,
            config,
            events: events_tx,
            pending_reply: Mutex::new(None),
        });

        let subscription = match subscription {
            Ok(sub) => Some(sub),
            Err(e) => {
                shared.emit(SessionEvent::Degraded(e));
                None
            }
        };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let listener = tokio::spawn(listen(shared.clone(), subscription, shutdown_rx));

        info!(conversation = %cid, viewer = %shared.viewer.participant(), "chat session opened");
        shared.emit(SessionEvent::ViewChanged);
        Ok((Self { shared, shutdown, listener: Some(listener) }, events_rx))
    }

    /// Opens the end-user widget on the user's own conversation with a fresh
    /// reconciler, so reopening starts a new transient session.
    pub async fn open_widget(
        backend: &ChatBackend,
        user_id: &str,
        conversation_id: Option<ConversationId>,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), ChatError> {
        let responder = backend.service.responder().clone();
        let cid = conversation_id.unwrap_or_else(|| ConversationId(user_id.to_string()));
        let roster = Roster::new(cid, user_id, responder.id());
        let reconciler = Arc::new(Mutex::new(Reconciler::new(responder)));
        let viewer = Viewer::EndUser { user_id: user_id.to_string() };
        Self::open(backend, reconciler, roster, viewer, config).await
    }

    pub fn conversation_id(&self) -> &ConversationId {
        self.shared.conversation()
    }

    pub fn view(&self) -> ViewHandle {
        ViewHandle {
            reconciler: self.shared.reconciler.clone(),
            conversation_id: self.conversation_id().clone(),
        }
    }

    pub fn snapshot(&self) -> Vec<ViewEntry> {
        self.shared.reconciler().messages(self.conversation_id())
    }

    pub fn should_auto_reply(&self) -> bool {
        self.shared.reconciler().should_auto_reply(self.conversation_id())
    }

    pub fn reply_state(&self) -> ReplyState {
        self.shared.reconciler().reply_state(self.conversation_id())
    }

    /// Sends a message as the viewer.
    ///
    /// The message shows up at once and is swapped for the stored copy when
    /// the store answers; on failure it is removed and a notice is emitted.
    /// An end-user's send may schedule the single automated reply.
    pub async fn send_message(&self, text: &str) -> Result<Message, ChatError> {
        let shared = &self.shared;
        let body = shared.service.validate(text)?;
        let cid = shared.conversation().clone();

        let temp = shared.reconciler().append_local(&cid, shared.viewer.participant(), &body);
        shared.emit(SessionEvent::ViewChanged);

        let stored = match shared.service.send(&shared.roster, shared.viewer.author_id(), &body).await
        {
            Ok(message) => message,
            Err(e) => {
                shared.reconciler().rollback_local(&cid, temp);
                warn!(conversation = %cid, "send failed, message rolled back: {e}");
                shared.emit(SessionEvent::ViewChanged);
                shared.emit(SessionEvent::Notice(e.clone()));
                return Err(e);
            }
        };
        shared.reconciler().confirm_local(temp, &stored);
        shared.emit(SessionEvent::ViewChanged);

        let is_end_user = matches!(shared.viewer, Viewer::EndUser { .. });
        if is_end_user && shared.reconciler().try_claim_auto_reply(&cid) {
            self.schedule_auto_reply(body);
        }
        Ok(stored)
    }

    fn schedule_auto_reply(&self, user_text: String) {
        let shared = self.shared.clone();
        let thinking = shared.reconciler().show_thinking(shared.conversation());
        shared.emit(SessionEvent::ViewChanged);
        debug!(conversation = %shared.conversation(), delay = ?shared.config.thinking_delay, "auto-reply scheduled");

        let task_shared = shared.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(task_shared.config.thinking_delay).await;
            task_shared.deliver_auto_reply(thinking, &user_text).await;
        });

        let previous = shared.pending_reply.lock().unwrap_or_else(|p| p.into_inner()).replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Replaces a stored message's body. The edit shows up immediately; the
    /// UPDATE push that follows is a no-op.
    pub async fn edit_message(&self, id: &MessageId, text: &str) -> Result<Message, ChatError> {
        let shared = &self.shared;
        let message = match shared.service.edit(&shared.roster, id, text).await {
            Ok(message) => message,
            Err(e) => {
                shared.emit(SessionEvent::Notice(e.clone()));
                return Err(e);
            }
        };
        let outcome = shared.reconciler().on_remote_push(PushKind::Update, &message);
        if outcome.changed_view() {
            shared.emit(SessionEvent::ViewChanged);
        }
        Ok(message)
    }

    /// Re-reads the conversation from the store and merges anything missed.
    pub async fn refresh(&self) -> Result<(), ChatError> {
        self.shared.refresh().await
    }

    fn cancel_pending_reply(&self) {
        if let Some(task) = self.shared.take_pending_reply() {
            task.abort();
            let cid = self.conversation_id();
            let mut reconciler = self.shared.reconciler();
            reconciler.clear_thinking(cid);
            reconciler.release_auto_reply(cid);
        }
    }

    /// Cancels the scheduled reply, leaves the realtime channel and stops polling.
    pub async fn close(mut self) {
        self.cancel_pending_reply();
        let _ = self.shutdown.send(true);
        if let Some(listener) = self.listener.take() {
            let abort = listener.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE, listener).await.is_err() {
                abort.abort();
            }
        }
        info!(conversation = %self.conversation_id(), "chat session closed");
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if let Some(task) = self.shared.take_pending_reply() {
            task.abort();
        }
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}

async fn listen(
    shared: Arc<Shared>,
    subscription: Option<Subscription>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Some(mut sub) = subscription {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    sub.unsubscribe().await;
                    return;
                }
                event = sub.next() => match event {
                    Some(event) => shared.apply_push(event),
                    None => {
                        warn!(conversation = %shared.conversation(), "realtime channel lost");
                        shared.emit(SessionEvent::Degraded(ChatError::subscription(
                            "realtime channel closed",
                        )));
                        break;
                    }
                }
            }
        }
    }

    let period = shared.config.poll_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {
                if let Err(e) = shared.refresh().await {
                    debug!(conversation = %shared.conversation(), "poll failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMessage;
    use crate::responder::{Responder, THINKING};
    use crate::store::{InMemoryStore, MessageStore};

    fn backend(store: &Arc<InMemoryStore>) -> ChatBackend {
        ChatBackend::new(ChatService::new(store.clone(), Responder::default()), store.clone())
    }

    fn config() -> SessionConfig {
        SessionConfig {
            thinking_delay: Duration::from_millis(1500),
            poll_interval: Duration::from_secs(3),
        }
    }

    fn bodies(session: &ChatSession) -> Vec<String> {
        session.snapshot().into_iter().map(|e| e.body).collect()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn send_confirms_and_schedules_one_reply() {
        let store = Arc::new(InMemoryStore::new());
        let (session, _events) =
            ChatSession::open_widget(&backend(&store), "user-1", None, config()).await.unwrap();

        session.send_message("what is my balance").await.unwrap();
        assert_eq!(session.reply_state(), ReplyState::Claimed);
        assert!(bodies(&session).contains(&THINKING.to_string()));

        tokio::time::sleep(Duration::from_millis(1600)).await;
        settle().await;

        let view = bodies(&session);
        assert_eq!(view.len(), 3, "{view:?}");
        assert!(view[2].contains("account balance"));
        assert_eq!(session.reply_state(), ReplyState::Replied);

        session.send_message("thanks").await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(bodies(&session).len(), 4);
        // welcome + user + reply + user
        assert_eq!(store.insert_count(), 4);
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn closing_cancels_the_scheduled_reply() {
        let store = Arc::new(InMemoryStore::new());
        let (session, _events) =
            ChatSession::open_widget(&backend(&store), "user-1", None, config()).await.unwrap();
        session.send_message("hello").await.unwrap();
        session.close().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        // welcome + user message, no reply
        assert_eq!(store.insert_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_rolls_back_and_notifies() {
        let store = Arc::new(InMemoryStore::new());
        let (session, mut events) =
            ChatSession::open_widget(&backend(&store), "user-1", None, config()).await.unwrap();
        store.set_fail_writes(true);

        let err = session.send_message("hello").await.unwrap_err();
        assert!(err.is_write_failure());
        assert_eq!(bodies(&session), [Responder::default().welcome_text()]);
        assert_eq!(session.reply_state(), ReplyState::NoReply);

        let mut saw_notice = false;
        while let Ok(event) = events.try_recv() {
            saw_notice |= matches!(event, SessionEvent::Notice(ref e) if e.is_write_failure());
        }
        assert!(saw_notice);
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_auto_reply_releases_the_claim() {
        let store = Arc::new(InMemoryStore::new());
        let (session, _events) =
            ChatSession::open_widget(&backend(&store), "user-1", None, config()).await.unwrap();
        session.send_message("hello").await.unwrap();
        store.set_fail_writes(true);

        tokio::time::sleep(Duration::from_millis(1600)).await;
        settle().await;
        assert_eq!(session.reply_state(), ReplyState::NoReply);
        assert!(!bodies(&session).contains(&THINKING.to_string()));
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn remote_reply_during_thinking_suppresses_local_send() {
        let store = Arc::new(InMemoryStore::new());
        let bot = Responder::default();
        let (session, _events) =
            ChatSession::open_widget(&backend(&store), "user-1", None, config()).await.unwrap();
        session.send_message("loan options?").await.unwrap();

        store.inject(NewMessage {
            conversation_id: "user-1".into(),
            user_id: bot.id().to_string(),
            message: "reply from another tab".into(),
        });
        settle().await;
        assert_eq!(session.reply_state(), ReplyState::Replied);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        // welcome + user + the other tab's reply
        assert_eq!(store.insert_count(), 3);
        assert_eq!(bodies(&session).last().unwrap(), "reply from another tab");
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn agent_messages_never_trigger_the_responder() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = Arc::new(Mutex::new(Reconciler::default()));
        let roster = Roster::new("user-1".into(), "user-1", Responder::default().id());
        let viewer = Viewer::HumanAgent { agent_id: "agent-1".into() };
        let (session, _events) =
            ChatSession::open(&backend(&store), reconciler, roster, viewer, config())
                .await
                .unwrap();

        assert!(session.snapshot().is_empty());

        let sent = session.send_message("An agent will help you").await.unwrap();
        assert_eq!(sent.participant, Participant::HumanAgent);
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        // only the agent's message; no welcome, no reply
        assert_eq!(store.insert_count(), 1);
        assert_eq!(session.reply_state(), ReplyState::NoReply);
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_applies_an_edit_whose_push_was_lost() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = Arc::new(Mutex::new(Reconciler::default()));
        let roster = Roster::new("user-1".into(), "user-1", Responder::default().id());
        let viewer = Viewer::HumanAgent { agent_id: "agent-1".into() };
        let (session, _events) =
            ChatSession::open(&backend(&store), reconciler, roster, viewer, config())
                .await
                .unwrap();
        let sent = session.send_message("helo").await.unwrap();

        store.set_drop_pushes(true);
        store.update_message(&sent.id, "hello (edited)").await.unwrap();
        settle().await;
        assert_eq!(bodies(&session), ["helo"]);

        session.refresh().await.unwrap();
        assert_eq!(bodies(&session), ["hello (edited)"]);
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn edit_replaces_body_once() {
        let store = Arc::new(InMemoryStore::new());
        let (session, _events) =
            ChatSession::open_widget(&backend(&store), "user-1", None, config()).await.unwrap();
        let sent = session.send_message("helo").await.unwrap();

        let edited = session.edit_message(&sent.id, "hello").await.unwrap();
        settle().await;
        assert_eq!(edited.body, "hello");
        let view = session.snapshot();
        assert_eq!(view.iter().filter(|e| e.message_id() == Some(&sent.id)).count(), 1);
        assert!(view.iter().any(|e| e.body == "hello"));
        session.close().await;
    }
}
