//! Conversation state reconciliation.
//!
//! Merges optimistic local sends, REST acknowledgements and realtime pushes
//! into one ordered, deduplicated view per conversation, and tracks the
//! one-reply policy of the automated responder.

pub mod reply_guard;
pub mod view;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::models::{
    ClientTempId, ConversationId, EntryKey, Message, MessageId, Participant, PushKind, ViewEntry,
};
use crate::responder::{Responder, THINKING};

pub use reply_guard::{ReplyGuard, ReplyState};
pub use view::ConversationView;

/// What a merge did to the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    /// Already present (or already hidden); nothing changed.
    Duplicate,
    /// A second auto-reply or welcome lost to an earlier one and is hidden.
    Suppressed,
}

impl MergeOutcome {
    pub fn changed_view(&self) -> bool {
        matches!(self, MergeOutcome::Inserted | MergeOutcome::Replaced | MergeOutcome::Suppressed)
    }
}

/// Which responder message a view treats as canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponderSlot {
    Welcome,
    Reply,
}

#[derive(Debug, Default)]
struct ConversationState {
    view: ConversationView,
    guard: ReplyGuard,
    /// Earliest confirmed welcome and auto-reply, by `(created_at, id)`.
    welcome: Option<(DateTime<Utc>, MessageId)>,
    reply: Option<(DateTime<Utc>, MessageId)>,
    /// Confirmed ids that lost to a canonical responder message.
    hidden: HashSet<MessageId>,
    local_welcome: Option<ClientTempId>,
    thinking: Option<ClientTempId>,
}

impl ConversationState {
    fn canonical(&mut self, slot: ResponderSlot) -> &mut Option<(DateTime<Utc>, MessageId)> {
        match slot {
            ResponderSlot::Welcome => &mut self.welcome,
            ResponderSlot::Reply => &mut self.reply,
        }
    }

    fn merge(&mut self, responder: &Responder, kind: PushKind, message: &Message) -> MergeOutcome {
        if self.hidden.contains(&message.id) {
            return MergeOutcome::Duplicate;
        }

        let key = EntryKey::Confirmed(message.id.clone());
        if self.view.contains(&key) {
            return match kind {
                PushKind::Insert => MergeOutcome::Duplicate,
                PushKind::Update => {
                    if self.view.get(&key) == Some(&ViewEntry::from(message)) {
                        MergeOutcome::Duplicate
                    } else {
                        self.view.replace(ViewEntry::from(message));
                        MergeOutcome::Replaced
                    }
                }
            };
        }

        let slot = if responder.is_welcome(message.participant, &message.body) {
            Some(ResponderSlot::Welcome)
        } else if responder.is_auto_reply(message) {
            Some(ResponderSlot::Reply)
        } else {
            None
        };

        match slot {
            Some(ResponderSlot::Welcome) => {
                if let Some(temp) = self.local_welcome.take() {
                    self.view.remove(&EntryKey::Pending(temp));
                }
            }
            Some(ResponderSlot::Reply) => {
                self.guard.record();
                if let Some(temp) = self.thinking.take() {
                    self.view.remove(&EntryKey::Pending(temp));
                }
            }
            None => {}
        }

        if let Some(slot) = slot {
            let candidate = (message.created_at, message.id.clone());
            match self.canonical(slot).clone() {
                Some(current) if current <= candidate => {
                    debug!(id = %message.id, kept = %current.1, "hiding later responder duplicate");
                    self.hidden.insert(message.id.clone());
                    return MergeOutcome::Suppressed;
                }
                Some(current) => {
                    debug!(id = %current.1, kept = %message.id, "replacing responder duplicate");
                    self.view.remove(&EntryKey::Confirmed(current.1.clone()));
                    self.hidden.insert(current.1);
                }
                None => {}
            }
            *self.canonical(slot) = Some(candidate);
        }

        self.view.insert(ViewEntry::from(message));
        MergeOutcome::Inserted
    }
}

/// Per-session registry of conversation views.
#[derive(Debug)]
pub struct Reconciler {
    responder: Responder,
    conversations: HashMap<ConversationId, ConversationState>,
}

impl Reconciler {
    pub fn new(responder: Responder) -> Self {
        Self { responder, conversations: HashMap::new() }
    }

    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    fn state_mut(&mut self, conversation_id: &ConversationId) -> &mut ConversationState {
        self.conversations.entry(conversation_id.clone()).or_default()
    }

    /// Installs the full history fetched for `conversation_id`, replacing any
    /// previous view, and derives the reply state from it.
    pub fn load_initial(
        &mut self,
        conversation_id: &ConversationId,
        history: Vec<Message>,
    ) -> Vec<ViewEntry> {
        let mut state = ConversationState::default();
        for message in &history {
            state.merge(&self.responder, PushKind::Insert, message);
        }
        debug!(
            conversation = %conversation_id,
            messages = state.view.len(),
            replied = state.guard.has_auto_replied(),
            "conversation loaded"
        );
        let snapshot = state.view.snapshot();
        self.conversations.insert(conversation_id.clone(), state);
        snapshot
    }

    /// Merges a REST snapshot without dropping local pending entries.
    ///
    /// Rows are upserts: the store is authoritative, so a body edited while
    /// its UPDATE push was lost is replaced here.
    pub fn merge_snapshot(&mut self, conversation_id: &ConversationId, messages: &[Message]) -> bool {
        let responder = self.responder.clone();
        let state = self.state_mut(conversation_id);
        let mut changed = false;
        for message in messages {
            changed |= state.merge(&responder, PushKind::Update, message).changed_view();
        }
        changed
    }

    /// Shows a message before the store acknowledges it.
    pub fn append_local(
        &mut self,
        conversation_id: &ConversationId,
        participant: Participant,
        body: &str,
    ) -> ClientTempId {
        let temp = ClientTempId::new();
        self.state_mut(conversation_id).view.insert(ViewEntry {
            key: EntryKey::Pending(temp),
            participant,
            body: body.to_string(),
            created_at: Utc::now(),
        });
        temp
    }

    /// Swaps the optimistic entry for the stored message. The push echo may
    /// already have delivered it, in which case only the stand-in goes.
    pub fn confirm_local(&mut self, temp: ClientTempId, message: &Message) -> MergeOutcome {
        let responder = self.responder.clone();
        let state = self.state_mut(&message.conversation_id);
        state.view.remove(&EntryKey::Pending(temp));
        state.merge(&responder, PushKind::Insert, message)
    }

    /// Drops an optimistic entry whose write failed.
    pub fn rollback_local(
        &mut self,
        conversation_id: &ConversationId,
        temp: ClientTempId,
    ) -> Option<ViewEntry> {
        self.conversations
            .get_mut(conversation_id)?
            .view
            .remove(&EntryKey::Pending(temp))
    }

    /// Idempotent merge of a realtime INSERT or UPDATE.
    pub fn on_remote_push(&mut self, kind: PushKind, message: &Message) -> MergeOutcome {
        let responder = self.responder.clone();
        let outcome = self.state_mut(&message.conversation_id).merge(&responder, kind, message);
        debug!(id = %message.id, ?kind, ?outcome, "push merged");
        outcome
    }

    /// Local-only greeting for when the welcome could not be persisted. It is
    /// dropped once a confirmed welcome arrives.
    pub fn show_local_welcome(&mut self, conversation_id: &ConversationId) -> ClientTempId {
        let body = self.responder.welcome_text();
        let temp = self.append_local(conversation_id, Participant::AutomatedResponder, body);
        self.state_mut(conversation_id).local_welcome = Some(temp);
        temp
    }

    pub fn show_thinking(&mut self, conversation_id: &ConversationId) -> ClientTempId {
        self.clear_thinking(conversation_id);
        let temp = self.append_local(conversation_id, Participant::AutomatedResponder, THINKING);
        self.state_mut(conversation_id).thinking = Some(temp);
        temp
    }

    pub fn clear_thinking(&mut self, conversation_id: &ConversationId) -> bool {
        let Some(state) = self.conversations.get_mut(conversation_id) else {
            return false;
        };
        match state.thinking.take() {
            Some(temp) => state.view.remove(&EntryKey::Pending(temp)).is_some(),
            None => false,
        }
    }

    pub fn should_auto_reply(&self, conversation_id: &ConversationId) -> bool {
        self.conversations
            .get(conversation_id)
            .map_or(true, |s| s.guard.should_auto_reply())
    }

    pub fn has_auto_replied(&self, conversation_id: &ConversationId) -> bool {
        self.conversations
            .get(conversation_id)
            .is_some_and(|s| s.guard.has_auto_replied())
    }

    pub fn reply_state(&self, conversation_id: &ConversationId) -> ReplyState {
        self.conversations
            .get(conversation_id)
            .map(|s| s.guard.state())
            .unwrap_or_default()
    }

    pub fn try_claim_auto_reply(&mut self, conversation_id: &ConversationId) -> bool {
        self.state_mut(conversation_id).guard.try_claim()
    }

    pub fn release_auto_reply(&mut self, conversation_id: &ConversationId) {
        if let Some(state) = self.conversations.get_mut(conversation_id) {
            state.guard.release();
        }
    }

    pub fn record_auto_reply(&mut self, conversation_id: &ConversationId) {
        self.state_mut(conversation_id).guard.record();
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<ViewEntry> {
        self.conversations
            .get(conversation_id)
            .map(|s| s.view.snapshot())
            .unwrap_or_default()
    }

    pub fn discard(&mut self, conversation_id: &ConversationId) {
        self.conversations.remove(conversation_id);
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(Responder::default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;

    const BOT: &str = crate::responder::DEFAULT_RESPONDER_ID;

    fn conv() -> ConversationId {
        ConversationId::from("conv-1")
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn msg(id: &str, participant: Participant, body: &str, secs: i64) -> Message {
        Message {
            id: MessageId::from(id),
            conversation_id: conv(),
            participant,
            body: body.to_string(),
            created_at: at(secs),
        }
    }

    fn bodies(r: &Reconciler) -> Vec<String> {
        r.messages(&conv()).into_iter().map(|e| e.body).collect()
    }

    fn welcome(id: &str, secs: i64) -> Message {
        msg(id, Participant::AutomatedResponder, Responder::new(BOT).welcome_text(), secs)
    }

    #[test]
    fn optimistic_send_then_ack_then_echo_shows_one_message() {
        let mut r = Reconciler::default();
        r.load_initial(&conv(), vec![]);

        let temp = r.append_local(&conv(), Participant::EndUser, "hello");
        assert_eq!(bodies(&r), ["hello"]);
        assert!(r.messages(&conv())[0].is_pending());

        let stored = msg("m1", Participant::EndUser, "hello", 1);
        assert_eq!(r.confirm_local(temp, &stored), MergeOutcome::Inserted);
        assert_eq!(r.on_remote_push(PushKind::Insert, &stored), MergeOutcome::Duplicate);
        assert_eq!(r.on_remote_push(PushKind::Insert, &stored), MergeOutcome::Duplicate);

        let view = r.messages(&conv());
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].message_id(), Some(&MessageId::from("m1")));
    }

    #[test]
    fn echo_before_ack_still_settles_to_one_message() {
        let mut r = Reconciler::default();
        let temp = r.append_local(&conv(), Participant::EndUser, "hello");
        let stored = msg("m1", Participant::EndUser, "hello", 1);

        assert_eq!(r.on_remote_push(PushKind::Insert, &stored), MergeOutcome::Inserted);
        assert_eq!(r.messages(&conv()).len(), 2);

        assert_eq!(r.confirm_local(temp, &stored), MergeOutcome::Duplicate);
        let view = r.messages(&conv());
        assert_eq!(view.len(), 1);
        assert!(!view[0].is_pending());
    }

    #[test]
    fn rollback_removes_only_the_failed_entry() {
        let mut r = Reconciler::default();
        r.load_initial(&conv(), vec![msg("m1", Participant::EndUser, "first", 0)]);
        let temp = r.append_local(&conv(), Participant::EndUser, "lost");

        let removed = r.rollback_local(&conv(), temp).unwrap();
        assert_eq!(removed.body, "lost");
        assert_eq!(bodies(&r), ["first"]);
        assert!(r.rollback_local(&conv(), temp).is_none());
    }

    #[test]
    fn pushes_are_ordered_by_created_at() {
        let mut r = Reconciler::default();
        r.on_remote_push(PushKind::Insert, &msg("c", Participant::EndUser, "c", 30));
        r.on_remote_push(PushKind::Insert, &msg("a", Participant::EndUser, "a", 10));
        r.on_remote_push(PushKind::Insert, &msg("b", Participant::HumanAgent, "b", 20));

        let view = r.messages(&conv());
        assert_eq!(bodies(&r), ["a", "b", "c"]);
        assert!(view.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn update_replaces_existing_and_upserts_unknown() {
        let mut r = Reconciler::default();
        r.on_remote_push(PushKind::Insert, &msg("m1", Participant::HumanAgent, "draft", 0));

        let edited = msg("m1", Participant::HumanAgent, "final", 0);
        assert_eq!(r.on_remote_push(PushKind::Update, &edited), MergeOutcome::Replaced);
        assert_eq!(r.on_remote_push(PushKind::Update, &edited), MergeOutcome::Duplicate);
        assert_eq!(bodies(&r), ["final"]);

        let unseen = msg("m2", Participant::HumanAgent, "late", 5);
        assert_eq!(r.on_remote_push(PushKind::Update, &unseen), MergeOutcome::Inserted);
        assert_eq!(bodies(&r), ["final", "late"]);
    }

    #[test]
    fn load_derives_reply_state_ignoring_welcome() {
        let mut r = Reconciler::default();
        r.load_initial(&conv(), vec![welcome("w", 0)]);
        assert!(r.should_auto_reply(&conv()));

        r.load_initial(
            &conv(),
            vec![
                welcome("w", 0),
                msg("u", Participant::EndUser, "loan?", 1),
                msg("b", Participant::AutomatedResponder, "We offer various loan options.", 2),
            ],
        );
        assert!(!r.should_auto_reply(&conv()));
        assert!(r.has_auto_replied(&conv()));
    }

    #[test]
    fn human_agent_messages_do_not_count_as_auto_replies() {
        let mut r = Reconciler::default();
        r.load_initial(&conv(), vec![msg("a", Participant::HumanAgent, "Agent here", 0)]);
        assert!(r.should_auto_reply(&conv()));
    }

    #[test]
    fn remote_reply_flips_state_and_clears_thinking() {
        let mut r = Reconciler::default();
        r.load_initial(&conv(), vec![]);
        assert!(r.try_claim_auto_reply(&conv()));
        r.show_thinking(&conv());
        assert_eq!(bodies(&r), [THINKING]);

        let other_tab = msg("b1", Participant::AutomatedResponder, "reply from tab B", 1);
        r.on_remote_push(PushKind::Insert, &other_tab);

        assert!(r.has_auto_replied(&conv()));
        assert_eq!(bodies(&r), ["reply from tab B"]);
        assert!(!r.clear_thinking(&conv()));
    }

    #[test]
    fn concurrent_auto_replies_converge_on_the_earliest() {
        let early = msg("b-early", Participant::AutomatedResponder, "reply A", 5);
        let late = msg("b-late", Participant::AutomatedResponder, "reply B", 6);

        let mut tab_a = Reconciler::default();
        tab_a.on_remote_push(PushKind::Insert, &late);
        assert_eq!(tab_a.on_remote_push(PushKind::Insert, &early), MergeOutcome::Inserted);
        assert_eq!(tab_a.on_remote_push(PushKind::Insert, &late), MergeOutcome::Duplicate);

        let mut tab_b = Reconciler::default();
        tab_b.on_remote_push(PushKind::Insert, &early);
        assert_eq!(tab_b.on_remote_push(PushKind::Insert, &late), MergeOutcome::Suppressed);

        assert_eq!(bodies(&tab_a), ["reply A"]);
        assert_eq!(bodies(&tab_a), bodies(&tab_b));
    }

    #[test]
    fn duplicate_welcomes_collapse_and_replace_local_greeting() {
        let mut r = Reconciler::default();
        r.load_initial(&conv(), vec![]);
        r.show_local_welcome(&conv());
        assert!(r.messages(&conv())[0].is_pending());

        r.on_remote_push(PushKind::Insert, &welcome("w2", 2));
        r.on_remote_push(PushKind::Insert, &welcome("w1", 1));

        let view = r.messages(&conv());
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].message_id(), Some(&MessageId::from("w1")));
        assert!(r.should_auto_reply(&conv()));
    }

    #[test]
    fn snapshot_merge_keeps_pending_entries() {
        let mut r = Reconciler::default();
        r.load_initial(&conv(), vec![msg("m1", Participant::EndUser, "one", 0)]);
        r.append_local(&conv(), Participant::EndUser, "in flight");

        let changed = r.merge_snapshot(
            &conv(),
            &[
                msg("m1", Participant::EndUser, "one", 0),
                msg("m2", Participant::HumanAgent, "missed push", 1),
            ],
        );
        assert!(changed);
        assert_eq!(r.messages(&conv()).len(), 3);
        assert!(!r.merge_snapshot(&conv(), &[msg("m1", Participant::EndUser, "one", 0)]));
    }

    #[test]
    fn snapshot_applies_edits_missed_by_the_channel() {
        let mut r = Reconciler::default();
        r.load_initial(&conv(), vec![msg("m1", Participant::HumanAgent, "draft", 0)]);

        let edited = msg("m1", Participant::HumanAgent, "final", 0);
        assert!(r.merge_snapshot(&conv(), &[edited.clone()]));
        assert_eq!(bodies(&r), ["final"]);
        assert!(!r.merge_snapshot(&conv(), &[edited]));
    }

    #[test]
    fn record_is_idempotent_and_discard_resets() {
        let mut r = Reconciler::default();
        r.record_auto_reply(&conv());
        r.record_auto_reply(&conv());
        assert_eq!(r.reply_state(&conv()), ReplyState::Replied);

        r.discard(&conv());
        assert_eq!(r.reply_state(&conv()), ReplyState::NoReply);
        assert!(r.messages(&conv()).is_empty());
    }

    mod properties {
        use std::collections::HashSet;

        use proptest::prelude::*;

        use super::*;

        #[derive(Debug, Clone)]
        enum Op {
            Append,
            Confirm(usize),
            Rollback,
            Push(usize, bool),
            Snapshot(Vec<bool>),
        }

        fn pool() -> impl Strategy<Value = Vec<Message>> {
            prop::collection::vec((0u8..4, 0i64..20), 1..8).prop_map(|rows| {
                rows.into_iter()
                    .enumerate()
                    .map(|(i, (kind, secs))| {
                        let id = format!("m{i}");
                        match kind {
                            0 => msg(&id, Participant::EndUser, &id, secs),
                            1 => msg(&id, Participant::HumanAgent, &id, secs),
                            2 => msg(&id, Participant::AutomatedResponder, &format!("reply {id}"), secs),
                            _ => welcome(&id, secs),
                        }
                    })
                    .collect()
            })
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![
                Just(Op::Append),
                any::<usize>().prop_map(Op::Confirm),
                Just(Op::Rollback),
                (any::<usize>(), any::<bool>()).prop_map(|(i, update)| Op::Push(i, update)),
                prop::collection::vec(any::<bool>(), 8).prop_map(Op::Snapshot),
            ]
        }

        fn check(r: &Reconciler) -> Result<(), TestCaseError> {
            let view = r.messages(&conv());
            let keys: HashSet<&EntryKey> = view.iter().map(|e| &e.key).collect();
            prop_assert_eq!(keys.len(), view.len(), "duplicate entries: {:?}", view);
            prop_assert!(view.windows(2).all(|w| w[0].created_at <= w[1].created_at));

            let responder = r.responder();
            let confirmed_responder = view
                .iter()
                .filter(|e| !e.is_pending() && e.participant == Participant::AutomatedResponder);
            let (welcomes, replies): (Vec<&ViewEntry>, Vec<&ViewEntry>) =
                confirmed_responder.partition(|e| responder.is_welcome(e.participant, &e.body));
            prop_assert!(welcomes.len() <= 1, "welcomes: {:?}", welcomes);
            prop_assert!(replies.len() <= 1, "replies: {:?}", replies);
            Ok(())
        }

        proptest! {
            #[test]
            fn any_interleaving_keeps_the_view_consistent(
                pool in pool(),
                ops in prop::collection::vec(op(), 0..40),
            ) {
                let mut r = Reconciler::default();
                let mut pending = Vec::new();

                for op in ops {
                    match op {
                        Op::Append => {
                            pending.push(r.append_local(&conv(), Participant::EndUser, "local"));
                        }
                        Op::Confirm(i) => {
                            if !pending.is_empty() {
                                let temp = pending.remove(0);
                                r.confirm_local(temp, &pool[i % pool.len()]);
                            }
                        }
                        Op::Rollback => {
                            if let Some(temp) = pending.pop() {
                                prop_assert!(r.rollback_local(&conv(), temp).is_some());
                            }
                        }
                        Op::Push(i, update) => {
                            let kind = if update { PushKind::Update } else { PushKind::Insert };
                            let message = &pool[i % pool.len()];
                            r.on_remote_push(kind, message);
                            prop_assert!(!r.on_remote_push(kind, message).changed_view());
                        }
                        Op::Snapshot(mask) => {
                            let rows: Vec<Message> = pool
                                .iter()
                                .zip(mask.iter().cycle())
                                .filter(|(_, keep)| **keep)
                                .map(|(m, _)| m.clone())
                                .collect();
                            r.merge_snapshot(&conv(), &rows);
                        }
                    }
                    check(&r)?;
                }

                r.merge_snapshot(&conv(), &pool);
                let settled = r.messages(&conv());
                prop_assert!(!r.merge_snapshot(&conv(), &pool));
                for message in &pool {
                    prop_assert!(!r.on_remote_push(PushKind::Insert, message).changed_view());
                }
                prop_assert_eq!(r.messages(&conv()), settled);
                prop_assert_eq!(
                    r.messages(&conv()).iter().filter(|e| e.is_pending()).count(),
                    pending.len()
                );
                check(&r)?;
            }
        }
    }
}
