/// One-shot policy for the automated responder.
///
/// `NoReply → Claimed → Replied`, with `Claimed → NoReply` when a send fails.
/// Observing a reply from elsewhere jumps straight to `Replied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplyState {
    #[default]
    NoReply,
    /// A reply is scheduled or in flight from this session.
    Claimed,
    Replied,
}

#[derive(Debug, Clone, Default)]
pub struct ReplyGuard {
    state: ReplyState,
}

impl ReplyGuard {
    pub fn new(already_replied: bool) -> Self {
        let state = if already_replied { ReplyState::Replied } else { ReplyState::NoReply };
        Self { state }
    }

    pub fn state(&self) -> ReplyState {
        self.state
    }

    pub fn should_auto_reply(&self) -> bool {
        self.state == ReplyState::NoReply
    }

    pub fn has_auto_replied(&self) -> bool {
        self.state == ReplyState::Replied
    }

    /// Takes the right to send the single reply. Only one caller wins.
    pub fn try_claim(&mut self) -> bool {
        if self.state == ReplyState::NoReply {
            self.state = ReplyState::Claimed;
            true
        } else {
            false
        }
    }

    /// Gives a claim back after a failed send. No effect once replied.
    pub fn release(&mut self) {
        if self.state == ReplyState::Claimed {
            self.state = ReplyState::NoReply;
        }
    }

    /// Idempotent; covers both a confirmed local send and a remote observation.
    pub fn record(&mut self) {
        self.state = ReplyState::Replied;
    }
}
