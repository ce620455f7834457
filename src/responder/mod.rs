use crate::models::{Message, Participant};

pub const DEFAULT_RESPONDER_ID: &str = "11111111-1111-1111-1111-111111111111";

const WELCOME: &str =
    "Hello! I'm Ron Stone Bot. How can I assist you with your banking needs today?";

/// Placeholder body shown while the responder "thinks".
pub const THINKING: &str = "Thinking...";

/// Keyword → scripted reply, checked in order. The first table entry whose
/// keyword appears in the lowercased user text wins.
const SCRIPT: &[(&[&str], &str)] = &[
    (
        &["balance", "money"],
        "I can help you check your account balance. Please visit the Dashboard to view your \
         current balance and transaction history.",
    ),
    (
        &["transfer", "send money"],
        "You can transfer money to other accounts using the Transfer feature in your dashboard. \
         Make sure you have the recipient's account number ready.",
    ),
    (
        &["card", "debit"],
        "For debit card inquiries, including lost or stolen cards, please contact our card \
         services department at 1-800-RON-STONE.",
    ),
    (
        &["loan", "credit"],
        "We offer various loan options. You can apply for a loan through our online portal or \
         visit your nearest branch for personalized assistance.",
    ),
    (
        &["fee", "charge"],
        "You can view all account fees and charges in the Fees Schedule section of our website \
         or mobile app.",
    ),
    (
        &["active", "activate"],
        "Account activation typically takes 24-48 hours after verification. Our team will \
         notify you once your account is active.",
    ),
    (
        &["hello", "hi"],
        "Hello! I'm Ron Stone Bot, your virtual banking assistant. How can I help you today?",
    ),
];

const FALLBACK: &str = "Thank you for your message. I'm here to help with your banking needs. \
                        For specific account issues, you can also visit the support section in \
                        your dashboard.";

/// The automated responder: a fixed identity with a scripted vocabulary.
#[derive(Debug, Clone)]
pub struct Responder {
    id: String,
}

impl Responder {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn welcome_text(&self) -> &'static str {
        WELCOME
    }

    /// The welcome greeting is recognised by its exact body; a scripted reply
    /// that merely starts the same way is a real reply.
    pub fn is_welcome(&self, participant: Participant, body: &str) -> bool {
        participant == Participant::AutomatedResponder && body == WELCOME
    }

    /// A responder message that counts against the one-reply policy.
    pub fn is_auto_reply(&self, message: &Message) -> bool {
        message.participant == Participant::AutomatedResponder
            && !self.is_welcome(message.participant, &message.body)
    }

    /// Picks the scripted reply for a user's message.
    pub fn reply_for(&self, user_text: &str) -> &'static str {
        let text = user_text.to_lowercase();
        SCRIPT
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| text.contains(k)))
            .map(|(_, reply)| *reply)
            .unwrap_or(FALLBACK)
    }
}

impl Default for Responder {
    fn default() -> Self {
        Self::new(DEFAULT_RESPONDER_ID)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::models::MessageId;

    fn bot_message(body: &str) -> Message {
        Message {
            id: MessageId::from("b1"),
            conversation_id: "c".into(),
            participant: Participant::AutomatedResponder,
            body: body.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn keywords_pick_scripted_replies() {
        let r = Responder::default();
        assert!(r.reply_for("What's my BALANCE?").contains("account balance"));
        assert!(r.reply_for("I lost my debit card").contains("1-800-RON-STONE"));
        assert!(r.reply_for("activate me please").contains("24-48 hours"));
        assert_eq!(r.reply_for("zzz"), FALLBACK);
    }

    #[test]
    fn earlier_table_entries_win() {
        // "send money" also contains "money", which is matched first.
        let r = Responder::default();
        assert!(r.reply_for("send money").contains("account balance"));
    }

    #[test]
    fn hello_reply_is_not_mistaken_for_welcome() {
        let r = Responder::default();
        let hello = r.reply_for("hello");
        assert!(hello.starts_with("Hello! I'm Ron Stone Bot"));
        assert!(r.is_auto_reply(&bot_message(hello)));
        assert!(!r.is_auto_reply(&bot_message(r.welcome_text())));
    }
}
