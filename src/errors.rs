use thiserror::Error;

/// Errors surfaced by the chat subsystem.
///
/// None of these are fatal to the host application; every variant is scoped to
/// a single conversation view and recoverable by retry or by reopening the view.
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    // ── Store / API ──────────────────────────────────────────────────────────
    #[error("Chat service is currently unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    #[error("Failed to send message: {reason}")]
    WriteFailed { reason: String },

    // ── Realtime channel ─────────────────────────────────────────────────────
    #[error("Realtime subscription failed: {reason}")]
    SubscriptionFailed { reason: String },

    #[error("Malformed message payload: {reason}")]
    MalformedPayload { reason: String },

    // ── Validation ───────────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong { field_name: String, max_length: usize, actual_length: usize },

    // ── Session ──────────────────────────────────────────────────────────────
    #[error("No conversation is open")]
    NoActiveConversation,

    // ── Configuration ────────────────────────────────────────────────────────
    #[error("Invalid configuration for {key}: {reason}")]
    Config { key: String, reason: String },
}

impl ChatError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        ChatError::ServiceUnavailable { reason: reason.into() }
    }

    pub fn write_failed(reason: impl Into<String>) -> Self {
        ChatError::WriteFailed { reason: reason.into() }
    }

    pub fn subscription(reason: impl Into<String>) -> Self {
        ChatError::SubscriptionFailed { reason: reason.into() }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        ChatError::MalformedPayload { reason: reason.into() }
    }

    /// Blocking load failure; the view shows an error state with a retry button.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ChatError::ServiceUnavailable { .. })
    }

    /// Non-blocking send failure; the view shows a transient notice.
    pub fn is_write_failure(&self) -> bool {
        matches!(self, ChatError::WriteFailed { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ChatError::EmptyField { .. } | ChatError::FieldTooLong { .. })
    }
}
