use std::time::Duration;

use crate::errors::ChatError;
use crate::responder::DEFAULT_RESPONDER_ID;
use crate::session::SessionConfig;

const DEFAULT_API_BASE_URL: &str = "http://localhost:3000";
const DEFAULT_THINKING_DELAY_MS: u64 = 1500;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 3;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Settings read from the environment (`.env` is loaded first by the binary).
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    pub api_base_url: String,
    /// Realtime websocket endpoint; without it sessions poll the REST store.
    pub realtime_url: Option<String>,
    pub realtime_api_key: Option<String>,
    pub responder_id: String,
    pub thinking_delay: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl ChatConfig {
    pub fn from_env() -> Result<Self, ChatError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ChatError> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| -> Result<u64, ChatError> {
            match non_empty(key) {
                Some(raw) => raw.trim().parse().map_err(|e| ChatError::Config {
                    key: key.to_string(),
                    reason: format!("'{raw}' is not a number: {e}"),
                }),
                None => Ok(default),
            }
        };

        let poll_secs = number("CHAT_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?;
        if poll_secs == 0 {
            return Err(ChatError::Config {
                key: "CHAT_POLL_INTERVAL_SECS".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            api_base_url: non_empty("CHAT_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string()),
            realtime_url: non_empty("CHAT_REALTIME_URL"),
            realtime_api_key: non_empty("CHAT_REALTIME_API_KEY"),
            responder_id: non_empty("CHAT_RESPONDER_ID")
                .unwrap_or_else(|| DEFAULT_RESPONDER_ID.to_string()),
            thinking_delay: Duration::from_millis(number(
                "CHAT_THINKING_DELAY_MS",
                DEFAULT_THINKING_DELAY_MS,
            )?),
            poll_interval: Duration::from_secs(poll_secs),
            request_timeout: Duration::from_secs(number(
                "CHAT_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?),
        })
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig { thinking_delay: self.thinking_delay, poll_interval: self.poll_interval }
    }
}
