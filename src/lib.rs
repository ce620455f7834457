//! Conversation state for the bank support chat.
//!
//! The end-user widget and the admin console both open a [`session::ChatSession`]
//! over a conversation. The session keeps a deduplicated, ordered view through
//! the [`reconciler::Reconciler`], writes through a [`store::MessageStore`] and
//! listens on a [`realtime::PushChannel`].

pub mod config;
pub mod errors;
pub mod models;
pub mod realtime;
pub mod reconciler;
pub mod responder;
pub mod service;
pub mod session;
pub mod store;
