//! slackgpt: relays Slack conversations to a language model and posts the replies back.

pub mod agent;
pub mod cache;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod messaging;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Channel identifier type.
pub type ChannelId = Arc<str>;

/// Kind of inbound chat event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A message posted in a channel the bot can see.
    Message,
    /// The bot was addressed directly: an @-mention or a direct message.
    Mention,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Message => write!(f, "message"),
            EventKind::Mention => write!(f, "mention"),
        }
    }
}

/// Inbound event from the chat platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Platform message id (Slack `ts`).
    pub id: String,
    pub kind: EventKind,
    pub channel_id: ChannelId,
    pub user_id: String,
    /// Message text exactly as the platform delivered it.
    pub text: String,
    /// Text to send to the model, with any leading bot mention stripped.
    pub prompt: String,
    /// Thread to reply in. `None` posts at the channel top level.
    pub reply_thread_ts: Option<String>,
}
