//! Context assembly: system priming + channel history, shaped for a chat completion.

use crate::error::Result;
use crate::messaging::ChatPlatformDyn;
use crate::messaging::traits::HistoryMessage;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role/content pair sent to the completion backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
}

impl ConversationMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Number of priming entries at the head of every assembled context.
pub const PRIMING_LEN: usize = 2;

/// Builds ordered message sequences from channel history.
pub struct ContextAssembler {
    platform: Arc<dyn ChatPlatformDyn>,
    error_marker: String,
    token_ceiling: Option<usize>,
}

impl ContextAssembler {
    pub fn new(platform: Arc<dyn ChatPlatformDyn>, error_marker: impl Into<String>) -> Self {
        Self {
            platform,
            error_marker: error_marker.into(),
            token_ceiling: None,
        }
    }

    /// Drop the oldest history once the estimated token count passes `ceiling`.
    pub fn with_token_ceiling(mut self, ceiling: Option<usize>) -> Self {
        self.token_ceiling = ceiling;
        self
    }

    /// Fetch recent channel history and assemble it oldest-first behind the
    /// two priming entries.
    ///
    /// The system context is sent twice: once as the system turn and again as
    /// the first user turn, because some backends underweight system content.
    pub async fn build_context(
        &self,
        channel_id: &str,
        system_context: &str,
        history_limit: usize,
    ) -> Result<Vec<ConversationMessage>> {
        let history = self
            .platform
            .channel_history(channel_id, history_limit)
            .await
            .with_context(|| format!("failed to fetch history for channel {channel_id}"))?;

        let fetched = history.len();
        let messages = assemble(system_context, history, &self.error_marker);

        tracing::debug!(
            channel_id,
            fetched,
            assembled = messages.len(),
            "assembled conversation context"
        );

        Ok(messages)
    }

    /// Full request context for one triggering message: history, the trailing
    /// user turn, then trimming to the token ceiling.
    pub async fn build_turn_context(
        &self,
        channel_id: &str,
        system_context: &str,
        history_limit: usize,
        raw_text: &str,
        prompt: &str,
    ) -> Result<Vec<ConversationMessage>> {
        let mut messages = self
            .build_context(channel_id, system_context, history_limit)
            .await?;
        push_user_turn(&mut messages, raw_text, prompt);

        if let Some(ceiling) = self.token_ceiling {
            trim_to_ceiling(&mut messages, ceiling);
        }
        Ok(messages)
    }
}

/// Shape newest-first platform history into the priming entries followed by
/// oldest-first turns, skipping error replies.
pub fn assemble(
    system_context: &str,
    newest_first: Vec<HistoryMessage>,
    error_marker: &str,
) -> Vec<ConversationMessage> {
    let mut messages = Vec::with_capacity(newest_first.len() + PRIMING_LEN);
    messages.push(ConversationMessage::system(system_context));
    messages.push(ConversationMessage::user(system_context));

    messages.extend(
        newest_first
            .into_iter()
            .rev()
            .filter(|message| !message.text.starts_with(error_marker))
            .map(|message| {
                if message.is_bot {
                    ConversationMessage::assistant(message.text)
                } else {
                    ConversationMessage::user(message.text)
                }
            }),
    );

    messages
}

/// Append the triggering message as the final user turn unless the fetched
/// history already ends with it.
pub fn push_user_turn(messages: &mut Vec<ConversationMessage>, raw_text: &str, prompt: &str) {
    let already_present = messages.len() > PRIMING_LEN
        && messages.last().is_some_and(|last| {
            last.role == Role::User && (last.content == raw_text || last.content == prompt)
        });
    if !already_present {
        messages.push(ConversationMessage::user(prompt));
    }
}

/// Rough token estimate: four characters per token, rounded up.
pub fn estimate_tokens(messages: &[ConversationMessage]) -> usize {
    messages
        .iter()
        .map(|message| message.content.chars().count().div_ceil(4))
        .sum()
}

/// Drop history entries oldest-first until the estimate fits. The priming
/// entries and the final user turn are always kept.
fn trim_to_ceiling(messages: &mut Vec<ConversationMessage>, ceiling: usize) {
    let mut dropped = 0;
    while messages.len() > PRIMING_LEN + 1 && estimate_tokens(messages) > ceiling {
        messages.remove(PRIMING_LEN);
        dropped += 1;
    }
    if dropped > 0 {
        tracing::debug!(dropped, ceiling, "trimmed oldest history to fit token ceiling");
    }
}
