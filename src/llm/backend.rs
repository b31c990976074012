//! Completion backend traits: synchronous chat completion and the
//! thread/run assistant API.

use crate::conversation::ConversationMessage;
use crate::error::LlmError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A single chat completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ConversationMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: f32,
}

/// Synchronous request/response chat completion.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Return the text of the top choice.
    async fn chat_completion(&self, request: &ChatRequest) -> Result<String, LlmError>;
}

/// Lifecycle status of an assistant run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    Cancelling,
    RequiresAction,
    Completed,
    Failed,
    Expired,
    Cancelled,
    Incomplete,
}

impl RunStatus {
    /// Whether the run will not change status again.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            RunStatus::Queued | RunStatus::InProgress | RunStatus::Cancelling
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::InProgress => "in_progress",
            RunStatus::Cancelling => "cancelling",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Expired => "expired",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Incomplete => "incomplete",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of an assistant run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantRun {
    pub thread_id: String,
    pub run_id: String,
    pub status: RunStatus,
}

/// Asynchronous assistant API: threads hold the conversation, runs execute it.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    async fn create_thread(&self) -> Result<String, LlmError>;

    async fn add_user_message(&self, thread_id: &str, text: &str) -> Result<(), LlmError>;

    async fn create_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
        additional_instructions: Option<&str>,
    ) -> Result<AssistantRun, LlmError>;

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<AssistantRun, LlmError>;

    /// Concatenated text segments of the most recent message in the thread.
    async fn latest_message_text(&self, thread_id: &str) -> Result<String, LlmError>;
}
