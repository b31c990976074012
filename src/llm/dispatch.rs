//! Completion dispatch: routes a classified request to the chat backend or
//! drives an assistant run to completion.

use crate::agent::classifier::{Backend, ChannelClassification};
use crate::cache::ExpiringCache;
use crate::config::{AssistantPollConfig, LlmConfig};
use crate::conversation::ConversationMessage;
use crate::error::LlmError;
use crate::llm::backend::{AssistantBackend, ChatRequest, CompletionBackend, RunStatus};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sampling parameters for chat completions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub max_tokens: Option<u32>,
    pub temperature: f32,
}

impl From<&LlmConfig> for Sampling {
    fn from(config: &LlmConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }
}

/// Invokes the completion backends.
pub struct Dispatcher {
    completions: Arc<dyn CompletionBackend>,
    assistants: Arc<dyn AssistantBackend>,
    /// Assistant thread per channel, so later turns continue the same thread.
    threads: ExpiringCache<String>,
    /// One lock per assistant channel, held from thread lookup until the run
    /// finishes. A thread accepts no new message while a run is active.
    channel_turns: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    sampling: Sampling,
    poll_interval: Duration,
    poll_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        completions: Arc<dyn CompletionBackend>,
        assistants: Arc<dyn AssistantBackend>,
        threads: ExpiringCache<String>,
        sampling: Sampling,
        poll: AssistantPollConfig,
    ) -> Self {
        Self {
            completions,
            assistants,
            threads,
            channel_turns: Mutex::new(HashMap::new()),
            sampling,
            poll_interval: poll.poll_interval(),
            poll_timeout: poll.timeout(),
        }
    }

    /// Produce a reply for `prompt` in a classified channel.
    ///
    /// `context` is the assembled conversation (ending with the user turn) and
    /// is only used by the chat backend; assistant threads carry their own
    /// history. Cancelling `cancel` abandons the request, including any poll
    /// loop in progress, without cancelling the remote run.
    pub async fn dispatch(
        &self,
        classification: &ChannelClassification,
        context: Vec<ConversationMessage>,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            result = self.dispatch_inner(classification, context, prompt) => result,
        }
    }

    async fn dispatch_inner(
        &self,
        classification: &ChannelClassification,
        context: Vec<ConversationMessage>,
        prompt: &str,
    ) -> Result<String, LlmError> {
        match &classification.backend {
            Backend::ChatModel { model } => self.complete_chat(model, context).await,
            Backend::ToolAssistant { assistant_id: None } => Err(LlmError::AssistantUnresolved {
                channel_id: classification.channel_id.to_string(),
            }),
            Backend::ToolAssistant {
                assistant_id: Some(assistant_id),
            } => {
                self.run_assistant(
                    &classification.channel_id,
                    assistant_id,
                    &classification.system_context,
                    prompt,
                )
                .await
            }
        }
    }

    /// One synchronous chat completion.
    pub async fn complete_chat(
        &self,
        model: &str,
        messages: Vec<ConversationMessage>,
    ) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: model.to_string(),
            messages,
            max_tokens: self.sampling.max_tokens,
            temperature: self.sampling.temperature,
        };

        tracing::debug!(model, message_count = request.messages.len(), "requesting chat completion");
        let reply = self.completions.chat_completion(&request).await;
        if let Err(error) = &reply {
            tracing::warn!(model, %error, "chat completion failed");
        }
        reply
    }

    /// Lock guarding assistant turns in `channel_id`. Locks no other task
    /// holds are pruned on the way.
    fn channel_turn(&self, channel_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut turns = self
            .channel_turns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        turns.retain(|channel, lock| channel == channel_id || Arc::strong_count(lock) > 1);
        turns.entry(channel_id.to_string()).or_default().clone()
    }

    /// Post the prompt to the channel's thread, start a run, and poll it until
    /// it finishes or the timeout ceiling passes. Turns in one channel run one
    /// at a time.
    async fn run_assistant(
        &self,
        channel_id: &str,
        assistant_id: &str,
        system_context: &str,
        prompt: &str,
    ) -> Result<String, LlmError> {
        let turn = self.channel_turn(channel_id);
        let _turn = turn.lock().await;

        let thread_id = match self.threads.get(channel_id) {
            Some(thread_id) => thread_id,
            None => {
                let thread_id = self.assistants.create_thread().await?;
                tracing::info!(channel_id, %thread_id, "created assistant thread");
                self.threads.set(channel_id, thread_id.clone());
                thread_id
            }
        };

        self.assistants.add_user_message(&thread_id, prompt).await?;
        let run = self
            .assistants
            .create_run(&thread_id, assistant_id, Some(system_context))
            .await?;
        tracing::info!(channel_id, %thread_id, run_id = %run.run_id, assistant_id, "assistant run created");

        let started = tokio::time::Instant::now();
        let mut polls = 0usize;
        loop {
            let current = self.assistants.get_run(&thread_id, &run.run_id).await?;
            polls += 1;
            tracing::debug!(run_id = %run.run_id, status = %current.status, polls, "polled assistant run");

            match current.status {
                RunStatus::Completed => {
                    return self.assistants.latest_message_text(&thread_id).await;
                }
                status if status.is_terminal() => {
                    tracing::warn!(run_id = %run.run_id, %status, polls, "assistant run did not complete");
                    return Err(LlmError::AssistantTerminalFailure {
                        status: status.to_string(),
                    });
                }
                _ => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= self.poll_timeout {
                tracing::warn!(run_id = %run.run_id, polls, elapsed_secs = elapsed.as_secs(), "assistant run timed out");
                return Err(LlmError::AssistantTimeout {
                    run_id: run.run_id,
                    elapsed,
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
