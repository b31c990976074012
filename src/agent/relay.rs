//! Relay: turns inbound chat events into model replies.
//!
//! Each event runs classify → assemble → dispatch → post in its own task.
//! Every failure past classification is rendered into a reply; nothing
//! escapes the per-event boundary.

use crate::agent::classifier::{ChannelClassification, ChannelClassifier, Classification};
use crate::cache::ExpiringCache;
use crate::config::Config;
use crate::conversation::context::ContextAssembler;
use crate::error::{Error, LlmError, Result};
use crate::llm::backend::{AssistantBackend, CompletionBackend};
use crate::llm::dispatch::{Dispatcher, Sampling};
use crate::llm::routing::BackendKind;
use crate::messaging::ChatPlatformDyn;
use crate::messaging::traits::InboundStream;
use crate::{EventKind, InboundEvent};

use futures::StreamExt as _;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Per-event relay settings.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Channel history to fetch; 0 is the platform default page.
    pub history_limit: usize,
    /// Prefix of every error reply.
    pub error_marker: String,
    /// Model for direct mentions.
    pub default_model: String,
}

/// Wires the classifier, assembler and dispatcher to a chat platform.
pub struct Relay {
    platform: Arc<dyn ChatPlatformDyn>,
    classifier: ChannelClassifier,
    assembler: ContextAssembler,
    dispatcher: Dispatcher,
    settings: RelaySettings,
}

impl Relay {
    pub fn new(
        platform: Arc<dyn ChatPlatformDyn>,
        classifier: ChannelClassifier,
        assembler: ContextAssembler,
        dispatcher: Dispatcher,
        settings: RelaySettings,
    ) -> Self {
        Self {
            platform,
            classifier,
            assembler,
            dispatcher,
            settings,
        }
    }

    /// Build a relay and its caches from configuration.
    pub fn from_config(
        config: &Config,
        platform: Arc<dyn ChatPlatformDyn>,
        completions: Arc<dyn CompletionBackend>,
        assistants: Arc<dyn AssistantBackend>,
    ) -> Result<Self> {
        let max_entries = config.cache.max_entries;
        let ttl = config.cache.ttl();

        let classifier = ChannelClassifier::new(
            platform.clone(),
            config.routing_table()?,
            ExpiringCache::new(max_entries, ttl),
            ExpiringCache::new(max_entries, ttl),
        );
        let assembler = ContextAssembler::new(platform.clone(), config.relay.error_marker.clone())
            .with_token_ceiling(config.relay.context_token_ceiling);
        let dispatcher = Dispatcher::new(
            completions,
            assistants,
            ExpiringCache::new(max_entries, ttl),
            Sampling::from(&config.llm),
            config.assistant,
        );

        Ok(Self::new(
            platform,
            classifier,
            assembler,
            dispatcher,
            RelaySettings {
                history_limit: config.relay.history_limit,
                error_marker: config.relay.error_marker.clone(),
                default_model: config.llm.default_model.clone(),
            },
        ))
    }

    /// Consume the event stream until it ends or `shutdown` fires, handling
    /// each event in its own task. In-flight events are cancelled on shutdown.
    pub async fn run(self: Arc<Self>, mut events: InboundStream, shutdown: CancellationToken) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(in_flight = tasks.len(), "relay shutting down");
                    break;
                }
                Some(result) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(error) = result {
                        tracing::error!(%error, "event task panicked");
                    }
                }
                event = events.next() => {
                    let Some(event) = event else {
                        tracing::info!("inbound event stream ended");
                        break;
                    };
                    let relay = self.clone();
                    let cancel = shutdown.child_token();
                    tasks.spawn(async move { relay.handle_event(event, cancel).await });
                }
            }
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(error) = result {
                tracing::error!(%error, "event task panicked");
            }
        }
    }

    /// Handle one inbound event end to end.
    #[tracing::instrument(skip(self, event, cancel), fields(channel_id = %event.channel_id, user_id = %event.user_id, kind = %event.kind, event_id = %event.id))]
    pub async fn handle_event(&self, event: InboundEvent, cancel: CancellationToken) {
        let classification = match event.kind {
            EventKind::Mention => Arc::new(ChannelClassification::direct(
                event.channel_id.clone(),
                &self.settings.default_model,
            )),
            EventKind::Message => match self.classifier.classify(&event.channel_id).await {
                Ok(Classification::Classified(classification)) => classification,
                Ok(Classification::NotApplicable) => return,
                Err(error) => {
                    tracing::warn!(%error, "channel classification failed, dropping event");
                    return;
                }
            },
        };

        let reply = match self.reply_for(&event, &classification, &cancel).await {
            Ok(reply) => reply,
            Err(Error::Llm(LlmError::Cancelled)) => {
                tracing::debug!("event cancelled before a reply was ready");
                return;
            }
            Err(error) => {
                tracing::warn!(%error, "replying with error message");
                error.render(&self.settings.error_marker)
            }
        };

        if reply.trim().is_empty() {
            tracing::warn!("model returned an empty reply, nothing to post");
            return;
        }

        if let Err(error) = self
            .platform
            .post_message(&event.channel_id, event.reply_thread_ts.as_deref(), &reply)
            .await
        {
            tracing::error!(%error, "failed to post reply");
        }
    }

    async fn reply_for(
        &self,
        event: &InboundEvent,
        classification: &ChannelClassification,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let context = match classification.backend.kind() {
            BackendKind::ChatModel => {
                self.assembler
                    .build_turn_context(
                        &event.channel_id,
                        &classification.system_context,
                        self.settings.history_limit,
                        &event.text,
                        &event.prompt,
                    )
                    .await?
            }
            BackendKind::ToolAssistant => Vec::new(),
        };

        Ok(self
            .dispatcher
            .dispatch(classification, context, &event.prompt, cancel)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AssistantPollConfig, AssistantSettings, ModelPrefix, RoutingSettings};
    use crate::conversation::ConversationMessage;
    use crate::llm::backend::RunStatus;
    use crate::llm::dispatch::testing::{FakeAssistants, FakeCompletions};
    use crate::llm::routing::RoutingTable;
    use crate::messaging::testing::{FakePlatform, bot, user};
    use std::time::Duration;

    const MARKER: &str = "[relay-error]";

    struct Harness {
        relay: Arc<Relay>,
        platform: Arc<FakePlatform>,
        completions: Arc<FakeCompletions>,
    }

    fn harness(platform: FakePlatform, completions: FakeCompletions) -> Harness {
        let platform = Arc::new(platform);
        let completions = Arc::new(completions);
        let assistants = Arc::new(FakeAssistants::with_statuses(vec![RunStatus::Completed], "done"));
        let ttl = Duration::from_secs(600);

        let routing = RoutingTable::from_settings(
            &RoutingSettings {
                chat_prefixes: vec!["gpt_".into(), "gpt4_".into()],
                assistant_prefixes: vec!["code_".into()],
                model_prefixes: vec![ModelPrefix {
                    prefix: "gpt4_".into(),
                    model: "gpt-4-turbo".into(),
                }],
                assistants: vec![AssistantSettings {
                    keyword: "python".into(),
                    assistant_id: "asst_python".into(),
                }],
            },
            "gpt-3.5-turbo",
        )
        .unwrap();

        let relay = Relay::new(
            platform.clone(),
            ChannelClassifier::new(
                platform.clone(),
                routing,
                ExpiringCache::new(16, ttl),
                ExpiringCache::new(16, ttl),
            ),
            ContextAssembler::new(platform.clone(), MARKER),
            Dispatcher::new(
                completions.clone(),
                assistants,
                ExpiringCache::new(16, ttl),
                Sampling {
                    max_tokens: None,
                    temperature: 0.5,
                },
                AssistantPollConfig::default(),
            ),
            RelaySettings {
                history_limit: 20,
                error_marker: MARKER.into(),
                default_model: "gpt-3.5-turbo".into(),
            },
        );

        Harness {
            relay: Arc::new(relay),
            platform,
            completions,
        }
    }

    fn message(channel_id: &str, text: &str) -> InboundEvent {
        InboundEvent {
            id: "1700000000.000100".into(),
            kind: EventKind::Message,
            channel_id: channel_id.into(),
            user_id: "U1".into(),
            text: text.into(),
            prompt: text.into(),
            reply_thread_ts: None,
        }
    }

    fn mention(channel_id: &str, text: &str, prompt: &str) -> InboundEvent {
        InboundEvent {
            id: "1700000000.000200".into(),
            kind: EventKind::Mention,
            channel_id: channel_id.into(),
            user_id: "U1".into(),
            text: text.into(),
            prompt: prompt.into(),
            reply_thread_ts: Some("1700000000.000200".into()),
        }
    }

    #[tokio::test]
    async fn channel_message_gets_model_reply() {
        let h = harness(
            FakePlatform::default()
                .with_channel("C1", "gpt4_support", "API help", "internal")
                .with_history("C1", vec![user("hi"), bot("hello"), user("how do I page results?")]),
            FakeCompletions::replying("Use the cursor parameter."),
        );

        h.relay
            .handle_event(message("C1", "how do I page results?"), CancellationToken::new())
            .await;

        let requests = h.completions.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "gpt-4-turbo");
        assert_eq!(
            requests[0].messages,
            vec![
                ConversationMessage::system("API help. internal"),
                ConversationMessage::user("API help. internal"),
                ConversationMessage::user("hi"),
                ConversationMessage::assistant("hello"),
                ConversationMessage::user("how do I page results?"),
            ]
        );

        let posted = h.platform.posted();
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].channel_id, "C1");
        assert_eq!(posted[0].thread_ts, None);
        assert_eq!(posted[0].text, "Use the cursor parameter.");
    }

    #[tokio::test]
    async fn mention_skips_classification() {
        let h = harness(
            FakePlatform::default().with_history("C9", vec![user("<@UBOT> what is rust?")]),
            FakeCompletions::replying("A language."),
        );

        h.relay
            .handle_event(
                mention("C9", "<@UBOT> what is rust?", "what is rust?"),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(h.platform.info_calls(), 0);
        assert_eq!(h.platform.history_calls(), 1);

        let requests = h.completions.requests();
        assert_eq!(requests[0].model, "gpt-3.5-turbo");
        assert_eq!(requests[0].messages[0], ConversationMessage::system(""));
        assert_eq!(requests[0].messages[1], ConversationMessage::user(""));
        assert_eq!(requests[0].messages.len(), 3);

        let posted = h.platform.posted();
        assert_eq!(posted[0].thread_ts.as_deref(), Some("1700000000.000200"));
    }

    #[tokio::test]
    async fn out_of_scope_channel_is_ignored() {
        let h = harness(
            FakePlatform::default().with_channel("C2", "random", "", ""),
            FakeCompletions::replying("unused"),
        );

        h.relay.handle_event(message("C2", "hello"), CancellationToken::new()).await;
        h.relay.handle_event(message("C2", "again"), CancellationToken::new()).await;

        assert!(h.platform.posted().is_empty());
        assert!(h.completions.requests().is_empty());
        assert_eq!(h.platform.info_calls(), 1);
        assert_eq!(h.platform.history_calls(), 0);
    }

    #[tokio::test]
    async fn backend_failure_is_posted_with_marker() {
        let h = harness(
            FakePlatform::default().with_channel("C1", "gpt_chat", "", ""),
            FakeCompletions::failing(LlmError::BackendUnavailable {
                message: "API error (503): overloaded".into(),
                diagnostics: "HTTP 503".into(),
            }),
        );

        h.relay.handle_event(message("C1", "hi"), CancellationToken::new()).await;

        let posted = h.platform.posted();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].text.starts_with(MARKER));
        assert!(posted[0].text.contains("overloaded"));
        assert!(posted[0].text.contains("HTTP 503"));
    }

    #[tokio::test]
    async fn previous_error_replies_are_not_resubmitted() {
        let h = harness(
            FakePlatform::default()
                .with_channel("C1", "gpt_chat", "", "")
                .with_history(
                    "C1",
                    vec![
                        user("hi"),
                        bot("[relay-error] rate limited by the model backend: slow down"),
                        user("hi again"),
                    ],
                ),
            FakeCompletions::replying("ok"),
        );

        h.relay.handle_event(message("C1", "hi again"), CancellationToken::new()).await;

        let requests = h.completions.requests();
        assert!(
            requests[0]
                .messages
                .iter()
                .all(|message| !message.content.starts_with(MARKER))
        );
    }

    #[tokio::test]
    async fn classification_failure_drops_the_event() {
        let platform = FakePlatform::default().with_channel("C1", "gpt_chat", "", "");
        *platform.fail_info.lock().unwrap() = true;
        let h = harness(platform, FakeCompletions::replying("unused"));

        h.relay.handle_event(message("C1", "hi"), CancellationToken::new()).await;

        assert!(h.platform.posted().is_empty());
        assert!(h.completions.requests().is_empty());
    }

    #[tokio::test]
    async fn history_failure_is_reported_in_channel() {
        let platform = FakePlatform::default().with_channel("C1", "gpt_chat", "", "");
        *platform.fail_history.lock().unwrap() = true;
        let h = harness(platform, FakeCompletions::replying("unused"));

        h.relay.handle_event(message("C1", "hi"), CancellationToken::new()).await;

        let posted = h.platform.posted();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].text.starts_with(MARKER));
        assert!(posted[0].text.contains("failed to fetch history"));
    }

    #[tokio::test]
    async fn unresolved_assistant_replies_with_error() {
        let h = harness(
            FakePlatform::default().with_channel("C3", "code_misc", "general", "stuff"),
            FakeCompletions::replying("unused"),
        );

        h.relay.handle_event(message("C3", "hi"), CancellationToken::new()).await;

        let posted = h.platform.posted();
        assert_eq!(posted.len(), 1);
        assert!(posted[0].text.starts_with(MARKER));
        assert!(posted[0].text.contains("no assistant"));
        assert_eq!(h.platform.history_calls(), 0);
    }

    #[tokio::test]
    async fn assistant_channel_posts_run_output() {
        let h = harness(
            FakePlatform::default().with_channel("C4", "code_python", "python", "scripts"),
            FakeCompletions::replying("unused"),
        );

        h.relay.handle_event(message("C4", "sum 1..10"), CancellationToken::new()).await;

        assert_eq!(h.platform.posted()[0].text, "done");
        assert!(h.completions.requests().is_empty());
    }

    #[tokio::test]
    async fn cancelled_event_posts_nothing() {
        let h = harness(
            FakePlatform::default().with_channel("C1", "gpt_chat", "", ""),
            FakeCompletions::replying("late"),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        h.relay.handle_event(message("C1", "hi"), cancel).await;

        assert!(h.platform.posted().is_empty());
    }

    #[tokio::test]
    async fn run_processes_every_event_until_stream_ends() {
        let h = harness(
            FakePlatform::default().with_channel("C1", "gpt_chat", "", ""),
            FakeCompletions::replying("pong"),
        );
        let events: InboundStream = Box::pin(futures::stream::iter(vec![
            message("C1", "ping"),
            mention("C7", "<@UBOT> ping", "ping"),
        ]));

        h.relay.clone().run(events, CancellationToken::new()).await;

        let posted = h.platform.posted();
        assert_eq!(posted.len(), 2);
        assert!(posted.iter().all(|message| message.text == "pong"));
    }
}
