//! Channel classification: decides whether a channel gets model replies,
//! which backend serves it, and the system context that primes it.

use crate::ChannelId;
use crate::cache::ExpiringCache;
use crate::error::Result;
use crate::llm::routing::{BackendKind, RouteMatch, RoutingTable};
use crate::messaging::ChatPlatformDyn;

use anyhow::Context as _;
use std::sync::Arc;

/// Backend selection for a classified channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    ChatModel { model: String },
    /// `assistant_id` is `None` when no topic keyword matched; dispatch reports it.
    ToolAssistant { assistant_id: Option<String> },
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::ChatModel { .. } => BackendKind::ChatModel,
            Backend::ToolAssistant { .. } => BackendKind::ToolAssistant,
        }
    }

    pub fn model_name(&self) -> Option<&str> {
        match self {
            Backend::ChatModel { model } => Some(model.as_str()),
            Backend::ToolAssistant { .. } => None,
        }
    }

    pub fn assistant_id(&self) -> Option<&str> {
        match self {
            Backend::ChatModel { .. } => None,
            Backend::ToolAssistant { assistant_id } => assistant_id.as_deref(),
        }
    }
}

impl From<RouteMatch> for Backend {
    fn from(route: RouteMatch) -> Self {
        match route {
            RouteMatch::ChatModel { model } => Backend::ChatModel { model },
            RouteMatch::ToolAssistant { assistant_id } => Backend::ToolAssistant { assistant_id },
        }
    }
}

/// Resolved decision for one channel. Immutable once cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelClassification {
    pub channel_id: ChannelId,
    pub enabled: bool,
    pub backend: Backend,
    /// `"{topic}. {purpose}"` of the channel; empty for direct mentions.
    pub system_context: String,
}

impl ChannelClassification {
    /// Classification for a direct mention or DM: always in scope, default
    /// model, no system context, no channel lookup.
    pub fn direct(channel_id: ChannelId, default_model: &str) -> Self {
        Self {
            channel_id,
            enabled: true,
            backend: Backend::ChatModel {
                model: default_model.to_string(),
            },
            system_context: String::new(),
        }
    }
}

/// Result of classifying a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Classified(Arc<ChannelClassification>),
    NotApplicable,
}

/// Classifies channels by name, consulting a TTL cache first and the chat
/// platform's channel metadata on a miss.
pub struct ChannelClassifier {
    platform: Arc<dyn ChatPlatformDyn>,
    routing: RoutingTable,
    cache: ExpiringCache<Arc<ChannelClassification>>,
    /// Channels already confirmed out of scope.
    not_applicable: ExpiringCache<()>,
}

impl ChannelClassifier {
    pub fn new(
        platform: Arc<dyn ChatPlatformDyn>,
        routing: RoutingTable,
        cache: ExpiringCache<Arc<ChannelClassification>>,
        not_applicable: ExpiringCache<()>,
    ) -> Self {
        Self {
            platform,
            routing,
            cache,
            not_applicable,
        }
    }

    /// Join a channel without holding up classification. A failed join is
    /// only logged.
    fn join_in_background(&self, channel_id: &str, channel_name: &str) {
        let platform = self.platform.clone();
        let channel_id = channel_id.to_string();
        let channel_name = channel_name.to_string();
        tokio::spawn(async move {
            match platform.join_channel(&channel_id).await {
                Ok(()) => tracing::info!(%channel_id, %channel_name, "joined channel"),
                Err(error) => {
                    tracing::warn!(%channel_id, %channel_name, %error, "failed to join channel")
                }
            }
        });
    }

    /// Classify `channel_id`.
    ///
    /// A metadata lookup failure is returned as an error and nothing is
    /// memoised, so the next event in the channel retries the lookup.
    pub async fn classify(&self, channel_id: &str) -> Result<Classification> {
        if let Some(classification) = self.cache.get(channel_id) {
            return Ok(Classification::Classified(classification));
        }
        if self.not_applicable.contains(channel_id) {
            return Ok(Classification::NotApplicable);
        }

        let info = self
            .platform
            .channel_info(channel_id)
            .await
            .with_context(|| format!("failed to fetch metadata for channel {channel_id}"))?;

        if !info.is_member {
            self.join_in_background(channel_id, &info.name);
        }

        let system_context = format!("{}. {}", info.topic, info.purpose);

        let Some(route) = self.routing.resolve(&info.name, &system_context) else {
            tracing::debug!(channel_id, channel_name = %info.name, "channel is not routed to a model");
            self.not_applicable.set(channel_id, ());
            return Ok(Classification::NotApplicable);
        };

        let classification = Arc::new(ChannelClassification {
            channel_id: channel_id.into(),
            enabled: true,
            backend: route.into(),
            system_context,
        });

        tracing::info!(
            channel_id,
            channel_name = %info.name,
            backend = ?classification.backend,
            "classified channel"
        );

        self.cache.set(channel_id, classification.clone());
        Ok(Classification::Classified(classification))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::config::RoutingSettings;
    use crate::config::{AssistantSettings, ModelPrefix};
    use crate::messaging::testing::FakePlatform;
    use std::time::Duration;

    fn routing() -> RoutingTable {
        let settings = RoutingSettings {
            chat_prefixes: vec!["chatgpt_".into(), "gpt_".into(), "gpt4_".into()],
            assistant_prefixes: vec!["code_".into(), "assist_".into()],
            model_prefixes: vec![ModelPrefix {
                prefix: "gpt4_".into(),
                model: "gpt-4-turbo".into(),
            }],
            assistants: vec![AssistantSettings {
                keyword: "python".into(),
                assistant_id: "asst_python".into(),
            }],
        };
        RoutingTable::from_settings(&settings, "gpt-3.5-turbo").unwrap()
    }

    fn classifier(platform: FakePlatform) -> (ChannelClassifier, Arc<FakePlatform>, Arc<ManualClock>) {
        let platform = Arc::new(platform);
        let clock = ManualClock::new();
        let ttl = Duration::from_secs(600);
        let classifier = ChannelClassifier::new(
            platform.clone(),
            routing(),
            ExpiringCache::with_clock(16, ttl, clock.clone()),
            ExpiringCache::with_clock(16, ttl, clock.clone()),
        );
        (classifier, platform, clock)
    }

    fn classified(outcome: Classification) -> Arc<ChannelClassification> {
        match outcome {
            Classification::Classified(classification) => classification,
            Classification::NotApplicable => panic!("expected a classification"),
        }
    }

    #[tokio::test]
    async fn pinned_model_channel_gets_topic_and_purpose_context() {
        let (classifier, _platform, _clock) = classifier(
            FakePlatform::default().with_channel("C1", "gpt4_support", "API help", "internal"),
        );

        let classification = classified(classifier.classify("C1").await.unwrap());

        assert_eq!(classification.backend.kind(), BackendKind::ChatModel);
        assert_eq!(classification.backend.model_name(), Some("gpt-4-turbo"));
        assert!(classification.backend.model_name().unwrap().starts_with("gpt-4-"));
        assert_eq!(classification.system_context, "API help. internal");
        assert!(classification.enabled);
    }

    #[tokio::test]
    async fn assistant_channel_resolves_assistant_from_topic() {
        let (classifier, _platform, _clock) = classifier(
            FakePlatform::default().with_channel("C2", "code_python", "python scripts", "help"),
        );

        let classification = classified(classifier.classify("C2").await.unwrap());

        assert_eq!(classification.backend.kind(), BackendKind::ToolAssistant);
        assert_eq!(classification.backend.assistant_id(), Some("asst_python"));
    }

    #[tokio::test]
    async fn unmatched_channel_is_memoised() {
        let (classifier, platform, _clock) =
            classifier(FakePlatform::default().with_channel("C3", "random", "", ""));

        assert_eq!(classifier.classify("C3").await.unwrap(), Classification::NotApplicable);
        assert_eq!(classifier.classify("C3").await.unwrap(), Classification::NotApplicable);

        assert_eq!(platform.info_calls(), 1);
    }

    #[tokio::test]
    async fn second_call_within_ttl_hits_cache() {
        let (classifier, platform, clock) =
            classifier(FakePlatform::default().with_channel("C1", "gpt_chat", "t", "p"));

        let first = classified(classifier.classify("C1").await.unwrap());
        clock.advance(Duration::from_secs(600));
        let second = classified(classifier.classify("C1").await.unwrap());

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(platform.info_calls(), 1);

        clock.advance(Duration::from_secs(1));
        classifier.classify("C1").await.unwrap();
        assert_eq!(platform.info_calls(), 2, "expired entry triggers a fresh lookup");
    }

    #[tokio::test]
    async fn joins_channels_it_is_not_a_member_of() {
        let platform = FakePlatform::default()
            .with_channel("C1", "gpt_chat", "", "")
            .not_member_of("C1");
        *platform.fail_join.lock().unwrap() = true;
        let (classifier, platform, _clock) = classifier(platform);

        let outcome = classifier.classify("C1").await.unwrap();
        assert!(matches!(outcome, Classification::Classified(_)));

        for _ in 0..10 {
            if !platform.joined.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(*platform.joined.lock().unwrap(), vec!["C1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_join_does_not_delay_classification() {
        let platform = FakePlatform::default()
            .with_channel("C1", "gpt_chat", "", "")
            .not_member_of("C1")
            .with_join_delay(Duration::from_secs(30));
        let (classifier, _platform, _clock) = classifier(platform);
        let started = tokio::time::Instant::now();

        let outcome = classifier.classify("C1").await.unwrap();

        assert!(matches!(outcome, Classification::Classified(_)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn members_are_not_rejoined() {
        let (classifier, platform, _clock) =
            classifier(FakePlatform::default().with_channel("C1", "gpt_chat", "", ""));

        classifier.classify("C1").await.unwrap();

        assert!(platform.joined.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookup_failure_is_an_error_and_not_memoised() {
        let platform = FakePlatform::default().with_channel("C1", "gpt_chat", "", "");
        *platform.fail_info.lock().unwrap() = true;
        let (classifier, platform, _clock) = classifier(platform);

        let error = classifier.classify("C1").await.unwrap_err();
        assert!(error.to_string().contains("C1"));

        *platform.fail_info.lock().unwrap() = false;
        let outcome = classifier.classify("C1").await.unwrap();
        assert!(matches!(outcome, Classification::Classified(_)));
        assert_eq!(platform.info_calls(), 2);
    }

    #[tokio::test]
    async fn unresolved_assistant_is_still_classified() {
        let (classifier, _platform, _clock) = classifier(
            FakePlatform::default().with_channel("C4", "assist_general", "anything", "goes"),
        );

        let classification = classified(classifier.classify("C4").await.unwrap());

        assert_eq!(
            classification.backend,
            Backend::ToolAssistant { assistant_id: None }
        );
    }

    #[test]
    fn direct_classification_uses_default_model_and_empty_context() {
        let classification = ChannelClassification::direct("D1".into(), "gpt-3.5-turbo");
        assert_eq!(classification.backend.model_name(), Some("gpt-3.5-turbo"));
        assert!(classification.system_context.is_empty());
    }
}
