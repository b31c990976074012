//! Channel routing rules: which backend and model a channel name selects.
//!
//! Rules are evaluated in order, first match wins. Resolution is a pure
//! function of the channel name and its topic/purpose text.

use crate::config::RoutingSettings;
use crate::error::ConfigError;

/// Backend family a channel is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    ChatModel,
    ToolAssistant,
}

/// Keyword that selects a tool assistant when found in a channel's topic or purpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantKeyword {
    pub keyword: String,
    pub assistant_id: String,
}

/// What a matching rule routes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    /// Chat completion; `None` means the configured default model.
    ChatModel { model: Option<String> },
    /// Tool assistant chosen by scanning topic/purpose for keywords.
    ToolAssistant { assistants: Vec<AssistantKeyword> },
}

/// One entry of the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRule {
    /// Lowercased channel-name prefix.
    pub prefix: String,
    pub target: RuleTarget,
}

/// Outcome of a successful rule match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMatch {
    ChatModel { model: String },
    /// `assistant_id` is `None` when no keyword matched.
    ToolAssistant { assistant_id: Option<String> },
}

impl RouteMatch {
    pub fn kind(&self) -> BackendKind {
        match self {
            RouteMatch::ChatModel { .. } => BackendKind::ChatModel,
            RouteMatch::ToolAssistant { .. } => BackendKind::ToolAssistant,
        }
    }
}

/// Ordered routing table plus the default chat model.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    rules: Vec<ChannelRule>,
    default_model: String,
}

impl RoutingTable {
    fn new(rules: Vec<ChannelRule>, default_model: impl Into<String>) -> Self {
        Self {
            rules,
            default_model: default_model.into(),
        }
    }

    /// Build the table from configuration.
    ///
    /// Chat prefixes come first in configured order, each carrying its pinned
    /// model if one is configured; assistant prefixes follow. The two prefix
    /// sets must be disjoint and every pinned-model prefix must be a chat prefix.
    pub fn from_settings(
        settings: &RoutingSettings,
        default_model: &str,
    ) -> std::result::Result<Self, ConfigError> {
        let chat: Vec<String> = settings
            .chat_prefixes
            .iter()
            .map(|prefix| prefix.to_lowercase())
            .collect();
        let assistant: Vec<String> = settings
            .assistant_prefixes
            .iter()
            .map(|prefix| prefix.to_lowercase())
            .collect();

        if let Some(overlap) = chat.iter().find(|prefix| assistant.contains(prefix)) {
            return Err(ConfigError::Invalid(format!(
                "channel prefix '{overlap}' is both a chat and an assistant prefix"
            )));
        }
        if let Some(empty) = chat.iter().chain(&assistant).find(|prefix| prefix.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "channel prefixes must not be empty (got '{empty}')"
            )));
        }

        for pinned in &settings.model_prefixes {
            if !chat.contains(&pinned.prefix.to_lowercase()) {
                return Err(ConfigError::Invalid(format!(
                    "model prefix '{}' is not one of the chat prefixes",
                    pinned.prefix
                )));
            }
        }

        let assistants: Vec<AssistantKeyword> = settings
            .assistants
            .iter()
            .map(|entry| AssistantKeyword {
                keyword: entry.keyword.to_lowercase(),
                assistant_id: entry.assistant_id.clone(),
            })
            .collect();

        let mut rules = Vec::with_capacity(chat.len() + assistant.len());
        for prefix in chat {
            let model = settings
                .model_prefixes
                .iter()
                .find(|pinned| pinned.prefix.to_lowercase() == prefix)
                .map(|pinned| pinned.model.clone());
            rules.push(ChannelRule {
                prefix,
                target: RuleTarget::ChatModel { model },
            });
        }
        for prefix in assistant {
            rules.push(ChannelRule {
                prefix,
                target: RuleTarget::ToolAssistant {
                    assistants: assistants.clone(),
                },
            });
        }

        Ok(Self::new(rules, default_model))
    }

    /// Resolve a channel name and its composed topic/purpose text to a route.
    /// Returns `None` when no prefix matches.
    pub fn resolve(&self, channel_name: &str, context_text: &str) -> Option<RouteMatch> {
        let name = channel_name.to_lowercase();
        let rule = self.rules.iter().find(|rule| name.starts_with(&rule.prefix))?;

        Some(match &rule.target {
            RuleTarget::ChatModel { model } => RouteMatch::ChatModel {
                model: model.clone().unwrap_or_else(|| self.default_model.clone()),
            },
            RuleTarget::ToolAssistant { assistants } => {
                let text = context_text.to_lowercase();
                let assistant_id = assistants
                    .iter()
                    .find(|entry| text.contains(&entry.keyword))
                    .map(|entry| entry.assistant_id.clone());
                RouteMatch::ToolAssistant { assistant_id }
            }
        })
    }
}
