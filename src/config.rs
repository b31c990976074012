//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use crate::llm::routing::RoutingTable;

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Environment prefix for overriding any config key, e.g. `SLACKGPT__LLM__DEFAULT_MODEL`.
const ENV_PREFIX: &str = "SLACKGPT";

/// slackgpt configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Slack credentials.
    pub slack: SlackConfig,

    /// Completion backend settings.
    pub llm: LlmConfig,

    /// Channel routing rules.
    pub routing: RoutingSettings,

    /// Classification cache sizing.
    pub cache: CacheConfig,

    /// Per-event relay behavior.
    pub relay: RelayConfig,

    /// Tool-assistant polling.
    pub assistant: AssistantPollConfig,
}

/// Slack credentials.
#[derive(Clone)]
pub struct SlackConfig {
    /// Bot token (`xoxb-`), used for Web API calls.
    pub bot_token: String,

    /// App-level token (`xapp-`), used to open the Socket Mode connection.
    pub app_token: String,
}

impl std::fmt::Debug for SlackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackConfig").finish_non_exhaustive()
    }
}

/// Completion backend settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Model used by plain chat channels and direct mentions.
    pub default_model: String,

    /// API key for the completion backend.
    pub api_key: String,

    /// Base URL of the OpenAI-compatible API.
    pub base_url: String,

    /// Completion length ceiling sent with each request.
    pub max_tokens: Option<u32>,

    /// Sampling temperature.
    pub temperature: f32,

    /// Per-request HTTP timeout.
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_model: "gpt-3.5-turbo".into(),
            api_key: String::new(),
            base_url: "https://api.openai.com".into(),
            max_tokens: None,
            temperature: 0.5,
            request_timeout_secs: 120,
        }
    }
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("default_model", &self.default_model)
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish_non_exhaustive()
    }
}

/// A chat prefix pinned to a specific model version.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ModelPrefix {
    pub prefix: String,
    pub model: String,
}

/// Keyword → assistant selection for tool-assistant channels.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AssistantSettings {
    pub keyword: String,
    pub assistant_id: String,
}

/// Channel-name prefix sets and assistant keywords.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    /// Prefixes routed to the chat completion backend, in match order.
    pub chat_prefixes: Vec<String>,

    /// Prefixes routed to the tool-assistant backend, in match order.
    pub assistant_prefixes: Vec<String>,

    /// Chat prefixes that select a specific model instead of the default.
    pub model_prefixes: Vec<ModelPrefix>,

    /// Ordered keyword table for picking an assistant from topic/purpose text.
    pub assistants: Vec<AssistantSettings>,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            chat_prefixes: vec!["chatgpt_".into(), "gpt_".into(), "gpt4_".into()],
            assistant_prefixes: vec!["code_".into(), "assist_".into()],
            model_prefixes: vec![ModelPrefix {
                prefix: "gpt4_".into(),
                model: "gpt-4-turbo".into(),
            }],
            assistants: Vec::new(),
        }
    }
}

/// Classification cache sizing.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached channels.
    pub max_entries: usize,

    /// Entry lifetime in seconds.
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            ttl_secs: 3600,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Per-event relay behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Messages of channel history to fetch. 0 uses the platform's default page.
    pub history_limit: usize,

    /// Estimated token budget for the assembled context. Oldest history is
    /// dropped past this; `None` disables trimming.
    pub context_token_ceiling: Option<usize>,

    /// Prefix of every error reply. Messages starting with it are never
    /// re-submitted as history.
    pub error_marker: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            history_limit: 0,
            context_token_ceiling: Some(4097),
            error_marker: "[relay-error]".into(),
        }
    }
}

/// Tool-assistant polling.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct AssistantPollConfig {
    /// Delay between run status polls.
    pub poll_interval_secs: u64,

    /// Ceiling after which polling stops and a timeout is reported.
    pub timeout_secs: u64,
}

impl Default for AssistantPollConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            timeout_secs: 120,
        }
    }
}

impl AssistantPollConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// On-disk / environment shape. Credentials are optional here and resolved
/// against the conventional environment variables afterwards.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    slack: RawSlackConfig,
    llm: LlmConfig,
    routing: RoutingSettings,
    cache: CacheConfig,
    relay: RelayConfig,
    assistant: AssistantPollConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSlackConfig {
    bot_token: Option<String>,
    app_token: Option<String>,
}

impl Config {
    /// Default config file location: `<config_dir>/slackgpt/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("slackgpt"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Load from the default path (if present) and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::default_path())
    }

    /// Load from a TOML file (optional) layered under `SLACKGPT__*` environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("routing.chat_prefixes")
                    .with_list_parse_key("routing.assistant_prefixes")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize::<RawConfig>())
            .map_err(|error| ConfigError::Load {
                path: path.display().to_string(),
                source: Arc::new(error),
            })?;

        Self::from_raw(settings, |key| std::env::var(key).ok())
    }

    /// Parse a TOML document without consulting files or the process environment.
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        Self::from_toml_str_with_env(toml, |_| None)
    }

    fn from_toml_str_with_env(
        toml: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let raw = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .and_then(|settings| settings.try_deserialize::<RawConfig>())
            .map_err(|error| ConfigError::Load {
                path: "<inline>".into(),
                source: Arc::new(error),
            })?;

        Self::from_raw(raw, env)
    }

    fn from_raw(raw: RawConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let bot_token = non_empty(env("SLACK_BOT_TOKEN"))
            .or(non_empty(raw.slack.bot_token))
            .ok_or_else(|| ConfigError::MissingKey("SLACK_BOT_TOKEN".into()))?;
        let app_token = non_empty(env("SLACK_APP_TOKEN"))
            .or(non_empty(raw.slack.app_token))
            .ok_or_else(|| ConfigError::MissingKey("SLACK_APP_TOKEN".into()))?;

        let mut llm = raw.llm;
        llm.api_key = non_empty(env("OPENAI_API_KEY"))
            .or(non_empty(Some(llm.api_key)))
            .ok_or_else(|| ConfigError::MissingKey("OPENAI_API_KEY".into()))?;

        let config = Self {
            slack: SlackConfig {
                bot_token,
                app_token,
            },
            llm,
            routing: raw.routing,
            cache: raw.cache,
            relay: raw.relay,
            assistant: raw.assistant,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid("cache.max_entries must be greater than 0".into()).into());
        }
        if self.assistant.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "assistant.poll_interval_secs must be greater than 0".into(),
            )
            .into());
        }
        if self.assistant.poll_interval_secs > self.assistant.timeout_secs {
            return Err(ConfigError::Invalid(
                "assistant.poll_interval_secs must not exceed assistant.timeout_secs".into(),
            )
            .into());
        }
        if self.relay.error_marker.trim().is_empty() {
            return Err(ConfigError::Invalid("relay.error_marker must not be empty".into()).into());
        }
        if self.llm.default_model.trim().is_empty() {
            return Err(ConfigError::Invalid("llm.default_model must not be empty".into()).into());
        }
        self.routing_table()?;
        Ok(())
    }

    /// Build the channel routing table from the routing settings.
    pub fn routing_table(&self) -> std::result::Result<RoutingTable, ConfigError> {
        RoutingTable::from_settings(&self.routing, &self.llm.default_model)
    }
}
