//! Slack adapter using slack-morphism.
//!
//! Inbound events arrive over Socket Mode: channel `message` events and
//! `app_mention` events. DMs are delivered as mentions. Outbound calls use
//! the Web API (`conversations.*`, `chat.postMessage`) with the bot token.

use crate::messaging::traits::{ChannelInfo, ChatPlatform, HistoryMessage, InboundStream};
use crate::{EventKind, InboundEvent};

use anyhow::Context as _;
use slack_morphism::prelude::*;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

/// Cumulative markdown block limit for a single Slack message payload.
const MAX_MESSAGE_LEN: usize = 12_000;

/// Upper bound Slack accepts for `conversations.history`.
const MAX_HISTORY_PAGE: usize = 999;

/// State shared with socket mode callbacks via `SlackClientEventsUserState`.
struct SlackAdapterState {
    inbound_tx: mpsc::Sender<InboundEvent>,
    bot_user_id: String,
}

/// Slack adapter.
pub struct SlackAdapter {
    app_token: String,
    /// Shared Web API client, reused across calls for its connection pool.
    client: Arc<SlackHyperClient>,
    token: SlackApiToken,
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<()>>>>,
}

impl SlackAdapter {
    pub fn new(bot_token: impl Into<String>, app_token: impl Into<String>) -> anyhow::Result<Self> {
        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("failed to create slack HTTP connector")?,
        ));
        let token = SlackApiToken::new(SlackApiTokenValue(bot_token.into()));
        Ok(Self {
            app_token: app_token.into(),
            client,
            token,
            shutdown_tx: Arc::new(RwLock::new(None)),
        })
    }

    fn session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.token)
    }
}

/// The parts of a Slack message event that decide whether and how it is relayed.
#[derive(Debug, Clone, Default)]
struct SlackIncoming {
    channel_id: String,
    user_id: Option<String>,
    bot_id: Option<String>,
    has_subtype: bool,
    text: String,
    ts: String,
    thread_ts: Option<String>,
}

impl SlackIncoming {
    fn from_message(event: &SlackMessageEvent) -> Self {
        Self {
            channel_id: event
                .origin
                .channel
                .as_ref()
                .map(|channel| channel.0.clone())
                .unwrap_or_default(),
            user_id: event.sender.user.as_ref().map(|user| user.0.clone()),
            bot_id: event.sender.bot_id.as_ref().map(|bot| bot.0.clone()),
            has_subtype: event.subtype.is_some(),
            text: event
                .content
                .as_ref()
                .and_then(|content| content.text.clone())
                .unwrap_or_default(),
            ts: event.origin.ts.0.clone(),
            thread_ts: event.origin.thread_ts.as_ref().map(|ts| ts.0.clone()),
        }
    }

    /// `SlackAppMentionEvent` carries flat `user` and `channel` fields rather
    /// than the nested sender/origin of message events.
    fn from_mention(event: &SlackAppMentionEvent) -> Self {
        Self {
            channel_id: event.channel.0.clone(),
            user_id: Some(event.user.0.clone()),
            bot_id: None,
            has_subtype: false,
            text: event.content.text.clone().unwrap_or_default(),
            ts: event.origin.ts.0.clone(),
            thread_ts: event.origin.thread_ts.as_ref().map(|ts| ts.0.clone()),
        }
    }
}

/// Map a `message` event. Edits, deletes, bot posts and our own messages are
/// dropped, as is any channel message that mentions the bot (its
/// `app_mention` twin is relayed instead).
fn message_to_event(incoming: SlackIncoming, bot_user_id: &str) -> Option<InboundEvent> {
    if incoming.has_subtype || incoming.bot_id.is_some() {
        return None;
    }
    let user_id = incoming.user_id.clone()?;
    if user_id == bot_user_id {
        return None;
    }

    if is_direct_channel(&incoming.channel_id) {
        return Some(mention_event(incoming, user_id, bot_user_id));
    }

    if incoming.text.contains(&format!("<@{bot_user_id}>")) {
        return None;
    }

    Some(InboundEvent {
        id: incoming.ts,
        kind: EventKind::Message,
        channel_id: incoming.channel_id.into(),
        user_id,
        prompt: incoming.text.clone(),
        text: incoming.text,
        reply_thread_ts: incoming.thread_ts,
    })
}

fn mention_to_event(incoming: SlackIncoming, bot_user_id: &str) -> Option<InboundEvent> {
    let user_id = incoming.user_id.clone()?;
    if user_id == bot_user_id {
        return None;
    }
    Some(mention_event(incoming, user_id, bot_user_id))
}

/// Mentions are answered in a thread: the existing one, or a new one rooted
/// at the mention.
fn mention_event(incoming: SlackIncoming, user_id: String, bot_user_id: &str) -> InboundEvent {
    let prompt = strip_bot_mention(&incoming.text, bot_user_id);
    let reply_thread_ts = incoming.thread_ts.unwrap_or_else(|| incoming.ts.clone());
    InboundEvent {
        id: incoming.ts,
        kind: EventKind::Mention,
        channel_id: incoming.channel_id.into(),
        user_id,
        text: incoming.text,
        prompt,
        reply_thread_ts: Some(reply_thread_ts),
    }
}

/// DM conversation ids start with `D`.
fn is_direct_channel(channel_id: &str) -> bool {
    channel_id.starts_with('D')
}

// Inbound event handlers (fn pointers, as slack-morphism requires)

async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackHyperClient>,
    states: SlackClientEventsUserState,
) -> UserCallbackResult<()> {
    let state = {
        let guard = states.read().await;
        guard.get_user_state::<Arc<SlackAdapterState>>().cloned()
    };
    let Some(state) = state else {
        tracing::error!("slack adapter state missing from listener environment");
        return Ok(());
    };

    let inbound = match event.event {
        SlackEventCallbackBody::Message(message) => {
            message_to_event(SlackIncoming::from_message(&message), &state.bot_user_id)
        }
        SlackEventCallbackBody::AppMention(mention) => {
            mention_to_event(SlackIncoming::from_mention(&mention), &state.bot_user_id)
        }
        _ => None,
    };

    if let Some(inbound) = inbound {
        tracing::debug!(channel_id = %inbound.channel_id, kind = %inbound.kind, "slack event received");
        if state.inbound_tx.send(inbound).await.is_err() {
            tracing::warn!("inbound receiver dropped, discarding slack event");
        }
    }

    Ok(())
}

fn slack_error_handler(
    err: Box<dyn std::error::Error + Send + Sync>,
    _client: Arc<SlackHyperClient>,
    _states: SlackClientEventsUserState,
) -> HttpStatusCode {
    tracing::warn!(error = %err, "slack socket mode error");
    HttpStatusCode::OK
}

impl ChatPlatform for SlackAdapter {
    fn name(&self) -> &str {
        "slack"
    }

    async fn start(&self) -> crate::Result<InboundStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let auth_response = self
            .session()
            .auth_test()
            .await
            .context("failed to call auth.test for bot user ID")?;
        let bot_user_id = auth_response.user_id.0.clone();
        tracing::info!(%bot_user_id, "slack bot user ID resolved");

        let adapter_state = Arc::new(SlackAdapterState {
            inbound_tx,
            bot_user_id,
        });

        let callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);

        // The listener owns its websocket client; `self.client` stays for REST calls.
        let listener_client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new()
                .context("failed to create slack socket mode connector")?,
        ));

        let listener_environment = Arc::new(
            SlackClientEventsListenerEnvironment::new(listener_client)
                .with_error_handler(slack_error_handler)
                .with_user_state(adapter_state),
        );

        let listener = SlackClientSocketModeListener::new(
            &SlackClientSocketModeConfig::new(),
            listener_environment,
            callbacks,
        );

        let app_token = SlackApiToken::new(SlackApiTokenValue(self.app_token.clone()));

        tokio::spawn(async move {
            if let Err(error) = listener.listen_for(&app_token).await {
                tracing::error!(%error, "failed to start slack socket mode listener");
                return;
            }

            tracing::info!("slack socket mode connected");

            tokio::select! {
                exit_code = listener.serve() => {
                    tracing::info!(exit_code, "slack socket mode listener stopped");
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("slack socket mode shutting down");
                    listener.shutdown().await;
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(
            inbound_rx,
        )))
    }

    async fn channel_info(&self, channel_id: &str) -> crate::Result<ChannelInfo> {
        let request = SlackApiConversationsInfoRequest::new(SlackChannelId(channel_id.to_string()));
        let channel = self
            .session()
            .conversations_info(&request)
            .await
            .context("failed to call conversations.info")?
            .channel;

        Ok(ChannelInfo {
            name: channel
                .name_normalized
                .or(channel.name)
                .unwrap_or_default(),
            is_member: channel.flags.is_member.unwrap_or(false),
            topic: channel.topic.map(|topic| topic.value).unwrap_or_default(),
            purpose: channel
                .purpose
                .map(|purpose| purpose.value)
                .unwrap_or_default(),
        })
    }

    async fn join_channel(&self, channel_id: &str) -> crate::Result<()> {
        let request = SlackApiConversationsJoinRequest::new(SlackChannelId(channel_id.to_string()));
        self.session()
            .conversations_join(&request)
            .await
            .context("failed to call conversations.join")?;
        Ok(())
    }

    async fn channel_history(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> crate::Result<Vec<HistoryMessage>> {
        let mut request = SlackApiConversationsHistoryRequest::new()
            .with_channel(SlackChannelId(channel_id.to_string()));
        if limit > 0 {
            request = request.with_limit(limit.min(MAX_HISTORY_PAGE) as u16);
        }

        let messages = self
            .session()
            .conversations_history(&request)
            .await
            .context("failed to fetch slack channel history")?
            .messages;

        // Slack returns newest first, which is what callers expect.
        let history: Vec<HistoryMessage> = messages
            .into_iter()
            .map(|message| HistoryMessage {
                is_bot: message.sender.user.is_none() || message.sender.bot_id.is_some(),
                text: message.content.text.unwrap_or_default(),
            })
            .collect();

        tracing::debug!(count = history.len(), channel_id, "fetched slack channel history");
        Ok(history)
    }

    async fn post_message(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> crate::Result<()> {
        let session = self.session();
        let channel = SlackChannelId(channel_id.to_string());
        let thread_ts = thread_ts.map(|ts| SlackTs(ts.to_string()));

        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            let request = SlackApiChatPostMessageRequest::new(channel.clone(), markdown_content(chunk))
                .opt_thread_ts(thread_ts.clone());
            session
                .chat_post_message(&request)
                .await
                .context("failed to send slack message")?;
        }
        Ok(())
    }

    async fn shutdown(&self) -> crate::Result<()> {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(()).await;
        }
        tracing::info!("slack adapter shut down");
        Ok(())
    }
}

/// Markdown block with a plain text fallback. The fallback `text` is what
/// history returns, so error markers survive the round trip.
fn markdown_content(text: impl Into<String>) -> SlackMessageContent {
    let text = text.into();
    let block = SlackBlock::Markdown(SlackMarkdownBlock::new(text.clone()));
    SlackMessageContent::new()
        .with_text(text)
        .with_blocks(vec![block])
}

/// Strip the leading `<@BOT_USER_ID>` mention. Slack user ids are always
/// uppercase, so no case folding is needed.
fn strip_bot_mention(text: &str, bot_user_id: &str) -> String {
    let mention = format!("<@{bot_user_id}>");
    text.trim_start()
        .trim_start_matches(mention.as_str())
        .trim_start()
        .to_string()
}

/// Split a message into UTF-8-safe chunks at line/word boundaries.
/// `max_len` must fit the widest UTF-8 character (4 bytes).
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    debug_assert!(max_len >= 4, "chunk size {max_len} cannot hold every character");
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut safe_max = max_len.min(remaining.len());
        while !remaining.is_char_boundary(safe_max) {
            safe_max -= 1;
        }

        let split_at = remaining[..safe_max]
            .rfind('\n')
            .or_else(|| remaining[..safe_max].rfind(' '))
            .filter(|&index| index > 0)
            .unwrap_or(safe_max);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
