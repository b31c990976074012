//! In-memory chat platform for unit tests.

use crate::messaging::traits::{ChannelInfo, ChatPlatform, HistoryMessage, InboundStream};
use crate::error::Result;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PostedMessage {
    pub channel_id: String,
    pub thread_ts: Option<String>,
    pub text: String,
}

#[derive(Default)]
pub(crate) struct FakePlatform {
    pub channels: Mutex<HashMap<String, ChannelInfo>>,
    /// Newest first, as Slack returns it.
    pub histories: Mutex<HashMap<String, Vec<HistoryMessage>>>,
    pub posted: Mutex<Vec<PostedMessage>>,
    pub joined: Mutex<Vec<String>>,
    pub history_limits: Mutex<Vec<usize>>,
    pub info_calls: AtomicUsize,
    pub history_calls: AtomicUsize,
    pub fail_info: Mutex<bool>,
    pub fail_join: Mutex<bool>,
    pub fail_history: Mutex<bool>,
    pub join_delay: Option<Duration>,
}

impl FakePlatform {
    pub fn with_channel(self, id: &str, name: &str, topic: &str, purpose: &str) -> Self {
        self.channels.lock().unwrap().insert(
            id.to_string(),
            ChannelInfo {
                name: name.to_string(),
                is_member: true,
                topic: topic.to_string(),
                purpose: purpose.to_string(),
            },
        );
        self
    }

    pub fn not_member_of(self, id: &str) -> Self {
        if let Some(info) = self.channels.lock().unwrap().get_mut(id) {
            info.is_member = false;
        }
        self
    }

    /// Set history given oldest first; stored newest first.
    pub fn with_history(self, id: &str, oldest_first: Vec<HistoryMessage>) -> Self {
        let mut newest_first = oldest_first;
        newest_first.reverse();
        self.histories
            .lock()
            .unwrap()
            .insert(id.to_string(), newest_first);
        self
    }

    pub fn with_join_delay(mut self, delay: Duration) -> Self {
        self.join_delay = Some(delay);
        self
    }

    pub fn info_calls(&self) -> usize {
        self.info_calls.load(Ordering::SeqCst)
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub fn posted(&self) -> Vec<PostedMessage> {
        self.posted.lock().unwrap().clone()
    }
}

pub(crate) fn user(text: &str) -> HistoryMessage {
    HistoryMessage {
        is_bot: false,
        text: text.into(),
    }
}

pub(crate) fn bot(text: &str) -> HistoryMessage {
    HistoryMessage {
        is_bot: true,
        text: text.into(),
    }
}

impl ChatPlatform for FakePlatform {
    fn name(&self) -> &str {
        "fake"
    }

    async fn start(&self) -> Result<InboundStream> {
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn channel_info(&self, channel_id: &str) -> Result<ChannelInfo> {
        self.info_calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_info.lock().unwrap() {
            return Err(anyhow::anyhow!("conversations.info failed").into());
        }
        self.channels
            .lock()
            .unwrap()
            .get(channel_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("channel_not_found").into())
    }

    async fn join_channel(&self, channel_id: &str) -> Result<()> {
        if let Some(delay) = self.join_delay {
            tokio::time::sleep(delay).await;
        }
        self.joined.lock().unwrap().push(channel_id.to_string());
        if *self.fail_join.lock().unwrap() {
            return Err(anyhow::anyhow!("conversations.join failed").into());
        }
        Ok(())
    }

    async fn channel_history(&self, channel_id: &str, limit: usize) -> Result<Vec<HistoryMessage>> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        self.history_limits.lock().unwrap().push(limit);
        if *self.fail_history.lock().unwrap() {
            return Err(anyhow::anyhow!("conversations.history failed").into());
        }
        let history = self
            .histories
            .lock()
            .unwrap()
            .get(channel_id)
            .cloned()
            .unwrap_or_default();
        let take = if limit == 0 { history.len() } else { limit };
        Ok(history.into_iter().take(take).collect())
    }

    async fn post_message(&self, channel_id: &str, thread_ts: Option<&str>, text: &str) -> Result<()> {
        self.posted.lock().unwrap().push(PostedMessage {
            channel_id: channel_id.to_string(),
            thread_ts: thread_ts.map(str::to_string),
            text: text.to_string(),
        });
        Ok(())
    }
}
