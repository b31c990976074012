//! Chat platform trait and dynamic dispatch companion.

use crate::InboundEvent;
use crate::error::Result;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;

/// Inbound event stream type.
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// Channel metadata used for classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Normalized channel name.
    pub name: String,
    /// Whether the bot account is already a member.
    pub is_member: bool,
    pub topic: String,
    pub purpose: String,
}

/// One message of channel history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMessage {
    /// Authored by any bot identity, this one included.
    pub is_bot: bool,
    pub text: String,
}

/// Static trait for chat platforms.
/// Use this for type-safe implementations.
pub trait ChatPlatform: Send + Sync + 'static {
    /// Unique name for this platform.
    fn name(&self) -> &str;

    /// Connect and return the inbound event stream.
    fn start(&self) -> impl Future<Output = Result<InboundStream>> + Send;

    /// Fetch channel metadata.
    fn channel_info(&self, channel_id: &str) -> impl Future<Output = Result<ChannelInfo>> + Send;

    /// Join a channel as the bot account.
    fn join_channel(&self, channel_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Fetch up to `limit` recent messages, newest first. A `limit` of 0
    /// requests the platform's default page size.
    fn channel_history(
        &self,
        channel_id: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<HistoryMessage>>> + Send;

    /// Post a message, optionally into a thread.
    fn post_message(
        &self,
        channel_id: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Graceful shutdown.
    fn shutdown(&self) -> impl Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn ChatPlatformDyn>`.
pub trait ChatPlatformDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn start<'a>(&'a self) -> BoxFuture<'a, Result<InboundStream>>;

    fn channel_info<'a>(&'a self, channel_id: &'a str) -> BoxFuture<'a, Result<ChannelInfo>>;

    fn join_channel<'a>(&'a self, channel_id: &'a str) -> BoxFuture<'a, Result<()>>;

    fn channel_history<'a>(
        &'a self,
        channel_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<HistoryMessage>>>;

    fn post_message<'a>(
        &'a self,
        channel_id: &'a str,
        thread_ts: Option<&'a str>,
        text: &'a str,
    ) -> BoxFuture<'a, Result<()>>;

    fn shutdown<'a>(&'a self) -> BoxFuture<'a, Result<()>>;
}

/// Blanket implementation: any type implementing ChatPlatform automatically implements ChatPlatformDyn.
impl<T: ChatPlatform> ChatPlatformDyn for T {
    fn name(&self) -> &str {
        ChatPlatform::name(self)
    }

    fn start<'a>(&'a self) -> BoxFuture<'a, Result<InboundStream>> {
        Box::pin(ChatPlatform::start(self))
    }

    fn channel_info<'a>(&'a self, channel_id: &'a str) -> BoxFuture<'a, Result<ChannelInfo>> {
        Box::pin(ChatPlatform::channel_info(self, channel_id))
    }

    fn join_channel<'a>(&'a self, channel_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(ChatPlatform::join_channel(self, channel_id))
    }

    fn channel_history<'a>(
        &'a self,
        channel_id: &'a str,
        limit: usize,
    ) -> BoxFuture<'a, Result<Vec<HistoryMessage>>> {
        Box::pin(ChatPlatform::channel_history(self, channel_id, limit))
    }

    fn post_message<'a>(
        &'a self,
        channel_id: &'a str,
        thread_ts: Option<&'a str>,
        text: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(ChatPlatform::post_message(self, channel_id, thread_ts, text))
    }

    fn shutdown<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(ChatPlatform::shutdown(self))
    }
}
