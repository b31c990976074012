//! Chat platform integration (Slack).

pub mod slack;
pub mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use slack::SlackAdapter;
pub use traits::{ChatPlatform, ChatPlatformDyn, ChannelInfo, HistoryMessage};
