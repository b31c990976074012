//! Event handling: channel classification and the per-event relay.

pub mod classifier;
pub mod relay;

pub use classifier::{ChannelClassification, ChannelClassifier, Classification};
pub use relay::Relay;
