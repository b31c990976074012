//! Completion backends, routing, and dispatch.

pub mod backend;
pub mod dispatch;
pub mod openai;
pub mod routing;

pub use dispatch::Dispatcher;
pub use openai::OpenAiClient;
pub use routing::RoutingTable;
