pub mod client;
pub mod config;
pub mod domains;
pub mod error;
pub mod interfaces;
pub mod services;

pub use crate::client::{event_handler, EventHandler, TopicMessenger};
pub use crate::config::{MessengerConfig, RetryPolicy};
pub use crate::domains::message::MessageEvent;
pub use crate::error::{MessengerError, Result};
pub use crate::services::connection::ConnectionState;
pub use crate::services::gossip::GossipNodeFactory;
