use thiserror::Error;

/// Marker the transport puts in a ping failure when the remote side has
/// dropped every subscription for this client.
pub const SUBSCRIPTION_LOST_MARKER: &str = "peer has no subscriptions";

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("connectivity error: {0}")]
    Connectivity(String),
    #[error("subscription error: {0}")]
    Subscription(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("publish error: {0}")]
    Publish(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, MessengerError>;

/// True when a ping failure means the subscription was silently dropped
/// and has to be created again.
pub fn is_subscription_lost(err: &MessengerError) -> bool {
    err.to_string().contains(SUBSCRIPTION_LOST_MARKER)
}
