use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Protocol roles a remote peer has to serve before the node is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Push,
    Filter,
}

pub const REQUIRED_CAPABILITIES: [Capability; 2] = [Capability::Push, Capability::Filter];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    /// Only the explicitly dialed peers, no automatic discovery.
    StaticPeers,
    /// Discovery through the transport's bootstrap list.
    Bootstrap,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub mode: NodeMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub content_topic: String,
    pub payload: Option<Vec<u8>>,
}

pub type MessageCallback = Arc<dyn Fn(InboundMessage) + Send + Sync>;

#[async_trait]
pub trait SubscriptionHandle: Send + Sync {
    fn content_topic(&self) -> &str;
    /// Registers the callback invoked for every message on this topic.
    /// The callback runs on the transport's own task and must not block.
    async fn on_message(&self, callback: MessageCallback) -> Result<()>;
    async fn ping(&self) -> Result<()>;
    async fn unsubscribe(&self) -> Result<()>;
}

#[async_trait]
pub trait PubSubNode: Send + Sync {
    async fn dial(&self, address: &str) -> Result<()>;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn wait_for_peers(&self, capabilities: &[Capability], timeout: Duration) -> Result<()>;
    fn is_connected(&self) -> bool;
    async fn subscribe(&self, content_topic: &str) -> Result<Box<dyn SubscriptionHandle>>;
    async fn publish(&self, content_topic: &str, payload: Vec<u8>) -> Result<()>;
}

#[async_trait]
pub trait NodeFactory: Send + Sync {
    async fn create_node(&self, config: NodeConfig) -> Result<Arc<dyn PubSubNode>>;
}
