use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::RetryPolicy;
use crate::error::{MessengerError, Result};
use crate::interfaces::transport::{
    NodeConfig, NodeFactory, NodeMode, PubSubNode, REQUIRED_CAPABILITIES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Bootstrapping,
    PeerDialing,
    AwaitingPeers,
    Ready,
    Failed,
    Stopped,
}

/// Owns the transport node and brings it to a usable state.
pub struct ConnectionManager {
    factory: Arc<dyn NodeFactory>,
    policy: RetryPolicy,
    node: RwLock<Option<Arc<dyn PubSubNode>>>,
    state: RwLock<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn NodeFactory>, policy: RetryPolicy) -> Self {
        Self {
            factory,
            policy,
            node: RwLock::new(None),
            state: RwLock::new(ConnectionState::Uninitialized),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    async fn set_state(&self, next: ConnectionState) {
        *self.state.write().await = next;
    }

    /// The node, once `init` has completed successfully.
    pub async fn ready_node(&self) -> Result<Arc<dyn PubSubNode>> {
        if self.state().await != ConnectionState::Ready {
            return Err(MessengerError::Connectivity(
                "messenger is not initialized".to_string(),
            ));
        }
        self.node
            .read()
            .await
            .clone()
            .ok_or_else(|| MessengerError::Connectivity("node is not available".to_string()))
    }

    /// Callers must serialize `init`; a second call after success is a no-op.
    pub async fn init(&self, static_peers: &[String], ping_attempts: u32) -> Result<()> {
        if self.state().await == ConnectionState::Ready {
            return Ok(());
        }
        self.set_state(ConnectionState::Bootstrapping).await;

        let mode = if static_peers.is_empty() {
            NodeMode::Bootstrap
        } else {
            NodeMode::StaticPeers
        };
        let node = match self.factory.create_node(NodeConfig { mode }).await {
            Ok(node) => node,
            Err(err) => {
                self.set_state(ConnectionState::Failed).await;
                return Err(MessengerError::Connectivity(format!(
                    "could not create node: {err}"
                )));
            }
        };
        *self.node.write().await = Some(node.clone());

        if mode == NodeMode::StaticPeers {
            self.set_state(ConnectionState::PeerDialing).await;
            let mut connected = 0usize;
            for peer in static_peers {
                if self.dial_with_retry(node.as_ref(), peer).await {
                    connected += 1;
                }
            }
            info!(connected, total = static_peers.len(), "static peer dialing finished");
        }

        if let Err(err) = node.start().await {
            self.set_state(ConnectionState::Failed).await;
            return Err(MessengerError::Connectivity(format!(
                "could not start node: {err}"
            )));
        }

        self.set_state(ConnectionState::AwaitingPeers).await;
        if let Err(err) = self.await_peers(node.as_ref(), ping_attempts).await {
            self.set_state(ConnectionState::Failed).await;
            return Err(err);
        }

        self.set_state(ConnectionState::Ready).await;
        info!("connected to pub/sub network");
        Ok(())
    }

    /// A peer that fails every attempt is skipped, never fatal.
    async fn dial_with_retry(&self, node: &dyn PubSubNode, peer: &str) -> bool {
        for attempt in 0..self.policy.dial_attempts {
            match node.dial(peer).await {
                Ok(()) => {
                    info!(peer, "peer connected");
                    return true;
                }
                Err(err) => {
                    error!(peer, attempt, error = %err, "error dialing peer");
                    if attempt + 1 < self.policy.dial_attempts {
                        tokio::time::sleep(self.policy.retry_delay).await;
                    }
                }
            }
        }
        warn!(peer, "skipping peer after failed dial attempts");
        false
    }

    async fn await_peers(&self, node: &dyn PubSubNode, ping_attempts: u32) -> Result<()> {
        for attempt in 0..ping_attempts {
            let waited = node
                .wait_for_peers(&REQUIRED_CAPABILITIES, self.policy.peer_wait_timeout)
                .await;
            if waited.is_ok() && node.is_connected() {
                return Ok(());
            }
            info!(
                "attempt {}/{} => still waiting for peers",
                attempt + 1,
                ping_attempts
            );
            if attempt + 1 == ping_attempts {
                break;
            }
            tokio::time::sleep(self.policy.retry_delay).await;
        }
        Err(MessengerError::Connectivity(
            "no remote peer found after max attempts".to_string(),
        ))
    }

    /// Idempotent; a manager that never created a node does nothing.
    pub async fn stop(&self) -> Result<()> {
        let node = self.node.write().await.take();
        let Some(node) = node else {
            return Ok(());
        };
        info!("stopping node");
        self.set_state(ConnectionState::Stopped).await;
        node.stop().await
    }
}
