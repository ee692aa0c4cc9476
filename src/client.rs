use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{MessengerConfig, RetryPolicy};
use crate::domains::message::{self, MessageEvent};
use crate::error::{is_subscription_lost, MessengerError, Result};
use crate::interfaces::transport::{InboundMessage, MessageCallback, NodeFactory, SubscriptionHandle};
use crate::services::connection::{ConnectionManager, ConnectionState};
use crate::services::gossip::GossipNodeFactory;
use crate::services::registry::{now_ms, SubscriptionRegistry};
use crate::services::topic::TopicResolver;

pub type EventHandler = Arc<dyn Fn(MessageEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wraps an async closure as an [`EventHandler`].
pub fn event_handler<F, Fut>(handler: F) -> EventHandler
where
    F: Fn(MessageEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |event| handler(event).boxed())
}

enum Liveness {
    Confirmed,
    Unconfirmed,
    Lost,
}

/// Publish/subscribe client over content topics.
///
/// Delivery is best effort and at most once: `send_message` never reports
/// publish failures, and malformed inbound payloads are dropped after being
/// logged. Handler failures stay inside the subscription that produced them.
pub struct TopicMessenger {
    config: MessengerConfig,
    resolver: TopicResolver,
    connection: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
}

impl TopicMessenger {
    pub fn new(config: MessengerConfig, factory: Arc<dyn NodeFactory>) -> Self {
        Self::with_policy(config, factory, RetryPolicy::default())
    }

    pub fn with_policy(
        config: MessengerConfig,
        factory: Arc<dyn NodeFactory>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            resolver: TopicResolver::new(&config),
            connection: ConnectionManager::new(factory, policy),
            registry: Arc::new(SubscriptionRegistry::new()),
            config,
        }
    }

    /// Validates the configuration, then connects.
    pub async fn start(config: MessengerConfig, factory: Arc<dyn NodeFactory>) -> Result<Self> {
        config.validate()?;
        let messenger = Self::new(config, factory);
        messenger.init().await?;
        info!("topic messenger started");
        Ok(messenger)
    }

    /// Loads a JSON config file and starts a messenger on the libp2p transport.
    pub async fn from_config_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = MessengerConfig::from_file(path)?;
        let factory = Arc::new(GossipNodeFactory::from_config(&config)?);
        Self::start(config, factory).await
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    pub fn default_topic(&self) -> Result<String> {
        self.resolver.default_topic()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    pub async fn subscriptions(&self) -> Vec<String> {
        self.registry.topics().await
    }

    pub fn registry(&self) -> Arc<SubscriptionRegistry> {
        self.registry.clone()
    }

    pub async fn init(&self) -> Result<()> {
        let peers = self.config.static_peer_list();
        self.connection.init(&peers, self.config.ping_count).await
    }

    pub async fn subscribe(&self, topic_hint: &str, handler: EventHandler) -> Result<String> {
        self.subscribe_with_ttl(topic_hint, handler, self.config.subscription_ttl())
            .await
    }

    /// Subscribes and returns the concrete topic. A subscription the
    /// transport reports as lost during the liveness check is recreated on
    /// the same topic, a bounded number of times.
    pub async fn subscribe_with_ttl(
        &self,
        topic_hint: &str,
        handler: EventHandler,
        ttl: Duration,
    ) -> Result<String> {
        if topic_hint.is_empty() && !self.config.has_default_topic() {
            return Err(MessengerError::Config(
                "subscription not configured (missing WAKU_CONTENT_TOPIC or WAKU_TOPIC)"
                    .to_string(),
            ));
        }
        let topic = self.resolver.resolve(topic_hint)?;
        let node = self.connection.ready_node().await?;
        let max_resubscribes = self.connection.policy().max_resubscribes;

        let mut resubscribes = 0u32;
        loop {
            let handle = node.subscribe(&topic).await.map_err(|e| {
                MessengerError::Subscription(format!("error creating subscription: {e}"))
            })?;
            let (callback, dispatcher) = spawn_dispatcher(topic.clone(), handler.clone());
            if let Err(err) = handle.on_message(callback).await {
                self.registry.discard(&topic, handle, Some(dispatcher)).await;
                return Err(MessengerError::Subscription(err.to_string()));
            }

            match self.confirm_subscription(handle.as_ref()).await {
                Liveness::Lost => {
                    self.registry.discard(&topic, handle, Some(dispatcher)).await;
                    if resubscribes >= max_resubscribes {
                        return Err(MessengerError::Subscription(format!(
                            "subscription to {topic} lost after {resubscribes} resubscribe attempts"
                        )));
                    }
                    resubscribes += 1;
                    warn!(
                        topic = %topic,
                        attempt = resubscribes,
                        "peer has no subs, retrying subscription"
                    );
                }
                liveness => {
                    if let Liveness::Unconfirmed = liveness {
                        warn!(topic = %topic, "subscription ping never succeeded");
                    }
                    info!(topic = %topic, "subscribed to topic");
                    self.registry.put(&topic, handle, Some(dispatcher), ttl).await;
                    return Ok(topic);
                }
            }
        }
    }

    async fn confirm_subscription(&self, handle: &dyn SubscriptionHandle) -> Liveness {
        let delay = self.connection.policy().retry_delay;
        for attempt in 0..self.config.ping_count {
            match handle.ping().await {
                Ok(()) => return Liveness::Confirmed,
                Err(err) if is_subscription_lost(&err) => return Liveness::Lost,
                Err(err) => {
                    warn!(attempt, error = %err, "subscription ping attempt error, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
        Liveness::Unconfirmed
    }

    /// Fire and forget: every failure is logged and swallowed.
    pub async fn send_message(&self, body: &Value, topic_hint: &str, room_id: &str) {
        if let Err(err) = self.try_send(body, topic_hint, room_id).await {
            error!(error = %err, "error sending message");
        }
    }

    async fn try_send(&self, body: &Value, topic_hint: &str, room_id: &str) -> Result<()> {
        let topic = self.resolver.resolve(topic_hint)?;
        info!(topic = %topic, %body, "sending message");
        let payload = message::encode(now_ms(), room_id, body)?;
        let node = self.connection.ready_node().await?;
        node.publish(&topic, payload)
            .await
            .map_err(|e| MessengerError::Publish(e.to_string()))?;
        info!(topic = %topic, "message sent");
        Ok(())
    }

    /// Never fails: unresolvable hints and missing entries are logged.
    /// Ephemeral hints resolve to a new topic each time, so pass the topic
    /// `subscribe` returned.
    pub async fn unsubscribe(&self, topic_hint: &str) -> Result<()> {
        let topic = match self.resolver.resolve(topic_hint) {
            Ok(topic) => topic,
            Err(err) => {
                warn!(topic_hint, error = %err, "cannot resolve topic to unsubscribe");
                return Ok(());
            }
        };
        if self.registry.contains(&topic).await {
            info!(topic = %topic, "unsubscribing from topic");
        }
        if let Err(err) = self.registry.remove(&topic).await {
            error!(topic = %topic, error = %err, "error unsubscribing");
        }
        Ok(())
    }

    /// Stops the node without draining subscriptions.
    pub async fn stop(&self) -> Result<()> {
        self.connection.stop().await
    }

    /// Starts the periodic expiry sweep when `sweep_interval_secs` is set.
    pub fn spawn_expiry_sweep(&self) -> Option<JoinHandle<()>> {
        let interval = Duration::from_secs(self.config.sweep_interval_secs?.max(1));
        let registry = self.registry.clone();
        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                let removed = registry.sweep_expired(now_ms()).await;
                if !removed.is_empty() {
                    info!(count = removed.len(), "expired subscriptions removed");
                }
            }
        }))
    }
}

/// Feeds inbound messages for one topic to `handler`, in arrival order, on
/// a task of its own.
fn spawn_dispatcher(topic: String, handler: EventHandler) -> (MessageCallback, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<InboundMessage>();
    let callback: MessageCallback = Arc::new(move |inbound| {
        let _ = tx.send(inbound);
    });
    let task = tokio::spawn(async move {
        while let Some(inbound) = rx.recv().await {
            dispatch(&topic, &handler, inbound).await;
        }
    });
    (callback, task)
}

async fn dispatch(topic: &str, handler: &EventHandler, inbound: InboundMessage) {
    let Some(payload) = inbound.payload else {
        error!(topic, "received message with no payload");
        return;
    };
    let event = match message::decode(&payload) {
        Ok(event) => event,
        Err(err) => {
            error!(topic, error = %err, "error decoding message payload");
            return;
        }
    };
    let outcome = AssertUnwindSafe(async { handler(event).await })
        .catch_unwind()
        .await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(topic, error = %err, "message handler failed"),
        Err(_) => error!(topic, "message handler panicked"),
    }
}
