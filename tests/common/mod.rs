#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc;

use topic_messenger::config::MessengerConfig;
use topic_messenger::error::{MessengerError, Result, SUBSCRIPTION_LOST_MARKER};
use topic_messenger::interfaces::transport::{
    Capability, InboundMessage, MessageCallback, NodeConfig, NodeFactory, NodeMode, PubSubNode,
    SubscriptionHandle,
};
use topic_messenger::{event_handler, EventHandler, MessageEvent};

pub const TEMPLATE: &str = "/test/1/PLACEHOLDER/proto";

pub fn test_config() -> MessengerConfig {
    MessengerConfig {
        content_topic: Some(TEMPLATE.to_string()),
        topic: Some("intents".to_string()),
        ping_count: 3,
        ..MessengerConfig::default()
    }
}

pub enum PingOutcome {
    Ok,
    Lost,
    Transient,
}

#[derive(Default)]
struct Script {
    /// address -> failing attempts before the dial succeeds
    dial_failures: HashMap<String, usize>,
    dial_attempts: HashMap<String, usize>,
    wait_failures: usize,
    always_fail_wait: bool,
    disconnected: bool,
    pings: VecDeque<PingOutcome>,
    always_lost: bool,
    subscribe_error: Option<String>,
    publish_error: Option<String>,
}

type Listeners = HashMap<String, Vec<(u64, Option<MessageCallback>)>>;

#[derive(Default)]
struct NodeState {
    script: Mutex<Script>,
    calls: Mutex<Vec<String>>,
    listeners: Mutex<Listeners>,
    next_id: AtomicU64,
}

impl NodeState {
    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn deliver(&self, topic: &str, payload: Option<Vec<u8>>) {
        let callbacks: Vec<MessageCallback> = self
            .listeners
            .lock()
            .unwrap()
            .get(topic)
            .map(|entries| entries.iter().filter_map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(InboundMessage {
                content_topic: topic.to_string(),
                payload: payload.clone(),
            });
        }
    }
}

/// In-memory transport. Published payloads loop back to local listeners.
#[derive(Default)]
pub struct ScriptedNode {
    state: Arc<NodeState>,
}

impl ScriptedNode {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.state.script.lock().unwrap()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn fail_dial(&self, address: &str, failures: usize) {
        self.script()
            .dial_failures
            .insert(address.to_string(), failures);
    }

    pub fn fail_waits(&self, failures: usize) {
        self.script().wait_failures = failures;
    }

    pub fn never_ready(&self) {
        self.script().always_fail_wait = true;
    }

    pub fn set_disconnected(&self) {
        self.script().disconnected = true;
    }

    pub fn script_pings(&self, outcomes: Vec<PingOutcome>) {
        self.script().pings = outcomes.into();
    }

    pub fn always_lost(&self) {
        self.script().always_lost = true;
    }

    pub fn fail_subscribe(&self, reason: &str) {
        self.script().subscribe_error = Some(reason.to_string());
    }

    pub fn fail_publish(&self, reason: &str) {
        self.script().publish_error = Some(reason.to_string());
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.state
            .listeners
            .lock()
            .unwrap()
            .get(topic)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Pushes a raw payload to every listener of `topic`.
    pub fn deliver(&self, topic: &str, payload: Option<Vec<u8>>) {
        self.state.deliver(topic, payload);
    }
}

#[async_trait]
impl PubSubNode for ScriptedNode {
    async fn dial(&self, address: &str) -> Result<()> {
        self.state.record(format!("dial:{address}"));
        let mut script = self.script();
        let failures = script.dial_failures.get(address).copied().unwrap_or(0);
        let attempts = script.dial_attempts.entry(address.to_string()).or_insert(0);
        *attempts += 1;
        if *attempts <= failures {
            return Err(MessengerError::Transport(format!("dial {address} refused")));
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.state.record("start".to_string());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.state.record("stop".to_string());
        Ok(())
    }

    async fn wait_for_peers(&self, capabilities: &[Capability], _timeout: Duration) -> Result<()> {
        assert!(capabilities.contains(&Capability::Push));
        assert!(capabilities.contains(&Capability::Filter));
        self.state.record("wait".to_string());
        let mut script = self.script();
        if script.always_fail_wait {
            return Err(MessengerError::Transport("timed out waiting for peers".to_string()));
        }
        if script.wait_failures > 0 {
            script.wait_failures -= 1;
            return Err(MessengerError::Transport("timed out waiting for peers".to_string()));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.script().disconnected
    }

    async fn subscribe(&self, content_topic: &str) -> Result<Box<dyn SubscriptionHandle>> {
        self.state.record(format!("subscribe:{content_topic}"));
        if let Some(reason) = self.script().subscribe_error.clone() {
            return Err(MessengerError::Transport(reason));
        }
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        self.state
            .listeners
            .lock()
            .unwrap()
            .entry(content_topic.to_string())
            .or_default()
            .push((id, None));
        Ok(Box::new(ScriptedSubscription {
            state: self.state.clone(),
            topic: content_topic.to_string(),
            id,
        }))
    }

    async fn publish(&self, content_topic: &str, payload: Vec<u8>) -> Result<()> {
        self.state.record(format!("publish:{content_topic}"));
        if let Some(reason) = self.script().publish_error.clone() {
            return Err(MessengerError::Publish(reason));
        }
        self.state.deliver(content_topic, Some(payload));
        Ok(())
    }
}

pub struct ScriptedSubscription {
    state: Arc<NodeState>,
    topic: String,
    id: u64,
}

#[async_trait]
impl SubscriptionHandle for ScriptedSubscription {
    fn content_topic(&self) -> &str {
        &self.topic
    }

    async fn on_message(&self, callback: MessageCallback) -> Result<()> {
        let mut listeners = self.state.listeners.lock().unwrap();
        let entry = listeners
            .get_mut(&self.topic)
            .and_then(|entries| entries.iter_mut().find(|(id, _)| *id == self.id));
        match entry {
            Some((_, slot)) => {
                *slot = Some(callback);
                Ok(())
            }
            None => Err(MessengerError::Transport(SUBSCRIPTION_LOST_MARKER.to_string())),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.state.record(format!("ping:{}", self.topic));
        let mut script = self.state.script.lock().unwrap();
        if script.always_lost {
            return Err(MessengerError::Transport(SUBSCRIPTION_LOST_MARKER.to_string()));
        }
        match script.pings.pop_front().unwrap_or(PingOutcome::Ok) {
            PingOutcome::Ok => Ok(()),
            PingOutcome::Lost => Err(MessengerError::Transport(format!(
                "ping failed: {SUBSCRIPTION_LOST_MARKER}"
            ))),
            PingOutcome::Transient => Err(MessengerError::Transport("ping timed out".to_string())),
        }
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.state.record(format!("unsubscribe:{}", self.topic));
        let mut listeners = self.state.listeners.lock().unwrap();
        if let Some(entries) = listeners.get_mut(&self.topic) {
            entries.retain(|(id, _)| *id != self.id);
            if entries.is_empty() {
                listeners.remove(&self.topic);
            }
        }
        Ok(())
    }
}

pub struct ScriptedFactory {
    pub node: Arc<ScriptedNode>,
    modes: Mutex<Vec<NodeMode>>,
}

impl ScriptedFactory {
    pub fn new(node: Arc<ScriptedNode>) -> Arc<Self> {
        Arc::new(Self {
            node,
            modes: Mutex::new(Vec::new()),
        })
    }

    pub fn modes(&self) -> Vec<NodeMode> {
        self.modes.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeFactory for ScriptedFactory {
    async fn create_node(&self, config: NodeConfig) -> Result<Arc<dyn PubSubNode>> {
        self.modes.lock().unwrap().push(config.mode);
        Ok(self.node.clone())
    }
}

/// Handler forwarding every event into a channel.
pub fn channel_handler() -> (EventHandler, mpsc::UnboundedReceiver<MessageEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = event_handler(move |event| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(event);
            Ok(())
        }
    });
    (handler, rx)
}

pub fn intent_body() -> serde_json::Value {
    json!({"amount": "1", "token": "ETH"})
}
