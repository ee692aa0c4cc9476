use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{MessengerError, Result};

/// Marker inside `content_topic` that gets replaced by a subtopic.
pub const TOPIC_PLACEHOLDER: &str = "PLACEHOLDER";

pub const DEFAULT_PING_COUNT: u32 = 20;
pub const DEFAULT_EPHEMERAL_BYTES: usize = 16;
pub const DEFAULT_SUBSCRIPTION_TTL_SECS: u64 = 20;

fn default_ping_count() -> u32 {
    DEFAULT_PING_COUNT
}

fn default_ephemeral_bytes() -> usize {
    DEFAULT_EPHEMERAL_BYTES
}

fn default_subscription_ttl_secs() -> u64 {
    DEFAULT_SUBSCRIPTION_TTL_SECS
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MessengerConfig {
    /// Topic template, e.g. `/my-app/1/PLACEHOLDER/proto`.
    #[serde(default)]
    pub content_topic: Option<String>,
    /// Subtopic used when a caller passes an empty topic hint.
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default = "default_ping_count")]
    pub ping_count: u32,
    /// Comma-separated peer multiaddrs. Empty selects bootstrap discovery.
    #[serde(default)]
    pub static_peers: String,
    #[serde(default = "default_ephemeral_bytes")]
    pub ephemeral_bytes: usize,
    #[serde(default = "default_subscription_ttl_secs")]
    pub subscription_ttl_secs: u64,
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
    #[serde(default)]
    pub listen_addrs: Vec<String>,
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default)]
    pub key_path: Option<String>,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            content_topic: None,
            topic: None,
            ping_count: DEFAULT_PING_COUNT,
            static_peers: String::new(),
            ephemeral_bytes: DEFAULT_EPHEMERAL_BYTES,
            subscription_ttl_secs: DEFAULT_SUBSCRIPTION_TTL_SECS,
            sweep_interval_secs: None,
            listen_addrs: Vec::new(),
            bootstrap_peers: Vec::new(),
            key_path: None,
        }
    }
}

impl MessengerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            fs::read_to_string(path.as_ref()).map_err(|e| MessengerError::Config(e.to_string()))?;
        let config: MessengerConfig =
            serde_json::from_str(&content).map_err(|e| MessengerError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Reads the `WAKU_*` settings. An unparsable ping count falls back to
    /// the default instead of failing.
    pub fn from_env() -> Self {
        let non_empty = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            content_topic: non_empty("WAKU_CONTENT_TOPIC"),
            topic: non_empty("WAKU_TOPIC"),
            ping_count: std::env::var("WAKU_PING_COUNT")
                .ok()
                .and_then(|v| v.trim().parse::<u32>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_PING_COUNT),
            static_peers: std::env::var("WAKU_STATIC_PEERS")
                .map(|v| v.trim().to_string())
                .unwrap_or_default(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        match self.content_topic.as_deref() {
            None | Some("") => problems.push("content_topic: WAKU_CONTENT_TOPIC is required"),
            Some(template) if !template.contains(TOPIC_PLACEHOLDER) => {
                problems.push("content_topic: template must contain PLACEHOLDER")
            }
            Some(_) => {}
        }
        if self.topic.as_deref().unwrap_or_default().is_empty() {
            problems.push("topic: WAKU_TOPIC is required");
        }
        if self.ping_count == 0 {
            problems.push("ping_count: must be at least 1");
        }
        if problems.is_empty() {
            return Ok(());
        }
        Err(MessengerError::Config(format!(
            "configuration validation failed:\n{}",
            problems.join("\n")
        )))
    }

    /// Both settings the default topic is built from are present.
    pub fn has_default_topic(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
        present(&self.content_topic) && present(&self.topic)
    }

    pub fn static_peer_list(&self) -> Vec<String> {
        self.static_peers
            .split(',')
            .map(str::trim)
            .filter(|peer| !peer.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn subscription_ttl(&self) -> Duration {
        Duration::from_secs(self.subscription_ttl_secs)
    }
}

/// Fixed retry shape used while connecting and subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub dial_attempts: u32,
    pub retry_delay: Duration,
    pub peer_wait_timeout: Duration,
    pub max_resubscribes: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            dial_attempts: 5,
            retry_delay: Duration::from_millis(500),
            peer_wait_timeout: Duration::from_millis(5000),
            max_resubscribes: 3,
        }
    }
}
