use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Result;
use crate::interfaces::transport::SubscriptionHandle;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub struct SubscriptionEntry {
    pub handle: Box<dyn SubscriptionHandle>,
    /// Absolute expiry, milliseconds since the epoch. Advisory unless a
    /// sweep is running.
    pub expires_at_ms: u64,
    dispatcher: Option<JoinHandle<()>>,
}

impl SubscriptionEntry {
    async fn release(self, topic: &str) -> Result<()> {
        if let Some(dispatcher) = self.dispatcher {
            dispatcher.abort();
        }
        let released = self.handle.unsubscribe().await;
        if let Err(err) = &released {
            warn!(topic, error = %err, "transport unsubscribe failed");
        }
        released
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub topic: String,
    pub expires_at_ms: u64,
}

/// Concrete topic -> live subscription. The only owner of transport
/// subscription handles once they are registered.
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, SubscriptionEntry>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Stores the entry, releasing any handle it replaces.
    pub async fn put(
        &self,
        topic: &str,
        handle: Box<dyn SubscriptionHandle>,
        dispatcher: Option<JoinHandle<()>>,
        ttl: Duration,
    ) {
        let entry = SubscriptionEntry {
            handle,
            expires_at_ms: now_ms().saturating_add(ttl.as_millis() as u64),
            dispatcher,
        };
        let replaced = self.entries.lock().await.insert(topic.to_string(), entry);
        if let Some(previous) = replaced {
            info!(topic, "replacing existing subscription");
            let _ = previous.release(topic).await;
        }
    }

    /// Releases a handle that was never registered, such as one the
    /// transport reported lost before it could be confirmed.
    pub async fn discard(
        &self,
        topic: &str,
        handle: Box<dyn SubscriptionHandle>,
        dispatcher: Option<JoinHandle<()>>,
    ) {
        let entry = SubscriptionEntry {
            handle,
            expires_at_ms: 0,
            dispatcher,
        };
        let _ = entry.release(topic).await;
    }

    pub async fn get(&self, topic: &str) -> Option<SubscriptionInfo> {
        let entries = self.entries.lock().await;
        entries.get(topic).map(|entry| SubscriptionInfo {
            topic: topic.to_string(),
            expires_at_ms: entry.expires_at_ms,
        })
    }

    pub async fn contains(&self, topic: &str) -> bool {
        self.entries.lock().await.contains_key(topic)
    }

    /// Releases the handle and drops the entry. `Ok(false)` when nothing
    /// was registered for the topic.
    pub async fn remove(&self, topic: &str) -> Result<bool> {
        let entry = self.entries.lock().await.remove(topic);
        match entry {
            Some(entry) => {
                entry.release(topic).await?;
                Ok(true)
            }
            None => {
                warn!(topic, "no subscription found for topic");
                Ok(false)
            }
        }
    }

    pub async fn topics(&self) -> Vec<String> {
        let entries = self.entries.lock().await;
        let mut topics: Vec<String> = entries.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn expired_topics(&self, now_ms: u64) -> Vec<String> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .filter(|(_, entry)| entry.expires_at_ms <= now_ms)
            .map(|(topic, _)| topic.clone())
            .collect()
    }

    /// Unsubscribes and removes every entry whose expiry has passed.
    pub async fn sweep_expired(&self, now_ms: u64) -> Vec<String> {
        let expired: Vec<(String, SubscriptionEntry)> = {
            let mut entries = self.entries.lock().await;
            let topics: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.expires_at_ms <= now_ms)
                .map(|(topic, _)| topic.clone())
                .collect();
            topics
                .into_iter()
                .filter_map(|topic| entries.remove(&topic).map(|entry| (topic, entry)))
                .collect()
        };

        let mut removed = Vec::with_capacity(expired.len());
        for (topic, entry) in expired {
            info!(topic = %topic, "subscription expired");
            let _ = entry.release(&topic).await;
            removed.push(topic);
        }
        removed.sort();
        removed
    }
}
