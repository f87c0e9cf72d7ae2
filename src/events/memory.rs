//! In-process event channel
//!
//! Single-process stand-in for the durable transport. Delivery is
//! sequential: `publish` awaits every subscriber before returning, which
//! is what guarantees that two events for the same run are never handled
//! concurrently.

use crate::events::{EventChannel, EventHandler, PipelineEvent, Subscription};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// In-memory publish/subscribe channel
#[derive(Default)]
pub struct InMemoryEventChannel {
    handlers: RwLock<HashMap<String, Vec<(u64, EventHandler)>>>,
    next_token: AtomicU64,
}

impl InMemoryEventChannel {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Number of live subscriptions on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.handlers
            .read()
            .expect("handler map poisoned")
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventChannel for InMemoryEventChannel {
    async fn publish(&self, channel: &str, event: PipelineEvent) -> Result<()> {
        // Snapshot under the read lock, then dispatch without holding it
        // so handlers can subscribe/unsubscribe while we deliver.
        let subscribers: Vec<EventHandler> = {
            let handlers = self.handlers.read().expect("handler map poisoned");
            handlers
                .get(channel)
                .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default()
        };

        for handler in subscribers {
            handler(event.clone()).await;
        }

        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: EventHandler) -> Result<Subscription> {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let mut handlers = self.handlers.write().expect("handler map poisoned");
        handlers
            .entry(channel.to_string())
            .or_default()
            .push((token, handler));

        Ok(Subscription {
            channel: channel.to_string(),
            token,
        })
    }

    async fn unsubscribe(&self, subscription: Subscription) -> Result<()> {
        let mut handlers = self.handlers.write().expect("handler map poisoned");
        if let Some(subs) = handlers.get_mut(&subscription.channel) {
            subs.retain(|(token, _)| *token != subscription.token);
            if subs.is_empty() {
                handlers.remove(&subscription.channel);
            }
        }
        Ok(())
    }
}
