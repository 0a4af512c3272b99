//! Publish/subscribe fan-out for the coordination store.
//!
//! One tokio broadcast channel per named channel: O(1) publish regardless of
//! subscriber count, and every subscriber gets an independent receiver that
//! buffers up to `capacity` messages. A lagging subscriber drops messages on
//! its own receiver; the publisher never blocks and never fails because
//! nobody is listening.
//!
//! The bus is always node-local. With the NATS backend a per-channel
//! forwarder task feeds messages from other processes into it, so local
//! subscribers see one stream whichever node published.
//!
//! ```text
//! publish("resource:document:d1", msg)
//!        │
//!        ▼
//!   ChannelBus ── "resource:document:d1" ── broadcast::Sender
//!                                              ├──► node-a forwarder
//!                                              └──► node-b forwarder
//! ```

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Per-channel counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub messages_published: u64,
    pub messages_undelivered: u64,
    pub subscribers: usize,
}

struct Channel {
    sender: broadcast::Sender<Arc<str>>,
    published: AtomicU64,
    /// Publishes that found no subscriber
    undelivered: AtomicU64,
}

impl Channel {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            published: AtomicU64::new(0),
            undelivered: AtomicU64::new(0),
        }
    }
}

/// Receiving end of a channel subscription.
pub struct Subscription {
    channel: String,
    receiver: broadcast::Receiver<Arc<str>>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next message, skipping over any lag gap.
    ///
    /// Returns `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        loop {
            match self.receiver.recv().await {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Subscriber on {} lagged by {n} messages", self.channel);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive, for polling in tests and drains.
    pub fn try_recv(&mut self) -> Option<Arc<str>> {
        loop {
            match self.receiver.try_recv() {
                Ok(msg) => return Some(msg),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Named channels → broadcast senders.
pub struct ChannelBus {
    channels: DashMap<String, Arc<Channel>>,
    capacity: usize,
}

impl ChannelBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn channel(&self, name: &str) -> Arc<Channel> {
        // Fast path: shared shard lock
        if let Some(channel) = self.channels.get(name) {
            return channel.clone();
        }
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Channel::new(self.capacity)))
            .clone()
    }

    /// Publish to every current subscriber. Returns how many receivers the
    /// message reached (0 is not an error).
    pub fn publish(&self, name: &str, message: impl Into<Arc<str>>) -> usize {
        let channel = self.channel(name);
        channel.published.fetch_add(1, Ordering::Relaxed);
        match channel.sender.send(message.into()) {
            Ok(count) => count,
            Err(_) => {
                channel.undelivered.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self, name: &str) -> Subscription {
        Subscription {
            channel: name.to_string(),
            receiver: self.channel(name).sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.channels
            .get(name)
            .map_or(0, |c| c.sender.receiver_count())
    }

    pub fn stats(&self, name: &str) -> ChannelStats {
        match self.channels.get(name) {
            Some(c) => ChannelStats {
                messages_published: c.published.load(Ordering::Relaxed),
                messages_undelivered: c.undelivered.load(Ordering::Relaxed),
                subscribers: c.sender.receiver_count(),
            },
            None => ChannelStats::default(),
        }
    }

    /// Drop channels nobody listens to. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let before = self.channels.len();
        self.channels.retain(|_, c| c.sender.receiver_count() > 0);
        before.saturating_sub(self.channels.len())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}
