//! Per-deployment event broadcast.
//!
//! Each deployment with at least one subscriber owns its own broadcast
//! channel, so delivery for one stack never waits on another. Dropping the
//! last [`Subscription`] of a deployment removes its channel.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::deployment::{DeploymentLog, DeploymentStatus};

/// Default per-deployment channel capacity
pub const DEFAULT_CAPACITY: usize = 64;

/// Event published for a deployment
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StatusChanged {
        deployment_id: String,
        from: DeploymentStatus,
        to: DeploymentStatus,
        at: DateTime<Utc>,
    },
    Log(DeploymentLog),
    Deleted {
        deployment_id: String,
    },
}

type Channels = DashMap<String, broadcast::Sender<LifecycleEvent>>;

/// Registry of per-deployment channels
#[derive(Debug, Clone)]
pub struct EventHub {
    channels: Arc<Channels>,
    capacity: usize,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Subscribe to one deployment's events
    pub fn subscribe(&self, deployment_id: &str) -> Subscription {
        let receiver = self
            .channels
            .entry(deployment_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Subscription {
            deployment_id: deployment_id.to_string(),
            receiver,
            channels: Arc::clone(&self.channels),
        }
    }

    /// Deliver an event; a deployment nobody watches costs nothing
    pub fn publish(&self, deployment_id: &str, event: LifecycleEvent) {
        if let Some(sender) = self.channels.get(deployment_id) {
            let _ = sender.send(event);
        }
    }

    pub fn subscriber_count(&self, deployment_id: &str) -> usize {
        self.channels
            .get(deployment_id)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    /// Deployments that currently have a channel
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

/// Handle to a deployment's event stream; dropping it unsubscribes
#[derive(Debug)]
pub struct Subscription {
    deployment_id: String,
    receiver: broadcast::Receiver<LifecycleEvent>,
    channels: Arc<Channels>,
}

impl Subscription {
    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// Next event, skipping any this subscriber was too slow to receive
    pub async fn recv(&mut self) -> Option<LifecycleEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(
                        "Subscriber of {} lagged, skipped {} events",
                        self.deployment_id, skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<LifecycleEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // `self.receiver` is still alive here, so a count of one means last
        self.channels
            .remove_if(&self.deployment_id, |_, sender| sender.receiver_count() <= 1);
    }
}
