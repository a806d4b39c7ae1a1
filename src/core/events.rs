// src/core/events.rs

//! A broadcast bus surfacing cluster happenings to the embedding server:
//! forwarded PUBLISH payloads from the cluster bus and aggregate state
//! transitions the server may want to expose to clients.

use bytes::Bytes;
use tokio::sync::broadcast;

const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum ClusterEvent {
    /// A PUBLISH frame forwarded by another node over the cluster bus.
    ForwardedPublish { channel: Bytes, message: Bytes },
    /// The aggregate cluster state flipped between OK and FAIL.
    StateChanged { ok: bool },
    /// This node changed role (master <-> replica).
    RoleChanged { master: bool },
}

/// The distribution hub for cluster events. Sends never fail: with no
/// subscriber attached the event is simply dropped.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<ClusterEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: ClusterEvent) {
        let _ = self.tx.send(event);
    }
}
