//! In-process transport.
//!
//! A [`MemoryNetwork`] connects any number of [`MemoryChannel`] endpoints.
//! Tests use it to flip a peer out of range, disconnect it mid-call, switch a
//! device's transport off, or inject raw (duplicate, malformed) messages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{Message, MessageChannel, Node, NodeId, INBOUND_CAPACITY};
use crate::error::{Error, Result};

#[derive(Debug)]
struct PeerSlot {
    display_name: String,
    inbound: broadcast::Sender<Message>,
    connected: bool,
    nearby: bool,
}

#[derive(Debug, Default)]
struct NetworkState {
    peers: HashMap<NodeId, PeerSlot>,
    /// Join order, which is also discovery order
    order: Vec<NodeId>,
}

/// Shared medium linking in-memory endpoints.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a new endpoint. Re-joining with the same id replaces the old slot.
    pub fn join(&self, id: impl Into<NodeId>, display_name: &str) -> MemoryChannel {
        let id = id.into();
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);

        let mut state = self.lock();
        if !state.order.contains(&id) {
            state.order.push(id.clone());
        }
        state.peers.insert(
            id.clone(),
            PeerSlot {
                display_name: display_name.to_string(),
                inbound: inbound.clone(),
                connected: true,
                nearby: true,
            },
        );
        drop(state);

        MemoryChannel {
            id,
            network: self.clone(),
            inbound,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Mark a node as connected or not. Disconnected nodes are neither
    /// discoverable nor reachable.
    pub fn set_connected(&self, id: &NodeId, connected: bool) {
        if let Some(slot) = self.lock().peers.get_mut(id) {
            slot.connected = connected;
        }
    }

    /// Mark a node as nearby or not.
    pub fn set_nearby(&self, id: &NodeId, nearby: bool) {
        if let Some(slot) = self.lock().peers.get_mut(id) {
            slot.nearby = nearby;
        }
    }

    /// Deliver a raw message to `to`, bypassing all reachability checks.
    pub fn inject(&self, to: &NodeId, message: Message) {
        if let Some(slot) = self.lock().peers.get(to) {
            let _ = slot.inbound.send(message);
        }
    }
}

/// One endpoint on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryChannel {
    id: NodeId,
    network: MemoryNetwork,
    inbound: broadcast::Sender<Message>,
    enabled: Arc<AtomicBool>,
}

impl MemoryChannel {
    /// Switch this endpoint's transport on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    fn local_id(&self) -> &NodeId {
        &self.id
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn discover_nodes(&self) -> Result<Vec<Node>> {
        if !self.is_enabled() {
            return Err(Error::TransportDisabled);
        }

        let state = self.network.lock();
        let self_connected = state.peers.get(&self.id).is_some_and(|s| s.connected);
        if !self_connected {
            return Ok(Vec::new());
        }

        Ok(state
            .order
            .iter()
            .filter(|id| **id != self.id)
            .filter_map(|id| {
                state.peers.get(id).filter(|s| s.connected).map(|s| Node {
                    id: id.clone(),
                    display_name: s.display_name.clone(),
                    is_nearby: s.nearby,
                })
            })
            .collect())
    }

    async fn send(&self, node: &NodeId, path: &str, payload: &[u8]) -> Result<()> {
        if !self.is_enabled() {
            return Err(Error::TransportDisabled);
        }

        let state = self.network.lock();
        let self_connected = state.peers.get(&self.id).is_some_and(|s| s.connected);
        let target = state
            .peers
            .get(node)
            .filter(|s| s.connected && self_connected)
            .ok_or_else(|| Error::PeerUnreachable(node.clone()))?;

        let _ = target
            .inbound
            .send(Message::new(path, payload.to_vec(), self.id.clone()));
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inbound.subscribe()
    }
}
