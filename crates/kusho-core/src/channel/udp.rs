//! UDP transport for devices on the same LAN.
//!
//! ## Protocol
//!
//! Every datagram is a JSON envelope:
//!
//! ```json
//! {
//!   "protocol": "kusho",
//!   "version": "1.0",
//!   "kind": "message",
//!   "source_id": "3f0c…",
//!   "source_name": "Watch1",
//!   "path": "/kusho/ping",
//!   "payload": "cGluZw=="
//! }
//! ```
//!
//! `kind: "beacon"` envelopes are broadcast every `beacon_interval` and carry
//! no path. A peer is reachable while its beacons keep arriving within
//! `peer_ttl`, and nearby while they arrive within `nearby_window`.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Message, MessageChannel, Node, NodeId, INBOUND_CAPACITY};
use crate::config::TransportConfig;
use crate::error::{Error, Result};

/// Largest datagram accepted.
const MAX_DATAGRAM: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum EnvelopeKind {
    Beacon,
    Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    protocol: String,
    version: String,
    kind: EnvelopeKind,
    source_id: NodeId,
    source_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    payload: String,
}

impl Envelope {
    fn beacon(source_id: &NodeId, source_name: &str) -> Self {
        Self {
            protocol: "kusho".to_string(),
            version: crate::PROTOCOL_VERSION.to_string(),
            kind: EnvelopeKind::Beacon,
            source_id: source_id.clone(),
            source_name: source_name.to_string(),
            path: String::new(),
            payload: String::new(),
        }
    }

    fn message(source_id: &NodeId, source_name: &str, path: &str, payload: &[u8]) -> Self {
        Self {
            kind: EnvelopeKind::Message,
            path: path.to_string(),
            payload: BASE64_STANDARD.encode(payload),
            ..Self::beacon(source_id, source_name)
        }
    }

    fn is_valid(&self) -> bool {
        self.protocol == "kusho" && self.version == crate::PROTOCOL_VERSION
    }
}

#[derive(Debug, Clone)]
struct PeerEntry {
    display_name: String,
    addr: SocketAddr,
    first_seen: Instant,
    last_seen: Instant,
}

#[derive(Debug, Default)]
struct PeerTable {
    peers: HashMap<NodeId, PeerEntry>,
}

impl PeerTable {
    /// Record traffic from a peer and drop peers silent for over `peer_ttl`.
    fn observe(
        &mut self,
        id: NodeId,
        display_name: String,
        addr: SocketAddr,
        peer_ttl: Duration,
    ) {
        let now = Instant::now();
        self.peers
            .retain(|_, entry| now.duration_since(entry.last_seen) <= peer_ttl);
        self.peers
            .entry(id)
            .and_modify(|entry| {
                entry.display_name.clone_from(&display_name);
                entry.addr = addr;
                entry.last_seen = now;
            })
            .or_insert(PeerEntry {
                display_name,
                addr,
                first_seen: now,
                last_seen: now,
            });
    }

    fn live(&self, peer_ttl: Duration) -> Vec<(&NodeId, &PeerEntry)> {
        let now = Instant::now();
        let mut live: Vec<_> = self
            .peers
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_seen) <= peer_ttl)
            .collect();
        live.sort_by_key(|(_, entry)| entry.first_seen);
        live
    }
}

struct Shared {
    id: NodeId,
    display_name: String,
    socket: UdpSocket,
    port: u16,
    config: TransportConfig,
    peers: Mutex<PeerTable>,
    inbound: broadcast::Sender<Message>,
    enabled: AtomicBool,
}

impl Shared {
    fn peers(&self) -> MutexGuard<'_, PeerTable> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// LAN transport over UDP broadcast and unicast.
pub struct UdpChannel {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for UdpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpChannel")
            .field("id", &self.shared.id)
            .field("port", &self.shared.port)
            .finish_non_exhaustive()
    }
}

impl UdpChannel {
    /// Bind the transport and start beaconing and listening.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound.
    pub async fn bind(id: NodeId, display_name: &str, config: &TransportConfig) -> Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;

        socket.set_broadcast(true)?;
        socket.set_reuse_address(true)?;

        #[cfg(target_os = "macos")]
        socket.set_reuse_port(true)?;

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
        socket.bind(&addr.into())?;

        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        let port = socket.local_addr()?.port();

        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        let shared = Arc::new(Shared {
            id,
            display_name: display_name.to_string(),
            socket,
            port,
            config: config.clone(),
            peers: Mutex::new(PeerTable::default()),
            inbound,
            enabled: AtomicBool::new(true),
        });

        let shutdown = CancellationToken::new();
        tokio::spawn(Self::beacon_loop(Arc::clone(&shared), shutdown.clone()));
        tokio::spawn(Self::receive_loop(Arc::clone(&shared), shutdown.clone()));

        tracing::info!(
            "UDP transport bound on port {} as {} ({})",
            port,
            shared.display_name,
            shared.id
        );

        Ok(Self { shared, shutdown })
    }

    /// Port the transport is bound to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Switch the transport on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::SeqCst);
    }

    async fn beacon_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
        let broadcast_addr = SocketAddrV4::new(Ipv4Addr::BROADCAST, shared.port);
        let beacon = Envelope::beacon(&shared.id, &shared.display_name);

        let json = match serde_json::to_vec(&beacon) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize beacon: {}", e);
                return;
            }
        };

        loop {
            if shared.enabled.load(Ordering::SeqCst) {
                if let Err(e) = shared.socket.send_to(&json, broadcast_addr).await {
                    tracing::warn!("Failed to send beacon: {}", e);
                }
            }

            tokio::select! {
                () = tokio::time::sleep(shared.config.beacon_interval) => {}
                () = shutdown.cancelled() => {
                    tracing::debug!("Beacon loop received shutdown signal");
                    break;
                }
            }
        }
    }

    async fn receive_loop(shared: Arc<Shared>, shutdown: CancellationToken) {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, source) = tokio::select! {
                received = shared.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::warn!("Error receiving datagram: {}", e);
                        continue;
                    }
                },
                () = shutdown.cancelled() => break,
            };

            if !shared.enabled.load(Ordering::SeqCst) {
                continue;
            }

            let Ok(envelope) = serde_json::from_slice::<Envelope>(&buf[..len]) else {
                tracing::debug!("Ignoring non-kusho datagram from {}", source);
                continue;
            };
            if !envelope.is_valid() || envelope.source_id == shared.id {
                continue;
            }

            shared.peers().observe(
                envelope.source_id.clone(),
                envelope.source_name.clone(),
                source,
                shared.config.peer_ttl,
            );

            if envelope.kind == EnvelopeKind::Message {
                match BASE64_STANDARD.decode(envelope.payload.as_bytes()) {
                    Ok(payload) => {
                        let _ = shared.inbound.send(Message::new(
                            envelope.path,
                            payload,
                            envelope.source_id,
                        ));
                    }
                    Err(e) => {
                        tracing::warn!("Dropping message on '{}': bad payload: {}", envelope.path, e);
                    }
                }
            }
        }
    }
}

impl Drop for UdpChannel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl MessageChannel for UdpChannel {
    fn local_id(&self) -> &NodeId {
        &self.shared.id
    }

    fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    async fn discover_nodes(&self) -> Result<Vec<Node>> {
        if !self.is_enabled() {
            return Err(Error::TransportDisabled);
        }

        let now = Instant::now();
        let nearby_window = self.shared.config.nearby_window;
        let peers = self.shared.peers();
        let nodes = peers
            .live(self.shared.config.peer_ttl)
            .into_iter()
            .map(|(id, entry)| Node {
                id: id.clone(),
                display_name: entry.display_name.clone(),
                is_nearby: now.duration_since(entry.last_seen) <= nearby_window,
            })
            .collect();
        drop(peers);
        Ok(nodes)
    }

    async fn send(&self, node: &NodeId, path: &str, payload: &[u8]) -> Result<()> {
        if !self.is_enabled() {
            return Err(Error::TransportDisabled);
        }

        let addr = {
            let peers = self.shared.peers();
            let addr = peers
                .live(self.shared.config.peer_ttl)
                .into_iter()
                .find(|(id, _)| *id == node)
                .map(|(_, entry)| entry.addr);
            addr
        }
        .ok_or_else(|| Error::PeerUnreachable(node.clone()))?;

        let envelope = Envelope::message(&self.shared.id, &self.shared.display_name, path, payload);
        let json = serde_json::to_vec(&envelope).map_err(|e| Error::Serialization(e.to_string()))?;

        self.shared.socket.send_to(&json, addr).await.map_err(|e| {
            tracing::debug!("Send to {} failed: {}", node, e);
            Error::PeerUnreachable(node.clone())
        })?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.shared.inbound.subscribe()
    }
}
