//! Message transport abstraction.
//!
//! A [`MessageChannel`] discovers directly reachable peers and exchanges
//! opaque `(path, payload)` messages with them. Delivery is best effort:
//! messages may be lost, duplicated, or reordered, and a send can fail if the
//! peer dropped off between discovery and the call.
//!
//! Inbound traffic is one multiplexed stream; every component subscribes and
//! filters on the paths it cares about.
//!
//! ## Transports
//!
//! - [`memory::MemoryNetwork`] - in-process fake used by tests and demos
//! - [`udp::UdpChannel`] - LAN transport with broadcast presence beacons

pub mod memory;
pub mod udp;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::Path;

/// Capacity of each inbound broadcast stream.
pub const INBOUND_CAPACITY: usize = 256;

/// Opaque identifier of a peer device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A directly reachable peer, as reported by one discovery call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Peer identifier
    pub id: NodeId,
    /// Human-readable peer name
    pub display_name: String,
    /// Whether the peer is close enough to pair with
    pub is_nearby: bool,
}

/// A transport-level message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Wire path
    pub path: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Node that sent the message
    pub source: NodeId,
}

impl Message {
    /// Create a message.
    #[must_use]
    pub fn new(path: impl Into<String>, payload: impl Into<Vec<u8>>, source: NodeId) -> Self {
        Self {
            path: path.into(),
            payload: payload.into(),
            source,
        }
    }

    /// The parsed path, if it is one Kusho knows.
    #[must_use]
    pub fn kind(&self) -> Option<Path> {
        Path::parse(&self.path)
    }

    /// Whether this message arrived on `path`.
    #[must_use]
    pub fn is(&self, path: Path) -> bool {
        self.path == path.as_str()
    }

    /// Whether this message arrived on `path` from `node`.
    #[must_use]
    pub fn is_from(&self, path: Path, node: &NodeId) -> bool {
        self.is(path) && &self.source == node
    }
}

/// Fallible, asynchronous mailbox to nearby peers.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// This device's own node id.
    fn local_id(&self) -> &NodeId;

    /// Whether the transport medium is switched on.
    fn is_enabled(&self) -> bool;

    /// Enumerate reachable peers. May legitimately return an empty list.
    async fn discover_nodes(&self) -> Result<Vec<Node>>;

    /// Send a message to `node`.
    ///
    /// Fails with [`Error::PeerUnreachable`] if the node is not connected at
    /// send time and [`Error::TransportDisabled`] if the medium is off.
    async fn send(&self, node: &NodeId, path: &str, payload: &[u8]) -> Result<()>;

    /// Subscribe to every inbound message.
    fn subscribe(&self) -> broadcast::Receiver<Message>;
}

/// Wait for the first inbound message accepted by `matches`.
///
/// Races the inbox against `timeout` and `cancel`. Returns `Ok(None)` on
/// timeout and [`Error::Cancelled`] if `cancel` fires first.
pub async fn wait_for<F>(
    inbox: &mut broadcast::Receiver<Message>,
    timeout: Duration,
    cancel: &CancellationToken,
    mut matches: F,
) -> Result<Option<Message>>
where
    F: FnMut(&Message) -> bool,
{
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            received = inbox.recv() => match received {
                Ok(message) if matches(&message) => return Ok(Some(message)),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Inbox lagged, {} messages skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Internal("inbound stream closed".to_string()));
                }
            },
            () = &mut deadline => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_matching() {
        let node = NodeId::from("watch");
        let message = Message::new(Path::Pong.as_str(), Vec::new(), node.clone());

        assert!(message.is(Path::Pong));
        assert!(message.is_from(Path::Pong, &node));
        assert!(!message.is_from(Path::Pong, &NodeId::from("other")));
        assert_eq!(message.kind(), Some(Path::Pong));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out() {
        let (_tx, mut rx) = broadcast::channel::<Message>(4);
        let cancel = CancellationToken::new();

        let result = wait_for(&mut rx, Duration::from_secs(3), &cancel, |_| true).await;
        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_skips_non_matching() {
        let (tx, mut rx) = broadcast::channel::<Message>(4);
        let cancel = CancellationToken::new();
        let node = NodeId::from("n");

        tx.send(Message::new("/other", Vec::new(), node.clone())).unwrap();
        tx.send(Message::new(Path::Pong.as_str(), Vec::new(), node.clone()))
            .unwrap();

        let found = wait_for(&mut rx, Duration::from_secs(1), &cancel, |m| m.is(Path::Pong))
            .await
            .unwrap();
        assert_eq!(found.map(|m| m.path), Some("/kusho/pong".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_cancelled() {
        let (_tx, mut rx) = broadcast::channel::<Message>(4);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = wait_for(&mut rx, Duration::from_secs(30), &cancel, |_| true).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
