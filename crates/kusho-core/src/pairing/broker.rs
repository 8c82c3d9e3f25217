//! Companion-side handling of inbound pairing requests.
//!
//! Requests are queued in arrival order and the front of the queue is
//! published as the request awaiting a decision. A second request from a node
//! that is already queued replaces the earlier one in place.
//!
//! [`PairingRequestBroker::accept`] and [`PairingRequestBroker::decline`] only
//! act when the node matches the request currently shown; anything else is a
//! stale tap and is ignored.
//!
//! The accepted node is written to a [`PairingStore`] so a restarted companion
//! keeps talking to a wearable that still considers itself paired. A request
//! from that node never reaches the queue: it is answered with another
//! acceptance straight away.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::channel::{Message, MessageChannel, NodeId};
use crate::error::Result;
use crate::protocol::{self, PairingRequestPayload, Path};
use crate::state::{StateHolder, StateReader};

use super::record::{PairingStore, SharedPairingStore};

/// A pairing request waiting for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRequest {
    /// Node that asked
    pub node_id: NodeId,
    /// Name the peripheral gave for itself
    pub watch_name: String,
    /// When the request arrived
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Requests {
    queue: VecDeque<PairingRequest>,
    /// Mirrors `paired_node` without the state slot's apply lag
    paired: Option<NodeId>,
}

struct BrokerInner {
    channel: Arc<dyn MessageChannel>,
    store: SharedPairingStore,
    requests: Mutex<Requests>,
    pending: StateHolder<Option<PairingRequest>>,
    paired_node: StateHolder<Option<NodeId>>,
    listener: Mutex<Option<CancellationToken>>,
}

/// Queue of inbound pairing requests with accept/decline actions.
#[derive(Clone)]
pub struct PairingRequestBroker {
    inner: Arc<BrokerInner>,
}

impl std::fmt::Debug for PairingRequestBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingRequestBroker")
            .field("queued", &self.queued_len())
            .finish_non_exhaustive()
    }
}

impl PairingRequestBroker {
    /// Create a broker that remembers its pairing only in memory.
    pub fn new(channel: Arc<dyn MessageChannel>) -> Self {
        Self::with_store(channel, PairingStore::in_memory().shared())
    }

    /// Create a broker backed by `store`. A pairing already in the record is
    /// restored. Call [`start`](Self::start) to begin listening.
    pub fn with_store(channel: Arc<dyn MessageChannel>, store: SharedPairingStore) -> Self {
        let paired = {
            let guard = store.lock().unwrap_or_else(PoisonError::into_inner);
            let record = guard.record();
            record.paired_node_id.clone().filter(|_| record.is_paired)
        };
        if let Some(node) = &paired {
            tracing::info!("Restored pairing with {}", node);
        }

        Self {
            inner: Arc::new(BrokerInner {
                channel,
                store,
                requests: Mutex::new(Requests {
                    queue: VecDeque::new(),
                    paired: paired.clone(),
                }),
                pending: StateHolder::new("pending pairing request", None),
                paired_node: StateHolder::new("paired node", paired),
                listener: Mutex::new(None),
            }),
        }
    }

    fn requests(&self) -> MutexGuard<'_, Requests> {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reader for the request awaiting a decision.
    #[must_use]
    pub fn pending(&self) -> StateReader<Option<PairingRequest>> {
        self.inner.pending.reader()
    }

    /// Reader for the node we last accepted.
    #[must_use]
    pub fn paired_node(&self) -> StateReader<Option<NodeId>> {
        self.inner.paired_node.reader()
    }

    /// Wait until all published updates have been applied.
    ///
    /// # Errors
    ///
    /// Returns an error if a state slot is closed.
    pub async fn flush(&self) -> Result<()> {
        self.inner.pending.flush().await?;
        self.inner.paired_node.flush().await
    }

    /// The request at the front of the queue.
    #[must_use]
    pub fn current(&self) -> Option<PairingRequest> {
        self.requests().queue.front().cloned()
    }

    /// Number of requests waiting, including the current one.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.requests().queue.len()
    }

    /// Whether `node` is the node we are paired with.
    #[must_use]
    pub fn is_paired_with(&self, node: &NodeId) -> bool {
        self.requests().paired.as_ref() == Some(node)
    }

    /// Start the listener task. Idempotent.
    pub fn start(&self) {
        let mut listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if listener.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let inbox = self.inner.channel.subscribe();
        let broker = self.clone();
        let loop_cancel = cancel.clone();
        tokio::spawn(async move { broker.listen(inbox, loop_cancel).await });

        *listener = Some(cancel);
        tracing::debug!("Pairing request listener started");
    }

    /// Stop the listener task. Queued requests are kept.
    pub fn stop(&self) {
        let token = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    async fn listen(&self, mut inbox: broadcast::Receiver<Message>, cancel: CancellationToken) {
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => break,
                received = inbox.recv() => match received {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Pairing listener lagged, {} messages skipped", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            if message.is(Path::PairingRequest) && self.is_paired_with(&message.source) {
                self.reacknowledge(&message.source).await;
                continue;
            }
            if let Err(e) = self.handle_message(&message) {
                tracing::warn!("Dropping pairing request from {}: {}", message.source, e);
            }
        }
    }

    /// Process one inbound message. Non-request paths, and requests from the
    /// node we are already paired with, are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::MalformedPayload`] if the request cannot be
    /// decoded; the queue is left untouched.
    pub fn handle_message(&self, message: &Message) -> Result<()> {
        if !message.is(Path::PairingRequest) {
            return Ok(());
        }

        let payload: PairingRequestPayload =
            protocol::decode_payload(Path::PairingRequest.as_str(), &message.payload)?;
        let request = PairingRequest {
            node_id: message.source.clone(),
            watch_name: payload.watch_name,
            received_at: Utc::now(),
        };

        let mut requests = self.requests();
        if requests.paired.as_ref() == Some(&request.node_id) {
            tracing::debug!("Ignoring repeat request from paired {}", request.node_id);
            return Ok(());
        }

        let queue = &mut requests.queue;
        if let Some(existing) = queue.iter_mut().find(|r| r.node_id == request.node_id) {
            tracing::debug!("Replacing queued pairing request from {}", request.node_id);
            *existing = request;
        } else {
            tracing::info!(
                "Pairing request from {} ({})",
                request.watch_name,
                request.node_id
            );
            queue.push_back(request);
        }
        self.inner.pending.set(queue.front().cloned());
        Ok(())
    }

    /// Accept the current request if it came from `node`.
    ///
    /// Returns `Ok(false)` without sending anything when `node` is not the
    /// current request.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the acceptance cannot be delivered. The
    /// request is still removed from the queue.
    pub async fn accept(&self, node: &NodeId) -> Result<bool> {
        if !self.take_current(node) {
            return Ok(false);
        }

        self.inner
            .channel
            .send(node, Path::PairingAccepted.as_str(), &[])
            .await?;
        self.set_paired(Some(node.clone()));
        tracing::info!("Accepted pairing with {}", node);
        Ok(true)
    }

    /// Answer a repeat request from the paired node.
    async fn reacknowledge(&self, node: &NodeId) {
        tracing::debug!("Re-acknowledging pairing with {}", node);
        if let Err(e) = self
            .inner
            .channel
            .send(node, Path::PairingAccepted.as_str(), &[])
            .await
        {
            tracing::warn!("Failed to re-acknowledge {}: {}", node, e);
        }
    }

    /// Decline the current request if it came from `node`.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the decline cannot be delivered.
    pub async fn decline(&self, node: &NodeId) -> Result<bool> {
        if !self.take_current(node) {
            return Ok(false);
        }

        self.inner
            .channel
            .send(node, Path::PairingDeclined.as_str(), &[])
            .await?;
        tracing::info!("Declined pairing with {}", node);
        Ok(true)
    }

    /// Forget the accepted node.
    pub fn unpair(&self) {
        self.set_paired(None);
    }

    fn set_paired(&self, node: Option<NodeId>) {
        let mut requests = self.requests();
        let mut store = self
            .inner
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let saved = match &node {
            Some(node) => store.mark_paired(node.clone()),
            None => store.clear(),
        };
        if let Err(e) = saved {
            tracing::warn!("Failed to save pairing record: {}", e);
        }
        drop(store);

        requests.paired.clone_from(&node);
        self.inner.paired_node.set(node);
    }

    fn take_current(&self, node: &NodeId) -> bool {
        let mut requests = self.requests();
        if requests.queue.front().map(|r| &r.node_id) != Some(node) {
            tracing::debug!("Ignoring stale pairing action for {}", node);
            return false;
        }
        requests.queue.pop_front();
        self.inner.pending.set(requests.queue.front().cloned());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::MemoryNetwork;
    use crate::Error;

    fn request_message(from: &str, name: &str) -> Message {
        let payload = protocol::encode_payload(&PairingRequestPayload {
            watch_name: name.to_string(),
        })
        .unwrap();
        Message::new(Path::PairingRequest.as_str(), payload, NodeId::from(from))
    }

    #[tokio::test]
    async fn test_requests_queue_in_arrival_order() {
        let network = MemoryNetwork::new();
        let broker = PairingRequestBroker::new(Arc::new(network.join("phone", "Phone")));

        broker.handle_message(&request_message("w1", "Watch1")).unwrap();
        broker.handle_message(&request_message("w2", "Watch2")).unwrap();
        broker.flush().await.unwrap();

        assert_eq!(broker.queued_len(), 2);
        let pending = broker.pending().peek().unwrap();
        assert_eq!(pending.node_id, NodeId::from("w1"));
        assert_eq!(pending.watch_name, "Watch1");
    }

    #[tokio::test]
    async fn test_repeat_request_replaces_entry() {
        let network = MemoryNetwork::new();
        let broker = PairingRequestBroker::new(Arc::new(network.join("phone", "Phone")));

        broker.handle_message(&request_message("w1", "Watch1")).unwrap();
        broker.handle_message(&request_message("w1", "Watch1 renamed")).unwrap();

        assert_eq!(broker.queued_len(), 1);
        assert_eq!(broker.current().unwrap().watch_name, "Watch1 renamed");
    }

    #[tokio::test]
    async fn test_stale_accept_is_noop() {
        let network = MemoryNetwork::new();
        let watch = network.join("w1", "Watch1");
        let broker = PairingRequestBroker::new(Arc::new(network.join("phone", "Phone")));
        let mut inbox = watch.subscribe();

        broker.handle_message(&request_message("w1", "Watch1")).unwrap();
        assert!(!broker.accept(&NodeId::from("w2")).await.unwrap());

        assert_eq!(broker.queued_len(), 1);
        assert!(inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_accept_sends_and_advances() {
        let network = MemoryNetwork::new();
        let watch = network.join("w1", "Watch1");
        let _other = network.join("w2", "Watch2");
        let broker = PairingRequestBroker::new(Arc::new(network.join("phone", "Phone")));
        let mut inbox = watch.subscribe();

        broker.handle_message(&request_message("w1", "Watch1")).unwrap();
        broker.handle_message(&request_message("w2", "Watch2")).unwrap();
        assert!(broker.accept(&NodeId::from("w1")).await.unwrap());
        broker.flush().await.unwrap();

        let reply = inbox.recv().await.unwrap();
        assert!(reply.is_from(Path::PairingAccepted, &NodeId::from("phone")));
        assert_eq!(broker.paired_node().peek(), Some(NodeId::from("w1")));
        assert_eq!(broker.pending().peek().unwrap().node_id, NodeId::from("w2"));
    }

    #[tokio::test]
    async fn test_decline_does_not_pair() {
        let network = MemoryNetwork::new();
        let watch = network.join("w1", "Watch1");
        let broker = PairingRequestBroker::new(Arc::new(network.join("phone", "Phone")));
        let mut inbox = watch.subscribe();

        broker.handle_message(&request_message("w1", "Watch1")).unwrap();
        assert!(broker.decline(&NodeId::from("w1")).await.unwrap());
        broker.flush().await.unwrap();

        assert!(inbox.recv().await.unwrap().is(Path::PairingDeclined));
        assert!(broker.paired_node().peek().is_none());
        assert!(broker.pending().peek().is_none());
    }

    #[tokio::test]
    async fn test_malformed_request_rejected() {
        let network = MemoryNetwork::new();
        let broker = PairingRequestBroker::new(Arc::new(network.join("phone", "Phone")));

        let message = Message::new(
            Path::PairingRequest.as_str(),
            b"not json".to_vec(),
            NodeId::from("w1"),
        );
        let err = broker.handle_message(&message).unwrap_err();

        assert!(matches!(err, Error::MalformedPayload { .. }));
        assert_eq!(broker.queued_len(), 0);
    }

    #[tokio::test]
    async fn test_listener_receives_requests() {
        let network = MemoryNetwork::new();
        let watch = network.join("w1", "Watch1");
        let broker = PairingRequestBroker::new(Arc::new(network.join("phone", "Phone")));
        broker.start();

        let payload = protocol::encode_payload(&PairingRequestPayload {
            watch_name: "Watch1".to_string(),
        })
        .unwrap();
        watch
            .send(&NodeId::from("phone"), Path::PairingRequest.as_str(), &payload)
            .await
            .unwrap();

        let request = broker
            .pending()
            .wait_until(Option::is_some)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.node_id, NodeId::from("w1"));
        broker.stop();
    }

    #[tokio::test]
    async fn test_repeat_request_after_accept_is_dropped() {
        let network = MemoryNetwork::new();
        let _watch = network.join("w1", "Watch1");
        let broker = PairingRequestBroker::new(Arc::new(network.join("phone", "Phone")));

        broker.handle_message(&request_message("w1", "Watch1")).unwrap();
        assert!(broker.accept(&NodeId::from("w1")).await.unwrap());
        broker.handle_message(&request_message("w1", "Watch1")).unwrap();
        broker.flush().await.unwrap();

        assert_eq!(broker.queued_len(), 0);
        assert!(broker.current().is_none());
        assert!(broker.pending().peek().is_none());
        assert!(broker.is_paired_with(&NodeId::from("w1")));
    }

    #[tokio::test]
    async fn test_listener_reacknowledges_paired_node() {
        let network = MemoryNetwork::new();
        let watch = network.join("w1", "Watch1");
        let broker = PairingRequestBroker::new(Arc::new(network.join("phone", "Phone")));
        broker.handle_message(&request_message("w1", "Watch1")).unwrap();
        assert!(broker.accept(&NodeId::from("w1")).await.unwrap());
        broker.start();

        let mut inbox = watch.subscribe();
        let payload = protocol::encode_payload(&PairingRequestPayload {
            watch_name: "Watch1".to_string(),
        })
        .unwrap();
        watch
            .send(&NodeId::from("phone"), Path::PairingRequest.as_str(), &payload)
            .await
            .unwrap();

        let reply = inbox.recv().await.unwrap();
        assert!(reply.is_from(Path::PairingAccepted, &NodeId::from("phone")));
        assert_eq!(broker.queued_len(), 0);
        broker.stop();
    }

    #[tokio::test]
    async fn test_pairing_restored_from_store() {
        let network = MemoryNetwork::new();
        let _watch = network.join("w1", "Watch1");
        let phone: Arc<dyn MessageChannel> = Arc::new(network.join("phone", "Phone"));
        let store = PairingStore::in_memory().shared();

        let broker = PairingRequestBroker::with_store(Arc::clone(&phone), Arc::clone(&store));
        broker.handle_message(&request_message("w1", "Watch1")).unwrap();
        assert!(broker.accept(&NodeId::from("w1")).await.unwrap());
        assert_eq!(
            store.lock().unwrap().record().paired_node_id,
            Some(NodeId::from("w1"))
        );

        let restarted = PairingRequestBroker::with_store(phone, Arc::clone(&store));
        assert_eq!(restarted.paired_node().peek(), Some(NodeId::from("w1")));
        assert!(restarted.is_paired_with(&NodeId::from("w1")));

        restarted.unpair();
        restarted.flush().await.unwrap();
        assert!(restarted.paired_node().peek().is_none());
        assert!(!store.lock().unwrap().record().is_paired);
    }
}
