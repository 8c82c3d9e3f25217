//! Peripheral-initiated, user-confirmed pairing.
//!
//! One attempt runs these steps, publishing a [`PairingState`] at each one:
//!
//! 1. **Transport check** - a disabled medium ends at [`PairingState::BluetoothOff`]
//! 2. **Discovery** - the first nearby node is the candidate
//! 3. **Liveness** - ping it and wait `pairing.ping_timeout` for the pong
//! 4. **Handshake** - send a pairing request and wait `pairing.acceptance_timeout`
//!    for the user on the companion to accept or decline
//! 5. **Success** - persist the pairing, hold the success screen for
//!    `pairing.success_hold`, then publish [`PairingState::Paired`]
//!
//! Failures of steps 2-4 count against a retry budget of `pairing.max_retries`;
//! once it is spent the attempt ends at [`PairingState::MaxRetriesReached`]
//! and only an explicit [`PairingCoordinator::retry`] or
//! [`PairingCoordinator::skip`] moves on. A decline is not counted.
//!
//! Starting a new attempt cancels the previous one, and anything the old
//! attempt tries to publish afterwards is discarded.

pub mod broker;
pub mod record;

pub use broker::{PairingRequest, PairingRequestBroker};
pub use record::{PairingRecord, PairingStore, SharedPairingStore};

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{self, MessageChannel, Node, NodeId};
use crate::config::PairingConfig;
use crate::error::{Error, Result};
use crate::protocol::{self, PairingRequestPayload, Path, PING_PAYLOAD};
use crate::state::{StateHolder, StateReader};

/// Why a pairing attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingFailure {
    /// Discovery found nobody nearby
    NoPeerFound,
    /// The candidate did not answer the ping
    PeerUnresponsive,
    /// Nobody accepted or declined in time
    NoResponse,
    /// The candidate vanished between discovery and send
    PeerDisconnected,
    /// Some other transport fault
    Transport(String),
}

impl fmt::Display for PairingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPeerFound => f.write_str("no companion found nearby"),
            Self::PeerUnresponsive => f.write_str("companion did not respond"),
            Self::NoResponse => f.write_str("pairing request was not answered"),
            Self::PeerDisconnected => f.write_str("companion disconnected"),
            Self::Transport(reason) => write!(f, "transport error: {reason}"),
        }
    }
}

impl PairingFailure {
    fn from_error(error: &Error) -> Self {
        match error {
            Error::NoPeerFound => Self::NoPeerFound,
            Error::PeerUnresponsive(_) | Error::Timeout(_) => Self::PeerUnresponsive,
            Error::HandshakeTimeout(_) => Self::NoResponse,
            Error::PeerUnreachable(_) => Self::PeerDisconnected,
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Published pairing progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingState {
    /// Nothing attempted yet
    Prompt,
    /// Discovering and pinging
    Checking,
    /// Transport medium is off
    BluetoothOff,
    /// Request sent, waiting for the user on the companion
    WaitingForAcceptance {
        /// Companion the request went to
        node: Node,
    },
    /// Companion accepted; shown briefly before [`PairingState::Paired`]
    Success {
        /// Companion we paired with
        node_id: NodeId,
    },
    /// Pairing is complete
    Paired {
        /// Companion we paired with
        node_id: NodeId,
    },
    /// The user on the companion said no
    Declined,
    /// A counted failure with budget left
    Error {
        /// What went wrong
        failure: PairingFailure,
        /// Failures counted so far
        retry_count: u32,
    },
    /// Retry budget spent
    MaxRetriesReached {
        /// Failures counted
        attempts: u32,
    },
    /// The user chose to continue without a companion
    Skipped,
}

impl PairingState {
    /// Whether an attempt is currently in flight.
    #[must_use]
    pub const fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::Checking | Self::WaitingForAcceptance { .. } | Self::Success { .. }
        )
    }

    /// The paired node, once accepted.
    #[must_use]
    pub const fn paired_node(&self) -> Option<&NodeId> {
        match self {
            Self::Success { node_id } | Self::Paired { node_id } => Some(node_id),
            _ => None,
        }
    }
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prompt => f.write_str("ready to pair"),
            Self::Checking => f.write_str("looking for companion"),
            Self::BluetoothOff => f.write_str("transport is off"),
            Self::WaitingForAcceptance { node } => {
                write!(f, "waiting for {} to accept", node.display_name)
            }
            Self::Success { node_id } => write!(f, "paired with {node_id}"),
            Self::Paired { node_id } => write!(f, "paired with {node_id}"),
            Self::Declined => f.write_str("pairing declined"),
            Self::Error {
                failure,
                retry_count,
            } => write!(f, "{failure} (attempt {retry_count})"),
            Self::MaxRetriesReached { attempts } => {
                write!(f, "gave up after {attempts} attempts")
            }
            Self::Skipped => f.write_str("continuing without companion"),
        }
    }
}

struct Inner {
    channel: Arc<dyn MessageChannel>,
    config: PairingConfig,
    device_name: String,
    store: SharedPairingStore,
    state: StateHolder<PairingState>,
    paired_node: StateHolder<Option<NodeId>>,
    retry_count: AtomicU32,
    generation: Arc<AtomicU64>,
    current: Mutex<Option<CancellationToken>>,
}

/// Drives pairing attempts on the peripheral.
#[derive(Clone)]
pub struct PairingCoordinator {
    inner: Arc<Inner>,
}

impl fmt::Debug for PairingCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingCoordinator")
            .field("state", &self.inner.state.snapshot())
            .field("retry_count", &self.retry_count())
            .finish_non_exhaustive()
    }
}

impl PairingCoordinator {
    /// Create a coordinator.
    ///
    /// The initial state comes from the persisted record: a pending
    /// "show max retries" flag wins (and is consumed), then an existing
    /// pairing, then an earlier skip, otherwise [`PairingState::Prompt`].
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        config: PairingConfig,
        device_name: impl Into<String>,
        store: SharedPairingStore,
    ) -> Self {
        let (initial, paired, retries) = {
            let mut guard = store.lock().unwrap_or_else(PoisonError::into_inner);
            let show_max_retries = guard.record().show_max_retries_on_next_launch;
            if show_max_retries {
                if let Err(e) = guard.take_show_max_retries() {
                    tracing::warn!("Failed to clear max-retries flag: {}", e);
                }
            }

            let record = guard.record();
            let paired_id = record.paired_node_id.clone().filter(|_| record.is_paired);
            let is_skipped = record.is_skipped;
            drop(guard);

            if show_max_retries {
                (
                    PairingState::MaxRetriesReached {
                        attempts: config.max_retries,
                    },
                    None,
                    config.max_retries,
                )
            } else if let Some(node_id) = paired_id {
                (
                    PairingState::Paired {
                        node_id: node_id.clone(),
                    },
                    Some(node_id),
                    0,
                )
            } else if is_skipped {
                (PairingState::Skipped, None, 0)
            } else {
                (PairingState::Prompt, None, 0)
            }
        };

        Self {
            inner: Arc::new(Inner {
                channel,
                config,
                device_name: device_name.into(),
                store,
                state: StateHolder::new("pairing state", initial),
                paired_node: StateHolder::new("paired node", paired),
                retry_count: AtomicU32::new(retries),
                generation: Arc::new(AtomicU64::new(0)),
                current: Mutex::new(None),
            }),
        }
    }

    fn current(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reader for the published pairing state.
    #[must_use]
    pub fn state(&self) -> StateReader<PairingState> {
        self.inner.state.reader()
    }

    /// Latest published pairing state.
    #[must_use]
    pub fn snapshot(&self) -> PairingState {
        self.inner.state.snapshot()
    }

    /// Reader for the paired node.
    #[must_use]
    pub fn paired_node(&self) -> StateReader<Option<NodeId>> {
        self.inner.paired_node.reader()
    }

    /// Counted failures since the last success or manual retry.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::SeqCst)
    }

    /// The persisted record store.
    #[must_use]
    pub fn store(&self) -> &SharedPairingStore {
        &self.inner.store
    }

    /// Wait until all published updates have been applied.
    ///
    /// # Errors
    ///
    /// Returns an error if a state slot is closed.
    pub async fn flush(&self) -> Result<()> {
        self.inner.state.flush().await?;
        self.inner.paired_node.flush().await
    }

    /// Run one attempt to completion, returning the state it ended in.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if a newer attempt, [`skip`](Self::skip)
    /// or [`stop`](Self::stop) superseded this one.
    pub async fn attempt(&self) -> Result<PairingState> {
        let cancel = CancellationToken::new();
        let generation = self.supersede(Some(cancel.clone()));

        let result = self.run_attempt(generation, &cancel).await;

        let mut current = self.current();
        if self.is_current(generation) {
            *current = None;
        }
        drop(current);

        if matches!(result, Err(Error::Cancelled)) {
            tracing::debug!("Pairing attempt {} cancelled", generation);
        }
        result
    }

    /// Run an attempt in the background.
    pub fn start(&self) -> JoinHandle<Result<PairingState>> {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.attempt().await })
    }

    /// Reset the retry budget and run a fresh attempt.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if superseded.
    pub async fn retry(&self) -> Result<PairingState> {
        {
            let mut current = self.current();
            self.replace_current(&mut *current, None);
            self.inner.retry_count.store(0, Ordering::SeqCst);
        }
        self.attempt().await
    }

    /// Give up on pairing and continue without a companion.
    pub fn skip(&self) {
        let mut current = self.current();
        let generation = self.replace_current(&mut *current, None);
        self.persist(|store| store.mark_skipped());
        self.inner.paired_node.set(None);
        self.publish(generation, PairingState::Skipped);
        drop(current);
        tracing::info!("Pairing skipped");
    }

    /// Cancel any attempt in flight. The last published state stays.
    pub fn stop(&self) {
        self.supersede(None);
    }

    fn supersede(&self, next: Option<CancellationToken>) -> u64 {
        let mut current = self.current();
        self.replace_current(&mut *current, next)
    }

    /// Swap the in-flight token and bump the generation. Check-then-write
    /// paths hold the `current` lock throughout so they never straddle this.
    fn replace_current(
        &self,
        current: &mut Option<CancellationToken>,
        next: Option<CancellationToken>,
    ) -> u64 {
        if let Some(previous) = std::mem::replace(current, next) {
            previous.cancel();
        }
        self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.inner.generation.load(Ordering::SeqCst) == generation
    }

    async fn run_attempt(
        &self,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<PairingState> {
        let channel = &self.inner.channel;
        let config = &self.inner.config;

        if !channel.is_enabled() {
            return Ok(self.fail_with(generation, &Error::TransportDisabled));
        }
        self.publish(generation, PairingState::Checking);

        let nodes = match channel.discover_nodes().await {
            Ok(nodes) => nodes,
            Err(Error::TransportDisabled) => {
                return Ok(self.fail_with(generation, &Error::TransportDisabled));
            }
            Err(e) => {
                tracing::debug!("Discovery failed: {}", e);
                Vec::new()
            }
        };
        let Some(node) = nodes.into_iter().find(|n| n.is_nearby) else {
            return Ok(self.fail_with(generation, &Error::NoPeerFound));
        };
        tracing::debug!("Pairing candidate {} ({})", node.display_name, node.id);

        let mut inbox = channel.subscribe();
        if let Err(e) = channel
            .send(&node.id, Path::Ping.as_str(), PING_PAYLOAD)
            .await
        {
            return Ok(self.fail_with(generation, &e));
        }
        let pong = match channel::wait_for(&mut inbox, config.ping_timeout, cancel, |m| {
            m.is_from(Path::Pong, &node.id)
        })
        .await
        {
            Ok(pong) => pong,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => return Ok(self.fail_with(generation, &e)),
        };
        if pong.is_none() {
            return Ok(self.fail_with(generation, &Error::PeerUnresponsive(node.id)));
        }

        let request = protocol::encode_payload(&PairingRequestPayload {
            watch_name: self.inner.device_name.clone(),
        })?;
        if let Err(e) = channel
            .send(&node.id, Path::PairingRequest.as_str(), &request)
            .await
        {
            return Ok(self.fail_with(generation, &e));
        }
        self.publish(
            generation,
            PairingState::WaitingForAcceptance { node: node.clone() },
        );

        let decision = match channel::wait_for(&mut inbox, config.acceptance_timeout, cancel, |m| {
            m.is_from(Path::PairingAccepted, &node.id) || m.is_from(Path::PairingDeclined, &node.id)
        })
        .await
        {
            Ok(decision) => decision,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => return Ok(self.fail_with(generation, &e)),
        };

        match decision {
            None => Ok(self.fail_with(
                generation,
                &Error::HandshakeTimeout(config.acceptance_timeout.as_secs()),
            )),
            Some(reply) if reply.is(Path::PairingDeclined) => {
                tracing::info!("Pairing declined by {}", node.id);
                self.publish(generation, PairingState::Declined);
                Ok(PairingState::Declined)
            }
            Some(_) => self.succeed(generation, node.id, cancel).await,
        }
    }

    async fn succeed(
        &self,
        generation: u64,
        node_id: NodeId,
        cancel: &CancellationToken,
    ) -> Result<PairingState> {
        if !self.commit_success(generation, &node_id) {
            return Err(Error::Cancelled);
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            () = tokio::time::sleep(self.inner.config.success_hold) => {}
        }

        let paired = PairingState::Paired { node_id };
        self.publish(generation, paired.clone());
        Ok(paired)
    }

    /// Persist and publish an accepted pairing unless `generation` was
    /// superseded. Returns `false` if nothing was written.
    fn commit_success(&self, generation: u64, node_id: &NodeId) -> bool {
        let current = self.current();
        if !self.is_current(generation) {
            return false;
        }

        tracing::info!("Paired with {}", node_id);
        self.inner.retry_count.store(0, Ordering::SeqCst);
        let persisted = node_id.clone();
        self.persist(move |store| store.mark_paired(persisted));
        self.inner.paired_node.set(Some(node_id.clone()));
        self.publish(
            generation,
            PairingState::Success {
                node_id: node_id.clone(),
            },
        );
        drop(current);
        true
    }

    fn fail_with(&self, generation: u64, error: &Error) -> PairingState {
        let current = self.current();
        if !self.is_current(generation) {
            drop(current);
            return self.snapshot();
        }

        let state = if matches!(error, Error::TransportDisabled) {
            tracing::info!("Pairing needs the transport switched on");
            PairingState::BluetoothOff
        } else if error.is_retry_counted() {
            let count = self.inner.retry_count.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= self.inner.config.max_retries {
                tracing::warn!("Pairing gave up after {} attempts: {}", count, error);
                PairingState::MaxRetriesReached { attempts: count }
            } else {
                tracing::info!(
                    "Pairing attempt {} of {} failed: {}",
                    count,
                    self.inner.config.max_retries,
                    error
                );
                PairingState::Error {
                    failure: PairingFailure::from_error(error),
                    retry_count: count,
                }
            }
        } else {
            tracing::warn!("Pairing attempt failed: {}", error);
            PairingState::Error {
                failure: PairingFailure::from_error(error),
                retry_count: self.retry_count(),
            }
        };

        self.publish(generation, state.clone());
        drop(current);
        state
    }

    fn publish(&self, generation: u64, state: PairingState) {
        if !self.is_current(generation) {
            tracing::debug!("Discarding stale pairing state: {}", state);
            return;
        }

        tracing::debug!("Pairing state: {}", state);
        let live = Arc::clone(&self.inner.generation);
        self.inner.state.update(move |current| {
            if live.load(Ordering::SeqCst) != generation || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    fn persist<F>(&self, write: F)
    where
        F: FnOnce(&mut PairingStore) -> Result<()>,
    {
        let mut store = self
            .inner
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = write(&mut *store) {
            tracing::warn!("Failed to save pairing record: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::broadcast;

    use super::*;
    use crate::channel::memory::{MemoryChannel, MemoryNetwork};
    use crate::channel::Message;
    use crate::responder::Responder;

    fn config() -> PairingConfig {
        PairingConfig {
            ping_timeout: Duration::from_secs(3),
            acceptance_timeout: Duration::from_secs(30),
            max_retries: 2,
            success_hold: Duration::from_secs(3),
        }
    }

    fn coordinator(watch: MemoryChannel) -> PairingCoordinator {
        coordinator_over(Arc::new(watch))
    }

    fn coordinator_over(watch: Arc<dyn MessageChannel>) -> PairingCoordinator {
        PairingCoordinator::new(
            watch,
            config(),
            "Watch1",
            PairingStore::in_memory().shared(),
        )
    }

    /// Wraps a memory endpoint but refuses to deliver pairing requests, as if
    /// the companion dropped right after answering the ping.
    struct DropsBeforeRequest(MemoryChannel);

    #[async_trait]
    impl MessageChannel for DropsBeforeRequest {
        fn local_id(&self) -> &NodeId {
            self.0.local_id()
        }

        fn is_enabled(&self) -> bool {
            self.0.is_enabled()
        }

        async fn discover_nodes(&self) -> Result<Vec<Node>> {
            self.0.discover_nodes().await
        }

        async fn send(&self, node: &NodeId, path: &str, payload: &[u8]) -> Result<()> {
            if path == Path::PairingRequest.as_str() {
                return Err(Error::PeerUnreachable(node.clone()));
            }
            self.0.send(node, path, payload).await
        }

        fn subscribe(&self) -> broadcast::Receiver<Message> {
            self.0.subscribe()
        }
    }

    /// Finds a companion, but its inbound stream is already closed.
    struct ClosedInbox(NodeId);

    #[async_trait]
    impl MessageChannel for ClosedInbox {
        fn local_id(&self) -> &NodeId {
            &self.0
        }

        fn is_enabled(&self) -> bool {
            true
        }

        async fn discover_nodes(&self) -> Result<Vec<Node>> {
            Ok(vec![Node {
                id: NodeId::from("phone"),
                display_name: "Phone".to_string(),
                is_nearby: true,
            }])
        }

        async fn send(&self, _node: &NodeId, _path: &str, _payload: &[u8]) -> Result<()> {
            Ok(())
        }

        fn subscribe(&self) -> broadcast::Receiver<Message> {
            broadcast::channel(1).1
        }
    }

    /// Companion that answers pings and resolves every pairing request.
    fn companion(network: &MemoryNetwork, accept: bool) -> (Responder, PairingRequestBroker) {
        let phone: Arc<dyn MessageChannel> = Arc::new(network.join("phone", "Phone"));
        let responder = Responder::spawn(Arc::clone(&phone), "Phone".to_string(), None);
        let broker = PairingRequestBroker::new(phone);
        broker.start();

        let deciding = broker.clone();
        tokio::spawn(async move {
            let mut pending = deciding.pending();
            loop {
                if let Some(request) = deciding.current() {
                    let _ = if accept {
                        deciding.accept(&request.node_id).await
                    } else {
                        deciding.decline(&request.node_id).await
                    };
                }
                if pending.changed().await.is_err() {
                    break;
                }
            }
        });
        (responder, broker)
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_peer_exhausts_retries() {
        let network = MemoryNetwork::new();
        let pairing = coordinator(network.join("watch", "Watch1"));

        let first = pairing.attempt().await.unwrap();
        assert_eq!(
            first,
            PairingState::Error {
                failure: PairingFailure::NoPeerFound,
                retry_count: 1
            }
        );

        let second = pairing.attempt().await.unwrap();
        assert_eq!(second, PairingState::MaxRetriesReached { attempts: 2 });

        pairing.flush().await.unwrap();
        assert_eq!(pairing.snapshot(), second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_resets_budget() {
        let network = MemoryNetwork::new();
        let pairing = coordinator(network.join("watch", "Watch1"));

        pairing.attempt().await.unwrap();
        pairing.attempt().await.unwrap();
        let state = pairing.retry().await.unwrap();

        assert_eq!(
            state,
            PairingState::Error {
                failure: PairingFailure::NoPeerFound,
                retry_count: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_off_is_not_counted() {
        let network = MemoryNetwork::new();
        let watch = network.join("watch", "Watch1");
        watch.set_enabled(false);
        let pairing = coordinator(watch);

        assert_eq!(pairing.attempt().await.unwrap(), PairingState::BluetoothOff);
        assert_eq!(pairing.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_peer_after_ping_timeout() {
        let network = MemoryNetwork::new();
        let pairing = coordinator(network.join("watch", "Watch1"));
        let _silent = network.join("phone", "Phone");

        let started = tokio::time::Instant::now();
        let state = pairing.attempt().await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert!(matches!(
            state,
            PairingState::Error {
                failure: PairingFailure::PeerUnresponsive,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let network = MemoryNetwork::new();
        let pairing = coordinator(network.join("watch", "Watch1"));
        let phone = Arc::new(network.join("phone", "Phone"));
        let _responder = Responder::spawn(phone, "Phone".to_string(), None);

        let state = pairing.attempt().await.unwrap();
        assert_eq!(
            state,
            PairingState::Error {
                failure: PairingFailure::NoResponse,
                retry_count: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_decline_is_not_counted() {
        let network = MemoryNetwork::new();
        let pairing = coordinator(network.join("watch", "Watch1"));
        let _companion = companion(&network, false);

        assert_eq!(pairing.attempt().await.unwrap(), PairingState::Declined);
        assert_eq!(pairing.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_persists_and_holds() {
        let network = MemoryNetwork::new();
        let pairing = coordinator(network.join("watch", "Watch1"));
        let (_responder, broker) = companion(&network, true);

        let mut states = pairing.state();
        let started = tokio::time::Instant::now();
        let state = pairing.attempt().await.unwrap();

        assert_eq!(
            state,
            PairingState::Paired {
                node_id: NodeId::from("phone")
            }
        );
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(pairing.retry_count(), 0);

        let record = pairing.store().lock().unwrap().record().clone();
        assert!(record.is_paired);
        assert_eq!(record.paired_node_id, Some(NodeId::from("phone")));

        pairing.flush().await.unwrap();
        assert_eq!(pairing.paired_node().peek(), Some(NodeId::from("phone")));
        assert_eq!(states.get(), state);

        broker.flush().await.unwrap();
        assert_eq!(broker.paired_node().peek(), Some(NodeId::from("watch")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_cancels_attempt_in_flight() {
        let network = MemoryNetwork::new();
        let pairing = coordinator(network.join("watch", "Watch1"));
        let phone = Arc::new(network.join("phone", "Phone"));
        let _responder = Responder::spawn(phone, "Phone".to_string(), None);

        let running = pairing.start();
        let mut states = pairing.state();
        states
            .wait_until(|s| matches!(s, PairingState::WaitingForAcceptance { .. }))
            .await
            .unwrap();

        pairing.skip();
        assert!(matches!(running.await.unwrap(), Err(Error::Cancelled)));

        tokio::time::sleep(Duration::from_secs(60)).await;
        pairing.flush().await.unwrap();
        assert_eq!(pairing.snapshot(), PairingState::Skipped);
        assert_eq!(pairing.retry_count(), 0);
        assert!(pairing.store().lock().unwrap().record().is_skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_attempt_supersedes_old() {
        let network = MemoryNetwork::new();
        let pairing = coordinator(network.join("watch", "Watch1"));
        let phone = Arc::new(network.join("phone", "Phone"));
        let _responder = Responder::spawn(phone, "Phone".to_string(), None);

        let first = pairing.start();
        let mut states = pairing.state();
        states
            .wait_until(|s| matches!(s, PairingState::WaitingForAcceptance { .. }))
            .await
            .unwrap();

        let second = pairing.start();
        assert!(matches!(first.await.unwrap(), Err(Error::Cancelled)));

        // only the surviving attempt's timeout is counted
        let state = second.await.unwrap().unwrap();
        assert_eq!(
            state,
            PairingState::Error {
                failure: PairingFailure::NoResponse,
                retry_count: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_state_from_record() {
        let network = MemoryNetwork::new();

        let mut flagged = PairingStore::in_memory();
        flagged.mark_paired(NodeId::from("phone")).unwrap();
        flagged.set_show_max_retries(true).unwrap();
        let flagged = flagged.shared();
        let pairing = PairingCoordinator::new(
            Arc::new(network.join("w1", "Watch1")),
            config(),
            "Watch1",
            Arc::clone(&flagged),
        );
        assert_eq!(
            pairing.snapshot(),
            PairingState::MaxRetriesReached { attempts: 2 }
        );
        assert!(!flagged.lock().unwrap().record().show_max_retries_on_next_launch);

        let mut paired = PairingStore::in_memory();
        paired.mark_paired(NodeId::from("phone")).unwrap();
        let pairing = PairingCoordinator::new(
            Arc::new(network.join("w2", "Watch2")),
            config(),
            "Watch2",
            paired.shared(),
        );
        assert_eq!(
            pairing.snapshot(),
            PairingState::Paired {
                node_id: NodeId::from("phone")
            }
        );
        assert_eq!(pairing.paired_node().peek(), Some(NodeId::from("phone")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_dropped_before_request_is_counted() {
        let network = MemoryNetwork::new();
        let pairing = coordinator_over(Arc::new(DropsBeforeRequest(
            network.join("watch", "Watch1"),
        )));
        let phone = Arc::new(network.join("phone", "Phone"));
        let _responder = Responder::spawn(phone, "Phone".to_string(), None);

        let state = pairing.attempt().await.unwrap();
        assert_eq!(
            state,
            PairingState::Error {
                failure: PairingFailure::PeerDisconnected,
                retry_count: 1
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_inbox_ends_attempt() {
        let pairing = coordinator_over(Arc::new(ClosedInbox(NodeId::from("watch"))));

        let state = pairing.attempt().await.unwrap();
        assert!(matches!(
            state,
            PairingState::Error {
                failure: PairingFailure::Transport(_),
                retry_count: 0
            }
        ));

        pairing.flush().await.unwrap();
        assert_eq!(pairing.snapshot(), state);
        assert!(!pairing.snapshot().is_in_progress());
    }

    #[tokio::test]
    async fn test_superseded_success_writes_nothing() {
        let network = MemoryNetwork::new();
        let pairing = coordinator(network.join("watch", "Watch1"));

        let stale = pairing.supersede(None);
        pairing.skip();
        assert!(!pairing.commit_success(stale, &NodeId::from("phone")));

        pairing.flush().await.unwrap();
        let record = pairing.store().lock().unwrap().record().clone();
        assert!(record.is_skipped);
        assert!(!record.is_paired);
        assert_eq!(record.paired_node_id, None);
        assert_eq!(pairing.paired_node().peek(), None);
        assert_eq!(pairing.snapshot(), PairingState::Skipped);
    }

    #[tokio::test]
    async fn test_superseded_failure_is_not_counted() {
        let network = MemoryNetwork::new();
        let pairing = coordinator(network.join("watch", "Watch1"));

        let stale = pairing.supersede(None);
        pairing.supersede(None);
        pairing.fail_with(stale, &Error::NoPeerFound);

        pairing.flush().await.unwrap();
        assert_eq!(pairing.retry_count(), 0);
        assert_eq!(pairing.snapshot(), PairingState::Prompt);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cancels_attempt_in_flight() {
        let network = MemoryNetwork::new();
        let pairing = coordinator(network.join("watch", "Watch1"));
        let _silent = network.join("phone", "Phone");

        let running = pairing.start();
        let mut states = pairing.state();
        states
            .wait_until(|s| *s == PairingState::Checking)
            .await
            .unwrap();

        let state = pairing.retry().await.unwrap();
        assert!(matches!(running.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(
            state,
            PairingState::Error {
                failure: PairingFailure::PeerUnresponsive,
                retry_count: 1
            }
        );
    }
}
