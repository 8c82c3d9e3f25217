//! Composition roots for the two device roles.
//!
//! - [`PeripheralDevice`] - the wearable: pairs, watches the companion's
//!   heartbeat, mirrors the lesson and reports learner actions
//! - [`CompanionDevice`] - the handheld: answers pairing requests and drives
//!   the lesson
//!
//! Each root owns its components, wires them to one [`MessageChannel`], and
//! runs small link tasks between them. Dropping the root (or calling
//! `shutdown`) stops everything it started.

use std::sync::{Arc, PoisonError};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::channel::{MessageChannel, NodeId};
use crate::config::Config;
use crate::heartbeat::{ConnectionTransition, HeartbeatMonitor};
use crate::pairing::{PairingCoordinator, PairingRequestBroker, PairingState, SharedPairingStore};
use crate::responder::{BatterySource, Responder};
use crate::session::SessionSyncBridge;
use crate::state::StateReader;

/// The wearable role.
pub struct PeripheralDevice {
    channel: Arc<dyn MessageChannel>,
    pairing: PairingCoordinator,
    heartbeat: HeartbeatMonitor,
    session: SessionSyncBridge,
    responder: Responder,
    links: CancellationToken,
}

impl std::fmt::Debug for PeripheralDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeripheralDevice")
            .field("id", self.channel.local_id())
            .field("pairing", &self.pairing)
            .field("heartbeat", &self.heartbeat)
            .finish_non_exhaustive()
    }
}

impl PeripheralDevice {
    /// Wire up the wearable's components.
    ///
    /// Heartbeat monitoring follows pairing: it starts whenever the pairing
    /// state becomes [`PairingState::Paired`] (including on launch with a
    /// persisted pairing) and stops on skip. A lost connection sets the
    /// record's "show max retries on next launch" flag; regaining it clears
    /// the flag again.
    pub fn new(
        config: &Config,
        channel: Arc<dyn MessageChannel>,
        store: SharedPairingStore,
        battery: Option<Arc<dyn BatterySource>>,
    ) -> Self {
        let device_name = config.general.device_name.clone();
        let responder = Responder::spawn(Arc::clone(&channel), device_name.clone(), battery);
        let pairing = PairingCoordinator::new(
            Arc::clone(&channel),
            config.pairing,
            device_name,
            Arc::clone(&store),
        );
        let heartbeat = HeartbeatMonitor::new(Arc::clone(&channel), config.heartbeat);
        let session = SessionSyncBridge::new(
            Arc::clone(&channel),
            config.session,
            pairing.paired_node(),
        );
        session.start();

        let links = CancellationToken::new();
        tokio::spawn(follow_pairing(
            pairing.state(),
            heartbeat.clone(),
            links.clone(),
        ));
        tokio::spawn(record_connection_loss(
            heartbeat.transitions(),
            store,
            links.clone(),
        ));

        Self {
            channel,
            pairing,
            heartbeat,
            session,
            responder,
            links,
        }
    }

    /// This device's node id.
    #[must_use]
    pub fn local_id(&self) -> &NodeId {
        self.channel.local_id()
    }

    /// The pairing coordinator.
    #[must_use]
    pub fn pairing(&self) -> &PairingCoordinator {
        &self.pairing
    }

    /// The heartbeat monitor.
    #[must_use]
    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    /// The session bridge.
    #[must_use]
    pub fn session(&self) -> &SessionSyncBridge {
        &self.session
    }

    /// Whether the user still has to pair or skip.
    #[must_use]
    pub fn needs_pairing(&self) -> bool {
        !matches!(
            self.pairing.snapshot(),
            PairingState::Paired { .. } | PairingState::Skipped
        )
    }

    /// Stop every task this device started.
    pub fn shutdown(&self) {
        self.links.cancel();
        self.pairing.stop();
        self.heartbeat.stop_monitoring();
        self.session.stop();
        self.responder.stop();
        tracing::debug!("Peripheral shut down");
    }
}

impl Drop for PeripheralDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn follow_pairing(
    mut state: StateReader<PairingState>,
    heartbeat: HeartbeatMonitor,
    cancel: CancellationToken,
) {
    let mut current = state.get();
    loop {
        match &current {
            PairingState::Paired { node_id } => heartbeat.start_monitoring(Some(node_id.clone())),
            PairingState::Skipped | PairingState::Checking => heartbeat.stop_monitoring(),
            _ => {}
        }

        current = tokio::select! {
            () = cancel.cancelled() => break,
            next = state.changed() => match next {
                Ok(next) => next,
                Err(_) => break,
            },
        };
    }
}

async fn record_connection_loss(
    mut transitions: broadcast::Receiver<ConnectionTransition>,
    store: SharedPairingStore,
    cancel: CancellationToken,
) {
    loop {
        let transition = tokio::select! {
            () = cancel.cancelled() => break,
            received = transitions.recv() => match received {
                Ok(transition) => transition,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };

        let lost = !transition.is_connected;
        let result = store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_show_max_retries(lost);
        if let Err(e) = result {
            tracing::warn!("Failed to update pairing record: {}", e);
        }
    }
}

/// The handheld role.
pub struct CompanionDevice {
    channel: Arc<dyn MessageChannel>,
    broker: PairingRequestBroker,
    heartbeat: HeartbeatMonitor,
    session: SessionSyncBridge,
    responder: Responder,
    links: CancellationToken,
}

impl std::fmt::Debug for CompanionDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompanionDevice")
            .field("id", self.channel.local_id())
            .field("pairing", &self.broker)
            .field("heartbeat", &self.heartbeat)
            .finish_non_exhaustive()
    }
}

impl CompanionDevice {
    /// Wire up the handheld's components.
    ///
    /// Once a request is accepted the companion also watches the wearable's
    /// heartbeat. The accepted node is kept in `store`, so a restart resumes
    /// with the same wearable without asking again.
    pub fn new(
        config: &Config,
        channel: Arc<dyn MessageChannel>,
        store: SharedPairingStore,
        battery: Option<Arc<dyn BatterySource>>,
    ) -> Self {
        let responder = Responder::spawn(
            Arc::clone(&channel),
            config.general.device_name.clone(),
            battery,
        );
        let broker = PairingRequestBroker::with_store(Arc::clone(&channel), store);
        broker.start();
        let heartbeat = HeartbeatMonitor::new(Arc::clone(&channel), config.heartbeat);
        let session = SessionSyncBridge::new(
            Arc::clone(&channel),
            config.session,
            broker.paired_node(),
        );
        session.start();

        let links = CancellationToken::new();
        tokio::spawn(follow_paired_node(
            broker.paired_node(),
            heartbeat.clone(),
            links.clone(),
        ));

        Self {
            channel,
            broker,
            heartbeat,
            session,
            responder,
            links,
        }
    }

    /// This device's node id.
    #[must_use]
    pub fn local_id(&self) -> &NodeId {
        self.channel.local_id()
    }

    /// The pairing request broker.
    #[must_use]
    pub fn pairing(&self) -> &PairingRequestBroker {
        &self.broker
    }

    /// The heartbeat monitor.
    #[must_use]
    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    /// The session bridge.
    #[must_use]
    pub fn session(&self) -> &SessionSyncBridge {
        &self.session
    }

    /// Stop every task this device started.
    pub fn shutdown(&self) {
        self.links.cancel();
        self.broker.stop();
        self.heartbeat.stop_monitoring();
        self.session.stop();
        self.responder.stop();
        tracing::debug!("Companion shut down");
    }
}

impl Drop for CompanionDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn follow_paired_node(
    mut paired: StateReader<Option<NodeId>>,
    heartbeat: HeartbeatMonitor,
    cancel: CancellationToken,
) {
    let mut current = paired.get();
    loop {
        match &current {
            Some(node) => {
                heartbeat.stop_monitoring();
                heartbeat.start_monitoring(Some(node.clone()));
            }
            None => heartbeat.stop_monitoring(),
        }

        current = tokio::select! {
            () = cancel.cancelled() => break,
            next = paired.changed() => match next {
                Ok(next) => next,
                Err(_) => break,
            },
        };
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::memory::MemoryNetwork;
    use crate::pairing::PairingStore;

    #[tokio::test(start_paused = true)]
    async fn test_persisted_pairing_starts_heartbeat() {
        let network = MemoryNetwork::new();
        let watch = Arc::new(network.join("watch", "Watch1"));
        let _phone = network.join("phone", "Phone");

        let mut store = PairingStore::in_memory();
        store.mark_paired(NodeId::from("phone")).unwrap();

        let device = PeripheralDevice::new(&Config::default(), watch, store.shared(), None);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!device.needs_pairing());
        assert!(device.heartbeat().is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_sets_launch_flag() {
        let network = MemoryNetwork::new();
        let watch = Arc::new(network.join("watch", "Watch1"));
        let _phone = network.join("phone", "Phone");

        let mut store = PairingStore::in_memory();
        store.mark_paired(NodeId::from("phone")).unwrap();
        let store = store.shared();

        let device = PeripheralDevice::new(&Config::default(), watch, Arc::clone(&store), None);
        let mut connection = device.heartbeat().state();
        connection.wait_until(|c| !c.is_connected).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(store.lock().unwrap().record().show_max_retries_on_next_launch);
    }

    #[tokio::test(start_paused = true)]
    async fn test_companion_monitors_after_accept() {
        let network = MemoryNetwork::new();
        let _watch = network.join("watch", "Watch1");
        let phone = Arc::new(network.join("phone", "Phone"));
        let device = CompanionDevice::new(
            &Config::default(),
            phone,
            PairingStore::in_memory().shared(),
            None,
        );

        assert!(!device.heartbeat().is_monitoring());

        let payload = crate::protocol::encode_payload(&crate::protocol::PairingRequestPayload {
            watch_name: "Watch1".to_string(),
        })
        .unwrap();
        network.inject(
            &NodeId::from("phone"),
            crate::channel::Message::new(
                crate::protocol::Path::PairingRequest.as_str(),
                payload,
                NodeId::from("watch"),
            ),
        );
        let request = device
            .pairing()
            .pending()
            .wait_until(Option::is_some)
            .await
            .unwrap()
            .unwrap();
        assert!(device.pairing().accept(&request.node_id).await.unwrap());

        let mut paired = device.pairing().paired_node();
        paired.wait_until(Option::is_some).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(device.heartbeat().is_monitoring());
    }
}
