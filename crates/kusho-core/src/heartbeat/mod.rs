//! Peer liveness monitoring.
//!
//! While running, the [`HeartbeatMonitor`] pings the peer every
//! `heartbeat.interval` and waits up to `heartbeat.timeout` for the pong. The
//! result is published as a [`ConnectionState`]; only a change between
//! connected and disconnected emits a [`ConnectionTransition`].
//!
//! The state starts optimistic (connected) until the first probe completes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{self, MessageChannel, NodeId};
use crate::config::HeartbeatConfig;
use crate::error::{Error, Result};
use crate::protocol::{Path, PING_PAYLOAD};
use crate::state::{StateHolder, StateReader};

/// Published liveness of the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    /// Whether the last probe got a pong
    pub is_connected: bool,
    /// When the last probe finished
    pub last_verified_at: Option<DateTime<Utc>>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            is_connected: true,
            last_verified_at: None,
        }
    }
}

/// A change between connected and disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTransition {
    /// New connection status
    pub is_connected: bool,
    /// When the probe that caused it finished
    pub at: DateTime<Utc>,
}

struct MonitorTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Inner {
    channel: Arc<dyn MessageChannel>,
    config: HeartbeatConfig,
    state: StateHolder<ConnectionState>,
    last_reported: Mutex<bool>,
    transitions: broadcast::Sender<ConnectionTransition>,
    task: Mutex<Option<MonitorTask>>,
}

/// Periodic ping/pong liveness probe.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for HeartbeatMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatMonitor")
            .field("config", &self.inner.config)
            .field("state", &self.inner.state.snapshot())
            .finish_non_exhaustive()
    }
}

impl HeartbeatMonitor {
    /// Create a stopped monitor.
    pub fn new(channel: Arc<dyn MessageChannel>, config: HeartbeatConfig) -> Self {
        let (transitions, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                channel,
                config,
                state: StateHolder::new("connection state", ConnectionState::default()),
                last_reported: Mutex::new(true),
                transitions,
                task: Mutex::new(None),
            }),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<MonitorTask>> {
        self.inner.task.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reader for the published connection state.
    #[must_use]
    pub fn state(&self) -> StateReader<ConnectionState> {
        self.inner.state.reader()
    }

    /// Latest connection state.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionState {
        self.inner.state.snapshot()
    }

    /// Subscribe to connected/disconnected transitions.
    #[must_use]
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionTransition> {
        self.inner.transitions.subscribe()
    }

    /// Whether the probe loop is running.
    #[must_use]
    pub fn is_monitoring(&self) -> bool {
        self.task()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Start probing `target`, or the first discovered node when `None`.
    ///
    /// Calling this while already running is a no-op.
    pub fn start_monitoring(&self, target: Option<NodeId>) {
        let mut task = self.task();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            tracing::debug!("Heartbeat already running");
            return;
        }

        let cancel = CancellationToken::new();
        let monitor = self.clone();
        let loop_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            monitor.run(target, loop_cancel).await;
        });

        *task = Some(MonitorTask { cancel, handle });
        tracing::info!("Heartbeat started");
    }

    /// Stop probing. Any in-flight wait is cancelled and no further state
    /// is published by the stopped loop. Idempotent.
    pub fn stop_monitoring(&self) {
        if let Some(task) = self.task().take() {
            task.cancel.cancel();
            task.handle.abort();
            tracing::info!("Heartbeat stopped");
        }
    }

    /// Run one probe immediately and publish its result.
    pub async fn check_now(&self, target: Option<&NodeId>) -> bool {
        let cancel = CancellationToken::new();
        match self.probe(target, &cancel).await {
            Ok(alive) => {
                self.record(alive);
                alive
            }
            Err(_) => false,
        }
    }

    async fn run(&self, target: Option<NodeId>, cancel: CancellationToken) {
        loop {
            match self.probe(target.as_ref(), &cancel).await {
                Ok(alive) if !cancel.is_cancelled() => self.record(alive),
                _ => break,
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.inner.config.interval) => {}
            }
        }
        tracing::debug!("Heartbeat loop finished");
    }

    async fn probe(&self, target: Option<&NodeId>, cancel: &CancellationToken) -> Result<bool> {
        let nodes = match self.inner.channel.discover_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                tracing::debug!("Heartbeat discovery failed: {}", e);
                return Ok(false);
            }
        };

        let node = match target {
            Some(target) => nodes.into_iter().find(|n| &n.id == target),
            None => nodes.into_iter().next(),
        };
        let Some(node) = node else {
            return Ok(false);
        };

        let mut inbox = self.inner.channel.subscribe();
        if let Err(e) = self
            .inner
            .channel
            .send(&node.id, Path::Ping.as_str(), PING_PAYLOAD)
            .await
        {
            tracing::debug!("Heartbeat ping to {} failed: {}", node.id, e);
            return Ok(false);
        }

        match channel::wait_for(&mut inbox, self.inner.config.timeout, cancel, |m| {
            m.is_from(Path::Pong, &node.id)
        })
        .await
        {
            Ok(pong) => Ok(pong.is_some()),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                tracing::debug!("Heartbeat wait failed: {}", e);
                Ok(false)
            }
        }
    }

    fn record(&self, alive: bool) {
        let now = Utc::now();

        let mut last = self
            .inner
            .last_reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *last == alive {
            tracing::trace!("Heartbeat reconfirmed connected={}", alive);
        } else {
            *last = alive;
            if alive {
                tracing::info!("Peer connection restored");
            } else {
                tracing::info!("Peer connection lost");
            }
            let _ = self.inner.transitions.send(ConnectionTransition {
                is_connected: alive,
                at: now,
            });
        }
        drop(last);

        self.inner.state.set(ConnectionState {
            is_connected: alive,
            last_verified_at: Some(now),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::memory::{MemoryChannel, MemoryNetwork};
    use crate::responder::Responder;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_optimistic() {
        let network = MemoryNetwork::new();
        let watch = network.join("watch", "Watch1");
        let monitor = HeartbeatMonitor::new(Arc::new(watch), config());

        assert!(monitor.snapshot().is_connected);
        assert!(monitor.snapshot().last_verified_at.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_missed_pongs_emit_one_transition() {
        let network = MemoryNetwork::new();
        let watch = network.join("watch", "Watch1");
        let _phone = network.join("phone", "Phone");

        let monitor = HeartbeatMonitor::new(Arc::new(watch), config());
        let mut transitions = monitor.transitions();

        monitor.start_monitoring(Some(NodeId::from("phone")));
        // probe 1 times out at 3s, probe 2 starts at 8s and times out at 11s
        tokio::time::sleep(Duration::from_secs(12)).await;
        monitor.stop_monitoring();

        let first = transitions.try_recv().unwrap();
        assert!(!first.is_connected);
        assert!(transitions.try_recv().is_err());
        assert!(!monitor.snapshot().is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_connected_without_transition() {
        let network = MemoryNetwork::new();
        let watch = network.join("watch", "Watch1");
        let phone = Arc::new(network.join("phone", "Phone"));
        let _responder = Responder::spawn(phone, "Phone".to_string(), None);

        let monitor = HeartbeatMonitor::new(Arc::new(watch), config());
        let mut transitions = monitor.transitions();

        assert!(monitor.check_now(Some(&NodeId::from("phone"))).await);
        monitor.inner.state.flush().await.unwrap();

        assert!(transitions.try_recv().is_err());
        let state = monitor.snapshot();
        assert!(state.is_connected);
        assert!(state.last_verified_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_discovery_disconnects_immediately() {
        let network = MemoryNetwork::new();
        let watch = network.join("watch", "Watch1");
        let monitor = HeartbeatMonitor::new(Arc::new(watch), config());

        let started = tokio::time::Instant::now();
        assert!(!monitor.check_now(None).await);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_emits_second_transition() {
        let network = MemoryNetwork::new();
        let watch = network.join("watch", "Watch1");
        let phone = Arc::new(network.join("phone", "Phone"));
        let _responder = Responder::spawn(Arc::<MemoryChannel>::clone(&phone), "Phone".to_string(), None);

        let monitor = HeartbeatMonitor::new(Arc::new(watch), config());
        let mut transitions = monitor.transitions();
        let target = NodeId::from("phone");

        network.set_connected(&target, false);
        assert!(!monitor.check_now(Some(&target)).await);
        network.set_connected(&target, true);
        assert!(monitor.check_now(Some(&target)).await);

        assert!(!transitions.try_recv().unwrap().is_connected);
        assert!(transitions.try_recv().unwrap().is_connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent_and_stop_halts() {
        let network = MemoryNetwork::new();
        let watch = network.join("watch", "Watch1");
        let monitor = HeartbeatMonitor::new(Arc::new(watch), config());

        monitor.start_monitoring(None);
        monitor.start_monitoring(None);
        assert!(monitor.is_monitoring());

        monitor.stop_monitoring();
        monitor.stop_monitoring();
        tokio::task::yield_now().await;
        assert!(!monitor.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_pong_wait_publishes_nothing() {
        let network = MemoryNetwork::new();
        let watch = network.join("watch", "Watch1");
        let _silent = network.join("phone", "Phone");

        let monitor = HeartbeatMonitor::new(Arc::new(watch), config());
        let mut transitions = monitor.transitions();

        monitor.start_monitoring(Some(NodeId::from("phone")));
        tokio::time::sleep(Duration::from_secs(1)).await;
        monitor.stop_monitoring();
        tokio::time::sleep(Duration::from_secs(5)).await;
        monitor.inner.state.flush().await.unwrap();

        assert!(transitions.try_recv().is_err());
        let state = monitor.snapshot();
        assert!(state.is_connected);
        assert!(state.last_verified_at.is_none());
    }
}
