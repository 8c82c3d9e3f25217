//! Automatic replies to peer queries.
//!
//! Each device runs a [`Responder`] that answers:
//!
//! - `/kusho/ping` with `/kusho/pong`
//! - `/request_battery` with `/battery_status` (decimal ASCII, 0-100)
//! - `/request_device_info` with `/device_info` (UTF-8 name)
//!
//! [`request_battery`] and [`request_device_info`] are the asking side.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::{self, Message, MessageChannel, NodeId};
use crate::error::{Error, Result};
use crate::protocol::{self, Path, PING_PAYLOAD};

/// Source of the local battery level.
pub trait BatterySource: Send + Sync {
    /// Battery percentage, or `None` if unknown.
    fn level(&self) -> Option<u8>;
}

/// A fixed battery level.
#[derive(Debug, Clone, Copy)]
pub struct FixedBattery(pub u8);

impl BatterySource for FixedBattery {
    fn level(&self) -> Option<u8> {
        Some(self.0)
    }
}

/// Background task answering ping, battery and device-info requests.
#[derive(Debug)]
pub struct Responder {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Responder {
    /// Subscribe to `channel` and start answering.
    ///
    /// The subscription is taken before this returns, so requests sent right
    /// after are not missed.
    pub fn spawn(
        channel: Arc<dyn MessageChannel>,
        device_name: String,
        battery: Option<Arc<dyn BatterySource>>,
    ) -> Self {
        let inbox = channel.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::run(
            channel,
            inbox,
            device_name,
            battery,
            cancel.clone(),
        ));
        Self { cancel, handle }
    }

    /// Stop answering.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    async fn run(
        channel: Arc<dyn MessageChannel>,
        mut inbox: broadcast::Receiver<Message>,
        device_name: String,
        battery: Option<Arc<dyn BatterySource>>,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => break,
                received = inbox.recv() => match received {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Responder lagged, {} messages skipped", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            let reply = match message.kind() {
                Some(Path::Ping) => Some((Path::Pong, PING_PAYLOAD.to_vec())),
                Some(Path::RequestBattery) => match battery.as_ref().and_then(|b| b.level()) {
                    Some(level) => Some((Path::BatteryStatus, protocol::encode_battery(level))),
                    None => {
                        tracing::debug!("Battery level unknown, not replying to {}", message.source);
                        None
                    }
                },
                Some(Path::RequestDeviceInfo) => {
                    Some((Path::DeviceInfo, device_name.as_bytes().to_vec()))
                }
                _ => None,
            };

            if let Some((path, payload)) = reply {
                if let Err(e) = channel.send(&message.source, path.as_str(), &payload).await {
                    tracing::debug!("Reply {} to {} failed: {}", path, message.source, e);
                }
            }
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn request(
    channel: &dyn MessageChannel,
    node: &NodeId,
    request: Path,
    reply: Path,
    timeout: Duration,
) -> Result<Message> {
    let mut inbox = channel.subscribe();
    channel.send(node, request.as_str(), &[]).await?;

    channel::wait_for(&mut inbox, timeout, &CancellationToken::new(), |m| {
        m.is_from(reply, node)
    })
    .await?
    .ok_or(Error::Timeout(timeout.as_secs()))
}

/// Ask `node` for its battery level.
///
/// # Errors
///
/// Returns [`Error::Timeout`] if no reply arrives in time, or
/// [`Error::MalformedPayload`] if the reply is not a percentage.
pub async fn request_battery(
    channel: &dyn MessageChannel,
    node: &NodeId,
    timeout: Duration,
) -> Result<u8> {
    let reply = request(channel, node, Path::RequestBattery, Path::BatteryStatus, timeout).await?;
    protocol::decode_battery(&reply.payload)
}

/// Ask `node` for its device name.
///
/// # Errors
///
/// Returns [`Error::Timeout`] if no reply arrives in time.
pub async fn request_device_info(
    channel: &dyn MessageChannel,
    node: &NodeId,
    timeout: Duration,
) -> Result<String> {
    let reply = request(
        channel,
        node,
        Path::RequestDeviceInfo,
        Path::DeviceInfo,
        timeout,
    )
    .await?;
    protocol::decode_device_name(&reply.payload)
}
