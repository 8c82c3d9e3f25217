//! # Kusho Core Library
//!
//! `kusho-core` keeps a handheld companion and a body-worn peripheral in step
//! over an unreliable message transport: who is paired with whom, whether the
//! peer is still alive, and which lesson step is currently on screen.
//!
//! ## Features
//!
//! - **User-confirmed pairing**: the peripheral asks, a human on the companion accepts or declines
//! - **Bounded retries**: failed attempts degrade to an explicit retry-or-skip decision
//! - **Heartbeat**: periodic ping/pong that reports connect/disconnect transitions
//! - **Lesson sync**: letter-by-letter session events tolerant of duplicates and reordering
//!
//! ## Modules
//!
//! - [`channel`] - Transport abstraction, in-memory and UDP transports
//! - [`config`] - Configuration management
//! - [`device`] - Composition roots for both device roles
//! - [`gesture`] - Gesture classifier seam
//! - [`heartbeat`] - Liveness monitoring
//! - [`pairing`] - Pairing coordinator, request broker and persisted record
//! - [`protocol`] - Wire paths and payload codecs
//! - [`responder`] - Automatic replies to ping, battery and device-info requests
//! - [`session`] - Lesson session sync bridge
//! - [`state`] - Single-writer observable state slots
//!
//! ## Example
//!
//! ```rust,ignore
//! use kusho_core::device::PeripheralDevice;
//! use kusho_core::pairing::PairingStore;
//!
//! let store = PairingStore::load()?.shared();
//! let device = PeripheralDevice::new(&config, channel, store, None);
//! let outcome = device.pairing().attempt().await?;
//! println!("pairing finished: {outcome}");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::unused_async)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]

pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod gesture;
pub mod heartbeat;
pub mod pairing;
pub mod protocol;
pub mod responder;
pub mod session;
pub mod state;

pub use channel::{Message, MessageChannel, Node, NodeId};
pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version carried in transport envelopes
pub const PROTOCOL_VERSION: &str = "1.0";

/// Default UDP port for beacons and messages
pub const DEFAULT_PORT: u16 = 52725;

/// Default heartbeat probe interval in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Default wait for a pong, in seconds
pub const DEFAULT_PING_TIMEOUT_SECS: u64 = 3;

/// Default wait for the user on the companion to accept or decline, in seconds
pub const DEFAULT_ACCEPTANCE_TIMEOUT_SECS: u64 = 30;

/// Default number of retry-counted failures before giving up
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default time the success screen is held, in seconds
pub const DEFAULT_SUCCESS_HOLD_SECS: u64 = 3;

/// Default window in which an identical step update is treated as a duplicate
pub const DEFAULT_DEDUP_WINDOW_MS: u64 = 500;
