//! Error types for Kusho.
//!
//! This module provides a unified error type for the pairing, heartbeat and
//! session sync layers, with specific variants for each failure mode.

use std::io;

use thiserror::Error;

use crate::channel::NodeId;

/// A specialized `Result` type for Kusho operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Kusho.
#[derive(Error, Debug)]
pub enum Error {
    /// The transport medium is administratively disabled (K001)
    #[error("transport is disabled")]
    TransportDisabled,

    /// No nearby peer was discovered (K002)
    #[error("no nearby peer found")]
    NoPeerFound,

    /// Peer did not answer a ping in time (K003)
    #[error("peer '{0}' did not respond to ping")]
    PeerUnresponsive(NodeId),

    /// Nobody accepted or declined the pairing request in time (K004)
    #[error("no pairing response after {0} seconds")]
    HandshakeTimeout(u64),

    /// The user on the companion declined the pairing request (K005)
    #[error("pairing request declined")]
    HandshakeDeclined,

    /// The node disappeared between discovery and send (K006)
    #[error("peer '{0}' is no longer reachable")]
    PeerUnreachable(NodeId),

    /// Message was a duplicate of one already applied
    #[error("duplicate message on '{0}'")]
    DuplicateMessage(String),

    /// Inbound payload could not be decoded (K007)
    #[error("malformed payload on '{path}': {reason}")]
    MalformedPayload {
        /// Path the message arrived on
        path: String,
        /// Why decoding failed
        reason: String,
    },

    /// Outbound control signal with no paired peer (K008)
    #[error("no paired peer")]
    NotPaired,

    /// A gesture was submitted with no step on screen
    #[error("no active step to judge against")]
    NoActiveStep,

    /// The operation was cancelled by a newer attempt or a stop request
    #[error("operation cancelled")]
    Cancelled,

    /// Operation timeout
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// A state slot's writer task has gone away
    #[error("state slot '{0}' is closed")]
    StateClosed(&'static str),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code associated with this error, if any.
    ///
    /// Error codes follow the pattern KXXX where XXX is a 3-digit number.
    #[must_use]
    pub const fn code(&self) -> Option<&'static str> {
        match self {
            Self::TransportDisabled => Some("K001"),
            Self::NoPeerFound => Some("K002"),
            Self::PeerUnresponsive(_) => Some("K003"),
            Self::HandshakeTimeout(_) => Some("K004"),
            Self::HandshakeDeclined => Some("K005"),
            Self::PeerUnreachable(_) => Some("K006"),
            Self::MalformedPayload { .. } => Some("K007"),
            Self::NotPaired => Some("K008"),
            _ => None,
        }
    }

    /// Returns whether this failure counts against the pairing retry budget.
    ///
    /// A disabled transport and an explicit decline are not the peer's fault
    /// and leave the counter untouched.
    #[must_use]
    pub const fn is_retry_counted(&self) -> bool {
        matches!(
            self,
            Self::NoPeerFound
                | Self::PeerUnresponsive(_)
                | Self::HandshakeTimeout(_)
                | Self::PeerUnreachable(_)
                | Self::Timeout(_)
        )
    }

    /// Returns whether the error should be dropped without surfacing to the user.
    #[must_use]
    pub const fn is_silent(&self) -> bool {
        matches!(self, Self::DuplicateMessage(_))
    }

    /// Returns a helpful suggestion for resolving the error, if applicable.
    #[must_use]
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::TransportDisabled => Some("Turn Bluetooth / networking back on and retry."),
            Self::NoPeerFound => Some(
                "Make sure the companion app is open and the phone is nearby.\n\
                 Both devices must be on the same network.",
            ),
            Self::HandshakeTimeout(_) => {
                Some("Accept the pairing request on the companion within the time limit.")
            }
            Self::NotPaired => Some("Pair the devices first:\n  kusho peripheral"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_counted_classification() {
        assert!(Error::NoPeerFound.is_retry_counted());
        assert!(Error::HandshakeTimeout(30).is_retry_counted());
        assert!(Error::PeerUnreachable(NodeId::from("n1")).is_retry_counted());
        assert!(!Error::HandshakeDeclined.is_retry_counted());
        assert!(!Error::TransportDisabled.is_retry_counted());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::TransportDisabled.code(), Some("K001"));
        assert_eq!(Error::NotPaired.code(), Some("K008"));
        assert_eq!(Error::Cancelled.code(), None);
    }

    #[test]
    fn test_duplicate_is_silent() {
        assert!(Error::DuplicateMessage("/x".into()).is_silent());
        assert!(!Error::NotPaired.is_silent());
    }
}
