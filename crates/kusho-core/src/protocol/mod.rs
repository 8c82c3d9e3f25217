//! Kusho wire protocol.
//!
//! Every message is a `(path, payload)` pair. Payloads are never binary
//! packed: they are empty, a decimal-ASCII integer, a UTF-8 string, or a flat
//! JSON object with camelCase keys.
//!
//! ## Paths
//!
//! | Path | Direction | Payload |
//! |------|-----------|---------|
//! | `/kusho/ping`, `/kusho/pong` | either | empty or `"ping"` |
//! | `/pairing_request` | peripheral → companion | `{watchName}` |
//! | `/pairing_accepted`, `/pairing_declined` | companion → peripheral | empty |
//! | `/request_battery`, `/battery_status` | either | empty / `0`..`100` |
//! | `/request_device_info`, `/device_info` | either | empty / device name |
//! | `/tutorial_mode_started` | companion → peripheral | `{studentName, lessonTitle}` |
//! | `/tutorial_mode_letter_data` | companion → peripheral | `{letter, letterCase, currentIndex, totalLetters, dominantHand}` |
//! | `/tutorial_mode_session_complete`, `/tutorial_mode_ended`, `/tutorial_mode_session_reset` | companion → peripheral | empty |
//! | `/tutorial_mode_feedback_dismissed`, `/tutorial_mode_retry` | both ways | empty |
//! | `/tutorial_mode_skip` | peripheral → companion | empty |
//! | `/tutorial_mode_gesture_result` | peripheral → companion | `{isCorrect, predictedLetter}` |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Literal payload carried by liveness probes.
pub const PING_PAYLOAD: &[u8] = b"ping";

/// Message paths in the Kusho protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Path {
    /// Liveness probe
    Ping,
    /// Liveness reply
    Pong,
    /// Peripheral asks to pair
    PairingRequest,
    /// Companion user accepted
    PairingAccepted,
    /// Companion user declined
    PairingDeclined,
    /// Ask for the peer's battery level
    RequestBattery,
    /// Battery level reply
    BatteryStatus,
    /// Ask for the peer's device name
    RequestDeviceInfo,
    /// Device name reply
    DeviceInfo,
    /// Lesson session started
    TutorialStarted,
    /// Current letter of the lesson
    LetterData,
    /// Every letter done; summary may be shown
    SessionComplete,
    /// Lesson session ended
    TutorialEnded,
    /// Lesson session reset
    SessionReset,
    /// Feedback overlay dismissed
    FeedbackDismissed,
    /// Retry the current letter
    Retry,
    /// Skip the rest of the session
    Skip,
    /// Classifier verdict for a gesture
    GestureResult,
}

impl Path {
    /// All known paths.
    pub const ALL: [Self; 18] = [
        Self::Ping,
        Self::Pong,
        Self::PairingRequest,
        Self::PairingAccepted,
        Self::PairingDeclined,
        Self::RequestBattery,
        Self::BatteryStatus,
        Self::RequestDeviceInfo,
        Self::DeviceInfo,
        Self::TutorialStarted,
        Self::LetterData,
        Self::SessionComplete,
        Self::TutorialEnded,
        Self::SessionReset,
        Self::FeedbackDismissed,
        Self::Retry,
        Self::Skip,
        Self::GestureResult,
    ];

    /// The on-the-wire path string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "/kusho/ping",
            Self::Pong => "/kusho/pong",
            Self::PairingRequest => "/pairing_request",
            Self::PairingAccepted => "/pairing_accepted",
            Self::PairingDeclined => "/pairing_declined",
            Self::RequestBattery => "/request_battery",
            Self::BatteryStatus => "/battery_status",
            Self::RequestDeviceInfo => "/request_device_info",
            Self::DeviceInfo => "/device_info",
            Self::TutorialStarted => "/tutorial_mode_started",
            Self::LetterData => "/tutorial_mode_letter_data",
            Self::SessionComplete => "/tutorial_mode_session_complete",
            Self::TutorialEnded => "/tutorial_mode_ended",
            Self::SessionReset => "/tutorial_mode_session_reset",
            Self::FeedbackDismissed => "/tutorial_mode_feedback_dismissed",
            Self::Retry => "/tutorial_mode_retry",
            Self::Skip => "/tutorial_mode_skip",
            Self::GestureResult => "/tutorial_mode_gesture_result",
        }
    }

    /// Parse a wire path. Unknown paths yield `None`.
    #[must_use]
    pub fn parse(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == path)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pairing request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequestPayload {
    /// Human-readable name of the requesting wearable
    pub watch_name: String,
}

/// Lesson session start payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TutorialStartedPayload {
    /// Learner shown on the wearable
    pub student_name: String,
    /// Lesson title
    pub lesson_title: String,
    /// Number of letters, when the sender knows it up front
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_letters: Option<u32>,
}

/// Per-letter step payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LetterDataPayload {
    /// Letter to trace
    pub letter: String,
    /// `"uppercase"` or `"lowercase"`
    pub letter_case: String,
    /// Zero-based position in the lesson
    pub current_index: u32,
    /// Number of letters in the lesson
    pub total_letters: u32,
    /// `"left"` or `"right"`
    pub dominant_hand: String,
}

/// Gesture classification verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GestureResultPayload {
    /// Whether the predicted letter matched the expected one
    pub is_correct: bool,
    /// Letter the classifier saw
    pub predicted_letter: String,
}

/// Encode a JSON payload.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a JSON payload received on `path`.
///
/// # Errors
///
/// Returns [`Error::MalformedPayload`] if the bytes are not the expected object.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(path: &str, data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::MalformedPayload {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// Encode a battery percentage as decimal ASCII.
#[must_use]
pub fn encode_battery(level: u8) -> Vec<u8> {
    level.min(100).to_string().into_bytes()
}

/// Decode a decimal-ASCII battery percentage.
///
/// # Errors
///
/// Returns [`Error::MalformedPayload`] for non-numeric text or values above 100.
pub fn decode_battery(data: &[u8]) -> Result<u8> {
    let malformed = |reason: String| Error::MalformedPayload {
        path: Path::BatteryStatus.as_str().to_string(),
        reason,
    };

    let text = std::str::from_utf8(data).map_err(|e| malformed(e.to_string()))?;
    let level: u8 = text
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| malformed(e.to_string()))?;
    if level > 100 {
        return Err(malformed(format!("battery level {level} out of range")));
    }
    Ok(level)
}

/// Decode a UTF-8 device name.
///
/// # Errors
///
/// Returns [`Error::MalformedPayload`] if the payload is not UTF-8.
pub fn decode_device_name(data: &[u8]) -> Result<String> {
    String::from_utf8(data.to_vec()).map_err(|e| Error::MalformedPayload {
        path: Path::DeviceInfo.as_str().to_string(),
        reason: e.to_string(),
    })
}
