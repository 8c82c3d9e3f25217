//! Common test utilities for `Kusho` integration tests.
//!
//! This module provides shared functionality for integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kusho_core::channel::memory::{MemoryChannel, MemoryNetwork};
use kusho_core::config::Config;
use kusho_core::pairing::{PairingStore, SharedPairingStore};
use kusho_core::protocol::{self, LetterDataPayload, Path, TutorialStartedPayload};
use kusho_core::{Message, NodeId};

/// Create a temporary directory for test files.
///
/// The directory will be automatically cleaned up when the returned
/// `TempDir` is dropped.
pub fn create_temp_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temp directory")
}

/// Pairing record path inside `dir`.
pub fn record_path(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("pairing.json")
}

/// Load a file-backed pairing store.
pub fn file_store(dir: &tempfile::TempDir) -> SharedPairingStore {
    PairingStore::load_from(record_path(dir))
        .expect("Failed to load pairing record")
        .shared()
}

/// Configuration with the default timings and a fixed device name.
pub fn config(name: &str) -> Config {
    let mut config = Config::default();
    config.general.device_name = name.to_string();
    config
}

/// A network with one wearable ("watch") and one phone ("nodeX").
pub fn two_devices() -> (MemoryNetwork, Arc<MemoryChannel>, Arc<MemoryChannel>) {
    let network = MemoryNetwork::new();
    let watch = Arc::new(network.join("watch", "Watch1"));
    let phone = Arc::new(network.join("nodeX", "Phone"));
    (network, watch, phone)
}

/// Letter step as the companion sends it.
pub fn letter(letter: &str, index: u32, total: u32) -> LetterDataPayload {
    LetterDataPayload {
        letter: letter.to_string(),
        letter_case: "uppercase".to_string(),
        current_index: index,
        total_letters: total,
        dominant_hand: "right".to_string(),
    }
}

/// Raw step message from `from`.
pub fn step_message(from: &str, step: &LetterDataPayload) -> Message {
    Message::new(
        Path::LetterData.as_str(),
        protocol::encode_payload(step).expect("encode step"),
        NodeId::from(from),
    )
}

/// Raw session-start message from `from`.
pub fn start_message(from: &str, title: &str, student: &str, total: u32) -> Message {
    Message::new(
        Path::TutorialStarted.as_str(),
        protocol::encode_payload(&TutorialStartedPayload {
            student_name: student.to_string(),
            lesson_title: title.to_string(),
            total_letters: Some(total),
        })
        .expect("encode start"),
        NodeId::from(from),
    )
}

/// Let spawned tasks drain under paused time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
