//! Persisted pairing record.
//!
//! A tiny JSON file remembering the outcome of the last pairing so the next
//! launch can skip the handshake:
//!
//! ```json
//! {
//!   "isPaired": true,
//!   "isSkipped": false,
//!   "pairedNodeId": "nodeX",
//!   "showMaxRetriesOnNextLaunch": false
//! }
//! ```
//!
//! Only terminal pairing outcomes write the record; it is read once at startup.

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::channel::NodeId;
use crate::error::{Error, Result};

/// Store shared between the coordinator and the composition root.
pub type SharedPairingStore = Arc<Mutex<PairingStore>>;

/// The persisted pairing outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PairingRecord {
    /// A companion accepted us
    pub is_paired: bool,
    /// The user chose to continue without a companion
    pub is_skipped: bool,
    /// Companion we paired with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paired_node_id: Option<NodeId>,
    /// Start the next pairing screen at "max retries reached"
    pub show_max_retries_on_next_launch: bool,
}

/// Pairing record with optional file backing.
#[derive(Debug)]
pub struct PairingStore {
    /// Backing file; `None` keeps the record in memory only
    path: Option<PathBuf>,
    record: PairingRecord,
}

impl PairingStore {
    /// Load the record from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn load() -> Result<Self> {
        let path = Self::default_path().unwrap_or_else(|| PathBuf::from("pairing.json"));
        Self::load_from(path)
    }

    /// Load from a specific path. A missing file yields an empty record.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path: Some(path),
                record: PairingRecord::default(),
            });
        }

        let file = fs::File::open(&path).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to open pairing record at {}: {}",
                path.display(),
                e
            ))
        })?;

        let record: PairingRecord =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                Error::ConfigError(format!(
                    "Failed to parse pairing record at {}: {}",
                    path.display(),
                    e
                ))
            })?;

        Ok(Self {
            path: Some(path),
            record,
        })
    }

    /// A store that never touches disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            record: PairingRecord::default(),
        }
    }

    /// Wrap the store for sharing.
    #[must_use]
    pub fn shared(self) -> SharedPairingStore {
        Arc::new(Mutex::new(self))
    }

    /// Load the companion's record from the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn load_companion() -> Result<Self> {
        let path = Self::companion_path().unwrap_or_else(|| PathBuf::from("companion.json"));
        Self::load_from(path)
    }

    /// Get the default record path.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        crate::config::Config::data_dir().map(|dir| dir.join("pairing.json"))
    }

    /// Get the default path of the companion's record.
    #[must_use]
    pub fn companion_path() -> Option<PathBuf> {
        crate::config::Config::data_dir().map(|dir| dir.join("companion.json"))
    }

    /// Path of the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Current record.
    #[must_use]
    pub fn record(&self) -> &PairingRecord {
        &self.record
    }

    /// Whether startup can go straight past the pairing screen.
    #[must_use]
    pub fn bypasses_pairing(&self) -> bool {
        (self.record.is_paired && self.record.paired_node_id.is_some()) || self.record.is_skipped
    }

    /// Write the record to its file.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!(
                    "Failed to create pairing record directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let file = fs::File::create(path).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to create pairing record at {}: {}",
                path.display(),
                e
            ))
        })?;

        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &self.record).map_err(|e| {
            Error::ConfigError(format!(
                "Failed to write pairing record at {}: {}",
                path.display(),
                e
            ))
        })?;
        writer.flush().map_err(|e| {
            Error::ConfigError(format!(
                "Failed to write pairing record at {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Record a successful pairing.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be saved.
    pub fn mark_paired(&mut self, node_id: NodeId) -> Result<()> {
        self.record.is_paired = true;
        self.record.is_skipped = false;
        self.record.paired_node_id = Some(node_id);
        self.save()
    }

    /// Record that the user chose to continue without pairing.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be saved.
    pub fn mark_skipped(&mut self) -> Result<()> {
        self.record.is_paired = false;
        self.record.is_skipped = true;
        self.record.paired_node_id = None;
        self.save()
    }

    /// Set or clear the "show max retries on next launch" flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be saved.
    pub fn set_show_max_retries(&mut self, show: bool) -> Result<()> {
        if self.record.show_max_retries_on_next_launch == show {
            return Ok(());
        }
        self.record.show_max_retries_on_next_launch = show;
        self.save()
    }

    /// Read the "show max retries" flag and clear it.
    ///
    /// # Errors
    ///
    /// Returns an error if clearing the flag cannot be saved.
    pub fn take_show_max_retries(&mut self) -> Result<bool> {
        let show = self.record.show_max_retries_on_next_launch;
        if show {
            self.set_show_max_retries(false)?;
        }
        Ok(show)
    }

    /// Forget everything.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be saved.
    pub fn clear(&mut self) -> Result<()> {
        self.record = PairingRecord::default();
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_mark_paired_persists() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("pairing.json");

        let mut store = PairingStore::load_from(path.clone()).unwrap();
        store.mark_paired(NodeId::from("nodeX")).unwrap();

        let loaded = PairingStore::load_from(path).unwrap();
        assert!(loaded.record().is_paired);
        assert_eq!(loaded.record().paired_node_id, Some(NodeId::from("nodeX")));
        assert!(loaded.bypasses_pairing());
    }

    #[test]
    fn test_saved_file_is_complete() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("nested").join("pairing.json");

        let mut store = PairingStore::load_from(path.clone()).unwrap();
        store.mark_paired(NodeId::from("nodeX")).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        let record: PairingRecord = serde_json::from_str(&written).unwrap();
        assert_eq!(&record, store.record());
        assert!(written.contains("\"pairedNodeId\": \"nodeX\""));
    }

    #[test]
    fn test_mark_skipped_clears_node() {
        let mut store = PairingStore::in_memory();
        store.mark_paired(NodeId::from("nodeX")).unwrap();
        store.mark_skipped().unwrap();

        assert!(!store.record().is_paired);
        assert!(store.record().is_skipped);
        assert!(store.record().paired_node_id.is_none());
        assert!(store.bypasses_pairing());
    }

    #[test]
    fn test_take_show_max_retries_reads_once() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("pairing.json");

        let mut store = PairingStore::load_from(path.clone()).unwrap();
        store.set_show_max_retries(true).unwrap();

        let mut reloaded = PairingStore::load_from(path.clone()).unwrap();
        assert!(reloaded.take_show_max_retries().unwrap());
        assert!(!reloaded.take_show_max_retries().unwrap());

        let again = PairingStore::load_from(path).unwrap();
        assert!(!again.record().show_max_retries_on_next_launch);
    }

    #[test]
    fn test_wire_field_names() {
        let mut store = PairingStore::in_memory();
        store.mark_paired(NodeId::from("nodeX")).unwrap();

        let json = serde_json::to_string(store.record()).unwrap();
        assert!(json.contains("\"isPaired\":true"));
        assert!(json.contains("\"pairedNodeId\":\"nodeX\""));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let tmp_dir = TempDir::new().unwrap();
        let store = PairingStore::load_from(tmp_dir.path().join("absent.json")).unwrap();
        assert_eq!(store.record(), &PairingRecord::default());
        assert!(!store.bypasses_pairing());
    }

    #[test]
    fn test_clear() {
        let mut store = PairingStore::in_memory();
        store.mark_paired(NodeId::from("nodeX")).unwrap();
        store.clear().unwrap();
        assert!(!store.bypasses_pairing());
    }
}
