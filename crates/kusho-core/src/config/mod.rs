//! Configuration management for Kusho.
//!
//! This module handles loading, saving, and managing Kusho configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/kusho/config.toml` |
//! | macOS | `~/Library/Application Support/com.kusho.Kusho/config.toml` |
//! | Windows | `%APPDATA%\Kusho\Kusho\config\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use kusho_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Heartbeat every {:?}", config.heartbeat.interval);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::NodeId;
use crate::error::{Error, Result};

/// Main configuration struct for Kusho.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Transport settings
    pub transport: TransportConfig,
    /// Heartbeat settings
    pub heartbeat: HeartbeatConfig,
    /// Pairing settings
    pub pairing: PairingConfig,
    /// Session sync settings
    pub session: SessionConfig,
}

/// General configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Human-readable name sent in pairing requests and device-info replies
    pub device_name: String,
    /// Stable node identifier; generated on first run when absent
    pub node_id: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            device_name: hostname::get().map_or_else(
                |_| "Kusho Device".to_string(),
                |h| h.to_string_lossy().to_string(),
            ),
            node_id: None,
        }
    }
}

/// UDP transport options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Port used for beacons and message datagrams
    pub port: u16,
    /// How often presence beacons are broadcast
    #[serde(with = "humantime_serde")]
    pub beacon_interval: Duration,
    /// A peer not heard from for this long is unreachable
    #[serde(with = "humantime_serde")]
    pub peer_ttl: Duration,
    /// A peer heard from within this window is reported as nearby
    #[serde(with = "humantime_serde")]
    pub nearby_window: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_PORT,
            beacon_interval: Duration::from_secs(1),
            peer_ttl: Duration::from_secs(6),
            nearby_window: Duration::from_secs(3),
        }
    }
}

/// Heartbeat options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Delay between probes
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How long to wait for a pong
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(crate::DEFAULT_HEARTBEAT_INTERVAL_SECS),
            timeout: Duration::from_secs(crate::DEFAULT_PING_TIMEOUT_SECS),
        }
    }
}

/// Pairing options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// How long to wait for the liveness pong before the handshake
    #[serde(with = "humantime_serde")]
    pub ping_timeout: Duration,
    /// How long to wait for the user on the companion
    #[serde(with = "humantime_serde")]
    pub acceptance_timeout: Duration,
    /// Retry-counted failures allowed before the attempt gives up
    pub max_retries: u32,
    /// How long the success state is shown before moving to paired
    #[serde(with = "humantime_serde")]
    pub success_hold: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(crate::DEFAULT_PING_TIMEOUT_SECS),
            acceptance_timeout: Duration::from_secs(crate::DEFAULT_ACCEPTANCE_TIMEOUT_SECS),
            max_retries: crate::DEFAULT_MAX_RETRIES,
            success_hold: Duration::from_secs(crate::DEFAULT_SUCCESS_HOLD_SECS),
        }
    }
}

/// Session sync options.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Identical step updates closer together than this are dropped
    #[serde(with = "humantime_serde")]
    pub dedup_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_millis(crate::DEFAULT_DEDUP_WINDOW_MS),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Check values that would make the protocol misbehave.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.interval.is_zero() {
            return Err(Error::InvalidConfig {
                key: "heartbeat.interval".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.pairing.max_retries == 0 {
            return Err(Error::InvalidConfig {
                key: "pairing.max_retries".to_string(),
                reason: "must allow at least one attempt".to_string(),
            });
        }
        if self.transport.nearby_window > self.transport.peer_ttl {
            return Err(Error::InvalidConfig {
                key: "transport.nearby_window".to_string(),
                reason: "cannot exceed transport.peer_ttl".to_string(),
            });
        }
        Ok(())
    }

    /// Node id from `[general]`, generating a random one when unset.
    ///
    /// Returns the id and whether it was just generated, so the caller knows
    /// to save the configuration.
    pub fn ensure_node_id(&mut self) -> (NodeId, bool) {
        if let Some(id) = &self.general.node_id {
            return (NodeId::new(id.clone()), false);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.general.node_id = Some(id.clone());
        (NodeId::new(id), true)
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "kusho", "Kusho")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the default data directory path (pairing record lives here).
    #[must_use]
    pub fn data_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "kusho", "Kusho")
            .map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.strip_suffix("ms")
            .map(|millis| {
                millis
                    .parse()
                    .map(Duration::from_millis)
                    .map_err(serde::de::Error::custom)
            })
            .or_else(|| {
                s.strip_suffix('s').map(|secs| {
                    secs.parse()
                        .map(Duration::from_secs)
                        .map_err(serde::de::Error::custom)
                })
            })
            .or_else(|| {
                s.strip_suffix('m').map(|mins| {
                    mins.parse::<u64>()
                        .map(|m| Duration::from_secs(m * 60))
                        .map_err(serde::de::Error::custom)
                })
            })
            .unwrap_or_else(|| Err(serde::de::Error::custom("invalid duration format")))
    }
}
