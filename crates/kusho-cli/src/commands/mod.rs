//! CLI command definitions and handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kusho_core::channel::udp::UdpChannel;
use kusho_core::config::Config;

pub mod companion;
pub mod config;
pub mod pairing;
pub mod peripheral;

/// Load configuration with graceful fallback to defaults.
///
/// If the config file doesn't exist or can't be parsed, this falls back to
/// defaults.
pub fn load_config() -> Config {
    Config::load().unwrap_or_default()
}

/// Bind the LAN transport for this process.
///
/// A node id is generated on first run and written back to the configuration
/// file so the companion recognises this device after a restart.
pub async fn open_channel(config: &mut Config) -> Result<Arc<UdpChannel>> {
    let (node_id, generated) = config.ensure_node_id();
    if generated {
        match config.save() {
            Ok(()) => tracing::info!("Generated node id {}", node_id),
            Err(e) => tracing::warn!("Failed to save generated node id: {}", e),
        }
    }

    let channel = UdpChannel::bind(node_id, &config.general.device_name, &config.transport)
        .await
        .with_context(|| format!("Failed to bind UDP port {}", config.transport.port))?;
    Ok(Arc::new(channel))
}

/// Kusho - pair a wearable with its companion and mirror lessons
#[derive(Parser)]
#[command(name = "kusho")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand)]
pub enum Command {
    /// Run as the wearable: pair, then follow the companion's lesson
    Peripheral(PeripheralArgs),

    /// Run as the handheld: answer pairing requests and drive a lesson
    Companion(CompanionArgs),

    /// Inspect or reset the stored pairing
    Pairing(PairingArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the peripheral command
#[derive(Parser)]
pub struct PeripheralArgs {
    /// Device name announced to the companion
    #[arg(long)]
    pub name: Option<String>,

    /// Skip pairing and run offline
    #[arg(long)]
    pub skip: bool,

    /// Start a fresh pairing attempt even if a pairing is stored
    #[arg(long, conflicts_with = "skip")]
    pub repair: bool,
}

/// Arguments for the companion command
#[derive(Parser)]
pub struct CompanionArgs {
    /// Device name announced to the wearable
    #[arg(long)]
    pub name: Option<String>,

    /// Accept the first pairing request without asking
    #[arg(long)]
    pub auto_accept: bool,

    /// Forget the stored wearable and wait for a new pairing request
    #[arg(long)]
    pub repair: bool,

    /// Lesson title to run once paired
    #[arg(long, requires = "letters")]
    pub lesson: Option<String>,

    /// Learner shown on the wearable
    #[arg(long, default_value = "Student")]
    pub student: String,

    /// Letters to trace, in order (e.g., AEIOU)
    #[arg(long, requires = "lesson")]
    pub letters: Option<String>,

    /// Hand the learner writes with
    #[arg(long, default_value = "right", value_parser = ["left", "right"])]
    pub hand: String,
}

/// Arguments for the pairing command
#[derive(Parser)]
pub struct PairingArgs {
    /// Use the companion's record instead of the wearable's
    #[arg(long, global = true)]
    pub companion: bool,

    /// Pairing subcommand
    #[command(subcommand)]
    pub action: PairingAction,
}

/// Pairing subcommands
#[derive(Subcommand)]
pub enum PairingAction {
    /// Show the stored pairing record
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Forget the stored pairing so the next launch asks again
    Reset,

    /// Show the pairing record path
    Path,
}

/// Arguments for the config command
#[derive(Parser)]
pub struct ConfigArgs {
    /// Config subcommand
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Config subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a configuration value
    Get {
        /// Configuration key (e.g., heartbeat.interval)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,

        /// Value to set
        value: String,
    },

    /// Show all configuration
    Show,

    /// Show the configuration file path
    Path,

    /// Write the default configuration file if none exists
    Init,

    /// Reset to defaults
    Reset,
}
