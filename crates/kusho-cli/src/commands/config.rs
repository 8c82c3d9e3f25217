//! Config command implementation.

use std::time::Duration;

use anyhow::{bail, Result};
use kusho_core::config::Config;

use super::{ConfigAction, ConfigArgs};
use crate::ui::{format_duration, parse_duration};

/// Run the config command.
pub async fn run(args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            match get_config_value(&config, &key) {
                Some(v) => println!("{}: {}", key, v),
                None => println!("Unknown configuration key: {}", key),
            }
        }

        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            if set_config_value(&mut config, &key, &value)? {
                config.validate()?;
                config.save()?;
                println!("Set {} = {}", key, value);
            } else {
                println!("Unknown configuration key: {}", key);
            }
        }

        ConfigAction::Show => {
            let config = Config::load()?;
            show(&config);
        }

        ConfigAction::Path => {
            println!("{}", Config::config_path().display());
        }

        ConfigAction::Init => {
            let path = Config::config_path();
            if path.exists() {
                println!("Configuration already exists at {}", path.display());
            } else {
                let mut config = Config::default();
                config.ensure_node_id();
                config.save()?;
                println!("Wrote default configuration to {}", path.display());
            }
        }

        ConfigAction::Reset => {
            let previous = Config::load().unwrap_or_default();
            let mut config = Config::default();
            config.general.node_id = previous.general.node_id;
            config.save()?;
            println!("Configuration reset to defaults.");
        }
    }

    Ok(())
}

fn show(config: &Config) {
    println!();
    println!("Kusho Configuration");
    println!("{}", "─".repeat(50));
    println!();
    println!("[general]");
    println!("  device_name = \"{}\"", config.general.device_name);
    match &config.general.node_id {
        Some(id) => println!("  node_id = \"{}\"", id),
        None => println!("  node_id = (generated on first run)"),
    }
    println!();
    println!("[transport]");
    println!("  port = {}", config.transport.port);
    println!(
        "  beacon_interval = \"{}\"",
        format_duration(config.transport.beacon_interval)
    );
    println!("  peer_ttl = \"{}\"", format_duration(config.transport.peer_ttl));
    println!(
        "  nearby_window = \"{}\"",
        format_duration(config.transport.nearby_window)
    );
    println!();
    println!("[heartbeat]");
    println!("  interval = \"{}\"", format_duration(config.heartbeat.interval));
    println!("  timeout = \"{}\"", format_duration(config.heartbeat.timeout));
    println!();
    println!("[pairing]");
    println!(
        "  ping_timeout = \"{}\"",
        format_duration(config.pairing.ping_timeout)
    );
    println!(
        "  acceptance_timeout = \"{}\"",
        format_duration(config.pairing.acceptance_timeout)
    );
    println!("  max_retries = {}", config.pairing.max_retries);
    println!(
        "  success_hold = \"{}\"",
        format_duration(config.pairing.success_hold)
    );
    println!();
    println!("[session]");
    println!(
        "  dedup_window = \"{}\"",
        format_duration(config.session.dedup_window)
    );
    println!();
}

fn get_config_value(config: &Config, key: &str) -> Option<String> {
    match key {
        "general.device_name" | "device_name" => Some(config.general.device_name.clone()),
        "general.node_id" | "node_id" => config.general.node_id.clone(),
        "transport.port" | "port" => Some(config.transport.port.to_string()),
        "transport.beacon_interval" => Some(format_duration(config.transport.beacon_interval)),
        "transport.peer_ttl" => Some(format_duration(config.transport.peer_ttl)),
        "transport.nearby_window" => Some(format_duration(config.transport.nearby_window)),
        "heartbeat.interval" => Some(format_duration(config.heartbeat.interval)),
        "heartbeat.timeout" => Some(format_duration(config.heartbeat.timeout)),
        "pairing.ping_timeout" => Some(format_duration(config.pairing.ping_timeout)),
        "pairing.acceptance_timeout" => Some(format_duration(config.pairing.acceptance_timeout)),
        "pairing.max_retries" => Some(config.pairing.max_retries.to_string()),
        "pairing.success_hold" => Some(format_duration(config.pairing.success_hold)),
        "session.dedup_window" => Some(format_duration(config.session.dedup_window)),
        _ => None,
    }
}

fn set_config_value(config: &mut Config, key: &str, value: &str) -> Result<bool> {
    let duration = || parse_config_duration(value);

    match key {
        "general.device_name" | "device_name" => config.general.device_name = value.to_string(),
        "transport.port" | "port" => config.transport.port = value.parse()?,
        "transport.beacon_interval" => config.transport.beacon_interval = duration()?,
        "transport.peer_ttl" => config.transport.peer_ttl = duration()?,
        "transport.nearby_window" => config.transport.nearby_window = duration()?,
        "heartbeat.interval" => config.heartbeat.interval = duration()?,
        "heartbeat.timeout" => config.heartbeat.timeout = duration()?,
        "pairing.ping_timeout" => config.pairing.ping_timeout = duration()?,
        "pairing.acceptance_timeout" => config.pairing.acceptance_timeout = duration()?,
        "pairing.max_retries" => config.pairing.max_retries = value.parse()?,
        "pairing.success_hold" => config.pairing.success_hold = duration()?,
        "session.dedup_window" => config.session.dedup_window = duration()?,
        _ => return Ok(false),
    }
    Ok(true)
}

fn parse_config_duration(value: &str) -> Result<Duration> {
    match parse_duration(value) {
        Some(d) => Ok(d),
        None => bail!("Invalid duration '{}' (use e.g. 500ms, 3s, 1m)", value),
    }
}
