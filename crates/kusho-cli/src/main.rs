//! Kusho CLI - pair a wearable with its companion over the local network
//!
//! One process plays the wearable (peripheral), another plays the handheld
//! (companion). Once paired, the companion drives a letter-tracing lesson and
//! the wearable mirrors it.
//!
//! ## Quick Start
//!
//! ```bash
//! # On the handheld
//! kusho companion --lesson Vowels --student Alice --letters AEIOU
//!
//! # On the wearable
//! kusho peripheral --name Watch1
//! ```

#![allow(clippy::doc_markdown)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::unused_async)]

use anyhow::Result;
use clap::Parser;

mod commands;
pub mod ui;

use commands::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Peripheral(args) => commands::peripheral::run(args).await,
        Command::Companion(args) => commands::companion::run(args).await,
        Command::Pairing(args) => commands::pairing::run(args).await,
        Command::Config(args) => commands::config::run(args).await,
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,kusho=info,kusho_core=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .init();
}
