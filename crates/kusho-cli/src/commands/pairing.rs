//! Pairing command implementation.

use anyhow::Result;
use kusho_core::pairing::{PairingRecord, PairingStore};

use super::{PairingAction, PairingArgs};

/// Run the pairing command.
pub async fn run(args: PairingArgs) -> Result<()> {
    let load = if args.companion {
        PairingStore::load_companion
    } else {
        PairingStore::load
    };

    match args.action {
        PairingAction::Status { json } => {
            let store = load()?;
            if json {
                println!("{}", serde_json::to_string_pretty(store.record())?);
            } else {
                print_status(store.record());
            }
        }

        PairingAction::Reset => {
            let mut store = load()?;
            if *store.record() == PairingRecord::default() {
                println!("No pairing stored.");
            } else {
                store.clear()?;
                if args.companion {
                    println!("Pairing forgotten. The companion will wait for a new request.");
                } else {
                    println!("Pairing forgotten. The wearable will ask to pair on next launch.");
                }
            }
        }

        PairingAction::Path => {
            let path = if args.companion {
                PairingStore::companion_path()
            } else {
                PairingStore::default_path()
            };
            match path {
                Some(path) => println!("{}", path.display()),
                None => println!("No data directory available on this platform."),
            }
        }
    }

    Ok(())
}

fn print_status(record: &PairingRecord) {
    println!();
    println!("Pairing");
    println!("{}", "─".repeat(50));
    println!("  {}", describe(record));
    if record.show_max_retries_on_next_launch {
        println!("  Connection was lost; next launch starts at the retry screen.");
    }
    println!();
}

fn describe(record: &PairingRecord) -> String {
    match (&record.paired_node_id, record.is_paired, record.is_skipped) {
        (Some(node), true, _) => format!("Paired with {}", node),
        (_, _, true) => "Skipped (running without companion)".to_string(),
        _ => "Not paired".to_string(),
    }
}
