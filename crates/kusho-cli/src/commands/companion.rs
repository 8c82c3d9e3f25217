//! Companion command implementation.
//!
//! Plays the handheld: answers pairing requests, then optionally drives a
//! letter-tracing lesson on the paired wearable.

use std::io::{self, Write};

use anyhow::Result;
use kusho_core::device::CompanionDevice;
use kusho_core::heartbeat::ConnectionTransition;
use kusho_core::pairing::PairingStore;
use kusho_core::protocol::LetterDataPayload;
use kusho_core::session::ControlSignal;
use kusho_core::NodeId;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast;

use super::CompanionArgs;
use crate::ui::{format_remaining, StatusBox};

type Input = Lines<BufReader<Stdin>>;

/// A lesson given on the command line.
struct Lesson {
    title: String,
    student: String,
    letters: Vec<char>,
    hand: String,
}

impl Lesson {
    fn total(&self) -> u32 {
        u32::try_from(self.letters.len()).unwrap_or(u32::MAX)
    }

    fn step(&self, index: usize) -> Option<LetterDataPayload> {
        let letter = *self.letters.get(index)?;
        Some(LetterDataPayload {
            letter: letter.to_string(),
            letter_case: if letter.is_lowercase() {
                "lowercase".to_string()
            } else {
                "uppercase".to_string()
            },
            current_index: u32::try_from(index).unwrap_or(u32::MAX),
            total_letters: self.total(),
            dominant_hand: self.hand.clone(),
        })
    }
}

/// Run the companion command.
pub async fn run(args: CompanionArgs) -> Result<()> {
    let mut config = super::load_config();
    if let Some(name) = args.name {
        config.general.device_name = name;
    }
    let channel = super::open_channel(&mut config).await?;
    let mut store = PairingStore::load_companion()?;
    if args.repair {
        store.clear()?;
    }
    let device = CompanionDevice::new(&config, channel, store.shared(), None);

    let lesson = args.lesson.zip(args.letters).map(|(title, letters)| Lesson {
        title,
        student: args.student,
        letters: letters.chars().filter(|c| c.is_alphabetic()).collect(),
        hand: args.hand,
    });

    println!();
    StatusBox::new(&config.general.device_name)
        .with_line("Waiting for a wearable to pair")
        .display();
    println!();

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let acceptance = format_remaining(config.pairing.acceptance_timeout);

    let Some(node) = wait_for_pairing(&device, args.auto_accept, &acceptance, &mut input).await?
    else {
        device.shutdown();
        return Ok(());
    };
    println!("  Paired with {}", node);
    println!();

    let heartbeat = tokio::spawn(print_transitions(device.heartbeat().transitions()));

    match lesson {
        Some(lesson) if !lesson.letters.is_empty() => run_lesson(&device, &lesson).await?,
        Some(_) => println!("  No letters to practise."),
        None => watch_signals(&device).await,
    }

    heartbeat.abort();
    device.shutdown();
    Ok(())
}

/// Surface requests until one is accepted, or return the pairing restored
/// from the record. `None` if the user gave up.
async fn wait_for_pairing(
    device: &CompanionDevice,
    auto_accept: bool,
    acceptance: &str,
    input: &mut Input,
) -> Result<Option<NodeId>> {
    let broker = device.pairing();
    if let Some(node) = broker.paired_node().peek() {
        return Ok(Some(node));
    }
    let mut pending = broker.pending();

    loop {
        let Some(request) = pending.get() else {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return Ok(None),
                changed = pending.changed() => {
                    if changed.is_err() {
                        return Ok(None);
                    }
                }
            }
            continue;
        };

        println!(
            "  Pairing request from {} ({}), respond within {}",
            request.watch_name, request.node_id, acceptance
        );

        let accepted = if auto_accept {
            true
        } else {
            print!("  Accept? [Y/n] ");
            io::stdout().flush()?;
            let Some(line) = input.next_line().await? else {
                return Ok(None);
            };
            let line = line.trim().to_lowercase();
            line.is_empty() || line == "y" || line == "yes"
        };

        if accepted {
            match broker.accept(&request.node_id).await {
                Ok(true) => return Ok(Some(request.node_id)),
                Ok(false) => println!("  That request is no longer pending."),
                Err(e) => {
                    tracing::warn!("Failed to accept {}: {}", request.node_id, e);
                    println!(
                        "  Could not reach {}; waiting for it to ask again.",
                        request.watch_name
                    );
                }
            }
        } else {
            match broker.decline(&request.node_id).await {
                Ok(true) => println!("  Declined {}.", request.watch_name),
                Ok(false) => {}
                Err(e) => tracing::warn!("Failed to decline {}: {}", request.node_id, e),
            }
        }
        broker.flush().await?;
    }
}

/// Walk through the letters, advancing on a correct trace or a skip.
async fn run_lesson(device: &CompanionDevice, lesson: &Lesson) -> Result<()> {
    let bridge = device.session();
    let mut signals = bridge.control_signals();

    bridge
        .start_session(&lesson.student, &lesson.title, Some(lesson.total()))
        .await?;
    println!(
        "  Lesson \"{}\" for {}: {} letters",
        lesson.title,
        lesson.student,
        lesson.total()
    );

    let mut index = 0;
    while let Some(step) = lesson.step(index) {
        bridge.send_step(&step).await?;
        println!(
            "  Letter {}/{}: {}",
            index + 1,
            step.total_letters,
            step.letter
        );

        let advance = loop {
            let Some(signal) = next_signal(&mut signals).await else {
                bridge.end_session().await?;
                return Ok(());
            };
            match signal {
                ControlSignal::GestureResult {
                    is_correct: true, ..
                } => {
                    println!("    Traced correctly.");
                    break true;
                }
                ControlSignal::GestureResult {
                    predicted_letter, ..
                } => {
                    println!("    Read as '{}', trying again.", predicted_letter);
                    break false;
                }
                ControlSignal::Skip => {
                    println!("    Skipped.");
                    break true;
                }
                ControlSignal::Retry => break false,
                ControlSignal::FeedbackDismissed => {}
            }
        };
        if advance {
            index += 1;
        }
    }

    bridge.complete_session().await?;
    println!();
    println!("  Lesson complete. Waiting for the learner to close it...");

    loop {
        match next_signal(&mut signals).await {
            Some(ControlSignal::FeedbackDismissed) | None => break,
            Some(_) => {}
        }
    }
    bridge.end_session().await?;
    println!("  Lesson ended.");
    Ok(())
}

/// Print learner actions until Ctrl+C.
async fn watch_signals(device: &CompanionDevice) {
    let mut signals = device.session().control_signals();
    println!("  Listening for learner actions (Ctrl+C to stop)");
    while let Some(signal) = next_signal(&mut signals).await {
        println!("  {:?}", signal);
    }
}

/// Next control signal, or `None` on Ctrl+C.
async fn next_signal(signals: &mut broadcast::Receiver<ControlSignal>) -> Option<ControlSignal> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return None,
            received = signals.recv() => match received {
                Ok(signal) => return Some(signal),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} learner actions", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            },
        }
    }
}

async fn print_transitions(mut transitions: broadcast::Receiver<ConnectionTransition>) {
    loop {
        match transitions.recv().await {
            Ok(t) if t.is_connected => println!("  Wearable reconnected."),
            Ok(_) => println!("  Lost connection to wearable."),
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lesson(letters: &str) -> Lesson {
        Lesson {
            title: "Vowels".to_string(),
            student: "Alice".to_string(),
            letters: letters.chars().collect(),
            hand: "left".to_string(),
        }
    }

    #[test]
    fn test_lesson_steps() {
        let lesson = lesson("Ab");
        assert_eq!(lesson.total(), 2);

        let first = lesson.step(0).unwrap();
        assert_eq!(first.letter, "A");
        assert_eq!(first.letter_case, "uppercase");
        assert_eq!(first.current_index, 0);
        assert_eq!(first.dominant_hand, "left");

        let second = lesson.step(1).unwrap();
        assert_eq!(second.letter_case, "lowercase");
        assert_eq!(second.current_index, 1);

        assert!(lesson.step(2).is_none());
    }
}
