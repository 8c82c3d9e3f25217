//! Peripheral command implementation.
//!
//! Plays the wearable: pairs with a companion (or skips), then mirrors the
//! companion's lesson and reports the learner's actions typed on stdin.

use std::io::{self, Write};
use std::time::Duration;

use anyhow::Result;
use kusho_core::device::PeripheralDevice;
use kusho_core::gesture::{Classification, GestureClassifier, MotionSample};
use kusho_core::pairing::{PairingState, PairingStore};
use kusho_core::session::{StepData, SyncSession};
use kusho_core::state::StateReader;
use kusho_core::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast;

use super::PeripheralArgs;
use crate::ui::StatusBox;

type Input = Lines<BufReader<Stdin>>;

/// Delay before automatically retrying a failed attempt that still has budget.
const AUTO_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Stands in for the motion model: the learner types the letter they traced.
struct TypedLetter(String);

impl GestureClassifier for TypedLetter {
    fn classify(&self, _window: &[MotionSample]) -> Classification {
        Classification {
            label: self.0.clone(),
            confidence: 1.0,
        }
    }
}

/// Run the peripheral command.
pub async fn run(args: PeripheralArgs) -> Result<()> {
    let mut config = super::load_config();
    if let Some(name) = args.name {
        config.general.device_name = name;
    }
    let channel = super::open_channel(&mut config).await?;

    let mut store = PairingStore::load()?;
    if args.repair {
        store.clear()?;
    }
    let device = PeripheralDevice::new(&config, channel, store.shared(), None);

    println!();
    StatusBox::new(&config.general.device_name)
        .with_line(format!("Node {}", device.local_id()))
        .display();
    println!();

    let mut input = BufReader::new(tokio::io::stdin()).lines();

    if args.skip {
        device.pairing().skip();
    } else if device.needs_pairing() && !pair(&device, &mut input).await? {
        device.shutdown();
        return Ok(());
    }

    device.pairing().flush().await?;
    println!("  {}", capitalize(&device.pairing().snapshot().to_string()));
    println!();
    println!("  Commands: trace <letter>, retry, skip, done, quit");
    println!();

    follow(&device, &mut input).await?;
    device.shutdown();
    Ok(())
}

/// Drive pairing until it is settled. Returns `false` if the user quit.
async fn pair(device: &PeripheralDevice, input: &mut Input) -> Result<bool> {
    let printer = tokio::spawn(print_pairing_states(device.pairing().state()));

    let mut outcome = match device.pairing().snapshot() {
        PairingState::Prompt => device.pairing().attempt().await?,
        other => other,
    };

    let settled = loop {
        match outcome {
            PairingState::Paired { .. } | PairingState::Skipped => break true,
            PairingState::Error { .. } => {
                tokio::time::sleep(AUTO_RETRY_DELAY).await;
                outcome = device.pairing().attempt().await?;
            }
            _ => match ask_retry_or_skip(input).await? {
                Some(true) => outcome = device.pairing().retry().await?,
                Some(false) => {
                    device.pairing().skip();
                    break true;
                }
                None => break false,
            },
        }
    };

    printer.abort();
    Ok(settled)
}

async fn print_pairing_states(mut state: StateReader<PairingState>) {
    let mut current = state.get();
    loop {
        println!("  {}", describe_state(&current));
        match state.changed().await {
            Ok(next) => current = next,
            Err(_) => break,
        }
    }
}

/// `Some(true)` to retry, `Some(false)` to skip, `None` to quit.
async fn ask_retry_or_skip(input: &mut Input) -> Result<Option<bool>> {
    loop {
        print!("  Retry, skip, or quit? [r/s/q] ");
        io::stdout().flush()?;

        let Some(line) = input.next_line().await? else {
            return Ok(None);
        };
        match line.trim().to_lowercase().as_str() {
            "" | "r" | "retry" => return Ok(Some(true)),
            "s" | "skip" => return Ok(Some(false)),
            "q" | "quit" => return Ok(None),
            _ => println!("  Please answer r, s or q."),
        }
    }
}

/// Mirror the lesson and forward learner commands until quit or Ctrl+C.
async fn follow(device: &PeripheralDevice, input: &mut Input) -> Result<()> {
    let mut session = device.session().session();
    let mut step = device.session().step();
    let mut transitions = device.heartbeat().transitions();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            changed = session.changed() => {
                let Ok(current) = changed else { break };
                print_session(current.as_ref());
            }

            changed = step.changed() => {
                let Ok(current) = changed else { break };
                if let Some(current) = current {
                    print_step(&current);
                }
            }

            received = transitions.recv() => match received {
                Ok(transition) if transition.is_connected => {
                    println!("  Companion connection restored.");
                }
                Ok(_) => println!("  Lost connection to companion."),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },

            line = input.next_line() => {
                let Some(line) = line? else { break };
                if !handle_command(device, line.trim()).await {
                    break;
                }
            }
        }
    }

    Ok(())
}

/// Returns `false` when the user asked to quit.
async fn handle_command(device: &PeripheralDevice, line: &str) -> bool {
    let bridge = device.session();
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));

    let result = match command {
        "" => return true,
        "quit" | "q" => return false,
        "retry" => bridge.send_retry().await,
        "skip" => bridge.send_skip().await,
        "done" => bridge.send_feedback_dismissed().await,
        "trace" => {
            let classifier = TypedLetter(rest.trim().to_string());
            bridge
                .submit_gesture(&classifier, &[])
                .await
                .map(|outcome| {
                    if outcome.is_correct {
                        println!("  Correct!");
                    } else {
                        println!(
                            "  That looked like '{}', expected '{}'.",
                            outcome.classification.label, outcome.expected
                        );
                    }
                })
        }
        other => {
            println!("  Unknown command: {}", other);
            return true;
        }
    };

    match result {
        Ok(()) => {}
        Err(Error::NotPaired) => println!("  Not paired; nothing was sent."),
        Err(Error::NoActiveStep) => println!("  No letter on screen yet."),
        Err(e) => println!("  Failed: {}", e),
    }
    true
}

fn print_session(session: Option<&SyncSession>) {
    match session {
        Some(s) if s.is_complete => println!("  Lesson \"{}\" complete. Well done!", s.title),
        Some(s) => println!(
            "  Lesson \"{}\" for {} ({} letters)",
            s.title, s.participant_label, s.total_steps
        ),
        None => println!("  Lesson ended."),
    }
}

fn print_step(step: &StepData) {
    println!(
        "  Letter {}/{}: {} ({}, {} hand)",
        step.step_index + 1,
        step.fields.total_letters,
        step.fields.letter,
        step.fields.letter_case,
        step.fields.dominant_hand
    );
}

/// One status line; steps still running end in an ellipsis.
fn describe_state(state: &PairingState) -> String {
    let line = capitalize(&state.to_string());
    if state.is_in_progress() {
        format!("{line}...")
    } else {
        line
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capitalize() {
        assert_eq!(capitalize("paired with nodeX"), "Paired with nodeX");
        assert_eq!(capitalize(""), "");
    }

    #[test]
    fn test_describe_state() {
        assert_eq!(
            describe_state(&PairingState::Checking),
            "Looking for companion..."
        );
        assert_eq!(
            describe_state(&PairingState::Declined),
            "Pairing declined"
        );
    }

    #[test]
    fn test_typed_letter_classifier() {
        let classifier = TypedLetter("b".to_string());
        let classification = classifier.classify(&[MotionSample::default()]);
        assert_eq!(classification.label, "b");
        assert!((classification.confidence - 1.0).abs() < f32::EPSILON);
    }
}
