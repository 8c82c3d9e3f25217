//! Lesson session sync.
//!
//! The companion drives a lesson and the peripheral mirrors it. The
//! [`SessionSyncBridge`] turns inbound session events into two published
//! slots, the session header ([`SyncSession`]) and the step on screen
//! ([`StepData`]), and forwards learner actions (retry, skip, gesture verdicts)
//! the other way.
//!
//! The transport may duplicate or reorder messages, so the bridge is forgiving:
//!
//! - a second start for the session already running is ignored
//! - an identical step arriving within `session.dedup_window` of the last
//!   accepted one is dropped; outside the window it is accepted again
//! - ended and reset both clear everything
//!
//! Both device roles use the same bridge; the companion calls the `start_*`
//! and `send_step` side, the peripheral the `send_*` control side.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::{Message, MessageChannel, NodeId};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::gesture::{GestureClassifier, GestureOutcome, MotionSample};
use crate::protocol::{
    self, GestureResultPayload, LetterDataPayload, Path, TutorialStartedPayload,
};
use crate::state::{StateHolder, StateReader};

/// Header of the running lesson.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSession {
    /// Lesson title
    pub title: String,
    /// Learner name
    pub participant_label: String,
    /// Number of steps, 0 until known
    pub total_steps: u32,
    /// Started and not yet ended
    pub is_active: bool,
    /// Companion reported the last step done
    pub is_complete: bool,
    /// When the start arrived
    pub started_at: DateTime<Utc>,
}

/// The step currently on screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepData {
    /// Zero-based step index
    pub step_index: u32,
    /// Letter details as sent
    pub fields: LetterDataPayload,
    /// When this update was accepted
    pub observed_at: Instant,
}

/// Learner action arriving from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    /// Try the current letter again
    Retry,
    /// Move past the current letter
    Skip,
    /// Feedback overlay was closed
    FeedbackDismissed,
    /// Gesture verdict for the current letter
    GestureResult {
        /// Whether the trace matched
        is_correct: bool,
        /// What the classifier saw
        predicted_letter: String,
    },
}

#[derive(Debug, Default)]
struct Tracker {
    session: Option<SyncSession>,
    step: Option<StepData>,
}

struct Inner {
    channel: Arc<dyn MessageChannel>,
    config: SessionConfig,
    paired_node: StateReader<Option<NodeId>>,
    tracker: Mutex<Tracker>,
    session: StateHolder<Option<SyncSession>>,
    step: StateHolder<Option<StepData>>,
    signals: broadcast::Sender<ControlSignal>,
    listener: Mutex<Option<CancellationToken>>,
}

/// Mirrors lesson state between companion and peripheral.
#[derive(Clone)]
pub struct SessionSyncBridge {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionSyncBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSyncBridge")
            .field("tracker", &*self.tracker())
            .finish_non_exhaustive()
    }
}

impl SessionSyncBridge {
    /// Create a bridge talking to whichever node `paired_node` names.
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        config: SessionConfig,
        paired_node: StateReader<Option<NodeId>>,
    ) -> Self {
        let (signals, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(Inner {
                channel,
                config,
                paired_node,
                tracker: Mutex::new(Tracker::default()),
                session: StateHolder::new("session", None),
                step: StateHolder::new("session step", None),
                signals,
                listener: Mutex::new(None),
            }),
        }
    }

    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        self.inner
            .tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Reader for the session header.
    #[must_use]
    pub fn session(&self) -> StateReader<Option<SyncSession>> {
        self.inner.session.reader()
    }

    /// Reader for the current step.
    #[must_use]
    pub fn step(&self) -> StateReader<Option<StepData>> {
        self.inner.step.reader()
    }

    /// Subscribe to learner actions sent by the peer.
    #[must_use]
    pub fn control_signals(&self) -> broadcast::Receiver<ControlSignal> {
        self.inner.signals.subscribe()
    }

    /// Wait until all published updates have been applied.
    ///
    /// # Errors
    ///
    /// Returns an error if a state slot is closed.
    pub async fn flush(&self) -> Result<()> {
        self.inner.session.flush().await?;
        self.inner.step.flush().await
    }

    /// Start the inbound listener. Idempotent.
    pub fn start(&self) {
        let mut listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if listener.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let inbox = self.inner.channel.subscribe();
        let bridge = self.clone();
        let loop_cancel = cancel.clone();
        tokio::spawn(async move { bridge.listen(inbox, loop_cancel).await });
        *listener = Some(cancel);
    }

    /// Stop the inbound listener. Published state is kept.
    pub fn stop(&self) {
        let token = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    async fn listen(&self, mut inbox: broadcast::Receiver<Message>, cancel: CancellationToken) {
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => break,
                received = inbox.recv() => match received {
                    Ok(message) => message,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Session listener lagged, {} messages skipped", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };

            match self.handle_message(&message) {
                Ok(()) => {}
                Err(e) if e.is_silent() => tracing::debug!("{}", e),
                Err(e) => tracing::warn!("Dropping {} from {}: {}", message.path, message.source, e),
            }
        }
    }

    /// Apply one inbound message. Paths the bridge does not own are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateMessage`] for a repeat the bridge dropped and
    /// [`Error::MalformedPayload`] for undecodable events. Neither changes
    /// published state.
    pub fn handle_message(&self, message: &Message) -> Result<()> {
        let Some(path) = message.kind() else {
            return Ok(());
        };

        match path {
            Path::TutorialStarted => {
                let payload: TutorialStartedPayload =
                    protocol::decode_payload(&message.path, &message.payload)?;
                self.apply_start(payload)
            }
            Path::LetterData => {
                let payload: LetterDataPayload =
                    protocol::decode_payload(&message.path, &message.payload)?;
                self.apply_step(payload)
            }
            Path::SessionComplete => {
                self.apply_complete();
                Ok(())
            }
            Path::TutorialEnded | Path::SessionReset => {
                self.apply_clear(path);
                Ok(())
            }
            Path::Retry => self.emit(ControlSignal::Retry),
            Path::Skip => self.emit(ControlSignal::Skip),
            Path::FeedbackDismissed => self.emit(ControlSignal::FeedbackDismissed),
            Path::GestureResult => {
                let payload: GestureResultPayload =
                    protocol::decode_payload(&message.path, &message.payload)?;
                self.emit(ControlSignal::GestureResult {
                    is_correct: payload.is_correct,
                    predicted_letter: payload.predicted_letter,
                })
            }
            _ => Ok(()),
        }
    }

    fn apply_start(&self, payload: TutorialStartedPayload) -> Result<()> {
        let mut tracker = self.tracker();
        let already_running = tracker.session.as_ref().is_some_and(|s| {
            s.is_active
                && s.title == payload.lesson_title
                && s.participant_label == payload.student_name
        });
        if already_running {
            return Err(Error::DuplicateMessage(
                Path::TutorialStarted.as_str().to_string(),
            ));
        }

        tracing::info!(
            "Session '{}' started for {}",
            payload.lesson_title,
            payload.student_name
        );
        tracker.session = Some(SyncSession {
            title: payload.lesson_title,
            participant_label: payload.student_name,
            total_steps: payload.total_letters.unwrap_or(0),
            is_active: true,
            is_complete: false,
            started_at: Utc::now(),
        });
        tracker.step = None;
        self.publish(&tracker);
        Ok(())
    }

    fn apply_step(&self, fields: LetterDataPayload) -> Result<()> {
        let now = Instant::now();
        let mut tracker = self.tracker();

        let duplicate = tracker.step.as_ref().is_some_and(|step| {
            step.fields == fields
                && now.saturating_duration_since(step.observed_at) < self.inner.config.dedup_window
        });
        if duplicate {
            return Err(Error::DuplicateMessage(
                Path::LetterData.as_str().to_string(),
            ));
        }

        tracing::debug!(
            "Step {}/{}: '{}'",
            fields.current_index + 1,
            fields.total_letters,
            fields.letter
        );
        if let Some(session) = tracker.session.as_mut() {
            session.total_steps = fields.total_letters;
        }
        tracker.step = Some(StepData {
            step_index: fields.current_index,
            fields,
            observed_at: now,
        });
        self.publish(&tracker);
        Ok(())
    }

    fn apply_complete(&self) {
        let mut tracker = self.tracker();
        let Some(session) = tracker.session.as_mut() else {
            tracing::debug!("Completion with no session running");
            return;
        };
        session.is_complete = true;
        tracing::info!("Session '{}' complete", session.title);
        self.publish(&tracker);
    }

    fn apply_clear(&self, path: Path) {
        let mut tracker = self.tracker();
        tracing::info!("Session cleared by {}", path);
        *tracker = Tracker::default();
        self.publish(&tracker);
    }

    /// Publish while the tracker lock is held so slots see updates in order.
    fn publish(&self, tracker: &Tracker) {
        self.inner.session.set(tracker.session.clone());
        self.inner.step.set(tracker.step.clone());
    }

    fn emit(&self, signal: ControlSignal) -> Result<()> {
        tracing::debug!("Control signal: {:?}", signal);
        let _ = self.inner.signals.send(signal);
        Ok(())
    }

    async fn send_to_peer(&self, path: Path, payload: &[u8]) -> Result<()> {
        let Some(node) = self.inner.paired_node.peek() else {
            tracing::warn!("Not sending {}: no paired peer", path);
            return Err(Error::NotPaired);
        };

        self.inner
            .channel
            .send(&node, path.as_str(), payload)
            .await
            .inspect_err(|e| tracing::warn!("Sending {} to {} failed: {}", path, node, e))
    }

    /// Ask the peer to repeat the current letter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPaired`] with no paired peer, or the transport error.
    pub async fn send_retry(&self) -> Result<()> {
        self.send_to_peer(Path::Retry, &[]).await
    }

    /// Ask the peer to move past the current letter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPaired`] with no paired peer, or the transport error.
    pub async fn send_skip(&self) -> Result<()> {
        self.send_to_peer(Path::Skip, &[]).await
    }

    /// Tell the peer the feedback overlay was closed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPaired`] with no paired peer, or the transport error.
    pub async fn send_feedback_dismissed(&self) -> Result<()> {
        self.send_to_peer(Path::FeedbackDismissed, &[]).await
    }

    /// Report a gesture verdict.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPaired`] with no paired peer, or the transport error.
    pub async fn send_gesture_result(&self, is_correct: bool, predicted_letter: &str) -> Result<()> {
        let payload = protocol::encode_payload(&GestureResultPayload {
            is_correct,
            predicted_letter: predicted_letter.to_string(),
        })?;
        self.send_to_peer(Path::GestureResult, &payload).await
    }

    /// Classify a motion window against the current step and report the
    /// verdict to the peer.
    ///
    /// The verdict is returned even if reporting it fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveStep`] if no step is on screen.
    pub async fn submit_gesture(
        &self,
        classifier: &dyn GestureClassifier,
        window: &[MotionSample],
    ) -> Result<GestureOutcome> {
        let expected = self
            .tracker()
            .step
            .as_ref()
            .map(|step| step.fields.letter.clone())
            .ok_or(Error::NoActiveStep)?;

        let outcome = GestureOutcome::judge(&expected, classifier.classify(window));
        tracing::debug!(
            "Gesture for '{}' read as '{}' ({:.2})",
            expected,
            outcome.classification.label,
            outcome.classification.confidence
        );

        // failures are already logged by send_to_peer
        let _ = self
            .send_gesture_result(outcome.is_correct, &outcome.classification.label)
            .await;
        Ok(outcome)
    }

    /// Start a lesson on the peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPaired`] with no paired peer, or the transport error.
    pub async fn start_session(
        &self,
        participant_label: &str,
        title: &str,
        total_steps: Option<u32>,
    ) -> Result<()> {
        let payload = protocol::encode_payload(&TutorialStartedPayload {
            student_name: participant_label.to_string(),
            lesson_title: title.to_string(),
            total_letters: total_steps,
        })?;
        self.send_to_peer(Path::TutorialStarted, &payload).await
    }

    /// Send the step now on screen.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPaired`] with no paired peer, or the transport error.
    pub async fn send_step(&self, step: &LetterDataPayload) -> Result<()> {
        let payload = protocol::encode_payload(step)?;
        self.send_to_peer(Path::LetterData, &payload).await
    }

    /// Tell the peer the last step is done.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPaired`] with no paired peer, or the transport error.
    pub async fn complete_session(&self) -> Result<()> {
        self.send_to_peer(Path::SessionComplete, &[]).await
    }

    /// End the lesson on the peer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPaired`] with no paired peer, or the transport error.
    pub async fn end_session(&self) -> Result<()> {
        self.send_to_peer(Path::TutorialEnded, &[]).await
    }

    /// Reset the peer's session view.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotPaired`] with no paired peer, or the transport error.
    pub async fn reset_session(&self) -> Result<()> {
        self.send_to_peer(Path::SessionReset, &[]).await
    }
}
