//! Gesture classifier seam.
//!
//! The classifier itself is an external collaborator: a window of motion
//! samples goes in, a label and confidence come out. This module only defines
//! that contract and the verdict derived from it.

use serde::{Deserialize, Serialize};

/// One IMU reading.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MotionSample {
    /// Accelerometer x
    pub ax: f32,
    /// Accelerometer y
    pub ay: f32,
    /// Accelerometer z
    pub az: f32,
    /// Gyroscope x
    pub gx: f32,
    /// Gyroscope y
    pub gy: f32,
    /// Gyroscope z
    pub gz: f32,
}

/// Classifier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Predicted letter
    pub label: String,
    /// Confidence in `0.0..=1.0`
    pub confidence: f32,
}

/// Black-box gesture classifier.
pub trait GestureClassifier: Send + Sync {
    /// Classify one window of samples.
    fn classify(&self, window: &[MotionSample]) -> Classification;
}

/// Verdict for a traced letter.
#[derive(Debug, Clone, PartialEq)]
pub struct GestureOutcome {
    /// Letter that was expected
    pub expected: String,
    /// What the classifier returned
    pub classification: Classification,
    /// Whether they match
    pub is_correct: bool,
}

impl GestureOutcome {
    /// Compare a classification with the expected letter, ignoring case.
    #[must_use]
    pub fn judge(expected: &str, classification: Classification) -> Self {
        let is_correct = classification.label.trim().eq_ignore_ascii_case(expected.trim());
        Self {
            expected: expected.to_string(),
            classification,
            is_correct,
        }
    }
}
