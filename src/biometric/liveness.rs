//! Liveness gate and the final verdict for a verification attempt.
//!
//! The liveness flag and score come from the capture pipeline and are
//! trusted as supplied. This module only gates on them.

use super::{matcher::MatchConfig, models::FailureReason};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LivenessSignal {
    pub detected: bool,
    pub score: f64,
}

impl LivenessSignal {
    #[must_use]
    pub fn passes(&self, threshold: f64) -> bool {
        self.detected && self.score >= threshold
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Failure(FailureReason),
}

impl Verdict {
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    #[must_use]
    pub fn failure_reason(self) -> Option<FailureReason> {
        match self {
            Self::Success => None,
            Self::Failure(reason) => Some(reason),
        }
    }
}

/// Combine match confidence, liveness and device state into a verdict.
///
/// A blocked device always fails. Liveness is checked before the face
/// match so a photo of the registered user reports `liveness_failed`.
#[must_use]
pub fn evaluate(
    confidence: f64,
    liveness: LivenessSignal,
    config: &MatchConfig,
    device_blocked: bool,
) -> Verdict {
    if device_blocked {
        return Verdict::Failure(FailureReason::DeviceBlocked);
    }
    if !liveness.passes(config.liveness_threshold()) {
        return Verdict::Failure(FailureReason::LivenessFailed);
    }
    if confidence < config.match_threshold() {
        return Verdict::Failure(FailureReason::FaceMismatch);
    }
    Verdict::Success
}
