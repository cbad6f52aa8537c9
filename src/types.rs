use serde::{Deserialize, Serialize};

// Canonical shared state types consumed by the UI layer and the CLI.

/// Current known credit state. Counts are unsigned by construction; the
/// monitor discards any observed value that does not parse as a
/// non-negative integer.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreditBalance {
    pub trial_remaining: u64,
    pub real_remaining: u64,
    /// Derived: `trial_remaining > 0`.
    pub is_free_trial: bool,
}

impl CreditBalance {
    pub fn new(trial_remaining: u64, real_remaining: u64) -> Self {
        Self {
            trial_remaining,
            real_remaining,
            is_free_trial: trial_remaining > 0,
        }
    }
}

/// Whether a blocking "upgrade required" prompt is active, and what it says.
/// The monitor only publishes this state; presentation belongs to callers.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct GateState {
    pub visible: bool,
    pub title: String,
    pub message: String,
}
