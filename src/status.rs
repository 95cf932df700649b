//! External phase-status vocabulary.
//!
//! The phase-status oracle reports free-form strings. They are mapped once,
//! here, onto a closed enum; the runner never compares raw status text.

use std::fmt;

/// Outcome class of a reported phase status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Terminal, the phase finished successfully.
    Succeeded,
    /// Terminal, the phase will not finish successfully.
    Failed,
    /// Anything else: keep polling.
    InFlight,
}

/// A phase status as reported by the oracle, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseStatus {
    raw: String,
    outcome: PhaseOutcome,
}

/// Every string that ends polling, keyed by its normalized form.
const TERMINAL_STATUSES: &[(&str, PhaseOutcome)] = &[
    ("completed", PhaseOutcome::Succeeded),
    ("complete", PhaseOutcome::Succeeded),
    ("done", PhaseOutcome::Succeeded),
    ("success", PhaseOutcome::Succeeded),
    ("succeeded", PhaseOutcome::Succeeded),
    ("failed", PhaseOutcome::Failed),
    ("error", PhaseOutcome::Failed),
    ("canceled", PhaseOutcome::Failed),
    ("cancelled", PhaseOutcome::Failed),
    ("blocked", PhaseOutcome::Failed),
];

/// Lowercase and drop everything but ASCII letters and digits, so
/// `" Completed."`, `"COMPLETED"` and `"completed"` all compare equal.
fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl PhaseStatus {
    pub fn parse(raw: &str) -> Self {
        let key = normalize(raw);
        let outcome = TERMINAL_STATUSES
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, outcome)| *outcome)
            .unwrap_or(PhaseOutcome::InFlight);
        Self {
            raw: raw.trim().to_string(),
            outcome,
        }
    }

    pub fn outcome(&self) -> PhaseOutcome {
        self.outcome
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome != PhaseOutcome::InFlight
    }

    pub fn is_success(&self) -> bool {
        self.outcome == PhaseOutcome::Succeeded
    }

    /// The trimmed status text as reported.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
