//! Audit envelope for one policy consultation.
//!
//! Every consulted step yields a record that can be logged, rendered by the
//! episode binaries, or replayed offline without re-running selection: the
//! signature the bandit was keyed by, the chosen action, the scored arm
//! table, and typed notes explaining why this choice happened.

use crate::guardrail::LegalityDecision;
use crate::policy::{Action, IncidentSignature};

/// Typed notes attached to a decision.
///
/// Notes are small and stable. Prefer adding variants over changing
/// existing semantics.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecisionNote {
    /// An untried arm was taken in stable candidate order.
    ExploreFirst,

    /// Argmax over UCB scores with stable tie-breaks.
    DeterministicChoice,

    /// Legality filtering ran before selection.
    ///
    /// If it eliminated every candidate, `fallback_used` is true and
    /// `eligible` holds the substituted `noop`.
    Safety {
        eligible: Vec<Action>,
        fallback_used: bool,
    },

    /// Nothing from the playbook was legal; `noop` was chosen outright.
    NoLegalAction,
}

impl DecisionNote {
    pub(crate) fn from_legality(d: &LegalityDecision) -> Self {
        Self::Safety {
            eligible: d.eligible.clone(),
            fallback_used: d.fallback_used,
        }
    }
}

/// Per-arm scoring detail for one consultation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArmDebug {
    pub action: Action,
    pub pulls: u64,
    pub mean_reward: f64,
    /// Exploration bonus; zero when selection ended at explore-first.
    pub bonus: f64,
    pub score: f64,
}

/// One consultation's full output.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ActionDecision {
    pub signature: IncidentSignature,
    pub chosen: Action,
    /// Eligible arms in candidate order, as scored.
    pub arms: Vec<ArmDebug>,
    pub notes: Vec<DecisionNote>,
}

impl ActionDecision {
    #[must_use]
    pub fn fallback_used(&self) -> bool {
        self.notes.iter().any(|n| {
            matches!(
                n,
                DecisionNote::NoLegalAction
                    | DecisionNote::Safety {
                        fallback_used: true,
                        ..
                    }
            )
        })
    }

    #[must_use]
    pub fn explored(&self) -> bool {
        self.notes.contains(&DecisionNote::ExploreFirst)
    }
}
