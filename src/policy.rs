//! Remediation policy: playbook menus, a contextual UCB bandit, and the
//! glue between them.
//!
//! The playbook maps a suspected service to a fixed candidate menu. Within a
//! menu, selection is UCB1 keyed by [`IncidentSignature`]: every signature
//! owns its own arm statistics, so "db is the suspect and errors are
//! breaching" learns separately from "db is the suspect and latency is
//! breaching". Selection is fully deterministic: untried arms go first in
//! candidate order, then argmax over mean-plus-bonus with ties broken by
//! lowest pull count and finally candidate order.

use std::collections::BTreeMap;
use std::fmt;

use crate::decision::{ActionDecision, ArmDebug, DecisionNote};
use crate::env::SloStatus;
use crate::guardrail::{filter_legal_actions, SafetyState};
use crate::{Error, ServiceId, TIEBREAK_EPS};

/// One remedial action from the fixed menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Action {
    Noop,
    Restart(ServiceId),
    Scale(ServiceId),
    ClearCache,
    LimitTraffic,
}

impl Action {
    /// Stable wire name, also used as the arm label in reports.
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            Self::Noop => "noop".to_string(),
            Self::Restart(svc) => format!("restart:{svc}"),
            Self::Scale(svc) => format!("scale:{svc}"),
            Self::ClearCache => "clear_cache".to_string(),
            Self::LimitTraffic => "limit_traffic".to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Bandit context key: who is suspected, and which SLO edge is breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IncidentSignature {
    pub suspect: ServiceId,
    pub latency_breached: bool,
    pub error_breached: bool,
}

impl IncidentSignature {
    #[must_use]
    pub fn new(suspect: ServiceId, slo: SloStatus) -> Self {
        Self {
            suspect,
            latency_breached: slo.latency_breached,
            error_breached: slo.error_breached,
        }
    }
}

impl fmt::Display for IncidentSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|lat>{}|err>{}",
            self.suspect,
            u8::from(self.latency_breached),
            u8::from(self.error_breached)
        )
    }
}

/// Online statistics for one (signature, action) arm.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ArmStats {
    pub pulls: u64,
    pub mean_reward: f64,
}

/// Arm statistics per signature. Shared across episodes when the caller
/// keeps the same table alive; that is how learning accumulates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BanditTable {
    arms: BTreeMap<IncidentSignature, BTreeMap<Action, ArmStats>>,
}

impl BanditTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arms.is_empty()
    }

    pub fn stats(&self, signature: IncidentSignature, action: Action) -> Option<ArmStats> {
        self.arms.get(&signature)?.get(&action).copied()
    }

    /// Total pulls across every arm of one signature.
    #[must_use]
    pub fn total_pulls(&self, signature: IncidentSignature) -> u64 {
        self.arms
            .get(&signature)
            .map(|arms| arms.values().map(|s| s.pulls).sum())
            .unwrap_or(0)
    }

    /// Overwrite one arm's statistics (seeding, tests, replay).
    pub fn set(&mut self, signature: IncidentSignature, action: Action, stats: ArmStats) {
        self.arms.entry(signature).or_default().insert(action, stats);
    }

    /// Fold one reward into an arm's online mean.
    pub fn record(&mut self, signature: IncidentSignature, action: Action, reward: f64) {
        let stats = self
            .arms
            .entry(signature)
            .or_default()
            .entry(action)
            .or_default();
        stats.pulls = stats.pulls.saturating_add(1);
        stats.mean_reward += (reward - stats.mean_reward) / stats.pulls as f64;
    }

    pub fn signatures(&self) -> impl Iterator<Item = IncidentSignature> + '_ {
        self.arms.keys().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PolicyConfig {
    /// UCB exploration coefficient. `sqrt(2)` is the classic UCB1 value.
    pub exploration_c: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            exploration_c: std::f64::consts::SQRT_2,
        }
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.exploration_c.is_finite() && self.exploration_c >= 0.0) {
            return Err(Error::InvalidConfig(
                "policy.exploration_c must be finite and non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Playbook plus bandit. Selection never mutates; rewards land via
/// [`Policy::update`] after the environment has spoken.
#[derive(Debug, Clone)]
pub struct Policy {
    cfg: PolicyConfig,
    table: BanditTable,
}

impl Policy {
    pub fn new(cfg: PolicyConfig) -> Result<Self, Error> {
        Self::with_table(cfg, BanditTable::new())
    }

    /// Resume with a pre-populated table (cross-episode learning).
    pub fn with_table(cfg: PolicyConfig, table: BanditTable) -> Result<Self, Error> {
        cfg.validate()?;
        Ok(Self { cfg, table })
    }

    pub fn table(&self) -> &BanditTable {
        &self.table
    }

    #[must_use]
    pub fn into_table(self) -> BanditTable {
        self.table
    }

    /// Fixed candidate menu for a suspect, in priority order.
    ///
    /// `noop` always leads and `limit_traffic` always closes, so every menu
    /// keeps a do-nothing arm and a load-shedding arm regardless of suspect.
    #[must_use]
    pub fn candidates(suspect: ServiceId) -> Vec<Action> {
        let mut menu = vec![Action::Noop];
        match suspect {
            ServiceId::Api | ServiceId::Db => {
                menu.push(Action::Restart(suspect));
                menu.push(Action::Scale(suspect));
            }
            ServiceId::Cache => {
                menu.push(Action::ClearCache);
                menu.push(Action::Restart(ServiceId::Cache));
            }
        }
        menu.push(Action::LimitTraffic);
        menu
    }

    /// Pick one action for this signature under the current safety state.
    pub fn select(&self, signature: IncidentSignature, safety: &SafetyState) -> ActionDecision {
        let candidates = Self::candidates(signature.suspect);
        let legality = filter_legal_actions(&candidates, safety);
        let mut notes = vec![DecisionNote::from_legality(&legality)];
        if legality.fallback_used {
            notes.push(DecisionNote::NoLegalAction);
        }

        // Untried arms go first, in candidate order.
        let untried = legality
            .eligible
            .iter()
            .copied()
            .find(|&a| self.stats_for(signature, a).pulls == 0);
        if let Some(chosen) = untried {
            notes.push(DecisionNote::ExploreFirst);
            let arms = legality
                .eligible
                .iter()
                .map(|&a| {
                    let s = self.stats_for(signature, a);
                    ArmDebug {
                        action: a,
                        pulls: s.pulls,
                        mean_reward: s.mean_reward,
                        bonus: 0.0,
                        score: s.mean_reward,
                    }
                })
                .collect();
            return ActionDecision {
                signature,
                chosen,
                arms,
                notes,
            };
        }

        let total = (self.table.total_pulls(signature) + 1) as f64;
        let log_total = total.ln();
        let mut arms = Vec::with_capacity(legality.eligible.len());
        let mut chosen = legality.eligible[0];
        let mut best_score = f64::NEG_INFINITY;
        let mut best_pulls = u64::MAX;
        for &a in &legality.eligible {
            let s = self.stats_for(signature, a);
            let n = (s.pulls as f64).max(1.0);
            let bonus = self.cfg.exploration_c * (log_total / n).sqrt();
            let score = s.mean_reward + bonus;
            if score > best_score
                || ((score - best_score).abs() <= TIEBREAK_EPS && s.pulls < best_pulls)
            {
                chosen = a;
                best_score = score;
                best_pulls = s.pulls;
            }
            arms.push(ArmDebug {
                action: a,
                pulls: s.pulls,
                mean_reward: s.mean_reward,
                bonus,
                score,
            });
        }
        notes.push(DecisionNote::DeterministicChoice);
        ActionDecision {
            signature,
            chosen,
            arms,
            notes,
        }
    }

    /// Fold the observed reward into the pulled arm.
    pub fn update(&mut self, signature: IncidentSignature, action: Action, reward: f64) {
        self.table.record(signature, action, reward);
    }

    fn stats_for(&self, signature: IncidentSignature, action: Action) -> ArmStats {
        self.table.stats(signature, action).unwrap_or_default()
    }
}
