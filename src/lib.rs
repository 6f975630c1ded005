//! `remedy`: a deterministic, seeded simulation of a closed incident-response loop.
//!
//! The loop mirrors how an automated SRE would run a small microservice fleet
//! (`api` fronting `db` and `cache`):
//!
//! 1. **Observe**: the [`Environment`] generates per-service telemetry (p95
//!    latency, error rate, CPU, memory, request rate) around seasonal workload
//!    curves, with zero or one injected [`Fault`] per episode.
//! 2. **Detect**: an [`AnomalyDetector`] fits one robust scorer per service on a
//!    warm-up window assumed healthy, then flags steps whose metrics drift.
//! 3. **Diagnose**: a [`Diagnoser`] ranks suspect services by blending anomaly
//!    scores with correlation against the user-facing API symptoms.
//! 4. **Act**: a [`Policy`] picks one mitigation from a fixed playbook menu
//!    (restart / scale / clear cache / limit traffic / noop) via a UCB bandit
//!    keyed by [`IncidentSignature`], subject to [`SafetyState`] guardrails.
//! 5. **Learn**: the reward produced by the following step updates the bandit
//!    arm, so repeated incidents sharpen action selection across episodes.
//!
//! [`Agent`] wires the five stages into a strictly sequential state machine and
//! produces an [`EpisodeSummary`] (first violation, recovery, MTTR proxy, total
//! reward, action counts) per episode.
//!
//! **Goals:**
//! - **Deterministic by default**: same seed + same bandit state → the same
//!   trajectory, decision for decision. Keyed collections are `BTreeMap`; float
//!   tie-breaks share one epsilon; RNG streams derive from the master seed via
//!   [`stable_hash64`].
//! - **Explainable decisions**: every selection returns an [`ActionDecision`]
//!   envelope with per-arm scores and typed notes, not just the chosen action.
//! - **Safe by construction**: illegal actions (restart during cooldown, scale
//!   at the replica ceiling) are filtered before selection, with `noop` as the
//!   never-empty fallback.
//!
//! **Non-goals:** not a real telemetry pipeline, not a causal-inference engine,
//! and not a general RL framework — learning is one bandit layer over a small
//! discrete menu.
//!
//! # Example
//!
//! ```
//! use remedy::{Agent, AgentConfig};
//!
//! let mut agent = Agent::new(AgentConfig::default())?;
//! agent.begin_episode(7);
//! while !agent.finished() {
//!     agent.step()?;
//! }
//! let summary = agent.summary()?;
//! assert_eq!(summary.steps, 240);
//! # Ok::<(), remedy::Error>(())
//! ```

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error as ThisError;

/// Epsilon used for floating-point tie-breaking in ranking and selection.
///
/// This avoids exact equality comparisons on f64 scores and provides a stable
/// threshold across all ranking paths (diagnoser blend, UCB selection).
pub(crate) const TIEBREAK_EPS: f64 = 1e-12;

mod stable_hash;
pub use stable_hash::stable_hash64;

mod fault;
pub use fault::{sample_fault, Fault, FaultEffect, FaultKind};

mod env;
pub use env::{EnvConfig, Environment, RewardConfig, SloConfig, SloStatus, StepOutcome};

mod detector;
pub use detector::{AnomalyDetector, AnomalyScore, DetectorConfig};

mod diagnoser;
pub use diagnoser::{Diagnoser, DiagnoserConfig, Diagnosis};

mod guardrail;
pub use guardrail::{filter_legal_actions, LegalityDecision, SafetyConfig, SafetyState};

mod decision;
pub use decision::{ActionDecision, ArmDebug, DecisionNote};

mod policy;
pub use policy::{Action, ArmStats, BanditTable, IncidentSignature, Policy, PolicyConfig};

mod agent;
pub use agent::{Agent, AgentConfig, EpisodeSummary, LoopState, StepRecord};

pub const REMEDY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors surfaced by configuration validation and loop control.
///
/// Insufficient-data conditions (untrained detector, short diagnosis history)
/// are *not* errors: those degrade to defined neutral outputs instead.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A configuration field failed validation at construction time.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// `step` was called after the episode hit its step budget.
    #[error("episode already terminated")]
    EpisodeFinished,
    /// `summary` was called before the episode hit its step budget.
    #[error("episode still in progress")]
    EpisodeUnfinished,
    /// `step` or `summary` was called before `begin_episode`.
    #[error("no episode started")]
    NoEpisode,
}

/// The closed set of simulated services.
///
/// `api` is the user-facing service and depends on `db` and `cache`; SLO
/// predicates and diagnosis symptoms are evaluated against `api`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum ServiceId {
    Api,
    Db,
    Cache,
}

impl ServiceId {
    /// All services in their stable tie-break order.
    pub const ALL: [ServiceId; 3] = [ServiceId::Api, ServiceId::Db, ServiceId::Cache];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceId::Api => "api",
            ServiceId::Db => "db",
            ServiceId::Cache => "cache",
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One service's observable metrics for one step.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Metrics {
    /// p95 latency in milliseconds.
    pub latency_ms: f64,
    /// Error rate in `[0, 1]`.
    pub error_rate: f64,
    /// CPU utilization in `[0, 1]`.
    pub cpu: f64,
    /// Memory utilization in `[0, 1]`.
    pub mem: f64,
    /// Request rate (shared workload, after traffic limiting).
    pub rps: f64,
}

/// Per-service metric vectors for one step.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricSnapshot {
    /// Step index this snapshot was observed at (0 = initial observation).
    pub step: u64,
    pub services: BTreeMap<ServiceId, Metrics>,
}

impl MetricSnapshot {
    #[must_use]
    pub fn get(&self, id: ServiceId) -> Option<&Metrics> {
        self.services.get(&id)
    }

    /// Metrics for a service, zeroed if absent (snapshots built by the
    /// environment always carry all services).
    #[must_use]
    pub fn metrics(&self, id: ServiceId) -> Metrics {
        self.services.get(&id).copied().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_order_is_stable() {
        assert_eq!(
            ServiceId::ALL,
            [ServiceId::Api, ServiceId::Db, ServiceId::Cache]
        );
        assert!(ServiceId::Api < ServiceId::Db);
        assert!(ServiceId::Db < ServiceId::Cache);
    }

    #[test]
    fn service_display_names() {
        let names: Vec<&str> = ServiceId::ALL.iter().map(|s| s.as_str()).collect();
        assert_eq!(names, vec!["api", "db", "cache"]);
        assert_eq!(ServiceId::Db.to_string(), "db");
    }

    #[test]
    fn snapshot_metrics_defaults_when_absent() {
        let snap = MetricSnapshot {
            step: 0,
            services: BTreeMap::new(),
        };
        assert!(snap.get(ServiceId::Api).is_none());
        assert_eq!(snap.metrics(ServiceId::Api).latency_ms, 0.0);
    }

    #[test]
    fn config_errors_name_the_field() {
        let e = Error::InvalidConfig("steps must be positive".to_string());
        assert!(e.to_string().contains("steps"));
    }
}
