//! Stepped environment: service model, fault application, SLO and reward.
//!
//! The fleet is three services with a fixed dependency edge: `api` calls `db`
//! and `cache`, so backend symptoms surface at `api` through latency/error
//! penalty terms. Per step the environment applies the pending action's side
//! effects, advances time, regenerates every service's metrics around its
//! baseline curve (fault multipliers composing on top), evaluates the SLO
//! predicates against `api`, and shapes a scalar reward.
//!
//! All randomness comes from one `StdRng` noise stream derived from the
//! episode seed, independent of the fault-sampling stream: a pinned fault
//! reproduces the exact noise trajectory a sampled one would have seen.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::fault::{sample_fault, Fault, FaultEffect, FaultKind};
use crate::guardrail::SafetyConfig;
use crate::policy::Action;
use crate::stable_hash::stable_hash64;
use crate::{Error, Metrics, MetricSnapshot, ServiceId};

const WORKLOAD_NOISE_SIGMA: f64 = 8.0;
const WORKLOAD_FLOOR: f64 = 10.0;
const ERROR_NOISE_SIGMA: f64 = 0.002;
const CPU_MEM_NOISE: f64 = 0.05;
/// Backend latency above this leaks into `api` latency.
const DEP_LATENCY_KNEE_MS: f64 = 35.0;
const DEP_LATENCY_WEIGHT: f64 = 0.45;
const DEP_ERROR_WEIGHT: f64 = 0.6;
/// Fraction of the remaining fault window a restart clears (error-clearing kinds only).
const RESTART_FAULT_SHRINK: f64 = 0.6;
/// Total duration a cache flush caps a poison fault at.
const CACHE_FLUSH_DURATION_CAP: u64 = 8;

/// SLO predicates, evaluated against the `api` service every step.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SloConfig {
    /// Violation when `api` p95 latency exceeds this (ms).
    pub api_latency_ms: f64,
    /// Violation when `api` error rate exceeds this.
    pub api_error_rate: f64,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            api_latency_ms: 220.0,
            api_error_rate: 0.06,
        }
    }
}

/// Per-step reward shaping.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RewardConfig {
    /// Baseline reward for any step.
    pub healthy: f64,
    /// Subtracted while the SLO is violated.
    pub violation_penalty: f64,
    /// Subtracted while an incident is open (first violation seen, recovery not).
    pub open_incident_penalty: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            healthy: 1.0,
            violation_penalty: 2.0,
            open_incident_penalty: 0.02,
        }
    }
}

/// Which SLO predicates a snapshot breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SloStatus {
    pub latency_breached: bool,
    pub error_breached: bool,
}

impl SloStatus {
    #[must_use]
    pub fn violated(self) -> bool {
        self.latency_breached || self.error_breached
    }
}

/// Environment configuration.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EnvConfig {
    /// Episode length in steps.
    pub steps: u64,
    pub slo: SloConfig,
    pub reward: RewardConfig,
    /// Operational limits (cooldowns, replica bounds) shared with the guardrail.
    pub safety: SafetyConfig,
    /// Workload factor applied by `limit_traffic`.
    pub limit_traffic_factor: f64,
    /// Hard floor any traffic limiting clamps to.
    pub traffic_floor: f64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            steps: 240,
            slo: SloConfig::default(),
            reward: RewardConfig::default(),
            safety: SafetyConfig::default(),
            limit_traffic_factor: 0.7,
            traffic_floor: 0.4,
        }
    }
}

impl EnvConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.steps == 0 {
            return Err(Error::InvalidConfig("steps must be positive".to_string()));
        }
        if !(self.slo.api_latency_ms.is_finite() && self.slo.api_latency_ms > 0.0) {
            return Err(Error::InvalidConfig(
                "slo.api_latency_ms must be finite and positive".to_string(),
            ));
        }
        if !(self.slo.api_error_rate.is_finite() && self.slo.api_error_rate > 0.0) {
            return Err(Error::InvalidConfig(
                "slo.api_error_rate must be finite and positive".to_string(),
            ));
        }
        if !(self.traffic_floor > 0.0 && self.traffic_floor <= 1.0) {
            return Err(Error::InvalidConfig(
                "traffic_floor must be in (0, 1]".to_string(),
            ));
        }
        if !(self.limit_traffic_factor >= self.traffic_floor && self.limit_traffic_factor <= 1.0) {
            return Err(Error::InvalidConfig(
                "limit_traffic_factor must be in [traffic_floor, 1]".to_string(),
            ));
        }
        if !self.reward.healthy.is_finite() {
            return Err(Error::InvalidConfig(
                "reward.healthy must be finite".to_string(),
            ));
        }
        if !(self.reward.violation_penalty.is_finite() && self.reward.violation_penalty >= 0.0) {
            return Err(Error::InvalidConfig(
                "reward.violation_penalty must be finite and non-negative".to_string(),
            ));
        }
        if !(self.reward.open_incident_penalty.is_finite()
            && self.reward.open_incident_penalty >= 0.0)
        {
            return Err(Error::InvalidConfig(
                "reward.open_incident_penalty must be finite and non-negative".to_string(),
            ));
        }
        self.safety.validate()
    }
}

/// What one environment step produced.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StepOutcome {
    pub snapshot: MetricSnapshot,
    pub slo: SloStatus,
    /// Shaped reward for the step (0.0 on the reset observation).
    pub reward: f64,
    pub done: bool,
}

/// Baseline curve parameters for one service.
struct ServiceCurve {
    capacity_per_replica: f64,
    latency_base: f64,
    latency_slope: f64,
    latency_knee: f64,
    latency_floor: f64,
    latency_noise: f64,
    error_base: f64,
    error_slope: f64,
    error_knee: f64,
    error_cap: f64,
    cpu_base: f64,
    cpu_slope: f64,
    mem_base: f64,
    mem_slope: f64,
}

const BACKEND_CURVE: ServiceCurve = ServiceCurve {
    capacity_per_replica: 200.0,
    latency_base: 18.0,
    latency_slope: 55.0,
    latency_knee: 0.35,
    latency_floor: 5.0,
    latency_noise: 2.0,
    error_base: 0.004,
    error_slope: 0.03,
    error_knee: 0.55,
    error_cap: 0.8,
    cpu_base: 0.15,
    cpu_slope: 0.9,
    mem_base: 0.18,
    mem_slope: 0.6,
};

const API_CURVE: ServiceCurve = ServiceCurve {
    capacity_per_replica: 260.0,
    latency_base: 22.0,
    latency_slope: 80.0,
    latency_knee: 0.35,
    latency_floor: 8.0,
    latency_noise: 3.0,
    error_base: 0.003,
    error_slope: 0.025,
    error_knee: 0.6,
    error_cap: 0.9,
    cpu_base: 0.18,
    cpu_slope: 0.95,
    mem_base: 0.22,
    mem_slope: 0.55,
};

fn curve_for(id: ServiceId) -> &'static ServiceCurve {
    match id {
        ServiceId::Api => &API_CURVE,
        ServiceId::Db | ServiceId::Cache => &BACKEND_CURVE,
    }
}

fn gauss(rng: &mut StdRng, sigma: f64) -> f64 {
    match Normal::new(0.0, sigma) {
        Ok(d) => d.sample(rng),
        Err(_) => 0.0,
    }
}

/// Deterministic, seeded episode environment.
#[derive(Debug, Clone)]
pub struct Environment {
    cfg: EnvConfig,
    noise: StdRng,
    step: u64,
    replicas: BTreeMap<ServiceId, u32>,
    traffic_limit: f64,
    fault: Option<Fault>,
    first_violation: Option<u64>,
    recovery: Option<u64>,
    begun: bool,
    done: bool,
}

impl Environment {
    pub fn new(cfg: EnvConfig) -> Result<Self, Error> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            noise: StdRng::seed_from_u64(0),
            step: 0,
            replicas: BTreeMap::new(),
            traffic_limit: 1.0,
            fault: None,
            first_violation: None,
            recovery: None,
            begun: false,
            done: false,
        })
    }

    /// Start an episode: sample this episode's fault and return the initial
    /// observation at step 0.
    pub fn reset(&mut self, seed: u64) -> StepOutcome {
        let mut faults = StdRng::seed_from_u64(stable_hash64(seed, "fault.stream"));
        let fault = sample_fault(&mut faults, self.cfg.steps);
        self.reset_with(seed, Some(fault))
    }

    /// Start an episode with a pinned fault (or none), for scenario pinning.
    pub fn reset_with(&mut self, seed: u64, fault: Option<Fault>) -> StepOutcome {
        self.noise = StdRng::seed_from_u64(stable_hash64(seed, "env.noise"));
        self.step = 0;
        self.replicas = ServiceId::ALL
            .iter()
            .map(|&s| (s, self.cfg.safety.min_replicas))
            .collect();
        self.traffic_limit = 1.0;
        self.fault = fault;
        self.first_violation = None;
        self.recovery = None;
        self.begun = true;
        self.done = false;

        let snapshot = self.observe();
        let slo = self.evaluate_slo(&snapshot);
        StepOutcome {
            snapshot,
            slo,
            reward: 0.0,
            done: false,
        }
    }

    /// Apply an action, advance one step, and observe.
    ///
    /// Side effects land before the time advance, and the fault multiplier
    /// applies to the action-shaped baseline, so the composition order is
    /// fixed and a trajectory replays exactly from its seed.
    pub fn step(&mut self, action: Action) -> Result<StepOutcome, Error> {
        if !self.begun {
            return Err(Error::NoEpisode);
        }
        if self.done {
            return Err(Error::EpisodeFinished);
        }

        self.apply_action(action);
        self.step += 1;

        let snapshot = self.observe();
        let slo = self.evaluate_slo(&snapshot);
        let violating = slo.violated();

        if violating && self.first_violation.is_none() {
            self.first_violation = Some(self.step);
        }
        if !violating && self.first_violation.is_some() && self.recovery.is_none() {
            self.recovery = Some(self.step);
        }

        let mut reward = self.cfg.reward.healthy;
        if violating {
            reward -= self.cfg.reward.violation_penalty;
        }
        if self.first_violation.is_some() && self.recovery.is_none() {
            reward -= self.cfg.reward.open_incident_penalty;
        }

        self.done = self.step >= self.cfg.steps;
        Ok(StepOutcome {
            snapshot,
            slo,
            reward,
            done: self.done,
        })
    }

    fn apply_action(&mut self, action: Action) {
        match action {
            Action::Noop => {}
            Action::Restart(svc) => {
                let now = self.step;
                if let Some(f) = self.fault.as_mut() {
                    // A bounce only clears faults rooted in bad in-memory state.
                    if f.target == svc
                        && matches!(f.kind, FaultKind::ErrorBurst | FaultKind::CachePoison)
                    {
                        f.shrink_remaining(now, RESTART_FAULT_SHRINK);
                    }
                }
            }
            Action::Scale(svc) => {
                let max = self.cfg.safety.max_replicas;
                if let Some(r) = self.replicas.get_mut(&svc) {
                    *r = r.saturating_add(1).min(max);
                }
            }
            Action::ClearCache => {
                if let Some(f) = self.fault.as_mut() {
                    if f.kind == FaultKind::CachePoison {
                        f.cap_duration(CACHE_FLUSH_DURATION_CAP);
                    }
                }
            }
            Action::LimitTraffic => {
                self.traffic_limit = self
                    .cfg
                    .limit_traffic_factor
                    .clamp(self.cfg.traffic_floor, 1.0);
            }
        }
    }

    fn workload(&mut self) -> f64 {
        let base = 120.0 + 60.0 * (0.5 + 0.5 * (self.step as f64 / 24.0).sin());
        let noise = gauss(&mut self.noise, WORKLOAD_NOISE_SIGMA);
        ((base + noise) * self.traffic_limit).max(WORKLOAD_FLOOR)
    }

    /// Generate this step's snapshot. Backends first: their symptoms feed the
    /// `api` penalty terms.
    fn observe(&mut self) -> MetricSnapshot {
        let rate = self.workload();
        let mut services = BTreeMap::new();

        let mut dep_latency_penalty = 0.0;
        let mut dep_error_penalty = 0.0;
        for id in [ServiceId::Db, ServiceId::Cache] {
            let m = self.service_metrics(id, rate, 0.0, 0.0);
            dep_latency_penalty +=
                (m.latency_ms - DEP_LATENCY_KNEE_MS).max(0.0) * DEP_LATENCY_WEIGHT;
            dep_error_penalty += m.error_rate * DEP_ERROR_WEIGHT;
            services.insert(id, m);
        }

        let api =
            self.service_metrics(ServiceId::Api, rate, dep_latency_penalty, dep_error_penalty);
        services.insert(ServiceId::Api, api);

        MetricSnapshot {
            step: self.step,
            services,
        }
    }

    fn service_metrics(
        &mut self,
        id: ServiceId,
        rate: f64,
        dep_latency_penalty: f64,
        dep_error_penalty: f64,
    ) -> Metrics {
        let curve = curve_for(id);
        let replicas = f64::from(self.replicas.get(&id).copied().unwrap_or(1).max(1));
        let load = rate / (replicas * curve.capacity_per_replica);

        let latency_base = curve.latency_base
            + curve.latency_slope * (load - curve.latency_knee).max(0.0)
            + dep_latency_penalty;
        let error_base = curve.error_base
            + curve.error_slope * (load - curve.error_knee).max(0.0)
            + dep_error_penalty;

        let effect = self.active_effect(id);

        let cpu = (curve.cpu_base + curve.cpu_slope * load * effect.cpu
            + self.noise.gen::<f64>() * CPU_MEM_NOISE)
            .clamp(0.0, 1.0);
        let mem = (curve.mem_base + curve.mem_slope * load * effect.mem
            + self.noise.gen::<f64>() * CPU_MEM_NOISE)
            .clamp(0.0, 1.0);
        let latency_ms = (latency_base * effect.latency
            + gauss(&mut self.noise, curve.latency_noise))
        .max(curve.latency_floor);
        let error_rate = (error_base * effect.error
            + gauss(&mut self.noise, ERROR_NOISE_SIGMA).abs())
        .clamp(0.0, curve.error_cap);

        Metrics {
            latency_ms,
            error_rate,
            cpu,
            mem,
            rps: rate,
        }
    }

    fn active_effect(&self, id: ServiceId) -> FaultEffect {
        match &self.fault {
            Some(f) if f.target == id && f.active_at(self.step) => f.effect(),
            _ => FaultEffect::NEUTRAL,
        }
    }

    fn evaluate_slo(&self, snapshot: &MetricSnapshot) -> SloStatus {
        let api = snapshot.metrics(ServiceId::Api);
        SloStatus {
            latency_breached: api.latency_ms > self.cfg.slo.api_latency_ms,
            error_breached: api.error_rate > self.cfg.slo.api_error_rate,
        }
    }

    pub fn config(&self) -> &EnvConfig {
        &self.cfg
    }

    /// Step index of the last observation (0 right after reset).
    #[must_use]
    pub fn now(&self) -> u64 {
        self.step
    }

    pub fn fault(&self) -> Option<&Fault> {
        self.fault.as_ref()
    }

    #[must_use]
    pub fn replicas(&self, id: ServiceId) -> u32 {
        self.replicas.get(&id).copied().unwrap_or(1)
    }

    #[must_use]
    pub fn traffic_limit(&self) -> f64 {
        self.traffic_limit
    }

    /// Step of the first SLO violation, latched once per episode.
    pub fn first_violation(&self) -> Option<u64> {
        self.first_violation
    }

    /// First non-violating step after the first violation; never re-arms.
    pub fn recovery(&self) -> Option<u64> {
        self.recovery
    }
}
