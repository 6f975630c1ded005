//! Safety guardrails: hard legality filtering applied before selection.
//!
//! The bandit never sees an illegal arm. Restarts carry a per-service
//! cooldown and scale-ups stop at the replica ceiling; everything else is
//! always legal. If filtering eliminates every candidate the filter falls
//! back to `noop` and says so, so the decision record shows the fallback
//! rather than hiding it.

use std::collections::BTreeMap;

use crate::policy::Action;
use crate::{Error, ServiceId};

/// Operational limits shared by the environment and the guardrail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SafetyConfig {
    /// Steps a service is restart-ineligible after a restart.
    pub restart_cooldown_steps: u32,
    /// Replica floor every service starts at.
    pub min_replicas: u32,
    /// Replica ceiling `scale` may not exceed.
    pub max_replicas: u32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            restart_cooldown_steps: 20,
            min_replicas: 1,
            max_replicas: 10,
        }
    }
}

impl SafetyConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.min_replicas == 0 {
            return Err(Error::InvalidConfig(
                "safety.min_replicas must be at least 1".to_string(),
            ));
        }
        if self.max_replicas < self.min_replicas {
            return Err(Error::InvalidConfig(
                "safety.max_replicas must be at least min_replicas".to_string(),
            ));
        }
        Ok(())
    }
}

/// Live safety state: restart cooldowns and known replica counts.
#[derive(Debug, Clone)]
pub struct SafetyState {
    cfg: SafetyConfig,
    cooldowns: BTreeMap<ServiceId, u32>,
    replicas: BTreeMap<ServiceId, u32>,
}

impl SafetyState {
    pub fn new(cfg: SafetyConfig) -> Result<Self, Error> {
        cfg.validate()?;
        let mut state = Self {
            cfg,
            cooldowns: BTreeMap::new(),
            replicas: BTreeMap::new(),
        };
        state.reset();
        Ok(state)
    }

    /// Clear cooldowns and set every service back to the replica floor.
    pub fn reset(&mut self) {
        self.cooldowns = ServiceId::ALL.iter().map(|&s| (s, 0)).collect();
        self.replicas = ServiceId::ALL
            .iter()
            .map(|&s| (s, self.cfg.min_replicas))
            .collect();
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.cfg
    }

    #[must_use]
    pub fn cooldown(&self, id: ServiceId) -> u32 {
        self.cooldowns.get(&id).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn replicas(&self, id: ServiceId) -> u32 {
        self.replicas.get(&id).copied().unwrap_or(self.cfg.min_replicas)
    }

    /// Record the observed replica count, clamped to the configured bounds.
    pub fn set_replicas(&mut self, id: ServiceId, n: u32) {
        let clamped = n.clamp(self.cfg.min_replicas, self.cfg.max_replicas);
        self.replicas.insert(id, clamped);
    }

    /// Record an applied action's safety consequences.
    pub fn note_action(&mut self, action: Action) {
        if let Action::Restart(svc) = action {
            self.cooldowns.insert(svc, self.cfg.restart_cooldown_steps);
        }
    }

    /// Advance one step: cooldowns count down toward zero.
    pub fn tick(&mut self) {
        for c in self.cooldowns.values_mut() {
            *c = c.saturating_sub(1);
        }
    }

    #[must_use]
    pub fn restart_legal(&self, id: ServiceId) -> bool {
        self.cooldown(id) == 0
    }

    #[must_use]
    pub fn scale_legal(&self, id: ServiceId) -> bool {
        self.replicas(id) < self.cfg.max_replicas
    }

    #[must_use]
    pub fn legal(&self, action: Action) -> bool {
        match action {
            Action::Restart(svc) => self.restart_legal(svc),
            Action::Scale(svc) => self.scale_legal(svc),
            Action::Noop | Action::ClearCache | Action::LimitTraffic => true,
        }
    }
}

/// Output of legality filtering over a candidate list.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LegalityDecision {
    /// Legal candidates in their original order.
    pub eligible: Vec<Action>,
    /// True when every candidate was illegal and `noop` was substituted.
    pub fallback_used: bool,
}

/// Keep the legal candidates in order; an empty result becomes `[noop]`.
#[must_use]
pub fn filter_legal_actions(candidates: &[Action], safety: &SafetyState) -> LegalityDecision {
    let eligible: Vec<Action> = candidates
        .iter()
        .copied()
        .filter(|&a| safety.legal(a))
        .collect();
    if eligible.is_empty() {
        LegalityDecision {
            eligible: vec![Action::Noop],
            fallback_used: true,
        }
    } else {
        LegalityDecision {
            eligible,
            fallback_used: false,
        }
    }
}
