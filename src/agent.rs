//! Loop orchestrator: observe, detect, diagnose, act, learn, once per step.
//!
//! [`Agent`] owns every stage and wires them in a fixed order. Each step it
//! feeds the previous observation to the detector and diagnoser, consults the
//! policy only when the detector trips or the SLO is already violated,
//! applies the chosen action to the environment, and folds the resulting
//! reward back into the pulled arm. Unconsulted steps apply `noop` and leave
//! the bandit untouched.
//!
//! The bandit table lives across episodes: `begin_episode` resets the
//! environment, detector, diagnoser, and safety state, but keeps learned arm
//! statistics so later episodes benefit from earlier incidents.

use std::collections::BTreeMap;

use crate::decision::ActionDecision;
use crate::detector::{AnomalyDetector, AnomalyScore, DetectorConfig};
use crate::diagnoser::{Diagnoser, DiagnoserConfig, Diagnosis};
use crate::env::{EnvConfig, Environment, StepOutcome};
use crate::fault::Fault;
use crate::guardrail::SafetyState;
use crate::policy::{Action, BanditTable, IncidentSignature, Policy, PolicyConfig};
use crate::{Error, ServiceId};

/// Configuration for every loop stage.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct AgentConfig {
    pub env: EnvConfig,
    pub detector: DetectorConfig,
    pub diagnoser: DiagnoserConfig,
    pub policy: PolicyConfig,
}

/// Where the loop stands between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum LoopState {
    /// No episode begun.
    Idle,
    /// Episode running, detector baseline not yet frozen.
    Warmup,
    /// Detector trained, last step required no consultation.
    Monitoring,
    /// Last step consulted the diagnoser and policy.
    Responding,
    /// Episode over; `step` refuses until the next `begin_episode`.
    Terminated,
}

/// Full record of one loop step.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StepRecord {
    pub step: u64,
    /// Detector verdict on the pre-step observation.
    pub detection: AnomalyScore,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub diagnosis: Option<Diagnosis>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub decision: Option<ActionDecision>,
    pub action: Action,
    pub outcome: StepOutcome,
    /// Loop state after the step.
    pub state: LoopState,
}

/// Episode-level accounting.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EpisodeSummary {
    pub seed: u64,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub fault: Option<Fault>,
    pub steps: u64,
    /// Steps where the detector tripped.
    pub anomaly_steps: u64,
    /// Steps observed in SLO violation.
    pub slo_steps: u64,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub first_violation: Option<u64>,
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub recovery: Option<u64>,
    /// `recovery - first_violation` when both latched.
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub mttr: Option<u64>,
    pub total_reward: f64,
    /// Applied action name to count, `noop` included.
    pub action_counts: BTreeMap<String, u64>,
}

/// The closed loop.
#[derive(Debug, Clone)]
pub struct Agent {
    env: Environment,
    detector: AnomalyDetector,
    diagnoser: Diagnoser,
    policy: Policy,
    safety: SafetyState,
    state: LoopState,
    seed: u64,
    last: Option<StepOutcome>,
    anomaly_steps: u64,
    slo_steps: u64,
    total_reward: f64,
    action_counts: BTreeMap<String, u64>,
    steps_taken: u64,
}

impl Agent {
    pub fn new(cfg: AgentConfig) -> Result<Self, Error> {
        Self::with_table(cfg, BanditTable::new())
    }

    /// Build an agent that resumes from an existing bandit table.
    pub fn with_table(cfg: AgentConfig, table: BanditTable) -> Result<Self, Error> {
        let safety = SafetyState::new(cfg.env.safety)?;
        Ok(Self {
            env: Environment::new(cfg.env)?,
            detector: AnomalyDetector::new(cfg.detector)?,
            diagnoser: Diagnoser::new(cfg.diagnoser)?,
            policy: Policy::with_table(cfg.policy, table)?,
            safety,
            state: LoopState::Idle,
            seed: 0,
            last: None,
            anomaly_steps: 0,
            slo_steps: 0,
            total_reward: 0.0,
            action_counts: BTreeMap::new(),
            steps_taken: 0,
        })
    }

    /// Start a fresh episode with a fault sampled from the seed.
    pub fn begin_episode(&mut self, seed: u64) {
        let initial = self.env.reset(seed);
        self.begin_common(seed, initial);
    }

    /// Start a fresh episode with a pinned fault (or a fault-free one).
    pub fn begin_episode_with(&mut self, seed: u64, fault: Option<Fault>) {
        let initial = self.env.reset_with(seed, fault);
        self.begin_common(seed, initial);
    }

    fn begin_common(&mut self, seed: u64, initial: StepOutcome) {
        self.detector.reset();
        self.diagnoser.reset();
        self.safety.reset();
        self.state = LoopState::Warmup;
        self.seed = seed;
        self.last = Some(initial);
        self.anomaly_steps = 0;
        self.slo_steps = 0;
        self.total_reward = 0.0;
        self.action_counts.clear();
        self.steps_taken = 0;
    }

    /// Run one loop iteration.
    ///
    /// The detector and diagnoser see the previous observation, the policy is
    /// consulted only on trigger or active violation, and the reward from the
    /// new observation updates exactly the arm that was pulled.
    pub fn step(&mut self) -> Result<StepRecord, Error> {
        match self.state {
            LoopState::Idle => return Err(Error::NoEpisode),
            LoopState::Terminated => return Err(Error::EpisodeFinished),
            _ => {}
        }
        let last = self.last.clone().ok_or(Error::NoEpisode)?;

        self.diagnoser.observe(&last.snapshot);
        let detection = self.detector.observe(&last.snapshot);
        if detection.triggered {
            self.anomaly_steps += 1;
        }

        let consulted = detection.triggered || last.slo.violated();
        let (diagnosis, decision, action) = if consulted {
            let diagnosis = self.diagnoser.diagnose(&detection.per_service);
            let signature = IncidentSignature::new(diagnosis.suspect, last.slo);
            let decision = self.policy.select(signature, &self.safety);
            let action = decision.chosen;
            (Some(diagnosis), Some(decision), action)
        } else {
            (None, None, Action::Noop)
        };

        let outcome = self.env.step(action)?;
        self.safety.note_action(action);
        for id in ServiceId::ALL {
            self.safety.set_replicas(id, self.env.replicas(id));
        }
        self.safety.tick();
        if let Some(dec) = &decision {
            self.policy.update(dec.signature, action, outcome.reward);
        }

        self.total_reward += outcome.reward;
        if outcome.slo.violated() {
            self.slo_steps += 1;
        }
        *self.action_counts.entry(action.name()).or_insert(0) += 1;
        self.steps_taken += 1;

        self.state = if outcome.done {
            LoopState::Terminated
        } else if consulted {
            LoopState::Responding
        } else if self.detector.trained() {
            LoopState::Monitoring
        } else {
            LoopState::Warmup
        };

        let record = StepRecord {
            step: outcome.snapshot.step,
            detection,
            diagnosis,
            decision,
            action,
            outcome: outcome.clone(),
            state: self.state,
        };
        self.last = Some(outcome);
        Ok(record)
    }

    /// Episode accounting; only available once the episode terminated.
    pub fn summary(&self) -> Result<EpisodeSummary, Error> {
        match self.state {
            LoopState::Idle => return Err(Error::NoEpisode),
            LoopState::Terminated => {}
            _ => return Err(Error::EpisodeUnfinished),
        }
        let first_violation = self.env.first_violation();
        let recovery = self.env.recovery();
        let mttr = match (first_violation, recovery) {
            (Some(f), Some(r)) => Some(r.saturating_sub(f)),
            _ => None,
        };
        Ok(EpisodeSummary {
            seed: self.seed,
            fault: self.env.fault().copied(),
            steps: self.steps_taken,
            anomaly_steps: self.anomaly_steps,
            slo_steps: self.slo_steps,
            first_violation,
            recovery,
            mttr,
            total_reward: self.total_reward,
            action_counts: self.action_counts.clone(),
        })
    }

    /// Begin, run to termination, and summarize one episode.
    pub fn run_episode(&mut self, seed: u64) -> Result<EpisodeSummary, Error> {
        self.begin_episode(seed);
        while !self.finished() {
            self.step()?;
        }
        self.summary()
    }

    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state
    }

    #[must_use]
    pub fn finished(&self) -> bool {
        self.state == LoopState::Terminated
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn fault(&self) -> Option<&Fault> {
        self.env.fault()
    }

    pub fn bandit(&self) -> &BanditTable {
        self.policy.table()
    }

    /// Extract the learned table, e.g. to seed a later agent.
    #[must_use]
    pub fn into_bandit(self) -> BanditTable {
        self.policy.into_table()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> Agent {
        Agent::new(AgentConfig::default()).expect("config")
    }

    #[test]
    fn step_and_summary_need_an_episode() {
        let mut a = agent();
        assert_eq!(a.state(), LoopState::Idle);
        assert!(matches!(a.step(), Err(Error::NoEpisode)));
        assert!(matches!(a.summary(), Err(Error::NoEpisode)));
    }

    #[test]
    fn summary_mid_episode_is_refused() {
        let mut a = agent();
        a.begin_episode(3);
        a.step().expect("step");
        assert!(matches!(a.summary(), Err(Error::EpisodeUnfinished)));
    }

    #[test]
    fn stepping_past_termination_is_refused() {
        let cfg = AgentConfig {
            env: EnvConfig {
                steps: 5,
                ..EnvConfig::default()
            },
            ..AgentConfig::default()
        };
        let mut a = Agent::new(cfg).expect("config");
        a.begin_episode_with(3, None);
        for _ in 0..5 {
            a.step().expect("step");
        }
        assert!(a.finished());
        assert!(matches!(a.step(), Err(Error::EpisodeFinished)));
        a.summary().expect("summary");
    }

    #[test]
    fn episode_accounting_adds_up() {
        let mut a = agent();
        let summary = a.run_episode(7).expect("episode");
        assert_eq!(summary.seed, 7);
        assert_eq!(summary.steps, 240);
        assert_eq!(summary.action_counts.values().sum::<u64>(), 240);
        assert_eq!(summary.fault.as_ref(), a.fault());
        assert!(summary.fault.is_some());
    }

    #[test]
    fn quiet_short_episode_never_consults() {
        // Shorter than the detector warmup and fault-free: nothing triggers,
        // nothing violates, so the policy is never consulted.
        let cfg = AgentConfig {
            env: EnvConfig {
                steps: 30,
                ..EnvConfig::default()
            },
            ..AgentConfig::default()
        };
        let mut a = Agent::new(cfg).expect("config");
        a.begin_episode_with(9, None);
        let mut records = Vec::new();
        while !a.finished() {
            records.push(a.step().expect("step"));
        }
        assert!(a.bandit().is_empty());
        assert!(records.iter().all(|r| r.action == Action::Noop));
        assert!(records.iter().all(|r| r.decision.is_none()));
        let (last, rest) = records.split_last().expect("records");
        assert!(rest.iter().all(|r| r.state == LoopState::Warmup));
        assert_eq!(last.state, LoopState::Terminated);
        let summary = a.summary().expect("summary");
        assert_eq!(summary.anomaly_steps, 0);
        assert_eq!(summary.slo_steps, 0);
        assert_eq!(summary.action_counts.get("noop"), Some(&30));
    }

    #[test]
    fn consulted_steps_update_the_bandit() {
        // A hair-trigger detector makes every post-warmup step a consultation,
        // so arms accumulate pulls even without any SLO violation.
        let cfg = AgentConfig {
            env: EnvConfig {
                steps: 40,
                ..EnvConfig::default()
            },
            detector: DetectorConfig {
                warmup_steps: 8,
                service_threshold: 1e-6,
                global_threshold: 1e-6,
                z_slack: 0.0,
                ..DetectorConfig::default()
            },
            ..AgentConfig::default()
        };
        let mut a = Agent::new(cfg).expect("config");
        a.begin_episode_with(9, None);
        let mut consulted = 0;
        while !a.finished() {
            let r = a.step().expect("step");
            if let Some(dec) = &r.decision {
                consulted += 1;
                assert_eq!(r.action, dec.chosen);
                if !r.outcome.done {
                    assert_eq!(r.state, LoopState::Responding);
                }
            }
        }
        assert!(consulted > 20, "consulted {consulted}");
        assert!(!a.bandit().is_empty());
        let pulls: u64 = a
            .bandit()
            .signatures()
            .map(|s| a.bandit().total_pulls(s))
            .sum();
        assert_eq!(pulls, consulted);
    }

    #[test]
    fn warmup_hands_over_to_monitoring() {
        let mut a = agent();
        a.begin_episode_with(11, None);
        let mut states = Vec::new();
        while !a.finished() {
            states.push(a.step().expect("step").state);
        }
        let warmup = DetectorConfig::default().warmup_steps;
        assert!(states[..warmup - 1]
            .iter()
            .all(|&s| s == LoopState::Warmup));
        assert_eq!(states[warmup - 1], LoopState::Monitoring);
    }
}
