#![cfg(feature = "serde")]

use remedy::{Agent, AgentConfig, DetectorConfig, EnvConfig, EpisodeSummary, StepRecord};

/// A hair-trigger detector so the records exercise the consulted path
/// (diagnosis, decision, arm tables) and not just quiet noops.
fn chatty_cfg() -> AgentConfig {
    AgentConfig {
        env: EnvConfig {
            steps: 30,
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
    }
}

#[test]
fn step_records_and_summary_round_trip_through_json() {
    let mut agent = Agent::new(chatty_cfg()).expect("config");
    agent.begin_episode(3);
    let mut seen_decision = false;
    while !agent.finished() {
        let record = agent.step().expect("step");
        seen_decision |= record.decision.is_some();
        let json = serde_json::to_string(&record).expect("serialize");
        let back: StepRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(record, back);
    }
    assert!(seen_decision, "expected at least one consulted record");

    let summary = agent.summary().expect("summary");
    let json = serde_json::to_string(&summary).expect("serialize");
    let back: EpisodeSummary = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(summary, back);
}

#[test]
fn configs_round_trip_through_json() {
    let cfg = AgentConfig::default();
    let json = serde_json::to_string(&cfg).expect("serialize");
    let back: AgentConfig = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(cfg, back);
}
