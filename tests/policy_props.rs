use proptest::prelude::*;
use remedy::{
    filter_legal_actions, Action, ArmStats, BanditTable, IncidentSignature, Policy, PolicyConfig,
    SafetyConfig, SafetyState, ServiceId,
};

fn service_strategy() -> impl Strategy<Value = ServiceId> {
    prop_oneof![
        Just(ServiceId::Api),
        Just(ServiceId::Db),
        Just(ServiceId::Cache),
    ]
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        Just(Action::Noop),
        service_strategy().prop_map(Action::Restart),
        service_strategy().prop_map(Action::Scale),
        Just(Action::ClearCache),
        Just(Action::LimitTraffic),
    ]
}

#[derive(Debug, Clone, Copy)]
enum SafetyOp {
    Note(Action),
    Tick,
    Observe(ServiceId, u32),
}

fn op_strategy() -> impl Strategy<Value = SafetyOp> {
    prop_oneof![
        action_strategy().prop_map(SafetyOp::Note),
        Just(SafetyOp::Tick),
        (service_strategy(), 0u32..20).prop_map(|(s, n)| SafetyOp::Observe(s, n)),
    ]
}

proptest! {
    #[test]
    fn safety_state_invariants_hold(
        ops in prop::collection::vec(op_strategy(), 0..200),
    ) {
        let cfg = SafetyConfig::default();
        let mut state = SafetyState::new(cfg).unwrap();
        for op in ops {
            match op {
                SafetyOp::Note(a) => state.note_action(a),
                SafetyOp::Tick => state.tick(),
                SafetyOp::Observe(s, n) => state.set_replicas(s, n),
            }
            for id in ServiceId::ALL {
                prop_assert!(state.cooldown(id) <= cfg.restart_cooldown_steps);
                prop_assert!((cfg.min_replicas..=cfg.max_replicas).contains(&state.replicas(id)));
                prop_assert_eq!(state.restart_legal(id), state.cooldown(id) == 0);
                prop_assert_eq!(state.scale_legal(id), state.replicas(id) < cfg.max_replicas);
            }
        }
    }

    #[test]
    fn cooldown_expires_after_exactly_the_configured_ticks(svc in service_strategy()) {
        let cfg = SafetyConfig::default();
        let mut state = SafetyState::new(cfg).unwrap();
        state.note_action(Action::Restart(svc));
        for _ in 0..cfg.restart_cooldown_steps {
            prop_assert!(!state.restart_legal(svc));
            state.tick();
        }
        prop_assert!(state.restart_legal(svc));
    }

    #[test]
    fn filtering_keeps_the_legal_subsequence(
        candidates in prop::collection::vec(action_strategy(), 0..10),
        restarting in prop::collection::vec(service_strategy(), 0..3),
        at_ceiling in prop::collection::vec(service_strategy(), 0..3),
    ) {
        let cfg = SafetyConfig::default();
        let mut safety = SafetyState::new(cfg).unwrap();
        for s in restarting {
            safety.note_action(Action::Restart(s));
        }
        for s in at_ceiling {
            safety.set_replicas(s, cfg.max_replicas);
        }

        let d = filter_legal_actions(&candidates, &safety);
        prop_assert!(!d.eligible.is_empty());
        if d.fallback_used {
            prop_assert_eq!(&d.eligible, &vec![Action::Noop]);
            prop_assert!(candidates.iter().all(|&a| !safety.legal(a)));
        } else {
            let expected: Vec<Action> = candidates
                .iter()
                .copied()
                .filter(|&a| safety.legal(a))
                .collect();
            prop_assert_eq!(&d.eligible, &expected);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

    #[test]
    fn selection_is_deterministic_and_legal(
        suspect in service_strategy(),
        latency_breached in any::<bool>(),
        error_breached in any::<bool>(),
        stats in prop::collection::vec((0u64..40, -1.02f64..1.0), 4),
        restart_blocked in any::<bool>(),
        scale_blocked in any::<bool>(),
    ) {
        let signature = IncidentSignature { suspect, latency_breached, error_breached };
        let menu = Policy::candidates(suspect);
        let mut table = BanditTable::new();
        for (action, &(pulls, mean_reward)) in menu.iter().zip(stats.iter()) {
            table.set(signature, *action, ArmStats { pulls, mean_reward });
        }

        let cfg = SafetyConfig::default();
        let mut safety = SafetyState::new(cfg).unwrap();
        if restart_blocked {
            safety.note_action(Action::Restart(suspect));
        }
        if scale_blocked {
            safety.set_replicas(suspect, cfg.max_replicas);
        }

        let policy = Policy::with_table(PolicyConfig::default(), table).unwrap();
        let d1 = policy.select(signature, &safety);
        let d2 = policy.select(signature, &safety);
        prop_assert_eq!(&d1, &d2);
        prop_assert_eq!(d1.signature, signature);
        prop_assert!(menu.contains(&d1.chosen));
        prop_assert!(safety.legal(d1.chosen));
        for arm in &d1.arms {
            prop_assert!(menu.contains(&arm.action));
            prop_assert!(safety.legal(arm.action));
        }
    }
}

/// With fixed rewards and a clear gap, UCB1 should lock onto the best arm:
/// suboptimal pulls grow logarithmically, so late windows are dominated by
/// the best arm and pull counts order accordingly.
#[test]
fn ucb_converges_on_the_best_arm() {
    let signature = IncidentSignature {
        suspect: ServiceId::Db,
        latency_breached: false,
        error_breached: true,
    };
    let best = Action::Scale(ServiceId::Db);
    let mut policy = Policy::new(PolicyConfig::default()).expect("config");
    let mut safety = SafetyState::new(SafetyConfig::default()).expect("config");

    const ROUNDS: usize = 2000;
    const WINDOW: usize = 500;
    let mut best_per_window = [0u32; ROUNDS / WINDOW];
    for i in 0..ROUNDS {
        let d = policy.select(signature, &safety);
        safety.note_action(d.chosen);
        safety.tick();
        let reward = if d.chosen == best { 0.9 } else { 0.4 };
        policy.update(signature, d.chosen, reward);
        if d.chosen == best {
            best_per_window[i / WINDOW] += 1;
        }
    }

    let freqs: Vec<f64> = best_per_window
        .iter()
        .map(|&n| f64::from(n) / WINDOW as f64)
        .collect();
    assert!(freqs[freqs.len() - 1] >= 0.9, "window frequencies {freqs:?}");
    for pair in freqs.windows(2) {
        assert!(pair[1] >= pair[0] - 0.02, "window frequencies {freqs:?}");
    }

    let best_pulls = policy
        .table()
        .stats(signature, best)
        .map(|s| s.pulls)
        .unwrap_or(0);
    for action in Policy::candidates(ServiceId::Db) {
        if action == best {
            continue;
        }
        let pulls = policy
            .table()
            .stats(signature, action)
            .map(|s| s.pulls)
            .unwrap_or(0);
        assert!(
            best_pulls > pulls,
            "{action} pulled {pulls}, best pulled {best_pulls}"
        );
    }
}
