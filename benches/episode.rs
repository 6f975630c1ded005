use criterion::{criterion_group, criterion_main, Criterion};
use remedy::{
    Agent, AgentConfig, ArmStats, BanditTable, IncidentSignature, Policy, PolicyConfig,
    SafetyConfig, SafetyState, ServiceId,
};
use std::hint::black_box;

fn bench_episode(c: &mut Criterion) {
    let mut group = c.benchmark_group("episode");

    // Full closed loop at the default horizon, fault sampling included.
    group.bench_function("run/240_steps", |b| {
        let base = Agent::new(AgentConfig::default()).expect("config");
        b.iter(|| {
            let mut agent = base.clone();
            let summary = agent.run_episode(black_box(7)).expect("episode");
            black_box(summary.total_reward);
        })
    });

    // Selection alone against a warm table (the per-consultation hot path).
    group.bench_function("select/warm_table", |b| {
        let signature = IncidentSignature {
            suspect: ServiceId::Db,
            latency_breached: false,
            error_breached: true,
        };
        let mut table = BanditTable::new();
        for (i, action) in Policy::candidates(ServiceId::Db).into_iter().enumerate() {
            table.set(
                signature,
                action,
                ArmStats {
                    pulls: 10 + i as u64,
                    mean_reward: 0.1 * i as f64,
                },
            );
        }
        let policy = Policy::with_table(PolicyConfig::default(), table).expect("config");
        let safety = SafetyState::new(SafetyConfig::default()).expect("config");
        b.iter(|| black_box(policy.select(black_box(signature), &safety)))
    });

    group.finish();
}

criterion_group!(benches, bench_episode);
criterion_main!(benches);
