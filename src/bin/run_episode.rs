//! Run a single seeded episode and print the incident story.

use std::env;
use std::process;

use remedy::{Agent, AgentConfig, EnvConfig, ServiceId};

struct Args {
    steps: u64,
    seed: u64,
    render: bool,
}

fn print_usage() {
    println!("usage: run_episode [--steps N] [--seed N] [--render]");
}

fn parse_value(flag: &str, value: Option<String>) -> Result<u64, String> {
    let v = value.ok_or_else(|| format!("{flag} needs a value"))?;
    v.parse()
        .map_err(|_| format!("{flag} needs an integer, got {v}"))
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        steps: 240,
        seed: 7,
        render: false,
    };
    let mut it = env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--steps" => args.steps = parse_value(&arg, it.next())?,
            "--seed" => args.seed = parse_value(&arg, it.next())?,
            "--render" => args.render = true,
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args()?;
    let cfg = AgentConfig {
        env: EnvConfig {
            steps: args.steps,
            ..EnvConfig::default()
        },
        ..AgentConfig::default()
    };
    let mut agent = Agent::new(cfg)?;
    agent.begin_episode(args.seed);

    match agent.fault() {
        Some(f) => println!("Injected fault: {f}"),
        None => println!("Injected fault: none"),
    }

    while !agent.finished() {
        let record = agent.step()?;
        if !args.render {
            continue;
        }
        let violated = record.outcome.slo.violated();
        if record.step % 5 != 0 && !violated && !record.detection.triggered {
            continue;
        }
        let api = record.outcome.snapshot.metrics(ServiceId::Api);
        let rca = match &record.diagnosis {
            Some(d) => format!("{}({:.2})", d.suspect, d.confidence),
            None => "-".to_string(),
        };
        println!(
            "t={:03} req={:6.1} api_lat={:7.1}ms api_err={:5.2}% slo={:<8} rca={rca} act={}",
            record.step,
            api.rps,
            api.latency_ms,
            api.error_rate * 100.0,
            if violated { "VIOLATED" } else { "ok" },
            record.action,
        );
    }

    let summary = agent.summary()?;
    println!();
    println!("Episode over ({} steps, seed {}).", summary.steps, summary.seed);
    match (summary.first_violation, summary.recovery) {
        (Some(first), Some(rec)) => println!(
            "Incident: first violation at t={first}, recovered at t={rec} (mttr {} steps).",
            rec - first
        ),
        (Some(first), None) => {
            println!("Incident: first violation at t={first}, never recovered.")
        }
        _ => println!("Incident: none."),
    }
    println!(
        "Anomaly steps: {}  slo-violating steps: {}  total reward: {:.2}",
        summary.anomaly_steps, summary.slo_steps, summary.total_reward
    );

    println!("Actions:");
    let mut counts: Vec<(&String, &u64)> = summary.action_counts.iter().collect();
    counts.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (name, count) in counts {
        println!("  {count:5}  {name}");
    }
    Ok(())
}
