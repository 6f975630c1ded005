//! Batch evaluation: many seeded episodes sharing one bandit table, with a
//! per-episode CSV for offline analysis.
//!
//! The shared table is the point: later episodes reuse what earlier
//! incidents taught the policy, so recovery metrics improve over the batch.

use std::env;
use std::fmt::Write as _;
use std::fs;
use std::process;

use remedy::{Agent, AgentConfig, EnvConfig};

const CSV_HEADER: &str = "seed,fault_kind,fault_service,fault_start,fault_duration,\
fault_severity,anomaly_steps,slo_steps,first_violation,recovery,mttr,total_reward";

struct Args {
    episodes: u64,
    steps: u64,
    seed0: u64,
    out: String,
}

fn print_usage() {
    println!("usage: eval [--episodes N] [--steps N] [--seed0 N] [--out FILE]");
}

fn parse_value(flag: &str, value: Option<String>) -> Result<u64, String> {
    let v = value.ok_or_else(|| format!("{flag} needs a value"))?;
    v.parse()
        .map_err(|_| format!("{flag} needs an integer, got {v}"))
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        episodes: 50,
        steps: 240,
        seed0: 1,
        out: "results.csv".to_string(),
    };
    let mut it = env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--episodes" => args.episodes = parse_value(&arg, it.next())?,
            "--steps" => args.steps = parse_value(&arg, it.next())?,
            "--seed0" => args.seed0 = parse_value(&arg, it.next())?,
            "--out" => args.out = it.next().ok_or("--out needs a file name")?,
            "--help" | "-h" => {
                print_usage();
                process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    if args.episodes == 0 {
        return Err("--episodes must be positive".to_string());
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

    let opt = |v: Option<u64>| v.map(|x| x.to_string()).unwrap_or_default();
    let mut csv = String::from(CSV_HEADER);
    csv.push('\n');
    let mut recovered = 0u64;
    let mut mttr_sum = 0u64;

    for i in 0..args.episodes {
        let seed = args.seed0 + i;
        let summary = agent.run_episode(seed)?;
        let (kind, service, start, duration, severity) = match &summary.fault {
            Some(f) => (
                f.kind.to_string(),
                f.target.to_string(),
                f.start.to_string(),
                f.duration.to_string(),
                format!("{:.3}", f.severity),
            ),
            None => Default::default(),
        };
        writeln!(
            csv,
            "{seed},{kind},{service},{start},{duration},{severity},{},{},{},{},{},{:.4}",
            summary.anomaly_steps,
            summary.slo_steps,
            opt(summary.first_violation),
            opt(summary.recovery),
            opt(summary.mttr),
            summary.total_reward,
        )?;
        if let Some(m) = summary.mttr {
            recovered += 1;
            mttr_sum += m;
        }
        let done = i + 1;
        if done % 5 == 0 || done == args.episodes {
            println!("finished {done}/{} episodes", args.episodes);
        }
    }

    fs::write(&args.out, csv)?;
    println!();
    println!("episodes: {}", args.episodes);
    println!("recovered: {recovered}");
    if recovered > 0 {
        println!("mean mttr: {:.1} steps", mttr_sum as f64 / recovered as f64);
    }
    println!("saved: {}", args.out);
    Ok(())
}
