//! Fault taxonomy and the per-episode fault injector.
//!
//! At most one fault exists per episode. A fault is a multiplicative
//! perturbation of one service's metrics over a half-open step window
//! `[start, start + duration)`; mitigation actions may shrink or cap that
//! window but never extend it.

use std::fmt;

use rand::Rng;

use crate::ServiceId;

/// Duration floor a restart can shrink a fault down to.
pub(crate) const MIN_DURATION_AFTER_RESTART: u64 = 5;

/// The five injectable fault kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum FaultKind {
    LatencySpike,
    ErrorBurst,
    CpuSaturation,
    MemoryLeak,
    CachePoison,
}

impl FaultKind {
    pub const ALL: [FaultKind; 5] = [
        FaultKind::LatencySpike,
        FaultKind::ErrorBurst,
        FaultKind::CpuSaturation,
        FaultKind::MemoryLeak,
        FaultKind::CachePoison,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::LatencySpike => "latency_spike",
            FaultKind::ErrorBurst => "error_burst",
            FaultKind::CpuSaturation => "cpu_saturation",
            FaultKind::MemoryLeak => "memory_leak",
            FaultKind::CachePoison => "cache_poison",
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Multipliers applied to the target service's metrics while the fault is on.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FaultEffect {
    pub latency: f64,
    pub error: f64,
    pub cpu: f64,
    pub mem: f64,
}

impl FaultEffect {
    pub const NEUTRAL: FaultEffect = FaultEffect {
        latency: 1.0,
        error: 1.0,
        cpu: 1.0,
        mem: 1.0,
    };
}

/// One injected fault.
///
/// Immutable after sampling except through the mitigation hooks the
/// environment calls (`shrink_remaining`, `cap_duration`).
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Fault {
    pub kind: FaultKind,
    pub target: ServiceId,
    /// Strength in `[0, 1]`; zero renders the fault inert.
    pub severity: f64,
    /// First step the fault is active.
    pub start: u64,
    /// Active-window length in steps.
    pub duration: u64,
}

impl Fault {
    /// Exclusive end step of the active window.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.duration)
    }

    #[must_use]
    pub fn active_at(&self, step: u64) -> bool {
        step >= self.start && step < self.end()
    }

    /// Directional multiplier profile at this fault's severity.
    #[must_use]
    pub fn effect(&self) -> FaultEffect {
        let s = self.severity;
        match self.kind {
            FaultKind::LatencySpike => FaultEffect {
                latency: 1.0 + 3.5 * s,
                error: 1.0 + 0.2 * s,
                cpu: 1.0 + 0.1 * s,
                mem: 1.0,
            },
            FaultKind::ErrorBurst => FaultEffect {
                latency: 1.0 + 0.6 * s,
                error: 1.0 + 6.0 * s,
                cpu: 1.0 + 0.2 * s,
                mem: 1.0,
            },
            FaultKind::CpuSaturation => FaultEffect {
                latency: 1.0 + 1.8 * s,
                error: 1.0 + 1.0 * s,
                cpu: 1.0 + 2.5 * s,
                mem: 1.0,
            },
            FaultKind::MemoryLeak => FaultEffect {
                latency: 1.0 + 1.0 * s,
                error: 1.0 + 0.7 * s,
                cpu: 1.0 + 0.3 * s,
                mem: 1.0 + 2.5 * s,
            },
            FaultKind::CachePoison => FaultEffect {
                latency: 1.0 + 2.0 * s,
                error: 1.0 + 1.5 * s,
                cpu: 1.0 + 0.2 * s,
                mem: 1.0,
            },
        }
    }

    /// Shrink the window left after `now` by `frac`, flooring the total
    /// duration at [`MIN_DURATION_AFTER_RESTART`]. Restart semantics: a
    /// process bounce clears part of the bad in-memory state.
    pub(crate) fn shrink_remaining(&mut self, now: u64, frac: f64) {
        let remaining = self.end().saturating_sub(now);
        let cut = (remaining as f64 * frac).trunc() as u64;
        self.duration = self
            .duration
            .saturating_sub(cut)
            .max(MIN_DURATION_AFTER_RESTART);
    }

    /// Cap total duration (cache-flush semantics). Never extends the window.
    pub(crate) fn cap_duration(&mut self, max: u64) {
        self.duration = self.duration.min(max);
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} at t={} for {} steps (sev={:.2})",
            self.kind, self.target, self.start, self.duration, self.severity
        )
    }
}

/// Sample the episode's single fault.
///
/// Onset lands after the warm-up-friendly first chunk of the episode
/// (`[max(10, T/6), max(20, T/2)]`), duration in `[T/12, T/4]`, severity
/// uniform in `[0.4, 1.0)`.
pub fn sample_fault<R: Rng>(rng: &mut R, horizon: u64) -> Fault {
    let target = ServiceId::ALL[rng.gen_range(0..ServiceId::ALL.len())];
    let kind = FaultKind::ALL[rng.gen_range(0..FaultKind::ALL.len())];
    let start = rng.gen_range((horizon / 6).max(10)..=(horizon / 2).max(20));
    let duration = rng.gen_range(horizon / 12..=horizon / 4);
    let severity = rng.gen_range(0.4..1.0);
    Fault {
        kind,
        target,
        severity,
        start,
        duration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn fault(kind: FaultKind, start: u64, duration: u64, severity: f64) -> Fault {
        Fault {
            kind,
            target: ServiceId::Db,
            severity,
            start,
            duration,
        }
    }

    #[test]
    fn active_window_is_half_open() {
        let f = fault(FaultKind::LatencySpike, 20, 30, 1.0);
        assert!(!f.active_at(19));
        assert!(f.active_at(20));
        assert!(f.active_at(49));
        assert!(!f.active_at(50));
    }

    #[test]
    fn zero_severity_is_neutral() {
        for kind in FaultKind::ALL {
            let f = fault(kind, 0, 10, 0.0);
            assert_eq!(f.effect(), FaultEffect::NEUTRAL, "{kind}");
        }
    }

    #[test]
    fn effect_scales_with_severity() {
        let f = fault(FaultKind::ErrorBurst, 0, 10, 1.0);
        let e = f.effect();
        assert!((e.error - 7.0).abs() < 1e-12);
        assert!((e.latency - 1.6).abs() < 1e-12);
        assert_eq!(e.mem, 1.0);

        let weak = fault(FaultKind::ErrorBurst, 0, 10, 0.5).effect();
        assert!(weak.error < e.error);
    }

    #[test]
    fn memory_leak_is_the_only_mem_mover() {
        for kind in FaultKind::ALL {
            let e = fault(kind, 0, 10, 1.0).effect();
            if kind == FaultKind::MemoryLeak {
                assert!(e.mem > 1.0);
            } else {
                assert_eq!(e.mem, 1.0, "{kind}");
            }
        }
    }

    #[test]
    fn shrink_remaining_cuts_and_floors() {
        let mut f = fault(FaultKind::ErrorBurst, 20, 30, 1.0);
        // At t=20 the full 30 steps remain: cut 60% (18), keep 12.
        f.shrink_remaining(20, 0.6);
        assert_eq!(f.duration, 12);
        assert_eq!(f.end(), 32);

        // A second shrink close to the end hits the floor.
        let mut g = fault(FaultKind::ErrorBurst, 20, 30, 1.0);
        g.shrink_remaining(0, 0.9); // remaining=50, cut=45
        assert_eq!(g.duration, MIN_DURATION_AFTER_RESTART);
    }

    #[test]
    fn cap_duration_never_extends() {
        let mut f = fault(FaultKind::CachePoison, 20, 30, 1.0);
        f.cap_duration(8);
        assert_eq!(f.duration, 8);
        f.cap_duration(100);
        assert_eq!(f.duration, 8);
    }

    #[test]
    fn sampled_faults_stay_in_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let f = sample_fault(&mut rng, 240);
            assert!(f.start >= 40 && f.start <= 120, "start={}", f.start);
            assert!(f.duration >= 20 && f.duration <= 60, "dur={}", f.duration);
            assert!(f.severity >= 0.4 && f.severity < 1.0);
        }
    }

    #[test]
    fn sampling_is_seed_deterministic() {
        let mut a = StdRng::seed_from_u64(9);
        let mut b = StdRng::seed_from_u64(9);
        assert_eq!(sample_fault(&mut a, 240), sample_fault(&mut b, 240));
    }

    #[test]
    fn tiny_horizons_still_sample() {
        let mut rng = StdRng::seed_from_u64(1);
        let f = sample_fault(&mut rng, 12);
        assert!(f.start >= 10 && f.start <= 20);
        assert!(f.duration <= 3);
    }
}
