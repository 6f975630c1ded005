//! Per-service anomaly scoring over a sliding window of metric vectors.
//!
//! The detector buffers `[latency, error, cpu, mem]` vectors per service and,
//! once every buffer holds a full warmup window, freezes a robust baseline
//! (median center, MAD spread) from that window. After training each
//! observation is scored by mean absolute z-distance from its service
//! baseline, squashed into `[0, 1]`. Before training every score is neutral;
//! the loop stays in warmup and takes no action on the detector's word alone.

use std::collections::{BTreeMap, VecDeque};

use crate::{Error, Metrics, MetricSnapshot, ServiceId};

const FEATURES: usize = 4;
/// Scales a median absolute deviation to a Gaussian-comparable sigma.
const MAD_TO_SIGMA: f64 = 1.4826;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectorConfig {
    /// Samples per service required before the baseline freezes.
    pub warmup_steps: usize,
    /// A single service score above this trips the detector.
    pub service_threshold: f64,
    /// A fleet-mean score above this trips the detector.
    pub global_threshold: f64,
    /// Mean |z| below this scores zero; absorbs baseline jitter.
    pub z_slack: f64,
    /// Squash scale for mean |z| above the slack.
    pub z_scale: f64,
    /// Floor for the per-feature spread so constant features stay finite.
    pub min_sigma: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            warmup_steps: 60,
            service_threshold: 0.15,
            global_threshold: 0.12,
            z_slack: 1.25,
            z_scale: 1.5,
            min_sigma: 1e-3,
        }
    }
}

impl DetectorConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.warmup_steps < 4 {
            return Err(Error::InvalidConfig(
                "detector.warmup_steps must be at least 4".to_string(),
            ));
        }
        for (name, v) in [
            ("detector.service_threshold", self.service_threshold),
            ("detector.global_threshold", self.global_threshold),
        ] {
            if !(v.is_finite() && v > 0.0 && v < 1.0) {
                return Err(Error::InvalidConfig(format!("{name} must be in (0, 1)")));
            }
        }
        if !(self.z_slack.is_finite() && self.z_slack >= 0.0) {
            return Err(Error::InvalidConfig(
                "detector.z_slack must be finite and non-negative".to_string(),
            ));
        }
        if !(self.z_scale.is_finite() && self.z_scale > 0.0) {
            return Err(Error::InvalidConfig(
                "detector.z_scale must be finite and positive".to_string(),
            ));
        }
        if !(self.min_sigma.is_finite() && self.min_sigma > 0.0) {
            return Err(Error::InvalidConfig(
                "detector.min_sigma must be finite and positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn features(m: Metrics) -> [f64; FEATURES] {
    [m.latency_ms, m.error_rate, m.cpu, m.mem]
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Frozen per-service baseline.
#[derive(Debug, Clone, Copy)]
struct RobustScorer {
    center: [f64; FEATURES],
    scale: [f64; FEATURES],
}

impl RobustScorer {
    fn fit(window: &[[f64; FEATURES]], min_sigma: f64) -> Self {
        let mut center = [0.0; FEATURES];
        let mut scale = [min_sigma; FEATURES];
        for f in 0..FEATURES {
            let mut col: Vec<f64> = window.iter().map(|row| row[f]).collect();
            col.sort_by(|a, b| a.total_cmp(b));
            let mid = median(&col);
            let mut dev: Vec<f64> = col.iter().map(|v| (v - mid).abs()).collect();
            dev.sort_by(|a, b| a.total_cmp(b));
            center[f] = mid;
            scale[f] = (median(&dev) * MAD_TO_SIGMA).max(min_sigma);
        }
        Self { center, scale }
    }

    fn score(&self, row: [f64; FEATURES], cfg: &DetectorConfig) -> f64 {
        let mut acc = 0.0;
        for f in 0..FEATURES {
            acc += ((row[f] - self.center[f]) / self.scale[f]).abs();
        }
        let mean_z = acc / FEATURES as f64;
        1.0 - (-(mean_z - cfg.z_slack).max(0.0) / cfg.z_scale).exp()
    }
}

/// One step's anomaly verdict.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AnomalyScore {
    /// Score in `[0, 1]` per service; empty until the detector is trained.
    pub per_service: BTreeMap<ServiceId, f64>,
    /// Mean of the per-service scores.
    pub global: f64,
    pub triggered: bool,
}

#[derive(Debug, Clone)]
pub struct AnomalyDetector {
    cfg: DetectorConfig,
    buffers: BTreeMap<ServiceId, VecDeque<[f64; FEATURES]>>,
    scorers: BTreeMap<ServiceId, RobustScorer>,
    trained: bool,
}

impl AnomalyDetector {
    pub fn new(cfg: DetectorConfig) -> Result<Self, Error> {
        cfg.validate()?;
        let buffers = ServiceId::ALL
            .iter()
            .map(|&s| (s, VecDeque::new()))
            .collect();
        Ok(Self {
            cfg,
            buffers,
            scorers: BTreeMap::new(),
            trained: false,
        })
    }

    /// Ingest one snapshot and score it.
    ///
    /// Training happens at most once, on the first full warmup window, so the
    /// baseline reflects pre-incident behavior rather than drifting with it.
    pub fn observe(&mut self, snapshot: &MetricSnapshot) -> AnomalyScore {
        for id in ServiceId::ALL {
            let row = features(snapshot.metrics(id));
            let buf = self.buffers.entry(id).or_default();
            buf.push_back(row);
            while buf.len() > self.cfg.warmup_steps * 2 {
                buf.pop_front();
            }
        }

        if !self.trained
            && self
                .buffers
                .values()
                .all(|b| b.len() >= self.cfg.warmup_steps)
        {
            for (&id, buf) in &self.buffers {
                let window: Vec<[f64; FEATURES]> =
                    buf.iter().take(self.cfg.warmup_steps).copied().collect();
                self.scorers.insert(id, RobustScorer::fit(&window, self.cfg.min_sigma));
            }
            self.trained = true;
        }

        if !self.trained {
            return AnomalyScore::default();
        }

        let mut per_service = BTreeMap::new();
        for id in ServiceId::ALL {
            if let Some(scorer) = self.scorers.get(&id) {
                let s = scorer.score(features(snapshot.metrics(id)), &self.cfg);
                per_service.insert(id, s);
            }
        }
        let global = if per_service.is_empty() {
            0.0
        } else {
            per_service.values().sum::<f64>() / per_service.len() as f64
        };
        let triggered = per_service
            .values()
            .any(|&s| s > self.cfg.service_threshold)
            || global > self.cfg.global_threshold;

        AnomalyScore {
            per_service,
            global,
            triggered,
        }
    }

    #[must_use]
    pub fn trained(&self) -> bool {
        self.trained
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.cfg
    }

    /// Drop buffers and the frozen baseline for a fresh episode.
    pub fn reset(&mut self) {
        for buf in self.buffers.values_mut() {
            buf.clear();
        }
        self.scorers.clear();
        self.trained = false;
    }
}
