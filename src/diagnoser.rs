//! Root-cause ranking from anomaly scores and metric correlation.
//!
//! Two signals blend into one suspect per consultation: the per-service
//! anomaly score, and how strongly each backend's latency/error series tracks
//! the `api` series over a trailing window. The `api` service gets no
//! correlation credit (it would correlate with itself through the dependency
//! edge), so a backend that explains the api symptoms outranks the api even
//! when the api's own anomaly score runs higher.
//!
//! Stateless output: confidence derives from the margin between the top two
//! blended scores plus the winner's correlation mass, capped below 1.

use std::collections::{BTreeMap, VecDeque};

use crate::{Error, MetricSnapshot, ServiceId, TIEBREAK_EPS};

/// Confidence when no scores exist yet.
const FALLBACK_CONF: f64 = 0.1;
/// Base and cap for the anomaly-only path (too little history to correlate).
const REDUCED_CONF_BASE: f64 = 0.15;
const REDUCED_CONF_CAP: f64 = 0.6;
/// Blended-path confidence shape.
const CONF_BASE: f64 = 0.2;
const CONF_MARGIN_WEIGHT: f64 = 0.9;
/// Series with spread below this correlate to nothing.
const MIN_STD: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiagnoserConfig {
    /// Trailing snapshots entering the correlation.
    pub corr_window: usize,
    /// Below this many points, fall back to anomaly rank alone.
    pub min_corr_points: usize,
    /// History retention.
    pub history_cap: usize,
    /// Weight of correlation mass against raw anomaly score.
    pub corr_weight: f64,
    /// Hard ceiling on reported confidence.
    pub max_confidence: f64,
}

impl Default for DiagnoserConfig {
    fn default() -> Self {
        Self {
            corr_window: 40,
            min_corr_points: 8,
            history_cap: 200,
            corr_weight: 0.35,
            max_confidence: 0.95,
        }
    }
}

impl DiagnoserConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.min_corr_points < 2 {
            return Err(Error::InvalidConfig(
                "diagnoser.min_corr_points must be at least 2".to_string(),
            ));
        }
        if self.corr_window < self.min_corr_points {
            return Err(Error::InvalidConfig(
                "diagnoser.corr_window must cover min_corr_points".to_string(),
            ));
        }
        if self.history_cap < self.corr_window {
            return Err(Error::InvalidConfig(
                "diagnoser.history_cap must cover corr_window".to_string(),
            ));
        }
        if !(self.corr_weight.is_finite() && self.corr_weight >= 0.0) {
            return Err(Error::InvalidConfig(
                "diagnoser.corr_weight must be finite and non-negative".to_string(),
            ));
        }
        if !(self.max_confidence > 0.0 && self.max_confidence <= 1.0) {
            return Err(Error::InvalidConfig(
                "diagnoser.max_confidence must be in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// One ranked root-cause hypothesis.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Diagnosis {
    pub suspect: ServiceId,
    /// In `[0, 1]`, capped at `max_confidence`.
    pub confidence: f64,
    pub rationale: String,
}

#[derive(Debug, Clone)]
pub struct Diagnoser {
    cfg: DiagnoserConfig,
    history: VecDeque<MetricSnapshot>,
}

impl Diagnoser {
    pub fn new(cfg: DiagnoserConfig) -> Result<Self, Error> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            history: VecDeque::new(),
        })
    }

    pub fn observe(&mut self, snapshot: &MetricSnapshot) {
        self.history.push_back(snapshot.clone());
        while self.history.len() > self.cfg.history_cap {
            self.history.pop_front();
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    #[must_use]
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Rank a suspect from the current anomaly scores.
    ///
    /// Never fails: with no scores it defaults to `api` at low confidence,
    /// and with too little history it ranks on anomaly scores alone.
    pub fn diagnose(&self, scores: &BTreeMap<ServiceId, f64>) -> Diagnosis {
        if scores.is_empty() {
            return Diagnosis {
                suspect: ServiceId::Api,
                confidence: FALLBACK_CONF,
                rationale: "no anomaly scores yet; defaulting to api".to_string(),
            };
        }

        let raw = |id: ServiceId| scores.get(&id).copied().unwrap_or(0.0);
        let mut top_raw = ServiceId::ALL[0];
        for id in ServiceId::ALL {
            if raw(id) > raw(top_raw) + TIEBREAK_EPS {
                top_raw = id;
            }
        }

        let take = self.cfg.corr_window.min(self.history.len());
        let window: Vec<&MetricSnapshot> = self
            .history
            .iter()
            .skip(self.history.len() - take)
            .collect();
        if window.len() < self.cfg.min_corr_points {
            let score = raw(top_raw);
            return Diagnosis {
                suspect: top_raw,
                confidence: (REDUCED_CONF_BASE + score).min(REDUCED_CONF_CAP),
                rationale: format!("most anomalous service: {top_raw} (score={score:.2})"),
            };
        }

        let api_lat = series(&window, ServiceId::Api, |m| m.0);
        let api_err = series(&window, ServiceId::Api, |m| m.1);

        let mut blended: BTreeMap<ServiceId, (f64, f64, f64)> = BTreeMap::new();
        for id in ServiceId::ALL {
            let (corr_lat, corr_err) = if id == ServiceId::Api {
                (0.0, 0.0)
            } else {
                let lat = series(&window, id, |m| m.0);
                let err = series(&window, id, |m| m.1);
                (
                    pearson(&lat, &api_lat).abs(),
                    pearson(&err, &api_err).abs(),
                )
            };
            let score = raw(id) + self.cfg.corr_weight * (corr_lat + corr_err);
            blended.insert(id, (score, corr_lat, corr_err));
        }

        let mut suspect = ServiceId::ALL[0];
        let mut best = blended[&suspect].0;
        for id in ServiceId::ALL {
            let s = blended[&id].0;
            // Within epsilon, anomaly evidence outranks correlation evidence.
            if s > best + TIEBREAK_EPS
                || ((s - best).abs() <= TIEBREAK_EPS && raw(id) > raw(suspect))
            {
                suspect = id;
                best = s;
            }
        }

        let second = ServiceId::ALL
            .iter()
            .filter(|&&id| id != suspect)
            .map(|id| blended[id].0)
            .fold(f64::NEG_INFINITY, f64::max);
        let margin = (best - second).max(0.0);
        let (_, corr_lat, corr_err) = blended[&suspect];
        let corr_mass = corr_lat + corr_err;
        let confidence = (CONF_BASE + CONF_MARGIN_WEIGHT * margin
            + self.cfg.corr_weight * corr_mass)
            .min(self.cfg.max_confidence);

        let led = if raw(suspect) >= self.cfg.corr_weight * corr_mass {
            "anomaly"
        } else {
            "correlation"
        };
        Diagnosis {
            suspect,
            confidence,
            rationale: format!(
                "{led}-led suspect {suspect}: anomaly {:.2}, corr lat {corr_lat:.2} err {corr_err:.2}, margin {margin:.2}",
                raw(suspect)
            ),
        }
    }
}

fn series(window: &[&MetricSnapshot], id: ServiceId, pick: fn((f64, f64)) -> f64) -> Vec<f64> {
    window
        .iter()
        .map(|s| {
            let m = s.metrics(id);
            pick((m.latency_ms, m.error_rate))
        })
        .collect()
}

/// Pearson correlation with a degenerate-spread guard.
fn pearson(xs: &[f64], ys: &[f64]) -> f64 {
    let n = xs.len().min(ys.len());
    if n < 2 {
        return 0.0;
    }
    let nf = n as f64;
    let mx = xs[..n].iter().sum::<f64>() / nf;
    let my = ys[..n].iter().sum::<f64>() / nf;
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for i in 0..n {
        let dx = xs[i] - mx;
        let dy = ys[i] - my;
        cov += dx * dy;
        vx += dx * dx;
        vy += dy * dy;
    }
    let sx = (vx / nf).sqrt();
    let sy = (vy / nf).sqrt();
    if sx < MIN_STD || sy < MIN_STD {
        return 0.0;
    }
    ((cov / nf) / (sx * sy)).clamp(-1.0, 1.0)
}
