//! Sensitivity detection over a window of derived records.
//!
//! A detector reads the deviations the engine marked usable (no carbs on
//! board), condenses them into one representative deviation, and converts
//! that into a ratio against the scheduled basal:
//!
//! ```text
//! basal_off = deviation * (60 / bucket_minutes) / isf
//! ratio     = 1 + basal_off / basal      (clamped to [autosens_min, autosens_max])
//! ```

use crate::config::{Config, DetectorKind};
use crate::table::SnapshotTable;
use crate::{AutosensRecord, SensitivityResult};
use chrono::{DateTime, Duration, Utc};

/// Pluggable sensitivity algorithm
///
/// Implementations must only read the table and must not assume it is
/// contiguous.
pub trait SensitivityDetector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether carb entries should use per-entry floor impacts while this
    /// detector is active
    fn min_carbs_absorption_dynamic(&self) -> bool;

    fn detect(
        &self,
        table: &SnapshotTable,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SensitivityResult;
}

/// Parameters shared by the detectors
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionParams {
    pub autosens_min: f64,
    pub autosens_max: f64,
    pub hours_for_detection: f64,
    pub bucket_minutes: i64,
}

impl DetectionParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            autosens_min: config.sensitivity.autosens_min,
            autosens_max: config.sensitivity.autosens_max,
            hours_for_detection: config.sensitivity.hours_for_detection,
            bucket_minutes: config.engine.bucket_minutes,
        }
    }

    fn window_start(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> DateTime<Utc> {
        let lookback = Duration::seconds((self.hours_for_detection * 3600.0) as i64);
        start.max(end - lookback)
    }
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Build the detector selected in the configuration
pub fn build_detector(config: &Config) -> Box<dyn SensitivityDetector> {
    let params = DetectionParams::from_config(config);
    match config.sensitivity.detector {
        DetectorKind::Fixed => Box::new(FixedRateDetector::new(params)),
        DetectorKind::Weighted => Box::new(WeightedAverageDetector::new(params)),
    }
}

/// Deviations usable for detection plus the newest record carrying a profile
struct Window<'a> {
    usable: Vec<&'a AutosensRecord>,
    reference: Option<&'a AutosensRecord>,
}

fn collect_window<'a>(
    table: &'a SnapshotTable,
    params: &DetectionParams,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Window<'a> {
    let from = params.window_start(start, end);
    let usable = table
        .range(from, end)
        .filter(|r| r.valid_deviation && r.deviation.is_finite())
        .collect();
    let reference = table
        .range(start, end)
        .filter(|r| r.sens > 0.0 && r.basal > 0.0)
        .last();
    Window { usable, reference }
}

/// Turn a representative deviation into a bounded ratio
fn ratio_from_deviation(
    deviation: f64,
    count: usize,
    reference: &AutosensRecord,
    params: &DetectionParams,
) -> SensitivityResult {
    let steps_per_hour = 60.0 / params.bucket_minutes as f64;
    let basal_off = deviation * steps_per_hour / reference.sens;

    let label = if deviation < 0.0 {
        "Excess insulin sensitivity detected"
    } else if deviation > 0.0 {
        "Excess insulin resistance detected"
    } else {
        "Sensitivity normal"
    };

    let raw = 1.0 + basal_off / reference.basal;
    let ratio = round2(raw.clamp(params.autosens_min, params.autosens_max));
    if ratio != round2(raw) {
        tracing::debug!("Autosens ratio {:.2} clamped to {:.2}", raw, ratio);
    }

    SensitivityResult {
        ratio,
        rationale: format!(
            "{}: deviation {:.2} over {} buckets, ratio {:.2}",
            label, deviation, count, ratio
        ),
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Interpolated percentile of an ascending slice
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if p <= 0.0 {
        return sorted[0];
    }
    if p >= 1.0 {
        return sorted[sorted.len() - 1];
    }
    let index = sorted.len() as f64 * p;
    let lower = index.floor() as usize;
    let upper = lower + 1;
    let weight = index % 1.0;
    if upper >= sorted.len() {
        return sorted[lower];
    }
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

/// Classic detector: median of the usable deviations
///
/// Pairs with the fixed carb absorption rate.
#[derive(Clone, Debug, Default)]
pub struct FixedRateDetector {
    params: DetectionParams,
}

impl FixedRateDetector {
    pub fn new(params: DetectionParams) -> Self {
        Self { params }
    }
}

impl SensitivityDetector for FixedRateDetector {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn min_carbs_absorption_dynamic(&self) -> bool {
        false
    }

    fn detect(
        &self,
        table: &SnapshotTable,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SensitivityResult {
        let window = collect_window(table, &self.params, start, end);
        let reference = match window.reference {
            Some(r) => r,
            None => return SensitivityResult::neutral("No profile data in window"),
        };
        if window.usable.len() < 2 {
            return SensitivityResult::neutral("Not enough data for sensitivity detection");
        }

        let mut deviations: Vec<f64> = window.usable.iter().map(|r| r.deviation).collect();
        deviations.sort_by(|a, b| a.total_cmp(b));
        let median = percentile(&deviations, 0.5);

        ratio_from_deviation(median, deviations.len(), reference, &self.params)
    }
}

/// Weighted detector: recent deviations count more than old ones
///
/// Pairs with per-entry (dynamic) carb absorption.
#[derive(Clone, Debug, Default)]
pub struct WeightedAverageDetector {
    params: DetectionParams,
}

impl WeightedAverageDetector {
    pub fn new(params: DetectionParams) -> Self {
        Self { params }
    }
}

impl SensitivityDetector for WeightedAverageDetector {
    fn name(&self) -> &'static str {
        "weighted"
    }

    fn min_carbs_absorption_dynamic(&self) -> bool {
        true
    }

    fn detect(
        &self,
        table: &SnapshotTable,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> SensitivityResult {
        let window = collect_window(table, &self.params, start, end);
        let reference = match window.reference {
            Some(r) => r,
            None => return SensitivityResult::neutral("No profile data in window"),
        };
        if window.usable.len() < 2 {
            return SensitivityResult::neutral("Not enough data for sensitivity detection");
        }

        let steps_in_window =
            (self.params.hours_for_detection * 60.0 / self.params.bucket_minutes as f64).ceil();
        let mut weighted_sum = 0.0;
        let mut weights = 0.0;
        for record in &window.usable {
            let age_steps =
                (end - record.time).num_seconds() as f64 / (self.params.bucket_minutes * 60) as f64;
            let weight = (steps_in_window - age_steps).max(1.0);
            weighted_sum += record.deviation * weight;
            weights += weight;
        }
        let average = weighted_sum / weights;

        ratio_from_deviation(average, window.usable.len(), reference, &self.params)
    }
}
