//! Autosens recurrence engine.
//!
//! Walks the bucketed glucose history oldest to newest and derives one
//! [`AutosensRecord`] per bucket:
//!
//! 1. Reuse a cached record if the bucket was computed by an earlier run
//! 2. Skip buckets that are not yet complete, read below the sensor floor,
//!    or have no profile
//! 3. Compute delta, insulin impact (bgi), deviation and their averages
//! 4. Refine min/max deviation slopes over the last hour
//! 5. Ingest new carbs, absorb carbs on board, classify the bucket
//! 6. Run sensitivity detection over the window
//!
//! Each run works on a private clone of the shared table. The clone is
//! committed in one swap when the run completes and dropped otherwise.

use crate::carbs::{absorb, deduct_absorbed, AbsorptionModel};
use crate::config::Config;
use crate::provider::TherapyData;
use crate::sensitivity::SensitivityDetector;
use crate::table::{SharedTable, SnapshotTable};
use crate::{AutosensRecord, Classification, GlucoseBucket, ProfileSnapshot, SensitivityResult};
use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Number of buckets `avg_delta` looks back over
const LOOKBACK: usize = 3;

/// Older buckets required before the deviation slope search runs
const SLOPE_MIN_HISTORY: usize = 16;

/// Records after the hour-ago record scanned by the slope search
const SLOPE_WINDOW: usize = 11;

/// Starting point of the min-deviation search; also its "no data" value
const NO_MIN_DEVIATION: f64 = 999.0;

/// Parameters of one detection run
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub window_end: DateTime<Utc>,
    /// Don't look further back than the oldest stored treatment data
    pub limit_to_oldest_available: bool,
    /// Opaque description of what triggered the run
    pub cause: Option<String>,
}

impl RunRequest {
    pub fn new(window_end: DateTime<Utc>) -> Self {
        Self {
            window_end,
            limit_to_oldest_available: false,
            cause: None,
        }
    }

    pub fn cause(&self) -> &str {
        self.cause.as_deref().unwrap_or("unspecified")
    }
}

/// What a completed run did
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub cause: Option<String>,
    pub now: DateTime<Utc>,
    pub detection_start: DateTime<Utc>,
    pub computed: usize,
    pub reused: usize,
    pub skipped_future: usize,
    pub skipped_sensor: usize,
    pub skipped_profile: usize,
    pub first_computed: Option<DateTime<Utc>>,
    pub last_computed: Option<DateTime<Utc>>,
    pub latest_sensitivity: Option<SensitivityResult>,
}

/// Outcome of [`AutosensEngine::run_detection`]
#[derive(Clone, Debug, PartialEq)]
pub enum RunResult {
    Success(RunSummary),
    InsufficientData(String),
    NoValidProfile(String),
    Cancelled(String),
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Success(_))
    }
}

/// Reasons a run stops before committing
#[derive(Clone, Debug, PartialEq)]
enum Abort {
    InsufficientData(String),
    NoValidProfile(String),
    Cancelled(String),
}

impl From<Abort> for RunResult {
    fn from(abort: Abort) -> Self {
        match abort {
            Abort::InsufficientData(reason) => RunResult::InsufficientData(reason),
            Abort::NoValidProfile(reason) => RunResult::NoValidProfile(reason),
            Abort::Cancelled(reason) => RunResult::Cancelled(reason),
        }
    }
}

/// Cooperative stop signal, polled once per bucket
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Receives progress of a run
pub trait ProgressSink {
    /// Percentage complete, non-decreasing within a run; 100 on exit
    fn progress(&self, percent: u8, cause: Option<&str>);

    /// A run committed its table
    fn finished(&self, _cause: Option<&str>) {}
}

/// Discards progress
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn progress(&self, _percent: u8, _cause: Option<&str>) {}
}

/// The recurrence engine for one patient context
pub struct AutosensEngine<D: TherapyData> {
    config: Config,
    data: D,
    detector: Box<dyn SensitivityDetector>,
    table: Arc<SharedTable>,
}

impl<D: TherapyData> AutosensEngine<D> {
    pub fn new(
        config: Config,
        data: D,
        detector: Box<dyn SensitivityDetector>,
        table: Arc<SharedTable>,
    ) -> Self {
        Self {
            config,
            data,
            detector,
            table,
        }
    }

    pub fn table(&self) -> &Arc<SharedTable> {
        &self.table
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    /// Oldest time the run needs data from
    ///
    /// One day plus the insulin action time before `end`. With `limit` set,
    /// never earlier than the oldest treatment data available.
    pub fn calculate_detection_start(&self, end: DateTime<Utc>, limit: bool) -> DateTime<Utc> {
        let dia = self
            .data
            .profile_at(end)
            .map(|p| p.dia_hours)
            .unwrap_or(self.config.engine.default_dia_hours);
        let from = end - Duration::seconds(((24.0 + dia) * 3600.0) as i64);

        if !limit {
            return from;
        }
        match self.data.oldest_data_available() {
            Some(oldest) if oldest > from => {
                tracing::debug!("Detection start limited to oldest available data {}", oldest);
                oldest
            }
            _ => from,
        }
    }

    /// Extend the shared table up to `request.window_end`
    ///
    /// The shared table is replaced only when the whole range was processed.
    /// Progress always ends at 100.
    pub fn run_detection(
        &self,
        request: &RunRequest,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> RunResult {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        tracing::info!("Autosens run {} started: {}", run_id, request.cause());

        let mut working = (*self.table.snapshot()).clone();
        let result = match self.process(&mut working, request, run_id, cancel, progress) {
            Ok(summary) => {
                self.table.commit(working);
                progress.finished(request.cause.as_deref());
                tracing::info!(
                    "Autosens run {} committed: {} computed, {} reused",
                    run_id,
                    summary.computed,
                    summary.reused
                );
                RunResult::Success(summary)
            }
            Err(abort) => {
                tracing::info!("Autosens run {} discarded: {:?}", run_id, abort);
                abort.into()
            }
        };

        progress.progress(100, request.cause.as_deref());
        tracing::debug!(
            "Autosens run {} ended after {} ms",
            run_id,
            started.elapsed().as_millis()
        );
        result
    }

    fn process(
        &self,
        working: &mut SnapshotTable,
        request: &RunRequest,
        run_id: Uuid,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> Result<RunSummary, Abort> {
        let now = self.data.now();
        if self.data.profile_at(now).is_none() {
            return Err(Abort::NoValidProfile(format!(
                "No valid profile at {}: {}",
                now,
                request.cause()
            )));
        }

        let detection_start =
            self.calculate_detection_start(request.window_end, request.limit_to_oldest_available);
        let buckets: Vec<GlucoseBucket> = self
            .data
            .bucketed_glucose()
            .into_iter()
            .filter(|b| b.timestamp >= detection_start && b.timestamp <= request.window_end)
            .collect();

        if buckets.len() < LOOKBACK {
            return Err(Abort::InsufficientData(format!(
                "No bucketed data available ({} buckets): {}",
                buckets.len(),
                request.cause()
            )));
        }
        if !buckets.windows(2).all(|w| w[0].timestamp < w[1].timestamp) {
            return Err(Abort::InsufficientData(format!(
                "Bucketed data is not in ascending order: {}",
                request.cause()
            )));
        }

        let model = AbsorptionModel::for_run(
            self.detector.min_carbs_absorption_dynamic(),
            &self.config.carbs,
            self.config.engine.bucket_minutes,
        );
        tracing::debug!(
            "Run {} using {} detector, dynamic absorption: {}",
            run_id,
            self.detector.name(),
            model.is_dynamic()
        );

        let mut summary = RunSummary {
            run_id,
            cause: request.cause.clone(),
            now,
            detection_start,
            computed: 0,
            reused: 0,
            skipped_future: 0,
            skipped_sensor: 0,
            skipped_profile: 0,
            first_computed: None,
            last_computed: None,
            latest_sensitivity: None,
        };

        let floor = self.config.engine.sensor_floor;
        let total = buckets.len();
        let mut previous: Option<AutosensRecord> =
            working.get(buckets[LOOKBACK - 1].timestamp).cloned();

        for i in LOOKBACK..total {
            progress.progress(progress_percent(i, total), request.cause.as_deref());
            if cancel.is_cancelled() {
                return Err(Abort::Cancelled(format!(
                    "Aborting calculation (trigger): {}",
                    request.cause()
                )));
            }

            let bucket = &buckets[i];
            let time = working.round_up_time(bucket.timestamp);

            if let Some(existing) = working.get(time) {
                previous = Some(existing.clone());
                summary.reused += 1;
                continue;
            }

            if time >= now {
                tracing::debug!("Bucket {} is not complete yet, skipping", time);
                summary.skipped_future += 1;
                continue;
            }

            // previous stays on the last good record across skipped buckets
            if bucket.value < floor || buckets[i - LOOKBACK].value < floor {
                tracing::warn!("Glucose below sensor floor around {}, skipping", time);
                summary.skipped_sensor += 1;
                continue;
            }

            let profile = match self.data.profile_at(time) {
                Some(profile) => profile,
                None => {
                    tracing::debug!("No profile at {}, skipping bucket", time);
                    summary.skipped_profile += 1;
                    continue;
                }
            };

            tracing::debug!("Processing bucket {} ({}/{})", time, i, total);
            let record = self.compute_record(
                working,
                &buckets,
                i,
                time,
                &profile,
                previous.as_ref(),
                &model,
            );

            working.put(time, record);
            let sensitivity = self.detector.detect(working, detection_start, time);
            tracing::debug!("Sensitivity at {}: {}", time, sensitivity.rationale);
            if let Some(stored) = working.get_mut(time) {
                stored.sensitivity_result = Some(sensitivity.clone());
            }
            previous = working.get(time).cloned();

            summary.computed += 1;
            summary.first_computed.get_or_insert(time);
            summary.last_computed = Some(time);
            summary.latest_sensitivity = Some(sensitivity);
        }

        Ok(summary)
    }

    /// Derive the record for bucket `i`
    #[allow(clippy::too_many_arguments)]
    fn compute_record(
        &self,
        table: &SnapshotTable,
        buckets: &[GlucoseBucket],
        i: usize,
        time: DateTime<Utc>,
        profile: &ProfileSnapshot,
        previous: Option<&AutosensRecord>,
        model: &AbsorptionModel,
    ) -> AutosensRecord {
        let step = self.config.engine.bucket_width();
        let step_minutes = self.config.engine.bucket_minutes as f64;
        let bg = buckets[i].value;
        let sens = profile.isf;

        let mut record = AutosensRecord::new(time, bg);
        record.sens = sens;
        record.basal = profile.basal;
        record.active_carbs = previous.map(|p| p.active_carbs.clone()).unwrap_or_default();

        let delta = bg - buckets[i - 1].value;
        let avg_delta = (bg - buckets[i - LOOKBACK].value) / LOOKBACK as f64;
        let bgi = -self.data.insulin_activity_at(time) * sens * step_minutes;
        let deviation = delta - bgi;
        let avg_deviation = round3(avg_delta - bgi);

        let (slope_from_max, slope_from_min) = if i >= SLOPE_MIN_HISTORY {
            self.deviation_slopes(table, time, avg_deviation)
        } else {
            (0.0, NO_MIN_DEVIATION)
        };

        for treatment in self.data.carb_treatments(time - step, time) {
            let at_treatment = self.data.profile_at(treatment.timestamp);
            let entry = model.entry(&treatment, at_treatment.as_ref());
            record.carbs_from_recent_bolus += treatment.amount;
            record.active_carbs.push(entry);
            record.annotate_carbs(treatment.amount);
        }

        if let Some(previous) = previous.filter(|p| p.carbs_on_board > 0.0) {
            let total_min_impact = model.total_min_impact(&record.active_carbs);
            let absorption = absorb(deviation, total_min_impact, profile);
            record.failed_over_to_min_absorption = absorption.failed_over;
            record.absorbed = absorption.absorbed;
            record.carbs_on_board = (previous.carbs_on_board - absorption.absorbed).max(0.0);
            deduct_absorbed(&mut record.active_carbs, absorption.absorbed);
            record.used_min_carb_impact = total_min_impact;
        }

        let expired = model.remove_expired(&mut record.active_carbs, time);
        record.carbs_on_board = (record.carbs_on_board - expired).max(0.0);
        record.carbs_on_board = (record.carbs_on_board + record.carbs_from_recent_bolus).max(0.0);

        record.delta = delta;
        record.avg_delta = avg_delta;
        record.bgi = bgi;
        record.deviation = deviation;
        record.avg_deviation = avg_deviation;
        record.slope_from_max_deviation = slope_from_max;
        record.slope_from_min_deviation = slope_from_min;

        let class = if record.carbs_on_board > 0.0 {
            Classification::Carbs
        } else if deviation.abs() < self.config.engine.deviation_equal_tolerance {
            Classification::Equal
        } else if deviation > 0.0 {
            Classification::Positive
        } else {
            Classification::Negative
        };
        record.classify(class);

        record
    }

    /// Slopes toward the largest and smallest avg deviation of the last hour
    ///
    /// Returns `(slope_from_max, slope_from_min)`, clamped to `<= 0` and
    /// `>= 0`. Without a record about an hour back the defaults are kept.
    fn deviation_slopes(
        &self,
        table: &SnapshotTable,
        time: DateTime<Utc>,
        avg_deviation: f64,
    ) -> (f64, f64) {
        let step = self.config.engine.bucket_width();
        let step_minutes = self.config.engine.bucket_minutes as f64;
        let hour_ago = time + Duration::seconds(10) - Duration::hours(1);

        let hour_ago_record = match table.record_at(hour_ago, step) {
            Some(record) => record,
            None => {
                tracing::debug!("No record an hour before {}, keeping default slopes", time);
                return (0.0, NO_MIN_DEVIATION);
            }
        };

        let mut max_deviation = 0.0;
        let mut min_deviation = NO_MIN_DEVIATION;
        let mut slope_from_max = 0.0;
        let mut slope_from_min = NO_MIN_DEVIATION;

        for past in table.between(hour_ago_record.time, time).take(SLOPE_WINDOW) {
            let minutes = (past.time - time).num_seconds() as f64 / 60.0;
            let slope = (past.avg_deviation - avg_deviation) / minutes * step_minutes;
            if past.avg_deviation > max_deviation {
                slope_from_max = slope.min(0.0);
                max_deviation = past.avg_deviation;
            }
            if past.avg_deviation < min_deviation {
                slope_from_min = slope.max(0.0);
                min_deviation = past.avg_deviation;
            }
        }

        (slope_from_max, slope_from_min)
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn progress_percent(i: usize, total: usize) -> u8 {
    let remaining = total - 1 - i;
    (100 - (100 * remaining) / total) as u8
}
