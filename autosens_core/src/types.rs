//! Core domain types for the autosens engine.
//!
//! This module defines the fundamental types used throughout the system:
//! - External inputs (glucose buckets, carb treatments, profile snapshots)
//! - Derived per-bucket records
//! - Sensitivity detection results

use crate::carbs::CarbEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// External Inputs
// ============================================================================

/// One bucketed glucose value produced upstream
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GlucoseBucket {
    pub timestamp: DateTime<Utc>,
    /// Glucose concentration in mg/dL
    pub value: f64,
}

impl GlucoseBucket {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// A recorded carbohydrate intake
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CarbTreatment {
    pub timestamp: DateTime<Utc>,
    /// Grams of carbohydrate
    pub amount: f64,
}

/// Therapy settings resolved at a single point in time
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProfileSnapshot {
    /// Insulin sensitivity factor, mg/dL per unit
    pub isf: f64,
    /// Grams of carbohydrate covered by one unit
    pub carb_ratio: f64,
    /// Basal rate, units per hour
    pub basal: f64,
    /// Duration of insulin action in hours
    #[serde(default = "default_dia")]
    pub dia_hours: f64,
}

fn default_dia() -> f64 {
    5.0
}

// ============================================================================
// Derived Records
// ============================================================================

/// How a bucket's deviation was interpreted
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Deviation within the equality tolerance
    Equal,
    /// Glucose rose faster than insulin explains
    Positive,
    /// Glucose fell faster than insulin explains
    Negative,
    /// Carbs were still absorbing; excluded from sensitivity detection
    Carbs,
}

impl Classification {
    pub fn symbol(self) -> char {
        match self {
            Classification::Equal => '=',
            Classification::Positive => '+',
            Classification::Negative => '-',
            Classification::Carbs => 'C',
        }
    }
}

/// Output of a sensitivity detector
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SensitivityResult {
    pub ratio: f64,
    pub rationale: String,
}

impl SensitivityResult {
    pub fn neutral(rationale: impl Into<String>) -> Self {
        Self {
            ratio: 1.0,
            rationale: rationale.into(),
        }
    }
}

/// Derived metrics for a single glucose bucket
///
/// Records are created by the recurrence engine and never edited after the
/// table holding them is committed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AutosensRecord {
    pub time: DateTime<Utc>,
    pub bg: f64,
    pub delta: f64,
    pub avg_delta: f64,
    /// Glucose impact of insulin activity ("bgi")
    pub bgi: f64,
    pub deviation: f64,
    pub avg_deviation: f64,
    pub slope_from_max_deviation: f64,
    pub slope_from_min_deviation: f64,
    pub carbs_on_board: f64,
    pub carbs_from_recent_bolus: f64,
    /// Carbs absorbed during this bucket
    pub absorbed: f64,
    pub active_carbs: Vec<CarbEntry>,
    /// Append-only annotation trace, e.g. `[20g]C`
    pub classification: String,
    pub valid_deviation: bool,
    pub used_min_carb_impact: f64,
    pub failed_over_to_min_absorption: bool,
    /// ISF resolved at `time`
    pub sens: f64,
    /// Basal rate resolved at `time`
    pub basal: f64,
    pub sensitivity_result: Option<SensitivityResult>,
}

impl AutosensRecord {
    /// Empty record for a bucket; the engine fills in the rest
    pub fn new(time: DateTime<Utc>, bg: f64) -> Self {
        Self {
            time,
            bg,
            delta: 0.0,
            avg_delta: 0.0,
            bgi: 0.0,
            deviation: 0.0,
            avg_deviation: 0.0,
            slope_from_max_deviation: 0.0,
            slope_from_min_deviation: 999.0,
            carbs_on_board: 0.0,
            carbs_from_recent_bolus: 0.0,
            absorbed: 0.0,
            active_carbs: Vec::new(),
            classification: String::new(),
            valid_deviation: false,
            used_min_carb_impact: 0.0,
            failed_over_to_min_absorption: false,
            sens: 0.0,
            basal: 0.0,
            sensitivity_result: None,
        }
    }

    /// Append a classification symbol to the trace
    pub fn classify(&mut self, class: Classification) {
        self.classification.push(class.symbol());
        self.valid_deviation = class != Classification::Carbs;
    }

    /// Annotate carb ingestion, e.g. `[20g]`
    pub fn annotate_carbs(&mut self, grams: f64) {
        self.classification.push_str(&format!("[{:.0}g]", grams));
    }
}
