//! Carbohydrate entries and the absorption models that decay them.
//!
//! Two models exist:
//! - **Dynamic**: each entry carries its own floor impact, derived from the
//!   assumption that it is fully absorbed within `max_absorption_hours`.
//!   Entries expire by age.
//! - **Fixed**: every entry shares one configured floor impact. Entries
//!   expire once nothing remains.
//!
//! The model is picked once per run and passed explicitly to every step.

use crate::config::CarbsConfig;
use crate::{CarbTreatment, ProfileSnapshot};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One decaying carbohydrate contribution
///
/// Entries are plain values: a record's active list is copied, never shared,
/// when the next bucket is derived from it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CarbEntry {
    pub time: DateTime<Utc>,
    pub carbs: f64,
    /// Minimum glucose impact per bucket attributed to this entry
    pub min_impact_per_step: f64,
    pub remaining: f64,
}

impl CarbEntry {
    /// Remove up to `amount` grams; returns the part that did not fit
    pub fn deduct(&mut self, amount: f64) -> f64 {
        if self.remaining <= 0.0 || amount <= 0.0 {
            return amount.max(0.0);
        }
        let sub = amount.min(self.remaining);
        self.remaining = (self.remaining - sub).max(0.0);
        amount - sub
    }
}

/// Carb absorption strategy for one run
#[derive(Clone, Debug, PartialEq)]
pub enum AbsorptionModel {
    Dynamic {
        max_absorption_hours: f64,
        bucket_minutes: i64,
        /// Used when no profile resolves at the treatment time
        fallback_min_impact: f64,
    },
    Fixed {
        min_5m_carb_impact: f64,
    },
}

impl AbsorptionModel {
    /// Build the model from the detector's capability and the carb settings
    pub fn for_run(dynamic: bool, config: &CarbsConfig, bucket_minutes: i64) -> Self {
        if dynamic {
            AbsorptionModel::Dynamic {
                max_absorption_hours: config.max_absorption_hours,
                bucket_minutes,
                fallback_min_impact: config.min_5m_carb_impact,
            }
        } else {
            AbsorptionModel::Fixed {
                min_5m_carb_impact: config.min_5m_carb_impact,
            }
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, AbsorptionModel::Dynamic { .. })
    }

    /// Create an entry from a treatment, using the profile at treatment time
    pub fn entry(&self, treatment: &CarbTreatment, profile: Option<&ProfileSnapshot>) -> CarbEntry {
        let min_impact_per_step = match (self, profile) {
            (
                AbsorptionModel::Dynamic {
                    max_absorption_hours,
                    bucket_minutes,
                    ..
                },
                Some(profile),
            ) if profile.carb_ratio > 0.0 => {
                let steps = max_absorption_hours * 60.0 / *bucket_minutes as f64;
                treatment.amount / steps * profile.isf / profile.carb_ratio
            }
            (
                AbsorptionModel::Dynamic {
                    fallback_min_impact,
                    ..
                },
                _,
            ) => {
                tracing::debug!(
                    "No usable profile at {} for carb entry, using fallback impact",
                    treatment.timestamp
                );
                *fallback_min_impact
            }
            (AbsorptionModel::Fixed { min_5m_carb_impact }, _) => *min_5m_carb_impact,
        };

        CarbEntry {
            time: treatment.timestamp,
            carbs: treatment.amount,
            min_impact_per_step,
            remaining: treatment.amount.max(0.0),
        }
    }

    /// Floor impact assumed while carbs are absorbing
    pub fn total_min_impact(&self, entries: &[CarbEntry]) -> f64 {
        match self {
            // smaller meals absorb with a smaller floor, so they add up
            AbsorptionModel::Dynamic { .. } => entries.iter().map(|c| c.min_impact_per_step).sum(),
            AbsorptionModel::Fixed { min_5m_carb_impact } => *min_5m_carb_impact,
        }
    }

    /// Drop entries that no longer contribute
    ///
    /// Returns the grams still unabsorbed in dropped entries; the caller
    /// removes them from carbs on board.
    pub fn remove_expired(&self, entries: &mut Vec<CarbEntry>, at: DateTime<Utc>) -> f64 {
        let mut dropped = 0.0;
        match self {
            AbsorptionModel::Dynamic {
                max_absorption_hours,
                ..
            } => {
                let horizon = Duration::seconds((max_absorption_hours * 3600.0) as i64);
                entries.retain(|c| {
                    if c.time + horizon < at {
                        tracing::debug!(
                            "Removing carbs from {} after {}h, {:.1}g left",
                            c.time,
                            max_absorption_hours,
                            c.remaining
                        );
                        dropped += c.remaining.max(0.0);
                        false
                    } else {
                        true
                    }
                });
            }
            AbsorptionModel::Fixed { .. } => entries.retain(|c| c.remaining > 0.0),
        }
        dropped
    }
}

/// Deduct absorbed carbs from the active list, oldest entry first
pub fn deduct_absorbed(entries: &mut [CarbEntry], absorbed: f64) {
    let mut left = absorbed;
    for entry in entries.iter_mut() {
        if left <= 0.0 {
            break;
        }
        left = entry.deduct(left);
    }
}

/// Result of one absorption step
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Absorption {
    /// Glucose impact attributed to carbs this step
    pub consumed_impact: f64,
    /// Grams absorbed this step
    pub absorbed: f64,
    /// The floor rate was used instead of the observed deviation
    pub failed_over: bool,
}

/// Convert a deviation into absorbed carbs, never below the floor impact
pub fn absorb(deviation: f64, total_min_impact: f64, profile: &ProfileSnapshot) -> Absorption {
    let consumed_impact = deviation.max(total_min_impact);
    let absorbed = if profile.isf > 0.0 {
        consumed_impact * profile.carb_ratio / profile.isf
    } else {
        0.0
    };
    Absorption {
        consumed_impact,
        absorbed,
        failed_over: consumed_impact != deviation,
    }
}
