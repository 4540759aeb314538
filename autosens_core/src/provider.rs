//! Data the engine consumes but does not own.
//!
//! Glucose buckets, therapy profiles, insulin activity and carb history all
//! come from outside the engine. [`TherapyData`] is the narrow contract; the
//! in-memory [`RecordedHistory`] backs the CLI and the tests.

use crate::{CarbTreatment, GlucoseBucket, ProfileSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Read-only accessors the engine calls during a run
///
/// All lookups are expected to be fast and deterministic.
pub trait TherapyData {
    /// Bucketed glucose history, oldest first
    fn bucketed_glucose(&self) -> Vec<GlucoseBucket>;

    /// Profile in effect at `time`, if any
    fn profile_at(&self, time: DateTime<Utc>) -> Option<ProfileSnapshot>;

    /// Net insulin activity (units per minute) at `time`
    fn insulin_activity_at(&self, time: DateTime<Utc>) -> f64;

    /// Carb treatments with `after < timestamp <= until`, oldest first
    fn carb_treatments(&self, after: DateTime<Utc>, until: DateTime<Utc>) -> Vec<CarbTreatment>;

    fn now(&self) -> DateTime<Utc>;

    /// Oldest treatment data the store still holds
    fn oldest_data_available(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// Source of "now"
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Clock {
    System,
    Fixed(DateTime<Utc>),
}

impl Clock {
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Clock::System => Utc::now(),
            Clock::Fixed(time) => *time,
        }
    }
}

/// A profile and the time it takes effect
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProfileEntry {
    pub valid_from: DateTime<Utc>,
    #[serde(flatten)]
    pub profile: ProfileSnapshot,
}

/// Therapy history held in memory
#[derive(Clone, Debug)]
pub struct RecordedHistory {
    glucose: Vec<GlucoseBucket>,
    profiles: Vec<ProfileEntry>,
    activity: BTreeMap<DateTime<Utc>, f64>,
    carbs: Vec<CarbTreatment>,
    clock: Clock,
}

impl RecordedHistory {
    pub fn new(glucose: Vec<GlucoseBucket>) -> Self {
        let mut glucose = glucose;
        glucose.sort_by_key(|b| b.timestamp);
        Self {
            glucose,
            profiles: Vec::new(),
            activity: BTreeMap::new(),
            carbs: Vec::new(),
            clock: Clock::System,
        }
    }

    /// Add a profile that applies from `valid_from` until the next one
    pub fn with_profile(mut self, valid_from: DateTime<Utc>, profile: ProfileSnapshot) -> Self {
        self.profiles.push(ProfileEntry { valid_from, profile });
        self.profiles.sort_by_key(|p| p.valid_from);
        self
    }

    pub fn with_profiles(mut self, entries: Vec<ProfileEntry>) -> Self {
        self.profiles.extend(entries);
        self.profiles.sort_by_key(|p| p.valid_from);
        self
    }

    /// Insulin activity from `time` until the next sample
    pub fn with_activity(mut self, time: DateTime<Utc>, activity: f64) -> Self {
        self.activity.insert(time, activity);
        self
    }

    pub fn with_activity_series(
        mut self,
        samples: impl IntoIterator<Item = (DateTime<Utc>, f64)>,
    ) -> Self {
        self.activity.extend(samples);
        self
    }

    pub fn with_carbs(mut self, treatments: impl IntoIterator<Item = CarbTreatment>) -> Self {
        self.carbs.extend(treatments);
        self.carbs.sort_by_key(|c| c.timestamp);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Freeze "now" at `time`
    pub fn at(self, time: DateTime<Utc>) -> Self {
        self.with_clock(Clock::Fixed(time))
    }
}

impl TherapyData for RecordedHistory {
    fn bucketed_glucose(&self) -> Vec<GlucoseBucket> {
        self.glucose.clone()
    }

    fn profile_at(&self, time: DateTime<Utc>) -> Option<ProfileSnapshot> {
        self.profiles
            .iter()
            .rev()
            .find(|p| p.valid_from <= time)
            .map(|p| p.profile.clone())
    }

    fn insulin_activity_at(&self, time: DateTime<Utc>) -> f64 {
        self.activity
            .range(..=time)
            .next_back()
            .map(|(_, activity)| *activity)
            .unwrap_or(0.0)
    }

    fn carb_treatments(&self, after: DateTime<Utc>, until: DateTime<Utc>) -> Vec<CarbTreatment> {
        self.carbs
            .iter()
            .filter(|c| c.timestamp > after && c.timestamp <= until)
            .cloned()
            .collect()
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn oldest_data_available(&self) -> Option<DateTime<Utc>> {
        let oldest_carb = self.carbs.first().map(|c| c.timestamp);
        let oldest_activity = self.activity.keys().next().copied();
        match (oldest_carb, oldest_activity) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
