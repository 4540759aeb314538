//! Loading a recorded therapy dataset from disk.
//!
//! A dataset directory holds:
//!
//! ```text
//! glucose.csv     timestamp,value         (required, bucketed readings)
//! activity.csv    timestamp,activity      (insulin activity samples)
//! carbs.jsonl     {"timestamp": .., "amount": ..} per line
//! profiles.json   [{"valid_from": .., "isf": .., "carb_ratio": .., "basal": ..}]
//! ```
//!
//! Unparseable rows are skipped with a warning rather than failing the load.

use crate::provider::{Clock, ProfileEntry, RecordedHistory};
use crate::{CarbTreatment, Error, GlucoseBucket, Result};
use chrono::{DateTime, Utc};
use csv::ReaderBuilder;
use fs2::FileExt;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

pub const GLUCOSE_FILE: &str = "glucose.csv";
pub const ACTIVITY_FILE: &str = "activity.csv";
pub const CARBS_FILE: &str = "carbs.jsonl";
pub const PROFILES_FILE: &str = "profiles.json";

#[derive(Debug, Deserialize)]
struct GlucoseRow {
    timestamp: String,
    value: f64,
}

impl TryFrom<GlucoseRow> for GlucoseBucket {
    type Error = Error;

    fn try_from(row: GlucoseRow) -> Result<Self> {
        Ok(GlucoseBucket::new(parse_time(&row.timestamp)?, row.value))
    }
}

#[derive(Debug, Deserialize)]
struct ActivityRow {
    timestamp: String,
    activity: f64,
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Dataset(format!("Invalid timestamp {:?}: {}", raw, e)))
}

/// Load every file of a dataset directory into a [`RecordedHistory`]
pub fn load_dataset(dir: &Path, clock: Clock) -> Result<RecordedHistory> {
    let glucose_path = dir.join(GLUCOSE_FILE);
    if !glucose_path.exists() {
        return Err(Error::Dataset(format!(
            "No glucose readings found at {:?}",
            glucose_path
        )));
    }

    let glucose = load_glucose(&glucose_path)?;
    let activity = load_activity(&dir.join(ACTIVITY_FILE))?;
    let carbs = load_carbs(&dir.join(CARBS_FILE))?;
    let profiles = load_profiles(&dir.join(PROFILES_FILE))?;

    tracing::info!(
        "Loaded dataset from {:?}: {} buckets, {} activity samples, {} carb entries, {} profiles",
        dir,
        glucose.len(),
        activity.len(),
        carbs.len(),
        profiles.len()
    );

    Ok(RecordedHistory::new(glucose)
        .with_activity_series(activity)
        .with_carbs(carbs)
        .with_profiles(profiles)
        .with_clock(clock))
}

/// Bucketed glucose readings, oldest first
pub fn load_glucose(path: &Path) -> Result<Vec<GlucoseBucket>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut buckets = Vec::new();
    for result in reader.deserialize::<GlucoseRow>() {
        match result {
            Ok(row) => match GlucoseBucket::try_from(row) {
                Ok(bucket) => buckets.push(bucket),
                Err(e) => tracing::warn!("Skipping glucose row: {}", e),
            },
            Err(e) => tracing::warn!("Failed to deserialize glucose row: {}", e),
        }
    }

    buckets.sort_by_key(|b| b.timestamp);
    // a bucket appears once; the later row wins
    let mut deduped: Vec<GlucoseBucket> = Vec::with_capacity(buckets.len());
    for bucket in buckets {
        match deduped.last_mut() {
            Some(last) if last.timestamp == bucket.timestamp => *last = bucket,
            _ => deduped.push(bucket),
        }
    }
    Ok(deduped)
}

/// Insulin activity samples; a missing file means no insulin data
pub fn load_activity(path: &Path) -> Result<Vec<(DateTime<Utc>, f64)>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut samples = Vec::new();
    for result in reader.deserialize::<ActivityRow>() {
        match result.map_err(Error::from).and_then(|row| {
            let time = parse_time(&row.timestamp)?;
            Ok((time, row.activity))
        }) {
            Ok(sample) => samples.push(sample),
            Err(e) => tracing::warn!("Skipping activity row: {}", e),
        }
    }
    Ok(samples)
}

/// Carb treatments from a JSON lines file, read under a shared lock
pub fn load_carbs(path: &Path) -> Result<Vec<CarbTreatment>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path)?;
    file.lock_shared()?;

    let reader = BufReader::new(&file);
    let mut treatments = Vec::new();
    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CarbTreatment>(&line) {
            Ok(treatment) => treatments.push(treatment),
            Err(e) => tracing::warn!("Failed to parse carb entry at line {}: {}", line_num + 1, e),
        }
    }

    file.unlock()?;
    Ok(treatments)
}

/// Profile switches; no file means no profile is known
pub fn load_profiles(path: &Path) -> Result<Vec<ProfileEntry>> {
    if !path.exists() {
        tracing::debug!("No profiles at {:?}", path);
        return Ok(Vec::new());
    }
    let contents = std::fs::read_to_string(path)?;
    let profiles: Vec<ProfileEntry> = serde_json::from_str(&contents)?;
    Ok(profiles)
}
