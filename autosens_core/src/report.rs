//! CSV export of the committed snapshot table.

use crate::table::SnapshotTable;
use crate::{AutosensRecord, Result};
use std::fs::File;
use std::path::Path;

/// One exported record
#[derive(Debug, serde::Serialize)]
struct CsvRow {
    time: String,
    bg: f64,
    delta: f64,
    avg_delta: f64,
    bgi: f64,
    deviation: f64,
    avg_deviation: f64,
    slope_from_max_deviation: f64,
    slope_from_min_deviation: f64,
    cob: f64,
    carbs_from_recent_bolus: f64,
    absorbed: f64,
    active_carb_entries: usize,
    classification: String,
    valid_deviation: bool,
    used_min_carb_impact: f64,
    failed_over_to_min_absorption: bool,
    ratio: Option<f64>,
    rationale: Option<String>,
}

impl From<&AutosensRecord> for CsvRow {
    fn from(record: &AutosensRecord) -> Self {
        CsvRow {
            time: record.time.to_rfc3339(),
            bg: record.bg,
            delta: record.delta,
            avg_delta: record.avg_delta,
            bgi: record.bgi,
            deviation: record.deviation,
            avg_deviation: record.avg_deviation,
            slope_from_max_deviation: record.slope_from_max_deviation,
            slope_from_min_deviation: record.slope_from_min_deviation,
            cob: record.carbs_on_board,
            carbs_from_recent_bolus: record.carbs_from_recent_bolus,
            absorbed: record.absorbed,
            active_carb_entries: record.active_carbs.len(),
            classification: record.classification.clone(),
            valid_deviation: record.valid_deviation,
            used_min_carb_impact: record.used_min_carb_impact,
            failed_over_to_min_absorption: record.failed_over_to_min_absorption,
            ratio: record.sensitivity_result.as_ref().map(|s| s.ratio),
            rationale: record.sensitivity_result.as_ref().map(|s| s.rationale.clone()),
        }
    }
}

/// Write every record of `table` to `path`, oldest first
///
/// The file is replaced, flushed and synced. Returns the number of rows.
pub fn export_csv(table: &SnapshotTable, path: &Path) -> Result<usize> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(true).from_writer(file);

    let mut count = 0;
    for record in table.iter() {
        writer.serialize(CsvRow::from(record))?;
        count += 1;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    tracing::info!("Exported {} records to {:?}", count, path);
    Ok(count)
}
