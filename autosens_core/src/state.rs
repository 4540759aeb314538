//! Snapshot table persistence with file locking.
//!
//! The committed table is written as JSON so that a later process can
//! resume from the cached records instead of recomputing the whole history.

use crate::table::SnapshotTable;
use crate::{AutosensRecord, Error, Result};
use chrono::Duration;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;

/// On-disk layout of a snapshot table
#[derive(Debug, Serialize, Deserialize)]
struct TableFile {
    resolution_secs: i64,
    records: Vec<AutosensRecord>,
}

impl SnapshotTable {
    /// Load a table from a file with shared locking
    ///
    /// Returns an empty table if the file doesn't exist, can't be read, or
    /// was written with a different key resolution. Cached records are only
    /// an optimization; losing them costs a recompute.
    pub fn load(path: &Path, resolution: Duration) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No table file found, starting with an empty table");
            return Ok(Self::new(resolution));
        }

        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!("Unable to open table file {:?}: {}. Starting empty.", path, e);
                return Ok(Self::new(resolution));
            }
        };

        if let Err(e) = file.lock_shared() {
            tracing::warn!("Unable to lock table file {:?}: {}. Starting empty.", path, e);
            return Ok(Self::new(resolution));
        }

        let mut contents = String::new();
        let mut reader = std::io::BufReader::new(&file);
        if let Err(e) = reader.read_to_string(&mut contents) {
            let _ = file.unlock();
            tracing::warn!("Failed to read table file {:?}: {}. Starting empty.", path, e);
            return Ok(Self::new(resolution));
        }

        file.unlock()?;

        let parsed = match serde_json::from_str::<TableFile>(&contents) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Failed to parse table file {:?}: {}. Starting empty.", path, e);
                return Ok(Self::new(resolution));
            }
        };

        if parsed.resolution_secs != resolution.num_seconds() {
            tracing::warn!(
                "Table file {:?} uses {}s keys, expected {}s. Starting empty.",
                path,
                parsed.resolution_secs,
                resolution.num_seconds()
            );
            return Ok(Self::new(resolution));
        }

        let mut table = Self::new(resolution);
        for record in parsed.records {
            table.put(record.time, record);
        }
        tracing::debug!("Loaded {} records from {:?}", table.len(), path);
        Ok(table)
    }

    /// Save the table to a file with exclusive locking
    ///
    /// Writes to a temp file in the same directory, syncs it, then renames
    /// it over the original.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| Error::State(format!("table path {:?} has no parent", path)))?;
        std::fs::create_dir_all(parent)?;

        let temp = NamedTempFile::new_in(parent)?;
        temp.as_file().lock_exclusive()?;

        {
            let file = TableFile {
                resolution_secs: self.resolution().num_seconds(),
                records: self.iter().cloned().collect(),
            };
            let mut writer = std::io::BufWriter::new(temp.as_file());
            serde_json::to_writer(&mut writer, &file)?;
            writer.flush()?;
        }

        temp.as_file().sync_all()?;
        temp.as_file().unlock()?;

        temp.persist(path).map_err(|e| Error::Io(e.error))?;

        tracing::debug!("Saved {} records to {:?}", self.len(), path);
        Ok(())
    }
}
