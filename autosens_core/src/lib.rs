#![forbid(unsafe_code)]

//! Core domain model and recurrence engine for autosens detection.
//!
//! This crate provides:
//! - Domain types (glucose buckets, profiles, carb entries, derived records)
//! - The snapshot table cache and its persistence
//! - Carb absorption models and sensitivity detectors
//! - The recurrence engine that extends the table run by run
//! - Dataset loading and CSV export

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod carbs;
pub mod table;
pub mod state;
pub mod sensitivity;
pub mod provider;
pub mod history;
pub mod report;
pub mod engine;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use carbs::{AbsorptionModel, CarbEntry};
pub use table::{SharedTable, SnapshotTable};
pub use sensitivity::{build_detector, SensitivityDetector};
pub use provider::{Clock, RecordedHistory, TherapyData};
pub use history::load_dataset;
pub use report::export_csv;
pub use engine::{
    AutosensEngine, CancellationToken, NoProgress, ProgressSink, RunRequest, RunResult, RunSummary,
};
