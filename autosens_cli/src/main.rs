use autosens_core::config::DetectorKind;
use autosens_core::*;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "autosens")]
#[command(about = "Autosens sensitivity and carbs-on-board detection", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Extend the autosens table from the dataset (default)
    Run {
        /// End of the calculation window (RFC 3339, defaults to now)
        #[arg(long)]
        end: Option<DateTime<Utc>>,

        /// Treat this instant as the current time (RFC 3339)
        #[arg(long)]
        now: Option<DateTime<Utc>>,

        /// Don't look back past the oldest stored treatment data
        #[arg(long)]
        limit_to_oldest: bool,

        /// Free-form description of what triggered the run
        #[arg(long)]
        cause: Option<String>,

        /// Sensitivity detector (fixed, weighted)
        #[arg(long)]
        detector: Option<String>,
    },

    /// Print the newest records of the table
    Show {
        /// Number of records to print
        #[arg(long, default_value_t = 12)]
        last: usize,
    },

    /// Export the table to CSV
    Export {
        /// Output file (defaults to <data-dir>/autosens.csv)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

/// Logs run progress at debug level
struct LogProgress;

impl ProgressSink for LogProgress {
    fn progress(&self, percent: u8, cause: Option<&str>) {
        tracing::debug!("Progress {}% ({})", percent, cause.unwrap_or("unspecified"));
    }

    fn finished(&self, cause: Option<&str>) {
        tracing::info!("Calculation finished ({})", cause.unwrap_or("unspecified"));
    }
}

fn main() -> Result<()> {
    autosens_core::logging::init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let data_dir = cli.data_dir.unwrap_or_else(|| config.data.data_dir.clone());

    match cli.command {
        Some(Commands::Run {
            end,
            now,
            limit_to_oldest,
            cause,
            detector,
        }) => cmd_run(
            &data_dir,
            config,
            RunOptions {
                end,
                now,
                limit_to_oldest,
                cause,
                detector,
            },
        ),
        Some(Commands::Show { last }) => cmd_show(&data_dir, &config, last),
        Some(Commands::Export { out }) => cmd_export(&data_dir, &config, out),
        None => cmd_run(&data_dir, config, RunOptions::default()),
    }
}

#[derive(Default)]
struct RunOptions {
    end: Option<DateTime<Utc>>,
    now: Option<DateTime<Utc>>,
    limit_to_oldest: bool,
    cause: Option<String>,
    detector: Option<String>,
}

fn table_path(data_dir: &Path) -> PathBuf {
    data_dir.join("state").join("autosens_table.json")
}

fn cmd_run(data_dir: &Path, mut config: Config, options: RunOptions) -> Result<()> {
    if let Some(name) = &options.detector {
        config.sensitivity.detector = name.parse::<DetectorKind>()?;
    }

    let clock = match options.now {
        Some(now) => Clock::Fixed(now),
        None => Clock::System,
    };
    let history = load_dataset(&data_dir.join("dataset"), clock)?;

    let state_path = table_path(data_dir);
    let table = SnapshotTable::load(&state_path, config.engine.key_resolution())?;
    let shared = Arc::new(SharedTable::new(table));

    let detector = build_detector(&config);
    let engine = AutosensEngine::new(config, history, detector, Arc::clone(&shared));

    let request = RunRequest {
        window_end: options.end.unwrap_or_else(|| engine.data().now()),
        limit_to_oldest_available: options.limit_to_oldest,
        cause: Some(options.cause.unwrap_or_else(|| "autosens cli".into())),
    };

    match engine.run_detection(&request, &CancellationToken::new(), &LogProgress) {
        RunResult::Success(summary) => {
            shared.snapshot().save(&state_path)?;
            display_summary(&summary);
            println!("  Table: {}", state_path.display());
            Ok(())
        }
        RunResult::InsufficientData(reason) => Err(Error::Dataset(reason)),
        RunResult::NoValidProfile(reason) => Err(Error::Dataset(reason)),
        RunResult::Cancelled(reason) => Err(Error::Other(reason)),
    }
}

fn cmd_show(data_dir: &Path, config: &Config, last: usize) -> Result<()> {
    let table = SnapshotTable::load(&table_path(data_dir), config.engine.key_resolution())?;
    if table.is_empty() {
        println!("No autosens records yet - run `autosens run` first.");
        return Ok(());
    }

    println!(
        "{:<26} {:>6} {:>7} {:>7} {:>6} {:>6}  {}",
        "time", "bg", "dev", "avgdev", "cob", "ratio", "class"
    );
    let skip = table.len().saturating_sub(last);
    for record in table.iter().skip(skip) {
        let ratio = record
            .sensitivity_result
            .as_ref()
            .map(|s| format!("{:.2}", s.ratio))
            .unwrap_or_else(|| "-".into());
        println!(
            "{:<26} {:>6.0} {:>7.2} {:>7.3} {:>6.1} {:>6}  {}",
            record.time.to_rfc3339(),
            record.bg,
            record.deviation,
            record.avg_deviation,
            record.carbs_on_board,
            ratio,
            record.classification
        );
    }
    Ok(())
}

fn cmd_export(data_dir: &Path, config: &Config, out: Option<PathBuf>) -> Result<()> {
    let table = SnapshotTable::load(&table_path(data_dir), config.engine.key_resolution())?;
    let out = out.unwrap_or_else(|| data_dir.join("autosens.csv"));

    let count = export_csv(&table, &out)?;
    println!("✓ Exported {} records to CSV", count);
    println!("  CSV: {}", out.display());
    Ok(())
}

fn display_summary(summary: &RunSummary) {
    println!("✓ Autosens run {} complete", summary.run_id);
    println!(
        "  Computed: {}, reused: {}",
        summary.computed, summary.reused
    );
    println!(
        "  Skipped: {} incomplete, {} sensor, {} without profile",
        summary.skipped_future, summary.skipped_sensor, summary.skipped_profile
    );
    if let (Some(first), Some(last)) = (summary.first_computed, summary.last_computed) {
        println!("  Range: {} .. {}", first.to_rfc3339(), last.to_rfc3339());
    }
    if let Some(sensitivity) = &summary.latest_sensitivity {
        println!("  Sensitivity: ratio {:.2}", sensitivity.ratio);
        println!("  {}", sensitivity.rationale);
    }
}
