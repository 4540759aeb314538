//! Integration tests for the autosens binary.
//!
//! These tests verify end-to-end behavior including:
//! - Running detection over a dataset directory
//! - Reusing the persisted table on later runs
//! - Inspecting and exporting the table
//! - Reporting runs that cannot proceed

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const NOW: &str = "2024-03-01T04:00:00Z";

/// Helper to create a test data directory
fn setup_test_dir() -> TempDir {
    tempfile::tempdir().expect("Failed to create temp dir")
}

/// Helper to get the path to the CLI binary
fn cli() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("autosens"))
}

/// Empty config file so the user's own config never leaks into a test
fn empty_config(dir: &Path) -> PathBuf {
    let path = dir.join("config.toml");
    fs::write(&path, "").unwrap();
    path
}

fn timestamp(bucket: usize) -> String {
    let minutes = 5 * bucket;
    format!("2024-03-01T{:02}:{:02}:00Z", minutes / 60, minutes % 60)
}

/// Write a dataset of `buckets` readings starting at midnight
fn write_dataset(data_dir: &Path, buckets: usize, with_profile: bool) {
    let dataset = data_dir.join("dataset");
    fs::create_dir_all(&dataset).unwrap();

    let mut glucose = String::from("timestamp,value\n");
    for i in 0..buckets {
        let value = 120.0 + ((i as f64) / 4.0).sin() * 20.0;
        glucose.push_str(&format!("{},{:.1}\n", timestamp(i), value));
    }
    fs::write(dataset.join("glucose.csv"), glucose).unwrap();

    fs::write(
        dataset.join("activity.csv"),
        format!("timestamp,activity\n{},0.01\n{},0.02\n", timestamp(12), timestamp(20)),
    )
    .unwrap();
    fs::write(
        dataset.join("carbs.jsonl"),
        format!("{{\"timestamp\":\"{}\",\"amount\":30.0}}\n", timestamp(18)),
    )
    .unwrap();

    if with_profile {
        fs::write(
            dataset.join("profiles.json"),
            r#"[{"valid_from":"2024-02-29T00:00:00Z","isf":50.0,"carb_ratio":10.0,"basal":1.0,"dia_hours":5.0}]"#,
        )
        .unwrap();
    }
}

fn run(data_dir: &Path, config: &Path) -> Command {
    let mut cmd = cli();
    cmd.arg("run")
        .arg("--data-dir")
        .arg(data_dir)
        .arg("--config")
        .arg(config)
        .arg("--now")
        .arg(NOW);
    cmd
}

#[test]
fn test_cli_help() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Autosens sensitivity and carbs-on-board detection",
        ));
}

#[test]
fn test_run_computes_and_persists_table() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();
    let config = empty_config(temp_dir.path());
    write_dataset(&data_dir, 40, true);

    run(&data_dir, &config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Computed: 37, reused: 0"))
        .stdout(predicate::str::contains("Sensitivity: ratio"));

    let table_path = data_dir.join("state/autosens_table.json");
    assert!(table_path.exists());
    let contents = fs::read_to_string(&table_path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
    assert_eq!(parsed["resolution_secs"], 60);
    assert_eq!(parsed["records"].as_array().unwrap().len(), 37);
}

#[test]
fn test_second_run_reuses_cached_records() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();
    let config = empty_config(temp_dir.path());
    write_dataset(&data_dir, 40, true);

    run(&data_dir, &config).assert().success();
    let first = fs::read_to_string(data_dir.join("state/autosens_table.json")).unwrap();

    run(&data_dir, &config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Computed: 0, reused: 37"));
    let second = fs::read_to_string(data_dir.join("state/autosens_table.json")).unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_new_readings_extend_table() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();
    let config = empty_config(temp_dir.path());

    write_dataset(&data_dir, 30, true);
    run(&data_dir, &config).assert().success();

    write_dataset(&data_dir, 40, true);
    run(&data_dir, &config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Computed: 10, reused: 27"));
}

#[test]
fn test_window_end_limits_run() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();
    let config = empty_config(temp_dir.path());
    write_dataset(&data_dir, 40, true);

    run(&data_dir, &config)
        .arg("--end")
        .arg(timestamp(12))
        .assert()
        .success()
        .stdout(predicate::str::contains("Computed: 10, reused: 0"));
}

#[test]
fn test_limit_to_oldest_available_data() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();
    let config = empty_config(temp_dir.path());
    write_dataset(&data_dir, 40, true);

    // oldest treatment data is the activity sample at 01:00
    run(&data_dir, &config)
        .arg("--limit-to-oldest")
        .assert()
        .success()
        .stdout(predicate::str::contains("Computed: 25, reused: 0"));
}

#[test]
fn test_weighted_detector() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();
    let config = empty_config(temp_dir.path());
    write_dataset(&data_dir, 40, true);

    run(&data_dir, &config)
        .arg("--detector")
        .arg("weighted")
        .assert()
        .success()
        .stdout(predicate::str::contains("Computed: 37"));
}

#[test]
fn test_unknown_detector_fails() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();
    let config = empty_config(temp_dir.path());
    write_dataset(&data_dir, 40, true);

    run(&data_dir, &config)
        .arg("--detector")
        .arg("bogus")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown detector"));
}

#[test]
fn test_missing_profile_reports_no_valid_profile() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();
    let config = empty_config(temp_dir.path());
    write_dataset(&data_dir, 40, false);

    run(&data_dir, &config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("No valid profile"));

    assert!(!data_dir.join("state/autosens_table.json").exists());
}

#[test]
fn test_too_few_buckets_reports_insufficient_data() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();
    let config = empty_config(temp_dir.path());
    write_dataset(&data_dir, 2, true);

    run(&data_dir, &config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("No bucketed data available"));
}

#[test]
fn test_missing_dataset_fails() {
    let temp_dir = setup_test_dir();
    let config = empty_config(temp_dir.path());

    run(temp_dir.path(), &config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("No glucose readings found"));
}

#[test]
fn test_show_prints_newest_records() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();
    let config = empty_config(temp_dir.path());
    write_dataset(&data_dir, 40, true);
    run(&data_dir, &config).assert().success();

    let output = cli()
        .arg("show")
        .arg("--last")
        .arg("3")
        .arg("--data-dir")
        .arg(&data_dir)
        .arg("--config")
        .arg(&config)
        .output()
        .unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("avgdev"));
    let rows: Vec<&str> = stdout.lines().filter(|l| l.starts_with("2024-03-01T")).collect();
    assert_eq!(rows.len(), 3);
    assert!(rows[2].starts_with("2024-03-01T03:15:00"));
}

#[test]
fn test_show_without_table() {
    let temp_dir = setup_test_dir();
    let config = empty_config(temp_dir.path());

    cli()
        .arg("show")
        .arg("--data-dir")
        .arg(temp_dir.path())
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("No autosens records yet"));
}

#[test]
fn test_export_writes_csv() {
    let temp_dir = setup_test_dir();
    let data_dir = temp_dir.path().to_path_buf();
    let config = empty_config(temp_dir.path());
    write_dataset(&data_dir, 40, true);
    run(&data_dir, &config).assert().success();

    let out = data_dir.join("reports/autosens.csv");
    cli()
        .arg("export")
        .arg("--out")
        .arg(&out)
        .arg("--data-dir")
        .arg(&data_dir)
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("Exported 37 records to CSV"));

    let csv_content = fs::read_to_string(&out).unwrap();
    assert_eq!(csv_content.lines().count(), 38);
    assert!(csv_content.starts_with("time,bg,delta"));
    assert!(csv_content.contains("[30g]C"));
}
