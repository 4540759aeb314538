//! Configuration file support for autosens.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/autosens/config.toml`.
//! Every field has a default, so a partial file only overrides what it names.

use crate::{Error, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub carbs: CarbsConfig,

    #[serde(default)]
    pub sensitivity: SensitivityConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Recurrence engine parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Width of one glucose bucket
    #[serde(default = "default_bucket_minutes")]
    pub bucket_minutes: i64,

    /// Grid that table keys are rounded up to
    #[serde(default = "default_key_resolution_secs")]
    pub key_resolution_secs: i64,

    /// Glucose values below this are sensor errors (mg/dL)
    #[serde(default = "default_sensor_floor")]
    pub sensor_floor: f64,

    /// Deviations closer to zero than this classify as "="
    #[serde(default = "default_deviation_equal_tolerance")]
    pub deviation_equal_tolerance: f64,

    /// Insulin action time used when no profile resolves at the window end
    #[serde(default = "default_dia_hours")]
    pub default_dia_hours: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bucket_minutes: default_bucket_minutes(),
            key_resolution_secs: default_key_resolution_secs(),
            sensor_floor: default_sensor_floor(),
            deviation_equal_tolerance: default_deviation_equal_tolerance(),
            default_dia_hours: default_dia_hours(),
        }
    }
}

impl EngineConfig {
    pub fn bucket_width(&self) -> Duration {
        Duration::minutes(self.bucket_minutes)
    }

    pub fn key_resolution(&self) -> Duration {
        Duration::seconds(self.key_resolution_secs)
    }
}

/// Carbohydrate absorption parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CarbsConfig {
    /// Floor absorption rate in mg/dL per bucket for the fixed model
    #[serde(default = "default_min_5m_carb_impact")]
    pub min_5m_carb_impact: f64,

    /// Horizon after which an entry is considered fully absorbed
    #[serde(default = "default_max_absorption_hours")]
    pub max_absorption_hours: f64,
}

impl Default for CarbsConfig {
    fn default() -> Self {
        Self {
            min_5m_carb_impact: default_min_5m_carb_impact(),
            max_absorption_hours: default_max_absorption_hours(),
        }
    }
}

/// Which sensitivity detector a run uses
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    #[default]
    Fixed,
    Weighted,
}

impl std::str::FromStr for DetectorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fixed" | "oref1" | "classic" => Ok(DetectorKind::Fixed),
            "weighted" | "weighted_average" => Ok(DetectorKind::Weighted),
            other => Err(Error::Config(format!("Unknown detector: {}", other))),
        }
    }
}

/// Sensitivity detection parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensitivityConfig {
    #[serde(default)]
    pub detector: DetectorKind,

    #[serde(default = "default_autosens_min")]
    pub autosens_min: f64,

    #[serde(default = "default_autosens_max")]
    pub autosens_max: f64,

    #[serde(default = "default_hours_for_detection")]
    pub hours_for_detection: f64,
}

impl Default for SensitivityConfig {
    fn default() -> Self {
        Self {
            detector: DetectorKind::default(),
            autosens_min: default_autosens_min(),
            autosens_max: default_autosens_max(),
            hours_for_detection: default_hours_for_detection(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("autosens")
}

fn default_bucket_minutes() -> i64 {
    5
}

fn default_key_resolution_secs() -> i64 {
    60
}

fn default_sensor_floor() -> f64 {
    39.0
}

fn default_deviation_equal_tolerance() -> f64 {
    2.0
}

fn default_dia_hours() -> f64 {
    5.0
}

fn default_min_5m_carb_impact() -> f64 {
    3.0
}

fn default_max_absorption_hours() -> f64 {
    6.0
}

fn default_autosens_min() -> f64 {
    0.7
}

fn default_autosens_max() -> f64 {
    1.2
}

fn default_hours_for_detection() -> f64 {
    8.0
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("autosens").join("config.toml")
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.engine.bucket_minutes <= 0 {
            return Err(Error::Config("bucket_minutes must be positive".into()));
        }
        if self.engine.key_resolution_secs <= 0 {
            return Err(Error::Config("key_resolution_secs must be positive".into()));
        }
        if self.engine.key_resolution_secs > self.engine.bucket_minutes * 60 {
            return Err(Error::Config(
                "key_resolution_secs must not exceed the bucket width".into(),
            ));
        }
        if self.carbs.max_absorption_hours <= 0.0 {
            return Err(Error::Config("max_absorption_hours must be positive".into()));
        }
        if self.carbs.min_5m_carb_impact < 0.0 {
            return Err(Error::Config("min_5m_carb_impact must not be negative".into()));
        }
        if self.sensitivity.autosens_min > self.sensitivity.autosens_max {
            return Err(Error::Config(format!(
                "autosens_min ({}) is above autosens_max ({})",
                self.sensitivity.autosens_min, self.sensitivity.autosens_max
            )));
        }
        if self.sensitivity.hours_for_detection <= 0.0 {
            return Err(Error::Config("hours_for_detection must be positive".into()));
        }
        Ok(())
    }
}
