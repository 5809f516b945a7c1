//! Pipeline configuration and source file discovery.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::features::FEATURE_SCHEMA_VERSION;

pub const MIN_FIRE_TOLERANCE_DAYS: i64 = 60;
pub const MAX_FIRE_TOLERANCE_DAYS: i64 = 180;

const FIRES_FILE: &str = "fires.csv";
const SUPPLIES_FILE: &str = "supplies.csv";
const TEMPERATURE_FILE: &str = "temperature.csv";
const WEATHER_PREFIX: &str = "weather_data_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureThresholds {
    pub critical: f64,
    pub high: f64,
    pub warm: f64,
}

impl Default for TemperatureThresholds {
    fn default() -> Self {
        Self {
            critical: 60.0,
            high: 45.0,
            warm: 35.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum look-ahead from a measurement to the fire it is labeled with.
    pub fire_tolerance_days: i64,
    /// Training rows keep labels in `[0, horizon_days]`.
    pub horizon_days: i64,
    pub rolling_points: Vec<u32>,
    pub rolling_days: Vec<u32>,
    pub lag_steps: Vec<u32>,
    pub velocity_span: u32,
    pub thresholds: TemperatureThresholds,
    pub min_training_samples: usize,
    /// Calendar used when a raw timestamp carries an explicit UTC offset.
    pub site_timezone: Tz,
    pub schema_version: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fire_tolerance_days: 120,
            horizon_days: 60,
            rolling_points: vec![3],
            rolling_days: vec![3, 7, 14],
            lag_steps: vec![1, 3],
            velocity_span: 3,
            thresholds: TemperatureThresholds::default(),
            min_training_samples: 10,
            site_timezone: Tz::UTC,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid pipeline config: {0}")]
    Invalid(String),
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_FIRE_TOLERANCE_DAYS..=MAX_FIRE_TOLERANCE_DAYS).contains(&self.fire_tolerance_days)
        {
            return Err(ConfigError::Invalid(format!(
                "fire_tolerance_days must be within {MIN_FIRE_TOLERANCE_DAYS}..={MAX_FIRE_TOLERANCE_DAYS}, got {}",
                self.fire_tolerance_days
            )));
        }
        if self.horizon_days < 0 {
            return Err(ConfigError::Invalid(
                "horizon_days must be >= 0".to_string(),
            ));
        }
        if self.velocity_span == 0 {
            return Err(ConfigError::Invalid(
                "velocity_span must be > 0".to_string(),
            ));
        }
        if self.schema_version != FEATURE_SCHEMA_VERSION {
            return Err(ConfigError::Invalid(format!(
                "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
            )));
        }
        validate_windows("rolling_points", &self.rolling_points)?;
        validate_windows("rolling_days", &self.rolling_days)?;
        validate_windows("lag_steps", &self.lag_steps)?;

        if self.horizon_days > self.fire_tolerance_days {
            warn!(
                component = "config",
                event = "config.horizon_exceeds_tolerance",
                horizon_days = self.horizon_days,
                fire_tolerance_days = self.fire_tolerance_days
            );
        }

        Ok(())
    }
}

fn validate_windows(name: &str, windows: &[u32]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for window in windows {
        if *window == 0 {
            return Err(ConfigError::Invalid(format!("{name} entries must be > 0")));
        }
        if !seen.insert(*window) {
            return Err(ConfigError::Invalid(format!(
                "{name} entries must be unique"
            )));
        }
    }
    Ok(())
}

pub fn pipeline_config_from_env() -> PipelineConfig {
    let mut config = PipelineConfig::default();

    if let Some(days) = env_parse::<i64>("COALFIRE_FIRE_TOLERANCE_DAYS") {
        config.fire_tolerance_days = days;
    }
    if let Some(days) = env_parse::<i64>("COALFIRE_HORIZON_DAYS") {
        config.horizon_days = days;
    }
    if let Some(min_samples) = env_parse::<usize>("COALFIRE_MIN_SAMPLES") {
        config.min_training_samples = min_samples;
    }
    if let Some(tz) = env_parse::<Tz>("COALFIRE_TIMEZONE") {
        config.site_timezone = tz;
    }

    config
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(
                component = "config",
                event = "config.env.ignored",
                var = name,
                value = trimmed
            );
            None
        }
    }
}

/// Locations of the four raw sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePaths {
    pub data_dir: PathBuf,
    pub fires: PathBuf,
    pub supplies: PathBuf,
    pub temperature: PathBuf,
    /// Sorted by file name; names encode the covered date range.
    pub weather: Vec<PathBuf>,
}

impl SourcePaths {
    pub fn from_data_dir(data_dir: &Path) -> std::io::Result<Self> {
        let mut weather = Vec::new();
        if data_dir.is_dir() {
            for entry in fs::read_dir(data_dir)? {
                let path = entry?.path();
                let is_weather = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| {
                        name.starts_with(WEATHER_PREFIX) && name.to_ascii_lowercase().ends_with(".csv")
                    })
                    .unwrap_or(false);
                if is_weather {
                    weather.push(path);
                }
            }
        }
        weather.sort();

        info!(
            component = "config",
            event = "config.sources.discovered",
            data_dir = %data_dir.display(),
            weather_files = weather.len()
        );

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            fires: data_dir.join(FIRES_FILE),
            supplies: data_dir.join(SUPPLIES_FILE),
            temperature: data_dir.join(TEMPERATURE_FILE),
            weather,
        })
    }

    pub fn weather_pattern(&self) -> PathBuf {
        self.data_dir.join(format!("{WEATHER_PREFIX}*.csv"))
    }
}
