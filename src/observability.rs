//! Shared logging configuration and initialization.

use std::env;

use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::PipelineConfig;
use crate::serving::PipelineReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Ok(level) = env::var("COALFIRE_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Ok(format) = env::var("COALFIRE_LOG_FORMAT") {
        if let Some(parsed) = parse_log_format(&format) {
            config.format = parsed;
        }
    }

    if let Ok(include_target) = env::var("COALFIRE_LOG_TARGET") {
        if let Some(parsed) = parse_bool(&include_target) {
            config.include_target = parsed;
        }
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(component: &str, config: &LoggingConfig) {
    info!(
        component,
        event = "app.start",
        log_level = %config.level,
        log_format = ?config.format,
        include_target = config.include_target
    );
}

pub fn log_pipeline_config(cfg: &PipelineConfig) {
    info!(
        component = "pipeline",
        event = "pipeline.config",
        fire_tolerance_days = cfg.fire_tolerance_days,
        horizon_days = cfg.horizon_days,
        rolling_points = ?cfg.rolling_points,
        rolling_days = ?cfg.rolling_days,
        lag_steps = ?cfg.lag_steps,
        min_training_samples = cfg.min_training_samples,
        site_timezone = %cfg.site_timezone
    );
}

/// One line summarizing where rows went, warned when anything was lost.
pub fn log_pipeline_summary(report: &PipelineReport) {
    let ingest_dropped = report
        .ingest
        .as_ref()
        .map(|ingest| ingest.total_dropped())
        .unwrap_or(0);
    let association = &report.association;
    let samples = &report.samples;
    let lost = ingest_dropped
        + association.dropped_integrity
        + samples.outside_horizon
        + samples.same_day_duplicates;

    if lost > 0 {
        warn!(
            component = "pipeline",
            event = "pipeline.summary",
            ingest_dropped,
            measurements = association.measurements_total,
            labeled = association.labeled,
            unlabeled_no_fire = association.unlabeled_no_fire,
            unlabeled_out_of_tolerance = association.unlabeled_out_of_tolerance,
            integrity_dropped = association.dropped_integrity,
            outside_horizon = samples.outside_horizon,
            same_day_duplicates = samples.same_day_duplicates,
            samples = samples.kept
        );
    } else {
        info!(
            component = "pipeline",
            event = "pipeline.summary",
            measurements = association.measurements_total,
            labeled = association.labeled,
            samples = samples.kept
        );
    }
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
