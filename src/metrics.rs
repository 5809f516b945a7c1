//! Error statistics and the persisted training metrics record.

use std::fs;
use std::path::Path;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::features::median;
use crate::model::{write_atomic, ModelError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub mae: f64,
    pub rmse: f64,
    pub median_ae: f64,
    pub r2: f64,
    pub accuracy_within_1_day: f64,
    pub accuracy_within_2_days: f64,
    pub accuracy_within_3_days: f64,
    pub accuracy_within_7_days: f64,
    pub p90_error: f64,
    pub sample_count: u64,
    pub feature_count: u64,
    pub trained_at: NaiveDateTime,
}

impl TrainingMetrics {
    /// `trained_at` comes from the caller; nothing here reads the clock.
    pub fn from_predictions(
        truth: &[f64],
        predicted: &[f64],
        feature_count: usize,
        trained_at: NaiveDateTime,
    ) -> Self {
        let errors = absolute_errors(truth, predicted);
        Self {
            mae: mean_absolute_error(truth, predicted),
            rmse: root_mean_squared_error(truth, predicted),
            median_ae: median(errors.clone()).unwrap_or(0.0),
            r2: r2_score(truth, predicted),
            accuracy_within_1_day: accuracy_within(truth, predicted, 1.0),
            accuracy_within_2_days: accuracy_within(truth, predicted, 2.0),
            accuracy_within_3_days: accuracy_within(truth, predicted, 3.0),
            accuracy_within_7_days: accuracy_within(truth, predicted, 7.0),
            p90_error: percentile(errors, 90.0).unwrap_or(0.0),
            sample_count: truth.len().min(predicted.len()) as u64,
            feature_count: feature_count as u64,
            trained_at,
        }
    }
}

fn absolute_errors(truth: &[f64], predicted: &[f64]) -> Vec<f64> {
    truth
        .iter()
        .zip(predicted)
        .map(|(t, p)| (t - p).abs())
        .collect()
}

pub fn mean_absolute_error(truth: &[f64], predicted: &[f64]) -> f64 {
    let errors = absolute_errors(truth, predicted);
    if errors.is_empty() {
        return 0.0;
    }
    errors.iter().sum::<f64>() / errors.len() as f64
}

pub fn root_mean_squared_error(truth: &[f64], predicted: &[f64]) -> f64 {
    let errors = absolute_errors(truth, predicted);
    if errors.is_empty() {
        return 0.0;
    }
    (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt()
}

/// Fraction of predictions within `days` of the truth, inclusive.
pub fn accuracy_within(truth: &[f64], predicted: &[f64], days: f64) -> f64 {
    let errors = absolute_errors(truth, predicted);
    if errors.is_empty() {
        return 0.0;
    }
    errors.iter().filter(|e| **e <= days).count() as f64 / errors.len() as f64
}

/// Coefficient of determination. A constant target scores 1.0 when predicted
/// exactly and 0.0 otherwise.
pub fn r2_score(truth: &[f64], predicted: &[f64]) -> f64 {
    let n = truth.len().min(predicted.len());
    if n == 0 {
        return 0.0;
    }
    let mean = truth[..n].iter().sum::<f64>() / n as f64;
    let ss_tot: f64 = truth[..n].iter().map(|t| (t - mean) * (t - mean)).sum();
    let ss_res: f64 = truth
        .iter()
        .zip(predicted)
        .map(|(t, p)| (t - p) * (t - p))
        .sum();
    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

/// Linear-interpolated percentile, `q` in `[0, 100]`.
pub fn percentile(mut values: Vec<f64>, q: f64) -> Option<f64> {
    values.retain(|v| !v.is_nan());
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let rank = (q.clamp(0.0, 100.0) / 100.0) * (values.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    Some(values[lower] + (values[upper] - values[lower]) * weight)
}

pub fn write_metrics(path: &Path, metrics: &TrainingMetrics) -> Result<(), ModelError> {
    let bytes = serde_json::to_vec_pretty(metrics)?;
    write_atomic(path, &bytes)?;
    Ok(())
}

pub fn read_metrics(path: &Path) -> Result<TrainingMetrics, ModelError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
