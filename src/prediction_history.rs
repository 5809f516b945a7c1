//! JSON-lines prediction history.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{Prediction, RiskLevel};
use crate::records::StockpileKey;

#[derive(Debug, Error)]
pub enum PredictionHistoryError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub storage_id: String,
    pub stack_id: String,
    pub measured_at: NaiveDateTime,
    pub predicted_at: NaiveDateTime,
    pub predicted_days: f64,
    pub confidence: f64,
    pub risk: RiskLevel,
    pub predicted_date: NaiveDate,
}

impl PredictionRecord {
    pub fn new(
        key: &StockpileKey,
        measured_at: NaiveDateTime,
        predicted_at: NaiveDateTime,
        prediction: &Prediction,
    ) -> Self {
        Self {
            storage_id: key.storage_id.clone(),
            stack_id: key.stack_id.clone(),
            measured_at,
            predicted_at,
            predicted_days: prediction.predicted_days,
            confidence: prediction.confidence,
            risk: prediction.risk,
            predicted_date: prediction.predicted_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecentPredictions {
    pub records: Vec<PredictionRecord>,
    pub malformed_lines: u64,
}

pub fn append_predictions(
    path: &Path,
    records: &[PredictionRecord],
) -> Result<(), PredictionHistoryError> {
    if records.is_empty() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut buffer = Vec::new();
    for record in records {
        serde_json::to_writer(&mut buffer, record)?;
        buffer.push(b'\n');
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&buffer)?;
    file.sync_all()?;

    info!(
        component = "prediction_history",
        event = "prediction_history.appended",
        path = %path.display(),
        records = records.len()
    );
    Ok(())
}

/// Last `limit` well-formed records, oldest first. A missing file is an
/// empty history.
pub fn read_recent_predictions(
    path: &Path,
    limit: usize,
) -> Result<RecentPredictions, PredictionHistoryError> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(RecentPredictions::default()),
        Err(err) => return Err(err.into()),
    };

    let mut recent = RecentPredictions::default();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<PredictionRecord>(&line) {
            Ok(record) => recent.records.push(record),
            Err(_) => recent.malformed_lines += 1,
        }
    }

    if recent.records.len() > limit {
        let excess = recent.records.len() - limit;
        recent.records.drain(..excess);
    }
    if recent.malformed_lines > 0 {
        warn!(
            component = "prediction_history",
            event = "prediction_history.lines.skipped",
            path = %path.display(),
            malformed = recent.malformed_lines
        );
    }
    Ok(recent)
}
