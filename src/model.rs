//! Model boundary: regressor traits, persisted artifacts, the shared model
//! cache, prediction post-processing and budgeted hyperparameter search.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::features::{FeatureContext, FeatureSchema, FEATURE_SCHEMA_VERSION};
use crate::metrics::{accuracy_within, mean_absolute_error, TrainingMetrics};
use crate::serving::TrainingSet;

pub const ARTIFACT_FORMAT_VERSION: u32 = 1;
pub const CV_FOLDS: usize = 5;
pub const CV_ACCURACY_TOLERANCE_DAYS: f64 = 2.0;
const HOLDOUT_FRACTION: f64 = 0.2;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model not trained")]
    NotTrained,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("model fit failed: {0}")]
    Fit(String),
    #[error("corrupt model artifact: {0}")]
    Corrupt(String),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

/// Opaque hyperparameters handed to a [`Regressor`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HyperParams {
    pub values: BTreeMap<String, f64>,
}

impl HyperParams {
    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.values.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

pub trait TrainedModel: Send + Sync {
    fn predict(&self, features: &[f64]) -> f64;
    fn to_bytes(&self) -> Result<Vec<u8>, ModelError>;
}

/// Fit/predict black box. Implementations live outside the fusion core.
pub trait Regressor: Send + Sync {
    fn name(&self) -> &str;
    fn fit(
        &self,
        features: &[Vec<f64>],
        labels: &[f64],
        params: &HyperParams,
    ) -> Result<Box<dyn TrainedModel>, ModelError>;
    fn load(&self, bytes: &[u8]) -> Result<Box<dyn TrainedModel>, ModelError>;
}

/// Ridge regression on standardized features; a dependency-free baseline.
///
/// Reads the `l2` hyperparameter (default 1.0).
#[derive(Debug, Clone, Copy, Default)]
pub struct RidgeRegressor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RidgeModel {
    means: Vec<f64>,
    scales: Vec<f64>,
    weights: Vec<f64>,
    intercept: f64,
}

impl TrainedModel for RidgeModel {
    fn predict(&self, features: &[f64]) -> f64 {
        self.intercept
            + features
                .iter()
                .zip(self.means.iter().zip(&self.scales))
                .zip(&self.weights)
                .map(|((x, (mean, scale)), w)| w * (x - mean) / scale)
                .sum::<f64>()
    }

    fn to_bytes(&self) -> Result<Vec<u8>, ModelError> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Regressor for RidgeRegressor {
    fn name(&self) -> &str {
        "ridge"
    }

    fn fit(
        &self,
        features: &[Vec<f64>],
        labels: &[f64],
        params: &HyperParams,
    ) -> Result<Box<dyn TrainedModel>, ModelError> {
        let l2 = params.get("l2").unwrap_or(1.0);
        if l2 <= 0.0 || !l2.is_finite() {
            return Err(ModelError::Fit(format!("l2 must be > 0, got {l2}")));
        }
        if features.is_empty() || features.len() != labels.len() {
            return Err(ModelError::Fit(format!(
                "need matching non-empty inputs, got {} rows and {} labels",
                features.len(),
                labels.len()
            )));
        }

        let n = features.len() as f64;
        let dim = features[0].len();
        if features.iter().any(|row| row.len() != dim) {
            return Err(ModelError::Fit("ragged feature matrix".to_string()));
        }

        let mut means = vec![0.0; dim];
        for row in features {
            for (m, x) in means.iter_mut().zip(row) {
                *m += x / n;
            }
        }
        let mut scales = vec![0.0; dim];
        for row in features {
            for ((s, x), m) in scales.iter_mut().zip(row).zip(&means) {
                *s += (x - m) * (x - m) / n;
            }
        }
        for s in &mut scales {
            *s = if *s > 1e-12 { s.sqrt() } else { 1.0 };
        }
        let intercept = labels.iter().sum::<f64>() / n;

        // Normal equations (Z^T Z + l2 I) w = Z^T (y - mean(y)).
        let mut gram = vec![vec![0.0; dim]; dim];
        let mut rhs = vec![0.0; dim];
        for (row, y) in features.iter().zip(labels) {
            let z: Vec<f64> = row
                .iter()
                .zip(means.iter().zip(&scales))
                .map(|(x, (m, s))| (x - m) / s)
                .collect();
            for i in 0..dim {
                rhs[i] += z[i] * (y - intercept);
                for j in 0..dim {
                    gram[i][j] += z[i] * z[j];
                }
            }
        }
        for (i, row) in gram.iter_mut().enumerate() {
            row[i] += l2;
        }

        let weights = solve_linear(gram, rhs)
            .ok_or_else(|| ModelError::Fit("singular normal equations".to_string()))?;

        Ok(Box::new(RidgeModel {
            means,
            scales,
            weights,
            intercept,
        }))
    }

    fn load(&self, bytes: &[u8]) -> Result<Box<dyn TrainedModel>, ModelError> {
        let model: RidgeModel = serde_json::from_slice(bytes)?;
        Ok(Box::new(model))
    }
}

/// Gaussian elimination with partial pivoting.
fn solve_linear(mut a: Vec<Vec<f64>>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    for col in 0..n {
        let pivot = (col..n).max_by(|x, y| a[*x][col].abs().total_cmp(&a[*y][col].abs()))?;
        if a[pivot][col].abs() < 1e-12 {
            return None;
        }
        a.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..n {
            let factor = a[row][col] / a[col][col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row][k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row][row];
    }
    Some(x)
}

/// Everything needed to serve a trained model, persisted together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub format_version: u32,
    pub regressor: String,
    /// Hex-encoded bytes from [`TrainedModel::to_bytes`].
    pub model_hex: String,
    pub schema: FeatureSchema,
    pub context: FeatureContext,
    pub context_fingerprint: String,
    pub params: HyperParams,
    pub metrics: Option<TrainingMetrics>,
}

impl ModelArtifact {
    pub fn model_bytes(&self) -> Result<Vec<u8>, ModelError> {
        hex::decode(&self.model_hex).map_err(|err| ModelError::Corrupt(err.to_string()))
    }

    fn verify(&self) -> Result<(), ModelError> {
        if self.schema.version != FEATURE_SCHEMA_VERSION {
            return Err(ModelError::SchemaVersionMismatch {
                expected: FEATURE_SCHEMA_VERSION,
                actual: self.schema.version,
            });
        }
        let actual = self.context.fingerprint();
        if actual != self.context_fingerprint {
            return Err(ModelError::Corrupt(format!(
                "feature context fingerprint {actual} does not match recorded {}",
                self.context_fingerprint
            )));
        }
        Ok(())
    }
}

/// Trains on the full set and records holdout metrics from a temporal split.
pub fn train_model(
    regressor: &dyn Regressor,
    set: &TrainingSet,
    params: &HyperParams,
    trained_at: NaiveDateTime,
) -> Result<(ModelArtifact, Box<dyn TrainedModel>), ModelError> {
    let n = set.len();
    if n == 0 {
        return Err(ModelError::Fit("empty training set".to_string()));
    }

    let holdout = ((n as f64 * HOLDOUT_FRACTION).round() as usize).clamp(1, n);
    let split = n - holdout;
    let metrics = if split == 0 {
        warn!(
            component = "model",
            event = "model.metrics.in_sample",
            samples = n
        );
        let model = regressor.fit(&set.features, &set.labels, params)?;
        let predictions: Vec<f64> = set.features.iter().map(|row| model.predict(row)).collect();
        TrainingMetrics::from_predictions(&set.labels, &predictions, set.schema.columns.len(), trained_at)
    } else {
        let model = regressor.fit(&set.features[..split], &set.labels[..split], params)?;
        let predictions: Vec<f64> = set.features[split..]
            .iter()
            .map(|row| model.predict(row).max(0.0))
            .collect();
        TrainingMetrics::from_predictions(
            &set.labels[split..],
            &predictions,
            set.schema.columns.len(),
            trained_at,
        )
    };

    let model = regressor.fit(&set.features, &set.labels, params)?;
    let artifact = ModelArtifact {
        format_version: ARTIFACT_FORMAT_VERSION,
        regressor: regressor.name().to_string(),
        model_hex: hex::encode(model.to_bytes()?),
        schema: set.schema.clone(),
        context: set.context.clone(),
        context_fingerprint: set.context.fingerprint(),
        params: params.clone(),
        metrics: Some(metrics),
    };

    info!(
        component = "model",
        event = "model.trained",
        regressor = regressor.name(),
        samples = n,
        holdout,
        fingerprint = %artifact.schema.fingerprint
    );
    Ok((artifact, model))
}

pub fn save_artifact(path: &Path, artifact: &ModelArtifact) -> Result<(), ModelError> {
    let bytes = serde_json::to_vec_pretty(artifact)?;
    write_atomic(path, &bytes)?;
    info!(
        component = "model",
        event = "model.artifact.saved",
        path = %path.display(),
        bytes = bytes.len()
    );
    Ok(())
}

/// Missing files surface as [`ModelError::NotTrained`].
pub fn load_artifact(path: &Path) -> Result<ModelArtifact, ModelError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(ModelError::NotTrained),
        Err(err) => return Err(err.into()),
    };
    let artifact: ModelArtifact = serde_json::from_slice(&bytes)?;
    artifact.verify()?;
    Ok(artifact)
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid output path: {}", path.display()),
            )
        })?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

/// An artifact together with its deserialized model.
pub struct LoadedModel {
    pub artifact: ModelArtifact,
    pub model: Box<dyn TrainedModel>,
}

impl LoadedModel {
    pub fn from_artifact(
        artifact: ModelArtifact,
        regressor: &dyn Regressor,
    ) -> Result<Self, ModelError> {
        let model = regressor.load(&artifact.model_bytes()?)?;
        Ok(Self { artifact, model })
    }
}

/// Process-wide read-only model snapshot, swapped whole on retrain.
#[derive(Default)]
pub struct ModelCache {
    inner: RwLock<Option<Arc<LoadedModel>>>,
}

impl ModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Result<Arc<LoadedModel>, ModelError> {
        self.inner
            .read()
            .expect("model cache lock should not be poisoned")
            .clone()
            .ok_or(ModelError::NotTrained)
    }

    pub fn replace(&self, loaded: LoadedModel) {
        let mut guard = self
            .inner
            .write()
            .expect("model cache lock should not be poisoned");
        *guard = Some(Arc::new(loaded));
    }

    /// Loads and fully deserializes before swapping; the previous snapshot
    /// stays in place if anything fails.
    pub fn load_from_path(&self, path: &Path, regressor: &dyn Regressor) -> Result<(), ModelError> {
        let artifact = load_artifact(path)?;
        let loaded = LoadedModel::from_artifact(artifact, regressor)?;
        self.replace(loaded);
        info!(
            component = "model",
            event = "model.cache.swapped",
            path = %path.display()
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
    Minimal,
}

impl RiskLevel {
    pub fn from_days(days: f64) -> Self {
        if days <= 7.0 {
            Self::Critical
        } else if days <= 14.0 {
            Self::High
        } else if days <= 30.0 {
            Self::Medium
        } else if days <= 60.0 {
            Self::Low
        } else {
            Self::Minimal
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Minimal => "minimal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_days: f64,
    pub confidence: f64,
    pub risk: RiskLevel,
    pub predicted_date: NaiveDate,
}

/// Logistic in temperature: hotter piles give more confident predictions.
pub fn confidence_from_temperature(temperature: f64) -> f64 {
    0.4 + 0.55 / (1.0 + (-(temperature - 45.0) / 10.0).exp())
}

pub fn predict_with_confidence(
    raw_days: f64,
    temperature: f64,
    measured_at: NaiveDateTime,
) -> Prediction {
    let predicted_days = if raw_days.is_finite() {
        raw_days.max(0.0)
    } else {
        0.0
    };
    Prediction {
        predicted_days,
        confidence: confidence_from_temperature(temperature),
        risk: RiskLevel::from_days(predicted_days),
        predicted_date: measured_at.date() + Duration::days(predicted_days.round() as i64),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CvScore {
    pub accuracy_within_2_days: f64,
    pub mae: f64,
}

impl CvScore {
    fn beats(&self, other: &CvScore) -> bool {
        self.accuracy_within_2_days > other.accuracy_within_2_days
            || (self.accuracy_within_2_days == other.accuracy_within_2_days && self.mae < other.mae)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TuneBudget {
    pub max_trials: usize,
    pub deadline: Option<Instant>,
}

impl TuneBudget {
    fn exhausted(&self, trials_started: usize) -> bool {
        trials_started >= self.max_trials
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneOutcome {
    pub params: HyperParams,
    pub score: Option<CvScore>,
    pub trials_completed: usize,
    pub trials_failed: usize,
    pub used_fallback: bool,
}

/// Expanding-window folds: each test block follows all of its training rows.
pub fn time_series_folds(n: usize, folds: usize) -> Vec<(std::ops::Range<usize>, std::ops::Range<usize>)> {
    if folds == 0 || n < folds + 1 {
        return Vec::new();
    }
    let test_size = n / (folds + 1);
    (0..folds)
        .map(|k| {
            let test_start = n - (folds - k) * test_size;
            (0..test_start, test_start..test_start + test_size)
        })
        .collect()
}

pub fn cross_validate(
    regressor: &dyn Regressor,
    features: &[Vec<f64>],
    labels: &[f64],
    params: &HyperParams,
) -> Result<CvScore, ModelError> {
    let folds = time_series_folds(labels.len(), CV_FOLDS);
    if folds.is_empty() {
        return Err(ModelError::Fit(format!(
            "need at least {} samples for {CV_FOLDS}-fold time-series CV",
            CV_FOLDS + 1
        )));
    }

    let mut truth = Vec::new();
    let mut predicted = Vec::new();
    for (train, test) in folds {
        let model = regressor.fit(&features[train.clone()], &labels[train], params)?;
        for idx in test {
            truth.push(labels[idx]);
            predicted.push(model.predict(&features[idx]).max(0.0));
        }
    }

    Ok(CvScore {
        accuracy_within_2_days: accuracy_within(&truth, &predicted, CV_ACCURACY_TOLERANCE_DAYS),
        mae: mean_absolute_error(&truth, &predicted),
    })
}

/// Budgeted search over `candidates`; falls back to `last_known_good` when
/// no trial completes.
pub fn tune(
    regressor: &dyn Regressor,
    features: &[Vec<f64>],
    labels: &[f64],
    candidates: &[HyperParams],
    last_known_good: &HyperParams,
    budget: TuneBudget,
) -> TuneOutcome {
    let mut best: Option<(HyperParams, CvScore)> = None;
    let mut started = 0;
    let mut failed = 0;

    for candidate in candidates {
        if budget.exhausted(started) {
            info!(
                component = "model",
                event = "model.tune.budget_exhausted",
                trials_started = started
            );
            break;
        }
        started += 1;

        match cross_validate(regressor, features, labels, candidate) {
            Ok(score) => {
                let improves = best.as_ref().map_or(true, |(_, current)| score.beats(current));
                if improves {
                    best = Some((candidate.clone(), score));
                }
            }
            Err(err) => {
                failed += 1;
                warn!(
                    component = "model",
                    event = "model.tune.trial_failed",
                    trial = started,
                    error = %err
                );
            }
        }
    }

    let completed = started - failed;
    match best {
        Some((params, score)) => {
            info!(
                component = "model",
                event = "model.tune.done",
                trials_completed = completed,
                accuracy_within_2_days = score.accuracy_within_2_days,
                mae = score.mae
            );
            TuneOutcome {
                params,
                score: Some(score),
                trials_completed: completed,
                trials_failed: failed,
                used_fallback: false,
            }
        }
        None => {
            warn!(
                component = "model",
                event = "model.tune.fallback",
                trials_failed = failed
            );
            TuneOutcome {
                params: last_known_good.clone(),
                score: None,
                trials_completed: completed,
                trials_failed: failed,
                used_fallback: true,
            }
        }
    }
}
