//! Training and inference entry points over the shared feature transform.
//!
//! `build_training_set` runs the full batch path. `build_inference_features`
//! replays a stockpile's persisted history and appends one observation, which
//! reproduces the row batch mode would have emitted for it.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::association::{associate, AssociationReport};
use crate::config::{ConfigError, PipelineConfig, SourcePaths};
use crate::features::{
    assert_schema_compatible, build_feature_schema, compute_appended_row, compute_features,
    FeatureContext, FeatureError, FeatureSchema, FeatureTransformReport, SeriesPoint,
};
use crate::history_store::HistoryStoreError;
use crate::ingest::{load_raw_sources, ColumnRenames, IngestError, IngestReport, RawSources};
use crate::model::{predict_with_confidence, ModelCache, ModelError, Prediction};
use crate::records::{normalize_category, StockpileKey, WeatherDay};
use crate::samples::{build_samples, SampleReport};

pub type FeatureVector = Vec<f64>;
pub type FeatureMatrix = Vec<FeatureVector>;
pub type LabelVector = Vec<f64>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error("too few training samples: found {found}, required {required}")]
    TooFewSamples { found: usize, required: usize },
    #[error("every row was dropped at stage {stage}")]
    AllRowsDropped { stage: &'static str },
    #[error("feature column {0} missing from schema")]
    MissingFeature(&'static str),
}

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("invalid observation: missing {}", .missing.join(", "))]
    Validation { missing: Vec<&'static str> },
    #[error("model not trained")]
    ModelNotTrained,
    #[error("feature schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("invalid pipeline config: {0}")]
    InvalidConfig(String),
    #[error("history lookup failed: {0}")]
    History(#[from] HistoryStoreError),
    #[error("model error: {0}")]
    Model(ModelError),
}

impl From<FeatureError> for ServeError {
    fn from(err: FeatureError) -> Self {
        match err {
            FeatureError::InvalidConfig(message) => Self::InvalidConfig(message),
            other => Self::SchemaMismatch(other.to_string()),
        }
    }
}

impl From<ModelError> for ServeError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::NotTrained => Self::ModelNotTrained,
            other => Self::Model(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineReport {
    pub ingest: Option<IngestReport>,
    pub association: AssociationReport,
    pub features: FeatureTransformReport,
    pub samples: SampleReport,
}

/// Row-aligned training output, ordered by measurement time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSet {
    pub schema: FeatureSchema,
    pub context: FeatureContext,
    pub features: FeatureMatrix,
    pub labels: LabelVector,
    pub keys: Vec<StockpileKey>,
    pub measured_at: Vec<NaiveDateTime>,
    /// Every associated point, labeled or not; the inference history.
    pub history: Vec<SeriesPoint>,
    pub report: PipelineReport,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Reads the data directory and builds the training set.
pub fn load_training_set(
    paths: &SourcePaths,
    renames: &ColumnRenames,
    cfg: &PipelineConfig,
) -> Result<TrainingSet, PipelineError> {
    cfg.validate()?;
    let (sources, ingest_report) = load_raw_sources(paths, renames, cfg)?;
    let mut set = build_training_set(&sources, cfg)?;
    set.report.ingest = Some(ingest_report);
    Ok(set)
}

/// Batch path: association, context fit, features, samples.
pub fn build_training_set(
    sources: &RawSources,
    cfg: &PipelineConfig,
) -> Result<TrainingSet, PipelineError> {
    cfg.validate()?;
    let (associated, association_report) = associate(sources, cfg);
    let history: Vec<SeriesPoint> = associated.iter().map(|row| row.to_series_point()).collect();
    let context = FeatureContext::fit(&history);
    let labels: Vec<Option<i64>> = associated.iter().map(|row| row.days_until_fire).collect();
    assemble(history, labels, association_report, context, cfg)
}

/// Same as [`build_training_set`] but with a caller-supplied context, so a
/// prefix and its extension share population statistics and vocabularies.
pub fn build_training_set_with_context(
    sources: &RawSources,
    context: &FeatureContext,
    cfg: &PipelineConfig,
) -> Result<TrainingSet, PipelineError> {
    cfg.validate()?;
    let (associated, association_report) = associate(sources, cfg);
    let history: Vec<SeriesPoint> = associated.iter().map(|row| row.to_series_point()).collect();
    let labels: Vec<Option<i64>> = associated.iter().map(|row| row.days_until_fire).collect();
    assemble(history, labels, association_report, context.clone(), cfg)
}

fn assemble(
    history: Vec<SeriesPoint>,
    labels: Vec<Option<i64>>,
    association: AssociationReport,
    context: FeatureContext,
    cfg: &PipelineConfig,
) -> Result<TrainingSet, PipelineError> {
    if history.is_empty() && association.measurements_total > 0 {
        return Err(PipelineError::AllRowsDropped {
            stage: "association",
        });
    }

    let (schema, rows, feature_report) = compute_features(&history, &context, cfg)?;
    let (samples, sample_report) = build_samples(&schema, &rows, &labels, cfg)?;

    let mut features = Vec::with_capacity(samples.len());
    let mut sample_labels = Vec::with_capacity(samples.len());
    let mut keys = Vec::with_capacity(samples.len());
    let mut measured_at = Vec::with_capacity(samples.len());
    for sample in samples {
        sample_labels.push(sample.days_until_fire as f64);
        keys.push(sample.key);
        measured_at.push(sample.measured_at);
        features.push(sample.features);
    }

    info!(
        component = "serving",
        event = "training_set.built",
        samples = sample_labels.len(),
        feature_count = schema.columns.len(),
        fingerprint = %schema.fingerprint
    );

    Ok(TrainingSet {
        schema,
        context,
        features,
        labels: sample_labels,
        keys,
        measured_at,
        history,
        report: PipelineReport {
            ingest: None,
            association,
            features: feature_report,
            samples: sample_report,
        },
    })
}

/// Read access to the persisted raw series of each stockpile.
pub trait HistoryLookup {
    /// Points of `key` measured at or before `at`, oldest first.
    fn history_for(
        &self,
        key: &StockpileKey,
        at: NaiveDateTime,
    ) -> Result<Vec<SeriesPoint>, HistoryStoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryHistory {
    series: BTreeMap<StockpileKey, Vec<SeriesPoint>>,
}

impl InMemoryHistory {
    pub fn from_points(points: impl IntoIterator<Item = SeriesPoint>) -> Self {
        let mut history = Self::default();
        for point in points {
            history.insert(point);
        }
        history
    }

    pub fn insert(&mut self, point: SeriesPoint) {
        let series = self.series.entry(point.key.clone()).or_default();
        let at = series.partition_point(|p| p.measured_at <= point.measured_at);
        series.insert(at, point);
    }
}

impl HistoryLookup for InMemoryHistory {
    fn history_for(
        &self,
        key: &StockpileKey,
        at: NaiveDateTime,
    ) -> Result<Vec<SeriesPoint>, HistoryStoreError> {
        Ok(self
            .series
            .get(key)
            .map(|series| {
                series
                    .iter()
                    .filter(|point| point.measured_at <= at)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// A single, possibly partial, observation submitted for prediction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Observation {
    pub storage_id: Option<String>,
    pub stack_id: Option<String>,
    pub measured_at: Option<NaiveDateTime>,
    pub max_temperature: Option<f64>,
    pub stack_mass_tons: Option<f64>,
    pub formation_at: Option<NaiveDateTime>,
    /// Used to derive `formation_at` when no explicit date is given.
    pub pile_age_days: Option<f64>,
    pub weather: Option<WeatherDay>,
    pub cargo_grade: Option<String>,
    pub picket: Option<String>,
    pub shift: Option<String>,
}

impl Observation {
    pub fn new(
        storage_id: &str,
        stack_id: &str,
        measured_at: NaiveDateTime,
        max_temperature: f64,
    ) -> Self {
        Self {
            storage_id: Some(storage_id.to_string()),
            stack_id: Some(stack_id.to_string()),
            measured_at: Some(measured_at),
            max_temperature: Some(max_temperature),
            ..Self::default()
        }
    }

    /// From a point already carrying its raw context.
    pub fn from_series_point(point: &SeriesPoint) -> Self {
        Self {
            storage_id: Some(point.key.storage_id.clone()),
            stack_id: Some(point.key.stack_id.clone()),
            measured_at: Some(point.measured_at),
            max_temperature: Some(point.max_temperature),
            stack_mass_tons: point.stack_mass_tons,
            formation_at: point.formation_at,
            pile_age_days: None,
            weather: point.weather.clone(),
            cargo_grade: point.cargo_grade.clone(),
            picket: point.picket.clone(),
            shift: point.shift.clone(),
        }
    }

    pub fn to_series_point(&self) -> Result<SeriesPoint, ServeError> {
        let key = StockpileKey::new(
            self.storage_id.as_deref().unwrap_or_default(),
            self.stack_id.as_deref().unwrap_or_default(),
        );
        let temperature = self.max_temperature.filter(|t| t.is_finite());

        let mut missing = Vec::new();
        if key.storage_id.is_empty() {
            missing.push("storage_id");
        }
        if key.stack_id.is_empty() {
            missing.push("stack_id");
        }
        if self.measured_at.is_none() {
            missing.push("measured_at");
        }
        if temperature.is_none() {
            missing.push("max_temperature");
        }
        let (Some(measured_at), Some(max_temperature), true) =
            (self.measured_at, temperature, missing.is_empty())
        else {
            return Err(ServeError::Validation { missing });
        };

        let formation_at = self.formation_at.or_else(|| {
            self.pile_age_days
                .filter(|days| days.is_finite() && *days >= 0.0)
                .map(|days| measured_at - Duration::days(days.round() as i64))
        });

        Ok(SeriesPoint {
            key,
            measured_at,
            max_temperature,
            stack_mass_tons: self.stack_mass_tons.filter(|m| m.is_finite()),
            formation_at,
            weather: self.weather.clone(),
            cargo_grade: self.cargo_grade.as_deref().and_then(normalize_category),
            picket: self.picket.as_deref().and_then(normalize_category),
            shift: self.shift.as_deref().and_then(normalize_category),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceFeatures {
    pub schema: FeatureSchema,
    pub key: StockpileKey,
    pub measured_at: NaiveDateTime,
    pub values: FeatureVector,
    pub history_points: usize,
    pub report: FeatureTransformReport,
}

/// Single-observation path.
///
/// History rows after the observation are ignored. If the lookup already
/// holds this exact observation it is not counted twice.
pub fn build_inference_features(
    observation: &Observation,
    history: &dyn HistoryLookup,
    context: &FeatureContext,
    cfg: &PipelineConfig,
) -> Result<InferenceFeatures, ServeError> {
    let mut point = observation.to_series_point()?;
    let mut past = history.history_for(&point.key, point.measured_at)?;
    past.retain(|p| p.measured_at <= point.measured_at);

    if let Some(pos) = past.iter().rposition(|p| {
        p.measured_at == point.measured_at
            && p.max_temperature == point.max_temperature
            && p.picket == point.picket
            && p.shift == point.shift
    }) {
        debug!(
            component = "serving",
            event = "inference.history.self_excluded",
            stockpile = %point.key
        );
        past.remove(pos);
    }

    // A known formation date stays known for later measurements of the pile.
    if point.formation_at.is_none() {
        point.formation_at = past
            .iter()
            .max_by_key(|p| p.measured_at)
            .and_then(|p| p.formation_at);
    }

    let (values, report) = compute_appended_row(&past, &point, context, cfg)?;
    if past.is_empty() {
        warn!(
            component = "serving",
            event = "inference.history.empty",
            stockpile = %point.key,
            defaulted_lags = report.defaulted_lags
        );
    }

    Ok(InferenceFeatures {
        schema: build_feature_schema(cfg),
        key: point.key,
        measured_at: point.measured_at,
        values,
        history_points: past.len(),
        report,
    })
}

/// Features, model and post-processing for one observation.
pub fn predict_observation(
    observation: &Observation,
    history: &dyn HistoryLookup,
    cache: &ModelCache,
    cfg: &PipelineConfig,
) -> Result<Prediction, ServeError> {
    let loaded = cache.current()?;
    let artifact = &loaded.artifact;
    assert_schema_compatible(
        artifact.schema.version,
        &artifact.schema.fingerprint,
        &build_feature_schema(cfg),
    )?;

    let features = build_inference_features(observation, history, &artifact.context, cfg)?;
    let raw = loaded.model.predict(&features.values);
    let temperature = features.values[0];
    let prediction = predict_with_confidence(raw, temperature, features.measured_at);

    info!(
        component = "serving",
        event = "prediction.made",
        stockpile = %features.key,
        predicted_days = prediction.predicted_days,
        risk = prediction.risk.as_str(),
        history_points = features.history_points
    );
    Ok(prediction)
}
