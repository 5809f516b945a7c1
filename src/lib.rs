//! Coalfire core crate.
//!
//! Fuses stockpile temperature measurements with supply, weather and
//! combustion records into time-ordered training rows labeled with the days
//! remaining before self-ignition, and replays the same transform for
//! single-observation inference.

mod association;
mod config;
mod features;
mod history_store;
mod ingest;
mod metrics;
mod model;
mod observability;
mod prediction_history;
mod records;
mod samples;
mod serving;

pub use association::{
    associate, days_between, AssociatedMeasurement, AssociationReport, FormationSource,
    LabelStatus, SupplySnapshot,
};
pub use config::{
    pipeline_config_from_env, ConfigError, PipelineConfig, SourcePaths, TemperatureThresholds,
    MAX_FIRE_TOLERANCE_DAYS, MIN_FIRE_TOLERANCE_DAYS,
};
pub use features::{
    assert_schema_compatible, build_feature_schema, compute_appended_row, compute_features,
    median, CategoryEncoder, FeatureColumn, FeatureContext, FeatureDType, FeatureError,
    FeatureRow, FeatureSchema, FeatureTransformReport, PopulationStats, SeriesPoint, StackRolling,
    CATEGORY_MAPPING_VERSION, FEATURE_SCHEMA_VERSION, UNKNOWN_CATEGORY_CODE,
};
pub use history_store::{HistoryStoreError, SqliteHistoryStore};
pub use ingest::{
    aggregate_weather_daily, load_all_sources, load_raw_sources, load_weather, parse_number,
    parse_timestamp, read_fires, read_measurements, read_supplies, read_weather_samples,
    ColumnRenames, IngestError, IngestReport, NumericCell, RawSources, SourceKind,
    SourceLoadOutcome, SourceReport,
};
pub use metrics::{
    accuracy_within, mean_absolute_error, percentile, r2_score, read_metrics,
    root_mean_squared_error, write_metrics, TrainingMetrics,
};
pub use model::{
    confidence_from_temperature, cross_validate, load_artifact, predict_with_confidence,
    save_artifact, time_series_folds, train_model, tune, CvScore, HyperParams, LoadedModel,
    ModelArtifact, ModelCache, ModelError, Prediction, Regressor, RidgeRegressor, RiskLevel,
    TrainedModel, TuneBudget, TuneOutcome, ARTIFACT_FORMAT_VERSION, CV_FOLDS,
};
pub use observability::{
    init_logging, log_app_start, log_pipeline_config, log_pipeline_summary,
    logging_config_from_env, LogFormat, LoggingConfig, LoggingInitError,
};
pub use prediction_history::{
    append_predictions, read_recent_predictions, PredictionHistoryError, PredictionRecord,
    RecentPredictions,
};
pub use records::{
    normalize_category, normalize_id, CombustionEvent, Measurement, StockpileKey, SupplyEvent,
    WeatherDay, WeatherSample,
};
pub use samples::{build_samples, SampleReport, SampleRow};
pub use serving::{
    build_inference_features, build_training_set, build_training_set_with_context,
    load_training_set, predict_observation, FeatureMatrix, FeatureVector, HistoryLookup,
    InMemoryHistory, InferenceFeatures, LabelVector, Observation, PipelineError, PipelineReport,
    ServeError, TrainingSet,
};
