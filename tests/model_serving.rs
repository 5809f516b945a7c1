use chrono::{Duration, NaiveDate, NaiveDateTime};
use coalfire::{
    append_predictions, build_inference_features, build_training_set, predict_observation,
    read_metrics, read_recent_predictions, save_artifact, train_model, write_metrics,
    CombustionEvent, HyperParams, InMemoryHistory, LoadedModel, Measurement, ModelCache,
    ModelError, Observation, PipelineConfig, PredictionRecord, RawSources, Regressor,
    RidgeRegressor, RiskLevel, ServeError, SqliteHistoryStore, StockpileKey, TrainingSet,
};
use tempfile::tempdir;

fn day(n: i64) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2022, 5, 1)
        .expect("valid base date")
        .and_hms_opt(7, 30, 0)
        .expect("valid base time")
        + Duration::days(n)
}

/// Stockpiles warming roughly linearly toward a fire.
fn warming_sources() -> RawSources {
    let mut fires = Vec::new();
    let mut measurements = Vec::new();
    for pile in 0..4i64 {
        let key = StockpileKey::new("5", &format!("{}", 10 + pile));
        let fire_day = 30 + pile * 4;
        fires.push(CombustionEvent {
            key: key.clone(),
            fire_start_at: day(fire_day),
            stack_formation_at: Some(day(-20)),
        });
        for d in (pile..fire_day).step_by(2) {
            let remaining = (fire_day - d) as f64;
            measurements.push(Measurement {
                key: key.clone(),
                measured_at: day(d),
                max_temperature: 80.0 - 1.5 * remaining + (d % 3) as f64 * 0.4,
                picket: None,
                shift: None,
            });
        }
    }
    RawSources {
        fires,
        supplies: Vec::new(),
        measurements,
        weather: Vec::new(),
    }
}

fn config() -> PipelineConfig {
    PipelineConfig {
        min_training_samples: 20,
        ..PipelineConfig::default()
    }
}

fn trained() -> (TrainingSet, PipelineConfig) {
    let cfg = config();
    let set = build_training_set(&warming_sources(), &cfg).expect("training set");
    (set, cfg)
}

#[test]
fn train_save_load_and_predict() {
    let (set, cfg) = trained();
    let dir = tempdir().expect("temp dir");
    let artifact_path = dir.path().join("models").join("model.json");
    let metrics_path = dir.path().join("models").join("metrics.json");
    let trained_at = day(60);

    let params = HyperParams::default().with("l2", 0.5);
    let (artifact, model) =
        train_model(&RidgeRegressor, &set, &params, trained_at).expect("train model");
    let metrics = artifact.metrics.clone().expect("holdout metrics");
    assert_eq!(metrics.feature_count as usize, set.schema.columns.len());
    assert!(metrics.sample_count > 0 && (metrics.sample_count as usize) < set.len());
    assert_eq!(metrics.trained_at, trained_at);

    save_artifact(&artifact_path, &artifact).expect("save artifact");
    write_metrics(&metrics_path, &metrics).expect("save metrics");
    assert_eq!(read_metrics(&metrics_path).expect("read metrics"), metrics);

    let cache = ModelCache::new();
    cache
        .load_from_path(&artifact_path, &RidgeRegressor)
        .expect("load model");

    let history = InMemoryHistory::from_points(set.history.clone());
    let key = StockpileKey::new("5", "12");
    let last = set
        .history
        .iter()
        .filter(|p| p.key == key)
        .max_by_key(|p| p.measured_at)
        .expect("series for stockpile");
    let observation = Observation::from_series_point(last);

    let prediction =
        predict_observation(&observation, &history, &cache, &cfg).expect("prediction");
    let features =
        build_inference_features(&observation, &history, &set.context, &cfg).expect("features");
    let expected_days = model.predict(&features.values).max(0.0);

    assert!((prediction.predicted_days - expected_days).abs() < 1e-9);
    assert_eq!(prediction.risk, RiskLevel::from_days(prediction.predicted_days));
    assert_eq!(
        prediction.predicted_date,
        last.measured_at.date() + Duration::days(prediction.predicted_days.round() as i64)
    );
    assert!(prediction.confidence > 0.4 && prediction.confidence < 0.95);

    let history_path = dir.path().join("predictions.jsonl");
    let record = PredictionRecord::new(&key, last.measured_at, trained_at, &prediction);
    append_predictions(&history_path, &[record.clone()]).expect("append prediction");
    let recent = read_recent_predictions(&history_path, 10).expect("read predictions");
    assert_eq!(recent.records, vec![record]);
}

#[test]
fn sqlite_history_serves_the_same_prediction() {
    let (set, cfg) = trained();
    let (artifact, model) = train_model(
        &RidgeRegressor,
        &set,
        &HyperParams::default(),
        day(60),
    )
    .expect("train model");

    let cache = ModelCache::new();
    cache.replace(LoadedModel { artifact, model });

    let dir = tempdir().expect("temp dir");
    let mut store = SqliteHistoryStore::open(&dir.path().join("history.sqlite")).expect("store");
    store.upsert_points(&set.history).expect("persist history");
    let memory = InMemoryHistory::from_points(set.history.clone());

    let observation = Observation {
        pile_age_days: Some(40.0),
        ..Observation::new("5", "11", day(36), 74.0)
    };
    let from_sqlite = predict_observation(&observation, &store, &cache, &cfg).expect("sqlite");
    let from_memory = predict_observation(&observation, &memory, &cache, &cfg).expect("memory");
    assert_eq!(from_sqlite, from_memory);
}

#[test]
fn serving_with_changed_feature_config_is_schema_mismatch() {
    let (set, _) = trained();
    let (artifact, model) = train_model(&RidgeRegressor, &set, &HyperParams::default(), day(60))
        .expect("train model");
    let cache = ModelCache::new();
    cache.replace(LoadedModel { artifact, model });

    let other_cfg = PipelineConfig {
        rolling_days: vec![5],
        ..config()
    };
    let err = predict_observation(
        &Observation::new("5", "10", day(20), 50.0),
        &InMemoryHistory::default(),
        &cache,
        &other_cfg,
    )
    .expect_err("schema changed");
    assert!(matches!(err, ServeError::SchemaMismatch(_)));
}

#[test]
fn invalid_observation_and_untrained_model_are_distinct_errors() {
    let cache = ModelCache::new();
    let history = InMemoryHistory::default();
    let cfg = config();

    let err = predict_observation(
        &Observation::new("5", "10", day(20), 50.0),
        &history,
        &cache,
        &cfg,
    )
    .expect_err("no model");
    assert!(matches!(err, ServeError::ModelNotTrained));

    let (set, _) = trained();
    let (artifact, model) = train_model(&RidgeRegressor, &set, &HyperParams::default(), day(60))
        .expect("train model");
    cache.replace(LoadedModel { artifact, model });

    let err = predict_observation(
        &Observation {
            max_temperature: None,
            ..Observation::new("5", "10", day(20), 50.0)
        },
        &history,
        &cache,
        &cfg,
    )
    .expect_err("missing temperature");
    match err {
        ServeError::Validation { missing } => assert_eq!(missing, vec!["max_temperature"]),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn failed_reload_keeps_previous_snapshot() {
    let (set, _) = trained();
    let (artifact, model) = train_model(&RidgeRegressor, &set, &HyperParams::default(), day(60))
        .expect("train model");
    let fingerprint = artifact.schema.fingerprint.clone();
    let cache = ModelCache::new();
    cache.replace(LoadedModel { artifact, model });

    let dir = tempdir().expect("temp dir");
    let err = cache
        .load_from_path(&dir.path().join("absent.json"), &RidgeRegressor)
        .expect_err("missing artifact");
    assert!(matches!(err, ModelError::NotTrained));

    let corrupt = dir.path().join("corrupt.json");
    std::fs::write(&corrupt, b"{\"format_version\":").expect("write corrupt artifact");
    assert!(cache.load_from_path(&corrupt, &RidgeRegressor).is_err());

    let current = cache.current().expect("previous snapshot");
    assert_eq!(current.artifact.schema.fingerprint, fingerprint);
    assert_eq!(current.artifact.regressor, RidgeRegressor.name());
}
