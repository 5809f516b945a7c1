//! Causal per-stockpile feature transform shared by training and inference.
//!
//! Every feature at a row is computed from that row and the rows before it in
//! the same stockpile series. Batch mode and single-observation mode both
//! push points through the same [`StackRolling`] state, so replaying a
//! history and pushing one more point yields exactly the batch row.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ConfigError, PipelineConfig};
use crate::records::{StockpileKey, WeatherDay};

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const CATEGORY_MAPPING_VERSION: u32 = 1;

/// Code emitted for missing and never-seen categories.
pub const UNKNOWN_CATEGORY_CODE: u32 = 0;

pub const FALLBACK_MAX_TEMPERATURE: f64 = 0.0;
pub const FALLBACK_STACK_MASS_TONS: f64 = 5000.0;
pub const FALLBACK_AIR_TEMP: f64 = 10.0;
pub const FALLBACK_HUMIDITY: f64 = 70.0;
pub const FALLBACK_PRECIPITATION: f64 = 0.0;
pub const FALLBACK_PRESSURE: f64 = 1013.0;
pub const FALLBACK_CLOUD_COVER: f64 = 50.0;
pub const FALLBACK_VISIBILITY: f64 = 10.0;
pub const FALLBACK_WIND_SPEED_AVG: f64 = 3.0;
pub const FALLBACK_WIND_SPEED_MAX: f64 = 5.0;
pub const FALLBACK_WIND_DIRECTION: f64 = 0.0;

const RAW_COLUMNS: [&str; 14] = [
    "max_temperature",
    "stack_mass_tons",
    "log_stack_mass",
    "days_since_formation",
    "air_temp",
    "humidity",
    "precipitation",
    "pressure",
    "cloud_cover",
    "visibility",
    "wind_speed_avg",
    "wind_speed_max",
    "wind_dir_sin",
    "wind_dir_cos",
];

const DERIVED_COLUMNS: [&str; 11] = [
    "is_critical_temp",
    "is_high_temp",
    "is_warm_temp",
    "dryness",
    "drying_index",
    "temp_x_dryness",
    "temp_x_log_mass",
    "temp_x_age",
    "cum_high_temp_count",
    "running_max_temp",
    "measurement_index",
];

const CATEGORICAL_COLUMNS: [&str; 4] = [
    "cargo_grade_code",
    "picket_code",
    "shift_code",
    "weather_code_code",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    F64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }
}

/// Raw context of one measurement before feature computation.
///
/// This is what the history store persists, so inference can replay a
/// stockpile series exactly as batch mode saw it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub key: StockpileKey,
    pub measured_at: NaiveDateTime,
    pub max_temperature: f64,
    pub stack_mass_tons: Option<f64>,
    /// `None` when neither a recorded formation date nor a delivery was
    /// visible, in which case the pile is aged from its own measurement.
    pub formation_at: Option<NaiveDateTime>,
    pub weather: Option<WeatherDay>,
    pub cargo_grade: Option<String>,
    pub picket: Option<String>,
    pub shift: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub key: StockpileKey,
    pub measured_at: NaiveDateTime,
    /// Position of the originating point in the transform input.
    pub source_index: usize,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureTransformReport {
    pub input_points: u64,
    pub output_points: u64,
    pub stockpiles: u64,
    pub defaulted_mass: u64,
    pub defaulted_weather_values: u64,
    pub defaulted_lags: u64,
    pub unknown_categories: u64,
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid feature transform config: {0}")]
    InvalidConfig(String),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

impl From<ConfigError> for FeatureError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Invalid(message) => Self::InvalidConfig(message),
        }
    }
}

/// Stable category -> integer mapping fit once on training data.
///
/// Codes start at 1 in sorted vocabulary order; [`UNKNOWN_CATEGORY_CODE`] is
/// reserved for missing and unseen values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryEncoder {
    pub version: u32,
    pub vocabulary: Vec<String>,
}

impl Default for CategoryEncoder {
    fn default() -> Self {
        Self {
            version: CATEGORY_MAPPING_VERSION,
            vocabulary: Vec::new(),
        }
    }
}

impl CategoryEncoder {
    pub fn fit<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let vocabulary: BTreeSet<&str> = values.into_iter().collect();
        Self {
            version: CATEGORY_MAPPING_VERSION,
            vocabulary: vocabulary.into_iter().map(str::to_string).collect(),
        }
    }

    /// `None` when the value was never seen at fit time.
    pub fn encode(&self, value: &str) -> Option<u32> {
        self.vocabulary
            .binary_search_by(|known| known.as_str().cmp(value))
            .ok()
            .map(|idx| idx as u32 + 1)
    }

    fn encode_feature(&self, value: Option<&str>, report: &mut FeatureTransformReport) -> f64 {
        let Some(value) = value else {
            return UNKNOWN_CATEGORY_CODE as f64;
        };
        match self.encode(value) {
            Some(code) => code as f64,
            None => {
                report.unknown_categories += 1;
                UNKNOWN_CATEGORY_CODE as f64
            }
        }
    }
}

/// Population medians from training data, used where a stockpile has no
/// earlier value to carry forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PopulationStats {
    pub max_temperature: f64,
    pub stack_mass_tons: f64,
    pub air_temp: f64,
    pub humidity: f64,
    pub precipitation: f64,
    pub pressure: f64,
    pub cloud_cover: f64,
    pub visibility: f64,
    pub wind_speed_avg: f64,
    pub wind_speed_max: f64,
    pub wind_direction: f64,
}

impl Default for PopulationStats {
    fn default() -> Self {
        Self {
            max_temperature: FALLBACK_MAX_TEMPERATURE,
            stack_mass_tons: FALLBACK_STACK_MASS_TONS,
            air_temp: FALLBACK_AIR_TEMP,
            humidity: FALLBACK_HUMIDITY,
            precipitation: FALLBACK_PRECIPITATION,
            pressure: FALLBACK_PRESSURE,
            cloud_cover: FALLBACK_CLOUD_COVER,
            visibility: FALLBACK_VISIBILITY,
            wind_speed_avg: FALLBACK_WIND_SPEED_AVG,
            wind_speed_max: FALLBACK_WIND_SPEED_MAX,
            wind_direction: FALLBACK_WIND_DIRECTION,
        }
    }
}

impl PopulationStats {
    pub fn fit(points: &[SeriesPoint]) -> Self {
        let fallback = Self::default();
        let weather = |pick: fn(&WeatherDay) -> Option<f64>| {
            median(
                points
                    .iter()
                    .filter_map(|p| p.weather.as_ref().and_then(pick))
                    .collect(),
            )
        };

        Self {
            max_temperature: median(points.iter().map(|p| p.max_temperature).collect())
                .unwrap_or(fallback.max_temperature),
            stack_mass_tons: median(points.iter().filter_map(|p| p.stack_mass_tons).collect())
                .unwrap_or(fallback.stack_mass_tons),
            air_temp: weather(|w| w.air_temp).unwrap_or(fallback.air_temp),
            humidity: weather(|w| w.humidity).unwrap_or(fallback.humidity),
            precipitation: weather(|w| w.precipitation).unwrap_or(fallback.precipitation),
            pressure: weather(|w| w.pressure).unwrap_or(fallback.pressure),
            cloud_cover: weather(|w| w.cloud_cover).unwrap_or(fallback.cloud_cover),
            visibility: weather(|w| w.visibility).unwrap_or(fallback.visibility),
            wind_speed_avg: weather(|w| w.wind_speed_avg).unwrap_or(fallback.wind_speed_avg),
            wind_speed_max: weather(|w| w.wind_speed_max).unwrap_or(fallback.wind_speed_max),
            wind_direction: weather(|w| w.wind_direction).unwrap_or(fallback.wind_direction),
        }
    }

    fn as_array(&self) -> [f64; 11] {
        [
            self.max_temperature,
            self.stack_mass_tons,
            self.air_temp,
            self.humidity,
            self.precipitation,
            self.pressure,
            self.cloud_cover,
            self.visibility,
            self.wind_speed_avg,
            self.wind_speed_max,
            self.wind_direction,
        ]
    }
}

/// Median with the midpoint rule for even counts; NaN values are ignored.
pub fn median(mut values: Vec<f64>) -> Option<f64> {
    values.retain(|v| !v.is_nan());
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

/// Everything fit on training data that inference must reuse unchanged.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureContext {
    pub cargo_grade: CategoryEncoder,
    pub picket: CategoryEncoder,
    pub shift: CategoryEncoder,
    pub weather_code: CategoryEncoder,
    pub stats: PopulationStats,
}

impl FeatureContext {
    pub fn fit(points: &[SeriesPoint]) -> Self {
        let ctx = Self {
            cargo_grade: CategoryEncoder::fit(points.iter().filter_map(|p| p.cargo_grade.as_deref())),
            picket: CategoryEncoder::fit(points.iter().filter_map(|p| p.picket.as_deref())),
            shift: CategoryEncoder::fit(points.iter().filter_map(|p| p.shift.as_deref())),
            weather_code: CategoryEncoder::fit(
                points
                    .iter()
                    .filter_map(|p| p.weather.as_ref().and_then(|w| w.weather_code.as_deref())),
            ),
            stats: PopulationStats::fit(points),
        };

        info!(
            component = "features",
            event = "features.context.fit",
            points = points.len(),
            cargo_grades = ctx.cargo_grade.vocabulary.len(),
            pickets = ctx.picket.vocabulary.len(),
            shifts = ctx.shift.vocabulary.len(),
            weather_codes = ctx.weather_code.vocabulary.len(),
            median_temperature = ctx.stats.max_temperature
        );
        ctx
    }

    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, encoder) in [
            ("cargo_grade", &self.cargo_grade),
            ("picket", &self.picket),
            ("shift", &self.shift),
            ("weather_code", &self.weather_code),
        ] {
            hasher.update(format!("{name}:v{};", encoder.version));
            for value in &encoder.vocabulary {
                hasher.update(value.as_bytes());
                hasher.update([0u8]);
            }
        }
        hasher.update("stats:");
        for value in self.stats.as_array() {
            hasher.update(value.to_bits().to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

pub fn build_feature_schema(cfg: &PipelineConfig) -> FeatureSchema {
    let mut names: Vec<String> = RAW_COLUMNS.iter().map(|name| name.to_string()).collect();

    for n in &cfg.rolling_points {
        names.push(format!("temp_mean_{n}pt"));
        names.push(format!("temp_max_{n}pt"));
        names.push(format!("temp_std_{n}pt"));
    }
    for d in &cfg.rolling_days {
        names.push(format!("temp_mean_{d}d"));
        names.push(format!("temp_max_{d}d"));
        names.push(format!("temp_std_{d}d"));
    }
    for n in &cfg.lag_steps {
        names.push(format!("temp_lag_{n}"));
    }
    names.push("temp_velocity".to_string());
    names.push("temp_acceleration".to_string());
    names.extend(DERIVED_COLUMNS.iter().map(|name| name.to_string()));
    names.extend(CATEGORICAL_COLUMNS.iter().map(|name| name.to_string()));

    let columns: Vec<FeatureColumn> = names
        .into_iter()
        .map(|name| FeatureColumn {
            name,
            dtype: FeatureDType::F64,
        })
        .collect();
    let fingerprint = schema_fingerprint(cfg, &columns);

    debug!(
        component = "features",
        event = "features.schema.built",
        version = cfg.schema_version,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    }
}

/// Batch transform over any mix of stockpiles.
///
/// Rows come out grouped by stockpile key and ordered by measurement time
/// within each group; equal timestamps keep their input order.
pub fn compute_features(
    points: &[SeriesPoint],
    ctx: &FeatureContext,
    cfg: &PipelineConfig,
) -> Result<(FeatureSchema, Vec<FeatureRow>, FeatureTransformReport), FeatureError> {
    cfg.validate()?;
    let schema = build_feature_schema(cfg);

    info!(
        component = "features",
        event = "features.transform.start",
        input_points = points.len(),
        rolling_points = ?cfg.rolling_points,
        rolling_days = ?cfg.rolling_days,
        lag_steps = ?cfg.lag_steps
    );

    let mut groups: BTreeMap<&StockpileKey, Vec<usize>> = BTreeMap::new();
    for (idx, point) in points.iter().enumerate() {
        groups.entry(&point.key).or_default().push(idx);
    }

    let mut report = FeatureTransformReport {
        input_points: points.len() as u64,
        stockpiles: groups.len() as u64,
        ..FeatureTransformReport::default()
    };
    let mut rows = Vec::with_capacity(points.len());

    for indices in groups.into_values() {
        let mut indices = indices;
        indices.sort_by_key(|idx| points[*idx].measured_at);
        let mut state = StackRolling::new(cfg);
        for idx in indices {
            let point = &points[idx];
            let values = state.push(point, ctx, cfg, &mut report);
            rows.push(FeatureRow {
                key: point.key.clone(),
                measured_at: point.measured_at,
                source_index: idx,
                values,
            });
        }
    }

    report.output_points = rows.len() as u64;
    log_transform_report(&report);
    Ok((schema, rows, report))
}

/// Single-stockpile transform: replays `history` and emits the row for
/// `point` as if it were appended to the end of the series.
pub fn compute_appended_row(
    history: &[SeriesPoint],
    point: &SeriesPoint,
    ctx: &FeatureContext,
    cfg: &PipelineConfig,
) -> Result<(Vec<f64>, FeatureTransformReport), FeatureError> {
    cfg.validate()?;

    let mut ordered: Vec<&SeriesPoint> = history.iter().collect();
    ordered.sort_by_key(|p| p.measured_at);

    let mut state = StackRolling::new(cfg);
    let mut replay_report = FeatureTransformReport::default();
    for past in ordered {
        state.push(past, ctx, cfg, &mut replay_report);
    }

    let mut report = FeatureTransformReport {
        input_points: 1,
        output_points: 1,
        stockpiles: 1,
        ..FeatureTransformReport::default()
    };
    let values = state.push(point, ctx, cfg, &mut report);

    debug!(
        component = "features",
        event = "features.appended_row",
        stockpile = %point.key,
        history_points = history.len(),
        defaulted_lags = report.defaulted_lags
    );
    Ok((values, report))
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

/// Weather fields carried forward within one stockpile series.
#[derive(Debug, Clone, Default)]
struct CarriedWeather {
    air_temp: Option<f64>,
    humidity: Option<f64>,
    precipitation: Option<f64>,
    pressure: Option<f64>,
    cloud_cover: Option<f64>,
    visibility: Option<f64>,
    wind_speed_avg: Option<f64>,
    wind_speed_max: Option<f64>,
    wind_direction: Option<f64>,
    weather_code: Option<String>,
}

impl CarriedWeather {
    fn absorb(&mut self, day: &WeatherDay) {
        fn carry(slot: &mut Option<f64>, value: Option<f64>) {
            if let Some(value) = value.filter(|v| !v.is_nan()) {
                *slot = Some(value);
            }
        }
        carry(&mut self.air_temp, day.air_temp);
        carry(&mut self.humidity, day.humidity);
        carry(&mut self.precipitation, day.precipitation);
        carry(&mut self.pressure, day.pressure);
        carry(&mut self.cloud_cover, day.cloud_cover);
        carry(&mut self.visibility, day.visibility);
        carry(&mut self.wind_speed_avg, day.wind_speed_avg);
        carry(&mut self.wind_speed_max, day.wind_speed_max);
        carry(&mut self.wind_direction, day.wind_direction);
        if let Some(code) = &day.weather_code {
            self.weather_code = Some(code.clone());
        }
    }
}

/// Rolling state of one stockpile series.
#[derive(Debug, Clone)]
pub struct StackRolling {
    recent: VecDeque<(NaiveDateTime, f64)>,
    keep_points: usize,
    keep_span: Duration,
    prev_velocity: Option<f64>,
    count: u64,
    high_count: u64,
    running_max: f64,
    mass: Option<f64>,
    weather: CarriedWeather,
    cargo_grade: Option<String>,
}

impl StackRolling {
    pub fn new(cfg: &PipelineConfig) -> Self {
        let max_points = cfg.rolling_points.iter().copied().max().unwrap_or(1) as usize;
        let max_lag = cfg.lag_steps.iter().copied().max().unwrap_or(0) as usize;
        let span = cfg.velocity_span as usize;
        let max_days = cfg.rolling_days.iter().copied().max().unwrap_or(0) as i64;

        Self {
            recent: VecDeque::new(),
            keep_points: max_points.max(max_lag + 1).max(span + 1),
            keep_span: Duration::days(max_days),
            prev_velocity: None,
            count: 0,
            high_count: 0,
            running_max: f64::NEG_INFINITY,
            mass: None,
            weather: CarriedWeather::default(),
            cargo_grade: None,
        }
    }

    /// Folds `point` into the state and returns its feature values in schema
    /// order. Points must arrive in non-decreasing time order.
    pub fn push(
        &mut self,
        point: &SeriesPoint,
        ctx: &FeatureContext,
        cfg: &PipelineConfig,
        report: &mut FeatureTransformReport,
    ) -> Vec<f64> {
        let t = point.measured_at;
        let temp = point.max_temperature;
        let stats = &ctx.stats;

        if let Some(mass) = point.stack_mass_tons.filter(|m| !m.is_nan()) {
            self.mass = Some(mass);
        }
        if let Some(day) = &point.weather {
            self.weather.absorb(day);
        }
        if let Some(grade) = &point.cargo_grade {
            self.cargo_grade = Some(grade.clone());
        }

        self.recent.push_back((t, temp));
        let horizon = t - self.keep_span;
        while self.recent.len() > self.keep_points
            && self.recent.front().is_some_and(|(ts, _)| *ts <= horizon)
        {
            self.recent.pop_front();
        }

        let mut values = Vec::with_capacity(64);

        let mass = self.mass.unwrap_or_else(|| {
            report.defaulted_mass += 1;
            stats.stack_mass_tons
        });
        let log_mass = mass.max(0.0).ln_1p();
        // Formation is resolved per point; absent means the pile starts at `t`.
        let formation_at = point.formation_at.unwrap_or(t);
        let age_days = (t.date() - formation_at.date()).num_days().max(0) as f64;

        let mut weather_or = |value: Option<f64>, fallback: f64| {
            value.unwrap_or_else(|| {
                report.defaulted_weather_values += 1;
                fallback
            })
        };
        let air_temp = weather_or(self.weather.air_temp, stats.air_temp);
        let humidity = weather_or(self.weather.humidity, stats.humidity);
        let precipitation = weather_or(self.weather.precipitation, stats.precipitation);
        let pressure = weather_or(self.weather.pressure, stats.pressure);
        let cloud_cover = weather_or(self.weather.cloud_cover, stats.cloud_cover);
        let visibility = weather_or(self.weather.visibility, stats.visibility);
        let wind_avg = weather_or(self.weather.wind_speed_avg, stats.wind_speed_avg);
        let wind_max = weather_or(self.weather.wind_speed_max, stats.wind_speed_max);
        let wind_dir = weather_or(self.weather.wind_direction, stats.wind_direction).to_radians();

        values.extend([
            temp,
            mass,
            log_mass,
            age_days,
            air_temp,
            humidity,
            precipitation,
            pressure,
            cloud_cover,
            visibility,
            wind_avg,
            wind_max,
            wind_dir.sin(),
            wind_dir.cos(),
        ]);

        for n in &cfg.rolling_points {
            let take = (*n as usize).min(self.recent.len());
            let start = self.recent.len() - take;
            let window: Vec<f64> = self.recent.range(start..).map(|(_, v)| *v).collect();
            values.extend(window_stats(&window));
        }
        for d in &cfg.rolling_days {
            let cutoff = t - Duration::days(*d as i64);
            let window: Vec<f64> = self
                .recent
                .iter()
                .filter(|(ts, _)| *ts > cutoff)
                .map(|(_, v)| *v)
                .collect();
            values.extend(window_stats(&window));
        }
        for n in &cfg.lag_steps {
            match self.value_back(*n as usize) {
                Some(lagged) => values.push(lagged),
                None => {
                    report.defaulted_lags += 1;
                    values.push(stats.max_temperature);
                }
            }
        }

        let span = cfg.velocity_span as usize;
        let velocity = self
            .value_back(span)
            .map(|earlier| (temp - earlier) / span as f64);
        let acceleration = match (velocity, self.prev_velocity) {
            (Some(current), Some(previous)) => current - previous,
            _ => 0.0,
        };
        self.prev_velocity = velocity;
        values.push(velocity.unwrap_or(0.0));
        values.push(acceleration);

        let thresholds = &cfg.thresholds;
        if temp > thresholds.high {
            self.high_count += 1;
        }
        self.running_max = self.running_max.max(temp);
        let measurement_index = self.count as f64;
        self.count += 1;

        let dryness = 100.0 - humidity;
        values.extend([
            indicator(temp > thresholds.critical),
            indicator(temp > thresholds.high),
            indicator(temp > thresholds.warm),
            dryness,
            wind_avg * dryness,
            temp * dryness,
            temp * log_mass,
            temp * age_days,
            self.high_count as f64,
            self.running_max,
            measurement_index,
        ]);

        values.push(ctx.cargo_grade.encode_feature(self.cargo_grade.as_deref(), report));
        values.push(ctx.picket.encode_feature(point.picket.as_deref(), report));
        values.push(ctx.shift.encode_feature(point.shift.as_deref(), report));
        values.push(
            ctx.weather_code
                .encode_feature(self.weather.weather_code.as_deref(), report),
        );

        values
    }

    /// Temperature `steps` measurements before the newest one.
    fn value_back(&self, steps: usize) -> Option<f64> {
        if steps == 0 || self.recent.len() <= steps {
            return None;
        }
        self.recent
            .get(self.recent.len() - 1 - steps)
            .map(|(_, value)| *value)
    }
}

fn indicator(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}

/// Mean, max and sample standard deviation (0 below two points).
fn window_stats(window: &[f64]) -> [f64; 3] {
    if window.is_empty() {
        return [0.0, 0.0, 0.0];
    }
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let max = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let std = if window.len() < 2 {
        0.0
    } else {
        let variance = window
            .iter()
            .map(|v| {
                let d = *v - mean;
                d * d
            })
            .sum::<f64>()
            / (n - 1.0);
        variance.sqrt()
    };
    [mean, max, std]
}

fn schema_fingerprint(cfg: &PipelineConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update(format!("velocity_span:{};", cfg.velocity_span));
    hasher.update(format!(
        "thresholds:{},{},{};",
        cfg.thresholds.critical, cfg.thresholds.high, cfg.thresholds.warm
    ));
    for (label, windows) in [
        ("rolling_points", &cfg.rolling_points),
        ("rolling_days", &cfg.rolling_days),
        ("lag_steps", &cfg.lag_steps),
    ] {
        hasher.update(format!("{label}:"));
        for window in windows {
            hasher.update(format!("{window},"));
        }
        hasher.update(";");
    }
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":f64;");
    }
    hex::encode(hasher.finalize())
}

fn log_transform_report(report: &FeatureTransformReport) {
    info!(
        component = "features",
        event = "features.transform.done",
        input_points = report.input_points,
        output_points = report.output_points,
        stockpiles = report.stockpiles
    );
    debug!(
        component = "features",
        event = "features.defaults.applied",
        mass = report.defaulted_mass,
        weather_values = report.defaulted_weather_values,
        lags = report.defaulted_lags,
        unknown_categories = report.unknown_categories
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 6, day)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn point(day: u32, temp: f64) -> SeriesPoint {
        SeriesPoint {
            key: StockpileKey::new("1", "7"),
            measured_at: at(day),
            max_temperature: temp,
            stack_mass_tons: None,
            formation_at: None,
            weather: None,
            cargo_grade: None,
            picket: None,
            shift: None,
        }
    }

    fn value(schema: &FeatureSchema, row: &[f64], name: &str) -> f64 {
        row[schema.column_index(name).unwrap()]
    }

    #[test]
    fn schema_order_is_stable_and_fingerprinted() {
        let cfg = PipelineConfig::default();
        let schema = build_feature_schema(&cfg);
        let names = schema.column_names();
        assert_eq!(names[0], "max_temperature");
        assert_eq!(names[14], "temp_mean_3pt");
        assert_eq!(*names.last().unwrap(), "weather_code_code");
        assert_eq!(names.len(), 14 + 3 + 9 + 2 + 2 + 11 + 4);
        assert_eq!(schema.fingerprint, build_feature_schema(&cfg).fingerprint);

        let other = PipelineConfig {
            rolling_days: vec![7],
            ..PipelineConfig::default()
        };
        assert_ne!(schema.fingerprint, build_feature_schema(&other).fingerprint);
    }

    #[test]
    fn median_uses_midpoint_for_even_counts() {
        assert_eq!(median(vec![4.0, 1.0, 3.0, 2.0]), Some(2.5));
        assert_eq!(median(vec![5.0, 1.0, 3.0]), Some(3.0));
        assert_eq!(median(vec![]), None);
    }

    #[test]
    fn encoder_reserves_zero_for_unknown() {
        let encoder = CategoryEncoder::fit(["b", "a", "b"]);
        assert_eq!(encoder.vocabulary, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(encoder.encode("a"), Some(1));
        assert_eq!(encoder.encode("b"), Some(2));
        assert_eq!(encoder.encode("z"), None);

        let mut report = FeatureTransformReport::default();
        assert_eq!(encoder.encode_feature(Some("z"), &mut report), 0.0);
        assert_eq!(encoder.encode_feature(None, &mut report), 0.0);
        assert_eq!(report.unknown_categories, 1);
    }

    #[test]
    fn lags_fall_back_to_population_median_not_current_value() {
        let cfg = PipelineConfig::default();
        let ctx = FeatureContext {
            stats: PopulationStats {
                max_temperature: 25.0,
                ..PopulationStats::default()
            },
            ..FeatureContext::default()
        };
        let (schema, rows, report) =
            compute_features(&[point(1, 40.0), point(2, 44.0)], &ctx, &cfg).unwrap();

        assert_eq!(value(&schema, &rows[0].values, "temp_lag_1"), 25.0);
        assert_eq!(value(&schema, &rows[1].values, "temp_lag_1"), 40.0);
        assert_eq!(value(&schema, &rows[1].values, "temp_lag_3"), 25.0);
        assert_eq!(report.defaulted_lags, 3);
    }

    #[test]
    fn velocity_and_acceleration_need_full_span() {
        let cfg = PipelineConfig::default();
        let ctx = FeatureContext::default();
        let points: Vec<SeriesPoint> = [30.0, 31.0, 33.0, 36.0, 42.0]
            .iter()
            .enumerate()
            .map(|(i, t)| point(i as u32 + 1, *t))
            .collect();
        let (schema, rows, _) = compute_features(&points, &ctx, &cfg).unwrap();

        let velocity: Vec<f64> = rows
            .iter()
            .map(|r| value(&schema, &r.values, "temp_velocity"))
            .collect();
        assert_eq!(velocity, vec![0.0, 0.0, 0.0, 2.0, 11.0 / 3.0]);
        let acceleration = value(&schema, &rows[4].values, "temp_acceleration");
        assert!((acceleration - (11.0 / 3.0 - 2.0)).abs() < 1e-12);
        assert_eq!(value(&schema, &rows[3].values, "temp_acceleration"), 0.0);
    }

    #[test]
    fn day_windows_exclude_points_outside_trailing_range() {
        let cfg = PipelineConfig::default();
        let ctx = FeatureContext::default();
        let (schema, rows, _) = compute_features(
            &[point(1, 50.0), point(5, 30.0), point(8, 34.0)],
            &ctx,
            &cfg,
        )
        .unwrap();

        let last = &rows[2].values;
        assert_eq!(value(&schema, last, "temp_max_3d"), 34.0);
        assert_eq!(value(&schema, last, "temp_std_3d"), 0.0);
        assert_eq!(value(&schema, last, "temp_mean_7d"), 32.0);
        assert_eq!(value(&schema, last, "temp_max_14d"), 50.0);
        assert_eq!(value(&schema, last, "running_max_temp"), 50.0);
        assert_eq!(value(&schema, last, "cum_high_temp_count"), 1.0);
        assert_eq!(value(&schema, last, "measurement_index"), 2.0);
    }

    #[test]
    fn weather_and_mass_are_forward_filled_never_backward() {
        let cfg = PipelineConfig::default();
        let ctx = FeatureContext::default();
        let mut second = point(2, 31.0);
        second.stack_mass_tons = Some(800.0);
        second.weather = Some(WeatherDay {
            humidity: Some(40.0),
            ..WeatherDay::empty(at(2).date())
        });
        let (schema, rows, report) =
            compute_features(&[point(1, 30.0), second, point(3, 32.0)], &ctx, &cfg).unwrap();

        assert_eq!(value(&schema, &rows[0].values, "stack_mass_tons"), FALLBACK_STACK_MASS_TONS);
        assert_eq!(value(&schema, &rows[0].values, "humidity"), FALLBACK_HUMIDITY);
        assert_eq!(value(&schema, &rows[2].values, "stack_mass_tons"), 800.0);
        assert_eq!(value(&schema, &rows[2].values, "humidity"), 40.0);
        assert_eq!(value(&schema, &rows[2].values, "dryness"), 60.0);
        assert_eq!(report.defaulted_mass, 1);
    }

    #[test]
    fn appended_row_matches_batch_row() {
        let cfg = PipelineConfig::default();
        let points: Vec<SeriesPoint> = (1..=9)
            .map(|d| point(d, 20.0 + (d * d) as f64 % 17.0))
            .collect();
        let ctx = FeatureContext::fit(&points);
        let (_, rows, _) = compute_features(&points, &ctx, &cfg).unwrap();

        let (appended, _) =
            compute_appended_row(&points[..8], &points[8], &ctx, &cfg).unwrap();
        assert_eq!(appended, rows[8].values);
    }

    #[test]
    fn context_fingerprint_tracks_vocabulary() {
        let mut a = point(1, 30.0);
        a.picket = Some("p1".to_string());
        let ctx = FeatureContext::fit(&[a.clone()]);
        let mut b = a;
        b.picket = Some("p2".to_string());
        let other = FeatureContext::fit(&[b]);
        assert_ne!(ctx.fingerprint(), other.fingerprint());
        assert_eq!(ctx.fingerprint(), ctx.clone().fingerprint());
    }
}
