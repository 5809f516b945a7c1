//! Ingestion and normalization of the four raw sources.
//!
//! Each reader maps raw headers through [`ColumnRenames`] onto the canonical
//! schema, normalizes identifiers, and drops rows whose dates or required
//! values cannot be parsed. Drops are counted in a [`SourceReport`] rather
//! than failing the source. Weather is concatenated across every file and
//! aggregated to one row per calendar day before any join happens.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{PipelineConfig, SourcePaths};
use crate::records::{
    normalize_category, CombustionEvent, Measurement, StockpileKey, SupplyEvent, WeatherDay,
    WeatherSample,
};

pub const COL_STORAGE_ID: &str = "storage_id";
pub const COL_STACK_ID: &str = "stack_id";
pub const COL_FIRE_START_DATE: &str = "fire_start_date";
pub const COL_STACK_FORMATION_DATE: &str = "stack_formation_date";
pub const COL_UNLOAD_DATE: &str = "unload_date";
pub const COL_WEIGHT_TONS: &str = "weight_tons";
pub const COL_CARGO_GRADE: &str = "cargo_grade";
pub const COL_MEASUREMENT_DATE: &str = "measurement_date";
pub const COL_MAX_TEMPERATURE: &str = "max_temperature";
pub const COL_PICKET: &str = "picket";
pub const COL_SHIFT: &str = "shift";
pub const COL_WEATHER_DATE: &str = "date";
pub const COL_AIR_TEMP: &str = "air_temp";
pub const COL_HUMIDITY: &str = "humidity";
pub const COL_PRECIPITATION: &str = "precipitation";
pub const COL_PRESSURE: &str = "pressure";
pub const COL_CLOUD_COVER: &str = "cloud_cover";
pub const COL_VISIBILITY: &str = "visibility";
pub const COL_WIND_SPEED_AVG: &str = "wind_speed_avg";
pub const COL_WIND_SPEED_MAX: &str = "wind_speed_max";
pub const COL_WIND_DIRECTION: &str = "wind_direction";
pub const COL_WEATHER_CODE: &str = "weather_code";

const FIRES_COLUMNS: [&str; 4] = [
    COL_STORAGE_ID,
    COL_STACK_ID,
    COL_FIRE_START_DATE,
    COL_STACK_FORMATION_DATE,
];
const FIRES_REQUIRED: [&str; 3] = [COL_STORAGE_ID, COL_STACK_ID, COL_FIRE_START_DATE];

const SUPPLIES_COLUMNS: [&str; 5] = [
    COL_STORAGE_ID,
    COL_STACK_ID,
    COL_UNLOAD_DATE,
    COL_WEIGHT_TONS,
    COL_CARGO_GRADE,
];
const SUPPLIES_REQUIRED: [&str; 4] = [COL_STORAGE_ID, COL_STACK_ID, COL_UNLOAD_DATE, COL_WEIGHT_TONS];

const TEMPERATURE_COLUMNS: [&str; 6] = [
    COL_STORAGE_ID,
    COL_STACK_ID,
    COL_MEASUREMENT_DATE,
    COL_MAX_TEMPERATURE,
    COL_PICKET,
    COL_SHIFT,
];
const TEMPERATURE_REQUIRED: [&str; 4] = [
    COL_STORAGE_ID,
    COL_STACK_ID,
    COL_MEASUREMENT_DATE,
    COL_MAX_TEMPERATURE,
];

const WEATHER_COLUMNS: [&str; 11] = [
    COL_WEATHER_DATE,
    COL_AIR_TEMP,
    COL_HUMIDITY,
    COL_PRECIPITATION,
    COL_PRESSURE,
    COL_CLOUD_COVER,
    COL_VISIBILITY,
    COL_WIND_SPEED_AVG,
    COL_WIND_SPEED_MAX,
    COL_WIND_DIRECTION,
    COL_WEATHER_CODE,
];
const WEATHER_REQUIRED: [&str; 2] = [COL_WEATHER_DATE, COL_AIR_TEMP];

const NAIVE_DATETIME_FORMATS: [&str; 9] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
    "%Y/%m/%d %H:%M:%S",
];
const DATE_FORMATS: [&str; 3] = ["%Y-%m-%d", "%d.%m.%Y", "%Y/%m/%d"];
const OFFSET_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%z"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceKind {
    Fires,
    Supplies,
    Temperature,
    Weather,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fires => "fires",
            Self::Supplies => "supplies",
            Self::Temperature => "temperature",
            Self::Weather => "weather",
        }
    }

    fn canonical_columns(self) -> &'static [&'static str] {
        match self {
            Self::Fires => &FIRES_COLUMNS,
            Self::Supplies => &SUPPLIES_COLUMNS,
            Self::Temperature => &TEMPERATURE_COLUMNS,
            Self::Weather => &WEATHER_COLUMNS,
        }
    }

    fn required_columns(self) -> &'static [&'static str] {
        match self {
            Self::Fires => &FIRES_REQUIRED,
            Self::Supplies => &SUPPLIES_REQUIRED,
            Self::Temperature => &TEMPERATURE_REQUIRED,
            Self::Weather => &WEATHER_REQUIRED,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{kind} source not found at {}", .path.display())]
    SourceNotFound { kind: SourceKind, path: PathBuf },
    #[error("{kind} source is missing required columns: {missing:?}")]
    Schema {
        kind: SourceKind,
        missing: Vec<String>,
    },
    #[error("{kind} CSV error: {error}")]
    Csv {
        kind: SourceKind,
        #[source]
        error: csv::Error,
    },
    #[error("{kind} I/O error at {}: {error}", .path.display())]
    Io {
        kind: SourceKind,
        path: PathBuf,
        #[source]
        error: io::Error,
    },
}

impl IngestError {
    pub fn source_kind(&self) -> SourceKind {
        match self {
            Self::SourceNotFound { kind, .. }
            | Self::Schema { kind, .. }
            | Self::Csv { kind, .. }
            | Self::Io { kind, .. } => *kind,
        }
    }
}

/// Raw header -> canonical column rename table.
///
/// Lookups ignore case and surrounding/inner whitespace runs. Canonical names
/// are always accepted as their own alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRenames {
    aliases: HashMap<SourceKind, BTreeMap<String, &'static str>>,
}

impl Default for ColumnRenames {
    fn default() -> Self {
        let mut renames = Self {
            aliases: HashMap::new(),
        };

        for source in [
            SourceKind::Fires,
            SourceKind::Supplies,
            SourceKind::Temperature,
        ] {
            renames = renames
                .with_alias(source, "Склад", COL_STORAGE_ID)
                .with_alias(source, "Штабель", COL_STACK_ID);
        }

        renames
            .with_alias(SourceKind::Fires, "Дата начала", COL_FIRE_START_DATE)
            .with_alias(SourceKind::Fires, "fire_date", COL_FIRE_START_DATE)
            .with_alias(SourceKind::Fires, "fire_start", COL_FIRE_START_DATE)
            .with_alias(SourceKind::Fires, "Нач.форм.штабеля", COL_STACK_FORMATION_DATE)
            .with_alias(SourceKind::Supplies, "ВыгрузкаНаСклад", COL_UNLOAD_DATE)
            .with_alias(SourceKind::Supplies, "supply_date", COL_UNLOAD_DATE)
            .with_alias(SourceKind::Supplies, "На склад, тн", COL_WEIGHT_TONS)
            .with_alias(SourceKind::Supplies, "weight_in", COL_WEIGHT_TONS)
            .with_alias(SourceKind::Supplies, "stack_mass_tons", COL_WEIGHT_TONS)
            .with_alias(SourceKind::Supplies, "Наим. ЕТСНГ", COL_CARGO_GRADE)
            .with_alias(SourceKind::Supplies, "coal_grade", COL_CARGO_GRADE)
            .with_alias(SourceKind::Temperature, "Дата акта", COL_MEASUREMENT_DATE)
            .with_alias(
                SourceKind::Temperature,
                "Максимальная температура",
                COL_MAX_TEMPERATURE,
            )
            .with_alias(SourceKind::Temperature, "max_temp", COL_MAX_TEMPERATURE)
            .with_alias(SourceKind::Temperature, "Пикет", COL_PICKET)
            .with_alias(SourceKind::Temperature, "Смена", COL_SHIFT)
            .with_alias(SourceKind::Weather, "t", COL_AIR_TEMP)
            .with_alias(SourceKind::Weather, "weather_temp", COL_AIR_TEMP)
            .with_alias(SourceKind::Weather, "p", COL_PRESSURE)
            .with_alias(SourceKind::Weather, "cloudcover", COL_CLOUD_COVER)
            .with_alias(SourceKind::Weather, "v_avg", COL_WIND_SPEED_AVG)
            .with_alias(SourceKind::Weather, "v_max", COL_WIND_SPEED_MAX)
            .with_alias(SourceKind::Weather, "wind_dir", COL_WIND_DIRECTION)
    }
}

impl ColumnRenames {
    pub fn with_alias(mut self, source: SourceKind, raw: &str, canonical: &'static str) -> Self {
        self.aliases
            .entry(source)
            .or_default()
            .insert(normalize_header(raw), canonical);
        self
    }

    pub fn resolve(&self, source: SourceKind, raw_header: &str) -> Option<&'static str> {
        let normalized = normalize_header(raw_header);
        if let Some(canonical) = self
            .aliases
            .get(&source)
            .and_then(|table| table.get(&normalized))
        {
            return Some(*canonical);
        }
        source
            .canonical_columns()
            .iter()
            .copied()
            .find(|canonical| *canonical == normalized)
    }
}

fn normalize_header(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: Option<SourceKind>,
    pub files: u64,
    pub rows_read: u64,
    pub rows_kept: u64,
    pub dropped_unparsable_date: u64,
    pub dropped_invalid_value: u64,
    pub dropped_missing_id: u64,
    /// Rows whose bytes were not valid UTF-8.
    pub dropped_invalid_encoding: u64,
    pub duplicates_removed: u64,
    /// Optional cells that were blank or unparsable and became absent.
    pub absent_optional_values: u64,
}

impl SourceReport {
    fn new(source: SourceKind) -> Self {
        Self {
            source: Some(source),
            ..Self::default()
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped_unparsable_date
            + self.dropped_invalid_value
            + self.dropped_missing_id
            + self.dropped_invalid_encoding
            + self.duplicates_removed
    }

    fn merge(&mut self, other: &SourceReport) {
        self.files += other.files;
        self.rows_read += other.rows_read;
        self.rows_kept += other.rows_kept;
        self.dropped_unparsable_date += other.dropped_unparsable_date;
        self.dropped_invalid_value += other.dropped_invalid_value;
        self.dropped_missing_id += other.dropped_missing_id;
        self.dropped_invalid_encoding += other.dropped_invalid_encoding;
        self.duplicates_removed += other.duplicates_removed;
        self.absent_optional_values += other.absent_optional_values;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub sources: Vec<SourceReport>,
    pub weather_days: u64,
}

impl IngestReport {
    pub fn source(&self, kind: SourceKind) -> Option<&SourceReport> {
        self.sources.iter().find(|report| report.source == Some(kind))
    }

    pub fn total_dropped(&self) -> u64 {
        self.sources.iter().map(SourceReport::dropped).sum()
    }
}

/// The four sources after ingestion, ready for association.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawSources {
    pub fires: Vec<CombustionEvent>,
    pub supplies: Vec<SupplyEvent>,
    pub measurements: Vec<Measurement>,
    pub weather: Vec<WeatherDay>,
}

/// Per-source outcomes; one failing source never prevents loading the others.
#[derive(Debug)]
pub struct SourceLoadOutcome {
    pub fires: Result<(Vec<CombustionEvent>, SourceReport), IngestError>,
    pub supplies: Result<(Vec<SupplyEvent>, SourceReport), IngestError>,
    pub temperature: Result<(Vec<Measurement>, SourceReport), IngestError>,
    pub weather: Result<(Vec<WeatherDay>, SourceReport), IngestError>,
}

impl SourceLoadOutcome {
    pub fn errors(&self) -> Vec<&IngestError> {
        let mut errors = Vec::new();
        if let Err(err) = &self.fires {
            errors.push(err);
        }
        if let Err(err) = &self.supplies {
            errors.push(err);
        }
        if let Err(err) = &self.temperature {
            errors.push(err);
        }
        if let Err(err) = &self.weather {
            errors.push(err);
        }
        errors
    }

    /// Fails with the first source error in fires, supplies, temperature,
    /// weather order.
    pub fn into_raw_sources(self) -> Result<(RawSources, IngestReport), IngestError> {
        let (fires, fires_report) = self.fires?;
        let (supplies, supplies_report) = self.supplies?;
        let (measurements, temperature_report) = self.temperature?;
        let (weather, weather_report) = self.weather?;

        let report = IngestReport {
            weather_days: weather.len() as u64,
            sources: vec![
                fires_report,
                supplies_report,
                temperature_report,
                weather_report,
            ],
        };

        Ok((
            RawSources {
                fires,
                supplies,
                measurements,
                weather,
            },
            report,
        ))
    }
}

pub fn load_all_sources(
    paths: &SourcePaths,
    renames: &ColumnRenames,
    cfg: &PipelineConfig,
) -> SourceLoadOutcome {
    let tz = cfg.site_timezone;
    let outcome = SourceLoadOutcome {
        fires: open_source(SourceKind::Fires, &paths.fires)
            .and_then(|file| read_fires(file, renames, tz)),
        supplies: open_source(SourceKind::Supplies, &paths.supplies)
            .and_then(|file| read_supplies(file, renames, tz)),
        temperature: open_source(SourceKind::Temperature, &paths.temperature)
            .and_then(|file| read_measurements(file, renames, tz)),
        weather: load_weather(paths, renames, tz),
    };

    for err in outcome.errors() {
        warn!(
            component = "ingest",
            event = "ingest.source.failed",
            source = err.source_kind().as_str(),
            error = %err
        );
    }

    outcome
}

pub fn load_raw_sources(
    paths: &SourcePaths,
    renames: &ColumnRenames,
    cfg: &PipelineConfig,
) -> Result<(RawSources, IngestReport), IngestError> {
    load_all_sources(paths, renames, cfg).into_raw_sources()
}

/// Reads every weather file and aggregates the concatenation per day.
pub fn load_weather(
    paths: &SourcePaths,
    renames: &ColumnRenames,
    tz: Tz,
) -> Result<(Vec<WeatherDay>, SourceReport), IngestError> {
    if paths.weather.is_empty() {
        return Err(IngestError::SourceNotFound {
            kind: SourceKind::Weather,
            path: paths.weather_pattern(),
        });
    }

    let mut samples = Vec::new();
    let mut report = SourceReport::new(SourceKind::Weather);
    for path in &paths.weather {
        let file = open_source(SourceKind::Weather, path)?;
        let (mut file_samples, file_report) = read_weather_samples(file, renames, tz)?;
        samples.append(&mut file_samples);
        report.merge(&file_report);
    }

    let days = aggregate_weather_daily(&samples);
    info!(
        component = "ingest",
        event = "ingest.weather.aggregated",
        files = report.files,
        samples = samples.len(),
        days = days.len()
    );
    Ok((days, report))
}

fn open_source(source: SourceKind, path: &Path) -> Result<fs::File, IngestError> {
    fs::File::open(path).map_err(|error| match error.kind() {
        io::ErrorKind::NotFound => IngestError::SourceNotFound {
            kind: source,
            path: path.to_path_buf(),
        },
        _ => IngestError::Io {
            kind: source,
            path: path.to_path_buf(),
            error,
        },
    })
}

pub fn read_fires<R: Read>(
    reader: R,
    renames: &ColumnRenames,
    tz: Tz,
) -> Result<(Vec<CombustionEvent>, SourceReport), IngestError> {
    let (mut fires, mut report) =
        read_source(SourceKind::Fires, reader, renames, |columns, record, report| {
            let key = parse_key(columns, record, report)?;
            let fire_start_at = parse_required_date(columns, record, COL_FIRE_START_DATE, tz, report)?;
            let stack_formation_at =
                parse_optional_date(columns, record, COL_STACK_FORMATION_DATE, tz, report);
            Some(CombustionEvent {
                key,
                fire_start_at,
                stack_formation_at,
            })
        })?;

    fires.sort_by(|a, b| {
        (&a.key, a.fire_start_at)
            .cmp(&(&b.key, b.fire_start_at))
            .then_with(|| b.stack_formation_at.is_some().cmp(&a.stack_formation_at.is_some()))
    });
    let before = fires.len();
    fires.dedup_by(|later, earlier| {
        later.key == earlier.key && later.fire_start_at == earlier.fire_start_at
    });
    report.duplicates_removed += (before - fires.len()) as u64;
    report.rows_kept = fires.len() as u64;

    log_source_report(&report);
    Ok((fires, report))
}

pub fn read_supplies<R: Read>(
    reader: R,
    renames: &ColumnRenames,
    tz: Tz,
) -> Result<(Vec<SupplyEvent>, SourceReport), IngestError> {
    let (supplies, report) =
        read_source(SourceKind::Supplies, reader, renames, |columns, record, report| {
            let key = parse_key(columns, record, report)?;
            let unload_at = parse_required_date(columns, record, COL_UNLOAD_DATE, tz, report)?;
            let weight_tons = parse_optional_number(columns, record, COL_WEIGHT_TONS, report);
            let cargo_grade = columns
                .get(record, COL_CARGO_GRADE)
                .and_then(normalize_category);
            Some(SupplyEvent {
                key,
                unload_at,
                weight_tons,
                cargo_grade,
            })
        })?;

    log_source_report(&report);
    Ok((supplies, report))
}

pub fn read_measurements<R: Read>(
    reader: R,
    renames: &ColumnRenames,
    tz: Tz,
) -> Result<(Vec<Measurement>, SourceReport), IngestError> {
    let (measurements, report) =
        read_source(SourceKind::Temperature, reader, renames, |columns, record, report| {
            let key = parse_key(columns, record, report)?;
            let measured_at =
                parse_required_date(columns, record, COL_MEASUREMENT_DATE, tz, report)?;
            let max_temperature = match parse_number(columns.get(record, COL_MAX_TEMPERATURE)) {
                NumericCell::Value(value) => value,
                NumericCell::Empty | NumericCell::Invalid => {
                    report.dropped_invalid_value += 1;
                    return None;
                }
            };
            Some(Measurement {
                key,
                measured_at,
                max_temperature,
                picket: columns.get(record, COL_PICKET).and_then(normalize_category),
                shift: columns.get(record, COL_SHIFT).and_then(normalize_category),
            })
        })?;

    log_source_report(&report);
    Ok((measurements, report))
}

pub fn read_weather_samples<R: Read>(
    reader: R,
    renames: &ColumnRenames,
    tz: Tz,
) -> Result<(Vec<WeatherSample>, SourceReport), IngestError> {
    read_source(SourceKind::Weather, reader, renames, |columns, record, report| {
        let observed_at = parse_required_date(columns, record, COL_WEATHER_DATE, tz, report)?;
        Some(WeatherSample {
            observed_at: Some(observed_at),
            air_temp: parse_optional_number(columns, record, COL_AIR_TEMP, report),
            humidity: parse_optional_number(columns, record, COL_HUMIDITY, report),
            precipitation: parse_optional_number(columns, record, COL_PRECIPITATION, report),
            pressure: parse_optional_number(columns, record, COL_PRESSURE, report),
            cloud_cover: parse_optional_number(columns, record, COL_CLOUD_COVER, report),
            visibility: parse_optional_number(columns, record, COL_VISIBILITY, report),
            wind_speed_avg: parse_optional_number(columns, record, COL_WIND_SPEED_AVG, report),
            wind_speed_max: parse_optional_number(columns, record, COL_WIND_SPEED_MAX, report),
            wind_direction: parse_optional_number(columns, record, COL_WIND_DIRECTION, report),
            weather_code: columns
                .get(record, COL_WEATHER_CODE)
                .and_then(normalize_weather_code),
        })
    })
}

/// Collapses sub-daily samples into one [`WeatherDay`] per calendar date.
///
/// Means for level quantities, sum for precipitation, max for gusts, a
/// circular mean for wind direction and the mode (smallest on ties) for the
/// weather code. Samples without a timestamp are ignored.
pub fn aggregate_weather_daily(samples: &[WeatherSample]) -> Vec<WeatherDay> {
    let mut by_day: BTreeMap<NaiveDate, Vec<&WeatherSample>> = BTreeMap::new();
    for sample in samples {
        if let Some(observed_at) = sample.observed_at {
            by_day.entry(observed_at.date()).or_default().push(sample);
        }
    }

    by_day
        .into_iter()
        .map(|(date, day_samples)| WeatherDay {
            date,
            air_temp: mean(day_samples.iter().filter_map(|s| s.air_temp)),
            humidity: mean(day_samples.iter().filter_map(|s| s.humidity)),
            precipitation: sum(day_samples.iter().filter_map(|s| s.precipitation)),
            pressure: mean(day_samples.iter().filter_map(|s| s.pressure)),
            cloud_cover: mean(day_samples.iter().filter_map(|s| s.cloud_cover)),
            visibility: mean(day_samples.iter().filter_map(|s| s.visibility)),
            wind_speed_avg: mean(day_samples.iter().filter_map(|s| s.wind_speed_avg)),
            wind_speed_max: day_samples
                .iter()
                .filter_map(|s| s.wind_speed_max)
                .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v)))),
            wind_direction: circular_mean_degrees(
                day_samples.iter().filter_map(|s| s.wind_direction),
            ),
            weather_code: mode(day_samples.iter().filter_map(|s| s.weather_code.clone())),
        })
        .collect()
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (total, count) = values.fold((0.0, 0usize), |(t, c), v| (t + v, c + 1));
    if count == 0 {
        None
    } else {
        Some(total / count as f64)
    }
}

fn sum(values: impl Iterator<Item = f64>) -> Option<f64> {
    values.fold(None, |acc, v| Some(acc.unwrap_or(0.0) + v))
}

fn circular_mean_degrees(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sin_sum, cos_sum, count) = values.fold((0.0, 0.0, 0usize), |(s, c, n), deg| {
        let rad = deg.to_radians();
        (s + rad.sin(), c + rad.cos(), n + 1)
    });
    if count == 0 {
        return None;
    }
    let degrees = sin_sum.atan2(cos_sum).to_degrees().rem_euclid(360.0);
    // Rounding noise near north should not flip to ~360.
    if (360.0 - degrees).abs() < 1e-9 {
        Some(0.0)
    } else {
        Some(degrees)
    }
}

fn mode(values: impl Iterator<Item = String>) -> Option<String> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for value in values {
        *counts.entry(value).or_default() += 1;
    }
    let mut best: Option<(String, usize)> = None;
    for (value, count) in counts {
        let replaces = match &best {
            None => true,
            Some((best_value, best_count)) => {
                count > *best_count
                    || (count == *best_count && code_order(&value, best_value) == Ordering::Less)
            }
        };
        if replaces {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value)
}

/// Numeric codes compare by value, anything else lexically.
fn code_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.total_cmp(&y).then_with(|| a.cmp(b)),
        _ => a.cmp(b),
    }
}

fn normalize_weather_code(raw: &str) -> Option<String> {
    match parse_number(Some(raw)) {
        NumericCell::Value(value) if value.fract() == 0.0 => Some(format!("{}", value as i64)),
        _ => normalize_category(raw),
    }
}

struct ColumnIndex {
    positions: HashMap<&'static str, usize>,
}

impl ColumnIndex {
    fn get<'r>(&self, record: &'r StringRecord, column: &str) -> Option<&'r str> {
        self.positions
            .get(column)
            .and_then(|idx| record.get(*idx))
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

fn read_source<R: Read, T>(
    source: SourceKind,
    reader: R,
    renames: &ColumnRenames,
    mut parse_row: impl FnMut(&ColumnIndex, &StringRecord, &mut SourceReport) -> Option<T>,
) -> Result<(Vec<T>, SourceReport), IngestError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(reader);

    let headers = csv_reader
        .headers()
        .map_err(|error| IngestError::Csv { kind: source, error })?
        .clone();

    let mut positions = HashMap::new();
    for (idx, header) in headers.iter().enumerate() {
        if let Some(canonical) = renames.resolve(source, header) {
            positions.entry(canonical).or_insert(idx);
        }
    }

    let missing: Vec<String> = source
        .required_columns()
        .iter()
        .filter(|column| !positions.contains_key(*column))
        .map(|column| (*column).to_string())
        .collect();
    if !missing.is_empty() {
        return Err(IngestError::Schema {
            kind: source,
            missing,
        });
    }

    let columns = ColumnIndex { positions };
    let mut report = SourceReport::new(source);
    report.files = 1;
    let mut rows = Vec::new();

    for record in csv_reader.byte_records() {
        let record = record.map_err(|error| IngestError::Csv { kind: source, error })?;
        report.rows_read += 1;
        let Ok(record) = StringRecord::from_byte_record(record) else {
            report.dropped_invalid_encoding += 1;
            continue;
        };
        if let Some(row) = parse_row(&columns, &record, &mut report) {
            rows.push(row);
        }
    }

    report.rows_kept = rows.len() as u64;
    Ok((rows, report))
}

fn parse_key(
    columns: &ColumnIndex,
    record: &StringRecord,
    report: &mut SourceReport,
) -> Option<StockpileKey> {
    let key = StockpileKey::new(
        columns.get(record, COL_STORAGE_ID).unwrap_or_default(),
        columns.get(record, COL_STACK_ID).unwrap_or_default(),
    );
    if key.is_complete() {
        Some(key)
    } else {
        report.dropped_missing_id += 1;
        None
    }
}

fn parse_required_date(
    columns: &ColumnIndex,
    record: &StringRecord,
    column: &str,
    tz: Tz,
    report: &mut SourceReport,
) -> Option<NaiveDateTime> {
    let parsed = columns
        .get(record, column)
        .and_then(|raw| parse_timestamp(raw, tz));
    if parsed.is_none() {
        report.dropped_unparsable_date += 1;
    }
    parsed
}

fn parse_optional_date(
    columns: &ColumnIndex,
    record: &StringRecord,
    column: &str,
    tz: Tz,
    report: &mut SourceReport,
) -> Option<NaiveDateTime> {
    let parsed = columns
        .get(record, column)
        .and_then(|raw| parse_timestamp(raw, tz));
    if parsed.is_none() {
        report.absent_optional_values += 1;
    }
    parsed
}

fn parse_optional_number(
    columns: &ColumnIndex,
    record: &StringRecord,
    column: &str,
    report: &mut SourceReport,
) -> Option<f64> {
    match parse_number(columns.get(record, column)) {
        NumericCell::Value(value) => Some(value),
        NumericCell::Empty | NumericCell::Invalid => {
            report.absent_optional_values += 1;
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericCell {
    Empty,
    Value(f64),
    Invalid,
}

/// Parses a numeric cell, accepting a decimal comma and digit-group spaces.
pub fn parse_number(raw: Option<&str>) -> NumericCell {
    let Some(raw) = raw else {
        return NumericCell::Empty;
    };
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if cleaned.is_empty() {
        return NumericCell::Empty;
    }
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() => NumericCell::Value(value),
        _ => NumericCell::Invalid,
    }
}

/// Parses a raw timestamp into site-local naive time.
///
/// Offset-carrying inputs are converted into `tz` first; date-only inputs
/// map to midnight.
pub fn parse_timestamp(raw: &str, tz: Tz) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&tz).naive_local());
    }
    for format in OFFSET_DATETIME_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(raw, format) {
            return Some(dt.with_timezone(&tz).naive_local());
        }
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

fn log_source_report(report: &SourceReport) {
    let source = report.source.map(SourceKind::as_str).unwrap_or("unknown");
    info!(
        component = "ingest",
        event = "ingest.source.loaded",
        source,
        rows_read = report.rows_read,
        rows_kept = report.rows_kept
    );
    if report.dropped() > 0 {
        warn!(
            component = "ingest",
            event = "ingest.rows.dropped",
            source,
            unparsable_date = report.dropped_unparsable_date,
            invalid_value = report.dropped_invalid_value,
            missing_id = report.dropped_missing_id,
            invalid_encoding = report.dropped_invalid_encoding,
            duplicates = report.duplicates_removed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn parses_common_timestamp_shapes() {
        let tz = Tz::UTC;
        assert_eq!(parse_timestamp("2020-03-04", tz), Some(ts(2020, 3, 4, 0, 0)));
        assert_eq!(
            parse_timestamp("2020-03-04 13:45:00", tz),
            Some(ts(2020, 3, 4, 13, 45))
        );
        assert_eq!(
            parse_timestamp("04.03.2020 13:45", tz),
            Some(ts(2020, 3, 4, 13, 45))
        );
        assert_eq!(parse_timestamp("not a date", tz), None);
        assert_eq!(parse_timestamp("", tz), None);
    }

    #[test]
    fn offset_timestamps_are_moved_into_site_timezone() {
        let parsed = parse_timestamp("2020-03-04T22:00:00+00:00", chrono_tz::Asia::Vladivostok);
        assert_eq!(parsed, Some(ts(2020, 3, 5, 8, 0)));
    }

    #[test]
    fn numbers_accept_decimal_comma() {
        assert_eq!(parse_number(Some("12,5")), NumericCell::Value(12.5));
        assert_eq!(parse_number(Some("1 234.5")), NumericCell::Value(1234.5));
        assert_eq!(parse_number(Some("  ")), NumericCell::Empty);
        assert_eq!(parse_number(None), NumericCell::Empty);
        assert_eq!(parse_number(Some("abc")), NumericCell::Invalid);
    }

    #[test]
    fn renames_ignore_case_and_whitespace() {
        let renames = ColumnRenames::default();
        assert_eq!(
            renames.resolve(SourceKind::Temperature, "  максимальная   температура "),
            Some(COL_MAX_TEMPERATURE)
        );
        assert_eq!(
            renames.resolve(SourceKind::Temperature, "\u{feff}Склад"),
            Some(COL_STORAGE_ID)
        );
        assert_eq!(
            renames.resolve(SourceKind::Weather, "MAX_TEMPERATURE"),
            None
        );
        assert_eq!(
            renames.resolve(SourceKind::Weather, "Wind_Speed_Avg"),
            Some(COL_WIND_SPEED_AVG)
        );
    }

    #[test]
    fn measurements_drop_unparsable_dates_and_temperatures() {
        let csv = "Склад,Штабель,Дата акта,Максимальная температура,Пикет,Смена\n\
                   3, 21 ,2020-01-01,30,П1,1\n\
                   3,21,garbage,31,П1,1\n\
                   3,21,2020-01-02,,П1,2\n\
                   ,21,2020-01-03,33,П1,2\n";
        let (rows, report) =
            read_measurements(csv.as_bytes(), &ColumnRenames::default(), Tz::UTC).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, StockpileKey::new("3", "21"));
        assert_eq!(rows[0].picket.as_deref(), Some("п1"));
        assert_eq!(report.rows_read, 4);
        assert_eq!(report.dropped_unparsable_date, 1);
        assert_eq!(report.dropped_invalid_value, 1);
        assert_eq!(report.dropped_missing_id, 1);
    }

    #[test]
    fn invalid_utf8_row_is_dropped_not_fatal() {
        let mut csv = b"storage_id,stack_id,measurement_date,max_temperature,picket\n".to_vec();
        csv.extend_from_slice(b"3,21,2020-01-01,30,p1\n");
        csv.extend_from_slice(b"3,21,2020-01-02,31,p\xff\n");
        csv.extend_from_slice(b"3,21,2020-01-03,32,p2\n");
        let (rows, report) =
            read_measurements(csv.as_slice(), &ColumnRenames::default(), Tz::UTC).unwrap();

        let temps: Vec<f64> = rows.iter().map(|m| m.max_temperature).collect();
        assert_eq!(temps, vec![30.0, 32.0]);
        assert_eq!(report.rows_read, 3);
        assert_eq!(report.dropped_invalid_encoding, 1);
        assert_eq!(report.dropped(), 1);
    }

    #[test]
    fn numeric_code_ties_go_to_smallest_value() {
        let codes = |raw: &[&str]| mode(raw.iter().map(|c| c.to_string()));
        assert_eq!(codes(&["10", "2", "10", "2"]).as_deref(), Some("2"));
        assert_eq!(codes(&["61", "3", "61"]).as_deref(), Some("61"));
        assert_eq!(codes(&["b", "a"]).as_deref(), Some("a"));
        assert_eq!(codes(&[]), None);
    }

    #[test]
    fn missing_required_column_is_schema_error() {
        let csv = "Склад,Штабель,Максимальная температура\n3,21,30\n";
        let err = read_measurements(csv.as_bytes(), &ColumnRenames::default(), Tz::UTC)
            .unwrap_err();
        match err {
            IngestError::Schema { kind, missing } => {
                assert_eq!(kind, SourceKind::Temperature);
                assert_eq!(missing, vec![COL_MEASUREMENT_DATE.to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_fires_are_removed_and_counted() {
        let csv = "Склад,Штабель,Дата начала,Нач.форм.штабеля\n\
                   3,21,2020-02-01,\n\
                   3,21,2020-02-01,2019-12-01\n\
                   3,22,2020-02-03,\n";
        let (fires, report) =
            read_fires(csv.as_bytes(), &ColumnRenames::default(), Tz::UTC).unwrap();
        assert_eq!(fires.len(), 2);
        assert_eq!(report.duplicates_removed, 1);
        assert_eq!(
            fires[0].stack_formation_at,
            Some(ts(2019, 12, 1, 0, 0)),
            "duplicate carrying a formation date is preferred"
        );
    }

    #[test]
    fn weather_aggregates_per_day() {
        let samples = vec![
            WeatherSample {
                observed_at: Some(ts(2020, 1, 1, 0, 0)),
                air_temp: Some(-2.0),
                precipitation: Some(1.0),
                wind_speed_max: Some(7.0),
                wind_direction: Some(350.0),
                weather_code: Some("3".to_string()),
                ..WeatherSample::default()
            },
            WeatherSample {
                observed_at: Some(ts(2020, 1, 1, 12, 0)),
                air_temp: Some(4.0),
                precipitation: Some(0.5),
                wind_speed_max: Some(9.0),
                wind_direction: Some(10.0),
                weather_code: Some("1".to_string()),
                ..WeatherSample::default()
            },
            WeatherSample {
                observed_at: Some(ts(2020, 1, 2, 6, 0)),
                air_temp: Some(5.0),
                ..WeatherSample::default()
            },
        ];

        let days = aggregate_weather_daily(&samples);
        assert_eq!(days.len(), 2);
        let first = &days[0];
        assert_eq!(first.air_temp, Some(1.0));
        assert_eq!(first.precipitation, Some(1.5));
        assert_eq!(first.wind_speed_max, Some(9.0));
        assert!(first.wind_direction.unwrap().abs() < 1e-9);
        assert_eq!(first.weather_code.as_deref(), Some("1"));
        assert_eq!(first.humidity, None);
        assert_eq!(days[1].precipitation, None);
    }

    #[test]
    fn weather_codes_are_normalized_from_float_exports() {
        assert_eq!(normalize_weather_code("3.0"), Some("3".to_string()));
        assert_eq!(normalize_weather_code(" RA "), Some("ra".to_string()));
    }
}
