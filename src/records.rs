//! Canonical value types shared by every pipeline stage.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Composite natural key of one physical stockpile.
///
/// Both parts are stored normalized (see [`normalize_id`]), so two keys built
/// from differently cased or padded raw values compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StockpileKey {
    pub storage_id: String,
    pub stack_id: String,
}

impl StockpileKey {
    pub fn new(storage_id: &str, stack_id: &str) -> Self {
        Self {
            storage_id: normalize_id(storage_id),
            stack_id: normalize_id(stack_id),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.storage_id.is_empty() && !self.stack_id.is_empty()
    }
}

impl fmt::Display for StockpileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.storage_id, self.stack_id)
    }
}

/// Trim, case-fold and strip a float-export suffix (`"21.0"` -> `"21"`).
pub fn normalize_id(raw: &str) -> String {
    let folded = raw.trim().to_lowercase();
    match folded.strip_suffix(".0") {
        Some(int_part) if !int_part.is_empty() && int_part.chars().all(|c| c.is_ascii_digit()) => {
            int_part.to_string()
        }
        _ => folded,
    }
}

/// Normalizes a free-form categorical value; empty input means "absent".
pub fn normalize_category(raw: &str) -> Option<String> {
    let folded = normalize_id(raw);
    if folded.is_empty() {
        None
    } else {
        Some(folded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub key: StockpileKey,
    pub measured_at: NaiveDateTime,
    pub max_temperature: f64,
    pub picket: Option<String>,
    pub shift: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplyEvent {
    pub key: StockpileKey,
    pub unload_at: NaiveDateTime,
    pub weight_tons: Option<f64>,
    pub cargo_grade: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombustionEvent {
    pub key: StockpileKey,
    pub fire_start_at: NaiveDateTime,
    pub stack_formation_at: Option<NaiveDateTime>,
}

/// One raw, sub-daily weather observation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WeatherSample {
    pub observed_at: Option<NaiveDateTime>,
    pub air_temp: Option<f64>,
    pub humidity: Option<f64>,
    pub precipitation: Option<f64>,
    pub pressure: Option<f64>,
    pub cloud_cover: Option<f64>,
    pub visibility: Option<f64>,
    pub wind_speed_avg: Option<f64>,
    pub wind_speed_max: Option<f64>,
    pub wind_direction: Option<f64>,
    pub weather_code: Option<String>,
}

/// Weather aggregated to one calendar day.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WeatherDay {
    pub date: NaiveDate,
    pub air_temp: Option<f64>,
    pub humidity: Option<f64>,
    pub precipitation: Option<f64>,
    pub pressure: Option<f64>,
    pub cloud_cover: Option<f64>,
    pub visibility: Option<f64>,
    pub wind_speed_avg: Option<f64>,
    pub wind_speed_max: Option<f64>,
    pub wind_direction: Option<f64>,
    pub weather_code: Option<String>,
}

impl WeatherDay {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            ..Self::default()
        }
    }
}
