//! SQLite-backed measurement history for inference lookups.

use std::path::Path;

use chrono::{DateTime, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::info;

use crate::features::SeriesPoint;
use crate::records::{StockpileKey, WeatherDay};
use crate::serving::HistoryLookup;

#[derive(Debug, Error)]
pub enum HistoryStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("weather payload error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid stored timestamp: {0}")]
    InvalidTimestamp(i64),
}

/// Raw series points keyed by
/// `(storage_id, stack_id, measurement_ts_ms, picket, shift)`.
pub struct SqliteHistoryStore {
    conn: Connection,
}

impl SqliteHistoryStore {
    pub fn open(path: &Path) -> Result<Self, HistoryStoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        ensure_schema(&conn)?;

        info!(
            component = "history_store",
            event = "history_store.opened",
            path = %path.display()
        );
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, HistoryStoreError> {
        let conn = Connection::open_in_memory()?;
        ensure_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Inserts or replaces points; returns how many were written.
    pub fn upsert_points(&mut self, points: &[SeriesPoint]) -> Result<u64, HistoryStoreError> {
        if points.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO measurements (
                    storage_id,
                    stack_id,
                    measurement_ts_ms,
                    picket,
                    max_temperature,
                    stack_mass_tons,
                    formation_ts_ms,
                    cargo_grade,
                    shift,
                    weather_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ON CONFLICT(storage_id, stack_id, measurement_ts_ms, picket, shift) DO UPDATE SET
                    max_temperature = excluded.max_temperature,
                    stack_mass_tons = excluded.stack_mass_tons,
                    formation_ts_ms = excluded.formation_ts_ms,
                    cargo_grade = excluded.cargo_grade,
                    weather_json = excluded.weather_json
                ",
            )?;

            for point in points {
                let weather_json = point
                    .weather
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?;
                stmt.execute(params![
                    point.key.storage_id,
                    point.key.stack_id,
                    to_ms(point.measured_at),
                    point.picket.as_deref().unwrap_or(""),
                    point.max_temperature,
                    point.stack_mass_tons,
                    point.formation_at.map(to_ms),
                    point.cargo_grade,
                    point.shift.as_deref().unwrap_or(""),
                    weather_json,
                ])?;
            }
        }
        tx.commit()?;

        info!(
            component = "history_store",
            event = "history_store.upserted",
            points = points.len()
        );
        Ok(points.len() as u64)
    }

    pub fn count(&self) -> Result<u64, HistoryStoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM measurements", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn latest_measurement_at(
        &self,
        key: &StockpileKey,
    ) -> Result<Option<NaiveDateTime>, HistoryStoreError> {
        let latest: Option<i64> = self
            .conn
            .query_row(
                "
                SELECT measurement_ts_ms
                FROM measurements
                WHERE storage_id = ?1 AND stack_id = ?2
                ORDER BY measurement_ts_ms DESC
                LIMIT 1
                ",
                params![key.storage_id, key.stack_id],
                |row| row.get(0),
            )
            .optional()?;
        latest.map(from_ms).transpose()
    }
}

impl HistoryLookup for SqliteHistoryStore {
    fn history_for(
        &self,
        key: &StockpileKey,
        at: NaiveDateTime,
    ) -> Result<Vec<SeriesPoint>, HistoryStoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT
                measurement_ts_ms,
                picket,
                max_temperature,
                stack_mass_tons,
                formation_ts_ms,
                cargo_grade,
                shift,
                weather_json
            FROM measurements
            WHERE storage_id = ?1
              AND stack_id = ?2
              AND measurement_ts_ms <= ?3
            ORDER BY measurement_ts_ms ASC, rowid ASC
            ",
        )?;

        let mut rows = stmt.query(params![key.storage_id, key.stack_id, to_ms(at)])?;
        let mut points = Vec::new();
        while let Some(row) = rows.next()? {
            points.push(point_from_row(key, row)?);
        }
        Ok(points)
    }
}

fn point_from_row(key: &StockpileKey, row: &Row<'_>) -> Result<SeriesPoint, HistoryStoreError> {
    let measured_ms: i64 = row.get(0)?;
    let picket: String = row.get(1)?;
    let shift: String = row.get(6)?;
    let formation_ms: Option<i64> = row.get(4)?;
    let weather_json: Option<String> = row.get(7)?;
    let weather = weather_json
        .as_deref()
        .map(serde_json::from_str::<WeatherDay>)
        .transpose()?;

    Ok(SeriesPoint {
        key: key.clone(),
        measured_at: from_ms(measured_ms)?,
        max_temperature: row.get(2)?,
        stack_mass_tons: row.get(3)?,
        formation_at: formation_ms.map(from_ms).transpose()?,
        weather,
        cargo_grade: row.get(5)?,
        picket: if picket.is_empty() { None } else { Some(picket) },
        shift: if shift.is_empty() { None } else { Some(shift) },
    })
}

fn ensure_schema(conn: &Connection) -> Result<(), HistoryStoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS measurements (
            storage_id TEXT NOT NULL,
            stack_id TEXT NOT NULL,
            measurement_ts_ms INTEGER NOT NULL,
            picket TEXT NOT NULL DEFAULT '',
            max_temperature REAL NOT NULL,
            stack_mass_tons REAL,
            formation_ts_ms INTEGER,
            cargo_grade TEXT,
            shift TEXT NOT NULL DEFAULT '',
            weather_json TEXT,
            PRIMARY KEY(storage_id, stack_id, measurement_ts_ms, picket, shift)
        );
        ",
    )?;
    Ok(())
}

fn to_ms(ts: NaiveDateTime) -> i64 {
    ts.and_utc().timestamp_millis()
}

fn from_ms(ms: i64) -> Result<NaiveDateTime, HistoryStoreError> {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.naive_utc())
        .ok_or(HistoryStoreError::InvalidTimestamp(ms))
}
