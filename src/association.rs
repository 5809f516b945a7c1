//! Temporal association of measurements with supplies, weather and fires.
//!
//! All joins are per stockpile and point-in-time: supplies are aggregated as
//! of the measurement, weather is matched on the calendar day, and fires are
//! matched forward within the configured tolerance.

use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::features::SeriesPoint;
use crate::ingest::RawSources;
use crate::records::{CombustionEvent, Measurement, StockpileKey, SupplyEvent, WeatherDay};

/// Supply aggregate visible at a point in time.
///
/// This approximates stockpile formation and mass from deliveries; it is not
/// a precise formation timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplySnapshot {
    pub total_weight_tons: Option<f64>,
    pub earliest_unload_at: NaiveDateTime,
    pub cargo_grade: Option<String>,
    pub deliveries: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormationSource {
    /// Formation date recorded on the fire record.
    Explicit,
    EarliestUnload,
    MeasurementDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelStatus {
    Labeled,
    NoFire,
    OutOfTolerance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssociatedMeasurement {
    pub measurement: Measurement,
    pub supply: Option<SupplySnapshot>,
    pub weather: Option<WeatherDay>,
    pub fire_start_at: Option<NaiveDateTime>,
    pub days_until_fire: Option<i64>,
    pub label_status: LabelStatus,
    pub formation_at: NaiveDateTime,
    pub formation_source: FormationSource,
}

impl AssociatedMeasurement {
    /// Raw per-measurement context consumed by the feature engine.
    pub fn to_series_point(&self) -> SeriesPoint {
        SeriesPoint {
            key: self.measurement.key.clone(),
            measured_at: self.measurement.measured_at,
            max_temperature: self.measurement.max_temperature,
            stack_mass_tons: self.supply.as_ref().and_then(|s| s.total_weight_tons),
            formation_at: match self.formation_source {
                FormationSource::MeasurementDate => None,
                FormationSource::Explicit | FormationSource::EarliestUnload => {
                    Some(self.formation_at)
                }
            },
            weather: self.weather.clone(),
            cargo_grade: self.supply.as_ref().and_then(|s| s.cargo_grade.clone()),
            picket: self.measurement.picket.clone(),
            shift: self.measurement.shift.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssociationReport {
    pub measurements_total: u64,
    pub with_supply: u64,
    pub with_weather: u64,
    pub labeled: u64,
    pub unlabeled_no_fire: u64,
    pub unlabeled_out_of_tolerance: u64,
    pub dropped_integrity: u64,
    pub fire_keys_without_measurements: u64,
    pub formation_explicit: u64,
    pub formation_from_unload: u64,
    pub formation_from_measurement: u64,
}

/// Joins every measurement with its as-of supply aggregate, same-day
/// weather and at most one future fire.
///
/// Output is ordered by stockpile key, then measurement time; measurements
/// sharing a timestamp keep their input order.
pub fn associate(
    sources: &RawSources,
    cfg: &PipelineConfig,
) -> (Vec<AssociatedMeasurement>, AssociationReport) {
    info!(
        component = "association",
        event = "association.start",
        measurements = sources.measurements.len(),
        fires = sources.fires.len(),
        supplies = sources.supplies.len(),
        weather_days = sources.weather.len(),
        fire_tolerance_days = cfg.fire_tolerance_days
    );

    let supply_index = SupplyIndex::build(&sources.supplies);
    let fire_index = FireIndex::build(&sources.fires);
    let weather_by_day: BTreeMap<NaiveDate, &WeatherDay> =
        sources.weather.iter().map(|day| (day.date, day)).collect();

    let mut by_key: BTreeMap<&StockpileKey, Vec<&Measurement>> = BTreeMap::new();
    for measurement in &sources.measurements {
        by_key.entry(&measurement.key).or_default().push(measurement);
    }

    let mut report = AssociationReport {
        measurements_total: sources.measurements.len() as u64,
        fire_keys_without_measurements: fire_index
            .keys()
            .filter(|key| !by_key.contains_key(**key))
            .count() as u64,
        ..AssociationReport::default()
    };

    let mut associated = Vec::with_capacity(sources.measurements.len());
    for (key, mut measurements) in by_key {
        measurements.sort_by_key(|m| m.measured_at);
        for measurement in measurements {
            let supply = supply_index.as_of(key, measurement.measured_at).cloned();
            let weather = weather_by_day
                .get(&measurement.measured_at.date())
                .map(|day| (*day).clone());
            let fire = fire_index.first_on_or_after(key, measurement.measured_at.date());

            let (fire_start_at, days_until_fire, label_status) = match fire {
                None => (None, None, LabelStatus::NoFire),
                Some(fire) => {
                    let days = days_between(measurement.measured_at, fire.fire_start_at);
                    if days < 0 {
                        report.dropped_integrity += 1;
                        warn!(
                            component = "association",
                            event = "association.integrity.negative_label",
                            stockpile = %key,
                            measured_at = %measurement.measured_at,
                            fire_start_at = %fire.fire_start_at,
                            days
                        );
                        continue;
                    }
                    if days > cfg.fire_tolerance_days {
                        (None, None, LabelStatus::OutOfTolerance)
                    } else {
                        (Some(fire.fire_start_at), Some(days), LabelStatus::Labeled)
                    }
                }
            };

            let (formation_at, formation_source) = resolve_formation(
                fire_index.formation_as_of(key, measurement.measured_at),
                supply.as_ref(),
                measurement.measured_at,
            );

            match label_status {
                LabelStatus::Labeled => report.labeled += 1,
                LabelStatus::NoFire => report.unlabeled_no_fire += 1,
                LabelStatus::OutOfTolerance => report.unlabeled_out_of_tolerance += 1,
            }
            match formation_source {
                FormationSource::Explicit => report.formation_explicit += 1,
                FormationSource::EarliestUnload => report.formation_from_unload += 1,
                FormationSource::MeasurementDate => report.formation_from_measurement += 1,
            }
            if supply.is_some() {
                report.with_supply += 1;
            }
            if weather.is_some() {
                report.with_weather += 1;
            }

            associated.push(AssociatedMeasurement {
                measurement: measurement.clone(),
                supply,
                weather,
                fire_start_at,
                days_until_fire,
                label_status,
                formation_at,
                formation_source,
            });
        }
    }

    log_association_report(&report);
    (associated, report)
}

/// Whole calendar days from a measurement to a later event.
pub fn days_between(from: NaiveDateTime, to: NaiveDateTime) -> i64 {
    (to.date() - from.date()).num_days()
}

fn resolve_formation(
    explicit: Option<NaiveDateTime>,
    supply: Option<&SupplySnapshot>,
    measured_at: NaiveDateTime,
) -> (NaiveDateTime, FormationSource) {
    if let Some(explicit) = explicit {
        return (explicit, FormationSource::Explicit);
    }
    if let Some(supply) = supply {
        return (supply.earliest_unload_at, FormationSource::EarliestUnload);
    }
    (measured_at, FormationSource::MeasurementDate)
}

/// Prefix aggregates of each stockpile's deliveries, searchable by time.
struct SupplyIndex {
    by_key: HashMap<StockpileKey, Vec<(NaiveDateTime, SupplySnapshot)>>,
}

impl SupplyIndex {
    fn build(supplies: &[SupplyEvent]) -> Self {
        let mut grouped: BTreeMap<&StockpileKey, Vec<&SupplyEvent>> = BTreeMap::new();
        for supply in supplies {
            grouped.entry(&supply.key).or_default().push(supply);
        }

        let mut by_key = HashMap::with_capacity(grouped.len());
        for (key, mut events) in grouped {
            events.sort_by_key(|event| event.unload_at);
            by_key.insert(key.clone(), prefix_snapshots(&events));
        }
        Self { by_key }
    }

    fn as_of(&self, key: &StockpileKey, at: NaiveDateTime) -> Option<&SupplySnapshot> {
        let snapshots = self.by_key.get(key)?;
        let visible = snapshots.partition_point(|(unload_at, _)| *unload_at <= at);
        if visible == 0 {
            None
        } else {
            Some(&snapshots[visible - 1].1)
        }
    }
}

fn prefix_snapshots(events: &[&SupplyEvent]) -> Vec<(NaiveDateTime, SupplySnapshot)> {
    let mut snapshots = Vec::with_capacity(events.len());
    let mut total: Option<f64> = None;
    // grade -> (count, first delivery position)
    let mut grade_counts: HashMap<&str, (u64, usize)> = HashMap::new();
    let mut best_grade: Option<(&str, u64, usize)> = None;

    for (position, event) in events.iter().enumerate() {
        if let Some(weight) = event.weight_tons {
            total = Some(total.unwrap_or(0.0) + weight);
        }
        if let Some(grade) = event.cargo_grade.as_deref() {
            let entry = grade_counts.entry(grade).or_insert((0, position));
            entry.0 += 1;
            let (count, first) = *entry;
            let replaces = match best_grade {
                None => true,
                Some((_, best_count, best_first)) => {
                    count > best_count || (count == best_count && first < best_first)
                }
            };
            if replaces {
                best_grade = Some((grade, count, first));
            }
        }

        snapshots.push((
            event.unload_at,
            SupplySnapshot {
                total_weight_tons: total,
                earliest_unload_at: events[0].unload_at,
                cargo_grade: best_grade.map(|(grade, _, _)| grade.to_string()),
                deliveries: position as u64 + 1,
            },
        ));
    }

    snapshots
}

struct FireIndex<'a> {
    by_key: BTreeMap<&'a StockpileKey, Vec<&'a CombustionEvent>>,
    /// Recorded formation dates per stockpile, independent of which fire
    /// a measurement ends up labeled with.
    formations: HashMap<&'a StockpileKey, Vec<NaiveDateTime>>,
}

impl<'a> FireIndex<'a> {
    fn build(fires: &'a [CombustionEvent]) -> Self {
        let mut by_key: BTreeMap<&StockpileKey, Vec<&CombustionEvent>> = BTreeMap::new();
        let mut formations: HashMap<&StockpileKey, Vec<NaiveDateTime>> = HashMap::new();
        for fire in fires {
            by_key.entry(&fire.key).or_default().push(fire);
            if let Some(formed_at) = fire.stack_formation_at {
                formations.entry(&fire.key).or_default().push(formed_at);
            }
        }
        for events in by_key.values_mut() {
            events.sort_by_key(|fire| fire.fire_start_at);
        }
        for dates in formations.values_mut() {
            dates.sort();
            dates.dedup();
        }
        Self { by_key, formations }
    }

    /// Latest recorded formation at or before `at`.
    fn formation_as_of(&self, key: &StockpileKey, at: NaiveDateTime) -> Option<NaiveDateTime> {
        let dates = self.formations.get(key)?;
        let visible = dates.partition_point(|formed_at| *formed_at <= at);
        visible.checked_sub(1).map(|idx| dates[idx])
    }

    fn keys(&self) -> impl Iterator<Item = &&'a StockpileKey> {
        self.by_key.keys()
    }

    /// Earliest fire whose start day is on or after `day`.
    fn first_on_or_after(&self, key: &StockpileKey, day: NaiveDate) -> Option<&'a CombustionEvent> {
        let fires = self.by_key.get(key)?;
        let idx = fires.partition_point(|fire| fire.fire_start_at.date() < day);
        fires.get(idx).copied()
    }
}

fn log_association_report(report: &AssociationReport) {
    info!(
        component = "association",
        event = "association.done",
        measurements = report.measurements_total,
        labeled = report.labeled,
        with_supply = report.with_supply,
        with_weather = report.with_weather
    );
    if report.unlabeled_no_fire + report.unlabeled_out_of_tolerance > 0 {
        info!(
            component = "association",
            event = "association.rows.unlabeled",
            no_fire = report.unlabeled_no_fire,
            out_of_tolerance = report.unlabeled_out_of_tolerance
        );
    }
    if report.dropped_integrity > 0 {
        warn!(
            component = "association",
            event = "association.rows.dropped",
            reason = "negative_days_until_fire",
            count = report.dropped_integrity
        );
    }
    if report.fire_keys_without_measurements > 0 {
        warn!(
            component = "association",
            event = "association.fires.unmatched",
            stockpiles = report.fire_keys_without_measurements
        );
    }
    debug!(
        component = "association",
        event = "association.formation.sources",
        explicit = report.formation_explicit,
        earliest_unload = report.formation_from_unload,
        measurement_date = report.formation_from_measurement
    );
}
