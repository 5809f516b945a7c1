//! Supervised sample selection from feature rows.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::features::{FeatureRow, FeatureSchema};
use crate::records::StockpileKey;
use crate::serving::PipelineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRow {
    pub key: StockpileKey,
    pub measured_at: NaiveDateTime,
    pub days_until_fire: i64,
    pub features: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SampleReport {
    pub candidates: u64,
    pub unlabeled: u64,
    pub outside_horizon: u64,
    pub same_day_duplicates: u64,
    pub kept: u64,
}

/// Keeps labeled rows inside `[0, horizon_days]`, collapses each
/// `(stockpile, calendar day)` to one row and orders the result by time.
///
/// `labels` is indexed by [`FeatureRow::source_index`]. The surviving row of
/// a day is the one with the highest `max_temperature`; the later
/// measurement wins a tie.
pub fn build_samples(
    schema: &FeatureSchema,
    rows: &[FeatureRow],
    labels: &[Option<i64>],
    cfg: &PipelineConfig,
) -> Result<(Vec<SampleRow>, SampleReport), PipelineError> {
    let temp_idx = schema
        .column_index("max_temperature")
        .ok_or(PipelineError::MissingFeature("max_temperature"))?;

    let mut report = SampleReport {
        candidates: rows.len() as u64,
        ..SampleReport::default()
    };

    let mut by_day: BTreeMap<(&StockpileKey, NaiveDate), (&FeatureRow, i64)> = BTreeMap::new();
    for row in rows {
        let Some(days) = labels.get(row.source_index).copied().flatten() else {
            report.unlabeled += 1;
            continue;
        };
        if !(0..=cfg.horizon_days).contains(&days) {
            report.outside_horizon += 1;
            continue;
        }

        let slot = (&row.key, row.measured_at.date());
        let existing = by_day.get(&slot).map(|(kept, _)| *kept);
        match existing {
            None => {
                by_day.insert(slot, (row, days));
            }
            Some(kept) => {
                report.same_day_duplicates += 1;
                let replaces = row.values[temp_idx] > kept.values[temp_idx]
                    || (row.values[temp_idx] == kept.values[temp_idx]
                        && row.measured_at >= kept.measured_at);
                if replaces {
                    by_day.insert(slot, (row, days));
                }
            }
        }
    }

    let mut samples: Vec<SampleRow> = by_day
        .into_values()
        .map(|(row, days)| SampleRow {
            key: row.key.clone(),
            measured_at: row.measured_at,
            days_until_fire: days,
            features: row.values.clone(),
        })
        .collect();
    samples.sort_by(|a, b| {
        a.measured_at
            .cmp(&b.measured_at)
            .then_with(|| a.key.cmp(&b.key))
    });
    report.kept = samples.len() as u64;

    info!(
        component = "samples",
        event = "samples.built",
        candidates = report.candidates,
        kept = report.kept,
        horizon_days = cfg.horizon_days
    );
    if report.outside_horizon + report.same_day_duplicates > 0 {
        warn!(
            component = "samples",
            event = "samples.rows.dropped",
            unlabeled = report.unlabeled,
            outside_horizon = report.outside_horizon,
            same_day_duplicates = report.same_day_duplicates
        );
    }

    if samples.is_empty() && report.candidates > report.unlabeled {
        return Err(PipelineError::AllRowsDropped { stage: "samples" });
    }
    if samples.len() < cfg.min_training_samples {
        return Err(PipelineError::TooFewSamples {
            found: samples.len(),
            required: cfg.min_training_samples,
        });
    }

    Ok((samples, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::build_feature_schema;
    use chrono::NaiveDate;

    fn row(idx: usize, day: u32, hour: u32, temp: f64) -> FeatureRow {
        let schema = build_feature_schema(&PipelineConfig::default());
        let mut values = vec![0.0; schema.columns.len()];
        values[0] = temp;
        FeatureRow {
            key: StockpileKey::new("3", "21"),
            measured_at: NaiveDate::from_ymd_opt(2020, 5, day)
                .unwrap()
                .and_hms_opt(hour, 0, 0)
                .unwrap(),
            source_index: idx,
            values,
        }
    }

    fn lenient() -> PipelineConfig {
        PipelineConfig {
            min_training_samples: 1,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn same_day_rows_collapse_to_hottest() {
        let cfg = lenient();
        let schema = build_feature_schema(&cfg);
        let rows = vec![row(0, 1, 8, 30.0), row(1, 1, 14, 41.0), row(2, 1, 20, 35.0), row(3, 2, 8, 33.0)];
        let labels = vec![Some(20), Some(20), Some(20), Some(19)];

        let (samples, report) = build_samples(&schema, &rows, &labels, &cfg).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].features[0], 41.0);
        assert_eq!(report.same_day_duplicates, 2);
        assert!(samples[0].measured_at < samples[1].measured_at);
    }

    #[test]
    fn horizon_and_missing_labels_are_excluded() {
        let cfg = lenient();
        let schema = build_feature_schema(&cfg);
        let rows = vec![row(0, 1, 8, 30.0), row(1, 2, 8, 31.0), row(2, 3, 8, 32.0)];
        let labels = vec![None, Some(61), Some(60)];

        let (samples, report) = build_samples(&schema, &rows, &labels, &cfg).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].days_until_fire, 60);
        assert_eq!(report.unlabeled, 1);
        assert_eq!(report.outside_horizon, 1);
    }

    #[test]
    fn too_few_samples_fails_loudly() {
        let cfg = PipelineConfig::default();
        let schema = build_feature_schema(&cfg);
        let rows = vec![row(0, 1, 8, 30.0)];
        let err = build_samples(&schema, &rows, &[Some(5)], &cfg).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::TooFewSamples {
                found: 1,
                required: 10
            }
        ));
    }

    #[test]
    fn all_labeled_rows_outside_horizon_is_all_dropped() {
        let cfg = lenient();
        let schema = build_feature_schema(&cfg);
        let rows = vec![row(0, 1, 8, 30.0)];
        let err = build_samples(&schema, &rows, &[Some(90)], &cfg).unwrap_err();
        assert!(matches!(err, PipelineError::AllRowsDropped { stage: "samples" }));
    }
}
