use std::path::PathBuf;

use coalfire::{
    associate, build_training_set, init_logging, load_all_sources, log_app_start,
    log_pipeline_config, log_pipeline_summary, logging_config_from_env, pipeline_config_from_env,
    ColumnRenames, SourceKind, SourcePaths,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("fusion_audit", &logging_cfg);

    let data_dir = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("COALFIRE_DATA_DIR").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data"));

    let cfg = pipeline_config_from_env();
    cfg.validate()?;
    log_pipeline_config(&cfg);

    let paths = SourcePaths::from_data_dir(&data_dir)?;
    println!(
        "Auditing stockpile sources in {} (fire tolerance {} days, horizon {} days)",
        data_dir.display(),
        cfg.fire_tolerance_days,
        cfg.horizon_days
    );

    let outcome = load_all_sources(&paths, &ColumnRenames::default(), &cfg);
    let failures = outcome.errors().len();
    if failures > 0 {
        for err in outcome.errors() {
            println!("  FAILED {} | {}", err.source_kind(), err);
        }
        return Err(format!("{failures} source(s) could not be loaded").into());
    }

    let (sources, ingest_report) = outcome.into_raw_sources()?;

    println!("\nIngest");
    for kind in [
        SourceKind::Fires,
        SourceKind::Supplies,
        SourceKind::Temperature,
        SourceKind::Weather,
    ] {
        if let Some(report) = ingest_report.source(kind) {
            println!(
                "  {:<11} | files={} read={} kept={} unparsable_date={} invalid_value={} missing_id={} bad_encoding={} dupes_removed={}",
                kind.as_str(),
                report.files,
                report.rows_read,
                report.rows_kept,
                report.dropped_unparsable_date,
                report.dropped_invalid_value,
                report.dropped_missing_id,
                report.dropped_invalid_encoding,
                report.duplicates_removed
            );
        }
    }
    println!("  weather days after aggregation: {}", ingest_report.weather_days);

    let (_, association) = associate(&sources, &cfg);
    println!("\nAssociation");
    println!(
        "  measurements={} with_supply={} with_weather={}",
        association.measurements_total, association.with_supply, association.with_weather
    );
    println!(
        "  labeled={} no_fire={} out_of_tolerance={} integrity_dropped={}",
        association.labeled,
        association.unlabeled_no_fire,
        association.unlabeled_out_of_tolerance,
        association.dropped_integrity
    );
    println!(
        "  fire stockpiles without measurements={}",
        association.fire_keys_without_measurements
    );
    println!(
        "  formation source: explicit={} earliest_unload={} measurement_date={}",
        association.formation_explicit,
        association.formation_from_unload,
        association.formation_from_measurement
    );

    let mut set = match build_training_set(&sources, &cfg) {
        Ok(set) => set,
        Err(err) => {
            println!("\nRESULT: training set could not be built: {err}");
            return Err(err.into());
        }
    };
    set.report.ingest = Some(ingest_report);
    log_pipeline_summary(&set.report);

    let samples = &set.report.samples;
    println!("\nSamples");
    println!(
        "  candidates={} unlabeled={} outside_horizon={} same_day_duplicates={} kept={}",
        samples.candidates,
        samples.unlabeled,
        samples.outside_horizon,
        samples.same_day_duplicates,
        samples.kept
    );
    println!(
        "  features={} schema_fingerprint={}",
        set.schema.columns.len(),
        set.schema.fingerprint
    );

    println!(
        "\nRESULT: {} training samples in horizon [0, {}] days.",
        set.len(),
        cfg.horizon_days
    );
    Ok(())
}
