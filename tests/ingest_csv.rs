use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use coalfire::{
    load_all_sources, load_training_set, ColumnRenames, IngestError, PipelineConfig,
    PipelineError, SourceKind, SourcePaths, StockpileKey,
};
use tempfile::tempdir;

const FIRES_CSV: &str = "\
Склад,Штабель,Дата начала,Нач.форм.штабеля
3,21,2021-03-01,2021-01-10
3,21,2021-03-01,
4,7.0,2021-03-05 12:00:00,
";

const SUPPLIES_CSV: &str = "\
Склад,Штабель,ВыгрузкаНаСклад,\"На склад, тн\",Наим. ЕТСНГ
3,21,2021-01-12,\"1 200,5\",Д
3,21,2021-01-20,800,Д
4,7,2021-01-15,650,2Б
4,7,not a date,100,2Б
";

const TEMPERATURE_CSV: &str = "\
Склад,Штабель,Дата акта,Максимальная температура,Пикет,Смена
3,21,2021-02-01,31,П1,1
3,21,2021-02-05,34.5,П1,2
3,21,2021-02-09,\"39,5\",П2,1
3,21,2021-02-09 18:00:00,36,П2,2
3,21,2021-02-14,44,П1,1
4,7,2021-02-02,25,П3,1
4,7,2021-02-08,27,П3,1
4,7,2021-02-20,33,П3,2
4,7,garbage,33,П3,2
,7,2021-02-21,35,П3,2
";

const WEATHER_JAN_CSV: &str = "\
date,t,humidity,precipitation,p,cloudcover,visibility,v_avg,v_max,wind_dir,weather_code
2021-02-01 03:00:00,-4,70,0.2,1012,80,8,3,6,350,3
2021-02-01 15:00:00,-2,64,0.1,1014,60,10,5,9,10,3
2021-02-05 12:00:00,-1,75,0,1010,90,6,2,4,180,61
";

const WEATHER_FEB_CSV: &str = "\
date,t,humidity,precipitation,p,cloudcover,visibility,v_avg,v_max,wind_dir,weather_code
2021-02-09 12:00:00,1,66,1.5,1008,100,4,6,12,200,61
2021-02-14 12:00:00,3,58,0,1016,20,10,4,7,270,3
2021-02-20 12:00:00,,61,0,1015,30,10,3,5,90,3
";

fn write(dir: &Path, name: &str, body: &str) {
    fs::write(dir.join(name), body).expect("write fixture");
}

fn write_all_sources(dir: &Path) {
    write(dir, "fires.csv", FIRES_CSV);
    write(dir, "supplies.csv", SUPPLIES_CSV);
    write(dir, "temperature.csv", TEMPERATURE_CSV);
    write(dir, "weather_data_2021_02_a.csv", WEATHER_JAN_CSV);
    write(dir, "weather_data_2021_02_b.csv", WEATHER_FEB_CSV);
}

fn lenient_config() -> PipelineConfig {
    PipelineConfig {
        min_training_samples: 1,
        ..PipelineConfig::default()
    }
}

#[test]
fn data_directory_loads_end_to_end() {
    let dir = tempdir().expect("temp dir");
    write_all_sources(dir.path());
    write(dir.path(), "notes.txt", "ignored");

    let paths = SourcePaths::from_data_dir(dir.path()).expect("discover sources");
    assert_eq!(paths.weather.len(), 2);

    let cfg = lenient_config();
    let set = load_training_set(&paths, &ColumnRenames::default(), &cfg).expect("training set");
    let ingest = set.report.ingest.as_ref().expect("ingest report");

    let fires = ingest.source(SourceKind::Fires).unwrap();
    assert_eq!(fires.rows_read, 3);
    assert_eq!(fires.duplicates_removed, 1);
    let supplies = ingest.source(SourceKind::Supplies).unwrap();
    assert_eq!(supplies.dropped_unparsable_date, 1);
    let temperature = ingest.source(SourceKind::Temperature).unwrap();
    assert_eq!(temperature.rows_read, 10);
    assert_eq!(temperature.dropped_unparsable_date, 1);
    assert_eq!(temperature.dropped_missing_id, 1);
    let weather = ingest.source(SourceKind::Weather).unwrap();
    assert_eq!(weather.files, 2);
    assert_eq!(ingest.weather_days, 5);

    assert_eq!(set.report.association.measurements_total, 8);
    assert_eq!(set.report.association.labeled, 8);
    assert_eq!(set.report.association.formation_explicit, 5);
    assert_eq!(set.report.samples.same_day_duplicates, 1);
    assert_eq!(set.len(), 7);

    let first = StockpileKey::new("3", "21");
    let idx = set
        .keys
        .iter()
        .zip(&set.measured_at)
        .position(|(k, t)| *k == first && t.date() == NaiveDate::from_ymd_opt(2021, 2, 9).unwrap())
        .expect("deduplicated day");
    let col = |name: &str| set.features[idx][set.schema.column_index(name).unwrap()];
    assert_eq!(col("max_temperature"), 39.5);
    assert_eq!(col("stack_mass_tons"), 2000.5);
    assert_eq!(col("days_since_formation"), 30.0);
    assert_eq!(set.labels[idx], 20.0);
}

#[test]
fn missing_weather_does_not_block_other_sources() {
    let dir = tempdir().expect("temp dir");
    write(dir.path(), "fires.csv", FIRES_CSV);
    write(dir.path(), "supplies.csv", SUPPLIES_CSV);
    write(dir.path(), "temperature.csv", TEMPERATURE_CSV);

    let paths = SourcePaths::from_data_dir(dir.path()).expect("discover sources");
    let cfg = lenient_config();
    let outcome = load_all_sources(&paths, &ColumnRenames::default(), &cfg);

    assert!(outcome.fires.is_ok());
    assert!(outcome.supplies.is_ok());
    assert!(outcome.temperature.is_ok());
    let errors = outcome.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].source_kind(), SourceKind::Weather);

    let err = load_training_set(&paths, &ColumnRenames::default(), &cfg).expect_err("no weather");
    assert!(matches!(
        err,
        PipelineError::Ingest(IngestError::SourceNotFound {
            kind: SourceKind::Weather,
            ..
        })
    ));
}

#[test]
fn missing_required_column_names_the_source() {
    let dir = tempdir().expect("temp dir");
    write_all_sources(dir.path());
    write(
        dir.path(),
        "supplies.csv",
        "Склад,Штабель,ВыгрузкаНаСклад\n3,21,2021-01-12\n",
    );

    let paths = SourcePaths::from_data_dir(dir.path()).expect("discover sources");
    let outcome = load_all_sources(&paths, &ColumnRenames::default(), &lenient_config());
    match outcome.supplies {
        Err(IngestError::Schema { kind, missing }) => {
            assert_eq!(kind, SourceKind::Supplies);
            assert_eq!(missing, vec!["weight_tons".to_string()]);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(outcome.temperature.is_ok());
}

#[test]
fn custom_alias_maps_unfamiliar_header() {
    let dir = tempdir().expect("temp dir");
    write_all_sources(dir.path());
    write(
        dir.path(),
        "temperature.csv",
        "Склад,Штабель,Дата акта,T max\n3,21,2021-02-01,31\n3,21,2021-02-05,34\n",
    );

    let paths = SourcePaths::from_data_dir(dir.path()).expect("discover sources");
    let renames =
        ColumnRenames::default().with_alias(SourceKind::Temperature, "t max", "max_temperature");
    let set = load_training_set(&paths, &renames, &lenient_config()).expect("training set");
    assert_eq!(set.len(), 2);
    assert_eq!(set.labels, vec![28.0, 24.0]);
}
