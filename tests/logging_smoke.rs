use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use coalfire::{
    associate, build_training_set, log_app_start, log_pipeline_summary, read_measurements,
    ColumnRenames, CombustionEvent, LoggingConfig, Measurement, PipelineConfig, RawSources,
    StockpileKey,
};
use tracing::dispatcher::with_default;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriter;

#[derive(Clone, Default)]
struct SharedWriter {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedWriter {
    fn output_string(&self) -> String {
        let bytes = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        String::from_utf8_lossy(&bytes).to_string()
    }
}

struct SharedWriterGuard {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = self
            .inner
            .lock()
            .expect("writer lock should not be poisoned");
        out.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn capture_logs(max_level: Level, f: impl FnOnce()) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(max_level)
        .with_writer(writer.clone())
        .finish();
    let dispatch = tracing::Dispatch::new(subscriber);

    with_default(&dispatch, f);
    writer.output_string()
}

fn at(day: u32) -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2021, 7, day)
        .expect("valid date")
        .and_hms_opt(9, 0, 0)
        .expect("valid time")
}

#[test]
fn ingest_logs_dropped_rows_per_source() {
    let csv = "Склад,Штабель,Дата акта,Максимальная температура\n\
               3,21,2021-07-01,30\n\
               3,21,07/01/2021??,31\n\
               3,21,2021-07-02,n/a\n";
    let logs = capture_logs(Level::INFO, || {
        let (rows, report) =
            read_measurements(csv.as_bytes(), &ColumnRenames::default(), chrono_tz::Tz::UTC)
                .expect("measurements should load");
        assert_eq!(rows.len(), 1);
        assert_eq!(report.dropped(), 2);
    });

    assert!(logs.contains("\"event\":\"ingest.source.loaded\""));
    assert!(logs.contains("\"event\":\"ingest.rows.dropped\""));
    assert!(logs.contains("\"unparsable_date\":1"));
}

#[test]
fn association_logs_unlabeled_rows() {
    let key = StockpileKey::new("3", "21");
    let sources = RawSources {
        fires: vec![CombustionEvent {
            key: key.clone(),
            fire_start_at: at(3),
            stack_formation_at: None,
        }],
        supplies: Vec::new(),
        measurements: [1, 5]
            .into_iter()
            .map(|day| Measurement {
                key: key.clone(),
                measured_at: at(day),
                max_temperature: 40.0,
                picket: None,
                shift: None,
            })
            .collect(),
        weather: Vec::new(),
    };

    let logs = capture_logs(Level::INFO, || {
        let (rows, report) = associate(&sources, &PipelineConfig::default());
        assert_eq!(rows.len(), 2);
        assert_eq!(report.labeled, 1);
    });

    assert!(logs.contains("\"event\":\"association.start\""));
    assert!(logs.contains("\"event\":\"association.done\""));
    assert!(logs.contains("\"event\":\"association.rows.unlabeled\""));
}

#[test]
fn pipeline_summary_warns_when_rows_are_lost() {
    let key = StockpileKey::new("3", "21");
    let sources = RawSources {
        fires: vec![CombustionEvent {
            key: key.clone(),
            fire_start_at: at(30),
            stack_formation_at: None,
        }],
        supplies: Vec::new(),
        measurements: [1, 1, 2]
            .into_iter()
            .enumerate()
            .map(|(i, day)| Measurement {
                key: key.clone(),
                measured_at: at(day) + chrono::Duration::hours(i as i64),
                max_temperature: 30.0 + i as f64,
                picket: None,
                shift: None,
            })
            .collect(),
        weather: Vec::new(),
    };
    let cfg = PipelineConfig {
        min_training_samples: 1,
        ..PipelineConfig::default()
    };

    let logs = capture_logs(Level::INFO, || {
        let set = build_training_set(&sources, &cfg).expect("training set");
        log_pipeline_summary(&set.report);
    });

    assert!(logs.contains("\"event\":\"training_set.built\""));
    assert!(logs.contains("\"event\":\"samples.rows.dropped\""));
    assert!(logs.contains("\"event\":\"pipeline.summary\""));
    assert!(logs.contains("\"level\":\"WARN\""));
}

#[test]
fn app_start_emits_baseline_event() {
    let logs = capture_logs(Level::INFO, || {
        log_app_start("fusion_audit", &LoggingConfig::default());
    });

    assert!(logs.contains("\"event\":\"app.start\""));
    assert!(logs.contains("\"component\":\"fusion_audit\""));
}
