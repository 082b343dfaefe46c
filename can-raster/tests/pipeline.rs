//! End-to-end runs over small DBC/ASC fixtures

use can_raster::{
    read_csv_table, CancelFlag, DecodeErrorKind, ExecutionMode, Pipeline, PipelineConfig,
    PipelineError, SaveFormat,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

const CHASSIS_DBC: &str = r#"
VERSION ""

NS_ :

BS_:

BU_: VCU ESP

BO_ 834 AccPedal: 8 VCU
 SG_ AccPdlPosn_342 : 0|8@1+ (0.5,0) [0|100] "%" ESP

BO_ 290 WheelSpeeds: 8 ESP
 SG_ WhlSpdFL_122 : 0|16@1+ (0.01,0) [0|300] "km/h" VCU
"#;

const BODY_DBC: &str = r#"
VERSION ""

NS_ :

BS_:

BU_: BCM

BO_ 834 Pedal: 8 BCM
 SG_ PedalRaw : 0|8@1+ (1,0) [0|255] "" BCM
"#;

const DRIVE_ASC: &str = "date Mon Jan 1 00:00:00.000 am 2024\n\
base hex  timestamps absolute\n\
internal events logged\n\
Begin Triggerblock Mon Jan 1 00:00:00.000 am 2024\n\
0.000000 1  122             Rx   d 8 10 27 00 00 00 00 00 00\n\
0.000000 1  342             Rx   d 8 00 00 00 00 00 00 00 00\n\
0.010000 1  7FF             Rx   d 8 00 00 00 00 00 00 00 00\n\
0.020000 1  122             Rx   d 8 20 4E 00 00 00 00 00 00\n\
0.040000 1  342             Rx   d 8 50 00 00 00 00 00 00 00\n\
End TriggerBlock\n";

const SILENT_ASC: &str = "base hex  timestamps absolute\n\
0.000000 1  7FF             Rx   d 2 00 00\n\
0.010000 1  7FE             Rx   d 2 00 00\n";

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("dbc")).unwrap();
        fs::create_dir(dir.path().join("logs")).unwrap();
        fs::write(dir.path().join("dbc").join("chassis.dbc"), CHASSIS_DBC).unwrap();
        fs::write(dir.path().join("logs").join("drive1.asc"), DRIVE_ASC).unwrap();
        Self { dir }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    fn config(&self, out: &str) -> PipelineConfig {
        PipelineConfig::new()
            .add_database(self.path("dbc/chassis.dbc"))
            .add_log_source(self.path("logs"))
            .with_output_dir(self.path(out))
            .with_save_formats(vec![SaveFormat::Csv])
            .with_mode(ExecutionMode::Sequential)
    }
}

fn read_text(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

#[test]
fn test_decode_single_file() {
    let fx = Fixture::new();
    let summary = Pipeline::new(fx.config("out")).run().unwrap();

    assert_eq!(summary.file_count(), 1);
    assert_eq!(summary.success_count, 1);
    assert!(!summary.interrupted);

    let outcome = &summary.outcomes[0];
    assert_eq!(outcome.file_name, "drive1.asc");
    assert_eq!(outcome.database, "chassis.dbc");
    assert_eq!(outcome.total_frames, 5);
    assert_eq!(outcome.decoded_frames, 4);
    assert_eq!(outcome.error_count, 1);
    assert_eq!(outcome.error_taxonomy[&DecodeErrorKind::UnknownMessage], 1);
    assert_eq!(outcome.signal_count, 2);
    assert_eq!(outcome.data_points, 4);
    assert_eq!(outcome.outputs, vec![fx.path("out/drive1.csv")]);

    let table = read_csv_table(&fx.path("out/drive1.csv")).unwrap();
    assert_eq!(
        table.column_names().collect::<Vec<_>>(),
        vec!["WhlSpdFL_122", "AccPdlPosn_342"]
    );
    assert_eq!(table.row_count(), 3);
    assert_eq!(table.column("WhlSpdFL_122").unwrap(), &[100.0, 200.0, 200.0]);
    assert_eq!(table.column("AccPdlPosn_342").unwrap(), &[0.0, 0.0, 40.0]);
}

#[test]
fn test_counters_are_consistent() {
    let fx = Fixture::new();
    let summary = Pipeline::new(fx.config("out")).run().unwrap();

    for outcome in &summary.outcomes {
        assert!(outcome.decoded_frames <= outcome.total_frames);
        assert_eq!(outcome.decoded_frames + outcome.error_count, outcome.total_frames);
        let kinds: u64 = outcome.error_taxonomy.values().sum();
        assert!(kinds <= outcome.error_count);
    }
    assert_eq!(summary.total_frames, 5);
    assert!((summary.decode_rate() - 80.0).abs() < 1e-9);
}

#[test]
fn test_output_is_deterministic() {
    let fx = Fixture::new();
    Pipeline::new(fx.config("first")).run().unwrap();
    Pipeline::new(fx.config("second").with_mode(ExecutionMode::Parallel).with_workers(2))
        .run()
        .unwrap();

    assert_eq!(
        read_text(&fx.path("first/drive1.csv")),
        read_text(&fx.path("second/drive1.csv"))
    );
}

#[test]
fn test_failing_file_does_not_stop_the_run() {
    let fx = Fixture::new();
    fs::write(fx.path("logs/drive2.asc"), DRIVE_ASC).unwrap();
    fs::write(fx.path("logs/silent.asc"), SILENT_ASC).unwrap();

    let config = fx.config("out").with_mode(ExecutionMode::Parallel).with_workers(2);
    let summary = Pipeline::new(config).run().unwrap();

    assert_eq!(summary.file_count(), 3);
    assert_eq!(summary.success_count, 2);
    assert_eq!(summary.failed_count, 1);

    let failed = summary.outcomes.iter().find(|o| !o.success).unwrap();
    assert_eq!(failed.file_name, "silent.asc");
    assert_eq!(failed.error.as_deref(), Some("No valid signals decoded"));
    assert_eq!(failed.total_frames, 2);
    assert_eq!(failed.error_taxonomy[&DecodeErrorKind::UnknownMessage], 2);

    assert!(fx.path("out/drive1.csv").exists());
    assert!(fx.path("out/drive2.csv").exists());
    assert!(!fx.path("out/silent.csv").exists());
}

#[test]
fn test_corrupt_log_is_a_failed_outcome() {
    let fx = Fixture::new();
    fs::write(fx.path("logs/broken.blf"), b"definitely not a BLF container").unwrap();

    let summary = Pipeline::new(fx.config("out")).run().unwrap();
    assert_eq!(summary.file_count(), 2);
    assert_eq!(summary.failed_count, 1);

    let failed = summary.outcomes.iter().find(|o| !o.success).unwrap();
    assert_eq!(failed.file_name, "broken.blf");
    assert!(failed.error.is_some());
    assert!(failed.diagnostic.as_ref().unwrap().chars().count() <= 500);
}

#[test]
fn test_one_failing_format_is_a_warning() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.path("out/drive1.csv")).unwrap();

    let config = fx
        .config("out")
        .with_save_formats(vec![SaveFormat::Csv, SaveFormat::Parquet]);
    let summary = Pipeline::new(config).run().unwrap();

    let outcome = &summary.outcomes[0];
    assert!(outcome.success);
    assert_eq!(outcome.save_warnings.len(), 1);
    assert_eq!(outcome.outputs, vec![fx.path("out/drive1.parquet")]);
    assert_eq!(summary.save_warnings().count(), 1);
}

#[test]
fn test_all_formats_failing_fails_the_file() {
    let fx = Fixture::new();
    fs::create_dir_all(fx.path("out/drive1.csv")).unwrap();

    let summary = Pipeline::new(fx.config("out")).run().unwrap();
    let outcome = &summary.outcomes[0];
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("all output formats failed to save"));
    assert_eq!(outcome.save_warnings.len(), 1);
    // Decode counters survive a save failure
    assert_eq!(outcome.total_frames, 5);
}

#[test]
fn test_no_work_units() {
    let fx = Fixture::new();
    fs::create_dir(fx.path("empty")).unwrap();

    let config = PipelineConfig::new()
        .add_database(fx.path("dbc"))
        .add_log_source(fx.path("empty"))
        .with_output_dir(fx.path("out"));
    let err = Pipeline::new(config).run().unwrap_err();
    assert!(matches!(err, PipelineError::NoWorkUnits));
}

#[test]
fn test_missing_source_is_a_config_error() {
    let fx = Fixture::new();
    let config = fx.config("out").add_log_source(fx.path("nowhere"));
    let err = Pipeline::new(config).run().unwrap_err();
    assert!(matches!(err, PipelineError::Config(_)));
}

#[test]
fn test_multiple_databases_name_outputs() {
    let fx = Fixture::new();
    fs::write(fx.path("dbc/body.dbc"), BODY_DBC).unwrap();

    let config = fx.config("out").with_mode(ExecutionMode::Parallel);
    let config = PipelineConfig {
        database_paths: vec![fx.path("dbc")],
        ..config
    };
    let summary = Pipeline::new(config).run().unwrap();

    assert_eq!(summary.success_count, 2);
    assert!(fx.path("out/drive1_body.csv").exists());
    assert!(fx.path("out/drive1_chassis.csv").exists());

    let body = read_csv_table(&fx.path("out/drive1_body.csv")).unwrap();
    assert_eq!(body.column_names().collect::<Vec<_>>(), vec!["PedalRaw"]);
    assert_eq!(body.column("PedalRaw").unwrap().last(), Some(&80.0));
}

#[test]
fn test_filter_and_rename() {
    let fx = Fixture::new();
    let mut mapping = std::collections::BTreeMap::new();
    mapping.insert("WhlSpdFL_122".to_string(), "FrontLeft".to_string());

    let config = fx
        .config("out")
        .with_signal_names(["WhlSpdFL_122"])
        .with_signal_mapping(mapping)
        .with_time_from_zero(true);
    let summary = Pipeline::new(config).run().unwrap();
    assert_eq!(summary.outcomes[0].signal_count, 1);

    let text = read_text(&fx.path("out/drive1.csv"));
    assert_eq!(text.lines().next(), Some("timestamps,FrontLeft"));
}

#[test]
fn test_unmatched_filter_fails_with_no_signals() {
    let fx = Fixture::new();
    let config = fx.config("out").with_signal_names(["DoesNotExist"]);
    let summary = Pipeline::new(config).run().unwrap();

    let outcome = &summary.outcomes[0];
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("No valid signals decoded"));
}

#[test]
fn test_cancelled_before_start() {
    let fx = Fixture::new();
    let cancel = CancelFlag::new();
    cancel.cancel();

    let summary = Pipeline::new(fx.config("out"))
        .with_cancel_flag(cancel)
        .run()
        .unwrap();
    assert!(summary.interrupted);
    assert_eq!(summary.file_count(), 0);
}

#[test]
fn test_cancel_stops_running_units() {
    let fx = Fixture::new();
    fs::write(fx.path("logs/drive2.asc"), DRIVE_ASC).unwrap();
    let cancel = CancelFlag::new();
    cancel.cancel();

    let config = fx
        .config("out")
        .with_mode(ExecutionMode::Parallel)
        .with_workers(1)
        .with_batch_size(1);
    let summary = Pipeline::new(config).with_cancel_flag(cancel).run().unwrap();

    // The first unit is already dispatched and stops at its first flush
    assert!(summary.interrupted);
    assert_eq!(summary.file_count(), 1);
    assert_eq!(summary.outcomes[0].error.as_deref(), Some("interrupted"));
    assert!(!fx.path("out/drive1.csv").exists());
}
