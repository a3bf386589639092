//! Shared on-disk fixtures for integration tests.

#![allow(dead_code)]

use std::path::Path;

use sensorwatch::config::Settings;

pub const THRESHOLDS: &str = r#"{
    "P1": {"Low-Low": 0, "Low": 10, "High": 90, "High-High": 100}
}"#;

pub const CONTEXT: &str = r#"{
    "P1": {
        "Low": {"Cause": "Suction   line leak", "Actions": "Isolate the line and inspect seals"},
        "High-High": {"Cause": "Discharge valve closed", "Actions": "Trip the pump"}
    }
}"#;

/// Write thresholds, context, a one-feature model over `P1` and a config
/// file under `dir`. Returns the config path.
pub fn write_fixture(dir: &Path, window_size: usize) -> std::path::PathBuf {
    let models = dir.join("models");
    std::fs::create_dir_all(&models).unwrap();
    std::fs::write(dir.join("thresholds.json"), THRESHOLDS).unwrap();
    std::fs::write(dir.join("context.json"), CONTEXT).unwrap();
    std::fs::write(models.join("scaler.json"), r#"{"mean": [50.0], "scale": [10.0]}"#).unwrap();
    std::fs::write(models.join("pca.json"), r#"{"components": [[1.0]], "mean": [0.0]}"#).unwrap();
    std::fs::write(models.join("threshold.json"), "1.0").unwrap();
    std::fs::write(models.join("features.json"), r#"["P1"]"#).unwrap();

    let config = format!(
        r#"
[paths]
thresholds = "{dir}/thresholds.json"
alarm_context = "{dir}/context.json"
model_dir = "{dir}/models"

[window]
db_path = "{dir}/windows.db"
window_size = {window_size}
min_data_points = 4

[retry]
max_attempts = 1
"#,
        dir = dir.display(),
        window_size = window_size,
    );
    let path = dir.join("sensorwatch.toml");
    std::fs::write(&path, config).unwrap();
    path
}

pub fn settings(dir: &Path, window_size: usize) -> Settings {
    Settings::load(&write_fixture(dir, window_size)).unwrap()
}
