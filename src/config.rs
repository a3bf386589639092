//! TOML configuration for SensorWatch.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! usable configuration pointing at the conventional `data/` layout.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "SENSORWATCH_CONFIG";
/// Environment variable carrying the summarizer API key.
pub const API_KEY_ENV: &str = "SENSORWATCH_SUMMARIZER_API_KEY";
/// Standard system location of the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/sensorwatch/sensorwatch.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the detection engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Settings {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut settings: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        settings.apply_env();
        settings.validate()?;
        info!(path = %path.display(), "loaded configuration");
        Ok(settings)
    }

    /// Resolve configuration, in order:
    /// 1. An explicit path (from `--config` or `SENSORWATCH_CONFIG`); a
    ///    broken explicit file is an error, not a silent fallback.
    /// 2. `/etc/sensorwatch/sensorwatch.toml`.
    /// 3. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        let mut settings = Self::default();
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    /// Secrets may come from the environment instead of the file.
    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                self.summarizer.api_key = Some(key);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.window.window_size == 0 {
            anyhow::bail!("window.window_size must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.window.timeout_ms == 0 || self.summarizer.timeout_ms == 0 {
            anyhow::bail!("timeouts must be greater than zero");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// Locations of the static inputs loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// JSON threshold set: `variable -> {Low-Low, Low, High, High-High}`.
    pub thresholds: PathBuf,
    /// JSON alarm context corpus: `variable -> label -> {Cause, Actions}`.
    pub alarm_context: PathBuf,
    /// Directory holding `scaler.json`, `pca.json`, `threshold.json`, `features.json`.
    pub model_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            thresholds: PathBuf::from("data/processed/thresholds.json"),
            alarm_context: PathBuf::from("data/processed/alarm_context.json"),
            model_dir: PathBuf::from("data/processed/ml_models"),
        }
    }
}

// ---------------------------------------------------------------------------
// Window
// ---------------------------------------------------------------------------

/// Sliding window store and statistical detector settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// SQLite file shared by every detector process.
    pub db_path: PathBuf,
    /// Points kept per sensor.
    pub window_size: usize,
    /// Prior points required before a sensor is classified.
    pub min_data_points: usize,
    /// Longest a store call waits for the database lock or a pooled
    /// connection (milliseconds).
    pub timeout_ms: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/windows.db"),
            window_size: 100,
            min_data_points: 4,
            timeout_ms: 2_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Summarizer
// ---------------------------------------------------------------------------

/// Text-generation service used to phrase alarm context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    pub enabled: bool,
    /// Base URL of the Azure OpenAI resource.
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub deployment: Option<String>,
    pub api_version: String,
    /// Per request; retries may take several of these.
    pub timeout_ms: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            api_key: None,
            deployment: None,
            api_version: "2024-02-01".to_string(),
            timeout_ms: 5_000,
            max_tokens: 200,
            temperature: 0.2,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON log lines instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
