use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::{ModelDetector, ModelInfo};
use super::statistical::StatisticalDetector;
use super::threshold::ThresholdDetector;
use super::{DetectError, DetectionMethod, DetectionReport, Findings, SensorRecord, Status};
use crate::config::Settings;
use crate::enrich::{ChatSummarizer, ContextCorpus, DisabledSummarizer, Enricher, Summarizer};
use crate::storage::{SqliteWindowStore, WindowStore};

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Outcome of a full orchestrated pass over one record.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub verdict: Status,
    pub stages: Vec<DetectionReport>,
    /// Set when a stage's anomaly stopped the pipeline early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted_after: Option<DetectionMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub processing_time_ms: f64,
}

impl PipelineReport {
    pub fn stage(&self, method: DetectionMethod) -> Option<&DetectionReport> {
        self.stages.iter().find(|s| s.method == method)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub windows: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_error: Option<String>,
    pub window_size: usize,
    pub min_data_points: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelInfo>,
    /// Why the detectors could not be loaded, when they could not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_error: Option<String>,
}

impl HealthReport {
    /// Health of a bare window store plus whatever is known about the model.
    /// Healthy only when the store answers and the model loaded.
    pub async fn for_store(
        store: &dyn WindowStore,
        min_data_points: usize,
        model: Result<ModelInfo, String>,
    ) -> Self {
        let (windows, store_error) = match store.lengths("*").await {
            Ok(windows) => (windows, None),
            Err(e) => {
                warn!(error = %e, "Window store health check failed");
                (BTreeMap::new(), Some(e.to_string()))
            }
        };
        let (model, engine_error) = match model {
            Ok(info) => (Some(info), None),
            Err(e) => (None, Some(e)),
        };
        let status = if store_error.is_none() && engine_error.is_none() {
            "healthy"
        } else {
            "unhealthy"
        };
        Self {
            status,
            windows,
            store_error,
            window_size: store.capacity(),
            min_data_points,
            model,
            engine_error,
        }
    }
}

/// Sequences the three detectors. Built once and shared by reference.
pub struct DetectionEngine {
    threshold: ThresholdDetector,
    statistical: StatisticalDetector,
    model: ModelDetector,
}

impl DetectionEngine {
    pub fn new(
        threshold: ThresholdDetector,
        statistical: StatisticalDetector,
        model: ModelDetector,
    ) -> Self {
        Self {
            threshold,
            statistical,
            model,
        }
    }

    /// Build every collaborator from configuration. Any missing input
    /// (thresholds, context corpus, model artifacts, summarizer credentials
    /// when enabled) fails the whole engine.
    pub fn from_settings(settings: &Settings) -> Result<Self, DetectError> {
        let corpus = ContextCorpus::load(&settings.paths.alarm_context)?;
        let summarizer: Arc<dyn Summarizer> = if settings.summarizer.enabled {
            Arc::new(ChatSummarizer::new(&settings.summarizer, settings.retry.clone())?)
        } else {
            Arc::new(DisabledSummarizer)
        };
        // Room for every summarizer attempt and the backoff between them.
        let enricher = Arc::new(Enricher::new(
            corpus,
            summarizer,
            settings
                .retry
                .budget(Duration::from_millis(settings.summarizer.timeout_ms)),
        ));

        let threshold = ThresholdDetector::from_file(&settings.paths.thresholds, enricher.clone())?;

        let store: Arc<dyn WindowStore> = Arc::new(SqliteWindowStore::from_config(&settings.window)?);
        let statistical = StatisticalDetector::new(
            store,
            enricher,
            settings.window.min_data_points,
            settings.retry.clone(),
        );

        let model = ModelDetector::load(&settings.paths.model_dir)?;

        info!(
            window_size = settings.window.window_size,
            min_data_points = settings.window.min_data_points,
            summarizer = settings.summarizer.enabled,
            "Detection engine initialized"
        );
        Ok(Self::new(threshold, statistical, model))
    }

    pub fn threshold(&self) -> &ThresholdDetector {
        &self.threshold
    }

    pub fn statistical(&self) -> &StatisticalDetector {
        &self.statistical
    }

    pub fn model(&self) -> &ModelDetector {
        &self.model
    }

    /// Threshold stage only.
    pub async fn detect_heuristic(&self, record: &SensorRecord) -> DetectionReport {
        let start = Instant::now();
        let results = self.threshold.evaluate(record).await;
        DetectionReport {
            timestamp: record.timestamp,
            method: DetectionMethod::Heuristic,
            results: Findings::PerVariable(results),
            processing_time_ms: elapsed_ms(start),
        }
    }

    /// Statistical stage only. Updates the sensor windows.
    pub async fn detect_statistical(
        &self,
        record: &SensorRecord,
    ) -> Result<DetectionReport, DetectError> {
        let start = Instant::now();
        let results = self.statistical.evaluate(record).await?;
        Ok(DetectionReport {
            timestamp: record.timestamp,
            method: DetectionMethod::Statistical,
            results: Findings::PerVariable(results),
            processing_time_ms: elapsed_ms(start),
        })
    }

    /// Model stage only.
    pub fn detect_ml(&self, record: &SensorRecord) -> DetectionReport {
        let start = Instant::now();
        let result = self.model.evaluate(record);
        DetectionReport {
            timestamp: record.timestamp,
            method: DetectionMethod::Ml,
            results: Findings::Aggregate(result),
            processing_time_ms: elapsed_ms(start),
        }
    }

    /// One stage chosen at runtime.
    pub async fn detect_stage(
        &self,
        method: DetectionMethod,
        record: &SensorRecord,
    ) -> Result<DetectionReport, DetectError> {
        match method {
            DetectionMethod::Heuristic => Ok(self.detect_heuristic(record).await),
            DetectionMethod::Statistical => self.detect_statistical(record).await,
            DetectionMethod::Ml => Ok(self.detect_ml(record)),
        }
    }

    /// Full pipeline. Any threshold anomaly stops the record there: the
    /// statistical stage does not see it (its windows are not updated) and
    /// the model is not consulted.
    pub async fn detect(&self, record: &SensorRecord) -> Result<PipelineReport, DetectError> {
        let start = Instant::now();

        let heuristic = self.detect_heuristic(record).await;
        if heuristic.status() == Status::Anomaly {
            debug!(timestamp = %record.timestamp, "Threshold anomaly, skipping later stages");
            return Ok(PipelineReport {
                id: Uuid::new_v4(),
                timestamp: record.timestamp,
                verdict: Status::Anomaly,
                stages: vec![heuristic],
                halted_after: Some(DetectionMethod::Heuristic),
                error: None,
                processing_time_ms: elapsed_ms(start),
            });
        }

        let statistical = self.detect_statistical(record).await?;
        let ml = self.detect_ml(record);

        let statuses = [statistical.status(), ml.status()];
        let verdict = if statuses.contains(&Status::Anomaly) {
            Status::Anomaly
        } else if statuses.contains(&Status::Error) {
            Status::Error
        } else {
            Status::Normal
        };

        Ok(PipelineReport {
            id: Uuid::new_v4(),
            timestamp: record.timestamp,
            verdict,
            stages: vec![heuristic, statistical, ml],
            halted_after: None,
            error: None,
            processing_time_ms: elapsed_ms(start),
        })
    }

    /// Like [`detect`](Self::detect), but a failure becomes an `Error`
    /// report so the caller can move on to the next record.
    pub async fn evaluate(&self, record: &SensorRecord) -> PipelineReport {
        let start = Instant::now();
        match self.detect(record).await {
            Ok(report) => {
                if report.verdict == Status::Anomaly {
                    warn!(id = %report.id, timestamp = %report.timestamp, "Anomaly detected");
                }
                report
            }
            Err(e) => {
                error!(timestamp = %record.timestamp, error = %e, "Detection failed");
                PipelineReport {
                    id: Uuid::new_v4(),
                    timestamp: record.timestamp,
                    verdict: Status::Error,
                    stages: Vec::new(),
                    halted_after: None,
                    error: Some(e.to_string()),
                    processing_time_ms: elapsed_ms(start),
                }
            }
        }
    }

    /// Window lengths and model metadata. A store failure is reported, not
    /// raised.
    pub async fn health(&self) -> HealthReport {
        HealthReport::for_store(
            self.statistical.store().as_ref(),
            self.statistical.min_data_points(),
            Ok(self.model_info()),
        )
        .await
    }

    pub fn model_info(&self) -> ModelInfo {
        self.model.info()
    }

    /// Administrative reset of every window matching `pattern`.
    pub async fn clear_windows(&self, pattern: &str) -> Result<usize, DetectError> {
        let removed = self.statistical.store().clear(pattern).await?;
        info!(%pattern, removed, "Cleared sensor windows");
        Ok(removed)
    }
}
