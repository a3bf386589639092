use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, warn};

use super::{DetectError, ModelResult, SensorRecord, Status};
use crate::analysis::model::ModelBundle;

/// Snapshot of the loaded model for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub model_path: PathBuf,
    pub threshold: f64,
    pub pca_components: usize,
    pub features: Vec<String>,
    pub evaluations: u64,
}

/// Reconstruction-error detector over the full feature vector.
pub struct ModelDetector {
    bundle: ModelBundle,
    evaluations: AtomicU64,
}

impl ModelDetector {
    pub fn new(bundle: ModelBundle) -> Self {
        Self {
            bundle,
            evaluations: AtomicU64::new(0),
        }
    }

    /// Load artifacts from `dir`; the detector does not exist unless every
    /// artifact loaded.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, DetectError> {
        Ok(Self::new(ModelBundle::load(dir)?))
    }

    pub fn bundle(&self) -> &ModelBundle {
        &self.bundle
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    /// Required features in model order, or the list of missing ones.
    pub fn feature_vector(&self, record: &SensorRecord) -> Result<Vec<f64>, DetectError> {
        let mut missing = Vec::new();
        let mut vector = Vec::with_capacity(self.bundle.features.len());
        for name in &self.bundle.features {
            match record.data.get(name) {
                Some(v) => vector.push(*v),
                None => missing.push(name.clone()),
            }
        }
        if missing.is_empty() {
            Ok(vector)
        } else {
            Err(DetectError::MissingFeatures { missing })
        }
    }

    /// Aggregate verdict for the record. Missing features yield `Error`,
    /// which is distinct from `Anomaly`.
    pub fn evaluate(&self, record: &SensorRecord) -> ModelResult {
        self.evaluations.fetch_add(1, Ordering::Relaxed);

        match self.feature_vector(record) {
            Ok(vector) => {
                let error = self.bundle.reconstruction_error(&vector);
                let status = if error > self.bundle.threshold {
                    Status::Anomaly
                } else {
                    Status::Normal
                };
                debug!(reconstruction_error = error, threshold = self.bundle.threshold, %status, "Model evaluated");
                ModelResult {
                    values: record.data.clone(),
                    status,
                    reconstruction_error: Some(error),
                    missing_features: Vec::new(),
                }
            }
            Err(e) => {
                warn!(error = %e, "Model input rejected");
                let missing = match e {
                    DetectError::MissingFeatures { missing } => missing,
                    _ => Vec::new(),
                };
                ModelResult {
                    values: record.data.clone(),
                    status: Status::Error,
                    reconstruction_error: None,
                    missing_features: missing,
                }
            }
        }
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            model_path: self.bundle.path.clone(),
            threshold: self.bundle.threshold,
            pca_components: self.bundle.n_components(),
            features: self.bundle.features.clone(),
            evaluations: self.evaluations(),
        }
    }
}
