use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::detect::DetectError;

pub const SCALER_FILE: &str = "scaler.json";
pub const PCA_FILE: &str = "pca.json";
pub const THRESHOLD_FILE: &str = "threshold.json";
pub const FEATURES_FILE: &str = "features.json";

/// Standardization parameters (per feature).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalerParams {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

/// PCA projection: `components` is `[n_components][n_features]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionParams {
    pub components: Vec<Vec<f64>>,
    pub mean: Vec<f64>,
}

/// Pretrained scaler + PCA + threshold, immutable after load.
#[derive(Debug, Clone)]
pub struct ModelBundle {
    pub path: PathBuf,
    pub scaler: ScalerParams,
    pub projection: ProjectionParams,
    pub threshold: f64,
    pub features: Vec<String>,
}

fn read_artifact<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<T, DetectError> {
    let path = dir.join(name);
    let content = fs::read_to_string(&path).map_err(|e| {
        DetectError::Configuration(format!(
            "could not read model artifact {}: {}",
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        DetectError::Configuration(format!(
            "could not parse model artifact {}: {}",
            path.display(),
            e
        ))
    })
}

impl ModelBundle {
    /// Load all four artifacts from `dir`. Any failure is fatal; there is no
    /// partially loaded bundle.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, DetectError> {
        let dir = dir.as_ref();
        let bundle = Self {
            path: dir.to_path_buf(),
            scaler: read_artifact(dir, SCALER_FILE)?,
            projection: read_artifact(dir, PCA_FILE)?,
            threshold: read_artifact(dir, THRESHOLD_FILE)?,
            features: read_artifact(dir, FEATURES_FILE)?,
        };
        bundle.validate()?;
        info!(
            path = %dir.display(),
            features = bundle.features.len(),
            components = bundle.projection.components.len(),
            threshold = bundle.threshold,
            "Loaded model bundle"
        );
        Ok(bundle)
    }

    fn validate(&self) -> Result<(), DetectError> {
        let n = self.features.len();
        let bad = |what: String| -> Result<(), DetectError> {
            Err(DetectError::Configuration(format!("model bundle: {}", what)))
        };

        if n == 0 {
            return bad("feature list is empty".into());
        }
        if self.scaler.mean.len() != n || self.scaler.scale.len() != n {
            return bad(format!(
                "scaler has {}/{} params for {} features",
                self.scaler.mean.len(),
                self.scaler.scale.len(),
                n
            ));
        }
        if self.projection.mean.len() != n {
            return bad(format!(
                "projection mean has {} entries for {} features",
                self.projection.mean.len(),
                n
            ));
        }
        if self.projection.components.is_empty() {
            return bad("projection has no components".into());
        }
        if let Some(row) = self.projection.components.iter().find(|c| c.len() != n) {
            return bad(format!(
                "projection component has {} entries for {} features",
                row.len(),
                n
            ));
        }
        if !self.threshold.is_finite() {
            return bad(format!("threshold {} is not finite", self.threshold));
        }
        Ok(())
    }

    pub fn n_components(&self) -> usize {
        self.projection.components.len()
    }

    /// Standardize a raw vector ordered like `features`. A zero scale is
    /// treated as one.
    pub fn scale(&self, raw: &[f64]) -> Vec<f64> {
        raw.iter()
            .zip(self.scaler.mean.iter().zip(&self.scaler.scale))
            .map(|(x, (m, s))| {
                let s = if *s == 0.0 { 1.0 } else { *s };
                (x - m) / s
            })
            .collect()
    }

    pub fn project(&self, scaled: &[f64]) -> Vec<f64> {
        self.projection
            .components
            .iter()
            .map(|comp| {
                comp.iter()
                    .zip(scaled.iter().zip(&self.projection.mean))
                    .map(|(c, (x, mu))| c * (x - mu))
                    .sum()
            })
            .collect()
    }

    pub fn reconstruct(&self, projected: &[f64]) -> Vec<f64> {
        let mut out = self.projection.mean.clone();
        for (z, comp) in projected.iter().zip(&self.projection.components) {
            for (o, c) in out.iter_mut().zip(comp) {
                *o += z * c;
            }
        }
        out
    }

    /// Mean squared error between the scaled input and its reconstruction.
    pub fn reconstruction_error(&self, raw: &[f64]) -> f64 {
        let scaled = self.scale(raw);
        let rebuilt = self.reconstruct(&self.project(&scaled));
        let sum: f64 = scaled
            .iter()
            .zip(&rebuilt)
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        sum / scaled.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_bundle(dir: &Path) {
        fs::write(dir.join(FEATURES_FILE), r#"["a", "b"]"#).unwrap();
        fs::write(dir.join(SCALER_FILE), r#"{"mean": [10.0, 20.0], "scale": [2.0, 0.0]}"#)
            .unwrap();
        fs::write(dir.join(PCA_FILE), r#"{"components": [[1.0, 0.0]], "mean": [0.0, 0.0]}"#)
            .unwrap();
        fs::write(dir.join(THRESHOLD_FILE), "0.5").unwrap();
    }

    #[test]
    fn test_load_and_reconstruct() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path());
        let bundle = ModelBundle::load(dir.path()).unwrap();
        assert_eq!(bundle.n_components(), 1);

        // Training mean reconstructs exactly.
        assert_eq!(bundle.reconstruction_error(&[10.0, 20.0]), 0.0);

        // Along the kept component: still exact.
        assert_eq!(bundle.reconstruction_error(&[14.0, 20.0]), 0.0);

        // Off-component: b scaled with zero scale -> 3.0, dropped by PCA.
        let err = bundle.reconstruction_error(&[10.0, 23.0]);
        assert!((err - 4.5).abs() < 1e-12);
    }

    #[test]
    fn test_missing_artifact_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path());
        fs::remove_file(dir.path().join(THRESHOLD_FILE)).unwrap();
        let err = ModelBundle::load(dir.path()).unwrap_err();
        assert!(matches!(err, DetectError::Configuration(_)));
        assert!(err.to_string().contains("threshold.json"));
    }

    #[test]
    fn test_dimension_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path());
        fs::write(dir.path().join(PCA_FILE), r#"{"components": [[1.0]], "mean": [0.0, 0.0]}"#)
            .unwrap();
        assert!(matches!(
            ModelBundle::load(dir.path()),
            Err(DetectError::Configuration(_))
        ));
    }
}
