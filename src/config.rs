//! Engine configuration, loadable from a JSON file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::collection::{CollectionOptions, CollectionSchema, DEFAULT_NLIST};
use crate::distance::Metric;
use crate::error::{Result, RetrievalError};
use crate::ivf::{KMeansParams, DEFAULT_NPROBE_FRACTION};
use crate::normalize::Norm;
use crate::persistence::serialization;
use crate::pipeline::RecoveryPolicy;

/// Configuration for the retrieval engine.
///
/// Every field has a default, so a config file only needs the keys it
/// changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Where collections are persisted. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Clusters per collection unless overridden at creation.
    pub default_nlist: usize,
    /// Share of clusters probed when a query does not set `nprobe`.
    pub nprobe_fraction: f32,
    pub norm: Norm,
    pub metric: Metric,
    /// k-means seed; `None` makes builds non-deterministic.
    pub seed: Option<u64>,
    pub max_iterations: usize,
    pub tolerance: f32,
    /// Checkpoint after this many WAL entries.
    pub checkpoint_interval: usize,
    pub recovery: RecoveryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            default_nlist: DEFAULT_NLIST,
            nprobe_fraction: DEFAULT_NPROBE_FRACTION,
            norm: Norm::L1,
            metric: Metric::InnerProduct,
            seed: Some(42),
            max_iterations: 50,
            tolerance: 1e-4,
            checkpoint_interval: 1000,
            recovery: RecoveryPolicy::TombstoneOrphans,
        }
    }
}

impl EngineConfig {
    /// Read a config file. Missing keys take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config: EngineConfig = serialization::from_json(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.nprobe_fraction > 0.0 && self.nprobe_fraction <= 1.0) {
            return Err(RetrievalError::invalid_parameter(format!(
                "nprobe_fraction must be in (0, 1], got {}",
                self.nprobe_fraction
            )));
        }
        if self.default_nlist == 0 {
            return Err(RetrievalError::invalid_parameter("default_nlist must be at least 1"));
        }
        if self.max_iterations == 0 {
            return Err(RetrievalError::invalid_parameter("max_iterations must be at least 1"));
        }
        Ok(())
    }

    /// Schema for a new collection of the given dimension.
    pub fn schema(&self, dimension: usize) -> CollectionSchema {
        CollectionSchema::new(dimension)
            .with_metric(self.metric)
            .with_norm(self.norm)
            .with_nlist(self.default_nlist)
    }

    pub fn kmeans_params(&self) -> KMeansParams {
        KMeansParams {
            max_iterations: self.max_iterations,
            tolerance: self.tolerance,
            seed: self.seed,
        }
    }

    pub fn collection_options(&self) -> CollectionOptions {
        CollectionOptions {
            nprobe_fraction: self.nprobe_fraction,
            checkpoint_interval: self.checkpoint_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "metric": "l2", "norm": "l2", "recovery": { "policy": "retry_to_convergence", "max_attempts": 3 } }"#,
        )
        .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.metric, Metric::L2);
        assert_eq!(config.norm, Norm::L2);
        assert_eq!(config.recovery, RecoveryPolicy::RetryToConvergence { max_attempts: 3 });
        assert_eq!(config.default_nlist, DEFAULT_NLIST);
        assert_eq!(config.seed, Some(42));
    }

    #[test]
    fn test_rejects_bad_fraction() {
        let config = EngineConfig {
            nprobe_fraction: 1.5,
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RetrievalError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_schema_uses_config() {
        let config = EngineConfig {
            default_nlist: 16,
            ..EngineConfig::default()
        };
        let schema = config.schema(1000);
        assert_eq!(schema.dimension, 1000);
        assert_eq!(schema.nlist, 16);
        assert_eq!(schema.metric, Metric::InnerProduct);
        assert_eq!(schema.norm, Norm::L1);
    }
}
