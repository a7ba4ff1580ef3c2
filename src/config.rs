//! Experiment description read from a JSON file.

use crate::data::Dataset;
use crate::error::{BnnError, Result};
use crate::layer::Activation;
use crate::model::{ModelConfig, ModelGraph};
use crate::sampler::SamplerConfig;
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

fn default_n() -> usize {
    1000
}
fn default_data_seed() -> u64 {
    42
}
fn default_x_low() -> f64 {
    -2.0
}
fn default_x_high() -> f64 {
    2.0
}

/// Synthetic regression data drawn from the model itself.
///
/// Covariates are uniform on `[x_low, x_high)`; targets are simulated from a
/// "true" model drawn from the prior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_n")]
    pub n: usize,
    #[serde(default = "default_data_seed")]
    pub seed: u64,
    #[serde(default = "default_x_low")]
    pub x_low: f64,
    #[serde(default = "default_x_high")]
    pub x_high: f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            n: default_n(),
            seed: default_data_seed(),
            x_low: default_x_low(),
            x_high: default_x_high(),
        }
    }
}

impl DataConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n == 0 {
            return Err(BnnError::config("data.n must be at least 1"));
        }
        if !(self.x_low.is_finite() && self.x_high.is_finite() && self.x_low < self.x_high) {
            return Err(BnnError::config(format!(
                "data range [{}, {}) is empty or not finite",
                self.x_low, self.x_high
            )));
        }
        Ok(())
    }

    /// Draws a true model from the prior and simulates `n` observations.
    ///
    /// Returns the true model next to the data so predictions can be compared.
    pub fn generate(&self, model: &ModelConfig) -> Result<(ModelGraph, Dataset)> {
        self.validate()?;
        let mut rng = SmallRng::seed_from_u64(self.seed);
        let truth = ModelGraph::from_prior(model.clone(), &mut rng)?;
        let x = Array2::from_shape_simple_fn((self.n, truth.no_in()), || {
            rng.gen_range(self.x_low..self.x_high)
        });
        let y = truth.simulate(&x, &mut rng)?;
        Ok((truth, Dataset::new(x, y)?))
    }
}

fn default_model() -> ModelConfig {
    ModelConfig::bnn(&[2, 10, 1], Activation::Tanh, Activation::Identity)
}

/// Model, sampler and data settings of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default = "default_model")]
    pub model: ModelConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub data: DataConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            sampler: SamplerConfig::default(),
            data: DataConfig::default(),
        }
    }
}

impl ExperimentConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks all three parts without building anything expensive.
    pub fn validate(&self) -> Result<()> {
        ModelGraph::new(self.model.clone())?;
        self.sampler.validate()?;
        self.data.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config: ExperimentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ExperimentConfig::default());
        assert_eq!(config.model.num_params(), 2 * 10 + 10 + 10);
    }

    #[test]
    fn test_load_reads_partial_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"sampler": {{"kind": "sgld", "step_size": 0.001}}, "data": {{"n": 50}}}}"#
        )
        .unwrap();
        let config = ExperimentConfig::load(file.path()).unwrap();
        assert_eq!(config.data.n, 50);
        assert_eq!(config.data.x_high, 2.0);
        assert_eq!(config.sampler.step_size, 0.001);
    }

    #[test]
    fn test_invalid_files_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"data": {{"x_low": 1.0, "x_high": 1.0}}}}"#).unwrap();
        assert!(matches!(
            ExperimentConfig::load(file.path()),
            Err(BnnError::Configuration(_))
        ));
    }

    #[test]
    fn test_generated_data_lies_in_range() {
        let data = DataConfig {
            n: 20,
            ..DataConfig::default()
        };
        let (truth, dataset) = data.generate(&default_model()).unwrap();
        assert_eq!(dataset.len(), 20);
        assert_eq!(dataset.x().ncols(), truth.no_in());
        assert!(dataset.x().iter().all(|v| (-2.0..2.0).contains(v)));
        assert!(dataset.y().iter().all(|v| v.is_finite()));
    }
}
