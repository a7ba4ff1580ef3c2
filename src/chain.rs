//! Accumulated draws and the persisted run record.

use crate::error::{BnnError, Result};
use crate::flatten::Flattener;
use crate::model::{ModelConfig, ModelGraph};
use crate::sampler::SamplerConfig;
use log::info;
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Per-iteration record written next to each position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepDiagnostics {
    pub iteration: usize,
    /// Log-probability at the position kept after the iteration.
    pub log_prob: f64,
    pub accept_prob: f64,
    pub accepted: bool,
    pub divergent: bool,
    /// Step size used by the iteration.
    pub step_size: f64,
    pub n_leapfrog: usize,
    pub warmup: bool,
}

/// Append-only sequence of positions, one per iteration, warm-up included.
///
/// Only the [`Sampler`](crate::sampler::Sampler) appends to a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    dim: usize,
    positions: Vec<Vec<f64>>,
    diagnostics: Vec<StepDiagnostics>,
}

impl Chain {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            positions: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, position: &Array1<f64>, diagnostics: StepDiagnostics) {
        debug_assert_eq!(position.len(), self.dim);
        self.positions.push(position.to_vec());
        self.diagnostics.push(diagnostics);
    }

    /// Number of recorded iterations, warm-up included.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn positions(&self) -> &[Vec<f64>] {
        &self.positions
    }

    pub fn diagnostics(&self) -> &[StepDiagnostics] {
        &self.diagnostics
    }

    pub fn last(&self) -> Option<&StepDiagnostics> {
        self.diagnostics.last()
    }

    pub fn num_warmup(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.warmup).count()
    }

    fn sampling(&self) -> impl Iterator<Item = (&Vec<f64>, &StepDiagnostics)> {
        self.positions
            .iter()
            .zip(&self.diagnostics)
            .filter(|(_, d)| !d.warmup)
    }

    /// Divergent transitions after warm-up.
    pub fn num_divergent(&self) -> usize {
        self.sampling().filter(|(_, d)| d.divergent).count()
    }

    /// Post-warm-up draws as a `[num_samples, dim]` matrix.
    pub fn draws(&self) -> Result<Array2<f64>> {
        let rows: Vec<f64> = self
            .sampling()
            .flat_map(|(p, _)| p.iter().copied())
            .collect();
        let n = rows.len() / self.dim.max(1);
        Array2::from_shape_vec((n, self.dim), rows)
            .map_err(|e| BnnError::config(format!("chain draws: {e}")))
    }

    /// Every recorded position, warm-up included, as a `[len, dim]` matrix.
    pub fn all(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.len(), self.dim), |(i, j)| self.positions[i][j])
    }

    /// Mean acceptance statistic after warm-up (0 for an empty sample).
    pub fn mean_accept_prob(&self) -> f64 {
        let (sum, n) = self
            .sampling()
            .fold((0.0, 0usize), |(s, n), (_, d)| (s + d.accept_prob, n + 1));
        if n == 0 {
            0.0
        } else {
            sum / n as f64
        }
    }

    /// Fraction of post-warm-up proposals that were accepted.
    pub fn acceptance_rate(&self) -> f64 {
        let (acc, n) = self
            .sampling()
            .fold((0usize, 0usize), |(a, n), (_, d)| (a + usize::from(d.accepted), n + 1));
        if n == 0 {
            0.0
        } else {
            acc as f64 / n as f64
        }
    }

    /// Checks that every position has `dim` entries and is paired with one
    /// diagnostics entry.
    pub fn validate(&self) -> Result<()> {
        if self.positions.len() != self.diagnostics.len() {
            return Err(BnnError::MalformedRecord(format!(
                "{} positions but {} diagnostics entries",
                self.positions.len(),
                self.diagnostics.len()
            )));
        }
        if let Some((i, row)) = self
            .positions
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != self.dim)
        {
            return Err(BnnError::MalformedRecord(format!(
                "position {i} has {} entries, the chain has dimension {}",
                row.len(),
                self.dim
            )));
        }
        Ok(())
    }

    /// Componentwise mean of the post-warm-up draws.
    pub fn posterior_mean(&self) -> Option<Array1<f64>> {
        let draws = self.draws().ok()?;
        draws.mean_axis(ndarray::Axis(0))
    }
}

/// Format version written by [`ChainRecord::save`].
pub const RECORD_VERSION: u32 = 1;

/// Everything needed to reuse a finished run: the model and sampler
/// configuration, the flat layout the draws refer to, and the chain itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRecord {
    pub version: u32,
    /// Kernel name, e.g. `"hmc"`.
    pub sampler: String,
    pub model: ModelConfig,
    pub sampler_config: SamplerConfig,
    pub layout: Flattener,
    pub chain: Chain,
}

impl ChainRecord {
    pub fn new(
        sampler: impl Into<String>,
        model: ModelConfig,
        sampler_config: SamplerConfig,
        layout: Flattener,
        chain: Chain,
    ) -> Self {
        Self {
            version: RECORD_VERSION,
            sampler: sampler.into(),
            model,
            sampler_config,
            layout,
            chain,
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush()?;
        info!(
            "saved {} iterations of a {}-dimensional {} chain to {}",
            self.chain.len(),
            self.chain.dim(),
            self.sampler,
            path.display()
        );
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);
        let record: Self = serde_json::from_reader(reader)?;
        if record.version != RECORD_VERSION {
            return Err(BnnError::UnsupportedRecordVersion {
                found: record.version,
                supported: RECORD_VERSION,
            });
        }
        if record.layout.len() != record.chain.dim() {
            return Err(BnnError::MalformedRecord(format!(
                "layout has {} entries but the chain has dimension {}",
                record.layout.len(),
                record.chain.dim()
            )));
        }
        record.chain.validate()?;
        info!("loaded chain record from {}", path.display());
        Ok(record)
    }

    /// Rebuilds the model graph and checks that its layout matches the record.
    ///
    /// The returned graph holds the values of the last recorded position.
    pub fn rebuild_model(&self) -> Result<ModelGraph> {
        let mut graph = ModelGraph::new(self.model.clone())?;
        let layout = graph.flattener();
        if layout != self.layout {
            return Err(BnnError::config(
                "recorded layout does not match the model configuration",
            ));
        }
        if let Some(last) = self.chain.positions().last() {
            graph.load_vec(last)?;
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::Activation;

    fn diag(iteration: usize, warmup: bool, accepted: bool, divergent: bool) -> StepDiagnostics {
        StepDiagnostics {
            iteration,
            log_prob: -1.0,
            accept_prob: if accepted { 0.9 } else { 0.1 },
            accepted,
            divergent,
            step_size: 0.1,
            n_leapfrog: 5,
            warmup,
        }
    }

    fn chain() -> Chain {
        let mut chain = Chain::new(2);
        chain.push(&Array1::from(vec![10.0, 10.0]), diag(0, true, false, true));
        chain.push(&Array1::from(vec![1.0, 2.0]), diag(1, false, true, false));
        chain.push(&Array1::from(vec![3.0, 4.0]), diag(2, false, false, true));
        chain
    }

    #[test]
    fn test_summaries_skip_warmup() {
        let chain = chain();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.num_warmup(), 1);
        assert_eq!(chain.num_divergent(), 1);
        assert_eq!(chain.draws().unwrap(), ndarray::array![[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(chain.all().dim(), (3, 2));
        assert_eq!(chain.acceptance_rate(), 0.5);
        assert!((chain.mean_accept_prob() - 0.5).abs() < 1e-12);
        assert_eq!(chain.posterior_mean().unwrap(), ndarray::array![2.0, 3.0]);
    }

    #[test]
    fn test_empty_chain_has_no_mean() {
        let chain = Chain::new(3);
        assert!(chain.is_empty());
        assert_eq!(chain.draws().unwrap().dim(), (0, 3));
        assert!(chain.posterior_mean().is_none());
        assert_eq!(chain.mean_accept_prob(), 0.0);
    }

    #[test]
    fn test_record_round_trips_through_json() {
        let model = ModelConfig::bnn(&[2, 1], Activation::Identity, Activation::Identity);
        let graph = ModelGraph::new(model.clone()).unwrap();
        let mut chain = Chain::new(graph.dim());
        chain.push(&Array1::from(vec![0.5, -0.5]), diag(0, false, true, false));
        let record = ChainRecord::new("hmc", model, SamplerConfig::default(), graph.flattener(), chain);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        record.save(&path).unwrap();
        let loaded = ChainRecord::load(&path).unwrap();
        assert_eq!(loaded, record);

        let rebuilt = loaded.rebuild_model().unwrap();
        assert_eq!(rebuilt.to_vec(), vec![0.5, -0.5]);
    }

    #[test]
    fn test_future_versions_are_rejected() {
        let model = ModelConfig::bnn(&[1, 1], Activation::Identity, Activation::Identity);
        let graph = ModelGraph::new(model.clone()).unwrap();
        let mut record = ChainRecord::new(
            "hmc",
            model,
            SamplerConfig::default(),
            graph.flattener(),
            Chain::new(graph.dim()),
        );
        record.version = RECORD_VERSION + 1;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        record.save(&path).unwrap();
        assert!(matches!(
            ChainRecord::load(&path),
            Err(BnnError::UnsupportedRecordVersion { found: 2, supported: 1 })
        ));
    }

    #[test]
    fn test_corrupted_records_are_rejected() {
        let model = ModelConfig::bnn(&[2, 1], Activation::Identity, Activation::Identity);
        let graph = ModelGraph::new(model.clone()).unwrap();
        let mut chain = Chain::new(graph.dim());
        for i in 0..3 {
            chain.push(&Array1::from(vec![i as f64, -1.0]), diag(i, false, true, false));
        }
        let record = ChainRecord::new("hmc", model, SamplerConfig::default(), graph.flattener(), chain);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");

        let mut ragged = record.clone();
        ragged.chain.positions[1].pop();
        let mut unpaired = record.clone();
        unpaired.chain.diagnostics.pop();
        let mut wide = record.clone();
        wide.chain.dim = 3;
        for bad in [ragged, unpaired, wide] {
            bad.save(&path).unwrap();
            let err = ChainRecord::load(&path).unwrap_err();
            assert!(matches!(err, BnnError::MalformedRecord(_)), "{err:?}");
        }

        record.save(&path).unwrap();
        assert_eq!(ChainRecord::load(&path).unwrap().chain.all().dim(), (3, 2));
    }

    #[test]
    fn test_mismatched_layout_is_rejected() {
        let model = ModelConfig::bnn(&[2, 1], Activation::Identity, Activation::Identity);
        let other = ModelGraph::new(ModelConfig::bnn(&[3, 1], Activation::Identity, Activation::Identity))
            .unwrap();
        let record = ChainRecord::new(
            "hmc",
            model,
            SamplerConfig::default(),
            other.flattener(),
            Chain::new(other.dim()),
        );
        assert!(record.rebuild_model().is_err());
    }
}
