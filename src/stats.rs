//! Chain summaries and convergence diagnostics.

use crate::chain::Chain;
use crate::error::{BnnError, Result};
use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use std::fmt;

/// Post-warm-up summary of one chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSummary {
    pub num_samples: usize,
    pub acceptance_rate: f64,
    pub mean_accept_prob: f64,
    pub divergences: usize,
    /// Step size in force after warm-up.
    pub step_size: f64,
    pub mean_leapfrog: f64,
}

impl ChainSummary {
    pub fn new(chain: &Chain) -> Self {
        let sampling: Vec<_> = chain.diagnostics().iter().filter(|d| !d.warmup).collect();
        let num_samples = sampling.len();
        let mean_leapfrog = if num_samples == 0 {
            0.0
        } else {
            sampling.iter().map(|d| d.n_leapfrog as f64).sum::<f64>() / num_samples as f64
        };
        Self {
            num_samples,
            acceptance_rate: chain.acceptance_rate(),
            mean_accept_prob: chain.mean_accept_prob(),
            divergences: chain.num_divergent(),
            step_size: sampling.last().map_or(f64::NAN, |d| d.step_size),
            mean_leapfrog,
        }
    }

    pub fn divergence_rate(&self) -> f64 {
        if self.num_samples == 0 {
            0.0
        } else {
            self.divergences as f64 / self.num_samples as f64
        }
    }
}

impl fmt::Display for ChainSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} draws, p(accept)={:.3} (mean stat {:.3}), {} divergent ({:.1}%), eps={:.3e}, {:.1} gradients/draw",
            self.num_samples,
            self.acceptance_rate,
            self.mean_accept_prob,
            self.divergences,
            100.0 * self.divergence_rate(),
            self.step_size,
            self.mean_leapfrog
        )
    }
}

/// Streaming potential scale reduction factor over parallel chains.
///
/// Feed one `[n_chains, n_params]` row-major slice per iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct RhatMulti {
    n: usize,
    mean: Array2<f64>,    // n_chains x n_params
    mean_sq: Array2<f64>, // n_chains x n_params
    n_chains: usize,
    n_params: usize,
}

impl RhatMulti {
    pub fn new(n_chains: usize, n_params: usize) -> Self {
        Self {
            n: 0,
            mean: Array2::zeros((n_chains, n_params)),
            mean_sq: Array2::zeros((n_chains, n_params)),
            n_chains,
            n_params,
        }
    }

    pub fn step(&mut self, x: &[f64]) -> Result<()> {
        let x_arr = ArrayView2::from_shape((self.n_chains, self.n_params), x).map_err(|_| {
            BnnError::LengthMismatch {
                expected: self.n_chains * self.n_params,
                actual: x.len(),
            }
        })?;
        self.n += 1;
        let n = self.n as f64;
        self.mean = (&self.mean * (n - 1.0) + x_arr) / n;
        self.mean_sq = (&self.mean_sq * (n - 1.0) + x_arr.mapv(|v| v * v)) / n;
        Ok(())
    }

    /// R-hat per parameter.
    pub fn all(&self) -> Result<Array1<f64>> {
        if self.n_chains < 2 || self.n < 2 {
            return Err(BnnError::config(
                "R-hat needs at least two chains with two draws each",
            ));
        }
        let n = self.n as f64;
        let n_chains = self.n_chains as f64;
        let mean_chain = self
            .mean
            .mean_axis(Axis(0))
            .ok_or_else(|| BnnError::config("empty chain means"))?;
        let between = (&self.mean - &mean_chain.insert_axis(Axis(0)))
            .mapv(|v| v * v)
            .sum_axis(Axis(0))
            * (n / (n_chains - 1.0));
        let sm2 = (&self.mean_sq - &self.mean.mapv(|v| v * v)) * (n / (n - 1.0));
        let within = sm2
            .mean_axis(Axis(0))
            .ok_or_else(|| BnnError::config("empty within-chain variances"))?;
        let var = &within * ((n - 1.0) / n) + between * (1.0 / n);
        Ok((var / within).mapv(f64::sqrt))
    }

    pub fn max(&self) -> Result<f64> {
        let all = self.all()?;
        all.max()
            .copied()
            .map_err(|e| BnnError::config(format!("R-hat maximum: {e}")))
    }
}

/// R-hat per parameter over the post-warm-up draws of `chains`.
///
/// Chains of different lengths are truncated to the shortest.
pub fn rhat(chains: &[Chain]) -> Result<Array1<f64>> {
    let draws = chains
        .iter()
        .map(Chain::draws)
        .collect::<Result<Vec<_>>>()?;
    let dim = chains.first().map_or(0, Chain::dim);
    if let Some(bad) = chains.iter().find(|c| c.dim() != dim) {
        return Err(BnnError::LengthMismatch {
            expected: dim,
            actual: bad.dim(),
        });
    }
    let len = draws.iter().map(|d| d.nrows()).min().unwrap_or(0);
    let mut acc = RhatMulti::new(chains.len(), dim);
    let mut row = Vec::with_capacity(chains.len() * dim);
    for i in 0..len {
        row.clear();
        for d in &draws {
            row.extend(d.row(i).iter().copied());
        }
        acc.step(&row)?;
    }
    acc.all()
}
