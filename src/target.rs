//! The sampler's view of a model: a log-density over one flat vector.

use crate::data::{DataProvider, Dataset, FullData};
use crate::error::{BnnError, Result};
use crate::flatten::Flattener;
use crate::model::ModelGraph;
use crate::DefaultBackend;
use burn::tensor::backend::AutodiffBackend;
use ndarray::Array1;
use std::marker::PhantomData;

/// Differentiable unnormalised log-density.
///
/// Implement this for anything you want the samplers to explore.
pub trait GradientTarget {
    /// Dimension of the position vector.
    fn dim(&self) -> usize;

    /// Returns `log p(position)` and writes its gradient into `grad`.
    fn logp_and_grad(&self, position: &Array1<f64>, grad: &mut Array1<f64>) -> Result<f64>;

    fn logp(&self, position: &Array1<f64>) -> Result<f64> {
        let mut grad = Array1::zeros(position.len());
        self.logp_and_grad(position, &mut grad)
    }
}

/// A model graph bound to a data provider.
///
/// The graph is only read; every evaluation asks the provider for its batch.
pub struct Posterior<D: DataProvider, B: AutodiffBackend = DefaultBackend> {
    graph: ModelGraph,
    flattener: Flattener,
    data: D,
    likelihood_weight: f64,
    device: B::Device,
    _backend: PhantomData<B>,
}

impl<D: DataProvider, B: AutodiffBackend> Posterior<D, B> {
    pub fn new(graph: ModelGraph, data: D) -> Result<Self> {
        let batch = data.dataset();
        graph.check_data(batch.x(), batch.y())?;
        Ok(Self {
            flattener: graph.flattener(),
            graph,
            data,
            likelihood_weight: 1.0,
            device: Default::default(),
            _backend: PhantomData,
        })
    }

    /// Scales the likelihood by `weight` in `[0, 1]`; zero leaves only the prior.
    ///
    /// The weight applies on top of the provider's
    /// [`likelihood_scale`](DataProvider::likelihood_scale).
    pub fn with_likelihood_weight(mut self, weight: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&weight) {
            return Err(BnnError::config(format!(
                "likelihood weight must lie in [0, 1], got {weight}"
            )));
        }
        self.likelihood_weight = weight;
        Ok(self)
    }

    pub fn with_device(mut self, device: B::Device) -> Self {
        self.device = device;
        self
    }

    pub fn graph(&self) -> &ModelGraph {
        &self.graph
    }

    pub fn flattener(&self) -> &Flattener {
        &self.flattener
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn likelihood_weight(&self) -> f64 {
        self.likelihood_weight
    }

    /// Flat vector of the graph's current values, a natural starting point.
    pub fn initial_position(&self) -> Array1<f64> {
        Array1::from(self.graph.to_vec())
    }
}

impl<B: AutodiffBackend> Posterior<FullData, B> {
    /// Pure prior dynamics: the likelihood weight is zero.
    pub fn prior_only(graph: ModelGraph) -> Result<Self> {
        let n = 1;
        let data = Dataset::new(
            ndarray::Array2::zeros((n, graph.no_in())),
            ndarray::Array2::zeros((n, graph.no_out())),
        )?;
        Self::new(graph, FullData::new(data))?.with_likelihood_weight(0.0)
    }
}

impl<D: DataProvider, B: AutodiffBackend> GradientTarget for Posterior<D, B> {
    fn dim(&self) -> usize {
        self.flattener.len()
    }

    fn logp_and_grad(&self, position: &Array1<f64>, grad: &mut Array1<f64>) -> Result<f64> {
        self.flattener.check_len(position.len())?;
        let batch = self.data.batch();
        let weight = self.likelihood_weight * self.data.likelihood_scale();
        let vec = position.to_vec();
        let (logp, g) = self.graph.log_prob_and_grad::<B>(
            &vec,
            batch.x(),
            batch.y(),
            weight,
            &self.device,
        )?;
        grad.assign(&Array1::from(g));
        Ok(logp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Minibatch;
    use crate::layer::Activation;
    use crate::model::ModelConfig;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array2};
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    fn inputs(n: usize, rng: &mut SmallRng) -> Array2<f64> {
        Array2::from_shape_simple_fn((n, 1), || rng.gen_range(-2.0..2.0))
    }

    #[test]
    fn test_minibatch_likelihood_is_rescaled() {
        let mut rng = SmallRng::seed_from_u64(11);
        let config = ModelConfig::bnn(&[1, 4, 1], Activation::Tanh, Activation::Identity);
        let graph = ModelGraph::from_prior(config, &mut rng).unwrap();
        let x = inputs(200, &mut rng);
        // Equal residuals on every row make each batch exact.
        let y = graph.forward(&x).unwrap().mapv(|mu| mu + 0.3);
        let data = Dataset::new(x, y).unwrap();

        let full: Posterior<_> = Posterior::new(graph.clone(), FullData::new(data.clone())).unwrap();
        let mini: Posterior<_> = Posterior::new(graph, Minibatch::new(data, 20, 1).unwrap()).unwrap();
        let position = full.initial_position();
        let expected = full.logp(&position).unwrap();
        for _ in 0..5 {
            assert_abs_diff_eq!(mini.logp(&position).unwrap(), expected, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_mean_minibatch_likelihood_matches_full_data() {
        let mut rng = SmallRng::seed_from_u64(12);
        let config =
            ModelConfig::bnn(&[1, 4, 1], Activation::Tanh, Activation::Identity).noise_scale(0.5);
        let graph = ModelGraph::from_prior(config, &mut rng).unwrap();
        let x = inputs(200, &mut rng);
        let y = graph.simulate(&x, &mut rng).unwrap();
        let data = Dataset::new(x, y).unwrap();
        let prior = graph.prior_log_prob();
        let full_lik = graph.log_prob_at(&graph.to_vec(), data.x(), data.y()).unwrap() - prior;

        let mini: Posterior<_> = Posterior::new(graph, Minibatch::new(data, 20, 2).unwrap()).unwrap();
        let position = mini.initial_position();
        let draws = 1000;
        let mean_lik = (0..draws)
            .map(|_| mini.logp(&position).unwrap() - prior)
            .sum::<f64>()
            / draws as f64;
        assert!(
            (mean_lik - full_lik).abs() < 0.05 * full_lik.abs(),
            "mean minibatch loglik {mean_lik} vs full-data {full_lik}"
        );
    }

    #[test]
    fn test_value_matches_host_log_prob() {
        let mut rng = SmallRng::seed_from_u64(2);
        let config = ModelConfig::bnn(&[1, 4, 1], Activation::Tanh, Activation::Identity);
        let graph = ModelGraph::from_prior(config, &mut rng).unwrap();
        let x = array![[0.5], [-1.0], [2.0]];
        let y = array![[0.1], [0.2], [-0.3]];
        let expected = graph.log_prob_at(&graph.to_vec(), &x, &y).unwrap();

        let data = FullData::new(Dataset::new(x, y).unwrap());
        let posterior: Posterior<_> = Posterior::new(graph, data).unwrap();
        let lp = posterior.logp(&posterior.initial_position()).unwrap();
        assert_abs_diff_eq!(lp, expected, epsilon = 1e-9);
    }

    #[test]
    fn test_prior_only_ignores_data() {
        let mut rng = SmallRng::seed_from_u64(4);
        let config = ModelConfig::bnn(&[2, 3, 1], Activation::Relu, Activation::Identity);
        let graph = ModelGraph::from_prior(config, &mut rng).unwrap();
        let prior = graph.prior_log_prob();
        let posterior: Posterior<_> = Posterior::prior_only(graph).unwrap();
        let lp = posterior.logp(&posterior.initial_position()).unwrap();
        assert_abs_diff_eq!(lp, prior, epsilon = 1e-9);
    }

    #[test]
    fn test_bad_inputs_are_rejected() {
        let graph = ModelGraph::new(ModelConfig::bnn(
            &[2, 1],
            Activation::Identity,
            Activation::Identity,
        ))
        .unwrap();
        let wrong_width = FullData::new(Dataset::new(Array2::zeros((3, 1)), Array2::zeros((3, 1))).unwrap());
        assert!(Posterior::<_>::new(graph.clone(), wrong_width).is_err());

        let data = FullData::new(Dataset::new(Array2::zeros((3, 2)), Array2::zeros((3, 1))).unwrap());
        let posterior: Posterior<_> = Posterior::new(graph, data).unwrap();
        assert!(posterior.logp(&Array1::zeros(3)).is_err());
        assert!(Posterior::<FullData>::prior_only(posterior.graph().clone())
            .unwrap()
            .with_likelihood_weight(1.5)
            .is_err());
    }
}
