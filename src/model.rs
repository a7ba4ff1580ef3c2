/*!
Composite models: feed-forward stacks and structured additive models.

A [`ModelGraph`] is an ordered list of blocks. Each block reads a column range
of the design matrix and runs it through its layers; block outputs are summed.
A plain BNN is a single block named `net` that reads every column. An
optional heteroscedastic noise site `noise.sigma` comes last.

The order `blocks -> layers -> sites -> noise` is the only source of truth
for the flat parameter vector, and [`ModelGraph::flattener`] derives the
layout from it on demand.
*/

use crate::error::{BnnError, Result};
use crate::flatten::{Flattener, ParamTree};
use crate::layer::{Activation, Layer, LayerConfig};
use crate::prior::{Prior, Support};
use crate::site::ParameterSite;
use crate::tensor::{array2_to_tensor, scalar, tensor_to_array2, tensor_to_vec, vec_to_tensor};
use crate::HostBackend;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use ndarray::Array2;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::Range;

const LN_2PI: f64 = 1.837_877_066_409_345_5;
const NOISE_SITE: &str = "noise.sigma";

/// How the layers are arranged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Architecture {
    /// One feed-forward stack over all input columns.
    Sequential { layers: Vec<LayerConfig> },
    /// Named effect blocks summed at the output.
    Structured { blocks: Vec<BlockConfig> },
}

/// One additive effect of a structured model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockConfig {
    pub name: String,
    /// Columns `[start, end)` of the design matrix this block reads.
    pub columns: Range<usize>,
    pub kind: BlockKind,
}

fn default_order() -> usize {
    1
}

fn default_tau_prior() -> Prior {
    Prior::InverseGamma {
        concentration: 1.0,
        rate: 1.0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Network {
        layers: Vec<LayerConfig>,
    },
    /// Smoothing spline on a precomputed basis design.
    Spline {
        no_basis: usize,
        #[serde(default = "default_order")]
        order: usize,
        #[serde(default = "default_tau_prior")]
        tau_prior: Prior,
    },
}

fn default_noise_scale() -> f64 {
    1.0
}

fn default_noise_prior() -> Prior {
    Prior::Gamma {
        concentration: 1.0,
        rate: 1.0,
    }
}

/// Everything needed to rebuild a [`ModelGraph`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub architecture: Architecture,
    /// Learn the observation noise as a positive site instead of fixing it.
    #[serde(default)]
    pub heteroscedastic: bool,
    /// Fixed observation noise standard deviation, ignored when heteroscedastic.
    #[serde(default = "default_noise_scale")]
    pub noise_scale: f64,
    #[serde(default = "default_noise_prior")]
    pub noise_prior: Prior,
}

impl ModelConfig {
    pub fn new(architecture: Architecture) -> Self {
        Self {
            architecture,
            heteroscedastic: false,
            noise_scale: default_noise_scale(),
            noise_prior: default_noise_prior(),
        }
    }

    /// Classic BNN over `hunits = [no_in, h_1, ..., no_out]`: hidden layers with
    /// bias and `activation`, final layer without bias and `final_activation`.
    pub fn bnn(hunits: &[usize], activation: Activation, final_activation: Activation) -> Self {
        let n_layers = hunits.len().saturating_sub(1);
        let layers = hunits
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                let last = i + 1 == n_layers;
                LayerConfig::new(w[0], w[1])
                    .bias(!last)
                    .activation(if last { final_activation } else { activation })
            })
            .collect();
        Self::new(Architecture::Sequential { layers })
    }

    pub fn structured(blocks: Vec<BlockConfig>) -> Self {
        Self::new(Architecture::Structured { blocks })
    }

    pub fn heteroscedastic(mut self, heteroscedastic: bool) -> Self {
        self.heteroscedastic = heteroscedastic;
        self
    }

    pub fn noise_scale(mut self, noise_scale: f64) -> Self {
        self.noise_scale = noise_scale;
        self
    }

    pub fn noise_prior(mut self, noise_prior: Prior) -> Self {
        self.noise_prior = noise_prior;
        self
    }

    /// Number of scalars in the flat vector, computable before any graph exists.
    pub fn num_params(&self) -> usize {
        let layers = |ls: &[LayerConfig]| ls.iter().map(LayerConfig::num_params).sum::<usize>();
        let body = match &self.architecture {
            Architecture::Sequential { layers: ls } => layers(ls),
            Architecture::Structured { blocks } => blocks
                .iter()
                .map(|b| match &b.kind {
                    BlockKind::Network { layers: ls } => layers(ls),
                    BlockKind::Spline { no_basis, .. } => no_basis + 1,
                })
                .sum(),
        };
        body + usize::from(self.heteroscedastic)
    }
}

/// A named effect: a column range and the layers applied to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    name: String,
    columns: Range<usize>,
    layers: Vec<Layer>,
}

impl Block {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> Range<usize> {
        self.columns.clone()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }
}

fn network_layers(block: &str, columns: &Range<usize>, configs: &[LayerConfig]) -> Result<Vec<Layer>> {
    let first = configs
        .first()
        .ok_or_else(|| BnnError::config(format!("block `{block}` has no layers")))?;
    if first.no_in != columns.len() {
        return Err(BnnError::config(format!(
            "block `{block}` reads {} columns but its first layer expects no_in = {}",
            columns.len(),
            first.no_in
        )));
    }
    for (i, pair) in configs.windows(2).enumerate() {
        if pair[0].no_out != pair[1].no_in {
            return Err(BnnError::config(format!(
                "block `{block}`: layer {i} has no_out = {} but layer {} has no_in = {}",
                pair[0].no_out,
                i + 1,
                pair[1].no_in
            )));
        }
    }
    configs
        .iter()
        .enumerate()
        .map(|(i, c)| Layer::dense(&format!("{block}.{i}"), c))
        .collect()
}

/// The unnormalised posterior over one flat parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelGraph {
    config: ModelConfig,
    blocks: Vec<Block>,
    noise: Option<ParameterSite>,
    no_in: usize,
    no_out: usize,
}

impl ModelGraph {
    /// Builds the graph with every site at the origin of its unconstrained scale.
    pub fn new(config: ModelConfig) -> Result<Self> {
        if !(config.noise_scale.is_finite() && config.noise_scale > 0.0) {
            return Err(BnnError::config(format!(
                "noise_scale must be finite and positive, got {}",
                config.noise_scale
            )));
        }
        let blocks = match &config.architecture {
            Architecture::Sequential { layers } => {
                let no_in = layers.first().map_or(0, |l| l.no_in);
                if layers.is_empty() {
                    return Err(BnnError::config("a sequential model needs at least one layer"));
                }
                let columns = 0..no_in;
                vec![Block {
                    layers: network_layers("net", &columns, layers)?,
                    name: "net".to_string(),
                    columns,
                }]
            }
            Architecture::Structured { blocks } => {
                if blocks.is_empty() {
                    return Err(BnnError::config("a structured model needs at least one block"));
                }
                let mut seen = HashSet::new();
                let mut built = Vec::with_capacity(blocks.len());
                for b in blocks {
                    if !seen.insert(b.name.as_str()) || b.name == "noise" || b.name.contains('.') {
                        return Err(BnnError::config(format!(
                            "block name `{}` is duplicated, reserved or contains a dot",
                            b.name
                        )));
                    }
                    if b.columns.is_empty() {
                        return Err(BnnError::config(format!(
                            "block `{}` reads an empty column range {:?}",
                            b.name, b.columns
                        )));
                    }
                    let layers = match &b.kind {
                        BlockKind::Network { layers } => network_layers(&b.name, &b.columns, layers)?,
                        BlockKind::Spline {
                            no_basis,
                            order,
                            tau_prior,
                        } => {
                            if *no_basis != b.columns.len() {
                                return Err(BnnError::config(format!(
                                    "spline block `{}` has {no_basis} basis functions but reads {} columns",
                                    b.name,
                                    b.columns.len()
                                )));
                            }
                            vec![Layer::spline(&format!("{}.0", b.name), *no_basis, *order, *tau_prior)?]
                        }
                    };
                    built.push(Block {
                        name: b.name.clone(),
                        columns: b.columns.clone(),
                        layers,
                    });
                }
                built
            }
        };

        let outputs: HashSet<usize> = blocks
            .iter()
            .filter_map(|b| b.layers.last().map(Layer::no_out))
            .collect();
        if outputs.len() != 1 {
            return Err(BnnError::config(format!(
                "all blocks must produce the same number of outputs, got {outputs:?}"
            )));
        }
        let no_out = outputs.into_iter().next().unwrap_or(1);
        let no_in = blocks.iter().map(|b| b.columns.end).max().unwrap_or(0);

        let noise = if config.heteroscedastic {
            config.noise_prior.validate()?;
            if config.noise_prior.support() != Support::Positive {
                return Err(BnnError::config(format!(
                    "the noise prior must be positive, got {:?}",
                    config.noise_prior
                )));
            }
            Some(ParameterSite::new(NOISE_SITE, vec![1], config.noise_prior)?)
        } else {
            None
        };

        Ok(Self {
            config,
            blocks,
            noise,
            no_in,
            no_out,
        })
    }

    /// Builds the graph and draws every site from its prior.
    pub fn from_prior<R: Rng + ?Sized>(config: ModelConfig, rng: &mut R) -> Result<Self> {
        let mut graph = Self::new(config)?;
        graph.reset(rng)?;
        Ok(graph)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Every layer, blocks in order.
    pub fn layers(&self) -> impl Iterator<Item = &Layer> {
        self.blocks.iter().flat_map(|b| b.layers.iter())
    }

    pub fn noise_site(&self) -> Option<&ParameterSite> {
        self.noise.as_ref()
    }

    /// Width of the design matrix the graph expects.
    pub fn no_in(&self) -> usize {
        self.no_in
    }

    pub fn no_out(&self) -> usize {
        self.no_out
    }

    /// Every site in flattening order.
    pub fn sites(&self) -> impl Iterator<Item = &ParameterSite> {
        self.layers()
            .flat_map(|l| l.sites().iter())
            .chain(self.noise.iter())
    }

    fn sites_mut(&mut self) -> impl Iterator<Item = &mut ParameterSite> {
        self.blocks
            .iter_mut()
            .flat_map(|b| b.layers.iter_mut())
            .flat_map(|l| l.sites_mut().iter_mut())
            .chain(self.noise.iter_mut())
    }

    /// Layout of the current topology.
    pub fn flattener(&self) -> Flattener {
        Flattener::from_sites(self.sites())
    }

    /// Length of the flat vector.
    pub fn dim(&self) -> usize {
        self.sites().map(ParameterSite::len).sum()
    }

    /// Draws every site from its prior, in flattening order.
    pub fn reset<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        for site in self.sites_mut() {
            site.reset(rng)?;
        }
        Ok(())
    }

    /// Current values as one flat vector.
    pub fn to_vec(&self) -> Vec<f64> {
        self.sites().flat_map(|s| s.value().iter().copied()).collect()
    }

    /// Writes a flat vector back into the sites.
    pub fn load_vec(&mut self, vec: &[f64]) -> Result<()> {
        let flattener = self.flattener();
        let parts = flattener.split(vec)?;
        for (site, part) in self.sites_mut().zip(parts) {
            site.set_value(part.to_vec())?;
        }
        Ok(())
    }

    pub fn parameters(&self) -> ParamTree {
        let flattener = self.flattener();
        // `to_vec` always has the layout's length
        flattener.unflatten(&self.to_vec()).unwrap_or_default()
    }

    pub fn set_parameters(&mut self, tree: &ParamTree) -> Result<()> {
        let vec = self.flattener().flatten(tree)?;
        self.load_vec(&vec)
    }

    /// A feed-forward stack reads exactly `no_in` columns. Structured blocks
    /// pick their own column ranges, so wider inputs are fine there.
    fn check_columns(&self, ncols: usize) -> Result<()> {
        let fits = match self.config.architecture {
            Architecture::Sequential { .. } => ncols == self.no_in,
            Architecture::Structured { .. } => ncols >= self.no_in,
        };
        if fits {
            Ok(())
        } else {
            Err(BnnError::config(format!(
                "X has {ncols} columns, the model reads {}",
                self.no_in
            )))
        }
    }

    /// Checks that `x` and `y` fit the graph and each other.
    pub fn check_data(&self, x: &Array2<f64>, y: &Array2<f64>) -> Result<()> {
        if x.nrows() != y.nrows() {
            return Err(BnnError::config(format!(
                "X has {} rows but y has {}",
                x.nrows(),
                y.nrows()
            )));
        }
        self.check_columns(x.ncols())?;
        if y.ncols() != self.no_out {
            return Err(BnnError::config(format!(
                "y has {} columns, the model predicts {}",
                y.ncols(),
                self.no_out
            )));
        }
        Ok(())
    }

    /// Forward pass with one (unconstrained) tensor per site.
    pub fn forward_with<B: Backend>(&self, params: &[Tensor<B, 1>], x: Tensor<B, 2>) -> Tensor<B, 2> {
        let [n, _] = x.dims();
        let mut cursor = 0;
        let mut total: Option<Tensor<B, 2>> = None;
        for block in &self.blocks {
            let mut h = x.clone().slice([0..n, block.columns.clone()]);
            for layer in &block.layers {
                let k = layer.sites().len();
                h = layer.forward_with(&params[cursor..cursor + k], h);
                cursor += k;
            }
            total = Some(match total {
                Some(t) => t + h,
                None => h,
            });
        }
        total.unwrap_or_else(|| Tensor::zeros([n, self.no_out], &x.device()))
    }

    /// Sum of every site's log-density, noise included.
    pub fn prior_log_prob_with<B: Backend>(&self, params: &[Tensor<B, 1>]) -> Tensor<B, 1> {
        self.sites()
            .zip(params)
            .map(|(site, p)| site.log_prob(p.clone()))
            .reduce(|a, b| a + b)
            .unwrap_or_else(|| Tensor::zeros([1], &Default::default()))
    }

    /// Gaussian log-likelihood of `y` around the forward output, sum reduced.
    pub fn log_likelihood_with<B: Backend>(
        &self,
        params: &[Tensor<B, 1>],
        x: Tensor<B, 2>,
        y: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        let numel = y.shape().num_elements() as f64;
        let mu = self.forward_with(params, x);
        let sq = (y - mu).powi_scalar(2).sum();
        match (&self.noise, params.last()) {
            (Some(_), Some(log_sigma)) => {
                // sigma = exp(u): log N(y | mu, sigma) = -r^2 e^{-2u} / 2 - u - ln(2 pi) / 2
                let inv_var = log_sigma.clone().mul_scalar(-2.0).exp();
                (sq * inv_var)
                    .mul_scalar(-0.5)
                    .sub(log_sigma.clone().mul_scalar(numel))
                    .sub_scalar(0.5 * numel * LN_2PI)
            }
            _ => {
                let s = self.config.noise_scale;
                sq.mul_scalar(-0.5 / (s * s))
                    .sub_scalar(numel * (s.ln() + 0.5 * LN_2PI))
            }
        }
    }

    /// `prior + weight * likelihood` of a flat tensor, sum reduced.
    pub fn log_prob_weighted<B: Backend>(
        &self,
        vec: Tensor<B, 1>,
        x: Tensor<B, 2>,
        y: Tensor<B, 2>,
        weight: f64,
    ) -> Result<Tensor<B, 1>> {
        let [nx, px] = x.dims();
        let [ny, q] = y.dims();
        if nx != ny {
            return Err(BnnError::config(format!("X has {nx} rows but y has {ny}")));
        }
        self.check_columns(px)?;
        if q != self.no_out {
            return Err(BnnError::config(format!(
                "y has {q} columns, the model predicts {}",
                self.no_out
            )));
        }
        let params = self.flattener().unflatten_tensor(vec)?;
        let prior = self.prior_log_prob_with(&params);
        if weight == 0.0 {
            return Ok(prior);
        }
        Ok(prior + self.log_likelihood_with(&params, x, y).mul_scalar(weight))
    }

    /// Unnormalised log-posterior of a flat tensor.
    pub fn log_prob<B: Backend>(
        &self,
        vec: Tensor<B, 1>,
        x: Tensor<B, 2>,
        y: Tensor<B, 2>,
    ) -> Result<Tensor<B, 1>> {
        self.log_prob_weighted(vec, x, y, 1.0)
    }

    /// Host evaluation of [`ModelGraph::log_prob`].
    pub fn log_prob_at(&self, vec: &[f64], x: &Array2<f64>, y: &Array2<f64>) -> Result<f64> {
        self.check_data(x, y)?;
        let device = Default::default();
        let lp = self.log_prob::<HostBackend>(
            vec_to_tensor(vec, &device),
            array2_to_tensor(x, &device),
            array2_to_tensor(y, &device),
        )?;
        Ok(scalar(lp))
    }

    /// Log-probability and its exact gradient with respect to `vec`, by
    /// reverse-mode autodiff on `B`.
    pub fn log_prob_and_grad<B: AutodiffBackend>(
        &self,
        vec: &[f64],
        x: &Array2<f64>,
        y: &Array2<f64>,
        weight: f64,
        device: &B::Device,
    ) -> Result<(f64, Vec<f64>)> {
        self.check_data(x, y)?;
        let position = vec_to_tensor::<B>(vec, device).require_grad();
        let logp = self.log_prob_weighted(
            position.clone(),
            array2_to_tensor::<B>(x, device),
            array2_to_tensor::<B>(y, device),
            weight,
        )?;
        let value = scalar(logp.clone());
        let grads = logp.backward();
        let grad = position
            .grad(&grads)
            .map(tensor_to_vec)
            .unwrap_or_else(|| vec![0.0; vec.len()]);
        Ok((value, grad))
    }

    /// Prior log-density of the current values.
    pub fn prior_log_prob(&self) -> f64 {
        self.sites().map(ParameterSite::prior_log_prob).sum()
    }

    /// Prediction on the current values.
    pub fn forward(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if self.check_columns(x.ncols()).is_err() {
            return Err(BnnError::ShapeMismatch {
                name: "X".to_string(),
                expected: vec![x.nrows(), self.no_in],
                actual: vec![x.nrows(), x.ncols()],
            });
        }
        let device = Default::default();
        let params: Vec<Tensor<HostBackend, 1>> = self.sites().map(|s| s.tensor(&device)).collect();
        tensor_to_array2(self.forward_with(&params, array2_to_tensor(x, &device)))
    }

    /// Observation noise standard deviation at the current values.
    pub fn noise_std(&self) -> f64 {
        self.noise
            .as_ref()
            .and_then(|s| s.constrained_value().first().copied())
            .unwrap_or(self.config.noise_scale)
    }

    /// Draws `y ~ N(forward(x), noise_std)` at the current values.
    pub fn simulate<R: Rng + ?Sized>(&self, x: &Array2<f64>, rng: &mut R) -> Result<Array2<f64>> {
        let sigma = self.noise_std();
        let mut y = self.forward(x)?;
        y.mapv_inplace(|mu| mu + sigma * rng.sample::<f64, _>(StandardNormal));
        Ok(y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::LayerKind;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::{rngs::SmallRng, SeedableRng};

    fn bnn(hunits: &[usize]) -> ModelConfig {
        ModelConfig::bnn(hunits, Activation::Relu, Activation::Identity)
    }

    #[test]
    fn test_single_layer_with_bias_has_nine_parameters() {
        let config = ModelConfig::new(Architecture::Sequential {
            layers: vec![LayerConfig::new(2, 3)],
        });
        let mut graph = ModelGraph::new(config).unwrap();
        let flat = graph.flattener();
        assert_eq!(flat.len(), 9);

        graph.load_vec(&[0.0; 9]).unwrap();
        let tree = graph.parameters();
        let w = tree.get("net.0.W").unwrap();
        let b = tree.get("net.0.b").unwrap();
        assert_eq!(w.shape, vec![3, 2]);
        assert_eq!(b.shape, vec![3]);
        assert!(w.values.iter().chain(&b.values).all(|&v| v == 0.0));
    }

    #[test]
    fn test_dimensionality_matches_site_shapes() {
        let horseshoe = ModelConfig::new(Architecture::Sequential {
            layers: vec![
                LayerConfig::new(3, 4)
                    .kind(LayerKind::GroupHorseshoe)
                    .activation(Activation::Tanh),
                LayerConfig::new(4, 1).bias(false),
            ],
        });
        let structured = ModelConfig::structured(vec![
            BlockConfig {
                name: "linear".into(),
                columns: 0..2,
                kind: BlockKind::Network {
                    layers: vec![LayerConfig::new(2, 1).bias(false)],
                },
            },
            BlockConfig {
                name: "smooth".into(),
                columns: 2..8,
                kind: BlockKind::Spline {
                    no_basis: 6,
                    order: 2,
                    tau_prior: default_tau_prior(),
                },
            },
        ])
        .heteroscedastic(true);

        for (config, expected) in [
            (bnn(&[2, 10, 1]), 2 * 10 + 10 + 10),
            (bnn(&[2, 10, 1]).heteroscedastic(true), 41),
            (bnn(&[1, 10, 5, 1]), 10 + 10 + 50 + 5 + 5),
            (horseshoe, 12 + 3 + 1 + 4 + 4),
            (structured, 2 + 6 + 1 + 1),
        ] {
            let graph = ModelGraph::new(config.clone()).unwrap();
            let by_shape: usize = graph
                .sites()
                .map(|s| s.shape().iter().product::<usize>())
                .sum();
            assert_eq!(graph.dim(), expected);
            assert_eq!(graph.flattener().len(), expected);
            assert_eq!(by_shape, expected);
            assert_eq!(config.num_params(), expected);
        }
    }

    #[test]
    fn test_site_names_are_qualified() {
        let graph = ModelGraph::new(bnn(&[2, 3, 1]).heteroscedastic(true)).unwrap();
        let names: Vec<_> = graph.flattener().specs().iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, ["net.0.W", "net.0.b", "net.1.W", "noise.sigma"]);
    }

    #[test]
    fn test_bnn_final_layer_has_no_bias() {
        let graph = ModelGraph::new(bnn(&[2, 10, 5, 1])).unwrap();
        let layers: Vec<_> = graph.layers().collect();
        assert!(layers[0].has_bias() && layers[1].has_bias());
        assert!(!layers[2].has_bias());
        assert_eq!(layers[1].activation(), Activation::Relu);
        assert_eq!(layers[2].activation(), Activation::Identity);
    }

    #[test]
    fn test_prior_is_sum_of_layer_priors() {
        let mut rng = SmallRng::seed_from_u64(5);
        let graph = ModelGraph::from_prior(bnn(&[2, 10, 1]), &mut rng).unwrap();
        let manual: f64 = graph.layers().map(Layer::prior_log_prob).sum();
        assert_abs_diff_eq!(graph.prior_log_prob(), manual, epsilon = 1e-10);

        let device = Default::default();
        let params: Vec<Tensor<HostBackend, 1>> = graph.sites().map(|s| s.tensor(&device)).collect();
        assert_abs_diff_eq!(
            scalar(graph.prior_log_prob_with(&params)),
            manual,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_log_prob_is_prior_plus_gaussian_likelihood() {
        let mut rng = SmallRng::seed_from_u64(6);
        let graph = ModelGraph::from_prior(bnn(&[1, 3, 1]).noise_scale(0.5), &mut rng).unwrap();
        let x = array![[0.1], [-0.4], [1.2]];
        let y = array![[0.3], [0.0], [-1.0]];
        let mu = graph.forward(&x).unwrap();
        let lik: f64 = y
            .iter()
            .zip(mu.iter())
            .map(|(y, m)| {
                let z = (y - m) / 0.5;
                -0.5 * z * z - 0.5f64.ln() - 0.5 * LN_2PI
            })
            .sum();
        let lp = graph.log_prob_at(&graph.to_vec(), &x, &y).unwrap();
        assert_abs_diff_eq!(lp, graph.prior_log_prob() + lik, epsilon = 1e-9);
    }

    #[test]
    fn test_heteroscedastic_likelihood_uses_sigma_site() {
        let mut graph = ModelGraph::new(bnn(&[1, 1]).heteroscedastic(true)).unwrap();
        // W = 0 and sigma = e^0.5
        graph.load_vec(&[0.0, 0.5]).unwrap();
        assert_abs_diff_eq!(graph.noise_std(), 0.5f64.exp(), epsilon = 1e-12);
        let x = array![[1.0], [2.0]];
        let y = array![[1.0], [-2.0]];
        let s = 0.5f64.exp();
        let lik: f64 = [1.0f64, -2.0]
            .iter()
            .map(|v| -0.5 * (v / s).powi(2) - s.ln() - 0.5 * LN_2PI)
            .sum();
        let lp = graph.log_prob_at(&graph.to_vec(), &x, &y).unwrap();
        assert_abs_diff_eq!(lp, graph.prior_log_prob() + lik, epsilon = 1e-9);
    }

    #[test]
    fn test_structured_blocks_are_summed() {
        let config = ModelConfig::structured(vec![
            BlockConfig {
                name: "a".into(),
                columns: 0..1,
                kind: BlockKind::Network {
                    layers: vec![LayerConfig::new(1, 1).bias(false)],
                },
            },
            BlockConfig {
                name: "b".into(),
                columns: 1..2,
                kind: BlockKind::Network {
                    layers: vec![LayerConfig::new(1, 1).bias(false)],
                },
            },
        ]);
        let mut graph = ModelGraph::new(config).unwrap();
        graph.load_vec(&[2.0, -1.0]).unwrap();
        let out = graph.forward(&array![[1.0, 1.0], [3.0, 2.0]]).unwrap();
        assert_eq!(out, array![[1.0], [4.0]]);
    }

    #[test]
    fn test_load_vec_round_trips() {
        let mut rng = SmallRng::seed_from_u64(9);
        let mut graph = ModelGraph::from_prior(bnn(&[2, 4, 1]).heteroscedastic(true), &mut rng).unwrap();
        let vec: Vec<f64> = (0..graph.dim()).map(|i| i as f64 * 0.1).collect();
        graph.load_vec(&vec).unwrap();
        assert_eq!(graph.to_vec(), vec);

        let tree = graph.parameters();
        let mut other = ModelGraph::new(graph.config().clone()).unwrap();
        other.set_parameters(&tree).unwrap();
        assert_eq!(other.to_vec(), vec);

        assert!(matches!(
            graph.load_vec(&vec[1..]),
            Err(BnnError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_configurations_fail_eagerly() {
        let bad = [
            bnn(&[]),
            bnn(&[3]),
            bnn(&[2, 0, 1]),
            ModelConfig::new(Architecture::Sequential {
                layers: vec![LayerConfig::new(2, 3), LayerConfig::new(4, 1)],
            }),
            bnn(&[2, 1]).noise_scale(0.0),
            bnn(&[2, 1])
                .heteroscedastic(true)
                .noise_prior(Prior::standard_normal()),
            ModelConfig::structured(vec![]),
            ModelConfig::structured(vec![BlockConfig {
                name: "s".into(),
                columns: 0..4,
                kind: BlockKind::Spline {
                    no_basis: 5,
                    order: 1,
                    tau_prior: default_tau_prior(),
                },
            }]),
        ];
        for config in bad {
            let err = ModelGraph::new(config.clone()).unwrap_err();
            assert!(
                matches!(err, BnnError::Configuration(_)),
                "{config:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn test_mismatched_data_is_a_configuration_error() {
        let graph = ModelGraph::new(bnn(&[2, 1])).unwrap();
        let x = Array2::zeros((4, 2));
        assert!(graph.check_data(&x, &Array2::zeros((4, 1))).is_ok());
        assert!(matches!(
            graph.check_data(&x, &Array2::zeros((3, 1))),
            Err(BnnError::Configuration(_))
        ));
        assert!(graph.check_data(&Array2::zeros((4, 1)), &Array2::zeros((4, 1))).is_err());
        assert!(graph.check_data(&Array2::zeros((4, 3)), &Array2::zeros((4, 1))).is_err());
        assert!(graph.forward(&Array2::zeros((4, 3))).is_err());
    }

    #[test]
    fn test_structured_blocks_accept_wider_inputs() {
        let config = ModelConfig::structured(vec![BlockConfig {
            name: "a".into(),
            columns: 1..3,
            kind: BlockKind::Network {
                layers: vec![LayerConfig::new(2, 1)],
            },
        }]);
        let graph = ModelGraph::new(config).unwrap();
        let y = Array2::zeros((4, 1));
        assert!(graph.check_data(&Array2::zeros((4, 5)), &y).is_ok());
        assert!(graph.check_data(&Array2::zeros((4, 2)), &y).is_err());
    }

    #[test]
    fn test_gradient_rejects_mismatched_data() {
        let graph = ModelGraph::new(bnn(&[2, 3, 1])).unwrap();
        let vec = graph.to_vec();
        let device = Default::default();
        for (x, y) in [
            (Array2::zeros((20, 1)), Array2::zeros((20, 1))),
            (Array2::zeros((20, 3)), Array2::zeros((20, 1))),
            (Array2::zeros((20, 2)), Array2::zeros((19, 1))),
            (Array2::zeros((20, 2)), Array2::zeros((20, 2))),
        ] {
            let err = graph
                .log_prob_and_grad::<crate::DefaultBackend>(&vec, &x, &y, 1.0, &device)
                .unwrap_err();
            assert!(matches!(err, BnnError::Configuration(_)), "{err:?}");
        }

        let host: <HostBackend as Backend>::Device = Default::default();
        let lp = graph.log_prob::<HostBackend>(
            vec_to_tensor(&vec, &host),
            array2_to_tensor(&Array2::zeros((5, 4)), &host),
            array2_to_tensor(&Array2::zeros((5, 1)), &host),
        );
        assert!(matches!(lp, Err(BnnError::Configuration(_))));
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = bnn(&[2, 10, 1]).heteroscedastic(true);
        let json = serde_json::to_string(&config).unwrap();
        let back: ModelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let minimal: ModelConfig = serde_json::from_str(
            r#"{"architecture": {"type": "sequential", "layers": [{"no_in": 1, "no_out": 2}]}}"#,
        )
        .unwrap();
        assert!(!minimal.heteroscedastic);
        assert_eq!(minimal.noise_scale, 1.0);
        assert_eq!(ModelGraph::new(minimal).unwrap().dim(), 4);
    }
}
