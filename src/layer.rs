/*!
Layers with explicit priors over their parameters.

Every flavour owns an ordered list of [`ParameterSite`]s and shares one
contract: `reset` draws the sites from their priors, `forward` maps a design
matrix `[n, no_in]` to `[n, no_out]`, and `prior_log_prob` is the plain sum
of the sites' log-densities.

The `*_with` methods take the parameters as tensors instead of the stored
values, so the same code path serves host evaluation and the differentiable
posterior.
*/

use crate::error::{BnnError, Result};
use crate::prior::{Prior, Support};
use crate::site::ParameterSite;
use crate::tensor::{array2_to_tensor, scalar, tensor_to_array2};
use crate::HostBackend;
use burn::tensor::activation::{relu, sigmoid, tanh};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Element-wise nonlinearity applied after the affine map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    Tanh,
    Sigmoid,
    #[default]
    Identity,
}

impl Activation {
    pub fn apply<B: Backend, const D: usize>(self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Relu => relu(x),
            Activation::Tanh => tanh(x),
            Activation::Sigmoid => sigmoid(x),
            Activation::Identity => x,
        }
    }
}

/// Prior structure of a dense layer's weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// Independent `N(0, weight_scale)` weights.
    #[default]
    Hidden,
    /// Non-centred group horseshoe: one local scale per input column and a
    /// global scale, so whole input variables can be shrunk away.
    GroupHorseshoe,
}

fn default_true() -> bool {
    true
}

fn default_weight_scale() -> f64 {
    1.0
}

/// Geometry and prior of one dense layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerConfig {
    pub no_in: usize,
    pub no_out: usize,
    #[serde(default = "default_true")]
    pub bias: bool,
    #[serde(default)]
    pub activation: Activation,
    #[serde(default)]
    pub kind: LayerKind,
    /// Standard deviation of the weight prior of [`LayerKind::Hidden`].
    #[serde(default = "default_weight_scale")]
    pub weight_scale: f64,
}

impl LayerConfig {
    /// A `Hidden` layer with bias, identity activation and unit weight prior.
    pub fn new(no_in: usize, no_out: usize) -> Self {
        Self {
            no_in,
            no_out,
            bias: true,
            activation: Activation::Identity,
            kind: LayerKind::Hidden,
            weight_scale: 1.0,
        }
    }

    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn kind(mut self, kind: LayerKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn weight_scale(mut self, weight_scale: f64) -> Self {
        self.weight_scale = weight_scale;
        self
    }

    /// Number of scalars this layer contributes to the flat vector.
    pub fn num_params(&self) -> usize {
        let (i, o) = (self.no_in, self.no_out);
        let bias = if self.bias { o } else { 0 };
        match self.kind {
            LayerKind::Hidden => o * i + bias,
            LayerKind::GroupHorseshoe => o * i + i + 1 + bias,
        }
    }
}

/// Which sites a layer owns and how they enter the forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavour {
    Hidden,
    GroupHorseshoe,
    /// Random-walk smoothing prior of the given order on a basis design.
    Spline { order: usize },
}

/// A layer: an ordered set of parameter sites plus a forward transform.
///
/// Site order is `W, b?` for `Hidden`, `W, lambda, tau, b?` for
/// `GroupHorseshoe` and `z, tau` for `Spline`.
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    flavour: Flavour,
    no_in: usize,
    no_out: usize,
    bias: bool,
    activation: Activation,
    sites: Vec<ParameterSite>,
}

impl Layer {
    /// Builds a dense layer whose site names are prefixed with `prefix`.
    pub fn dense(prefix: &str, config: &LayerConfig) -> Result<Self> {
        let (i, o) = (config.no_in, config.no_out);
        if i == 0 || o == 0 {
            return Err(BnnError::config(format!(
                "layer `{prefix}` needs positive dimensions, got no_in = {i}, no_out = {o}"
            )));
        }
        let mut sites = Vec::with_capacity(4);
        let flavour = match config.kind {
            LayerKind::Hidden => {
                let prior = Prior::Normal {
                    loc: 0.0,
                    scale: config.weight_scale,
                };
                sites.push(ParameterSite::new(format!("{prefix}.W"), vec![o, i], prior)?);
                Flavour::Hidden
            }
            LayerKind::GroupHorseshoe => {
                let half_cauchy = Prior::HalfCauchy { scale: 1.0 };
                sites.push(ParameterSite::new(
                    format!("{prefix}.W"),
                    vec![o, i],
                    Prior::standard_normal(),
                )?);
                sites.push(ParameterSite::new(
                    format!("{prefix}.lambda"),
                    vec![i],
                    half_cauchy,
                )?);
                sites.push(ParameterSite::new(
                    format!("{prefix}.tau"),
                    vec![1],
                    half_cauchy,
                )?);
                Flavour::GroupHorseshoe
            }
        };
        if config.bias {
            sites.push(ParameterSite::new(
                format!("{prefix}.b"),
                vec![o],
                Prior::standard_normal(),
            )?);
        }
        Ok(Self {
            flavour,
            no_in: i,
            no_out: o,
            bias: config.bias,
            activation: config.activation,
            sites,
        })
    }

    /// Builds a smoothing-spline effect on a `no_basis` column basis design.
    pub fn spline(prefix: &str, no_basis: usize, order: usize, tau_prior: Prior) -> Result<Self> {
        if no_basis == 0 {
            return Err(BnnError::config(format!(
                "spline `{prefix}` needs at least one basis function"
            )));
        }
        if !(1..=2).contains(&order) {
            return Err(BnnError::config(format!(
                "spline `{prefix}`: random walk order must be 1 or 2, got {order}"
            )));
        }
        if tau_prior.support() != Support::Positive {
            return Err(BnnError::config(format!(
                "spline `{prefix}`: the variance prior must be positive, got {tau_prior:?}"
            )));
        }
        let sites = vec![
            ParameterSite::new(
                format!("{prefix}.z"),
                vec![no_basis],
                Prior::standard_normal(),
            )?,
            ParameterSite::new(format!("{prefix}.tau"), vec![1], tau_prior)?,
        ];
        Ok(Self {
            flavour: Flavour::Spline { order },
            no_in: no_basis,
            no_out: 1,
            bias: false,
            activation: Activation::Identity,
            sites,
        })
    }

    pub fn flavour(&self) -> Flavour {
        self.flavour
    }

    pub fn no_in(&self) -> usize {
        self.no_in
    }

    pub fn no_out(&self) -> usize {
        self.no_out
    }

    pub fn has_bias(&self) -> bool {
        self.bias
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn sites(&self) -> &[ParameterSite] {
        &self.sites
    }

    pub(crate) fn sites_mut(&mut self) -> &mut [ParameterSite] {
        &mut self.sites
    }

    pub fn num_params(&self) -> usize {
        self.sites.iter().map(ParameterSite::len).sum()
    }

    /// Draws every site from its prior.
    pub fn reset<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        for site in &mut self.sites {
            site.reset(rng)?;
        }
        Ok(())
    }

    /// Current site values as flat tensors, in site order.
    pub fn site_tensors<B: Backend>(&self, device: &B::Device) -> Vec<Tensor<B, 1>> {
        self.sites.iter().map(|s| s.tensor::<B>(device)).collect()
    }

    /// Forward pass with explicit (unconstrained) parameters, one tensor per site.
    pub fn forward_with<B: Backend>(
        &self,
        params: &[Tensor<B, 1>],
        input: Tensor<B, 2>,
    ) -> Tensor<B, 2> {
        let [n, _] = input.dims();
        let (i, o) = (self.no_in, self.no_out);
        let out = match self.flavour {
            Flavour::Hidden => {
                let w = params[0].clone().reshape([o, i]);
                input.matmul(w.transpose())
            }
            Flavour::GroupHorseshoe => {
                let lambda = self.sites[1]
                    .constrain(params[1].clone())
                    .reshape([1, i])
                    .expand([o, i]);
                let tau = self.sites[2]
                    .constrain(params[2].clone())
                    .reshape([1, 1])
                    .expand([o, i]);
                let w = params[0].clone().reshape([o, i]) * lambda * tau;
                input.matmul(w.transpose())
            }
            Flavour::Spline { order } => {
                let gamma = self.spline_coefficients(&params[0], &params[1], order);
                input.matmul(gamma)
            }
        };
        // the bias is always the last site
        let out = match params.last() {
            Some(b) if self.bias => out + b.clone().reshape([1, o]).expand([n, o]),
            _ => out,
        };
        self.activation.apply(out)
    }

    /// `sqrt(tau) * C^order z` as a `[no_basis, 1]` column, with `C` the
    /// lower-triangular cumulative-sum matrix.
    fn spline_coefficients<B: Backend>(
        &self,
        z: &Tensor<B, 1>,
        tau: &Tensor<B, 1>,
        order: usize,
    ) -> Tensor<B, 2> {
        let k = self.no_in;
        let device = z.device();
        let cumsum: Vec<f64> = (0..k)
            .flat_map(|r| (0..k).map(move |c| if c <= r { 1.0 } else { 0.0 }))
            .collect();
        let cumsum = Tensor::<B, 2>::from_data(TensorData::new(cumsum, [k, k]), &device);
        let mut walk = z.clone().reshape([k, 1]);
        for _ in 0..order {
            walk = cumsum.clone().matmul(walk);
        }
        let scale = self.sites[1]
            .constrain(tau.clone())
            .sqrt()
            .reshape([1, 1])
            .expand([k, 1]);
        walk * scale
    }

    /// Sum-reduced prior log-density of explicit (unconstrained) parameters.
    pub fn prior_log_prob_with<B: Backend>(&self, params: &[Tensor<B, 1>]) -> Tensor<B, 1> {
        self.sites
            .iter()
            .zip(params)
            .map(|(site, p)| site.log_prob(p.clone()))
            .reduce(|a, b| a + b)
            .unwrap_or_else(|| Tensor::zeros([1], &Default::default()))
    }

    /// Forward pass on the current site values.
    pub fn forward(&self, input: &Array2<f64>) -> Result<Array2<f64>> {
        if input.ncols() != self.no_in {
            return Err(BnnError::ShapeMismatch {
                name: "input".to_string(),
                expected: vec![input.nrows(), self.no_in],
                actual: vec![input.nrows(), input.ncols()],
            });
        }
        let device = Default::default();
        let x = array2_to_tensor::<HostBackend>(input, &device);
        tensor_to_array2(self.forward_with(&self.site_tensors(&device), x))
    }

    /// Prior log-density of the current site values.
    pub fn prior_log_prob(&self) -> f64 {
        self.sites.iter().map(ParameterSite::prior_log_prob).sum()
    }

    /// Same as [`Layer::prior_log_prob`], evaluated through the tensor path.
    pub fn prior_log_prob_tensor(&self) -> f64 {
        let device = Default::default();
        scalar(self.prior_log_prob_with::<HostBackend>(&self.site_tensors(&device)))
    }
}
