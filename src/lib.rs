/*!
# bnn-mcmc

Bayesian neural networks and structured additive models with explicit priors
on every weight, sampled with gradient-based MCMC.

A model is a [`ModelGraph`]: blocks of layers whose parameters live in named
[`ParameterSite`]s. The [`Flattener`] maps the whole parameter tree to one
flat vector and back; a [`Posterior`] evaluates the log-density of such a
vector and its gradient (reverse-mode autodiff through `burn`) on the data
handed out by a [`DataProvider`]. A [`Sampler`] then drives one of the
kernels (HMC, NUTS, MALA, SGLD, SGNHT) over the posterior and records a
[`Chain`].

## Example

```rust,no_run
use bnn_mcmc::{
    Activation, Dataset, FullData, Kernel, ModelConfig, ModelGraph, Posterior, Sampler,
    SamplerConfig, SamplerKind,
};
use ndarray::Array2;
use rand::{rngs::SmallRng, SeedableRng};

let x = Array2::from_shape_fn((100, 1), |(i, _)| i as f64 / 50.0 - 1.0);
let y = x.mapv(|v| (3.0 * v).sin());

let model = ModelConfig::bnn(&[1, 10, 1], Activation::Tanh, Activation::Identity);
let graph = ModelGraph::from_prior(model, &mut SmallRng::seed_from_u64(0))?;
let posterior: Posterior<_> = Posterior::new(graph, FullData::new(Dataset::new(x, y)?))?;

let config = SamplerConfig::new(SamplerKind::Hmc)
    .step_size(0.01)
    .target_accept(0.8)
    .burn_in(200)
    .num_samples(500);
let kernel = config.kernel()?;
println!("running {}", kernel.name());
let initial = posterior.initial_position();
let mut sampler = Sampler::from_config(posterior, kernel, initial, &config)?;
let chain = sampler.run_progress()?;
println!("acceptance rate: {:.2}", chain.acceptance_rate());
# Ok::<(), bnn_mcmc::BnnError>(())
```
*/

pub mod adapt;
pub mod chain;
pub mod config;
pub mod core;
pub mod data;
pub mod error;
pub mod flatten;
pub mod hmc;
pub mod io;
pub mod langevin;
pub mod layer;
pub mod model;
pub mod nuts;
pub mod prior;
pub mod sampler;
pub mod site;
pub mod stats;
pub mod target;
pub mod tensor;

pub use crate::chain::{Chain, ChainRecord, StepDiagnostics};
pub use crate::config::{DataConfig, ExperimentConfig};
pub use crate::data::{DataProvider, Dataset, FullData, Minibatch};
pub use crate::error::{BnnError, Result};
pub use crate::flatten::{Flattener, NamedTensor, ParamTree, SiteSpec};
pub use crate::layer::{Activation, Layer, LayerConfig, LayerKind};
pub use crate::model::{Architecture, BlockConfig, BlockKind, ModelConfig, ModelGraph};
pub use crate::prior::Prior;
pub use crate::sampler::{AnyKernel, Kernel, Sampler, SamplerConfig, SamplerKind, Stage};
pub use crate::site::{ParameterSite, Transform};
pub use crate::target::{GradientTarget, Posterior};

/// Differentiable backend used by [`Posterior`] unless another one is chosen.
pub type DefaultBackend = burn::backend::Autodiff<burn::backend::NdArray<f64>>;

/// Backend for plain forward evaluation.
pub type HostBackend = burn::backend::NdArray<f64>;
