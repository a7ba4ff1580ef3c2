/*!
The gradient-based MCMC state machine.

A [`Sampler`] owns a [`GradientTarget`], a transition [`Kernel`] and the
[`Chain`] it appends to. It moves through
`Initialized -> WarmingUp -> Sampling -> Finished`: the first `burn_in`
iterations feed the kernel's step-size adaptation, the following
`num_samples` iterations are the draws. Every iteration, warm-up included,
appends exactly one position and one [`StepDiagnostics`] record.

Divergent trajectories are rejected and flagged on the chain, never raised.
A non-finite log-probability or gradient at the starting point is an error
from [`Sampler::new`].
*/

use crate::chain::{Chain, StepDiagnostics};
use crate::error::{BnnError, Result};
use crate::hmc::Hmc;
use crate::langevin::{Mala, Sgld, Sgnht};
use crate::nuts::Nuts;
use crate::target::GradientTarget;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use ndarray::Array1;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Energy error above which a trajectory is declared divergent.
pub const DIVERGENCE_THRESHOLD: f64 = 1000.0;

/// Post-warm-up divergence rate above which a warning is logged.
const DIVERGENCE_WARN_RATE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Initialized,
    WarmingUp,
    Sampling,
    Finished,
}

/// A position together with its log-probability and gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct PhasePoint {
    pub position: Array1<f64>,
    pub log_prob: f64,
    pub grad: Array1<f64>,
}

impl PhasePoint {
    /// Evaluates `target` at `position`.
    pub fn new<G: GradientTarget + ?Sized>(target: &G, position: Array1<f64>) -> Result<Self> {
        let mut grad = Array1::zeros(position.len());
        let log_prob = target.logp_and_grad(&position, &mut grad)?;
        Ok(Self {
            position,
            log_prob,
            grad,
        })
    }

    pub fn is_finite(&self) -> bool {
        self.log_prob.is_finite()
            && self.grad.iter().all(|g| g.is_finite())
            && self.position.iter().all(|q| q.is_finite())
    }
}

/// Outcome of one kernel transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    /// Acceptance statistic: Metropolis probability, NUTS mean tree
    /// acceptance, or 1 for kernels without a correction step.
    pub accept_prob: f64,
    pub accepted: bool,
    pub divergent: bool,
    /// Gradient evaluations spent on the transition.
    pub n_leapfrog: usize,
}

impl Transition {
    pub(crate) fn divergent(n_leapfrog: usize) -> Self {
        Self {
            accept_prob: 0.0,
            accepted: false,
            divergent: true,
            n_leapfrog,
        }
    }
}

/// One MCMC update rule over a [`PhasePoint`].
pub trait Kernel: Send {
    fn name(&self) -> &'static str;

    /// Step size the next transition will use.
    fn step_size(&self) -> f64;

    /// Called once with the starting point, before the first transition.
    fn initialize<G: GradientTarget + ?Sized>(
        &mut self,
        _target: &G,
        _point: &PhasePoint,
        _rng: &mut SmallRng,
    ) -> Result<()> {
        Ok(())
    }

    /// Moves `point` (or leaves it unchanged on rejection).
    fn transition<G: GradientTarget + ?Sized>(
        &mut self,
        target: &G,
        point: &mut PhasePoint,
        rng: &mut SmallRng,
    ) -> Result<Transition>;

    /// Feedback after each warm-up transition.
    fn adapt(&mut self, _transition: &Transition) {}

    /// Called once after the last warm-up transition.
    fn end_warmup(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    #[default]
    Hmc,
    Nuts,
    Mala,
    Sgld,
    Sgnht,
}

impl SamplerKind {
    /// Kernels without an accept step, which tolerate a noisy potential.
    pub fn is_stochastic_gradient(self) -> bool {
        matches!(self, SamplerKind::Sgld | SamplerKind::Sgnht)
    }
}

fn default_step_size() -> f64 {
    0.01
}
fn default_num_steps() -> usize {
    5
}
fn default_num_samples() -> usize {
    1000
}
fn default_num_chains() -> usize {
    1
}
fn default_max_tree_depth() -> usize {
    10
}
fn default_diffusion() -> f64 {
    1.0
}

/// Sampler hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    #[serde(default)]
    pub kind: SamplerKind,
    #[serde(default = "default_step_size")]
    pub step_size: f64,
    /// Leapfrog steps per HMC trajectory.
    #[serde(default = "default_num_steps")]
    pub num_steps: usize,
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,
    #[serde(default)]
    pub burn_in: usize,
    #[serde(default = "default_num_chains")]
    pub num_chains: usize,
    #[serde(default)]
    pub seed: u64,
    /// Dual-averaging target during warm-up; `None` keeps `step_size` fixed.
    #[serde(default)]
    pub target_accept: Option<f64>,
    #[serde(default = "default_max_tree_depth")]
    pub max_tree_depth: usize,
    /// SGNHT diffusion constant `A`.
    #[serde(default = "default_diffusion")]
    pub diffusion: f64,
    /// Minibatch size for the stochastic-gradient kernels; `None` uses all rows.
    /// Rejected for the Metropolis-corrected kinds.
    #[serde(default)]
    pub batch_size: Option<usize>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            kind: SamplerKind::default(),
            step_size: default_step_size(),
            num_steps: default_num_steps(),
            num_samples: default_num_samples(),
            burn_in: 0,
            num_chains: default_num_chains(),
            seed: 0,
            target_accept: None,
            max_tree_depth: default_max_tree_depth(),
            diffusion: default_diffusion(),
            batch_size: None,
        }
    }
}

impl SamplerConfig {
    pub fn new(kind: SamplerKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    pub fn step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn num_steps(mut self, num_steps: usize) -> Self {
        self.num_steps = num_steps;
        self
    }

    pub fn num_samples(mut self, num_samples: usize) -> Self {
        self.num_samples = num_samples;
        self
    }

    pub fn burn_in(mut self, burn_in: usize) -> Self {
        self.burn_in = burn_in;
        self
    }

    pub fn num_chains(mut self, num_chains: usize) -> Self {
        self.num_chains = num_chains;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn target_accept(mut self, target_accept: f64) -> Self {
        self.target_accept = Some(target_accept);
        self
    }

    pub fn max_tree_depth(mut self, max_tree_depth: usize) -> Self {
        self.max_tree_depth = max_tree_depth;
        self
    }

    pub fn diffusion(mut self, diffusion: f64) -> Self {
        self.diffusion = diffusion;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Total number of iterations, warm-up included.
    pub fn num_iterations(&self) -> usize {
        self.burn_in + self.num_samples
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(BnnError::config(format!("{name} must be finite and positive, got {v}")))
            }
        };
        positive("step_size", self.step_size)?;
        positive("diffusion", self.diffusion)?;
        if self.num_steps == 0 {
            return Err(BnnError::config("num_steps must be at least 1"));
        }
        if self.num_samples == 0 {
            return Err(BnnError::config("num_samples must be at least 1"));
        }
        if self.num_chains == 0 {
            return Err(BnnError::config("num_chains must be at least 1"));
        }
        if !(1..=20).contains(&self.max_tree_depth) {
            return Err(BnnError::config(format!(
                "max_tree_depth must be in 1..=20, got {}",
                self.max_tree_depth
            )));
        }
        if let Some(t) = self.target_accept {
            if !(t > 0.0 && t < 1.0) {
                return Err(BnnError::config(format!(
                    "target_accept must lie in (0, 1), got {t}"
                )));
            }
        }
        if let Some(size) = self.batch_size {
            if size == 0 {
                return Err(BnnError::config("batch_size must be at least 1"));
            }
            if !self.kind.is_stochastic_gradient() {
                return Err(BnnError::config(format!(
                    "batch_size needs a stochastic-gradient kernel, {:?} has an accept step",
                    self.kind
                )));
            }
        }
        Ok(())
    }

    /// Builds the configured kernel.
    pub fn kernel(&self) -> Result<AnyKernel> {
        self.validate()?;
        let eps = self.step_size;
        Ok(match self.kind {
            SamplerKind::Hmc => {
                let hmc = Hmc::new(eps, self.num_steps)?;
                AnyKernel::Hmc(match self.target_accept {
                    Some(t) => hmc.with_adaptation(t),
                    None => hmc,
                })
            }
            SamplerKind::Nuts => AnyKernel::Nuts(
                Nuts::new(eps, self.max_tree_depth)?
                    .with_adaptation(self.target_accept.unwrap_or(0.8)),
            ),
            SamplerKind::Mala => {
                let mala = Mala::new(eps)?;
                AnyKernel::Mala(match self.target_accept {
                    Some(t) => mala.with_adaptation(t),
                    None => mala,
                })
            }
            SamplerKind::Sgld => AnyKernel::Sgld(Sgld::new(eps)?),
            SamplerKind::Sgnht => AnyKernel::Sgnht(Sgnht::new(eps, self.diffusion)?),
        })
    }
}

/// Any of the crate's kernels, selected at runtime from a [`SamplerConfig`].
#[derive(Debug, Clone)]
pub enum AnyKernel {
    Hmc(Hmc),
    Nuts(Nuts),
    Mala(Mala),
    Sgld(Sgld),
    Sgnht(Sgnht),
}

macro_rules! dispatch {
    ($self:ident, $k:ident => $body:expr) => {
        match $self {
            AnyKernel::Hmc($k) => $body,
            AnyKernel::Nuts($k) => $body,
            AnyKernel::Mala($k) => $body,
            AnyKernel::Sgld($k) => $body,
            AnyKernel::Sgnht($k) => $body,
        }
    };
}

impl Kernel for AnyKernel {
    fn name(&self) -> &'static str {
        dispatch!(self, k => k.name())
    }

    fn step_size(&self) -> f64 {
        dispatch!(self, k => k.step_size())
    }

    fn initialize<G: GradientTarget + ?Sized>(
        &mut self,
        target: &G,
        point: &PhasePoint,
        rng: &mut SmallRng,
    ) -> Result<()> {
        dispatch!(self, k => k.initialize(target, point, rng))
    }

    fn transition<G: GradientTarget + ?Sized>(
        &mut self,
        target: &G,
        point: &mut PhasePoint,
        rng: &mut SmallRng,
    ) -> Result<Transition> {
        dispatch!(self, k => k.transition(target, point, rng))
    }

    fn adapt(&mut self, transition: &Transition) {
        dispatch!(self, k => k.adapt(transition))
    }

    fn end_warmup(&mut self) {
        dispatch!(self, k => k.end_warmup())
    }
}

/// Drives one chain of a kernel over a target.
pub struct Sampler<G: GradientTarget, K: Kernel> {
    target: G,
    kernel: K,
    point: PhasePoint,
    rng: SmallRng,
    burn_in: usize,
    num_samples: usize,
    iteration: usize,
    stage: Stage,
    chain: Chain,
}

impl<G: GradientTarget, K: Kernel> Sampler<G, K> {
    /// Evaluates the target at `initial` and prepares the kernel.
    ///
    /// # Parameters
    ///
    /// * `target`: The log-density to sample.
    /// * `kernel`: The transition kernel, initialized here at `initial`.
    /// * `initial`: The starting position, of length `target.dim()`.
    /// * `burn_in`: The number of warm-up iterations, recorded and flagged.
    /// * `num_samples`: The number of iterations after warm-up.
    /// * `seed`: A seed for the sampler's random number generator.
    ///
    /// # Errors
    ///
    /// * [`BnnError::LengthMismatch`] if `initial` does not have `target.dim()` entries.
    /// * [`BnnError::Configuration`] if `num_samples` is zero.
    /// * [`BnnError::NonFiniteInitialState`] if the log-probability or gradient at
    ///   `initial` is NaN or infinite.
    pub fn new(
        target: G,
        mut kernel: K,
        initial: Array1<f64>,
        burn_in: usize,
        num_samples: usize,
        seed: u64,
    ) -> Result<Self> {
        if initial.len() != target.dim() {
            return Err(BnnError::LengthMismatch {
                expected: target.dim(),
                actual: initial.len(),
            });
        }
        if num_samples == 0 {
            return Err(BnnError::config("num_samples must be at least 1"));
        }
        let point = PhasePoint::new(&target, initial)?;
        if !point.is_finite() {
            return Err(BnnError::NonFiniteInitialState {
                log_prob: point.log_prob,
                non_finite_grad: point.grad.iter().filter(|g| !g.is_finite()).count(),
            });
        }
        let mut rng = SmallRng::seed_from_u64(seed);
        kernel.initialize(&target, &point, &mut rng)?;
        let chain = Chain::new(target.dim());
        Ok(Self {
            target,
            kernel,
            point,
            rng,
            burn_in,
            num_samples,
            iteration: 0,
            stage: Stage::Initialized,
            chain,
        })
    }

    /// Same as [`Sampler::new`], with the iteration budget and seed taken from `config`.
    pub fn from_config(
        target: G,
        kernel: K,
        initial: Array1<f64>,
        config: &SamplerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Self::new(
            target,
            kernel,
            initial,
            config.burn_in,
            config.num_samples,
            config.seed,
        )
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Number of completed iterations.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn num_iterations(&self) -> usize {
        self.burn_in + self.num_samples
    }

    pub fn point(&self) -> &PhasePoint {
        &self.point
    }

    pub fn target(&self) -> &G {
        &self.target
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn into_chain(self) -> Chain {
        self.chain
    }

    /// Runs one iteration and appends it to the chain.
    pub fn step(&mut self) -> Result<&StepDiagnostics> {
        if self.stage == Stage::Finished {
            return Err(BnnError::SamplerFinished(self.num_iterations()));
        }
        let warmup = self.iteration < self.burn_in;
        self.stage = if warmup {
            Stage::WarmingUp
        } else {
            Stage::Sampling
        };

        let step_size = self.kernel.step_size();
        let transition = self
            .kernel
            .transition(&self.target, &mut self.point, &mut self.rng)?;
        if warmup {
            self.kernel.adapt(&transition);
        }

        self.chain.push(
            &self.point.position,
            StepDiagnostics {
                iteration: self.iteration,
                log_prob: self.point.log_prob,
                accept_prob: transition.accept_prob,
                accepted: transition.accepted,
                divergent: transition.divergent,
                step_size,
                n_leapfrog: transition.n_leapfrog,
                warmup,
            },
        );
        self.iteration += 1;

        if warmup && self.iteration == self.burn_in {
            self.kernel.end_warmup();
            debug!(
                "{}: warm-up done after {} iterations, step size {:.3e}",
                self.kernel.name(),
                self.burn_in,
                self.kernel.step_size()
            );
        }
        if self.iteration == self.num_iterations() {
            self.stage = Stage::Finished;
            self.report();
        }
        self.chain.last().ok_or(BnnError::SamplerFinished(self.iteration))
    }

    fn report(&self) {
        let divergences = self.chain.num_divergent();
        let rate = divergences as f64 / self.num_samples as f64;
        if rate > DIVERGENCE_WARN_RATE {
            warn!(
                "{}: {divergences} of {} draws diverged; consider a smaller step size or a reparameterisation",
                self.kernel.name(),
                self.num_samples
            );
        }
    }

    /// Runs the remaining iterations.
    ///
    /// # Returns
    ///
    /// The chain, one entry per iteration with warm-up included.
    pub fn run(&mut self) -> Result<&Chain> {
        while self.stage != Stage::Finished {
            self.step()?;
        }
        Ok(&self.chain)
    }

    /// Like [`Sampler::run`], with a progress bar showing the acceptance rate
    /// over a sliding window of 100 iterations and the number of divergences.
    pub fn run_progress(&mut self) -> Result<&Chain> {
        let remaining = self.num_iterations() - self.iteration;
        let pb = ProgressBar::new(remaining as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}")
                .map_err(|e| BnnError::config(e.to_string()))?
                .progress_chars("=>-"),
        );
        pb.set_prefix(self.kernel.name().to_uppercase());

        let window_size = 100;
        let mut accept_window: VecDeque<f64> = VecDeque::with_capacity(window_size);
        let mut divergences = 0usize;

        while self.stage != Stage::Finished {
            let (accepted, divergent, warmup) = {
                let diag = self.step()?;
                (diag.accepted, diag.divergent, diag.warmup)
            };
            accept_window.push_front(if accepted { 1.0 } else { 0.0 });
            if accept_window.len() > window_size {
                accept_window.pop_back();
            }
            divergences += usize::from(divergent);
            let p_accept = accept_window.iter().sum::<f64>() / accept_window.len() as f64;
            pb.inc(1);
            pb.set_message(format!(
                "{}p(accept)≈{p_accept:.2} eps={:.2e} divergent={divergences}",
                if warmup { "warmup " } else { "" },
                self.kernel.step_size()
            ));
        }
        pb.finish_with_message("Done!");
        Ok(&self.chain)
    }
}
