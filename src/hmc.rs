//! Hamiltonian Monte Carlo with a fixed number of leapfrog steps.
//!
//! Each transition draws a fresh standard-normal momentum, integrates
//! Hamiltonian dynamics with the leapfrog scheme and accepts the end point
//! with the Metropolis probability `min(1, exp(H_0 - H_L))`. A trajectory whose
//! energy error exceeds [`DIVERGENCE_THRESHOLD`] or that produces a non-finite
//! value is aborted, rejected and reported as divergent.

use crate::adapt::DualAveraging;
use crate::error::{BnnError, Result};
use crate::sampler::{Kernel, PhasePoint, Transition, DIVERGENCE_THRESHOLD};
use crate::target::GradientTarget;
use ndarray::Array1;
use rand::rngs::SmallRng;
use rand::Rng;
use rand_distr::StandardNormal;

/// `0.5 * p·p` for an identity mass matrix.
pub fn kinetic_energy(momentum: &Array1<f64>) -> f64 {
    0.5 * momentum.dot(momentum)
}

/// Total energy `-log p(q) + 0.5 * p·p`.
pub fn hamiltonian(point: &PhasePoint, momentum: &Array1<f64>) -> f64 {
    -point.log_prob + kinetic_energy(momentum)
}

pub(crate) fn sample_momentum(dim: usize, rng: &mut SmallRng) -> Array1<f64> {
    Array1::from_shape_simple_fn(dim, || rng.sample(StandardNormal))
}

/// One leapfrog step: half-step momentum, full-step position, half-step momentum.
///
/// A negative `step_size` integrates backwards in time.
///
/// # Parameters
///
/// * `target`: The log-density whose gradient drives the momentum.
/// * `point`: The current position with its cached log-probability and gradient.
/// * `momentum`: The momentum at `point`.
/// * `step_size`: The integration step.
///
/// # Returns
///
/// The new phase point (evaluated on `target`) and the new momentum.
pub fn leapfrog<G: GradientTarget + ?Sized>(
    target: &G,
    point: &PhasePoint,
    momentum: &Array1<f64>,
    step_size: f64,
) -> Result<(PhasePoint, Array1<f64>)> {
    let half = 0.5 * step_size;
    let p_half = momentum + &(&point.grad * half);
    let q = &point.position + &(&p_half * step_size);
    let next = PhasePoint::new(target, q)?;
    let p = p_half + &(&next.grad * half);
    Ok((next, p))
}

/// Fixed-length HMC with optional dual-averaging step-size adaptation.
#[derive(Debug, Clone)]
pub struct Hmc {
    step_size: f64,
    num_steps: usize,
    adaptation: Option<DualAveraging>,
}

impl Hmc {
    /// Create a fixed-length HMC kernel.
    ///
    /// # Parameters
    ///
    /// * `step_size`: The leapfrog step size. Also the starting point of the
    ///   adaptation when [`Hmc::with_adaptation`] is used.
    /// * `num_steps`: The number of leapfrog steps per trajectory.
    ///
    /// # Returns
    ///
    /// A new `Hmc` without step-size adaptation, or
    /// [`BnnError::Configuration`] if `step_size` is not finite and positive or
    /// `num_steps` is zero.
    pub fn new(step_size: f64, num_steps: usize) -> Result<Self> {
        if !(step_size.is_finite() && step_size > 0.0) {
            return Err(BnnError::config(format!(
                "step_size must be finite and positive, got {step_size}"
            )));
        }
        if num_steps == 0 {
            return Err(BnnError::config("num_steps must be at least 1"));
        }
        Ok(Self {
            step_size,
            num_steps,
            adaptation: None,
        })
    }

    /// Adapts the step size towards `target_accept` during warm-up.
    pub fn with_adaptation(mut self, target_accept: f64) -> Self {
        self.adaptation = Some(DualAveraging::new(self.step_size, target_accept));
        self
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }
}

impl Kernel for Hmc {
    fn name(&self) -> &'static str {
        "hmc"
    }

    fn step_size(&self) -> f64 {
        self.step_size
    }

    fn transition<G: GradientTarget + ?Sized>(
        &mut self,
        target: &G,
        point: &mut PhasePoint,
        rng: &mut SmallRng,
    ) -> Result<Transition> {
        let mut momentum = sample_momentum(point.position.len(), rng);
        let h0 = hamiltonian(point, &momentum);

        let mut current = point.clone();
        for step in 0..self.num_steps {
            let (next, p) = leapfrog(target, &current, &momentum, self.step_size)?;
            current = next;
            momentum = p;
            let h = hamiltonian(&current, &momentum);
            if !h.is_finite() || !current.is_finite() || h - h0 > DIVERGENCE_THRESHOLD {
                return Ok(Transition::divergent(step + 1));
            }
        }

        let h1 = hamiltonian(&current, &momentum);
        let accept_prob = (h0 - h1).exp().min(1.0);
        let accepted = rng.gen::<f64>() < accept_prob;
        if accepted {
            *point = current;
        }
        Ok(Transition {
            accept_prob,
            accepted,
            divergent: false,
            n_leapfrog: self.num_steps,
        })
    }

    fn adapt(&mut self, transition: &Transition) {
        if let Some(da) = self.adaptation.as_mut() {
            self.step_size = da.update(transition.accept_prob);
        }
    }

    fn end_warmup(&mut self) {
        if let Some(da) = self.adaptation.take() {
            self.step_size = da.final_step_size();
        }
    }
}
