/*!
Langevin-type kernels.

* [`Mala`]: one Langevin step as a proposal, corrected by Metropolis–Hastings.
* [`Sgld`]: stochastic gradient Langevin dynamics,
  `q <- q + eps/2 * grad + N(0, eps)`, no correction step.
* [`Sgnht`]: stochastic gradient Nosé–Hoover thermostat. A momentum and a
  scalar friction `xi` are carried between iterations; the thermostat drives
  the kinetic temperature to its target so the injected noise is balanced
  even when the gradient is noisy.

With a [`Minibatch`](crate::data::Minibatch) provider every gradient is
computed on a fresh batch, which is what makes the last two "stochastic".
*/

use crate::adapt::DualAveraging;
use crate::error::{BnnError, Result};
use crate::hmc::sample_momentum;
use crate::sampler::{Kernel, PhasePoint, Transition, DIVERGENCE_THRESHOLD};
use crate::target::GradientTarget;
use ndarray::Array1;
use rand::rngs::SmallRng;
use rand::Rng;

fn check_step_size(step_size: f64) -> Result<()> {
    if step_size.is_finite() && step_size > 0.0 {
        Ok(())
    } else {
        Err(BnnError::config(format!(
            "step_size must be finite and positive, got {step_size}"
        )))
    }
}

/// `q + eps/2 * grad(q)`, the mean of the Langevin proposal from `point`.
fn drift(point: &PhasePoint, step_size: f64) -> Array1<f64> {
    &point.position + &(&point.grad * (0.5 * step_size))
}

/// Metropolis-adjusted Langevin algorithm.
#[derive(Debug, Clone)]
pub struct Mala {
    step_size: f64,
    adaptation: Option<DualAveraging>,
}

impl Mala {
    /// Create a MALA kernel.
    ///
    /// # Parameters
    ///
    /// * `step_size`: The Langevin step `eps`; proposals are
    ///   `q + eps / 2 * grad + N(0, eps I)`.
    ///
    /// # Returns
    ///
    /// A new `Mala` without adaptation, or [`BnnError::Configuration`] if
    /// `step_size` is not finite and positive.
    pub fn new(step_size: f64) -> Result<Self> {
        check_step_size(step_size)?;
        Ok(Self {
            step_size,
            adaptation: None,
        })
    }

    /// Adapts the step size towards `target_accept` during warm-up
    /// (0.574 is optimal for high-dimensional targets).
    pub fn with_adaptation(mut self, target_accept: f64) -> Self {
        self.adaptation = Some(DualAveraging::new(self.step_size, target_accept));
        self
    }

    /// `log q(to | from)` up to a constant shared by both directions.
    fn log_proposal(&self, to: &PhasePoint, from: &PhasePoint) -> f64 {
        let diff = &to.position - &drift(from, self.step_size);
        -diff.dot(&diff) / (2.0 * self.step_size)
    }
}

impl Kernel for Mala {
    fn name(&self) -> &'static str {
        "mala"
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
        let noise = sample_momentum(point.position.len(), rng) * self.step_size.sqrt();
        let proposal = PhasePoint::new(target, drift(point, self.step_size) + noise)?;
        if !proposal.is_finite() {
            return Ok(Transition::divergent(1));
        }

        let log_ratio = proposal.log_prob - point.log_prob + self.log_proposal(point, &proposal)
            - self.log_proposal(&proposal, point);
        if log_ratio.is_nan() || -log_ratio > DIVERGENCE_THRESHOLD {
            return Ok(Transition::divergent(1));
        }
        let accept_prob = log_ratio.exp().min(1.0);
        let accepted = rng.gen::<f64>() < accept_prob;
        if accepted {
            *point = proposal;
        }
        Ok(Transition {
            accept_prob,
            accepted,
            divergent: false,
            n_leapfrog: 1,
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

/// Stochastic gradient Langevin dynamics with a constant step size.
#[derive(Debug, Clone)]
pub struct Sgld {
    step_size: f64,
}

impl Sgld {
    /// Create an SGLD kernel. There is no accept step, so `step_size` alone
    /// controls the discretisation bias.
    pub fn new(step_size: f64) -> Result<Self> {
        check_step_size(step_size)?;
        Ok(Self { step_size })
    }
}

impl Kernel for Sgld {
    fn name(&self) -> &'static str {
        "sgld"
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
        let noise = sample_momentum(point.position.len(), rng) * self.step_size.sqrt();
        let next = PhasePoint::new(target, drift(point, self.step_size) + noise)?;
        if !next.is_finite() {
            return Ok(Transition::divergent(1));
        }
        *point = next;
        Ok(Transition {
            accept_prob: 1.0,
            accepted: true,
            divergent: false,
            n_leapfrog: 1,
        })
    }
}

/// Stochastic gradient Nosé–Hoover thermostat (Ding et al., 2014).
///
/// With step size `h` and diffusion `A`:
///
/// ```text
/// p  <- p - xi * p * h + grad * h + sqrt(2 A h) * N(0, I)
/// q  <- q + p * h
/// xi <- xi + (p·p / d - 1) * h
/// ```
///
/// The state starts at `p ~ N(0, I)`, `xi = A`.
#[derive(Debug, Clone)]
pub struct Sgnht {
    step_size: f64,
    diffusion: f64,
    momentum: Array1<f64>,
    xi: f64,
}

impl Sgnht {
    /// Create an SGNHT kernel.
    ///
    /// # Parameters
    ///
    /// * `step_size`: The integration step `h`.
    /// * `diffusion`: The diffusion constant `A`; also the initial thermostat value.
    ///
    /// # Returns
    ///
    /// A new `Sgnht`, or [`BnnError::Configuration`] if either argument is not
    /// finite and positive.
    pub fn new(step_size: f64, diffusion: f64) -> Result<Self> {
        check_step_size(step_size)?;
        if !(diffusion.is_finite() && diffusion > 0.0) {
            return Err(BnnError::config(format!(
                "diffusion must be finite and positive, got {diffusion}"
            )));
        }
        Ok(Self {
            step_size,
            diffusion,
            momentum: Array1::zeros(0),
            xi: diffusion,
        })
    }

    pub fn diffusion(&self) -> f64 {
        self.diffusion
    }

    /// Current thermostat value.
    pub fn xi(&self) -> f64 {
        self.xi
    }

    fn reset_state(&mut self, dim: usize, rng: &mut SmallRng) {
        self.momentum = sample_momentum(dim, rng);
        self.xi = self.diffusion;
    }
}

impl Kernel for Sgnht {
    fn name(&self) -> &'static str {
        "sgnht"
    }

    fn step_size(&self) -> f64 {
        self.step_size
    }

    fn initialize<G: GradientTarget + ?Sized>(
        &mut self,
        _target: &G,
        point: &PhasePoint,
        rng: &mut SmallRng,
    ) -> Result<()> {
        self.reset_state(point.position.len(), rng);
        Ok(())
    }

    fn transition<G: GradientTarget + ?Sized>(
        &mut self,
        target: &G,
        point: &mut PhasePoint,
        rng: &mut SmallRng,
    ) -> Result<Transition> {
        let dim = point.position.len();
        if self.momentum.len() != dim {
            self.reset_state(dim, rng);
        }
        let h = self.step_size;
        let noise = sample_momentum(dim, rng) * (2.0 * self.diffusion * h).sqrt();
        let momentum = &self.momentum * (1.0 - self.xi * h) + &(&point.grad * h) + noise;
        let next = PhasePoint::new(target, &point.position + &(&momentum * h))?;
        if !next.is_finite() {
            // restart the dynamics from the last finite point
            self.reset_state(dim, rng);
            return Ok(Transition::divergent(1));
        }
        self.xi += (momentum.dot(&momentum) / dim as f64 - 1.0) * h;
        self.momentum = momentum;
        *point = next;
        Ok(Transition {
            accept_prob: 1.0,
            accepted: true,
            divergent: false,
            n_leapfrog: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::Sampler;
    use ndarray::Axis;
    use rand::SeedableRng;

    struct StandardNormal(usize);

    impl GradientTarget for StandardNormal {
        fn dim(&self) -> usize {
            self.0
        }

        fn logp_and_grad(&self, q: &Array1<f64>, grad: &mut Array1<f64>) -> Result<f64> {
            grad.assign(&q.mapv(|x| -x));
            Ok(-0.5 * q.dot(q))
        }
    }

    fn moments<K: Kernel>(kernel: K, burn_in: usize, num_samples: usize) -> (f64, f64) {
        let mut sampler =
            Sampler::new(StandardNormal(1), kernel, Array1::from(vec![2.0]), burn_in, num_samples, 11)
                .unwrap();
        let draws = sampler.run().unwrap().draws().unwrap();
        let mean = draws.mean_axis(Axis(0)).unwrap()[0];
        let var = draws.var_axis(Axis(0), 1.0)[0];
        (mean, var)
    }

    #[test]
    fn test_mala_targets_standard_normal() {
        let (mean, var) = moments(Mala::new(1.0).unwrap(), 500, 10_000);
        assert!(mean.abs() < 0.15, "mean {mean}");
        assert!((0.8..1.25).contains(&var), "var {var}");
    }

    #[test]
    fn test_mala_rejects_overshooting_proposals() {
        let target = StandardNormal(5);
        let mut mala = Mala::new(10.0).unwrap();
        let mut rng = SmallRng::seed_from_u64(0);
        let mut point = PhasePoint::new(&target, Array1::from_elem(5, 1.0)).unwrap();
        let mut accepted = 0;
        for _ in 0..200 {
            accepted += usize::from(mala.transition(&target, &mut point, &mut rng).unwrap().accepted);
        }
        assert!(accepted < 100, "accepted {accepted}");
    }

    #[test]
    fn test_sgld_targets_standard_normal() {
        let (mean, var) = moments(Sgld::new(0.1).unwrap(), 500, 20_000);
        assert!(mean.abs() < 0.3, "mean {mean}");
        assert!((0.7..1.4).contains(&var), "var {var}");
    }

    #[test]
    fn test_sgnht_targets_standard_normal() {
        let (mean, var) = moments(Sgnht::new(0.05, 1.0).unwrap(), 2000, 20_000);
        assert!(mean.abs() < 0.35, "mean {mean}");
        assert!((0.6..1.6).contains(&var), "var {var}");
    }

    #[test]
    fn test_sgnht_state_is_initialized() {
        let target = StandardNormal(4);
        let point = PhasePoint::new(&target, Array1::zeros(4)).unwrap();
        let mut kernel = Sgnht::new(0.01, 2.0).unwrap();
        kernel.initialize(&target, &point, &mut SmallRng::seed_from_u64(3)).unwrap();
        assert_eq!(kernel.xi(), 2.0);
        assert_eq!(kernel.momentum.len(), 4);
    }

    #[test]
    fn test_invalid_hyperparameters_are_rejected() {
        assert!(Mala::new(0.0).is_err());
        assert!(Sgld::new(-1.0).is_err());
        assert!(Sgnht::new(0.1, 0.0).is_err());
    }
}
