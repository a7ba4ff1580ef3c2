//! No-U-Turn Sampler with multinomial trajectory sampling.
//!
//! The trajectory is doubled iteratively, each time in a random direction,
//! until the endpoint U-turn criterion `(q_+ - q_-) · p_± < 0` fires on the
//! whole trajectory or on one of its balanced subtrees, a leaf diverges, or
//! `max_tree_depth` doublings have been made. The next state is drawn from all leaves with
//! weights `exp(-H)`. A divergent trajectory keeps the current state.

use crate::adapt::DualAveraging;
use crate::error::{BnnError, Result};
use crate::hmc::{hamiltonian, leapfrog, sample_momentum};
use crate::sampler::{Kernel, PhasePoint, Transition, DIVERGENCE_THRESHOLD};
use crate::target::GradientTarget;
use log::debug;
use ndarray::Array1;
use rand::rngs::SmallRng;
use rand::Rng;

const LN_HALF: f64 = -std::f64::consts::LN_2;

/// Hoffman & Gelman's heuristic: starting from 1, halve or double the step
/// size until the acceptance probability of one leapfrog step from `point`
/// with `momentum` crosses 1/2.
pub fn find_reasonable_step_size<G: GradientTarget + ?Sized>(
    target: &G,
    point: &PhasePoint,
    momentum: &Array1<f64>,
) -> Result<f64> {
    let h0 = hamiltonian(point, momentum);
    let log_ratio = |eps: f64| -> Result<f64> {
        let (next, p) = leapfrog(target, point, momentum, eps)?;
        let lr = h0 - hamiltonian(&next, &p);
        Ok(if lr.is_nan() { f64::NEG_INFINITY } else { lr })
    };

    let mut eps = 1.0;
    let mut lr = log_ratio(eps)?;
    let a = if lr > LN_HALF { 1.0 } else { -1.0 };
    for _ in 0..100 {
        if a * lr <= a * LN_HALF {
            break;
        }
        eps *= 2f64.powf(a);
        lr = log_ratio(eps)?;
    }
    Ok(eps.clamp(1e-10, 1e3))
}

#[derive(Debug, Clone)]
struct State {
    point: PhasePoint,
    momentum: Array1<f64>,
}

/// A balanced subtree of the trajectory.
struct Subtree {
    left: State,
    right: State,
    proposal: PhasePoint,
    log_sum_weight: f64,
    /// Sum over leaves of `min(1, exp(H_0 - H_leaf))`.
    sum_accept: f64,
    n_leapfrog: usize,
    turning: bool,
    diverging: bool,
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// `(q_right - q_left) · p < 0` at either end.
fn is_turning(left: &State, right: &State) -> bool {
    let dq = &right.point.position - &left.point.position;
    dq.dot(&left.momentum) < 0.0 || dq.dot(&right.momentum) < 0.0
}

fn build_subtree<G: GradientTarget + ?Sized>(
    target: &G,
    start: &State,
    step_size: f64,
    depth: usize,
    h0: f64,
    rng: &mut SmallRng,
) -> Result<Subtree> {
    if depth == 0 {
        let (point, momentum) = leapfrog(target, &start.point, &start.momentum, step_size)?;
        let h = hamiltonian(&point, &momentum);
        let delta = h - h0;
        let diverging = !delta.is_finite() || !point.is_finite() || delta > DIVERGENCE_THRESHOLD;
        let (log_weight, accept) = if diverging {
            (f64::NEG_INFINITY, 0.0)
        } else {
            (-delta, (-delta).exp().min(1.0))
        };
        let leaf = State { point, momentum };
        return Ok(Subtree {
            left: leaf.clone(),
            right: leaf.clone(),
            proposal: leaf.point,
            log_sum_weight: log_weight,
            sum_accept: accept,
            n_leapfrog: 1,
            turning: false,
            diverging,
        });
    }

    let inner = build_subtree(target, start, step_size, depth - 1, h0, rng)?;
    if inner.diverging || inner.turning {
        return Ok(inner);
    }
    let edge = if step_size > 0.0 {
        &inner.right
    } else {
        &inner.left
    };
    let outer = build_subtree(target, edge, step_size, depth - 1, h0, rng)?;
    let n_leapfrog = inner.n_leapfrog + outer.n_leapfrog;
    let sum_accept = inner.sum_accept + outer.sum_accept;
    if outer.diverging || outer.turning {
        return Ok(Subtree {
            n_leapfrog,
            sum_accept,
            turning: outer.turning,
            diverging: outer.diverging,
            ..inner
        });
    }

    let log_sum_weight = log_sum_exp(inner.log_sum_weight, outer.log_sum_weight);
    let take_outer = rng.gen::<f64>() < (outer.log_sum_weight - log_sum_weight).exp();
    let proposal = if take_outer {
        outer.proposal
    } else {
        inner.proposal
    };
    let (left, right) = if step_size > 0.0 {
        (inner.left, outer.right)
    } else {
        (outer.left, inner.right)
    };
    let turning = is_turning(&left, &right);
    Ok(Subtree {
        left,
        right,
        proposal,
        log_sum_weight,
        sum_accept,
        n_leapfrog,
        turning,
        diverging: false,
    })
}

/// Multinomial NUTS with an identity mass matrix.
#[derive(Debug, Clone)]
pub struct Nuts {
    step_size: f64,
    max_tree_depth: usize,
    adaptation: Option<DualAveraging>,
}

impl Nuts {
    /// Create a NUTS kernel.
    ///
    /// # Parameters
    ///
    /// * `step_size`: The leapfrog step size, replaced by the reasonable-step-size
    ///   search when adaptation is enabled.
    /// * `max_tree_depth`: The maximum number of trajectory doublings; a tree
    ///   holds at most `2^max_tree_depth` leapfrog steps.
    ///
    /// # Returns
    ///
    /// A new `Nuts` without adaptation, or [`BnnError::Configuration`] if
    /// `step_size` is not finite and positive or `max_tree_depth` is zero.
    pub fn new(step_size: f64, max_tree_depth: usize) -> Result<Self> {
        if !(step_size.is_finite() && step_size > 0.0) {
            return Err(BnnError::config(format!(
                "step_size must be finite and positive, got {step_size}"
            )));
        }
        if max_tree_depth == 0 {
            return Err(BnnError::config("max_tree_depth must be at least 1"));
        }
        Ok(Self {
            step_size,
            max_tree_depth,
            adaptation: None,
        })
    }

    /// Adapts the step size towards `target_accept` during warm-up, starting
    /// from [`find_reasonable_step_size`] at the initial point.
    pub fn with_adaptation(mut self, target_accept: f64) -> Self {
        self.adaptation = Some(DualAveraging::new(self.step_size, target_accept));
        self
    }

    pub fn max_tree_depth(&self) -> usize {
        self.max_tree_depth
    }
}

impl Kernel for Nuts {
    fn name(&self) -> &'static str {
        "nuts"
    }

    fn step_size(&self) -> f64 {
        self.step_size
    }

    fn initialize<G: GradientTarget + ?Sized>(
        &mut self,
        target: &G,
        point: &PhasePoint,
        rng: &mut SmallRng,
    ) -> Result<()> {
        if let Some(da) = self.adaptation.as_mut() {
            let momentum = sample_momentum(point.position.len(), rng);
            self.step_size = find_reasonable_step_size(target, point, &momentum)?;
            da.restart(self.step_size);
            debug!("nuts: initial step size {:.3e}", self.step_size);
        }
        Ok(())
    }

    fn transition<G: GradientTarget + ?Sized>(
        &mut self,
        target: &G,
        point: &mut PhasePoint,
        rng: &mut SmallRng,
    ) -> Result<Transition> {
        let momentum = sample_momentum(point.position.len(), rng);
        let h0 = hamiltonian(point, &momentum);
        let initial = State {
            point: point.clone(),
            momentum,
        };

        let mut left = initial.clone();
        let mut right = initial;
        let mut proposal: Option<PhasePoint> = None;
        let mut log_sum_weight = 0.0;
        let mut sum_accept = 0.0;
        let mut n_leapfrog = 0;
        let mut diverging = false;

        for depth in 0..self.max_tree_depth {
            let forward = rng.gen::<bool>();
            let subtree = if forward {
                build_subtree(target, &right, self.step_size, depth, h0, rng)?
            } else {
                build_subtree(target, &left, -self.step_size, depth, h0, rng)?
            };
            n_leapfrog += subtree.n_leapfrog;
            sum_accept += subtree.sum_accept;
            if subtree.diverging {
                diverging = true;
                break;
            }
            if subtree.turning {
                break;
            }

            // biased progressive sampling towards the new subtree
            if rng.gen::<f64>() < (subtree.log_sum_weight - log_sum_weight).exp() {
                proposal = Some(subtree.proposal);
            }
            log_sum_weight = log_sum_exp(log_sum_weight, subtree.log_sum_weight);

            if forward {
                right = subtree.right;
            } else {
                left = subtree.left;
            }
            if is_turning(&left, &right) {
                break;
            }
        }

        let accept_prob = if n_leapfrog == 0 {
            0.0
        } else {
            sum_accept / n_leapfrog as f64
        };
        let accepted = match proposal {
            Some(next) if !diverging => {
                *point = next;
                true
            }
            _ => false,
        };
        Ok(Transition {
            accept_prob,
            accepted,
            divergent: diverging,
            n_leapfrog,
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
