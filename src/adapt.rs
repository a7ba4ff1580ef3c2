//! Step-size adaptation during warm-up.

/// Nesterov dual averaging of `log(step_size)` (Hoffman & Gelman, 2014).
///
/// Feed it the acceptance statistic of every warm-up transition; use
/// [`DualAveraging::final_step_size`] once warm-up is over.
#[derive(Debug, Clone, PartialEq)]
pub struct DualAveraging {
    target: f64,
    mu: f64,
    gamma: f64,
    t0: f64,
    kappa: f64,
    h_bar: f64,
    log_eps_bar: f64,
    t: u64,
}

impl DualAveraging {
    pub fn new(initial_step_size: f64, target: f64) -> Self {
        Self {
            target,
            mu: (10.0 * initial_step_size).ln(),
            gamma: 0.05,
            t0: 10.0,
            kappa: 0.75,
            h_bar: 0.0,
            log_eps_bar: initial_step_size.ln(),
            t: 0,
        }
    }

    /// Restarts the averaging around a new initial step size.
    pub fn restart(&mut self, initial_step_size: f64) {
        *self = Self::new(initial_step_size, self.target);
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    /// Updates the running statistics and returns the step size to use next.
    pub fn update(&mut self, accept_prob: f64) -> f64 {
        // a NaN statistic counts as a rejection
        let accept_prob = if accept_prob.is_finite() {
            accept_prob.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.t += 1;
        let t = self.t as f64;
        let eta = 1.0 / (t + self.t0);
        self.h_bar = (1.0 - eta) * self.h_bar + eta * (self.target - accept_prob);
        let log_eps = self.mu - t.sqrt() / self.gamma * self.h_bar;
        let w = t.powf(-self.kappa);
        self.log_eps_bar = w * log_eps + (1.0 - w) * self.log_eps_bar;
        log_eps.exp()
    }

    /// Averaged step size, the one to keep after warm-up.
    pub fn final_step_size(&self) -> f64 {
        self.log_eps_bar.exp()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_acceptance_shrinks_step_size() {
        let mut da = DualAveraging::new(1.0, 0.8);
        let mut eps = 1.0;
        for _ in 0..50 {
            eps = da.update(0.1);
        }
        assert!(eps < 1.0, "eps = {eps}");
        assert!(da.final_step_size() < 1.0);
    }

    #[test]
    fn test_high_acceptance_grows_step_size() {
        let mut da = DualAveraging::new(0.01, 0.8);
        for _ in 0..50 {
            da.update(1.0);
        }
        assert!(da.final_step_size() > 0.01);
    }

    #[test]
    fn test_nan_is_treated_as_rejection() {
        let mut a = DualAveraging::new(0.5, 0.8);
        let mut b = a.clone();
        assert_eq!(a.update(f64::NAN), b.update(0.0));
    }
}
