/*!
Prior distributions over parameter sites.

A [`Prior`] is the crate's distribution capability: it can draw values of a
given size (`sample`) and evaluate a sum-reduced log-density on any `burn`
tensor (`log_prob`), so the same object serves initialization on the host
and the differentiable posterior during sampling.

# Examples

```rust
use bnn_mcmc::prior::Prior;
use rand::{rngs::SmallRng, SeedableRng};

let prior = Prior::Normal { loc: 0.0, scale: 1.0 };
prior.validate().unwrap();

let mut rng = SmallRng::seed_from_u64(42);
let draws = prior.sample(6, &mut rng).unwrap();
assert_eq!(draws.len(), 6);

// Host-side mirror of the tensor log-density.
let lp = prior.log_prob_host(&[0.0]);
assert!((lp + 0.5 * (2.0 * std::f64::consts::PI).ln()).abs() < 1e-12);
```
*/

use crate::error::{BnnError, Result};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::Rng;
use rand_distr::{Cauchy, Distribution, Gamma, Normal};
use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;
use std::f64::consts::PI;

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Where a prior puts its mass. Positive priors are sampled on the log scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Support {
    Real,
    Positive,
}

/// Supported prior families. `scale` is a standard deviation, `rate` an inverse scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Prior {
    Normal { loc: f64, scale: f64 },
    HalfCauchy { scale: f64 },
    InverseGamma { concentration: f64, rate: f64 },
    Gamma { concentration: f64, rate: f64 },
}

impl Prior {
    pub const fn standard_normal() -> Self {
        Prior::Normal {
            loc: 0.0,
            scale: 1.0,
        }
    }

    /// Rejects non-finite or non-positive hyperparameters.
    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(BnnError::config(format!(
                    "{self:?}: `{name}` must be finite and positive, got {v}"
                )))
            }
        };
        match *self {
            Prior::Normal { loc, scale } => {
                if !loc.is_finite() {
                    return Err(BnnError::config(format!("{self:?}: `loc` must be finite")));
                }
                positive("scale", scale)
            }
            Prior::HalfCauchy { scale } => positive("scale", scale),
            Prior::InverseGamma {
                concentration,
                rate,
            }
            | Prior::Gamma {
                concentration,
                rate,
            } => {
                positive("concentration", concentration)?;
                positive("rate", rate)
            }
        }
    }

    pub fn support(&self) -> Support {
        match self {
            Prior::Normal { .. } => Support::Real,
            _ => Support::Positive,
        }
    }

    /// Draws `n` independent values on the constrained scale.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<Vec<f64>> {
        let bad = |e: &dyn std::fmt::Display| BnnError::config(format!("{self:?}: {e}"));
        let draws = match *self {
            Prior::Normal { loc, scale } => {
                let d = Normal::new(loc, scale).map_err(|e| bad(&e))?;
                (0..n).map(|_| d.sample(rng)).collect()
            }
            Prior::HalfCauchy { scale } => {
                let d = Cauchy::new(0.0, scale).map_err(|e| bad(&e))?;
                (0..n).map(|_| d.sample(rng).abs()).collect()
            }
            Prior::InverseGamma {
                concentration,
                rate,
            } => {
                // 1 / Gamma(a, scale = 1 / b)
                let d = Gamma::new(concentration, 1.0 / rate).map_err(|e| bad(&e))?;
                (0..n).map(|_| 1.0 / d.sample(rng)).collect()
            }
            Prior::Gamma {
                concentration,
                rate,
            } => {
                let d = Gamma::new(concentration, 1.0 / rate).map_err(|e| bad(&e))?;
                (0..n).map(|_| d.sample(rng)).collect()
            }
        };
        Ok(draws)
    }

    /// Sum-reduced log-density of every element of `value`, as a one-element tensor.
    ///
    /// `value` must lie on the constrained scale (positive for the positive families).
    pub fn log_prob<B: Backend, const D: usize>(&self, value: Tensor<B, D>) -> Tensor<B, 1> {
        let n = value.shape().num_elements() as f64;
        match *self {
            Prior::Normal { loc, scale } => value
                .sub_scalar(loc)
                .div_scalar(scale)
                .powi_scalar(2)
                .sum()
                .mul_scalar(-0.5)
                .sub_scalar(n * (scale.ln() + 0.5 * LN_2PI)),
            Prior::HalfCauchy { scale } => value
                .div_scalar(scale)
                .powi_scalar(2)
                .add_scalar(1.0)
                .log()
                .sum()
                .neg()
                .add_scalar(n * ((2.0 / PI).ln() - scale.ln())),
            Prior::InverseGamma {
                concentration,
                rate,
            } => value
                .clone()
                .log()
                .mul_scalar(-(concentration + 1.0))
                .sub(value.recip().mul_scalar(rate))
                .sum()
                .add_scalar(n * (concentration * rate.ln() - ln_gamma(concentration))),
            Prior::Gamma {
                concentration,
                rate,
            } => value
                .clone()
                .log()
                .mul_scalar(concentration - 1.0)
                .sub(value.mul_scalar(rate))
                .sum()
                .add_scalar(n * (concentration * rate.ln() - ln_gamma(concentration))),
        }
    }

    /// Scalar version of [`Prior::log_prob`] for host-side checks.
    pub fn log_prob_host(&self, values: &[f64]) -> f64 {
        values
            .iter()
            .map(|&x| match *self {
                Prior::Normal { loc, scale } => {
                    let z = (x - loc) / scale;
                    -0.5 * z * z - scale.ln() - 0.5 * LN_2PI
                }
                Prior::HalfCauchy { scale } if x >= 0.0 => {
                    (2.0 / PI).ln() - scale.ln() - (1.0 + (x / scale).powi(2)).ln()
                }
                Prior::InverseGamma {
                    concentration: a,
                    rate: b,
                } if x > 0.0 => a * b.ln() - ln_gamma(a) - (a + 1.0) * x.ln() - b / x,
                Prior::Gamma {
                    concentration: a,
                    rate: b,
                } if x > 0.0 => a * b.ln() - ln_gamma(a) + (a - 1.0) * x.ln() - b * x,
                _ => f64::NEG_INFINITY,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;
    use burn::tensor::{ElementConversion, TensorData};
    use rand::{rngs::SmallRng, SeedableRng};

    type B = NdArray<f64>;

    fn tensor_log_prob(prior: &Prior, values: &[f64]) -> f64 {
        let t = Tensor::<B, 1>::from_data(
            TensorData::new(values.to_vec(), [values.len()]),
            &Default::default(),
        );
        prior.log_prob(t).into_scalar().elem::<f64>()
    }

    #[test]
    fn test_tensor_log_prob_matches_host() {
        let values = [0.3, 1.7, 2.2, 0.05];
        for prior in [
            Prior::Normal {
                loc: 0.5,
                scale: 2.0,
            },
            Prior::HalfCauchy { scale: 1.5 },
            Prior::InverseGamma {
                concentration: 2.0,
                rate: 3.0,
            },
            Prior::Gamma {
                concentration: 0.7,
                rate: 1.3,
            },
        ] {
            assert_abs_diff_eq!(
                tensor_log_prob(&prior, &values),
                prior.log_prob_host(&values),
                epsilon = 1e-10
            );
        }
    }

    #[test]
    fn test_standard_normal_density_at_zero() {
        let lp = Prior::standard_normal().log_prob_host(&[0.0]);
        assert_abs_diff_eq!(lp, -0.918_938_533_204_672_7, epsilon = 1e-12);
    }

    #[test]
    fn test_inverse_gamma_known_value() {
        // scipy.stats.invgamma(a=2, scale=1).logpdf(1.0) = ln(e^-1) = -1
        let p = Prior::InverseGamma {
            concentration: 2.0,
            rate: 1.0,
        };
        assert_abs_diff_eq!(p.log_prob_host(&[1.0]), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_positive_priors_sample_positive_values() {
        let mut rng = SmallRng::seed_from_u64(7);
        for prior in [
            Prior::HalfCauchy { scale: 1.0 },
            Prior::InverseGamma {
                concentration: 1.0,
                rate: 1.0,
            },
            Prior::Gamma {
                concentration: 2.0,
                rate: 2.0,
            },
        ] {
            assert_eq!(prior.support(), Support::Positive);
            let draws = prior.sample(500, &mut rng).unwrap();
            assert!(draws.iter().all(|&x| x > 0.0 && x.is_finite()));
        }
    }

    #[test]
    fn test_invalid_hyperparameters_are_rejected() {
        assert!(Prior::Normal {
            loc: 0.0,
            scale: 0.0
        }
        .validate()
        .is_err());
        assert!(Prior::HalfCauchy { scale: -1.0 }.validate().is_err());
        assert!(Prior::Gamma {
            concentration: f64::NAN,
            rate: 1.0
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_serde_uses_family_tag() {
        let json = serde_json::to_string(&Prior::HalfCauchy { scale: 1.0 }).unwrap();
        assert_eq!(json, r#"{"family":"half_cauchy","scale":1.0}"#);
        let back: Prior = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Prior::HalfCauchy { scale: 1.0 });
    }
}
