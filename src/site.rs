//! A single named, shaped, prior-endowed parameter tensor.

use crate::error::{BnnError, Result};
use crate::prior::{Prior, Support};
use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Map from the sampled (unconstrained) scale to the prior's support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
    Identity,
    /// The stored value is the log of a positive quantity.
    Exp,
}

/// One tensor-valued parameter of a layer together with its prior.
///
/// `value` always holds `shape.iter().product()` elements in row-major order,
/// on the unconstrained scale the samplers move on.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSite {
    name: String,
    shape: Vec<usize>,
    value: Vec<f64>,
    prior: Prior,
    transform: Transform,
}

impl ParameterSite {
    /// Creates a site whose value sits at the origin of the unconstrained scale.
    ///
    /// Positive priors get an [`Transform::Exp`] so HMC never steps out of the support.
    pub fn new(name: impl Into<String>, shape: Vec<usize>, prior: Prior) -> Result<Self> {
        let name = name.into();
        prior.validate()?;
        if shape.iter().any(|&d| d == 0) {
            return Err(BnnError::config(format!(
                "site `{name}` has an empty dimension in shape {shape:?}"
            )));
        }
        let transform = match prior.support() {
            Support::Real => Transform::Identity,
            Support::Positive => Transform::Exp,
        };
        let len = shape.iter().product();
        Ok(Self {
            name,
            shape,
            value: vec![0.0; len],
            prior,
            transform,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of scalar elements.
    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn prior(&self) -> &Prior {
        &self.prior
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// Current value on the unconstrained scale.
    pub fn value(&self) -> &[f64] {
        &self.value
    }

    /// Current value on the prior's support.
    pub fn constrained_value(&self) -> Vec<f64> {
        match self.transform {
            Transform::Identity => self.value.clone(),
            Transform::Exp => self.value.iter().map(|u| u.exp()).collect(),
        }
    }

    pub fn set_value(&mut self, value: Vec<f64>) -> Result<()> {
        if value.len() != self.value.len() {
            return Err(BnnError::ShapeMismatch {
                name: self.name.clone(),
                expected: self.shape.clone(),
                actual: vec![value.len()],
            });
        }
        self.value = value;
        Ok(())
    }

    /// Draws a fresh value from the prior and stores it on the unconstrained scale.
    pub fn reset<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        let draws = self.prior.sample(self.len(), rng)?;
        self.value = match self.transform {
            Transform::Identity => draws,
            // Guard against HalfCauchy / InverseGamma draws that underflow to zero.
            Transform::Exp => draws.into_iter().map(|c| c.max(f64::MIN_POSITIVE).ln()).collect(),
        };
        Ok(())
    }

    /// Current value as a flat tensor on `device`.
    pub fn tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1> {
        Tensor::<B, 1>::from_data(TensorData::new(self.value.clone(), [self.len()]), device)
    }

    /// Maps an unconstrained tensor onto the prior's support.
    pub fn constrain<B: Backend, const D: usize>(&self, raw: Tensor<B, D>) -> Tensor<B, D> {
        match self.transform {
            Transform::Identity => raw,
            Transform::Exp => raw.exp(),
        }
    }

    /// Log-density of an unconstrained flat tensor for this site, including the
    /// log-Jacobian of the transform.
    pub fn log_prob<B: Backend>(&self, raw: Tensor<B, 1>) -> Tensor<B, 1> {
        match self.transform {
            Transform::Identity => self.prior.log_prob(raw),
            Transform::Exp => {
                let jacobian = raw.clone().sum();
                self.prior.log_prob(raw.exp()) + jacobian
            }
        }
    }

    /// Host-side [`ParameterSite::log_prob`] of the current value.
    pub fn prior_log_prob(&self) -> f64 {
        let lp = self.prior.log_prob_host(&self.constrained_value());
        match self.transform {
            Transform::Identity => lp,
            Transform::Exp => lp + self.value.iter().sum::<f64>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use burn::backend::NdArray;
    use burn::tensor::ElementConversion;
    use rand::{rngs::SmallRng, SeedableRng};

    type B = NdArray<f64>;

    #[test]
    fn test_positive_prior_gets_exp_transform() {
        let site = ParameterSite::new("tau", vec![1], Prior::HalfCauchy { scale: 1.0 }).unwrap();
        assert_eq!(site.transform(), Transform::Exp);
        assert_eq!(site.constrained_value(), vec![1.0]);
    }

    #[test]
    fn test_reset_keeps_shape() {
        let mut site = ParameterSite::new("W", vec![3, 2], Prior::standard_normal()).unwrap();
        let mut rng = SmallRng::seed_from_u64(1);
        site.reset(&mut rng).unwrap();
        assert_eq!(site.len(), 6);
        assert_eq!(site.shape(), &[3, 2]);
        assert!(site.value().iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_set_value_rejects_wrong_length() {
        let mut site = ParameterSite::new("b", vec![3], Prior::standard_normal()).unwrap();
        let err = site.set_value(vec![0.0; 4]).unwrap_err();
        assert!(matches!(err, BnnError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_empty_dimension_is_a_configuration_error() {
        let err = ParameterSite::new("W", vec![0, 2], Prior::standard_normal()).unwrap_err();
        assert!(matches!(err, BnnError::Configuration(_)));
    }

    #[test]
    fn test_tensor_log_prob_includes_jacobian() {
        let mut site = ParameterSite::new(
            "sigma",
            vec![2],
            Prior::Gamma {
                concentration: 2.0,
                rate: 1.0,
            },
        )
        .unwrap();
        site.set_value(vec![-0.3, 0.8]).unwrap();
        let device = Default::default();
        let lp = site
            .log_prob(site.tensor::<B>(&device))
            .into_scalar()
            .elem::<f64>();
        assert_abs_diff_eq!(lp, site.prior_log_prob(), epsilon = 1e-10);

        let without_jacobian = site.prior().log_prob_host(&site.constrained_value());
        assert_abs_diff_eq!(lp - without_jacobian, 0.5, epsilon = 1e-10);
    }
}
