//! Data binding for the posterior: the full dataset or fresh minibatches.

use crate::error::{BnnError, Result};
use ndarray::{Array2, Axis};
use rand::rngs::SmallRng;
use rand::seq::index;
use rand::SeedableRng;
use std::borrow::Cow;
use std::sync::Mutex;

/// Training pairs `X [n, p]`, `y [n, q]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    x: Array2<f64>,
    y: Array2<f64>,
}

impl Dataset {
    pub fn new(x: Array2<f64>, y: Array2<f64>) -> Result<Self> {
        if x.nrows() != y.nrows() {
            return Err(BnnError::config(format!(
                "X has {} rows but y has {}",
                x.nrows(),
                y.nrows()
            )));
        }
        if x.nrows() == 0 {
            return Err(BnnError::config("empty dataset"));
        }
        Ok(Self { x, y })
    }

    pub fn x(&self) -> &Array2<f64> {
        &self.x
    }

    pub fn y(&self) -> &Array2<f64> {
        &self.y
    }

    pub fn len(&self) -> usize {
        self.x.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.x.nrows() == 0
    }

    /// Rows at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            x: self.x.select(Axis(0), indices),
            y: self.y.select(Axis(0), indices),
        }
    }
}

/// Supplies the `(X, y)` pair for the next log-probability evaluation.
///
/// Full-batch and minibatch posteriors share the same evaluation path; only the
/// provider differs.
pub trait DataProvider: Send + Sync {
    fn batch(&self) -> Cow<'_, Dataset>;

    fn dataset(&self) -> &Dataset;

    /// Number of rows returned by each call to [`DataProvider::batch`].
    fn batch_len(&self) -> usize;

    /// Factor on the batch log-likelihood that makes it an unbiased estimate
    /// of the full-data log-likelihood: `N / batch_len`.
    fn likelihood_scale(&self) -> f64 {
        self.dataset().len() as f64 / self.batch_len() as f64
    }
}

impl<D: DataProvider + ?Sized> DataProvider for Box<D> {
    fn batch(&self) -> Cow<'_, Dataset> {
        (**self).batch()
    }

    fn dataset(&self) -> &Dataset {
        (**self).dataset()
    }

    fn batch_len(&self) -> usize {
        (**self).batch_len()
    }

    fn likelihood_scale(&self) -> f64 {
        (**self).likelihood_scale()
    }
}

/// Always returns the full dataset.
#[derive(Debug, Clone)]
pub struct FullData {
    data: Dataset,
}

impl FullData {
    pub fn new(data: Dataset) -> Self {
        Self { data }
    }
}

impl DataProvider for FullData {
    fn batch(&self) -> Cow<'_, Dataset> {
        Cow::Borrowed(&self.data)
    }

    fn dataset(&self) -> &Dataset {
        &self.data
    }

    fn batch_len(&self) -> usize {
        self.data.len()
    }

    fn likelihood_scale(&self) -> f64 {
        1.0
    }
}

/// Draws `batch_size` rows without replacement on every call.
///
/// The batch log-likelihood is scaled by `N / batch_size`, so its expectation
/// over batches is the full-data log-likelihood.
#[derive(Debug)]
pub struct Minibatch {
    data: Dataset,
    batch_size: usize,
    rng: Mutex<SmallRng>,
}

impl Minibatch {
    pub fn new(data: Dataset, batch_size: usize, seed: u64) -> Result<Self> {
        if batch_size == 0 || batch_size > data.len() {
            return Err(BnnError::config(format!(
                "batch_size must be in 1..={}, got {batch_size}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            batch_size,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        })
    }
}

impl DataProvider for Minibatch {
    fn batch(&self) -> Cow<'_, Dataset> {
        let indices = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            index::sample(&mut *rng, self.data.len(), self.batch_size).into_vec()
        };
        Cow::Owned(self.data.select(&indices))
    }

    fn dataset(&self) -> &Dataset {
        &self.data
    }

    fn batch_len(&self) -> usize {
        self.batch_size
    }
}
