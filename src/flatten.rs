/*!
Codec between a tree of named, shaped parameter tensors and one flat vector.

The [`Flattener`] only stores the `(name, shape, offset)` table. It is
derived from the live model graph (see `ModelGraph::flattener`) rather than
cached next to it, so a topology change can never leave a stale layout
behind. Both directions are exact:

```rust
use bnn_mcmc::flatten::Flattener;

let flat = Flattener::new([("W".to_string(), vec![3, 2]), ("b".to_string(), vec![3])]);
assert_eq!(flat.len(), 9);

let tree = flat.unflatten(&[0.0; 9]).unwrap();
assert_eq!(tree.get("W").unwrap().shape, vec![3, 2]);
assert_eq!(flat.flatten(&tree).unwrap(), vec![0.0; 9]);
```
*/

use crate::error::{BnnError, Result};
use crate::site::ParameterSite;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Position of one site inside the flat vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub offset: usize,
}

impl SiteSpec {
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.numel()
    }
}

/// A row-major tensor identified by its qualified site name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

/// Parameter tree in construction order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParamTree {
    pub tensors: Vec<NamedTensor>,
}

impl ParamTree {
    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedTensor> {
        self.tensors.iter()
    }
}

/// Immutable `(name, shape, offset)` table of a model topology.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flattener {
    specs: Vec<SiteSpec>,
    len: usize,
}

impl Flattener {
    /// Lays the given sites out back to back, in iteration order.
    pub fn new<I>(layout: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<usize>)>,
    {
        let mut offset = 0;
        let specs = layout
            .into_iter()
            .map(|(name, shape)| {
                let spec = SiteSpec {
                    name,
                    shape,
                    offset,
                };
                offset += spec.numel();
                spec
            })
            .collect();
        Self { specs, len: offset }
    }

    pub fn from_sites<'a, I>(sites: I) -> Self
    where
        I: IntoIterator<Item = &'a ParameterSite>,
    {
        Self::new(
            sites
                .into_iter()
                .map(|s| (s.name().to_string(), s.shape().to_vec())),
        )
    }

    /// Total number of scalars.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn specs(&self) -> &[SiteSpec] {
        &self.specs
    }

    pub fn spec(&self, name: &str) -> Option<&SiteSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    pub fn offset_of(&self, name: &str) -> Option<usize> {
        self.spec(name).map(|s| s.offset)
    }

    pub fn check_len(&self, actual: usize) -> Result<()> {
        if actual == self.len {
            Ok(())
        } else {
            Err(BnnError::LengthMismatch {
                expected: self.len,
                actual,
            })
        }
    }

    /// Concatenates the tree in layout order. Names, shapes and element counts
    /// must all match the recorded layout.
    pub fn flatten(&self, tree: &ParamTree) -> Result<Vec<f64>> {
        if tree.len() != self.specs.len() {
            let missing = self
                .specs
                .iter()
                .find(|s| tree.get(&s.name).is_none())
                .map(|s| (s.name.clone(), s.shape.clone()));
            let (name, expected) = missing.unwrap_or_else(|| ("<extra tensor>".to_string(), vec![]));
            return Err(BnnError::ShapeMismatch {
                name,
                expected,
                actual: vec![tree.len()],
            });
        }
        let mut out = Vec::with_capacity(self.len);
        for (spec, tensor) in self.specs.iter().zip(tree.iter()) {
            if tensor.name != spec.name
                || tensor.shape != spec.shape
                || tensor.values.len() != spec.numel()
            {
                return Err(BnnError::ShapeMismatch {
                    name: spec.name.clone(),
                    expected: spec.shape.clone(),
                    actual: if tensor.values.len() == tensor.shape.iter().product::<usize>() {
                        tensor.shape.clone()
                    } else {
                        vec![tensor.values.len()]
                    },
                });
            }
            out.extend_from_slice(&tensor.values);
        }
        Ok(out)
    }

    /// Slices `vec` into the recorded tensors.
    pub fn unflatten(&self, vec: &[f64]) -> Result<ParamTree> {
        self.check_len(vec.len())?;
        let tensors = self
            .specs
            .iter()
            .map(|spec| NamedTensor {
                name: spec.name.clone(),
                shape: spec.shape.clone(),
                values: vec[spec.range()].to_vec(),
            })
            .collect();
        Ok(ParamTree { tensors })
    }

    /// Borrowing variant of [`Flattener::unflatten`]: one slice per site.
    pub fn split<'v>(&self, vec: &'v [f64]) -> Result<Vec<&'v [f64]>> {
        self.check_len(vec.len())?;
        Ok(self.specs.iter().map(|s| &vec[s.range()]).collect())
    }

    /// Slices a flat tensor into one flat tensor per site. Only `slice` is used,
    /// so gradients flow back to `vec`.
    pub fn unflatten_tensor<B: Backend>(&self, vec: Tensor<B, 1>) -> Result<Vec<Tensor<B, 1>>> {
        let [n] = vec.dims();
        self.check_len(n)?;
        Ok(self
            .specs
            .iter()
            .map(|s| vec.clone().slice([s.range()]))
            .collect())
    }
}
