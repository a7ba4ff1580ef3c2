/*!
# Saving chains to CSV

Enable via the `csv` feature.

One row per recorded iteration. The header is
`chain,iteration,warmup,divergent,log_prob` followed by one column per scalar
of the flat vector, named after its site: `net.0.W[1,0]`, `net.0.b[2]`, or
just `noise.sigma` for a single-element site.
*/

use crate::chain::{Chain, ChainRecord};
use crate::error::{BnnError, Result};
use crate::flatten::{Flattener, SiteSpec};
use csv::Writer;
use std::fs::File;
use std::path::Path;

fn element_names(spec: &SiteSpec) -> Vec<String> {
    if spec.numel() == 1 {
        return vec![spec.name.clone()];
    }
    (0..spec.numel())
        .map(|flat| {
            let mut rest = flat;
            let mut index = vec![0; spec.shape.len()];
            for (slot, dim) in index.iter_mut().zip(&spec.shape).rev() {
                *slot = rest % dim;
                rest /= dim;
            }
            let index: Vec<String> = index.iter().map(usize::to_string).collect();
            format!("{}[{}]", spec.name, index.join(","))
        })
        .collect()
}

/// Column name of every entry of the flat vector, in flat order.
pub fn column_names(layout: &Flattener) -> Vec<String> {
    layout.specs().iter().flat_map(element_names).collect()
}

/**
Writes every iteration of `chains` as CSV.

# Examples

```rust
use bnn_mcmc::chain::Chain;
use bnn_mcmc::flatten::Flattener;
use bnn_mcmc::io::csv::save_csv;

let layout = Flattener::new([("w".to_string(), vec![2])]);
let chains = vec![Chain::new(2)];
save_csv(&chains, &layout, "/tmp/bnn-chains.csv")?;
# Ok::<(), bnn_mcmc::error::BnnError>(())
```
*/
pub fn save_csv<P: AsRef<Path>>(chains: &[Chain], layout: &Flattener, path: P) -> Result<()> {
    let mut wtr = Writer::from_writer(File::create(path)?);

    let mut header: Vec<String> = ["chain", "iteration", "warmup", "divergent", "log_prob"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    header.extend(column_names(layout));
    wtr.write_record(&header)?;

    for (chain_idx, chain) in chains.iter().enumerate() {
        if chain.dim() != layout.len() {
            return Err(BnnError::LengthMismatch {
                expected: layout.len(),
                actual: chain.dim(),
            });
        }
        for (position, diag) in chain.positions().iter().zip(chain.diagnostics()) {
            let mut row = vec![
                chain_idx.to_string(),
                diag.iteration.to_string(),
                diag.warmup.to_string(),
                diag.divergent.to_string(),
                diag.log_prob.to_string(),
            ];
            row.extend(position.iter().map(|v| v.to_string()));
            wtr.write_record(&row)?;
        }
    }

    wtr.flush()?;
    Ok(())
}

/// [`save_csv`] for the chains of several records sharing one layout.
pub fn save_records_csv<P: AsRef<Path>>(records: &[ChainRecord], path: P) -> Result<()> {
    let Some(first) = records.first() else {
        return save_csv(&[], &Flattener::default(), path);
    };
    if let Some(other) = records.iter().find(|r| r.layout != first.layout) {
        return Err(BnnError::config(format!(
            "records with different layouts ({} vs {} entries) cannot share one CSV file",
            first.layout.len(),
            other.layout.len()
        )));
    }
    let chains: Vec<Chain> = records.iter().map(|r| r.chain.clone()).collect();
    save_csv(&chains, &first.layout, path)
}
