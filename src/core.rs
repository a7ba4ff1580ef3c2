//! Independent chains on the rayon thread pool.

use crate::chain::{Chain, ChainRecord};
use crate::data::{DataProvider, Dataset, FullData, Minibatch};
use crate::error::{BnnError, Result};
use crate::model::{ModelConfig, ModelGraph};
use crate::sampler::{AnyKernel, Kernel, Sampler, SamplerConfig, Stage};
use crate::target::{GradientTarget, Posterior};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::debug;
use ndarray::Array1;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Builds the target, kernel and starting point of one chain.
///
/// Called once per chain, on the worker thread that runs it, with the chain
/// index and the chain's generator (seeded with `seed + index`). Whatever is
/// drawn from the generator here is not reused by the sampler.
pub trait ChainFactory<G, K>: Sync {
    fn build(&self, index: usize, rng: &mut SmallRng) -> Result<(G, K, Array1<f64>)>;
}

impl<G, K, F> ChainFactory<G, K> for F
where
    F: Fn(usize, &mut SmallRng) -> Result<(G, K, Array1<f64>)> + Sync,
{
    fn build(&self, index: usize, rng: &mut SmallRng) -> Result<(G, K, Array1<f64>)> {
        self(index, rng)
    }
}

fn build_sampler<G, K, F>(
    factory: &F,
    index: usize,
    burn_in: usize,
    num_samples: usize,
    seed: u64,
) -> Result<Sampler<G, K>>
where
    G: GradientTarget,
    K: Kernel,
    F: ChainFactory<G, K>,
{
    let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(index as u64));
    let (target, kernel, initial) = factory.build(index, &mut rng)?;
    Sampler::new(target, kernel, initial, burn_in, num_samples, rng.gen())
}

/// Runs `num_chains` chains in parallel and returns them in index order.
///
/// The first error aborts the whole run.
pub fn run_chains<G, K, F>(
    num_chains: usize,
    burn_in: usize,
    num_samples: usize,
    seed: u64,
    factory: F,
) -> Result<Vec<Chain>>
where
    G: GradientTarget,
    K: Kernel,
    F: ChainFactory<G, K>,
{
    (0..num_chains)
        .into_par_iter()
        .map(|i| {
            let mut sampler = build_sampler(&factory, i, burn_in, num_samples, seed)?;
            sampler.run()?;
            debug!("chain {i} finished");
            Ok(sampler.into_chain())
        })
        .collect()
}

/// Like [`run_chains`], with one progress bar per chain.
pub fn run_chains_progress<G, K, F>(
    num_chains: usize,
    burn_in: usize,
    num_samples: usize,
    seed: u64,
    factory: F,
) -> Result<Vec<Chain>>
where
    G: GradientTarget,
    K: Kernel,
    F: ChainFactory<G, K>,
{
    let multi = MultiProgress::new();
    let pb_style = ProgressStyle::default_bar()
        .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .map_err(|e| BnnError::config(e.to_string()))?
        .progress_chars("##-");

    (0..num_chains)
        .into_par_iter()
        .map(|i| {
            let mut sampler = build_sampler(&factory, i, burn_in, num_samples, seed)?;
            let pb = multi.add(ProgressBar::new(sampler.num_iterations() as u64));
            pb.set_prefix(format!("Chain {i}"));
            pb.set_style(pb_style.clone());

            let mut divergences = 0usize;
            while sampler.stage() != Stage::Finished {
                let divergent = sampler.step()?.divergent;
                divergences += usize::from(divergent);
                pb.inc(1);
                if sampler.iteration() % 50 == 0 {
                    pb.set_message(format!("divergent={divergences}"));
                }
            }
            pb.finish_with_message(format!("Done! divergent={divergences}"));
            Ok(sampler.into_chain())
        })
        .collect()
}

/// Samples the posterior of `model` given `data`, one record per chain.
///
/// Each chain starts from its own prior draw. The stochastic-gradient kernels
/// see minibatches of `sampler.batch_size` rows when it is set; the other
/// kernels always evaluate the full dataset, and a `batch_size` on them is
/// rejected by [`SamplerConfig::validate`].
pub fn sample_posterior(
    model: &ModelConfig,
    sampler: &SamplerConfig,
    data: &Dataset,
    progress: bool,
) -> Result<Vec<ChainRecord>> {
    sampler.validate()?;
    let reference = ModelGraph::new(model.clone())?;
    reference.check_data(data.x(), data.y())?;
    let layout = reference.flattener();

    let factory = |i: usize,
                   rng: &mut SmallRng|
     -> Result<(Posterior<Box<dyn DataProvider>>, AnyKernel, Array1<f64>)> {
        let graph = ModelGraph::from_prior(model.clone(), rng)?;
        let minibatch = sampler
            .batch_size
            .filter(|_| sampler.kind.is_stochastic_gradient());
        let provider: Box<dyn DataProvider> = match minibatch {
            Some(size) => Box::new(Minibatch::new(
                data.clone(),
                size,
                sampler.seed.wrapping_add(i as u64),
            )?),
            None => Box::new(FullData::new(data.clone())),
        };
        let initial = Array1::from(graph.to_vec());
        let posterior = Posterior::new(graph, provider)?;
        Ok((posterior, sampler.kernel()?, initial))
    };

    let chains = if progress {
        run_chains_progress(
            sampler.num_chains,
            sampler.burn_in,
            sampler.num_samples,
            sampler.seed,
            factory,
        )?
    } else {
        run_chains(
            sampler.num_chains,
            sampler.burn_in,
            sampler.num_samples,
            sampler.seed,
            factory,
        )?
    };

    let name = sampler.kernel()?.name();
    Ok(chains
        .into_iter()
        .map(|chain| ChainRecord::new(name, model.clone(), sampler.clone(), layout.clone(), chain))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hmc::Hmc;
    use crate::layer::Activation;
    use crate::sampler::SamplerKind;
    use ndarray::Array2;

    struct Gaussian;

    impl GradientTarget for Gaussian {
        fn dim(&self) -> usize {
            2
        }

        fn logp_and_grad(&self, q: &Array1<f64>, grad: &mut Array1<f64>) -> Result<f64> {
            grad.assign(&q.mapv(|x| -x));
            Ok(-0.5 * q.dot(q))
        }
    }

    fn factory(_i: usize, rng: &mut SmallRng) -> Result<(Gaussian, Hmc, Array1<f64>)> {
        let initial = Array1::from(vec![rng.gen::<f64>(), rng.gen::<f64>()]);
        Ok((Gaussian, Hmc::new(0.3, 5)?, initial))
    }

    #[test]
    fn test_chains_are_independent_and_reproducible() {
        let chains = run_chains(3, 10, 20, 5, factory).unwrap();
        assert_eq!(chains.len(), 3);
        for chain in &chains {
            assert_eq!(chain.len(), 30);
        }
        assert_ne!(chains[0].positions(), chains[1].positions());

        let again = run_chains(3, 10, 20, 5, factory).unwrap();
        assert_eq!(chains, again);
    }

    #[test]
    fn test_factory_errors_abort_the_run() {
        let failing = |i: usize, rng: &mut SmallRng| {
            if i == 1 {
                Err(BnnError::config("no chain 1"))
            } else {
                factory(i, rng)
            }
        };
        assert!(run_chains(2, 0, 5, 0, failing).is_err());
    }

    #[test]
    fn test_posterior_records_carry_the_layout() {
        let model = ModelConfig::bnn(&[1, 3, 1], Activation::Tanh, Activation::Identity);
        let sampler = SamplerConfig::new(SamplerKind::Hmc)
            .step_size(0.01)
            .num_samples(5)
            .burn_in(2)
            .num_chains(2);
        let x = Array2::from_shape_fn((10, 1), |(i, _)| i as f64 / 10.0);
        let y = x.mapv(f64::sin);
        let data = Dataset::new(x, y).unwrap();

        let records = sample_posterior(&model, &sampler, &data, false).unwrap();
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.sampler, "hmc");
            assert_eq!(record.layout.len(), model.num_params());
            assert_eq!(record.chain.len(), 7);
        }
        assert_ne!(records[0].chain.positions()[0], records[1].chain.positions()[0]);
    }

    #[test]
    fn test_minibatch_posterior_runs() {
        let model = ModelConfig::bnn(&[1, 2, 1], Activation::Relu, Activation::Identity);
        let sampler = SamplerConfig::new(SamplerKind::Sgld)
            .step_size(1e-4)
            .num_samples(5)
            .batch_size(4);
        let x = Array2::from_shape_fn((12, 1), |(i, _)| i as f64);
        let data = Dataset::new(x.clone(), x).unwrap();
        let records = sample_posterior(&model, &sampler, &data, false).unwrap();
        assert_eq!(records[0].chain.len(), 5);
    }

    #[test]
    fn test_accept_step_kernels_see_the_full_dataset() {
        let model = ModelConfig::bnn(&[1, 3, 1], Activation::Tanh, Activation::Identity);
        let x = Array2::from_shape_fn((40, 1), |(i, _)| i as f64 / 20.0 - 1.0);
        let y = x.mapv(f64::sin);
        let data = Dataset::new(x, y).unwrap();

        let batched = SamplerConfig::new(SamplerKind::Hmc)
            .step_size(0.01)
            .num_samples(5)
            .batch_size(4);
        assert!(matches!(
            sample_posterior(&model, &batched, &data, false),
            Err(BnnError::Configuration(_))
        ));

        let sampler = SamplerConfig::new(SamplerKind::Hmc).step_size(0.01).num_samples(20);
        let records = sample_posterior(&model, &sampler, &data, false).unwrap();
        let graph = ModelGraph::new(model).unwrap();
        let chain = &records[0].chain;
        for (position, diag) in chain.positions().iter().zip(chain.diagnostics()) {
            let full = graph.log_prob_at(position, data.x(), data.y()).unwrap();
            assert!((diag.log_prob - full).abs() < 1e-8 * full.abs().max(1.0));
        }
    }
}
