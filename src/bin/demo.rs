//! Fits a BNN to data simulated from a prior draw of the same network, then
//! reports sampler diagnostics and the fit of the posterior-mean prediction.
//!
//! Usage: `demo [experiment.json] [output-dir]`. Without a file the default
//! experiment is used: a `[2, 10, 1]` tanh network, 1000 observations and HMC.

use bnn_mcmc::config::ExperimentConfig;
use bnn_mcmc::core::sample_posterior;
use bnn_mcmc::stats::{rhat, ChainSummary};
use bnn_mcmc::{Chain, ModelGraph};
use ndarray::{Array2, Axis};
use std::error::Error;
use std::path::PathBuf;

/// Posterior predictive mean over every `thin`-th post-warm-up draw.
fn predict(
    graph: &mut ModelGraph,
    chain: &Chain,
    x: &Array2<f64>,
    thin: usize,
) -> Result<Array2<f64>, Box<dyn Error>> {
    let draws = chain.draws()?;
    let mut sum = Array2::<f64>::zeros((x.nrows(), graph.no_out()));
    let mut count = 0usize;
    for draw in draws.axis_iter(Axis(0)).step_by(thin.max(1)) {
        graph.load_vec(&draw.to_vec())?;
        sum += &graph.forward(x)?;
        count += 1;
    }
    Ok(sum / count.max(1) as f64)
}

fn mse(a: &Array2<f64>, b: &Array2<f64>) -> f64 {
    (a - b).mapv(|v| v * v).mean().unwrap_or(f64::NAN)
}

fn main() -> Result<(), Box<dyn Error>> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => ExperimentConfig::load(path)?,
        None => {
            let mut config = ExperimentConfig::default();
            config.sampler = config
                .sampler
                .step_size(0.01)
                .num_steps(5)
                .target_accept(0.8)
                .burn_in(200)
                .num_samples(200)
                .num_chains(2);
            config
        }
    };
    let out_dir = PathBuf::from(args.next().unwrap_or_else(|| ".".to_string()));

    let (truth, data) = config.data.generate(&config.model)?;
    println!(
        "Simulated {} observations from a model with {} parameters",
        data.len(),
        truth.dim()
    );

    let records = sample_posterior(&config.model, &config.sampler, &data, true)?;

    let baseline = mse(data.y(), &Array2::zeros(data.y().raw_dim()));
    let oracle = mse(data.y(), &truth.forward(data.x())?);
    println!("MSE of zero prediction: {baseline:.4}, of the true model: {oracle:.4}");

    for (i, record) in records.iter().enumerate() {
        println!("Chain {i}: {}", ChainSummary::new(&record.chain));
        let mut graph = record.rebuild_model()?;
        let prediction = predict(&mut graph, &record.chain, data.x(), 10)?;
        println!(
            "Chain {i}: MSE of posterior mean prediction {:.4}",
            mse(data.y(), &prediction)
        );

        let path = out_dir.join(format!("bnn-chain-{i}.json"));
        record.save(&path)?;
        println!("Chain {i}: saved to {}", path.display());
    }

    if records.len() > 1 {
        let chains: Vec<Chain> = records.iter().map(|r| r.chain.clone()).collect();
        let r = rhat(&chains)?;
        let worst = r.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        println!("Max R-hat over {} parameters: {worst:.3}", r.len());
    }

    #[cfg(feature = "csv")]
    {
        let path = out_dir.join("bnn-chains.csv");
        bnn_mcmc::io::csv::save_records_csv(&records, &path)?;
        println!("Wrote {}", path.display());
    }

    Ok(())
}
