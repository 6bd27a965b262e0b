//! Demo binary: trains a small regression network on synthetic data.

use clap::Parser;
use graphtrain::callbacks::{EarlyStopping, EarlyStoppingMode};
use graphtrain::config::{FitConfig, SavingFormat, TrainingContext, Verbosity, WritingMode};
use graphtrain::data::Dataset;
use graphtrain::history::Monitored;
use graphtrain::layers::{Activation, Dense, Input, Layer};
use graphtrain::losses::{Loss, LossKind};
use graphtrain::metrics::MetricKind;
use graphtrain::network::Network;
use graphtrain::optimizers::Optimizer;
use ndarray::Array;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use std::path::PathBuf;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "graphtrain: train a 4-8-3 regression network on synthetic data", long_about = None)]
struct Args {
    #[arg(long, default_value_t = 20)]
    epochs: usize,

    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    #[arg(long, default_value_t = 0.05)]
    learning_rate: f32,

    /// Number of synthetic examples
    #[arg(long, default_value_t = 256)]
    examples: usize,

    /// Log every batch, not only every epoch
    #[arg(short, long)]
    verbose: bool,

    /// Saves the trained network here (JSON config + SafeTensors weights)
    #[arg(long)]
    save_dir: Option<PathBuf>,
}

/// Targets are a fixed linear map of the features plus a sine term.
fn synthetic_dataset(examples: usize) -> graphtrain::error::Result<Dataset> {
    let features = Array::random((examples, 4), Uniform::new(-1.0f32, 1.0));
    let weights = ndarray::array![[0.5f32, -1.0, 0.25], [1.5, 0.0, -0.5], [-0.75, 0.5, 1.0], [0.0, 2.0, 0.5]];
    let mut labels = features.dot(&weights);
    labels.mapv_inplace(|v| v + 0.1 * v.sin());
    Dataset::new(features.into_dyn(), labels.into_dyn())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let verbosity = if args.verbose { Verbosity::Batches } else { Verbosity::Epochs };
    let ctx = TrainingContext::new(verbosity);

    let dataset = synthetic_dataset(args.examples)?.shuffle(42);
    let (train, validation) = dataset.split(0.8)?;

    let mut network = Network::sequential(
        "synthetic_regression",
        vec![
            Layer::new(Input::new(&[4])),
            Layer::new(Dense::new(8).with_activation(Activation::Relu)),
            Layer::new(Dense::new(3).with_activation(Activation::Linear)),
        ],
    )?;
    network.compile(
        Loss::new(LossKind::Mse),
        Optimizer::sgd(args.learning_rate)?,
        &[MetricKind::Mae],
        &ctx,
    )?;
    println!("{}", network.summary()?);

    let mut early_stopping = EarlyStopping::new(Monitored::ValLoss, 3)
        .with_mode(EarlyStoppingMode::Min)
        .with_min_delta(1e-4)?;
    let config = FitConfig::new(args.epochs, args.batch_size);
    let history = network.fit(&train, Some(&validation), &config, &mut [&mut early_stopping], &ctx)?;

    let result = network.evaluate(&validation, args.batch_size, &mut [], &ctx)?;
    println!(
        "epochs run: {}, validation loss: {:.5}, validation MAE: {:.5}",
        history.epoch_events().len(),
        result.loss,
        result.metric(MetricKind::Mae).unwrap_or(f64::NAN)
    );

    if let Some(dir) = args.save_dir {
        network.save(&dir, SavingFormat::JsonConfigSafeTensors, WritingMode::Override, true, &ctx)?;
    }
    network.close();
    Ok(())
}
