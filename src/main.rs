use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use pelican_trainer::logging::init_logging;
use pelican_trainer::training::{
    create_context, load_splits, CrossEntropyLoss, DataLoader, DataLoaderConfig, Dataset, SmoothingSchedule, Split,
    Trainer, TrainingConfig, TrainingOutcome,
};
use pelican_trainer::MlpClassifier;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pelican-trainer")]
#[command(about = "Resumable multi-worker classifier training", long_about = None)]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct RunArgs {
    /// Configuration file (JSON or YAML)
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override the run prefix
    #[arg(long)]
    prefix: Option<String>,

    /// Initial label smoothing, decayed linearly to zero over the run
    #[arg(long, default_value_t = 0.0)]
    label_smoothing: f64,
}

#[derive(Subcommand)]
enum Commands {
    /// Train, resuming from the latest checkpoint when present
    Train {
        #[command(flatten)]
        run: RunArgs,

        /// Start fresh even if a checkpoint exists
        #[arg(long)]
        no_load: bool,

        /// Do not write checkpoints
        #[arg(long)]
        no_save: bool,

        /// Number of epochs
        #[arg(long)]
        epochs: Option<usize>,

        /// Epochs without validation loss improvement before stopping
        #[arg(long)]
        patience: Option<usize>,

        /// Epochs starting a new learning rate cycle
        #[arg(long, value_delimiter = ',')]
        restart_epochs: Option<Vec<usize>>,

        /// Smoothing strength of minibatch metrics
        #[arg(long)]
        alpha: Option<f64>,

        /// Seed for initialization and shuffling
        #[arg(long)]
        seed: Option<u64>,

        /// Skip the final evaluation of the checkpoint slots
        #[arg(long)]
        no_eval: bool,
    },

    /// Evaluate the saved checkpoint slots
    Evaluate {
        #[command(flatten)]
        run: RunArgs,

        /// Splits to evaluate
        #[arg(long, value_delimiter = ',', default_value = "train,valid,test")]
        splits: Vec<Split>,

        /// Skip the best-loss and best-accuracy slots
        #[arg(long)]
        no_best: bool,

        /// Skip the latest slot
        #[arg(long)]
        no_final: bool,
    },

    /// Validate a configuration file
    ValidateConfig {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show system information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            run,
            no_load,
            no_save,
            epochs,
            patience,
            restart_epochs,
            alpha,
            seed,
            no_eval,
        } => {
            let mut config = load_run_config(&run)?;
            if no_load {
                config.checkpointing.load = false;
            }
            if no_save {
                config.checkpointing.save = false;
            }
            if let Some(epochs) = epochs {
                config.training.num_epochs = epochs;
            }
            if let Some(patience) = patience {
                config.training.patience = Some(patience);
            }
            if let Some(restarts) = restart_epochs {
                config.scheduler.restart_epochs = restarts;
            }
            if let Some(alpha) = alpha {
                config.training.alpha = alpha;
            }
            if let Some(seed) = seed {
                config.training.seed = seed;
            }
            config.validate().context("Invalid configuration after overrides")?;
            init_logging(cli.verbose, cli.quiet, cli.json_logs, config.distributed.rank)?;

            train(config, run.label_smoothing, !no_eval).await?;
        }

        Commands::Evaluate {
            run,
            splits,
            no_best,
            no_final,
        } => {
            let config = load_run_config(&run)?;
            init_logging(cli.verbose, cli.quiet, cli.json_logs, config.distributed.rank)?;

            let mut trainer = build_trainer(config, run.label_smoothing).await?;
            let report = trainer.evaluate(&splits, !no_best, !no_final).await?;
            if trainer.log_context().is_primary() {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }

        Commands::ValidateConfig { file } => {
            init_logging(cli.verbose, cli.quiet, cli.json_logs, 0)?;
            validate_config(file)?;
        }

        Commands::Info => {
            show_system_info();
        }
    }

    Ok(())
}

fn load_run_config(run: &RunArgs) -> Result<TrainingConfig> {
    let mut config = TrainingConfig::from_file(&run.config)
        .with_context(|| format!("Failed to load configuration file {}", run.config.display()))?;
    config.apply_env().context("Invalid distributed environment")?;
    if let Some(prefix) = &run.prefix {
        config.prefix = prefix.clone();
    }
    config.validate()?;
    Ok(config)
}

async fn build_trainer(config: TrainingConfig, label_smoothing: f64) -> Result<Trainer> {
    let device = Device::cuda_if_available(config.distributed.rank)?;
    let ctx = create_context(&config.distributed)
        .await
        .context("Failed to join the process group")?;
    let (rank, world_size) = (ctx.rank(), ctx.world_size());

    let datasets = load_splits(&config.data.data_dir, &device)
        .with_context(|| format!("Failed to load data from {}", config.data.data_dir.display()))?;
    let train_set = datasets
        .get(&Split::Train)
        .context("No training split")?;
    let input_dim: usize = train_set
        .field(&config.data.input_key)
        .with_context(|| format!("Training split has no '{}' tensor", config.data.input_key))?
        .dims()
        .iter()
        .skip(1)
        .product();

    let model = MlpClassifier::new(input_dim, &config.model, config.data.input_key.clone(), &device)?;
    info!(
        parameters = model.num_parameters(),
        input_dim,
        classes = config.model.num_classes,
        "Built MLP classifier"
    );

    let mut builder = Trainer::builder(config.clone())
        .model(Box::new(model))
        .context(ctx)
        .device(device);

    if label_smoothing > 0.0 {
        builder = builder.loss(Box::new(CrossEntropyLoss::with_smoothing(SmoothingSchedule {
            start: label_smoothing,
            end: 0.0,
            total_epochs: config.training.num_epochs,
        })));
    }

    for (split, dataset) in datasets {
        info!(split = split.name(), samples = dataset.len(), "Preparing loader");
        let dataset = Arc::new(dataset);
        let loader_config = DataLoaderConfig {
            batch_size: config.data.batch_size,
            shuffle: split == Split::Train && config.data.shuffle,
            drop_last: false,
            seed: config.training.seed,
        };
        builder = builder.loader(
            split,
            Box::new(DataLoader::sharded(dataset.clone(), loader_config.clone(), rank, world_size)),
        );
        if split != Split::Train {
            builder = builder.eval_loader(
                split,
                Box::new(DataLoader::new(
                    dataset,
                    DataLoaderConfig {
                        shuffle: false,
                        ..loader_config
                    },
                )),
            );
        }
    }

    Ok(builder.build()?)
}

async fn train(config: TrainingConfig, label_smoothing: f64, evaluate: bool) -> Result<()> {
    let mut trainer = build_trainer(config, label_smoothing).await?;

    trainer.load_checkpoint().await.context("Failed to load checkpoint")?;
    let outcome = trainer.train(None).await?;

    let summary = outcome.summary();
    match &outcome {
        TrainingOutcome::Completed(_) => info!(final_epoch = summary.final_epoch, "Training completed"),
        TrainingOutcome::EarlyStopped(_) => info!(final_epoch = summary.final_epoch, "Training stopped early"),
        TrainingOutcome::Pruned(_) => warn!(final_epoch = summary.final_epoch, "Training pruned"),
    }
    if let Some(best) = &summary.best_loss {
        info!(epoch = best.epoch, "Best validation loss record at epoch {}", best.epoch);
    }
    if let Some(best) = &summary.best_accuracy {
        info!(epoch = best.epoch, "Best validation accuracy record at epoch {}", best.epoch);
    }

    if evaluate {
        trainer
            .evaluate(&[Split::Train, Split::Valid, Split::Test], true, true)
            .await?;
    }
    Ok(())
}

fn validate_config(file: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", file.display());

    let config = TrainingConfig::from_file(&file)
        .with_context(|| format!("Failed to load configuration file {}", file.display()))?;

    println!("Configuration is valid");
    println!("  Prefix:          {}", config.prefix);
    println!("  Epochs:          {}", config.training.num_epochs);
    println!("  Batch size:      {}", config.data.batch_size);
    println!("  Optimizer:       {:?}", config.optimizer.optimizer_type);
    println!("  Scheduler:       {:?}", config.scheduler.scheduler_type);
    println!("  Restart epochs:  {:?}", config.scheduler.restart_epochs);
    println!("  Patience:        {:?}", config.training.patience);
    println!("  World size:      {}", config.distributed.world_size);
    Ok(())
}

fn show_system_info() {
    println!("pelican-trainer {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Features:");
    println!("  CUDA:       {}", cfg!(feature = "cuda"));
    println!("  Metal:      {}", cfg!(feature = "metal"));
    println!("  Accelerate: {}", cfg!(feature = "accelerate"));
    println!();
    println!("Devices:");
    println!("  CUDA available: {}", candle_core::utils::cuda_is_available());
    println!("  Metal available: {}", candle_core::utils::metal_is_available());
}
