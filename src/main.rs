//! Patch training binary.
//!
//! Selects a named experiment configuration from the static registry and runs
//! the optimization loop against the configured detector and dataset.
//!
//! # Usage
//!
//! ```bash
//! train-patch <MODE>
//! ```
//!
//! An unknown or missing mode prints the registered mode names and exits
//! non-zero.

use adv_patch::core::{LogSink, PatchConfig, init_tracing};
use adv_patch::data::PatchDataset;
use adv_patch::models::TinyYolo;
use adv_patch::trainer::PatchTrainer;
use adv_patch::utils::parse_device;
use clap::Parser;
use std::process::ExitCode;
use tracing::{error, info};

/// Command-line arguments for patch training.
#[derive(Parser)]
#[command(name = "train-patch")]
#[command(about = "Optimize a printable adversarial patch against an object detector")]
struct Args {
    /// Name of the experiment configuration to run.
    mode: Option<String>,

    /// Override the configured device (e.g. 'cpu', 'cuda', 'cuda:0').
    #[arg(short, long)]
    device: Option<String>,

    /// Override the configured output directory.
    #[arg(short, long)]
    output_dir: Option<std::path::PathBuf>,
}

fn run(args: Args) -> adv_patch::core::Result<()> {
    let mode = args.mode.ok_or_else(|| {
        adv_patch::core::AdvPatchError::config(format!(
            "a configuration mode is required; valid modes are: {}",
            PatchConfig::mode_names().join(", ")
        ))
    })?;
    let mut config = PatchConfig::for_mode(&mode)?;
    if let Some(device) = args.device {
        config.device = device;
    }
    if let Some(output_dir) = args.output_dir {
        config.output_dir = output_dir;
    }
    config.validate()?;

    let device = parse_device(&config.device)?;
    let detector = TinyYolo::load(
        &config.model_path,
        config.num_anchors,
        config.num_classes,
        &device,
    )?;
    let dataset = PatchDataset::open(
        &config.img_dir,
        &config.lab_dir,
        config.max_labels,
        config.img_size,
    )?;
    info!(mode = %mode, images = dataset.len(), "configuration loaded");

    let mut trainer = PatchTrainer::new(config, detector, LogSink)?;
    trainer.run(&dataset)?;
    Ok(())
}

fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("error: {err}");
            let mut source = std::error::Error::source(&err);
            while let Some(cause) = source {
                eprintln!("  caused by: {cause}");
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}
