use std::process::ExitCode;

use clap::Parser;
use log::{error, info};

use neuralupgrade::{cli::Cli, Neuralupgrade, NEURALUPGRADE_VERSION};
use neuralupgrade_api::error::{NeuralupgradeError, NeuralupgradeResultExt};

fn run(args: &Cli) -> Result<(), NeuralupgradeError> {
    info!("neuralupgrade version: {NEURALUPGRADE_VERSION}");

    Neuralupgrade::new(args)
        .message("Failed to initialize neuralupgrade")?
        .execute(&args.command)
        .message(format!("Failed to execute '{}' command", args.command))
}

fn main() -> ExitCode {
    let args = Cli::parse();

    if let Err(e) = env_logger::builder()
        .format_timestamp(None)
        .filter_level(args.verbosity)
        .filter_module("reqwest", args.verbosity.min(log::LevelFilter::Debug))
        .try_init()
    {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::from(1);
    }

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("neuralupgrade failed: {e:?}");
            ExitCode::from(2)
        }
    }
}
