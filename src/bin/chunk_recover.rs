use anyhow::{bail, Result};
use clap::Parser;
use recover_kit::chunk_recover::{recover_chunk_tree, ChunkRecoverOutcome};
use recover_kit::device::check_mounted;
use recover_kit::error::RecoverError;
use std::process::ExitCode;

/// Recover the chunk tree by scanning the devices one by one.
///
/// Each member device of the filesystem should be specified on the
/// command line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Params {
    /// Assume an answer of `yes' to all questions
    #[arg(short = 'y')]
    yes: bool,
    /// Verbose mode
    #[arg(short = 'v')]
    verbose: bool,
    #[clap(required = true)]
    devices: Vec<std::path::PathBuf>,
}

fn run(args: &Params) -> Result<ChunkRecoverOutcome, RecoverError> {
    recover_chunk_tree(&args.devices, args.verbose, args.yes)
}

fn check_busy(args: &Params) -> Result<()> {
    for device in &args.devices {
        if check_mounted(device)? {
            bail!("the device is busy");
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Params::parse();
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Warn
        })
        .init();

    if let Err(err) = check_busy(&args) {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    match run(&args) {
        Ok(ChunkRecoverOutcome::Rebuilt) => {
            println!("Recover the chunk tree successfully.");
            ExitCode::SUCCESS
        }
        Ok(ChunkRecoverOutcome::Healthy) => {
            println!("All chunks are healthy, no need to recover.");
            ExitCode::SUCCESS
        }
        Ok(ChunkRecoverOutcome::NothingToDo) => ExitCode::SUCCESS,
        Err(RecoverError::UserAbort) => {
            println!("Abort to rebuild the on-disk chunk tree.");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err}");
            println!("Fail to recover the chunk tree.");
            ExitCode::FAILURE
        }
    }
}
