use anyhow::{bail, Result};
use clap::Parser;
use recover_kit::device::check_mounted;
use recover_kit::super_recover::{print_recover_result, recover_bad_superblocks, RecoverStatus};
use std::process::ExitCode;

/// recover bad superblocks from good copies
///
/// Each member device of the filesystem should be specified on the
/// command line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Params {
    /// Verbose mode
    #[arg(short = 'v')]
    verbose: bool,
    #[clap(required = true)]
    devices: Vec<std::path::PathBuf>,
}

fn run(args: &Params) -> Result<RecoverStatus> {
    for device in &args.devices {
        if check_mounted(device)? {
            bail!("the device is busy");
        }
    }
    Ok(recover_bad_superblocks(&args.devices, args.verbose)?)
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

    match run(&args) {
        Ok(status) => {
            print_recover_result(status);
            match status {
                RecoverStatus::AllValid | RecoverStatus::AllFixed => ExitCode::SUCCESS,
                RecoverStatus::FatalFailed | RecoverStatus::BackupFailed => ExitCode::FAILURE,
            }
        }
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
