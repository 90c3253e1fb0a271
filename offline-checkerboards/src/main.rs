use clap::Parser;
use eyre::Result;

use offline_checkerboards::{Cli, Command, run_cal, run_undistort};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let _tracing_guard = env_tracing_logger::initiate_logging(env_tracing_logger::LogOptions {
        log_file: cli.log_file.clone().map(Into::into),
        ..Default::default()
    })
    .map_err(|e| eyre::eyre!("failed to start logging: {e}"))?;

    match cli.command {
        Command::Calibrate(args) => {
            let summary = run_cal(args)?;
            tracing::debug!("{summary:?}");
        }
        Command::Undistort(args) => {
            run_undistort(args)?;
        }
    }
    Ok(())
}
