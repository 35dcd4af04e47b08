//! `watchdog-mux` binary entry point.

use std::process::ExitCode;

use clap::Parser;
use watchdog_mux::cli_app::{self, Cli};

fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli_app::run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("watchdog-mux: {err}");
            ExitCode::FAILURE
        }
    }
}
