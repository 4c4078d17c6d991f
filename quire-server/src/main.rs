//! quire-server entry point.
//!
//! Parses arguments, initializes logging, and hands off to the command
//! implementations. Errors are printed to stderr with a non-zero exit.

mod args;
mod commands;
mod error;

use clap::Parser;

use crate::args::Cli;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = commands::run_command(cli.command, &cli.data_dir).await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
