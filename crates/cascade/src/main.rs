//! cascade - cascading experiment configuration and code snapshots
//!
//! A thin CLI over `cascade-core`: resolve an experiment's configuration,
//! materialise a pinned code snapshot, or prepare an experiment for a runner.

use clap::Parser;

mod commands;

use commands::Cli;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.execute() {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
