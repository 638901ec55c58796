//! CLI command dispatch and execution

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

mod checkout;
mod prepare;
mod resolve;

/// cascade - cascading experiment configuration and code snapshots
#[derive(Parser, Debug)]
#[command(
    name = "cascade",
    version,
    about = "Cascading experiment configuration and reproducible code snapshots",
    long_about = "Resolve experiment configuration from fragments on the way up to the \
                  project root, and materialise pinned code snapshots on shared storage"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the resolved configuration of an experiment directory
    Resolve(resolve::ResolveArgs),

    /// Materialise a snapshot of a repository at a revision
    Checkout(checkout::CheckoutArgs),

    /// Set up the workfolder, code and final configuration of an experiment
    Prepare(prepare::PrepareArgs),
}

/// Options every command accepts
#[derive(Args, Debug, Clone)]
pub(crate) struct LogArgs {
    /// Log level (trace, debug, info, warn, error); defaults to CASCADE_LOG or info
    #[arg(long, value_name = "LEVEL")]
    log: Option<String>,
}

impl LogArgs {
    pub(crate) fn init(&self) {
        cascade_core::logging::init(self.log.as_deref());
    }
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> Result<()> {
        match self.command {
            Commands::Resolve(args) => resolve::execute(args),
            Commands::Checkout(args) => checkout::execute(args),
            Commands::Prepare(args) => prepare::execute(args),
        }
    }
}
