//! Prepare command implementation

use anyhow::Result;
use cascade_core::experiment::{self, CodeRequest};
use clap::Args;
use serde_json::json;
use std::path::PathBuf;

use super::LogArgs;

/// Set up the workfolder, code and final configuration of an experiment
#[derive(Args, Debug)]
pub struct PrepareArgs {
    /// Experiment directory
    path: PathBuf,

    /// Run against the working tree of code_root (the default)
    #[arg(long, conflicts_with = "commit")]
    raw: bool,

    /// Run against a snapshot of code_root at this revision
    #[arg(long, value_name = "REV")]
    commit: Option<String>,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    log: LogArgs,
}

/// Execute the prepare command
pub fn execute(args: PrepareArgs) -> Result<()> {
    args.log.init();

    let request = if args.raw {
        CodeRequest::Raw
    } else {
        CodeRequest::from_revision(args.commit.as_deref())
    };
    let prepared = experiment::prepare(&args.path, &request)?;

    if args.json {
        let output = json!({
            "experiment": prepared.experiment,
            "projectRoot": prepared.project_root,
            "workfolder": prepared.workfolder,
            "symlink": prepared.symlink,
            "codeRoot": prepared.code_root,
            "outputPrefix": prepared.output_prefix,
            "outputDir": prepared.output_dir,
            "finalConfig": prepared.final_config,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Experiment:    {}", prepared.experiment.display());
        println!("Project root:  {}", prepared.project_root.display());
        println!("Workfolder:    {}", prepared.workfolder.display());
        println!("Code root:     {}", prepared.code_root.display());
        println!("Output dir:    {}", prepared.output_dir.display());
        println!("Final config:  {}", prepared.final_config.display());
    }
    Ok(())
}
