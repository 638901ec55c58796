//! Resolve command implementation

use anyhow::{Context, Result};
use cascade_core::config::merge::get_dotted;
use cascade_core::config::{ConfigResolver, LauncherHost, ResolverOptions, provenance};
use cascade_core::{ScriptEvaluator, SystemClock};
use clap::Args;
use serde_json::Value;
use std::path::PathBuf;

use super::LogArgs;

/// Print the resolved configuration of an experiment directory
#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Experiment directory
    path: PathBuf,

    /// Only evaluate placeholders at these dotted keys (repeatable)
    #[arg(long = "key", value_name = "KEY")]
    keys: Vec<String>,

    /// Print a single dotted key instead of the whole configuration
    #[arg(long, value_name = "KEY")]
    get: Option<String>,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// Print where each key came from instead of the configuration
    #[arg(long, conflicts_with_all = ["json", "get"])]
    explain: bool,

    #[command(flatten)]
    log: LogArgs,
}

/// Execute the resolve command
pub fn execute(args: ResolveArgs) -> Result<()> {
    args.log.init();

    let mut options = ResolverOptions::default();
    if !args.keys.is_empty() {
        options = options.with_allow(args.keys.clone());
    }
    let host = LauncherHost;
    let clock = SystemClock;
    let resolver = ConfigResolver::with_evaluator(options, ScriptEvaluator::new(&host, &clock));
    let resolution = resolver
        .resolve(&args.path)
        .with_context(|| format!("resolving {}", args.path.display()))?;

    if args.explain {
        println!("{}", provenance(&resolution));
        return Ok(());
    }

    let value = match &args.get {
        Some(key) => get_dotted(resolution.config(), key)
            .cloned()
            .with_context(|| format!("key '{key}' is not set"))?,
        None => Value::Object(resolution.into_config()),
    };
    if args.json {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print!("{}", serde_yaml::to_string(&value)?);
    }
    Ok(())
}
