//! Script evaluation for `PY@` placeholders
//!
//! All script fragments and placeholder expressions on a trail are assembled
//! into one evaluation unit, shallowest level first, and executed once in a
//! fresh scope. The scope holds only the fixed builtins, `exp_path`, the
//! per-level `epath` and the `_updates` accumulator the placeholders write
//! into.

mod builtins;
mod interp;
pub mod lexer;
pub mod parser;
pub mod value;

pub use builtins::TAG_PREFIX;
pub use value::Value;

use crate::config::error::ConfigError;
use crate::config::fragment::LevelScripts;
use crate::config::scan::SubstitutionQuery;
use crate::config::trail::Trail;
use crate::retry::{Clock, RetryPolicy, SystemClock};
use interp::Interp;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Name of the accumulator placeholders write their results into
pub const UPDATES_VAR: &str = "_updates";

/// Errors from parsing or running an evaluation unit
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("line {line}: syntax error: {message}")]
    Parse { line: usize, message: String },

    #[error("line {line}: {message}")]
    Runtime { line: usize, message: String },
}

impl ScriptError {
    pub fn line(&self) -> usize {
        match self {
            ScriptError::Parse { line, .. } | ScriptError::Runtime { line, .. } => *line,
        }
    }
}

/// What scripts may ask of the surrounding project
pub trait Host: Sync {
    /// Workfolder holding the outputs of the experiment at `experiment`
    fn workfolder(&self, experiment: &Path) -> Result<PathBuf, String>;
}

/// Host for resolutions outside a project with launcher settings
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHost;

impl Host for NoHost {
    fn workfolder(&self, experiment: &Path) -> Result<PathBuf, String> {
        Err(format!(
            "cannot locate the workfolder of {}: no launcher settings available",
            experiment.display()
        ))
    }
}

/// Capabilities threaded through one execution
pub(crate) struct Context<'a> {
    pub host: &'a dyn Host,
    pub clock: &'a dyn Clock,
    pub tag_retry: RetryPolicy,
}

/// A line printed by a script
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Output {
    pub line: usize,
    pub text: String,
}

/// Assembled, not yet executed, evaluation unit
#[derive(Debug, Clone)]
pub struct EvaluationUnit {
    source: String,
    /// Trail level owning each source line (index 0 is line 1)
    line_levels: Vec<Option<usize>>,
    /// Placeholder key and the unit line that computes it
    keys: Vec<(String, usize)>,
}

impl EvaluationUnit {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Source with line numbers, as attached to evaluation errors
    pub fn numbered(&self) -> String {
        let width = self.line_levels.len().to_string().len();
        let mut out = String::new();
        for (i, line) in self.source.lines().enumerate() {
            let _ = writeln!(out, "{:>width$} | {line}", i + 1);
        }
        out
    }

    fn level_of_line(&self, line: usize) -> Option<usize> {
        line.checked_sub(1)
            .and_then(|i| self.line_levels.get(i).copied().flatten())
    }

    fn push_line(&mut self, text: &str, level: Option<usize>) -> usize {
        self.source.push_str(text);
        self.source.push('\n');
        self.line_levels.push(level);
        self.line_levels.len()
    }

    fn push_block(&mut self, text: &str, level: usize) {
        for line in text.lines() {
            self.push_line(line, Some(level));
        }
    }
}

/// Values computed for placeholders, in evaluation order
pub type Substitutions = Vec<(String, serde_json::Value)>;

/// Assembles and runs evaluation units
pub struct ScriptEvaluator<'a> {
    host: &'a dyn Host,
    clock: &'a dyn Clock,
    tag_retry: RetryPolicy,
}

impl Default for ScriptEvaluator<'static> {
    fn default() -> Self {
        static HOST: NoHost = NoHost;
        static CLOCK: SystemClock = SystemClock;
        ScriptEvaluator::new(&HOST, &CLOCK)
    }
}

impl<'a> ScriptEvaluator<'a> {
    pub fn new(host: &'a dyn Host, clock: &'a dyn Clock) -> Self {
        Self {
            host,
            clock,
            tag_retry: RetryPolicy::default(),
        }
    }

    /// Retry policy for the directory walk behind `tags()`
    pub fn with_tag_retry(mut self, policy: RetryPolicy) -> Self {
        self.tag_retry = policy;
        self
    }

    /// Build the evaluation unit.
    ///
    /// Level numbers in `scripts` and `queries` index `trail` shallowest
    /// first. Levels with neither a script nor a placeholder are skipped.
    pub fn assemble(
        &self,
        exp_path: &Path,
        trail: &Trail,
        scripts: &LevelScripts,
        queries: &[SubstitutionQuery],
    ) -> EvaluationUnit {
        let mut unit = EvaluationUnit {
            source: String::new(),
            line_levels: Vec::new(),
            keys: Vec::new(),
        };
        unit.push_line(&format!("exp_path = Path({})", quote(exp_path)), None);
        unit.push_line(&format!("{UPDATES_VAR} = {{}}"), None);

        for (number, level) in trail.shallow_first() {
            let script = scripts.get(&number);
            let level_queries: Vec<&SubstitutionQuery> =
                queries.iter().filter(|q| q.level == number).collect();
            if script.is_none() && level_queries.is_empty() {
                continue;
            }
            unit.push_line(
                &format!("# level {number}: {}", level.dir.display()),
                Some(number),
            );
            unit.push_line(&format!("epath = Path({})", quote(&level.dir)), Some(number));
            if let Some((path, text)) = script {
                unit.push_line(&format!("# {}", path.display()), Some(number));
                unit.push_block(text, number);
            }
            for q in level_queries {
                let line = unit.push_line(
                    &format!(
                        "{UPDATES_VAR}[{}] = ({})",
                        quote_str(&q.key),
                        q.expression.trim()
                    ),
                    Some(number),
                );
                unit.keys.push((q.key.clone(), line));
            }
        }
        unit
    }

    /// Run an assembled unit and collect the placeholder values.
    ///
    /// The working directory is restored afterwards, whatever the outcome.
    /// Printed output is logged on success and on failure.
    pub fn execute(&self, unit: &EvaluationUnit) -> Result<Substitutions, ConfigError> {
        let fail = |source: ScriptError| ConfigError::Evaluation {
            source,
            unit: unit.numbered(),
        };
        let program = parser::parse_program(&unit.source).map_err(fail)?;

        let _cwd = CwdGuard::capture();
        let mut interp = Interp::new(Context {
            host: self.host,
            clock: self.clock,
            tag_retry: self.tag_retry,
        });
        debug!(lines = unit.line_levels.len(), "Executing evaluation unit");
        let outcome = interp.run(&program);
        self.replay_output(unit, &interp.output);
        outcome.map_err(fail)?;

        let Some(Value::Dict(updates)) = interp.var(UPDATES_VAR) else {
            return Err(fail(ScriptError::Runtime {
                line: unit.line_levels.len(),
                message: format!("'{UPDATES_VAR}' is no longer a dict"),
            }));
        };
        let mut out = Substitutions::new();
        for (key, line) in &unit.keys {
            let Some(value) = updates.get(key) else {
                return Err(fail(ScriptError::Runtime {
                    line: *line,
                    message: format!("no value recorded for '{key}'"),
                }));
            };
            let json = value.to_json().map_err(|message| {
                fail(ScriptError::Runtime {
                    line: *line,
                    message,
                })
            })?;
            debug!(key = %key, value = %json, "Substituted");
            out.push((key.clone(), json));
        }
        Ok(out)
    }

    /// [`assemble`](Self::assemble) then [`execute`](Self::execute)
    pub fn evaluate(
        &self,
        exp_path: &Path,
        trail: &Trail,
        scripts: &LevelScripts,
        queries: &[SubstitutionQuery],
    ) -> Result<Substitutions, ConfigError> {
        let unit = self.assemble(exp_path, trail, scripts, queries);
        self.execute(&unit)
    }

    fn replay_output(&self, unit: &EvaluationUnit, output: &[Output]) {
        for Output { line, text } in output {
            let origin = match unit.level_of_line(*line) {
                Some(level) => format!("level {level}"),
                None => "prelude".to_string(),
            };
            for part in text.lines() {
                info!("[{origin}] {part}");
            }
        }
    }
}

/// Restores the working directory on drop
struct CwdGuard(Option<PathBuf>);

impl CwdGuard {
    fn capture() -> Self {
        Self(std::env::current_dir().ok())
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        if let Some(dir) = &self.0
            && std::env::current_dir().ok().as_ref() != Some(dir)
            && let Err(e) = std::env::set_current_dir(dir)
        {
            tracing::warn!(path = %dir.display(), "Could not restore working directory: {e}");
        }
    }
}

fn quote(p: &Path) -> String {
    quote_str(&p.to_string_lossy())
}

fn quote_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}
