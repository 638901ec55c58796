//! Orchestration: trail, fragments, merge, placeholders, substitution

use super::error::ConfigError;
use super::fragment::{self, LevelFragments, LevelScripts, Mapping};
use super::merge::{flatten, get_dotted, merge_all, set_dotted};
use super::scan::{SubstitutionQuery, scan};
use super::trail::{self, Trail};
use super::{
    FRAGMENT_FILES, FRAGMENT_STOPPER, ROOT_PREFIX, ROOT_SENTINEL, SCRIPT_FILE, SCRIPT_STOPPER,
};
use crate::paths::normalize;
use crate::script::{ScriptEvaluator, Substitutions};
use serde_json::Value;
use std::fmt::Write as _;
use std::iter::once;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What to look for while resolving, and how
#[derive(Debug, Clone)]
pub struct ResolverOptions {
    /// Stop filename marking the project root
    pub sentinel: String,
    /// Mapping fragment filenames, lowest priority first within a level
    pub fragment_files: Vec<String>,
    /// Script fragment filename
    pub script_file: String,
    /// Secondary stopper for mapping fragments
    pub fragment_stopper: String,
    /// Secondary stopper for script fragments
    pub script_stopper: String,
    /// Baseline merged below every fragment
    pub defaults: Mapping,
    /// Only evaluate placeholders at these dotted keys
    pub allow: Option<Vec<String>>,
    /// Rewrite `@ROOT` prefixed strings against the project root
    pub substitute_root: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            sentinel: ROOT_SENTINEL.to_string(),
            fragment_files: FRAGMENT_FILES.iter().map(|s| s.to_string()).collect(),
            script_file: SCRIPT_FILE.to_string(),
            fragment_stopper: FRAGMENT_STOPPER.to_string(),
            script_stopper: SCRIPT_STOPPER.to_string(),
            defaults: Mapping::new(),
            allow: None,
            substitute_root: true,
        }
    }
}

impl ResolverOptions {
    pub fn with_defaults(mut self, defaults: Mapping) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_allow(mut self, keys: Vec<String>) -> Self {
        self.allow = Some(keys);
        self
    }

    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = sentinel.into();
        self
    }
}

/// A finished resolution. Read-only once returned.
#[derive(Debug, Clone)]
pub struct Resolution {
    config: Mapping,
    trail: Trail,
    project_root: Option<PathBuf>,
    fragments: LevelFragments,
    scripts: LevelScripts,
    substitutions: Substitutions,
}

impl Resolution {
    /// Final configuration
    pub fn config(&self) -> &Mapping {
        &self.config
    }

    pub fn into_config(self) -> Mapping {
        self.config
    }

    /// Full trail, deepest first
    pub fn trail(&self) -> &Trail {
        &self.trail
    }

    /// Directory holding the sentinel, if one was found
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Mapping fragments by level
    pub fn fragments(&self) -> &LevelFragments {
        &self.fragments
    }

    /// Script fragments by level
    pub fn scripts(&self) -> &LevelScripts {
        &self.scripts
    }

    /// Placeholder values spliced into the configuration
    pub fn substitutions(&self) -> &Substitutions {
        &self.substitutions
    }
}

/// Resolves experiment directories with fixed options and evaluator
pub struct ConfigResolver<'a> {
    options: ResolverOptions,
    evaluator: ScriptEvaluator<'a>,
}

impl ConfigResolver<'static> {
    pub fn new(options: ResolverOptions) -> Self {
        Self {
            options,
            evaluator: ScriptEvaluator::default(),
        }
    }
}

impl<'a> ConfigResolver<'a> {
    pub fn with_evaluator(options: ResolverOptions, evaluator: ScriptEvaluator<'a>) -> Self {
        Self { options, evaluator }
    }

    pub fn options(&self) -> &ResolverOptions {
        &self.options
    }

    /// Resolve the configuration of the experiment at `start`
    pub fn resolve(&self, start: &Path) -> Result<Resolution, ConfigError> {
        let o = &self.options;
        let full = trail::walk(start, &o.sentinel)?;
        let exp_path = full
            .head()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| start.to_path_buf());
        let project_root = full
            .levels()
            .last()
            .filter(|l| l.contains(&o.sentinel))
            .map(|l| l.dir.clone());
        if project_root.is_none() {
            warn!(start = %exp_path.display(), sentinel = %o.sentinel, "No project root marker found, using every directory up to /");
        }

        let fragment_trail = full.cut_at(&o.fragment_stopper);
        let script_trail = full.cut_at(&o.script_stopper);
        let names: Vec<&str> = o.fragment_files.iter().map(String::as_str).collect();
        let fragments = fragment::load(&fragment_trail, &full, &names)?;
        let scripts = fragment::load_scripts(&script_trail, &full, &o.script_file)?;
        info!(
            levels = full.len(),
            fragments = fragments.len(),
            scripts = scripts.len(),
            "Collected configuration fragments"
        );

        let mut config = merge_all(once(&o.defaults).chain(fragments.values().map(|f| &f.values)));
        let queries = self.attributed_queries(&config, &fragments)?;

        let substitutions = if queries.is_empty() {
            Substitutions::new()
        } else {
            info!(count = queries.len(), "Evaluating placeholders");
            let subs = self
                .evaluator
                .evaluate(&exp_path, &full, &scripts, &queries)?;
            for (key, value) in &subs {
                set_dotted(&mut config, key, value.clone());
            }
            subs
        };

        if o.substitute_root
            && let Some(root) = &project_root
        {
            replace_root_prefix(&mut config, root);
        }

        let resolution = Resolution {
            config,
            trail: full,
            project_root,
            fragments,
            scripts,
            substitutions,
        };
        debug!("Resolved configuration:\n{}", provenance(&resolution));
        Ok(resolution)
    }

    /// Placeholders that survive the merge, attributed to the level that set them.
    ///
    /// A placeholder counts only if no deeper source defines the same key;
    /// baseline defaults are attributed to level 0.
    fn attributed_queries(
        &self,
        merged: &Mapping,
        fragments: &LevelFragments,
    ) -> Result<Vec<SubstitutionQuery>, ConfigError> {
        let allow = self.options.allow.as_deref();
        let sources: Vec<(usize, &Mapping)> = once((0, &self.options.defaults))
            .chain(fragments.values().map(|f| (f.level, &f.values)))
            .collect();

        let mut queries = Vec::new();
        for (i, (level, values)) in sources.iter().enumerate() {
            for query in scan(values, *level, allow)? {
                let overridden = sources[i + 1..]
                    .iter()
                    .any(|(_, deeper)| get_dotted(deeper, &query.key).is_some());
                if overridden || get_dotted(merged, &query.key) != get_dotted(values, &query.key) {
                    debug!(key = %query.key, level, "Placeholder overridden by a deeper level");
                    continue;
                }
                queries.push(query);
            }
        }
        Ok(queries)
    }
}

/// Resolve `start` with default options
pub fn resolve(start: &Path) -> Result<Resolution, ConfigError> {
    ConfigResolver::new(ResolverOptions::default()).resolve(start)
}

/// Rewrite string leaves starting with `@ROOT` to absolute paths under `root`.
///
/// Returns the `(key, new value)` pairs that were changed.
pub fn replace_root_prefix(map: &mut Mapping, root: &Path) -> Vec<(String, String)> {
    let updates: Vec<(String, String)> = flatten(map)
        .into_iter()
        .filter_map(|(key, value)| {
            let rest = value.as_str()?.strip_prefix(ROOT_PREFIX)?;
            let joined = format!("{}{rest}", root.display());
            let replaced = normalize(Path::new(&joined)).to_string_lossy().into_owned();
            Some((key, replaced))
        })
        .collect();
    if !updates.is_empty() {
        let mut listing = String::new();
        for (key, replaced) in &updates {
            let _ = writeln!(listing, "    {key} <- {replaced}");
        }
        info!("{ROOT_PREFIX} replacements:\n{}", listing.trim_end());
    }
    for (key, replaced) in &updates {
        set_dotted(map, key, Value::String(replaced.clone()));
    }
    updates
}

/// Table of every final key, the level that last set it and its value.
///
/// Keys no fragment sets (baseline defaults) show `?` as their source.
/// Stars repeat the level number so deep overrides stand out.
pub fn provenance(resolution: &Resolution) -> String {
    let flat = flatten(&resolution.config);
    let source_of = |key: &str| {
        resolution
            .fragments
            .values()
            .rev()
            .find(|f| get_dotted(&f.values, key).is_some())
            .map(|f| f.level)
    };
    let key_width = flat.iter().map(|(k, _)| k.len()).max().unwrap_or(0).max(3);
    let star_width = resolution.fragments.keys().max().copied().unwrap_or(0);

    let mut out = String::new();
    let _ = writeln!(out, "{:<key_width$} {:<6} {:<star_width$} value", "key", "source", "");
    let _ = writeln!(out, "{:<key_width$} {:<6} {:<star_width$} --", "--", "--", "");
    for (key, value) in flat {
        let (level, stars) = match source_of(&key) {
            Some(level) => (level.to_string(), "*".repeat(level)),
            None => ("?".to_string(), String::new()),
        };
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let _ = writeln!(out, "{key:<key_width$} {level:<6} {stars:<star_width$} {rendered}");
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    /// `root/_ROOT`, `root/a/b` with the given files per level
    fn project(files: &[(&str, &str)]) -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        fs::write(root.join(ROOT_SENTINEL), "").unwrap();
        fs::create_dir_all(root.join("a/b")).unwrap();
        for (rel, content) in files {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        (tmp, root)
    }

    fn as_value(map: &Mapping) -> Value {
        Value::Object(map.clone())
    }

    #[test]
    fn test_levels_merge_deeper_wins() {
        let (_tmp, root) = project(&[
            ("cfg.yml", "model: {depth: 10, width: 4}\nlr: 0.1\n"),
            ("a/cfg.yml", "model: {depth: 20}\n"),
            ("a/b/cfg.yml", "lr: 0.5\nname: run\n"),
        ]);
        let res = resolve(&root.join("a/b")).unwrap();
        assert_eq!(
            as_value(res.config()),
            json!({"model": {"depth": 20, "width": 4}, "lr": 0.5, "name": "run"})
        );
        assert_eq!(res.project_root(), Some(root.as_path()));
        assert_eq!(res.trail().len(), 3);
        assert!(res.substitutions().is_empty());
    }

    #[test]
    fn test_placeholders_evaluated() {
        let (_tmp, root) = project(&[(
            "a/cfg.yml",
            "x: py@1+1\ny: PY@len('abc')\nz: py1+1\n",
        )]);
        let res = resolve(&root.join("a/b")).unwrap();
        assert_eq!(res.config()["x"], json!(2));
        assert_eq!(res.config()["y"], json!(3));
        assert_eq!(res.config()["z"], json!("py1+1"));
    }

    #[test]
    fn test_overridden_placeholder_is_not_evaluated() {
        let (_tmp, root) = project(&[
            ("cfg.yml", "x: py@1/0\n"),
            ("a/b/cfg.yml", "x: 7\n"),
        ]);
        let res = resolve(&root.join("a/b")).unwrap();
        assert_eq!(res.config()["x"], json!(7));
    }

    #[test]
    fn test_placeholder_sees_scripts_up_to_its_level() {
        let (_tmp, root) = project(&[
            ("cfg.script", "base = 10\n"),
            ("a/cfg.script", "base = base + 1\n"),
            ("a/b/cfg.yml", "n: py@base * 2\nhere: py@epath.name\n"),
        ]);
        let res = resolve(&root.join("a/b")).unwrap();
        assert_eq!(res.config()["n"], json!(22));
        assert_eq!(res.config()["here"], json!("b"));
    }

    #[test]
    fn test_allow_list() {
        let (_tmp, root) = project(&[("cfg.yml", "a: py@1\nb: py@2\n")]);
        let resolver =
            ConfigResolver::new(ResolverOptions::default().with_allow(vec!["b".to_string()]));
        let res = resolver.resolve(&root.join("a/b")).unwrap();
        assert_eq!(res.config()["a"], json!("py@1"));
        assert_eq!(res.config()["b"], json!(2));
    }

    #[test]
    fn test_defaults_are_lowest_priority() {
        let (_tmp, root) = project(&[("a/cfg.yml", "k: {x: 1}\n")]);
        let defaults = json!({"k": {"x": 0, "y": 0}, "d": "py@3*3"});
        let resolver = ConfigResolver::new(
            ResolverOptions::default().with_defaults(defaults.as_object().cloned().unwrap()),
        );
        let res = resolver.resolve(&root.join("a/b")).unwrap();
        assert_eq!(
            as_value(res.config()),
            json!({"k": {"x": 1, "y": 0}, "d": 9})
        );
    }

    #[test]
    fn test_fragment_stopper() {
        let (_tmp, root) = project(&[
            ("cfg.yml", "top: 1\n"),
            ("a/_ROOT_CFG", ""),
            ("a/cfg.yml", "mid: 2\n"),
        ]);
        let res = resolve(&root.join("a/b")).unwrap();
        assert_eq!(as_value(res.config()), json!({"mid": 2}));
        // numbering stays relative to the full trail
        assert_eq!(res.fragments().keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_root_prefix_replaced() {
        let (_tmp, root) = project(&[("cfg.yml", "data: '@ROOT/data/../set'\n")]);
        let res = resolve(&root.join("a")).unwrap();
        assert_eq!(
            res.config()["data"],
            json!(root.join("set").to_string_lossy())
        );
    }

    #[test]
    fn test_duplicate_key_fails() {
        let (_tmp, root) = project(&[("a/cfg.yml", "k: 1\nk: 2\n")]);
        assert!(matches!(
            resolve(&root.join("a/b")),
            Err(ConfigError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn test_mapping_only_resolution_is_idempotent() {
        let (_tmp, root) = project(&[
            ("cfg.yml", "a: {b: [1, 2], c: x}\n"),
            ("a/cfg.toml", "t = 1\n[a]\nc = 'y'\n"),
        ]);
        let first = serde_json::to_string(resolve(&root.join("a/b")).unwrap().config()).unwrap();
        let second = serde_json::to_string(resolve(&root.join("a/b")).unwrap().config()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_provenance_table() {
        let (_tmp, root) = project(&[("cfg.yml", "a: 1\n"), ("a/b/cfg.yml", "b: 2\n")]);
        let defaults = json!({"z": 0});
        let resolver = ConfigResolver::new(
            ResolverOptions::default().with_defaults(defaults.as_object().cloned().unwrap()),
        );
        let table = provenance(&resolver.resolve(&root.join("a/b")).unwrap());
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].starts_with("key"));
        assert!(lines.iter().any(|l| l.starts_with("z ") && l.contains(" ? ")));
        assert!(lines.iter().any(|l| l.starts_with("b ") && l.contains("**")));
    }

    #[test]
    fn test_without_root_marker_walks_to_fs_root() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("cfg.yml"), "k: 1\n").unwrap();
        let resolver = ConfigResolver::new(ResolverOptions::default().with_sentinel("_NO_SUCH_MARKER"));
        let res = resolver.resolve(tmp.path()).unwrap();
        assert_eq!(res.config()["k"], json!(1));
        assert!(res.project_root().is_none());
    }
}
