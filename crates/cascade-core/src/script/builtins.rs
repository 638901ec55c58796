//! The fixed global scope: builtin functions, methods and path attributes

use super::Output;
use super::interp::{Interp, MAX_SEQUENCE_LEN, binary};
use super::parser::BinOp;
use super::value::Value;
use crate::paths;
use indexmap::IndexMap;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

const BUILTINS: [&str; 21] = [
    "Path", "str", "int", "float", "bool", "len", "range", "min", "max", "sum", "abs", "sorted",
    "print", "join", "exists", "basename", "dirname", "abspath", "chdir", "grab", "tags",
];

/// Prefix of tag directory names picked up by `tags()`
pub const TAG_PREFIX: &str = "T@";

pub(crate) fn lookup(name: &str) -> Option<&'static str> {
    BUILTINS.iter().copied().find(|b| *b == name)
}

/// Positional and keyword arguments of one call
struct Args {
    func: String,
    pos: Vec<Value>,
    kw: Vec<(String, Value)>,
}

impl Args {
    fn new(func: &str, pos: Vec<Value>, kw: Vec<(String, Value)>) -> Self {
        Self {
            func: func.to_string(),
            pos,
            kw,
        }
    }

    /// Bind to parameter `names`; the first `required` must be present
    fn bind(self, names: &[&str], required: usize) -> Result<Vec<Option<Value>>, String> {
        let func = self.func;
        if self.pos.len() > names.len() {
            return Err(format!(
                "{func}() takes at most {} arguments ({} given)",
                names.len(),
                self.pos.len()
            ));
        }
        let mut slots: Vec<Option<Value>> = vec![None; names.len()];
        for (slot, v) in slots.iter_mut().zip(self.pos) {
            *slot = Some(v);
        }
        for (name, v) in self.kw {
            let Some(i) = names.iter().position(|n| *n == name) else {
                return Err(format!("{func}() got an unexpected keyword argument '{name}'"));
            };
            if slots[i].is_some() {
                return Err(format!("{func}() got multiple values for argument '{name}'"));
            }
            slots[i] = Some(v);
        }
        if let Some(missing) = names[..required]
            .iter()
            .zip(&slots)
            .find_map(|(n, s)| s.is_none().then_some(n))
        {
            return Err(format!("{func}() missing required argument '{missing}'"));
        }
        Ok(slots)
    }

    /// Only positional arguments, any number
    fn variadic(self) -> Result<Vec<Value>, String> {
        if let Some((name, _)) = self.kw.first() {
            return Err(format!(
                "{}() got an unexpected keyword argument '{name}'",
                self.func
            ));
        }
        Ok(self.pos)
    }

    fn one(self) -> Result<Value, String> {
        let mut slots = self.bind(&["x"], 1)?;
        Ok(slots.remove(0).unwrap_or(Value::None))
    }

    fn none(self) -> Result<(), String> {
        self.bind(&[], 0).map(|_| ())
    }
}

fn path_of(v: &Value, func: &str) -> Result<PathBuf, String> {
    match v {
        Value::Str(s) => Ok(PathBuf::from(s)),
        Value::Path(p) => Ok(p.clone()),
        other => Err(format!(
            "{func}() expected str or Path, not {}",
            other.type_name()
        )),
    }
}

fn str_of<'v>(v: &'v Value, func: &str) -> Result<&'v str, String> {
    match v {
        Value::Str(s) => Ok(s),
        other => Err(format!("{func}() expected str, not {}", other.type_name())),
    }
}

fn iterable(v: Value, func: &str) -> Result<Vec<Value>, String> {
    match v {
        Value::List(items) => Ok(items),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Dict(map) => Ok(map.into_keys().map(Value::Str).collect()),
        other => Err(format!(
            "{func}(): '{}' object is not iterable",
            other.type_name()
        )),
    }
}

fn lossy(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

fn absolute(p: &Path) -> Result<PathBuf, String> {
    paths::absolute(p).map_err(|e| format!("cannot read working directory: {e}"))
}

/// Like `Path.resolve()`: canonical when the path exists, lexical otherwise
fn resolve(p: &Path) -> Result<PathBuf, String> {
    match p.canonicalize() {
        Ok(c) => Ok(c),
        Err(_) => absolute(p),
    }
}

fn sort_values(items: &mut [Value], func: &str) -> Result<(), String> {
    let mut failed = None;
    items.sort_by(|a, b| {
        a.compare(b).unwrap_or_else(|| {
            failed.get_or_insert_with(|| {
                format!(
                    "{func}(): cannot order '{}' and '{}'",
                    a.type_name(),
                    b.type_name()
                )
            });
            Ordering::Equal
        })
    });
    match failed {
        Some(message) => Err(message),
        None => Ok(()),
    }
}

fn extreme(args: Vec<Value>, func: &str, want: Ordering) -> Result<Value, String> {
    let items = if args.len() == 1 {
        iterable(args.into_iter().next().unwrap_or(Value::None), func)?
    } else {
        args
    };
    let mut iter = items.into_iter();
    let Some(mut best) = iter.next() else {
        return Err(format!("{func}() arg is an empty sequence"));
    };
    for item in iter {
        let ord = item
            .compare(&best)
            .ok_or_else(|| format!("{func}(): cannot compare '{}'", item.type_name()))?;
        if ord == want {
            best = item;
        }
    }
    Ok(best)
}

/// Call the builtin `name`
pub(crate) fn call(
    interp: &mut Interp<'_>,
    name: &str,
    pos: Vec<Value>,
    kw: Vec<(String, Value)>,
) -> Result<Value, String> {
    let args = Args::new(name, pos, kw);
    match name {
        "Path" => {
            let parts = args.variadic()?;
            let mut out = PathBuf::new();
            for part in &parts {
                out.push(path_of(part, "Path")?);
            }
            if parts.is_empty() {
                out.push(".");
            }
            Ok(Value::Path(out))
        }
        "str" => {
            let mut a = args.bind(&["x"], 0)?;
            Ok(Value::Str(a.remove(0).map(|v| v.to_string()).unwrap_or_default()))
        }
        "int" => match args.one()? {
            v @ Value::Int(_) => Ok(v),
            Value::Bool(b) => Ok(Value::Int(i64::from(b))),
            Value::Float(f) if f.is_finite() => {
                let t = f.trunc();
                // i64::MAX as f64 rounds up to 2^63
                if t >= -(2f64.powi(63)) && t < 2f64.powi(63) {
                    Ok(Value::Int(t as i64))
                } else {
                    Err("integer overflow".to_string())
                }
            }
            Value::Str(s) => s
                .trim()
                .replace('_', "")
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| format!("invalid literal for int(): '{s}'")),
            other => Err(format!("int() cannot convert {}", other.repr())),
        },
        "float" => match args.one()? {
            Value::Str(s) => {
                let t = s.trim().to_ascii_lowercase();
                let parsed = match t.as_str() {
                    "inf" | "+inf" | "infinity" => Ok(f64::INFINITY),
                    "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
                    "nan" => Ok(f64::NAN),
                    _ => t.parse::<f64>(),
                };
                parsed
                    .map(Value::Float)
                    .map_err(|_| format!("could not convert string to float: '{s}'"))
            }
            other => other
                .as_f64()
                .map(Value::Float)
                .ok_or_else(|| format!("float() cannot convert {}", other.repr())),
        },
        "bool" => {
            let mut a = args.bind(&["x"], 0)?;
            Ok(Value::Bool(a.remove(0).is_some_and(|v| v.truthy())))
        }
        "len" => match args.one()? {
            Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::List(items) => Ok(Value::Int(items.len() as i64)),
            Value::Dict(map) => Ok(Value::Int(map.len() as i64)),
            other => Err(format!(
                "object of type '{}' has no len()",
                other.type_name()
            )),
        },
        "range" => {
            let nums = args
                .variadic()?
                .iter()
                .map(|v| v.as_i64().ok_or("range() expects integers"))
                .collect::<Result<Vec<i64>, _>>()?;
            let (start, stop, step) = match nums[..] {
                [stop] => (0, stop, 1),
                [start, stop] => (start, stop, 1),
                [start, stop, step] => (start, stop, step),
                _ => return Err("range() expects 1 to 3 arguments".to_string()),
            };
            if step == 0 {
                return Err("range() arg 3 must not be zero".to_string());
            }
            let (span, step) = (i128::from(stop) - i128::from(start), i128::from(step));
            let count = if span.signum() == step.signum() {
                (span.abs() + step.abs() - 1) / step.abs()
            } else {
                0
            };
            if count > MAX_SEQUENCE_LEN as i128 {
                return Err(format!("range() result too large (limit is {MAX_SEQUENCE_LEN} items)"));
            }
            // Every element lies between start and stop, so the narrowing cannot fail
            let out = (0..count)
                .filter_map(|k| i64::try_from(i128::from(start) + k * step).ok())
                .map(Value::Int)
                .collect();
            Ok(Value::List(out))
        }
        "min" => extreme(args.variadic()?, "min", Ordering::Less),
        "max" => extreme(args.variadic()?, "max", Ordering::Greater),
        "sum" => {
            let mut a = args.bind(&["iterable", "start"], 1)?;
            let start = a.remove(1).unwrap_or(Value::Int(0));
            let items = iterable(a.remove(0).unwrap_or(Value::None), "sum")?;
            items
                .into_iter()
                .try_fold(start, |acc, item| binary(BinOp::Add, acc, item))
        }
        "abs" => match args.one()? {
            Value::Int(n) => n
                .checked_abs()
                .map(Value::Int)
                .ok_or_else(|| "integer overflow".to_string()),
            Value::Bool(b) => Ok(Value::Int(i64::from(b))),
            Value::Float(f) => Ok(Value::Float(f.abs())),
            other => Err(format!(
                "bad operand type for abs(): '{}'",
                other.type_name()
            )),
        },
        "sorted" => {
            let mut a = args.bind(&["iterable", "reverse"], 1)?;
            let reverse = a.remove(1).is_some_and(|v| v.truthy());
            let mut items = iterable(a.remove(0).unwrap_or(Value::None), "sorted")?;
            sort_values(&mut items, "sorted")?;
            if reverse {
                items.reverse();
            }
            Ok(Value::List(items))
        }
        "print" => {
            let mut sep = " ".to_string();
            for (k, v) in &args.kw {
                match (k.as_str(), v) {
                    ("sep", Value::Str(s)) => sep = s.clone(),
                    _ => return Err(format!("print() got an unexpected keyword argument '{k}'")),
                }
            }
            let text = args
                .pos
                .iter()
                .map(Value::to_string)
                .collect::<Vec<_>>()
                .join(&sep);
            let line = interp.line();
            interp.output.push(Output { line, text });
            Ok(Value::None)
        }
        "join" => {
            let parts = args.variadic()?;
            let mut out = PathBuf::new();
            for part in &parts {
                out.push(path_of(part, "join")?);
            }
            Ok(Value::Str(lossy(&out)))
        }
        "exists" => {
            let p = path_of(&args.one()?, "exists")?;
            Ok(Value::Bool(p.exists()))
        }
        "basename" => {
            let p = path_of(&args.one()?, "basename")?;
            Ok(Value::Str(
                p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            ))
        }
        "dirname" => {
            let p = path_of(&args.one()?, "dirname")?;
            Ok(Value::Str(p.parent().map(lossy).unwrap_or_default()))
        }
        "abspath" => {
            let p = path_of(&args.one()?, "abspath")?;
            Ok(Value::Str(lossy(&absolute(&p)?)))
        }
        "chdir" => {
            let p = path_of(&args.one()?, "chdir")?;
            std::env::set_current_dir(&p)
                .map_err(|e| format!("chdir({}): {e}", p.display()))?;
            debug!(path = %p.display(), "Script changed working directory");
            Ok(Value::None)
        }
        "grab" => {
            let mut a = args.bind(&["path", "rel_path", "commit", "must_exist"], 1)?;
            let path = path_of(&a[0].take().unwrap_or(Value::None), "grab")?;
            let rel_path = a[1].take().filter(|v| *v != Value::None);
            let commit = a[2].take().filter(|v| *v != Value::None);
            let must_exist = a[3].take().is_none_or(|v| v.truthy());
            grab(interp, &path, rel_path, commit, must_exist)
        }
        "tags" => {
            let root = path_of(&args.one()?, "tags")?;
            tags(interp, &root)
        }
        other => Err(format!("name '{other}' is not defined")),
    }
}

fn grab(
    interp: &Interp<'_>,
    path: &Path,
    rel_path: Option<Value>,
    commit: Option<Value>,
    must_exist: bool,
) -> Result<Value, String> {
    let item = match rel_path {
        None => resolve(path)?,
        Some(rel_path) => {
            let rel_path = path_of(&rel_path, "grab")?;
            let workfolder = interp.ctx.host.workfolder(path)?;
            let revision_dir = match commit {
                Some(commit) => workfolder.join(str_of(&commit, "grab")?),
                None => first_subfolder(&workfolder)?,
            };
            revision_dir.join(rel_path)
        }
    };
    if must_exist && !item.exists() {
        return Err(format!("could not grab from {}", item.display()));
    }
    info!(item = %item.display(), "Grabbed");
    Ok(Value::Str(lossy(&item)))
}

fn first_subfolder(workfolder: &Path) -> Result<PathBuf, String> {
    let entries = std::fs::read_dir(workfolder)
        .map_err(|e| format!("cannot list workfolder {}: {e}", workfolder.display()))?;
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs.into_iter()
        .next()
        .ok_or_else(|| format!("no revision subfolders in {}", workfolder.display()))
}

fn tags(interp: &Interp<'_>, root: &Path) -> Result<Value, String> {
    let found: Vec<(String, PathBuf)> = interp
        .ctx
        .tag_retry
        .run(interp.ctx.clock, "Tag discovery", |_| {
            let mut found = Vec::new();
            for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy();
                if entry.file_type().is_dir() && name.starts_with(TAG_PREFIX) {
                    let parent = entry.path().parent().unwrap_or(root).to_path_buf();
                    found.push((name.into_owned(), parent));
                }
            }
            Ok::<_, walkdir::Error>(found)
        })
        .map_err(|(e, attempts)| {
            format!(
                "tags({}): listing failed after {attempts} attempts: {e}",
                root.display()
            )
        })?;

    let mut map = IndexMap::new();
    for (name, parent) in &found {
        map.insert(name.clone(), Value::Path(parent.clone()));
    }
    if map.len() != found.len() {
        let listing: Vec<String> = found
            .iter()
            .map(|(name, parent)| format!("{name:25} <- {}", parent.display()))
            .collect();
        return Err(format!("tags must be unique:\n{}", listing.join("\n")));
    }
    if found.is_empty() {
        info!(root = %root.display(), "No tags found");
    } else {
        info!(root = %root.display(), count = found.len(), "Tags found");
    }
    Ok(Value::Dict(map))
}

/// Attribute access: path properties directly, everything else as a bound method
pub(crate) fn attribute(recv: Value, name: &str) -> Result<Value, String> {
    if let Value::Path(p) = &recv {
        let os = |s: Option<&std::ffi::OsStr>| {
            Value::Str(s.map(|s| s.to_string_lossy().into_owned()).unwrap_or_default())
        };
        match name {
            "name" => return Ok(os(p.file_name())),
            "stem" => return Ok(os(p.file_stem())),
            "suffix" => {
                return Ok(Value::Str(
                    p.extension()
                        .map(|e| format!(".{}", e.to_string_lossy()))
                        .unwrap_or_default(),
                ));
            }
            "parent" => {
                return Ok(Value::Path(
                    p.parent().map(Path::to_path_buf).unwrap_or_else(|| p.clone()),
                ));
            }
            _ => {}
        }
    }
    if has_method(&recv, name) {
        Ok(Value::Method(Box::new(recv), name.to_string()))
    } else {
        Err(format!(
            "'{}' object has no attribute '{name}'",
            recv.type_name()
        ))
    }
}

fn has_method(recv: &Value, name: &str) -> bool {
    let methods: &[&str] = match recv {
        Value::Path(_) => &["exists", "resolve", "joinpath", "is_dir", "is_file"],
        Value::Str(_) => &[
            "upper",
            "lower",
            "strip",
            "replace",
            "split",
            "startswith",
            "endswith",
            "format",
        ],
        Value::Dict(_) => &["get", "keys", "values", "items"],
        _ => &[],
    };
    methods.contains(&name)
}

/// Call method `name` on `recv`
pub(crate) fn call_method(
    recv: Value,
    name: &str,
    pos: Vec<Value>,
    kw: Vec<(String, Value)>,
) -> Result<Value, String> {
    let args = Args::new(name, pos, kw);
    match (recv, name) {
        (Value::Path(p), "exists") => {
            args.none()?;
            Ok(Value::Bool(p.exists()))
        }
        (Value::Path(p), "is_dir") => {
            args.none()?;
            Ok(Value::Bool(p.is_dir()))
        }
        (Value::Path(p), "is_file") => {
            args.none()?;
            Ok(Value::Bool(p.is_file()))
        }
        (Value::Path(p), "resolve") => {
            args.none()?;
            Ok(Value::Path(resolve(&p)?))
        }
        (Value::Path(mut p), "joinpath") => {
            for part in &args.variadic()? {
                p.push(path_of(part, "joinpath")?);
            }
            Ok(Value::Path(p))
        }
        (Value::Str(s), "upper") => {
            args.none()?;
            Ok(Value::Str(s.to_uppercase()))
        }
        (Value::Str(s), "lower") => {
            args.none()?;
            Ok(Value::Str(s.to_lowercase()))
        }
        (Value::Str(s), "strip") => {
            let mut a = args.bind(&["chars"], 0)?;
            Ok(Value::Str(match a.remove(0) {
                Some(Value::Str(chars)) => s.trim_matches(|c| chars.contains(c)).to_string(),
                _ => s.trim().to_string(),
            }))
        }
        (Value::Str(s), "replace") => {
            let a = args.bind(&["old", "new"], 2)?;
            let old = str_of(a[0].as_ref().unwrap_or(&Value::None), "replace")?.to_string();
            let new = str_of(a[1].as_ref().unwrap_or(&Value::None), "replace")?.to_string();
            Ok(Value::Str(s.replace(&old, &new)))
        }
        (Value::Str(s), "split") => {
            let mut a = args.bind(&["sep"], 0)?;
            let parts: Vec<Value> = match a.remove(0) {
                Some(Value::Str(sep)) if !sep.is_empty() => {
                    s.split(sep.as_str()).map(|x| Value::Str(x.to_string())).collect()
                }
                Some(Value::Str(_)) => return Err("split(): empty separator".to_string()),
                _ => s.split_whitespace().map(|x| Value::Str(x.to_string())).collect(),
            };
            Ok(Value::List(parts))
        }
        (Value::Str(s), "startswith") => {
            let v = args.one()?;
            Ok(Value::Bool(s.starts_with(str_of(&v, "startswith")?)))
        }
        (Value::Str(s), "endswith") => {
            let v = args.one()?;
            Ok(Value::Bool(s.ends_with(str_of(&v, "endswith")?)))
        }
        (Value::Str(s), "format") => format(&s, &args.variadic()?).map(Value::Str),
        (Value::Dict(map), "get") => {
            let mut a = args.bind(&["key", "default"], 1)?;
            let default = a.remove(1).unwrap_or(Value::None);
            let key = a.remove(0).unwrap_or(Value::None);
            Ok(match key {
                Value::Str(k) => map.get(&k).cloned().unwrap_or(default),
                _ => default,
            })
        }
        (Value::Dict(map), "keys") => {
            args.none()?;
            Ok(Value::List(map.into_keys().map(Value::Str).collect()))
        }
        (Value::Dict(map), "values") => {
            args.none()?;
            Ok(Value::List(map.into_values().collect()))
        }
        (Value::Dict(map), "items") => {
            args.none()?;
            Ok(Value::List(
                map.into_iter()
                    .map(|(k, v)| Value::List(vec![Value::Str(k), v]))
                    .collect(),
            ))
        }
        (recv, name) => Err(format!(
            "'{}' object has no attribute '{name}'",
            recv.type_name()
        )),
    }
}

/// `'{} and {}'.format(a, b)`; also `{0}` indices and `{{`/`}}` escapes
fn format(template: &str, args: &[Value]) -> Result<String, String> {
    let mut out = String::new();
    let mut next = 0;
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut field = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => field.push(ch),
                        None => return Err("format(): unmatched '{'".to_string()),
                    }
                }
                let index = if field.is_empty() {
                    next += 1;
                    next - 1
                } else {
                    field
                        .parse::<usize>()
                        .map_err(|_| format!("format(): unsupported field '{{{field}}}'"))?
                };
                let arg = args
                    .get(index)
                    .ok_or_else(|| format!("format(): missing argument {index}"))?;
                out.push_str(&arg.to_string());
            }
            c => out.push(c),
        }
    }
    Ok(out)
}
