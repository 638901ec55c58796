//! Fragment loading: mapping files and raw script files found on a trail
//!
//! Mapping fragments are YAML (`cfg.yml` / `cfg.yaml`) or TOML (`cfg.toml`).
//! Both are normalised to a JSON object so the rest of the pipeline works on a
//! single value model. A key repeated at one nesting level of one file is a
//! load error rather than a silent overwrite.

use super::error::ConfigError;
use super::merge::deep_merge_maps;
use super::trail::Trail;
use serde::de::{self, DeserializeSeed, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Number, Value};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Nested string-keyed mapping
pub type Mapping = Map<String, Value>;

/// One level's mapping contents, pre-merge
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// Level number on the trail, shallowest is 0
    pub level: usize,
    /// Files that contributed, in load order
    pub sources: Vec<PathBuf>,
    /// Parsed contents
    pub values: Mapping,
}

/// Mapping fragments keyed by level number
pub type LevelFragments = BTreeMap<usize, Fragment>;

/// Raw script text keyed by level number, paired with its file
pub type LevelScripts = BTreeMap<usize, (PathBuf, String)>;

/// Load every recognised mapping file on the trail.
///
/// Level numbers are taken from `numbering`, which is usually the full trail
/// `trail` was cut from, so fragments from differently cut trails line up.
/// When a level lists several recognised files they are merged in the order
/// given by `filenames`, later files winning.
pub fn load(
    trail: &Trail,
    numbering: &Trail,
    filenames: &[&str],
) -> Result<LevelFragments, ConfigError> {
    let mut fragments = LevelFragments::new();
    for (_, level) in trail.shallow_first() {
        let Some(number) = numbering.level_of(&level.dir) else {
            continue;
        };
        for filename in filenames {
            if !level.contains(filename) {
                continue;
            }
            let path = level.dir.join(filename);
            let values = load_mapping_file(&path)?;
            debug!(level = number, path = %path.display(), keys = values.len(), "Loaded fragment");
            let fragment = fragments.entry(number).or_insert_with(|| Fragment {
                level: number,
                sources: Vec::new(),
                values: Mapping::new(),
            });
            fragment.sources.push(path);
            fragment.values = deep_merge_maps(std::mem::take(&mut fragment.values), values);
        }
    }
    Ok(fragments)
}

/// Read the script fragment `filename` on every level that lists it, as plain text
pub fn load_scripts(
    trail: &Trail,
    numbering: &Trail,
    filename: &str,
) -> Result<LevelScripts, ConfigError> {
    let mut scripts = LevelScripts::new();
    for (_, level) in trail.shallow_first() {
        if !level.contains(filename) {
            continue;
        }
        let Some(number) = numbering.level_of(&level.dir) else {
            continue;
        };
        let path = level.dir.join(filename);
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::io(&path, e))?;
        scripts.insert(number, (path, text));
    }
    Ok(scripts)
}

/// Load a single mapping file, dispatching on its extension
pub fn load_mapping_file(path: &Path) -> Result<Mapping, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => parse_toml(&text, path),
        _ => parse_yaml(&text, path),
    }
}

/// Parse YAML text into a mapping, rejecting duplicate keys.
///
/// An empty document yields an empty mapping, never null.
pub fn parse_yaml(text: &str, path: &Path) -> Result<Mapping, ConfigError> {
    if text.trim().is_empty() {
        return Ok(Mapping::new());
    }
    let duplicate = RefCell::new(None);
    let seed = StrictSeed {
        duplicate: &duplicate,
        prefix: String::new(),
    };
    let parsed = seed.deserialize(serde_yaml::Deserializer::from_str(text));
    if let Some(key) = duplicate.into_inner() {
        return Err(ConfigError::DuplicateKey {
            path: path.to_path_buf(),
            key,
        });
    }
    let value = parsed.map_err(|e| ConfigError::Yaml {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    into_mapping(value, path)
}

/// Parse TOML text into a mapping
pub fn parse_toml(text: &str, path: &Path) -> Result<Mapping, ConfigError> {
    let table: toml::Table = toml::from_str(text).map_err(|e| {
        if e.message().contains("duplicate key") {
            ConfigError::DuplicateKey {
                path: path.to_path_buf(),
                key: backticked(e.message()).unwrap_or_else(|| "?".to_string()),
            }
        } else {
            ConfigError::Toml {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })?;
    let value = serde_json::to_value(table).map_err(|e| ConfigError::Yaml {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    into_mapping(value, path)
}

fn into_mapping(value: Value, path: &Path) -> Result<Mapping, ConfigError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Mapping::new()),
        _ => Err(ConfigError::NotAMapping {
            path: path.to_path_buf(),
        }),
    }
}

fn backticked(message: &str) -> Option<String> {
    let start = message.find('`')? + 1;
    let len = message[start..].find('`')?;
    Some(message[start..start + len].to_string())
}

/// Deserializes any self-describing input into a JSON value, failing on the
/// first key repeated within one mapping. The offending dotted key is left in
/// `duplicate` so the caller can report it without parsing error text.
struct StrictSeed<'a> {
    duplicate: &'a RefCell<Option<String>>,
    prefix: String,
}

impl<'a> StrictSeed<'a> {
    fn child(&self, key: &str) -> StrictSeed<'a> {
        let prefix = if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{key}", self.prefix)
        };
        StrictSeed {
            duplicate: self.duplicate,
            prefix,
        }
    }
}

impl<'de> DeserializeSeed<'de> for StrictSeed<'_> {
    type Value = Value;

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> Result<Value, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for StrictSeed<'_> {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a configuration value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Number(v.into()))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        Ok(Value::Number(v.into()))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        // NaN and infinities have no JSON number form
        Ok(Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(v.to_string())))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: de::Deserializer<'de>>(self, d: D) -> Result<Value, D::Error> {
        d.deserialize_any(self)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::new();
        let mut index = 0usize;
        while let Some(item) = seq.next_element_seed(self.child(&index.to_string()))? {
            items.push(item);
            index += 1;
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut out = Mapping::new();
        while let Some(key) = map.next_key::<Value>()? {
            let key = key_to_string(key).map_err(de::Error::custom)?;
            if out.contains_key(&key) {
                let child = self.child(&key);
                *self.duplicate.borrow_mut() = Some(child.prefix);
                return Err(de::Error::custom(format!("duplicate key \"{key}\"")));
            }
            let value = map.next_value_seed(self.child(&key))?;
            out.insert(key, value);
        }
        Ok(Value::Object(out))
    }
}

fn key_to_string(key: Value) -> Result<String, String> {
    match key {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok("null".to_string()),
        other => Err(format!("unsupported mapping key {other}")),
    }
}
