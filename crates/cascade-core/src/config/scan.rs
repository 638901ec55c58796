//! Detection of `PY@<expression>` placeholders

use super::error::ConfigError;
use super::fragment::Mapping;
use super::merge::{flatten, get_dotted};
use serde_json::Value;

/// A leaf value asking for `expression` to be evaluated and substituted at `key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstitutionQuery {
    /// Dotted key of the placeholder
    pub key: String,
    /// Expression text following the marker
    pub expression: String,
    /// Trail level (shallowest is 0) whose fragment introduced the placeholder
    pub level: usize,
}

const MARKERS: [&str; 2] = ["PY@", "py@"];

/// Split a placeholder string into its expression, if it is one
pub fn template_expression(value: &str) -> Option<&str> {
    MARKERS.iter().find_map(|m| value.strip_prefix(m))
}

/// Collect placeholders from a mapping attributed to `level`.
///
/// With `allow`, only keys in the allow-list are returned. A marker with no
/// expression after it is an authoring error, as is a placeholder under a key
/// containing a literal `.`, whose dotted path would name a different leaf.
pub fn scan(
    map: &Mapping,
    level: usize,
    allow: Option<&[String]>,
) -> Result<Vec<SubstitutionQuery>, ConfigError> {
    let mut queries = Vec::new();
    for (key, value) in flatten(map) {
        let Value::String(text) = value else {
            continue;
        };
        let Some(expression) = template_expression(text) else {
            continue;
        };
        if let Some(allow) = allow
            && !allow.iter().any(|k| k == &key)
        {
            continue;
        }
        if expression.trim().is_empty() {
            return Err(ConfigError::MalformedTemplate {
                key,
                level,
                reason: "has no expression after the marker",
            });
        }
        if !get_dotted(map, &key).is_some_and(|leaf| std::ptr::eq(leaf, value)) {
            return Err(ConfigError::MalformedTemplate {
                key,
                level,
                reason: "is under a key containing '.'",
            });
        }
        queries.push(SubstitutionQuery {
            key,
            expression: expression.to_string(),
            level,
        });
    }
    Ok(queries)
}
