//! Decoding of argument literals.
//!
//! Arguments typed on the command line are read as YAML flow scalars and
//! collections, which gives a forgiving superset of JSON: `null`, `~`, `true`,
//! `42`, `4.2`, `"quoted"`, `[a, 1]` and `{key: 1}` all decode to what they look
//! like, and bare words stay strings. A whole argument of `yes`, `no`, `on` or
//! `off` is a boolean as in YAML 1.1; inside collections those stay strings. The result is a [`serde_json::Value`]
//! because that is what goes on the wire.

use serde_json::{Map, Number, Value};
use serde_yaml::Value as Yaml;

/// Decode a raw argument string.
///
/// Never fails: anything that can't be read as a literal decodes to itself
/// as a string.
#[must_use]
pub fn parse_arg_value(raw: &str) -> Value {
    if let Some(b) = yaml11_bool(raw.trim()) {
        return Value::Bool(b);
    }

    serde_yaml::from_str::<Yaml>(raw)
        .ok()
        .and_then(yaml_to_json)
        .unwrap_or_else(|| Value::String(raw.to_owned()))
}

/// The YAML 1.1 boolean words YAML 1.2 reads as strings.
fn yaml11_bool(word: &str) -> Option<bool> {
    match word {
        "yes" | "Yes" | "YES" | "on" | "On" | "ON" => Some(true),
        "no" | "No" | "NO" | "off" | "Off" | "OFF" => Some(false),
        _ => None,
    }
}

/// Convert a YAML document into JSON.
///
/// Returns `None` for values JSON can't represent (non-finite floats).
pub(crate) fn yaml_to_json(yaml: Yaml) -> Option<Value> {
    let value = match yaml {
        Yaml::Null => Value::Null,
        Yaml::Bool(b) => Value::Bool(b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Number(i.into())
            } else if let Some(u) = n.as_u64() {
                Value::Number(u.into())
            } else {
                Value::Number(Number::from_f64(n.as_f64()?)?)
            }
        }
        Yaml::String(s) => Value::String(s),
        Yaml::Sequence(items) => Value::Array(
            items
                .into_iter()
                .map(yaml_to_json)
                .collect::<Option<Vec<_>>>()?,
        ),
        Yaml::Mapping(mapping) => {
            let mut object = Map::with_capacity(mapping.len());
            for (key, value) in mapping {
                object.insert(mapping_key(key)?, yaml_to_json(value)?);
            }
            Value::Object(object)
        }
        Yaml::Tagged(tagged) => yaml_to_json(tagged.value)?,
    };

    Some(value)
}

/// JSON objects only have string keys, scalar YAML keys are rendered.
fn mapping_key(key: Yaml) -> Option<String> {
    match key {
        Yaml::String(s) => Some(s),
        Yaml::Null => Some("null".to_owned()),
        Yaml::Bool(b) => Some(b.to_string()),
        Yaml::Number(n) => Some(n.to_string()),
        Yaml::Tagged(tagged) => mapping_key(tagged.value),
        Yaml::Sequence(_) | Yaml::Mapping(_) => None,
    }
}
