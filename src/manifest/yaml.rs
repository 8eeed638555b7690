//! YAML decoding on top of yaml-rust2
//!
//! Documents are converted to `serde_json::Value` so YAML and JSON manifests
//! flow through the same descriptor type.

use serde_json::{Map, Number, Value};
use yaml_rust2::{Yaml, YamlLoader};

/// Error decoding a YAML document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YamlError(String);

impl std::fmt::Display for YamlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for YamlError {}

/// Decode every document in `input`.
///
/// A stream holding only comments or whitespace yields no documents. Explicit
/// `null` documents are returned as `Value::Null`; callers decide whether to
/// skip them.
pub fn decode_documents(input: &str) -> Result<Vec<Value>, YamlError> {
    let docs = YamlLoader::load_from_str(input).map_err(|e| YamlError(e.to_string()))?;
    docs.into_iter().map(yaml_to_json).collect()
}

/// Convert a yaml_rust2::Yaml value to serde_json::Value
pub(crate) fn yaml_to_json(yaml: Yaml) -> Result<Value, YamlError> {
    match yaml {
        Yaml::Null => Ok(Value::Null),
        Yaml::Boolean(b) => Ok(Value::Bool(b)),
        Yaml::Integer(i) => Ok(Value::Number(i.into())),
        Yaml::Real(s) => {
            let f: f64 = s
                .parse()
                .map_err(|e: std::num::ParseFloatError| YamlError(format!("{}: {}", s, e)))?;
            // NaN and infinities have no JSON form
            Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| YamlError(format!("float {} cannot be represented in JSON", s)))
        }
        Yaml::String(s) => Ok(Value::String(s)),
        Yaml::Array(arr) => arr
            .into_iter()
            .map(yaml_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Yaml::Hash(map) => map
            .into_iter()
            .map(|(k, v)| {
                let key = match k {
                    Yaml::String(s) => s,
                    Yaml::Integer(i) => i.to_string(),
                    Yaml::Real(r) => r,
                    Yaml::Boolean(b) => b.to_string(),
                    Yaml::Null => "null".to_string(),
                    other => {
                        return Err(YamlError(format!(
                            "unsupported mapping key {:?}",
                            other
                        )))
                    }
                };
                yaml_to_json(v).map(|v| (key, v))
            })
            .collect::<Result<Map<String, Value>, _>>()
            .map(Value::Object),
        Yaml::Alias(_) => Err(YamlError("unresolved YAML alias".to_string())),
        Yaml::BadValue => Err(YamlError("bad YAML value".to_string())),
    }
}
