//! Manifest splitting
//!
//! Turns a byte stream holding YAML documents and/or JSON values into an
//! ordered list of [`ResourceDescriptor`]s. The order of the returned list is
//! the order the gate authorizes in and the applier creates in.

pub mod yaml;

use std::fmt;

use serde_json::Value;

/// File extensions considered manifests during discovery (compared case-insensitively)
pub const MANIFEST_EXTENSIONS: &[&str] = &["json", "yml", "yaml"];

/// One resource decoded from a manifest stream
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceDescriptor {
    /// `apiVersion` as written (empty when absent)
    pub api_version: String,
    /// `kind` as written
    pub kind: String,
    /// `metadata.name` (empty when absent)
    pub name: String,
    /// `metadata.namespace`, if the manifest pins one
    pub namespace: Option<String>,
    /// Full document body
    pub body: Value,
}

impl ResourceDescriptor {
    /// Build a descriptor from a decoded document
    ///
    /// The document must be a mapping with a non-empty `kind`.
    pub fn from_value(body: Value) -> Result<Self, String> {
        let obj = body
            .as_object()
            .ok_or_else(|| format!("expected a mapping, found {}", value_type(&body)))?;

        let kind = obj
            .get("kind")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| "object 'kind' is missing".to_string())?
            .to_string();
        let api_version = obj
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let metadata = obj.get("metadata");
        let name = metadata
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let namespace = metadata
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty())
            .map(String::from);

        Ok(Self {
            api_version,
            kind,
            name,
            namespace,
            body,
        })
    }

    /// API group (empty for the core group)
    pub fn group(&self) -> &str {
        parse_api_version(&self.api_version).0
    }

    /// API version without the group
    pub fn version(&self) -> &str {
        parse_api_version(&self.api_version).1
    }

    /// Namespace the resource lands in: its own, else `default_ns`
    pub fn target_namespace<'a>(&'a self, default_ns: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(default_ns)
    }

    /// Body with `metadata.namespace` set to `namespace`
    pub fn body_in_namespace(&self, namespace: &str) -> Value {
        let mut body = self.body.clone();
        if let Some(obj) = body.as_object_mut() {
            let metadata = obj
                .entry("metadata")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Some(meta) = metadata.as_object_mut() {
                meta.insert("namespace".to_string(), Value::String(namespace.to_string()));
            }
        }
        body
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Split `apiVersion` into `(group, version)`
///
/// Core resources (`v1`) have an empty group.
pub fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rfind('/') {
        Some(idx) => (&api_version[..idx], &api_version[idx + 1..]),
        None => ("", api_version),
    }
}

fn value_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "sequence",
        Value::Object(_) => "mapping",
    }
}

/// A document in the stream could not be decoded
///
/// Carries every descriptor decoded before the failing document.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("document {document}: {message}")]
pub struct SplitError {
    /// Descriptors decoded before the failure, in stream order
    pub parsed: Vec<ResourceDescriptor>,
    /// Zero-based index of the failing document in the stream
    pub document: usize,
    /// Decoder message
    pub message: String,
}

/// Split a manifest stream into resource descriptors.
///
/// Accepts YAML documents separated by `---` lines and adjacent JSON values,
/// mixed freely. Empty and `null` documents are skipped. Splitting the same
/// bytes twice yields the same sequence.
pub fn split_manifests(data: &[u8]) -> Result<Vec<ResourceDescriptor>, SplitError> {
    let text = std::str::from_utf8(data).map_err(|e| SplitError {
        parsed: Vec::new(),
        document: 0,
        message: format!("manifest is not valid UTF-8: {}", e),
    })?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut parsed = Vec::new();
    let mut document = 0usize;

    for chunk in documents(text) {
        let values = match decode_chunk(chunk) {
            Ok(values) => values,
            Err((decoded, message)) => {
                // keep whatever decoded ahead of the failure inside this chunk
                for value in decoded {
                    if let Err(message) = push_value(&mut parsed, value) {
                        return Err(SplitError {
                            parsed,
                            document,
                            message,
                        });
                    }
                    document += 1;
                }
                return Err(SplitError {
                    parsed,
                    document,
                    message,
                });
            }
        };

        for value in values {
            if let Err(message) = push_value(&mut parsed, value) {
                return Err(SplitError {
                    parsed,
                    document,
                    message,
                });
            }
            document += 1;
        }
    }

    Ok(parsed)
}

fn push_value(parsed: &mut Vec<ResourceDescriptor>, value: Value) -> Result<(), String> {
    if is_empty_document(&value) {
        return Ok(());
    }
    parsed.push(ResourceDescriptor::from_value(value)?);
    Ok(())
}

fn is_empty_document(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Break the stream on `---` separator lines
///
/// A separator is a line that starts with `---` and has nothing but
/// whitespace after it. Directive lines (`%YAML`, `%TAG`) right before a
/// separator stay with the document that follows it, separator included.
fn documents(text: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut offset = 0usize;
    let mut directives: Option<usize> = None;

    for line in text.split_inclusive('\n') {
        let is_separator = line
            .strip_prefix("---")
            .is_some_and(|rest| rest.trim().is_empty());
        if is_separator {
            match directives.take() {
                Some(at) => {
                    chunks.push(&text[start..at]);
                    start = at;
                }
                None => {
                    chunks.push(&text[start..offset]);
                    start = offset + line.len();
                }
            }
        } else if line.starts_with('%') {
            directives.get_or_insert(offset);
        } else if !line.trim().is_empty() && !line.starts_with('#') {
            directives = None;
        }
        offset += line.len();
    }
    chunks.push(&text[start..]);

    chunks
        .into_iter()
        .filter(|c| !c.trim().is_empty())
        .collect()
}

/// Decode one chunk as a JSON value stream or a YAML document
///
/// On failure returns the values decoded before the error alongside the
/// message.
fn decode_chunk(chunk: &str) -> Result<Vec<Value>, (Vec<Value>, String)> {
    if chunk.trim_start().starts_with('{') {
        let mut values = Vec::new();
        let stream = serde_json::Deserializer::from_str(chunk).into_iter::<Value>();
        let mut json_err = None;
        for item in stream {
            match item {
                Ok(v) => values.push(v),
                Err(e) => {
                    json_err = Some(e.to_string());
                    break;
                }
            }
        }
        let Some(json_err) = json_err else {
            return Ok(values);
        };
        // a YAML flow mapping also starts with '{'
        if values.is_empty() {
            if let Ok(docs) = yaml::decode_documents(chunk) {
                return Ok(docs);
            }
        }
        return Err((values, json_err));
    }

    yaml::decode_documents(chunk).map_err(|e| (Vec::new(), e.to_string()))
}
