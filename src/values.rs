//! Helm values trees with schema-on-read accessors.
//!
//! Values are kept untyped (`serde_yaml::Value`); every migration step reads
//! them through the `expect_*` helpers, which fail with a
//! [`TobsError::ShapeMismatch`] naming the key instead of guessing.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Serialize, Serializer};
use serde_yaml::{Mapping, Value};

use crate::error::TobsError;

/// Human-readable kind of a values node, used in shape errors.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

fn mismatch(key: &str, expected: &'static str, value: &Value) -> TobsError {
    TobsError::ShapeMismatch {
        key: key.to_string(),
        expected,
        actual: kind_of(value),
    }
}

/// The node at `key` must be a mapping.
pub fn expect_mapping<'a>(key: &str, value: &'a Value) -> Result<&'a Mapping, TobsError> {
    value
        .as_mapping()
        .ok_or_else(|| mismatch(key, "mapping", value))
}

/// Mutable variant of [`expect_mapping`].
pub fn expect_mapping_mut<'a>(key: &str, value: &'a mut Value) -> Result<&'a mut Mapping, TobsError> {
    let actual = kind_of(value);
    value.as_mapping_mut().ok_or_else(|| TobsError::ShapeMismatch {
        key: key.to_string(),
        expected: "mapping",
        actual,
    })
}

/// The node at `key` must be a boolean.
pub fn expect_bool(key: &str, value: &Value) -> Result<bool, TobsError> {
    value.as_bool().ok_or_else(|| mismatch(key, "bool", value))
}

/// The node at `key` must be a string.
pub fn expect_str<'a>(key: &str, value: &'a Value) -> Result<&'a str, TobsError> {
    value.as_str().ok_or_else(|| mismatch(key, "string", value))
}

/// The node at `key` must be a sequence of strings.
pub fn expect_string_list(key: &str, value: &Value) -> Result<Vec<String>, TobsError> {
    let items = value
        .as_sequence()
        .ok_or_else(|| mismatch(key, "sequence", value))?;

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| mismatch(&format!("{key}[{i}]"), "string", item))
        })
        .collect()
}

/// A release's configuration: a mapping at the root, no fixed schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValuesTree {
    root: Mapping,
}

impl ValuesTree {
    /// Wrap a parsed document. `null` (an empty document) is an empty tree.
    pub fn from_value(value: Value) -> Result<Self, TobsError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Mapping(root) => Ok(Self { root }),
            other => Err(mismatch("<root>", "mapping", &other)),
        }
    }

    /// Parse YAML (or JSON) text.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let value: Value = serde_yaml::from_str(text).context("Failed to parse values")?;
        Ok(Self::from_value(value)?)
    }

    /// Load a values file from disk.
    pub fn load_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read values file {}", path.display()))?;
        Self::from_yaml_str(&text)
            .with_context(|| format!("Failed to parse values file {}", path.display()))
    }

    pub fn root_mut(&mut self) -> &mut Mapping {
        &mut self.root
    }

    /// Look up a top-level key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.root.get(key)
    }

    /// Walk a key path. Returns `Ok(None)` when a key is absent and a shape
    /// error when an intermediate node is not a mapping.
    pub fn get_path(&self, path: &[&str]) -> Result<Option<&Value>, TobsError> {
        let Some((first, rest)) = path.split_first() else {
            return Ok(None);
        };

        let mut current = match self.root.get(*first) {
            Some(value) => value,
            None => return Ok(None),
        };
        let mut walked = (*first).to_string();

        for segment in rest {
            let mapping = expect_mapping(&walked, current)?;
            current = match mapping.get(*segment) {
                Some(value) => value,
                None => return Ok(None),
            };
            walked.push('.');
            walked.push_str(segment);
        }

        Ok(Some(current))
    }

    /// Deep-merge `overlay` into this tree: mappings merge recursively, any
    /// other value in the overlay replaces the existing one.
    pub fn merge(&mut self, overlay: &Self) {
        merge_mapping(&mut self.root, &overlay.root);
    }

    /// Render as YAML text for the chart installer.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.root).context("Failed to serialize values")
    }

    /// Canonical byte encoding: JSON with object keys sorted at every level.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_value(&self.root)
            .context("Values contain keys that cannot be compared")?;
        serde_json::to_vec(&Canonical(&json)).context("Failed to encode values")
    }

    /// Byte-compare two trees through their canonical encoding.
    pub fn same_as(&self, other: &Self) -> Result<bool> {
        Ok(self.canonical_bytes()? == other.canonical_bytes()?)
    }
}

fn merge_mapping(base: &mut Mapping, overlay: &Mapping) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Mapping(existing)), Value::Mapping(incoming)) => {
                merge_mapping(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Serializes JSON with sorted object keys regardless of map implementation.
struct Canonical<'a>(&'a serde_json::Value);

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            serde_json::Value::Object(map) => {
                let sorted: BTreeMap<&String, Canonical<'_>> =
                    map.iter().map(|(k, v)| (k, Canonical(v))).collect();
                sorted.serialize(serializer)
            }
            serde_json::Value::Array(items) => {
                let items: Vec<Canonical<'_>> = items.iter().map(Canonical).collect();
                items.serialize(serializer)
            }
            other => other.serialize(serializer),
        }
    }
}
