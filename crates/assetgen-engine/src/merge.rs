//! Structural deep merge of YAML documents
//!
//! Rules, applied recursively:
//! - Mappings: merged key by key. Keys only in the patch are appended,
//!   shared keys recurse, keys only in the base are kept.
//! - Sequences: each patch element is matched against the base elements.
//!   Mappings are matched by their merge key (`name` by default); anything
//!   else, including mappings without the key, by whole-value equality.
//!   Matched elements recurse, unmatched ones are appended, base elements
//!   the patch does not mention are left alone.
//! - Scalars: the patch value replaces the base value. A null base is
//!   replaced by whatever the patch carries.
//! - A null patch over a mapping or sequence leaves it unchanged. This is
//!   what an empty patch file or an empty key (`annotations:`) parses to.
//! - Anything else (mapping vs sequence, scalar vs container) is a
//!   `MergeTypeMismatch`.
//!
//! Appending by identity is what makes patches idempotent: merging a patch
//! that adds a container twice leaves a single container.

use serde_yaml::{Mapping, Value};
use std::fmt;

use crate::error::{EngineError, Result};

/// Options of the sequence-matching merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOptions {
    /// Field identifying mapping elements of a sequence
    pub key_field: String,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            key_field: "name".to_string(),
        }
    }
}

impl MergeOptions {
    pub fn with_key_field(key_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
        }
    }
}

/// Shape of a YAML node, for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Null,
    Scalar,
    Sequence,
    Mapping,
}

impl NodeKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Sequence(_) => Self::Sequence,
            Value::Mapping(_) => Self::Mapping,
            Value::Bool(_) | Value::Number(_) | Value::String(_) | Value::Tagged(_) => {
                Self::Scalar
            }
        }
    }

    fn is_scalar(self) -> bool {
        matches!(self, Self::Null | Self::Scalar)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Null => "null",
            Self::Scalar => "scalar",
            Self::Sequence => "sequence",
            Self::Mapping => "mapping",
        })
    }
}

/// Deep merge `patch` into `base`
pub fn merge_values(base: &mut Value, patch: &Value, options: &MergeOptions) -> Result<()> {
    let mut path = Vec::new();
    merge_at(base, patch, options, &mut path)
}

fn merge_at(
    base: &mut Value,
    patch: &Value,
    options: &MergeOptions,
    path: &mut Vec<String>,
) -> Result<()> {
    match (base, patch) {
        (Value::Mapping(base_map), Value::Mapping(patch_map)) => {
            merge_mappings(base_map, patch_map, options, path)
        }
        (Value::Sequence(base_seq), Value::Sequence(patch_seq)) => {
            for element in patch_seq {
                match find_match(base_seq, element, options) {
                    Some(index) => {
                        path.push(element_label(element, index, options));
                        merge_at(&mut base_seq[index], element, options, path)?;
                        path.pop();
                    }
                    None => base_seq.push(element.clone()),
                }
            }
            Ok(())
        }
        (base, patch) => {
            let base_kind = NodeKind::of(base);
            let patch_kind = NodeKind::of(patch);
            if base_kind == NodeKind::Null || (base_kind.is_scalar() && patch_kind.is_scalar()) {
                *base = patch.clone();
                Ok(())
            } else if patch_kind == NodeKind::Null {
                Ok(())
            } else {
                Err(EngineError::MergeTypeMismatch {
                    path: render_path(path),
                    base: base_kind,
                    patch: patch_kind,
                })
            }
        }
    }
}

fn merge_mappings(
    base: &mut Mapping,
    patch: &Mapping,
    options: &MergeOptions,
    path: &mut Vec<String>,
) -> Result<()> {
    for (key, patch_value) in patch {
        match base.get_mut(key) {
            Some(base_value) => {
                path.push(key_label(key));
                merge_at(base_value, patch_value, options, path)?;
                path.pop();
            }
            None => {
                base.insert(key.clone(), patch_value.clone());
            }
        }
    }
    Ok(())
}

/// Index of the base element the patch element should merge into
fn find_match(base: &[Value], element: &Value, options: &MergeOptions) -> Option<usize> {
    match identity(element, options) {
        Some(key) => base
            .iter()
            .position(|candidate| identity(candidate, options) == Some(key)),
        None => base.iter().position(|candidate| candidate == element),
    }
}

fn identity<'v>(value: &'v Value, options: &MergeOptions) -> Option<&'v Value> {
    value.as_mapping()?.get(options.key_field.as_str())
}

fn key_label(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_else(|_| "?".to_string()),
    }
}

fn element_label(element: &Value, index: usize, options: &MergeOptions) -> String {
    match identity(element, options) {
        Some(key) => format!("[{}={}]", options.key_field, key_label(key)),
        None => format!("[{}]", index),
    }
}

fn render_path(path: &[String]) -> String {
    let mut out = String::new();
    for segment in path {
        if !out.is_empty() && !segment.starts_with('[') {
            out.push('.');
        }
        out.push_str(segment);
    }
    if out.is_empty() {
        out.push('.');
    }
    out
}
