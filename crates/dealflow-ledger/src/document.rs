//! Opaque entity snapshots
//!
//! Before/after snapshots and free-form metadata are [`Document`]s: string
//! keys mapped to JSON values (null, bool, number, string, array, object).

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key-value snapshot of an entity
pub type Document = serde_json::Map<String, Value>;

/// Shallow merge: every top-level key of `patch` overwrites `target`
pub fn shallow_merge(target: &mut Document, patch: &Document) {
    for (key, value) in patch {
        target.insert(key.clone(), value.clone());
    }
}

/// Convert any serializable entity into a snapshot
///
/// # Errors
/// Returns error if the value does not serialize to a JSON object
pub fn to_document<T: Serialize>(value: &T) -> Result<Document, serde_json::Error> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(serde::ser::Error::custom(format!(
            "expected an object snapshot, got {}",
            kind_name(&other)
        ))),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One top-level field difference between two snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldChange {
    /// Present only in the later snapshot
    Added {
        /// Field name
        field: String,
        /// New value
        value: Value,
    },
    /// Present only in the earlier snapshot
    Removed {
        /// Field name
        field: String,
        /// Old value
        value: Value,
    },
    /// Present in both with different values
    Changed {
        /// Field name
        field: String,
        /// Old value
        from: Value,
        /// New value
        to: Value,
    },
}

impl FieldChange {
    /// Name of the field this change concerns
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::Added { field, .. } | Self::Removed { field, .. } | Self::Changed { field, .. } => {
                field
            }
        }
    }
}

/// Top-level differences from `before` to `after`, sorted by field name
#[must_use]
pub fn diff(before: &Document, after: &Document) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    for (field, old) in before {
        match after.get(field) {
            None => changes.push(FieldChange::Removed {
                field: field.clone(),
                value: old.clone(),
            }),
            Some(new) if new != old => changes.push(FieldChange::Changed {
                field: field.clone(),
                from: old.clone(),
                to: new.clone(),
            }),
            Some(_) => {}
        }
    }
    for (field, new) in after {
        if !before.contains_key(field) {
            changes.push(FieldChange::Added {
                field: field.clone(),
                value: new.clone(),
            });
        }
    }
    changes.sort_by(|a, b| a.field().cmp(b.field()));
    changes
}

/// Write a value in canonical form: object keys sorted, no whitespace
///
/// Independent of the map ordering `serde_json` was built with.
pub(crate) fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(&Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(&map[key], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}
