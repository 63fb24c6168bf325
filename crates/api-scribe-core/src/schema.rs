//! Schema inference and merging.
//!
//! Turns decoded JSON bodies into a small JSON-Schema-like tree and folds
//! trees observed at different times into one.
//!
//! # Null handling
//!
//! A `null` value contributes no schema entry at all. A field seen as
//! `null` in one sample and as a string in another therefore ends up typed
//! `string`, and a field only ever seen as `null` is absent from the tree.
//!
//! # Merge order
//!
//! [`merge_objects`] is not commutative: on scalar conflicts the right-hand
//! side wins, and empty objects give way to populated ones. Callers fold in
//! chronological order (existing structure first, newest sample last).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Property map of an object schema. Ordered, so serialized trees are
/// byte-identical for identical input.
pub type Properties = BTreeMap<String, Schema>;

/// Type tag of a decoded JSON value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JsonType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
}

impl JsonType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JsonType::String => "string",
            JsonType::Number => "number",
            JsonType::Integer => "integer",
            JsonType::Boolean => "boolean",
            JsonType::Object => "object",
            JsonType::Array => "array",
            JsonType::Null => "null",
        }
    }
}

/// A node of the inferred schema tree.
///
/// Serializes as `{"type": "object", "properties": {...}}`,
/// `{"type": "array", "items": {...}}`, or `{"type": "<scalar>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schema {
    Object {
        #[serde(default)]
        properties: Properties,
    },
    Array {
        items: Box<Schema>,
    },
    String,
    Number,
    Integer,
    Boolean,
}

impl Schema {
    /// Schema for a scalar type tag. `None` for `null` and the container tags.
    pub fn scalar(json_type: JsonType) -> Option<Schema> {
        match json_type {
            JsonType::String => Some(Schema::String),
            JsonType::Number => Some(Schema::Number),
            JsonType::Integer => Some(Schema::Integer),
            JsonType::Boolean => Some(Schema::Boolean),
            JsonType::Object | JsonType::Array | JsonType::Null => None,
        }
    }

    pub fn json_type(&self) -> JsonType {
        match self {
            Schema::Object { .. } => JsonType::Object,
            Schema::Array { .. } => JsonType::Array,
            Schema::String => JsonType::String,
            Schema::Number => JsonType::Number,
            Schema::Integer => JsonType::Integer,
            Schema::Boolean => JsonType::Boolean,
        }
    }

    /// True for an object schema with zero properties.
    pub fn is_empty_object(&self) -> bool {
        matches!(self, Schema::Object { properties } if properties.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("body is a JSON {0}, expected an object or array")]
    UnsupportedBody(&'static str),
}

/// Classify a decoded JSON value.
///
/// All numbers are reported as [`JsonType::Number`]; the decoder does not
/// tell integers and floats apart at this layer.
pub fn infer_type(value: &Value) -> JsonType {
    match value {
        Value::Null => JsonType::Null,
        Value::Bool(_) => JsonType::Boolean,
        Value::Number(_) => JsonType::Number,
        Value::String(_) => JsonType::String,
        Value::Array(_) => JsonType::Array,
        Value::Object(_) => JsonType::Object,
    }
}

/// Synthesize an object schema from one decoded JSON object.
///
/// Keys whose value is `null`, or an array no schema can be derived from,
/// are omitted.
pub fn synthesize(object: &Map<String, Value>) -> Schema {
    Schema::Object {
        properties: synthesize_properties(object),
    }
}

fn synthesize_properties(object: &Map<String, Value>) -> Properties {
    let mut properties = Properties::new();
    for (key, value) in object {
        if let Some(schema) = synthesize_value(value) {
            properties.insert(key.clone(), schema);
        }
    }
    properties
}

/// Synthesize an array schema.
///
/// Returns `None` when the array is empty or its first element is `null`.
/// For scalar arrays the first element decides the item type. Object
/// elements are synthesized one by one and folded left to right with
/// [`merge_objects`]; non-object elements in an object array are ignored.
pub fn synthesize_array(elements: &[Value]) -> Option<Schema> {
    let first = elements.first()?;
    let items = match infer_type(first) {
        JsonType::Null => return None,
        JsonType::Object => elements
            .iter()
            .filter_map(Value::as_object)
            .map(synthesize_properties)
            .reduce(|merged, next| merge_objects(&merged, &next))
            .map(|properties| Schema::Object { properties })?,
        JsonType::Array => synthesize_array(first.as_array()?)?,
        scalar => Schema::scalar(scalar)?,
    };
    Some(Schema::Array {
        items: Box::new(items),
    })
}

fn synthesize_value(value: &Value) -> Option<Schema> {
    match value {
        Value::Null => None,
        Value::Object(object) => Some(synthesize(object)),
        Value::Array(elements) => synthesize_array(elements),
        scalar => Schema::scalar(infer_type(scalar)),
    }
}

/// Synthesize the schema of a raw request or response body.
///
/// Returns `Ok(None)` for an empty body or an array body no schema can be
/// derived from. Bodies that decode to a scalar are rejected.
pub fn synthesize_body(body: &str) -> Result<Option<Schema>, SchemaError> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(body)?;
    match &value {
        Value::Object(object) => Ok(Some(synthesize(object))),
        Value::Array(elements) => Ok(synthesize_array(elements)),
        other => Err(SchemaError::UnsupportedBody(infer_type(other).as_str())),
    }
}

/// Merge two object property maps. `b` is the newer side.
///
/// Per key:
/// - only in `a`: kept as-is;
/// - only in `b`: kept unless it is an empty object;
/// - both objects: recurse when both are populated, otherwise the
///   populated one wins (ties go to `b`);
/// - anything else: `b` wins.
pub fn merge_objects(a: &Properties, b: &Properties) -> Properties {
    let mut merged = Properties::new();
    for (key, left) in a {
        let schema = match b.get(key) {
            Some(right) => merge_property(left, right),
            None => left.clone(),
        };
        merged.insert(key.clone(), schema);
    }
    for (key, right) in b {
        if a.contains_key(key) || right.is_empty_object() {
            continue;
        }
        merged.insert(key.clone(), right.clone());
    }
    merged
}

fn merge_property(left: &Schema, right: &Schema) -> Schema {
    match (left, right) {
        (Schema::Object { properties: l }, Schema::Object { properties: r }) => {
            if !l.is_empty() && !r.is_empty() {
                Schema::Object {
                    properties: merge_objects(l, r),
                }
            } else if !l.is_empty() {
                left.clone()
            } else {
                right.clone()
            }
        }
        _ => right.clone(),
    }
}

/// Fold a newly synthesized body schema into the running one.
///
/// Objects merge with [`merge_objects`]; arrays of objects merge their
/// item schemas the same way. Any other pairing is resolved in favour of
/// `next`, the newer evidence.
pub fn merge_body(current: Option<Schema>, next: Schema) -> Schema {
    match (current, next) {
        (Some(Schema::Object { properties: a }), Schema::Object { properties: b }) => {
            Schema::Object {
                properties: merge_objects(&a, &b),
            }
        }
        (Some(Schema::Array { items: a }), Schema::Array { items: b }) => match (*a, *b) {
            (Schema::Object { properties: a }, Schema::Object { properties: b }) => {
                Schema::Array {
                    items: Box::new(Schema::Object {
                        properties: merge_objects(&a, &b),
                    }),
                }
            }
            (_, b) => Schema::Array { items: Box::new(b) },
        },
        (_, next) => next,
    }
}
