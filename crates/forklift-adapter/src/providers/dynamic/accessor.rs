//! Schema-driven field access on untyped inventory objects

use serde_json::Value;

use forklift_common::crd::{ProviderSchema, SchemaKind};

/// Reads semantic fields of one inventory object through a schema
#[derive(Clone, Copy)]
pub struct Accessor<'a> {
    schema: &'a ProviderSchema,
    kind: SchemaKind,
    object: &'a Value,
}

impl<'a> Accessor<'a> {
    /// Accessor for `object` of `kind`
    pub fn new(schema: &'a ProviderSchema, kind: SchemaKind, object: &'a Value) -> Self {
        Self {
            schema,
            kind,
            object,
        }
    }

    /// Accessor for a nested object of another kind
    pub fn nested(&self, kind: SchemaKind, object: &'a Value) -> Self {
        Self::new(self.schema, kind, object)
    }

    /// Raw value of a semantic field
    ///
    /// The schema path is split on `.` and walked through objects; numeric
    /// segments index into arrays.
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        let path = self.schema.get_field(self.kind, name)?;
        path.split('.').try_fold(self.object, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    }

    /// String field; numbers are rendered
    pub fn get_string(&self, name: &str) -> Option<String> {
        match self.get(name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Integer field; floats truncate and numeric strings parse
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean field; "true"/"false" strings parse
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Array field; empty when absent or not an array
    pub fn get_slice(&self, name: &str) -> &'a [Value] {
        match self.get(name) {
            Some(Value::Array(items)) => items,
            _ => &[],
        }
    }
}
