//! Ahead-of-time schema descriptors for persisted types.
//!
//! A type's schema lists its fields, which of them are persisted, and which
//! nested structured types they reference. Marking nested fields for
//! persistence is a traversal of this graph.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use keepsake_common::{FieldBag, Value};

/// Shape of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Scalar,
    /// A nested structure described by the named schema.
    Struct(String),
    Array(Box<FieldType>),
    /// String-keyed map; the payload describes the values.
    Map(Box<FieldType>),
}

impl FieldType {
    pub fn structure(name: impl Into<String>) -> Self {
        FieldType::Struct(name.into())
    }

    pub fn array_of(inner: FieldType) -> Self {
        FieldType::Array(Box::new(inner))
    }

    pub fn map_of(inner: FieldType) -> Self {
        FieldType::Map(Box::new(inner))
    }

    /// The structured type this field eventually holds, if any.
    fn referenced_struct(&self) -> Option<&str> {
        match self {
            FieldType::Scalar => None,
            FieldType::Struct(name) => Some(name),
            FieldType::Array(inner) | FieldType::Map(inner) => inner.referenced_struct(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: FieldType,
    pub persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TypeSchema {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

impl TypeSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Add a persisted field.
    pub fn persisted(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            ty,
            persisted: true,
        });
        self
    }

    /// Add a field that is not saved unless propagation reaches it.
    pub fn transient(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.fields.push(FieldDescriptor {
            name: name.into(),
            ty,
            persisted: false,
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// All known schemas, keyed by type name (class path for entity and
/// component types).
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    types: HashMap<String, TypeSchema>,
    propagated: HashSet<String>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: TypeSchema) {
        self.propagated.remove(&schema.name);
        self.types.insert(schema.name.clone(), schema);
    }

    pub fn get(&self, name: &str) -> Option<&TypeSchema> {
        self.types.get(name)
    }

    pub fn is_propagated(&self, name: &str) -> bool {
        self.propagated.contains(name)
    }

    /// Flag every field of every structure reachable from a persisted field of
    /// `type_name` as persisted. Runs once per type; repeat calls return 0.
    /// Returns how many fields were newly flagged.
    pub fn propagate(&mut self, type_name: &str) -> usize {
        if self.propagated.contains(type_name) || !self.types.contains_key(type_name) {
            return 0;
        }
        let mut pending: Vec<String> = self.persisted_refs(type_name);
        let mut visited: HashSet<String> = HashSet::new();
        let mut flagged = 0;
        while let Some(name) = pending.pop() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let Some(schema) = self.types.get_mut(&name) else {
                tracing::warn!(type_name, missing = %name, "nested schema not registered");
                continue;
            };
            for field in &mut schema.fields {
                if !field.persisted {
                    field.persisted = true;
                    flagged += 1;
                }
                if let Some(inner) = field.ty.referenced_struct() {
                    pending.push(inner.to_owned());
                }
            }
        }
        self.propagated.insert(type_name.to_owned());
        tracing::trace!(type_name, flagged, "propagated persistence flags");
        flagged
    }

    fn persisted_refs(&self, type_name: &str) -> Vec<String> {
        self.types
            .get(type_name)
            .map(|s| {
                s.fields
                    .iter()
                    .filter(|f| f.persisted)
                    .filter_map(|f| f.ty.referenced_struct().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The persisted subset of `bag` as seen through `type_name`'s schema,
    /// recursing into nested structures. A type without a schema persists
    /// nothing.
    pub fn select_persisted(&self, type_name: &str, bag: &FieldBag) -> FieldBag {
        let Some(schema) = self.types.get(type_name) else {
            return FieldBag::new();
        };
        schema
            .fields
            .iter()
            .filter(|f| f.persisted)
            .filter_map(|f| {
                bag.get(&f.name)
                    .map(|v| (f.name.clone(), self.select_value(&f.ty, v)))
            })
            .collect()
    }

    fn select_value(&self, ty: &FieldType, value: &Value) -> Value {
        match (ty, value) {
            (FieldType::Struct(name), Value::Struct(inner)) => {
                Value::Struct(self.select_persisted(name, inner))
            }
            (FieldType::Array(inner_ty), Value::Array(items)) => Value::Array(
                items
                    .iter()
                    .map(|item| self.select_value(inner_ty, item))
                    .collect(),
            ),
            (FieldType::Map(inner_ty), Value::Map(entries)) => Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), self.select_value(inner_ty, v)))
                    .collect::<BTreeMap<_, _>>(),
            ),
            _ => value.clone(),
        }
    }
}
