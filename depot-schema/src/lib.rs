//! # depot-schema — typed collection schemas
//!
//! A schema is an ordered mapping of property name → [`Property`], loaded
//! from a collection's `config.json`. It gates every write through two
//! operations:
//!
//! - [`Schema::sanitize`]: drop unknown keys, coerce values to their
//!   declared types, apply defaults (create only), and discard external
//!   writes to `system` properties.
//! - [`Schema::validate`]: enforce `required` (create only) and re-check
//!   types after coercion.
//!
//! `id`, `createdAt`, and `updatedAt` are implicit on every schema and are
//! always system-owned. Schema edits never rewrite stored documents; a
//! document is re-coerced on its next write.

mod sanitize;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use sanitize::Mode;

/// Property names the engine owns on every collection.
pub const IMPLICIT_FIELDS: [&str; 3] = ["id", "createdAt", "updatedAt"];

/// Field names that, when declared, scope non-root reads to the caller.
const OWNERSHIP_FIELDS: [&str; 2] = ["userId", "owner"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Number,
    Boolean,
    Date,
    Array,
    Object,
}

impl PropertyType {
    pub fn as_str(self) -> &'static str {
        match self {
            PropertyType::String => "string",
            PropertyType::Number => "number",
            PropertyType::Boolean => "boolean",
            PropertyType::Date => "date",
            PropertyType::Array => "array",
            PropertyType::Object => "object",
        }
    }
}

/// One property definition in a collection schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Property {
    #[serde(rename = "type")]
    pub property_type: PropertyType,
    pub required: bool,
    /// Literal default, or the sentinel `"now"` for date properties.
    pub default: Option<Value>,
    pub unique: bool,
    /// Readonly from outside; only the engine and hooks may write it.
    pub system: bool,
    /// Administrative display ordering only.
    pub order: Option<i64>,
}

impl Default for Property {
    fn default() -> Self {
        Property {
            property_type: PropertyType::String,
            required: false,
            default: None,
            unique: false,
            system: false,
            order: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaError {
    Parse(String),
    ReservedProperty(String),
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaError::Parse(msg) => write!(f, "invalid schema: {msg}"),
            SchemaError::ReservedProperty(name) => {
                write!(f, "property name is reserved: {name}")
            }
        }
    }
}

impl std::error::Error for SchemaError {}

/// A collection schema: its declared properties, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub properties: BTreeMap<String, Property>,
}

impl Schema {
    /// Parse the contents of a collection's `config.json`.
    pub fn from_config(raw: &str) -> Result<Schema, SchemaError> {
        let schema: Schema =
            serde_json::from_str(raw).map_err(|e| SchemaError::Parse(e.to_string()))?;
        for name in schema.properties.keys() {
            if IMPLICIT_FIELDS.contains(&name.as_str()) {
                return Err(SchemaError::ReservedProperty(name.clone()));
            }
        }
        Ok(schema)
    }

    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.get(name)
    }

    /// Properties carrying a unique constraint, for the store driver.
    pub fn unique_fields(&self) -> Vec<String> {
        self.properties
            .iter()
            .filter(|(_, p)| p.unique)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The schema-declared ownership field, when one exists.
    pub fn ownership_field(&self) -> Option<&str> {
        OWNERSHIP_FIELDS
            .iter()
            .find(|name| self.properties.contains_key(**name))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_a_config_file() {
        let schema = Schema::from_config(
            r#"{"properties": {
                "title": {"type": "string", "required": true},
                "age": {"type": "number"},
                "joined": {"type": "date", "default": "now"},
                "email": {"type": "string", "unique": true},
                "role": {"type": "string", "system": true, "order": 3}
            }}"#,
        )
        .unwrap();
        assert_eq!(schema.properties.len(), 5);
        let title = schema.property("title").unwrap();
        assert_eq!(title.property_type, PropertyType::String);
        assert!(title.required);
        assert_eq!(schema.property("joined").unwrap().default, Some(json!("now")));
        assert_eq!(schema.unique_fields(), vec!["email".to_string()]);
        assert_eq!(schema.property("role").unwrap().order, Some(3));
    }

    #[test]
    fn implicit_fields_cannot_be_declared() {
        let err = Schema::from_config(r#"{"properties": {"id": {"type": "string"}}}"#)
            .unwrap_err();
        assert_eq!(err, SchemaError::ReservedProperty("id".into()));
    }

    #[test]
    fn ownership_field_detection() {
        let with = Schema::from_config(r#"{"properties": {"userId": {"type": "string"}}}"#)
            .unwrap();
        assert_eq!(with.ownership_field(), Some("userId"));
        let without =
            Schema::from_config(r#"{"properties": {"title": {"type": "string"}}}"#).unwrap();
        assert_eq!(without.ownership_field(), None);
    }
}
