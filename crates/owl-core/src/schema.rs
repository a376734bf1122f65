use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SchemaMutationError, SchemaValidationError};
use crate::types::{kind_of, FieldMap, TypeTag};

/// An optional field: its expected kind and the value substituted when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionalField {
    pub tag: TypeTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Required and optional named fields describing one side of a node.
///
/// A field name appears in at most one of the two sets. Fields are kept in
/// name order so validation reports are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeSchema {
    #[serde(default)]
    required: BTreeMap<String, TypeTag>,
    #[serde(default)]
    optional: BTreeMap<String, OptionalField>,
}

impl TypeSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// A schema whose fields are all required.
    pub fn of<'a>(fields: impl IntoIterator<Item = (&'a str, TypeTag)>) -> Self {
        Self {
            required: fields
                .into_iter()
                .map(|(name, tag)| (name.to_string(), tag))
                .collect(),
            optional: BTreeMap::new(),
        }
    }

    /// Builder form of `add_field` for an optional field.
    pub fn with_optional(
        mut self,
        name: impl Into<String>,
        tag: TypeTag,
        default: Option<Value>,
    ) -> Result<Self, SchemaMutationError> {
        self.add_field(name, tag, false, default)?;
        Ok(self)
    }

    /// Builder form of `add_field` for a required field.
    pub fn with_required(
        mut self,
        name: impl Into<String>,
        tag: TypeTag,
    ) -> Result<Self, SchemaMutationError> {
        self.add_field(name, tag, true, None)?;
        Ok(self)
    }

    /// Declare a new field. A default is only meaningful for optional fields
    /// and must match the declared kind.
    pub fn add_field(
        &mut self,
        name: impl Into<String>,
        tag: TypeTag,
        required: bool,
        default: Option<Value>,
    ) -> Result<&mut Self, SchemaMutationError> {
        let name = name.into();
        if self.contains(&name) {
            return Err(SchemaMutationError::DuplicateField { field: name });
        }
        if let Some(ref value) = default {
            if !tag.matches(value) {
                return Err(SchemaMutationError::InvalidDefault {
                    field: name,
                    expected: tag,
                    found: kind_of(value).to_string(),
                });
            }
        }

        if required {
            self.required.insert(name, tag);
        } else {
            self.optional.insert(name, OptionalField { tag, default });
        }
        Ok(self)
    }

    /// Remove a field whether it is required or optional.
    pub fn remove_field(&mut self, name: &str) -> Result<&mut Self, SchemaMutationError> {
        if self.required.remove(name).is_none() && self.optional.remove(name).is_none() {
            return Err(SchemaMutationError::UnknownField {
                field: name.to_string(),
            });
        }
        Ok(self)
    }

    /// Check `values` against the schema and return the validated mapping
    /// with defaults filled in for absent optional fields.
    pub fn validate(&self, values: &FieldMap) -> Result<FieldMap, SchemaValidationError> {
        let mut validated = FieldMap::new();

        for (name, tag) in &self.required {
            let value = values
                .get(name)
                .ok_or_else(|| SchemaValidationError::MissingField {
                    field: name.clone(),
                })?;
            check_kind(name, *tag, value)?;
            validated.insert(name.clone(), value.clone());
        }

        for (name, field) in &self.optional {
            match values.get(name) {
                Some(value) => {
                    check_kind(name, field.tag, value)?;
                    validated.insert(name.clone(), value.clone());
                }
                None => {
                    if let Some(ref default) = field.default {
                        validated.insert(name.clone(), default.clone());
                    }
                }
            }
        }

        if let Some(extra) = values.keys().find(|k| !self.contains(k)) {
            return Err(SchemaValidationError::UnexpectedField {
                field: extra.clone(),
            });
        }

        Ok(validated)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.required.contains_key(name) || self.optional.contains_key(name)
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.required.contains_key(name)
    }

    pub fn tag_of(&self, name: &str) -> Option<TypeTag> {
        self.required
            .get(name)
            .copied()
            .or_else(|| self.optional.get(name).map(|f| f.tag))
    }

    /// All declared field names, required first, each group in name order.
    pub fn field_names(&self) -> Vec<&str> {
        self.required
            .keys()
            .chain(self.optional.keys())
            .map(|s| s.as_str())
            .collect()
    }

    pub fn required_names(&self) -> Vec<&str> {
        self.required.keys().map(|s| s.as_str()).collect()
    }

    pub fn required_fields(&self) -> &BTreeMap<String, TypeTag> {
        &self.required
    }

    pub fn optional_fields(&self) -> &BTreeMap<String, OptionalField> {
        &self.optional
    }

    pub fn len(&self) -> usize {
        self.required.len() + self.optional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty() && self.optional.is_empty()
    }
}

fn check_kind(name: &str, tag: TypeTag, value: &Value) -> Result<(), SchemaValidationError> {
    if tag.matches(value) {
        Ok(())
    } else {
        Err(SchemaValidationError::TypeMismatch {
            field: name.to_string(),
            expected: tag,
            found: kind_of(value).to_string(),
        })
    }
}
