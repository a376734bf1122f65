use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use owl_core::config::OverwritePolicy;
use owl_core::error::{OwlError, Result};
use owl_core::schema::TypeSchema;
use owl_core::types::FieldMap;

/// Writer recorded for fields supplied by the caller.
pub const INPUT_WRITER: &str = "<input>";

/// Field values accumulated during a run, with the node that wrote each one.
///
/// This is the only channel through which nodes see each other's data.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    values: FieldMap,
    writers: BTreeMap<String, String>,
}

impl ExecutionContext {
    pub fn new(initial: FieldMap) -> Self {
        let writers = initial
            .keys()
            .map(|k| (k.clone(), INPUT_WRITER.to_string()))
            .collect();
        Self {
            values: initial,
            writers,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Id of the node that last wrote `field`.
    pub fn writer_of(&self, field: &str) -> Option<&str> {
        self.writers.get(field).map(|s| s.as_str())
    }

    /// The subset of the context a schema declares.
    pub fn slice(&self, schema: &TypeSchema) -> FieldMap {
        schema
            .field_names()
            .into_iter()
            .filter_map(|name| {
                self.values
                    .get(name)
                    .map(|value| (name.to_string(), value.clone()))
            })
            .collect()
    }

    /// Merge a node's validated outputs.
    ///
    /// Under `Reject` a collision fails the whole merge before anything is
    /// written.
    pub fn merge(&mut self, node: &str, outputs: FieldMap, policy: OverwritePolicy) -> Result<()> {
        if policy == OverwritePolicy::Reject {
            if let Some(field) = outputs.keys().find(|k| self.values.contains_key(*k)) {
                return Err(OwlError::FieldCollision {
                    field: field.clone(),
                    node: node.to_string(),
                    previous: self.writer_of(field).unwrap_or(INPUT_WRITER).to_string(),
                });
            }
        }

        for (field, value) in outputs {
            if let Some(previous) = self.writers.insert(field.clone(), node.to_string()) {
                debug!(field = %field, node, previous = %previous, "Overwriting context field");
            }
            self.values.insert(field, value);
        }
        Ok(())
    }

    pub fn keys(&self) -> Vec<&str> {
        self.values.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &FieldMap {
        &self.values
    }

    pub fn into_values(self) -> FieldMap {
        self.values
    }
}
