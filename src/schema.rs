//! Measurement schemas
//!
//! Optional per-measurement declarations used to reject malformed writes
//! before they reach a backend, and by RRDtool to declare every data source
//! when a file is created.

use crate::error::{TimeseriesError, TimeseriesResult};
use crate::point::{DataPoint, FieldValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Declared kind of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Float,
    Integer,
}

impl FieldKind {
    /// Integers are accepted for float fields, not the reverse
    fn accepts(&self, value: &FieldValue) -> bool {
        match (self, value) {
            (FieldKind::Float, _) => true,
            (FieldKind::Integer, FieldValue::Integer(_)) => true,
            (FieldKind::Integer, FieldValue::Float(_)) => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasurementSchema {
    pub fields: BTreeMap<String, FieldKind>,
    #[serde(default)]
    pub required_tags: BTreeSet<String>,
}

impl MeasurementSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.insert(name.into(), kind);
        self
    }

    pub fn required_tag(mut self, name: impl Into<String>) -> Self {
        self.required_tags.insert(name.into());
        self
    }
}

/// Registry of measurement schemas
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, MeasurementSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema; fails if the measurement already has one
    pub fn register(
        &mut self,
        measurement: impl Into<String>,
        schema: MeasurementSchema,
    ) -> TimeseriesResult<()> {
        let measurement = measurement.into();
        if self.schemas.contains_key(&measurement) {
            return Err(TimeseriesError::Schema(format!(
                "schema for '{}' already registered",
                measurement
            )));
        }
        if schema.fields.is_empty() {
            return Err(TimeseriesError::Schema(format!(
                "schema for '{}' declares no fields",
                measurement
            )));
        }
        self.schemas.insert(measurement, schema);
        Ok(())
    }

    pub fn get(&self, measurement: &str) -> Option<&MeasurementSchema> {
        self.schemas.get(measurement)
    }

    pub fn contains(&self, measurement: &str) -> bool {
        self.schemas.contains_key(measurement)
    }

    /// Check a point against its measurement's schema. Measurements without
    /// a schema pass.
    pub fn validate(&self, point: &DataPoint) -> TimeseriesResult<()> {
        let Some(schema) = self.schemas.get(&point.measurement) else {
            return Ok(());
        };

        for (name, value) in &point.fields {
            match schema.fields.get(name) {
                None => {
                    return Err(TimeseriesError::Schema(format!(
                        "unknown field '{}' for measurement '{}'",
                        name, point.measurement
                    )))
                }
                Some(kind) if !kind.accepts(value) => {
                    return Err(TimeseriesError::Schema(format!(
                        "field '{}' of '{}' expects {:?}",
                        name, point.measurement, kind
                    )))
                }
                Some(_) => {}
            }
        }

        for tag in &schema.required_tags {
            if !point.tags.contains_key(tag) {
                return Err(TimeseriesError::Schema(format!(
                    "missing required tag '{}' for measurement '{}'",
                    tag, point.measurement
                )));
            }
        }

        Ok(())
    }
}
