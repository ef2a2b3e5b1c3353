use std::fmt::Display;

use crate::schema::{FieldType, Schema, TEXT_LEN};
use crate::PageId;

/// The location of a stored tuple: the page holding it and its slot index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub page_id: PageId,
    pub slot: usize,
}

impl RecordId {
    pub fn new(page_id: PageId, slot: usize) -> Self {
        Self { page_id, slot }
    }
}

/// A single stored field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i32),
    Text(String),
}

impl Value {
    /// Build a text value, truncating to the fixed payload width if oversize
    pub fn text(s: &str) -> Self {
        let mut end = s.len().min(TEXT_LEN);
        //  back off to a character boundary so the cut never splits a code point
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        Value::Text(s[..end].to_string())
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            Value::Int(_) => FieldType::Int,
            Value::Text(_) => FieldType::Text,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

/// One row's worth of schema-typed values.
///
/// Tuples decoded from a page carry the [`RecordId`] of the slot they came
/// from; freshly built tuples have none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    values: Vec<Value>,
    record_id: Option<RecordId>,
}

impl Tuple {
    pub fn new(values: Vec<Value>) -> Self {
        Self {
            values,
            record_id: None,
        }
    }

    pub(crate) fn with_record_id(values: Vec<Value>, record_id: RecordId) -> Self {
        Self {
            values,
            record_id: Some(record_id),
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, i: usize) -> Option<&Value> {
        self.values.get(i)
    }

    pub fn record_id(&self) -> Option<&RecordId> {
        self.record_id.as_ref()
    }

    /// Check that this tuple's values line up with `schema` field for field
    pub fn matches_schema(&self, schema: &Schema) -> bool {
        if self.values.len() != schema.field_count() {
            return false;
        }
        self.values
            .iter()
            .zip(schema.iter())
            .all(|(value, (field_type, _))| value.field_type() == field_type)
    }
}

impl Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, value) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, "\t")?;
            }
            write!(f, "{}", value)?;
        }
        Ok(())
    }
}
