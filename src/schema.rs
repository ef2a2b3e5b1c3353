use std::fmt::Display;

use crate::StorageError;

/// Fixed payload length, in bytes, of a [`FieldType::Text`] field. Text values
/// are stored as a 4-byte length followed by exactly this many payload bytes.
pub const TEXT_LEN: usize = 128;

/// The type tag of a single field in a [`Schema`].
/// Every type has a fixed on-disk width, independent of the data stored in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int,
    Text,
}

impl FieldType {
    pub const INT_BYTES: usize = 4;

    /// The number of bytes a value of this type occupies inside a tuple.
    /// This width is shared with the page layout; the two must never disagree.
    pub const fn byte_len(&self) -> usize {
        match self {
            FieldType::Int => Self::INT_BYTES,
            //  4-byte length prefix followed by the fixed payload region
            FieldType::Text => Self::INT_BYTES + TEXT_LEN,
        }
    }
}

impl Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::Int => write!(f, "int"),
            FieldType::Text => write!(f, "text"),
        }
    }
}

/// A single (type, optional name) entry of a [`Schema`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FieldDesc {
    field_type: FieldType,
    name: Option<String>,
}

/// An immutable, ordered description of a tuple's shape.
///
/// Field order is significant and fixed at construction. Equality and hashing
/// are structural over (type, name presence, name value) per field, so equal
/// schemas can safely be used as hash-map keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Schema {
    fields: Vec<FieldDesc>,
}

impl Schema {
    /// Create a schema with the given field types, all fields unnamed.
    pub fn new(types: &[FieldType]) -> Result<Self, StorageError> {
        Self::with_names(types, &[])
    }

    /// Create a schema with the given field types and names. When `names` is
    /// shorter than `types`, the remaining fields are unnamed.
    pub fn with_names(types: &[FieldType], names: &[&str]) -> Result<Self, StorageError> {
        if types.is_empty() {
            return Err(StorageError::EmptySchema);
        }
        let fields = types
            .iter()
            .enumerate()
            .map(|(i, field_type)| FieldDesc {
                field_type: *field_type,
                name: names.get(i).map(|name| name.to_string()),
            })
            .collect();
        Ok(Self { fields })
    }

    /// The number of fields in this schema
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// The type of the field at index `i`
    pub fn field_type(&self, i: usize) -> Result<FieldType, StorageError> {
        self.fields
            .get(i)
            .map(|field| field.field_type)
            .ok_or(StorageError::FieldIndexOutOfRange {
                index: i,
                field_count: self.fields.len(),
            })
    }

    /// The name of the field at index `i`, if it has one
    pub fn field_name(&self, i: usize) -> Result<Option<&str>, StorageError> {
        self.fields
            .get(i)
            .map(|field| field.name.as_deref())
            .ok_or(StorageError::FieldIndexOutOfRange {
                index: i,
                field_count: self.fields.len(),
            })
    }

    /// The index of the first field named `name`. Unnamed fields never match.
    pub fn index_of(&self, name: &str) -> Result<usize, StorageError> {
        self.fields
            .iter()
            .position(|field| field.name.as_deref() == Some(name))
            .ok_or_else(|| StorageError::FieldNotFound(name.to_string()))
    }

    /// The fixed byte size of one tuple laid out with this schema
    pub fn byte_size(&self) -> usize {
        self.fields
            .iter()
            .map(|field| field.field_type.byte_len())
            .sum()
    }

    /// Build a new schema whose fields are `a`'s fields followed by `b`'s
    /// fields, preserving each side's types and names. Used when stitching
    /// together the output shape of a join.
    pub fn concat(a: &Schema, b: &Schema) -> Schema {
        let mut fields = Vec::with_capacity(a.fields.len() + b.fields.len());
        fields.extend(a.fields.iter().cloned());
        fields.extend(b.fields.iter().cloned());
        Schema { fields }
    }

    /// Iterate over the (type, name) pairs of this schema in field order.
    /// The iterator is cheap to recreate; calling this again restarts it.
    pub fn iter(&self) -> impl Iterator<Item = (FieldType, Option<&str>)> + '_ {
        self.fields
            .iter()
            .map(|field| (field.field_type, field.name.as_deref()))
    }
}

impl Display for Schema {
    /// Renders as `type(name), type, ...` with the name omitted for unnamed fields
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match &field.name {
                Some(name) => write!(f, "{}({})", field.field_type, name)?,
                None => write!(f, "{}", field.field_type)?,
            }
        }
        Ok(())
    }
}
