//! Per-repository indexable-field declarations.

use crate::error::StoreError;

/// Reserved column/field names that cannot be used for a declared field.
const RESERVED_FIELDS: &[&str] = &["id", "data", "_lasteventId"];

/// SQL types `sqlite_*` reserves for its own catalog; rejected as repository
/// or table names defensively even though we always suffix/prefix ours.
const RESERVED_PREFIX: &str = "sqlite_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Integer,
    Real,
    Boolean,
    DateTime,
    Blob,
}

impl FieldType {
    pub fn sql_type(self) -> &'static str {
        match self {
            FieldType::Text => "TEXT",
            FieldType::Integer => "INTEGER",
            FieldType::Real => "REAL",
            FieldType::Boolean => "INTEGER",
            FieldType::DateTime => "INTEGER",
            FieldType::Blob => "BLOB",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchemaField {
    pub name: String,
    pub field_type: FieldType,
}

impl SchemaField {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self { name: name.into(), field_type }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub fields: Vec<SchemaField>,
}

impl Schema {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// `[A-Za-z0-9_]+`, not reserved, not `sqlite_`-prefixed.
pub fn validate_field_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty()
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(StoreError::InvalidField(name.to_string()));
    }
    if RESERVED_FIELDS.contains(&name) {
        return Err(StoreError::InvalidField(name.to_string()));
    }
    if name.starts_with(RESERVED_PREFIX) {
        return Err(StoreError::InvalidField(name.to_string()));
    }
    Ok(())
}

pub fn validate_repository_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty()
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(StoreError::InvalidField(name.to_string()));
    }
    if name.starts_with(RESERVED_PREFIX) {
        return Err(StoreError::InvalidField(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_reserved_names() {
        assert!(validate_field_name("id").is_err());
        assert!(validate_field_name("data").is_err());
        assert!(validate_field_name("_lasteventId").is_err());
    }

    #[test]
    fn rejects_non_alphanumeric() {
        assert!(validate_field_name("first-name").is_err());
        assert!(validate_field_name("").is_err());
    }

    #[test]
    fn accepts_plain_names() {
        assert!(validate_field_name("name").is_ok());
        assert!(validate_field_name("created_at_ms").is_ok());
    }

    #[test]
    fn rejects_sqlite_prefix() {
        assert!(validate_repository_name("sqlite_master").is_err());
    }
}
