//! Identity types: primary keys, object instances, optimistic layer ids.

use crate::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Timestamp type used for `last_updated` on every cache write.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Primary key of an object. Ontologies key objects by string or integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Integer(i64),
    String(String),
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Integer(v) => write!(f, "{}", v),
            PrimaryKey::String(v) => f.write_str(v),
        }
    }
}

impl From<i64> for PrimaryKey {
    fn from(value: i64) -> Self {
        PrimaryKey::Integer(value)
    }
}

impl From<i32> for PrimaryKey {
    fn from(value: i32) -> Self {
        PrimaryKey::Integer(i64::from(value))
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        PrimaryKey::String(value.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(value: String) -> Self {
        PrimaryKey::String(value)
    }
}

/// A materialized object as returned by the fetch collaborator.
///
/// Equality is deep: two instances are equal when type, key and every
/// property value are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectInstance {
    #[serde(rename = "$objectType")]
    pub object_type: String,
    #[serde(rename = "$primaryKey")]
    pub primary_key: PrimaryKey,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl ObjectInstance {
    pub fn new(object_type: impl Into<String>, primary_key: impl Into<PrimaryKey>) -> Self {
        Self {
            object_type: object_type.into(),
            primary_key: primary_key.into(),
            properties: Map::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(name.into(), value.into());
    }

    /// Look up a property. `$primaryKey` and `$objectType` resolve to the
    /// identity fields so filters can target them.
    pub fn property(&self, name: &str) -> Option<Value> {
        match name {
            "$primaryKey" => Some(match &self.primary_key {
                PrimaryKey::Integer(v) => Value::from(*v),
                PrimaryKey::String(v) => Value::from(v.as_str()),
            }),
            "$objectType" => Some(Value::from(self.object_type.as_str())),
            _ => self.properties.get(name).cloned(),
        }
    }
}

/// Identifier of an optimistic layer.
///
/// The truth layer has no id, so it cannot be named here; an empty id is
/// rejected at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OptimisticId(String);

impl OptimisticId {
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::EmptyOptimisticId);
        }
        Ok(Self(id))
    }

    /// Fresh time-ordered id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OptimisticId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OptimisticId> for String {
    fn from(id: OptimisticId) -> Self {
        id.0
    }
}

impl fmt::Display for OptimisticId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
