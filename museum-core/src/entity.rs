//! Server objects: floors, rooms, items and topics.
//!
//! The backend answers in two shapes. Floors, rooms and items come back as
//! flat records (`{"id": 1, "label": "...", "rooms": [..]}`); floor topics and
//! the config object come back as JSON:API resources with separate
//! `attributes` and `relationships`. Both are lifted into one [`Entity`].

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};
use crate::store::Keyed;

/// Stable id of a server object. Numeric strings are normalized to `Int`,
/// so `"12"` and `12` name the same object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityId {
    Int(i64),
    Str(String),
}

impl EntityId {
    /// Parse a path component or query value.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(id) => EntityId::Int(id),
            Err(_) => EntityId::Str(raw.to_string()),
        }
    }

    /// Read an id out of a JSON number or string.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(EntityId::Int),
            Value::String(s) => Some(EntityId::parse(s)),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            EntityId::Int(id) => Some(*id),
            EntityId::Str(_) => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(id) => write!(f, "{id}"),
            EntityId::Str(id) => f.write_str(id),
        }
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        EntityId::Int(id)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        EntityId::parse(id)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        EntityId::parse(&id)
    }
}

impl Serialize for EntityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            EntityId::Int(id) => serializer.serialize_i64(*id),
            EntityId::Str(id) => serializer.serialize_str(id),
        }
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Int(i64),
            Str(String),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Int(id) => EntityId::Int(id),
            RawId::Str(id) => EntityId::parse(&id),
        })
    }
}

/// Reference to another object by type and id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub id: EntityId,
}

/// A relationship to zero, one or many other objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawRelationship", into = "RawRelationship")]
pub enum Relationship {
    Single(Option<EntityRef>),
    Many(Vec<EntityRef>),
}

impl Relationship {
    /// Ids of every referenced object.
    pub fn ids(&self) -> Vec<EntityId> {
        match self {
            Relationship::Single(Some(target)) => vec![target.id.clone()],
            Relationship::Single(None) => Vec::new(),
            Relationship::Many(targets) => targets.iter().map(|t| t.id.clone()).collect(),
        }
    }

    /// Every reference, in order.
    pub fn refs(&self) -> Vec<&EntityRef> {
        match self {
            Relationship::Single(target) => target.iter().collect(),
            Relationship::Many(targets) => targets.iter().collect(),
        }
    }

    /// The referenced id of a to-one relationship.
    pub fn single_id(&self) -> Option<&EntityId> {
        match self {
            Relationship::Single(Some(target)) => Some(&target.id),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawRelationship {
    #[serde(default)]
    data: Option<RawLinkage>,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawLinkage {
    Many(Vec<EntityRef>),
    Single(EntityRef),
}

impl From<RawRelationship> for Relationship {
    fn from(raw: RawRelationship) -> Self {
        match raw.data {
            None => Relationship::Single(None),
            Some(RawLinkage::Single(target)) => Relationship::Single(Some(target)),
            Some(RawLinkage::Many(targets)) => Relationship::Many(targets),
        }
    }
}

impl From<Relationship> for RawRelationship {
    fn from(relationship: Relationship) -> Self {
        let data = match relationship {
            Relationship::Single(target) => target.map(RawLinkage::Single),
            Relationship::Many(targets) => Some(RawLinkage::Many(targets)),
        };
        RawRelationship { data }
    }
}

/// One server object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub relationships: IndexMap<String, Relationship>,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            kind: None,
            attributes: Map::new(),
            relationships: IndexMap::new(),
        }
    }

    /// Lift any object the backend returns. Objects with an `attributes`
    /// member are read as JSON:API resources, anything else as a flat
    /// record whose non-`id` fields become attributes.
    pub fn from_value(value: Value) -> Result<Self> {
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => return Err(StoreError::Decode(format!("expected an object, got {other}"))),
        };
        if fields.get("attributes").is_some_and(Value::is_object) {
            return Ok(serde_json::from_value(Value::Object(fields))?);
        }

        let id = fields
            .remove("id")
            .as_ref()
            .and_then(EntityId::from_value)
            .ok_or_else(|| StoreError::Decode("record without a usable id".to_string()))?;
        let kind = match fields.remove("type") {
            Some(Value::String(kind)) => Some(kind),
            Some(other) => {
                fields.insert("type".to_string(), other);
                None
            }
            None => None,
        };
        Ok(Self {
            id,
            kind,
            attributes: fields,
            relationships: IndexMap::new(),
        })
    }

    pub fn with_attribute(mut self, name: &str, value: Value) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn with_relationship(mut self, name: &str, relationship: Relationship) -> Self {
        self.relationships.insert(name.to_string(), relationship);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    pub fn attribute_str(&self, name: &str) -> Option<&str> {
        self.attribute(name).and_then(Value::as_str)
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.get(name)
    }

    /// Id of the object a to-one relationship points at.
    pub fn related_id(&self, name: &str) -> Option<&EntityId> {
        self.relationship(name).and_then(Relationship::single_id)
    }

    /// Ids listed under `name`, either as a relationship or as a flat
    /// attribute array (`"rooms": [1, 2]`).
    pub fn id_list(&self, name: &str) -> Vec<EntityId> {
        if let Some(relationship) = self.relationship(name) {
            return relationship.ids();
        }
        match self.attribute(name) {
            Some(Value::Array(values)) => values.iter().filter_map(EntityId::from_value).collect(),
            _ => Vec::new(),
        }
    }
}

impl Keyed for Entity {
    type Key = EntityId;

    fn key(&self) -> EntityId {
        self.id.clone()
    }
}
