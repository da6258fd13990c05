//! Entity values and identity
//!
//! Entities are opaque JSON snapshots identified by `(meta.type, meta.id)`.
//! The engine never inspects anything beyond `meta`; an update replaces the
//! stored value wholesale instead of mutating it in place.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Error building an [`Entity`] from raw JSON.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityError {
    #[error("entity is missing meta.id")]
    MissingId,
    #[error("entity is missing meta.type")]
    MissingType,
}

/// A backend object identified by `(meta.type, meta.id)`.
///
/// Construction validates that both identity fields are present, so the
/// accessors below cannot fail afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Entity(Value);

impl Entity {
    /// Validate raw JSON into an entity.
    pub fn from_value(value: Value) -> Result<Self, EntityError> {
        let meta = value.get("meta");
        if meta
            .and_then(|m| m.get("id"))
            .and_then(Value::as_str)
            .is_none()
        {
            return Err(EntityError::MissingId);
        }
        if meta
            .and_then(|m| m.get("type"))
            .and_then(Value::as_str)
            .is_none()
        {
            return Err(EntityError::MissingType);
        }
        Ok(Self(value))
    }

    /// The entity id (`meta.id`).
    pub fn id(&self) -> &str {
        self.0["meta"]["id"].as_str().unwrap_or_default()
    }

    /// The entity type (`meta.type`).
    pub fn entity_type(&self) -> &str {
        self.0["meta"]["type"].as_str().unwrap_or_default()
    }

    /// The underlying JSON value.
    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

// Deserialization goes through `from_value` so an entity without identity
// fields is rejected at the wire boundary.
impl<'de> Deserialize<'de> for Entity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Entity::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// A mutation argument that may be a bare id or a full entity.
///
/// Only removal accepts a bare id; insertion and update need the entity
/// value itself.
#[derive(Debug, Clone)]
pub enum ItemRef {
    Id(String),
    Entity(Entity),
}

impl ItemRef {
    pub fn id(&self) -> &str {
        match self {
            ItemRef::Id(id) => id,
            ItemRef::Entity(entity) => entity.id(),
        }
    }
}

impl From<&str> for ItemRef {
    fn from(id: &str) -> Self {
        ItemRef::Id(id.to_string())
    }
}

impl From<String> for ItemRef {
    fn from(id: String) -> Self {
        ItemRef::Id(id)
    }
}

impl From<Entity> for ItemRef {
    fn from(entity: Entity) -> Self {
        ItemRef::Entity(entity)
    }
}

impl From<&Entity> for ItemRef {
    fn from(entity: &Entity) -> Self {
        ItemRef::Entity(entity.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_value_requires_identity() {
        let ok = Entity::from_value(json!({"meta": {"id": "a1", "type": "network"}}));
        assert!(ok.is_ok());
        let entity = ok.unwrap();
        assert_eq!(entity.id(), "a1");
        assert_eq!(entity.entity_type(), "network");

        assert_eq!(
            Entity::from_value(json!({"meta": {"type": "network"}})),
            Err(EntityError::MissingId)
        );
        assert_eq!(
            Entity::from_value(json!({"meta": {"id": "a1"}})),
            Err(EntityError::MissingType)
        );
        assert_eq!(Entity::from_value(json!(42)), Err(EntityError::MissingId));
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Result<Entity, _> =
            serde_json::from_str(r#"{"meta": {"id": "a1", "type": "device"}}"#);
        assert!(ok.is_ok());

        let bad: Result<Entity, _> = serde_json::from_str(r#"{"name": "no meta"}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_item_ref_id() {
        let entity = Entity::from_value(json!({"meta": {"id": "x", "type": "device"}})).unwrap();
        assert_eq!(ItemRef::from("x").id(), "x");
        assert_eq!(ItemRef::from(entity).id(), "x");
    }
}
