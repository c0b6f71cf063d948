//! Mutable record instances handed to handlers.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::B256;
use serde_json::Value;

use crate::db::DbValue;

use super::error::{CoercionError, HandlerError};
use super::event::{ChainId, EventOrigin};
use super::schema::{BaseProperty, EntityDefinition, KeyProperty};

/// Blockchain context every record carries. Hydrated from the event origin
/// before the handler runs and overwritten on every persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseProperties {
    pub chain_id: ChainId,
    pub block_number: u64,
    /// Unix seconds
    pub block_timestamp: u64,
    pub block_hash: B256,
}

impl BaseProperties {
    pub fn from_origin(origin: &EventOrigin) -> Self {
        Self {
            chain_id: origin.chain_id.clone(),
            block_number: origin.block_number,
            block_timestamp: origin.block_timestamp,
            block_hash: origin.block_hash,
        }
    }

    pub fn json(&self, property: BaseProperty) -> Value {
        match property {
            BaseProperty::ChainId => Value::from(self.chain_id.clone()),
            BaseProperty::BlockNumber => Value::from(self.block_number),
            BaseProperty::BlockTimestamp => Value::from(self.block_timestamp),
            BaseProperty::BlockHash => Value::from(format!("0x{}", hex::encode(self.block_hash.as_slice()))),
        }
    }

    pub fn db_value(&self, property: BaseProperty) -> Result<DbValue, CoercionError> {
        property
            .property_type()
            .coerce(property.name(), &self.json(property))
    }
}

/// One entity's projection for one event.
///
/// Declared properties start unset. Setting a property to JSON `null` is
/// distinct from leaving it unset: `null` is written, unset is omitted.
#[derive(Debug, Clone)]
pub struct RecordInstance {
    entity: Arc<EntityDefinition>,
    base: BaseProperties,
    values: HashMap<String, Value>,
}

impl RecordInstance {
    pub fn new(entity: Arc<EntityDefinition>, origin: &EventOrigin) -> Self {
        Self {
            entity,
            base: BaseProperties::from_origin(origin),
            values: HashMap::new(),
        }
    }

    pub fn entity(&self) -> &EntityDefinition {
        &self.entity
    }

    pub fn base(&self) -> &BaseProperties {
        &self.base
    }

    /// Set a declared property. Values are checked against the property type
    /// when the record is persisted.
    pub fn set(&mut self, property: &str, value: impl Into<Value>) -> Result<&mut Self, HandlerError> {
        if self.entity.property(property).is_none() {
            return Err(HandlerError::UnknownProperty {
                entity: self.entity.name().to_string(),
                property: property.to_string(),
            });
        }
        self.values.insert(property.to_string(), value.into());
        Ok(self)
    }

    /// Value of a declared property, or a base property rendered as JSON.
    pub fn get(&self, property: &str) -> Option<Value> {
        if let Some(base) = BaseProperty::from_name(property) {
            return Some(self.base.json(base));
        }
        self.values.get(property).cloned()
    }

    pub fn is_set(&self, property: &str) -> bool {
        BaseProperty::from_name(property).is_some() || self.values.contains_key(property)
    }

    /// Return a property to the unset state.
    pub fn unset(&mut self, property: &str) -> Option<Value> {
        self.values.remove(property)
    }

    pub(crate) fn raw_value(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    /// First uniqueBy property that is unset or null, if any.
    pub fn missing_unique_property(&self) -> Option<&str> {
        self.entity
            .unique_key()
            .iter()
            .zip(self.entity.unique_by())
            .find_map(|(key, name)| match key {
                KeyProperty::Base(_) => None,
                KeyProperty::Declared(_) => match self.values.get(name) {
                    None | Some(Value::Null) => Some(name.as_str()),
                    Some(_) => None,
                },
            })
    }

    /// A record is saved only once every uniqueBy property carries a value.
    pub fn is_saveable(&self) -> bool {
        self.missing_unique_property().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live_object::schema::{PropertyDef, PropertyType};
    use crate::live_object::testing::sample_event;
    use serde_json::json;

    fn entity() -> Arc<EntityDefinition> {
        Arc::new(
            EntityDefinition::builder("Project", "allo.projects")
                .property(PropertyDef::new("projectId", PropertyType::Number))
                .property(PropertyDef::new("name", PropertyType::String))
                .unique_by(["projectId", "chainId"])
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_base_properties_hydrated_from_origin() {
        let event = sample_event("allo.Registry.ProjectCreated", "1", 42);
        let record = RecordInstance::new(entity(), &event.origin);

        assert_eq!(record.base().chain_id, "1");
        assert_eq!(record.base().block_number, 42);
        assert_eq!(record.get("blockNumber"), Some(json!(42)));
        assert_eq!(record.get("chainId"), Some(json!("1")));
        assert_eq!(
            record.base().db_value(BaseProperty::BlockNumber).unwrap(),
            DbValue::Int64(42)
        );
    }

    #[test]
    fn test_unset_and_null_are_distinct() {
        let event = sample_event("allo.Registry.ProjectCreated", "1", 1);
        let mut record = RecordInstance::new(entity(), &event.origin);

        assert!(!record.is_set("name"));
        record.set("name", Value::Null).unwrap();
        assert!(record.is_set("name"));
        assert_eq!(record.get("name"), Some(Value::Null));
        record.unset("name");
        assert!(!record.is_set("name"));
    }

    #[test]
    fn test_unique_key_completeness() {
        let event = sample_event("allo.Registry.ProjectCreated", "1", 1);
        let mut record = RecordInstance::new(entity(), &event.origin);

        assert_eq!(record.missing_unique_property(), Some("projectId"));
        record.set("projectId", Value::Null).unwrap();
        assert!(!record.is_saveable());
        record.set("projectId", 1007).unwrap();
        assert!(record.is_saveable());
    }

    #[test]
    fn test_set_rejects_undeclared_property() {
        let event = sample_event("allo.Registry.ProjectCreated", "1", 1);
        let mut record = RecordInstance::new(entity(), &event.origin);

        assert!(matches!(
            record.set("owner", "0x00"),
            Err(HandlerError::UnknownProperty { .. })
        ));
        assert!(record.set("blockNumber", 5).is_err());
    }
}
