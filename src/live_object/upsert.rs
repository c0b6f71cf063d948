//! Turns a handled record into one atomic upsert.
//!
//! Column policies:
//! - base properties and set, updatable properties: overwritten
//! - set properties with `can_update(false)`: the stored value wins unless NULL
//! - unset properties with a default: written on insert only
//! - unset properties without a default: omitted
//!
//! A write from an earlier block than the stored row is skipped, so the
//! stored row always reflects the latest event applied to its key.

use std::sync::Arc;

use crate::db::{ColumnWrite, Store, UpdatePolicy, UpsertOutcome, UpsertRequest};

use super::error::LiveObjectError;
use super::record::RecordInstance;
use super::schema::{BaseProperty, KeyProperty};

#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn Store>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn save(&self, record: &RecordInstance) -> Result<UpsertOutcome, LiveObjectError> {
        let request = build_request(record)?;
        tracing::debug!(
            "Upserting {} key ({})",
            request.table,
            request.conflict_key_display()
        );
        Ok(self.store.upsert(request).await?)
    }
}

pub fn build_request(record: &RecordInstance) -> Result<UpsertRequest, LiveObjectError> {
    let entity = record.entity();
    let mut columns = Vec::with_capacity(entity.properties().len() + BaseProperty::ALL.len());

    for base in BaseProperty::ALL {
        columns.push(ColumnWrite::new(
            base.column(),
            record.base().db_value(base)?,
            base.property_type().default_column_type(),
            UpdatePolicy::Overwrite,
        ));
    }

    for property in entity.properties() {
        let (value, policy) = match (record.raw_value(&property.name), &property.default) {
            (Some(value), _) => {
                let policy = if property.can_update {
                    UpdatePolicy::Overwrite
                } else {
                    UpdatePolicy::PreserveExisting
                };
                (property.property_type.coerce(&property.name, value)?, policy)
            }
            (None, Some(default)) => (
                property.property_type.coerce(&property.name, default)?,
                UpdatePolicy::InsertOnly,
            ),
            (None, None) => continue,
        };
        columns.push(ColumnWrite::new(
            property.column(),
            value,
            property.resolved_column_type(),
            policy,
        ));
    }

    let mut conflict_columns = Vec::with_capacity(entity.unique_key().len());
    for (key, name) in entity.unique_key().iter().zip(entity.unique_by()) {
        let column = match key {
            KeyProperty::Base(base) => base.column().to_string(),
            KeyProperty::Declared(idx) => {
                let column = entity.properties()[*idx].column();
                // A default never stands in for an unset key property.
                let is_set = record.raw_value(name).is_some()
                    && columns.iter().any(|c| c.column == column && !c.value.is_null());
                if !is_set {
                    return Err(LiveObjectError::IncompleteUniqueKey {
                        entity: entity.name().to_string(),
                        property: name.clone(),
                    });
                }
                column
            }
        };
        conflict_columns.push(column);
    }

    // Unique key columns are written on both paths; the values are equal anyway.
    for column in columns.iter_mut() {
        if conflict_columns.contains(&column.column) {
            column.policy = UpdatePolicy::Overwrite;
        }
    }

    Ok(UpsertRequest {
        table: entity.table().to_string(),
        conflict_columns,
        columns,
        order_column: Some(BaseProperty::BlockNumber.column().to_string()),
    })
}
