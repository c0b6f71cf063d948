//! Allo registry projects.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::live_object::context::HandlerContext;
use crate::live_object::error::{ConfigError, HandlerError};
use crate::live_object::event::Event;
use crate::live_object::external::ExternalCallError;
use crate::live_object::record::RecordInstance;
use crate::live_object::registry::RegistryBuilder;
use crate::live_object::schema::{EntityDefinition, PropertyDef, PropertyType};
use crate::live_object::traits::LiveObjectHandler;

pub const ENTITY: &str = "Project";
pub const TABLE: &str = "allo.projects";

pub fn definition() -> Result<EntityDefinition, ConfigError> {
    EntityDefinition::builder(ENTITY, TABLE)
        .property(PropertyDef::new("projectId", PropertyType::BigInt))
        .property(PropertyDef::new("owner", PropertyType::Address))
        .property(PropertyDef::new("name", PropertyType::String))
        .property(PropertyDef::new("metadataPointer", PropertyType::String))
        .property(PropertyDef::new("metadata", PropertyType::Json))
        .property(PropertyDef::new("createdAt", PropertyType::Timestamp).can_update(false))
        .property(PropertyDef::new("updatedAt", PropertyType::Timestamp))
        .property(PropertyDef::new("isActive", PropertyType::Boolean).default(true))
        .unique_by(["projectId", "chainId"])
        .chains(["1", "10", "137", "42161"])
        .build()
}

/// `chainId:projectID`, the uniqueBy values as they appear on the event.
fn project_key(event: &Event) -> Option<String> {
    let project_id = event.get_string("projectID").ok()?;
    Some(format!("{}:{}", event.origin.chain_id, project_id))
}

pub struct ProjectCreatedHandler;

#[async_trait]
impl LiveObjectHandler for ProjectCreatedHandler {
    fn name(&self) -> &'static str {
        "ProjectCreatedHandler"
    }

    fn ordering_key(&self, event: &Event) -> Option<String> {
        project_key(event)
    }

    async fn handle(
        &self,
        event: &Event,
        record: &mut RecordInstance,
        _ctx: &mut HandlerContext,
    ) -> Result<(), HandlerError> {
        let timestamp = record.base().block_timestamp;

        record.set("projectId", event.get("projectID")?.clone())?;
        record.set("createdAt", timestamp)?;
        record.set("updatedAt", timestamp)?;

        let owner = event
            .try_get("params.owner")
            .or_else(|| event.try_get("owner"));
        if let Some(owner) = owner {
            record.set("owner", owner.clone())?;
        }

        Ok(())
    }
}

pub struct ProjectMetadataUpdatedHandler;

#[async_trait]
impl LiveObjectHandler for ProjectMetadataUpdatedHandler {
    fn name(&self) -> &'static str {
        "ProjectMetadataUpdatedHandler"
    }

    fn ordering_key(&self, event: &Event) -> Option<String> {
        project_key(event)
    }

    async fn handle(
        &self,
        event: &Event,
        record: &mut RecordInstance,
        ctx: &mut HandlerContext,
    ) -> Result<(), HandlerError> {
        let timestamp = record.base().block_timestamp;
        record.set("projectId", event.get("projectID")?.clone())?;
        record.set("updatedAt", timestamp)?;

        let Some(pointer) = event
            .try_get("metaPtr.pointer")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return Ok(());
        };
        record.set("metadataPointer", pointer.clone())?;

        if !ctx.has_metadata_resolver() {
            return Ok(());
        }

        match ctx.resolve_metadata(&pointer).await {
            Ok(metadata) => {
                if let Some(title) = metadata.get("title").and_then(Value::as_str) {
                    record.set("name", title)?;
                }
                record.set("metadata", metadata)?;
            }
            // Content that will never resolve leaves the stored metadata alone.
            Err(HandlerError::ExternalCall(ExternalCallError::Permanent(reason))) => {
                tracing::warn!(
                    "Metadata {} for project {} unavailable: {}",
                    pointer,
                    event.get_string("projectID")?,
                    reason
                );
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }
}

pub fn register(builder: &mut RegistryBuilder) -> Result<(), ConfigError> {
    builder.entity(definition()?)?;
    builder
        .on_event(ENTITY, "allo.Registry.ProjectCreated", Arc::new(ProjectCreatedHandler))?
        .on_event(
            ENTITY,
            "allo.Registry.ProjectMetadataUpdated",
            Arc::new(ProjectMetadataUpdatedHandler),
        )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbValue, MemoryStore, UpsertOutcome};
    use crate::live_object::context::Capabilities;
    use crate::live_object::contract_groups::ContractGroupRegistry;
    use crate::live_object::external::MetadataResolver;
    use crate::live_object::lifecycle::{LifecycleManager, LifecycleOutcome};
    use crate::live_object::registry::ChainRegistry;
    use crate::live_object::report::TracingReporter;
    use crate::live_object::schema::PropertyType;
    use crate::live_object::testing::sample_event;
    use crate::live_object::upsert::UpsertEngine;
    use serde_json::json;

    struct StaticMetadata;

    #[async_trait]
    impl MetadataResolver for StaticMetadata {
        async fn resolve(&self, uri: &str) -> Result<Value, ExternalCallError> {
            match uri {
                "bafy-good" => Ok(json!({ "title": "Gitcoin", "website": "https://gitcoin.co" })),
                _ => Err(ExternalCallError::Permanent(format!("{} not pinned", uri))),
            }
        }
    }

    fn lifecycle(store: Arc<MemoryStore>, capabilities: Capabilities) -> LifecycleManager {
        let mut builder = RegistryBuilder::new(ChainRegistry::new().with_chain("eth", "1"));
        register(&mut builder).unwrap();
        LifecycleManager::new(
            Arc::new(builder.build().unwrap()),
            UpsertEngine::new(store),
            Arc::new(ContractGroupRegistry::new()),
            capabilities,
            Arc::new(TracingReporter),
        )
    }

    fn metadata_event(block: u64, pointer: &str) -> Event {
        let mut event = sample_event("allo.Registry.ProjectMetadataUpdated", "1", block);
        event.data.insert("metaPtr".into(), json!({ "protocol": 1, "pointer": pointer }));
        event
    }

    #[tokio::test]
    async fn test_project_created_end_to_end() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = lifecycle(store.clone(), Capabilities::default());
        let event = sample_event("allo.Registry.ProjectCreated", "1", 18_000_000);

        let outcomes = lifecycle.handle_event(&event).await;
        assert_eq!(outcomes, Some(LifecycleOutcome::Persisted(UpsertOutcome::Inserted)));

        let row = store.get(TABLE, &["1007", "1"]).unwrap();
        let created_at = PropertyType::Timestamp
            .coerce("createdAt", &json!(event.origin.block_timestamp))
            .unwrap();
        assert_eq!(row["project_id"], DbValue::Numeric("1007".into()));
        assert_eq!(row["created_at"], created_at);
        assert_eq!(row["is_active"], DbValue::Bool(true));
        assert_eq!(row["chain_id"], DbValue::Text("1".into()));
        assert_eq!(row["block_number"], DbValue::Int64(18_000_000));
        assert_eq!(row["block_timestamp"], created_at);
        assert_eq!(
            row["block_hash"],
            DbValue::Text(format!("0x{:064x}", 18_000_000u64))
        );
        assert_eq!(
            row["owner"],
            DbValue::Text("0x00000000000000000000000000000000000000aa".into())
        );
        assert!(!row.contains_key("name"));
    }

    #[tokio::test]
    async fn test_metadata_update_keeps_created_at() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = lifecycle(
            store.clone(),
            Capabilities::default().with_metadata_resolver(Arc::new(StaticMetadata)),
        );

        let created = sample_event("allo.Registry.ProjectCreated", "1", 100);
        lifecycle.handle_event(&created).await;
        let outcomes = lifecycle.handle_event(&metadata_event(200, "bafy-good")).await;
        assert_eq!(outcomes, Some(LifecycleOutcome::Persisted(UpsertOutcome::Updated)));

        let row = store.get(TABLE, &["1007", "1"]).unwrap();
        assert_eq!(
            row["created_at"],
            PropertyType::Timestamp
                .coerce("createdAt", &json!(created.origin.block_timestamp))
                .unwrap()
        );
        assert_eq!(row["name"], DbValue::Text("Gitcoin".into()));
        assert_eq!(row["metadata_pointer"], DbValue::Text("bafy-good".into()));
        assert_eq!(row["block_number"], DbValue::Int64(200));
        assert_eq!(row["owner"], DbValue::Text("0x00000000000000000000000000000000000000aa".into()));
    }

    #[tokio::test]
    async fn test_unresolvable_metadata_still_saves_pointer() {
        let store = Arc::new(MemoryStore::new());
        let lifecycle = lifecycle(
            store.clone(),
            Capabilities::default().with_metadata_resolver(Arc::new(StaticMetadata)),
        );

        let outcomes = lifecycle.handle_event(&metadata_event(5, "bafy-missing")).await;
        assert_eq!(outcomes, Some(LifecycleOutcome::Persisted(UpsertOutcome::Inserted)));

        let row = store.get(TABLE, &["1007", "1"]).unwrap();
        assert_eq!(row["metadata_pointer"], DbValue::Text("bafy-missing".into()));
        assert!(!row.contains_key("metadata"));
    }

    #[tokio::test]
    async fn test_uint256_project_id_keeps_every_digit() {
        let sample = sample_event("allo.Registry.ProjectCreated", "1", 7);
        let raw = serde_json::to_string(&sample)
            .unwrap()
            .replace("\"projectID\":1007", "\"projectID\":1180591620717411303424");
        let event: Event = serde_json::from_str(&raw).unwrap();

        let store = Arc::new(MemoryStore::new());
        let outcome = lifecycle(store.clone(), Capabilities::default())
            .handle_event(&event)
            .await;
        assert_eq!(outcome, Some(LifecycleOutcome::Persisted(UpsertOutcome::Inserted)));

        let row = store.get(TABLE, &["1180591620717411303424", "1"]).unwrap();
        assert_eq!(row["project_id"], DbValue::Numeric("1180591620717411303424".into()));
        assert_eq!(
            ProjectCreatedHandler.ordering_key(&event),
            Some("1:1180591620717411303424".to_string())
        );
    }

    #[test]
    fn test_ordering_key_matches_unique_key() {
        let event = sample_event("allo.Registry.ProjectCreated", "10", 1);
        assert_eq!(ProjectCreatedHandler.ordering_key(&event), Some("10:1007".to_string()));
        assert_eq!(
            ProjectMetadataUpdatedHandler.ordering_key(&metadata_event(1, "x")),
            Some("1:1007".to_string())
        );
    }
}
