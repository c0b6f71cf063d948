//! The trait live object handlers implement.

use async_trait::async_trait;

use super::context::HandlerContext;
use super::error::HandlerError;
use super::event::Event;
use super::record::RecordInstance;

/// Transforms one event into changes on one record instance.
///
/// Handlers are registered against event-name patterns with
/// [`RegistryBuilder::on_event`](super::registry::RegistryBuilder::on_event).
/// The record arrives with base properties hydrated and every declared
/// property unset; whatever the handler leaves in it is persisted if the
/// uniqueBy properties are all set.
#[async_trait]
pub trait LiveObjectHandler: Send + Sync + 'static {
    /// Name used in logs and failure reports (as `Entity::name`).
    fn name(&self) -> &'static str;

    /// Partition key for ordered processing, usually the uniqueBy values
    /// read straight off the event (e.g. `"1:1007"`).
    ///
    /// Events for the same entity and key are handled strictly in chain
    /// order; different keys run in parallel. `None` serializes every event
    /// of the entity. All handlers of one entity must derive keys the same
    /// way for this to hold across handlers.
    fn ordering_key(&self, _event: &Event) -> Option<String> {
        None
    }

    async fn handle(
        &self,
        event: &Event,
        record: &mut RecordInstance,
        ctx: &mut HandlerContext,
    ) -> Result<(), HandlerError>;
}
