//! Per-event failure reporting.

use super::event::{ChainId, Event};
use super::error::LiveObjectError;

/// One event's lifecycle that was aborted.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub event_id: String,
    pub event_name: String,
    pub chain_id: ChainId,
    pub block_number: u64,
    /// `Entity::handler_name`
    pub handler: String,
    pub kind: &'static str,
    pub error: String,
}

impl FailureReport {
    pub fn new(event: &Event, handler: String, error: &LiveObjectError) -> Self {
        Self {
            event_id: event.id.clone(),
            event_name: event.name.clone(),
            chain_id: event.origin.chain_id.clone(),
            block_number: event.origin.block_number,
            handler,
            kind: error.kind(),
            error: error.to_string(),
        }
    }
}

/// Fire-and-forget sink for failed events. Must not block.
pub trait FailureReporter: Send + Sync {
    fn report(&self, report: FailureReport);
}

/// Logs every failure at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl FailureReporter for TracingReporter {
    fn report(&self, report: FailureReport) {
        tracing::error!(
            event_id = %report.event_id,
            event = %report.event_name,
            chain_id = %report.chain_id,
            block = report.block_number,
            handler = %report.handler,
            kind = report.kind,
            "Live object event failed: {}",
            report.error
        );
    }
}
