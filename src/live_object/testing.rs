//! Shared fixtures for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use alloy::dyn_abi::DynSolValue;
use async_trait::async_trait;
use serde_json::json;

use super::context::HandlerContext;
use super::error::HandlerError;
use super::event::Event;
use super::external::{ContractCall, ContractCaller, ExternalCallError};
use super::record::RecordInstance;
use super::report::{FailureReport, FailureReporter};
use super::traits::LiveObjectHandler;

pub const SAMPLE_CONTRACT: &str = "0x1133ea7af70876e64665ecd07c0a0476d09465a1";

/// A `ProjectCreated`-shaped event at `block_number`.
pub fn sample_event(name: &str, chain_id: &str, block_number: u64) -> Event {
    serde_json::from_value(json!({
        "id": format!("{}-{}", name, block_number),
        "name": name,
        "origin": {
            "chainId": chain_id,
            "blockNumber": block_number,
            "blockHash": format!("0x{:064x}", block_number),
            "blockTimestamp": 1_700_000_000u64 + block_number,
            "contractAddress": SAMPLE_CONTRACT,
            "transactionHash": format!("0x{:064x}", block_number + 1),
            "transactionIndex": 0,
            "logIndex": 0,
            "signature": "ProjectCreated(uint256,address)"
        },
        "data": {
            "projectID": 1007,
            "params": { "owner": "0x00000000000000000000000000000000000000aa" }
        }
    }))
    .expect("sample event deserializes")
}

type HandleFn =
    dyn Fn(&Event, &mut RecordInstance, &mut HandlerContext) -> Result<(), HandlerError> + Send + Sync;

/// Handler built from a closure, with optional ordering key and artificial delay.
pub struct FnHandler {
    name: &'static str,
    handle: Box<HandleFn>,
    ordering_key: Option<Box<dyn Fn(&Event) -> Option<String> + Send + Sync>>,
    delay: Option<Box<dyn Fn(&Event) -> Duration + Send + Sync>>,
}

impl FnHandler {
    pub fn new<F>(name: &'static str, handle: F) -> Self
    where
        F: Fn(&Event, &mut RecordInstance, &mut HandlerContext) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name,
            handle: Box::new(handle),
            ordering_key: None,
            delay: None,
        }
    }

    pub fn with_ordering_key<K>(mut self, key: K) -> Self
    where
        K: Fn(&Event) -> Option<String> + Send + Sync + 'static,
    {
        self.ordering_key = Some(Box::new(key));
        self
    }

    /// Sleep before handling, to force interleavings.
    pub fn with_delay<D>(mut self, delay: D) -> Self
    where
        D: Fn(&Event) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Box::new(delay));
        self
    }
}

#[async_trait]
impl LiveObjectHandler for FnHandler {
    fn name(&self) -> &'static str {
        self.name
    }

    fn ordering_key(&self, event: &Event) -> Option<String> {
        self.ordering_key.as_ref().and_then(|key| key(event))
    }

    async fn handle(
        &self,
        event: &Event,
        record: &mut RecordInstance,
        ctx: &mut HandlerContext,
    ) -> Result<(), HandlerError> {
        if let Some(delay) = &self.delay {
            tokio::time::sleep(delay(event)).await;
        }
        (self.handle)(event, record, ctx)
    }
}

/// Contract caller that replays scripted results and records requests.
pub struct ScriptedCaller {
    results: Mutex<VecDeque<Result<DynSolValue, ExternalCallError>>>,
    requests: Mutex<Vec<ContractCall>>,
}

impl ScriptedCaller {
    pub fn new(results: Vec<Result<DynSolValue, ExternalCallError>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ContractCall> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContractCaller for ScriptedCaller {
    async fn call(&self, request: &ContractCall) -> Result<DynSolValue, ExternalCallError> {
        self.requests.lock().unwrap().push(request.clone());
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ExternalCallError::Permanent("script exhausted".into())))
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<FailureReport>>,
}

impl RecordingReporter {
    pub fn reports(&self) -> Vec<FailureReport> {
        self.reports.lock().unwrap().clone()
    }
}

impl FailureReporter for RecordingReporter {
    fn report(&self, report: FailureReport) {
        self.reports.lock().unwrap().push(report);
    }
}
