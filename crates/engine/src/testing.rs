//! In-memory collaborators for tests.

use crate::config::EngineConfig;
use crate::context::{EngineContext, RunContext};
use crate::measurement::Measurement;
use crate::nettests::NettestRegistry;
use crate::traits::*;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedReceiver;

// ---------------------------------------------------------------------------
// Bouncer
// ---------------------------------------------------------------------------

struct BouncerState {
    collectors: Vec<ServiceEntry>,
    test_helpers: Vec<ServiceEntry>,
    fail: bool,
    calls: usize,
}

pub struct FakeBouncer {
    state: Mutex<BouncerState>,
}

impl Default for FakeBouncer {
    fn default() -> Self {
        Self {
            state: Mutex::new(BouncerState {
                collectors: vec![ServiceEntry::https("collector.test")],
                test_helpers: vec![ServiceEntry {
                    address: "127.0.0.1:57001".into(),
                    kind: "tcp-echo".into(),
                    front: String::new(),
                }],
                fail: false,
                calls: 0,
            }),
        }
    }
}

impl FakeBouncer {
    pub fn set_collectors(&self, collectors: Vec<ServiceEntry>) {
        self.state.lock().unwrap().collectors = collectors;
    }

    pub fn fail(&self) {
        self.state.lock().unwrap().fail = true;
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }
}

#[async_trait::async_trait]
impl BouncerClient for FakeBouncer {
    async fn get(
        &self,
        ctx: &RunContext,
        _base_url: &str,
        kind: ServiceKind,
    ) -> ClientResult<Vec<ServiceEntry>> {
        ctx.guard(async {
            let mut state = self.state.lock().unwrap();
            state.calls += 1;
            if state.fail {
                return Err(ClientError::Status(503));
            }
            Ok(match kind {
                ServiceKind::Collectors => state.collectors.clone(),
                ServiceKind::TestHelpers => state.test_helpers.clone(),
            })
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CollectorState {
    opened: usize,
    closed: usize,
    submitted: Vec<String>,
    base_urls: Vec<String>,
    fail_open: bool,
    fail_close: bool,
    fail_inputs: HashSet<String>,
}

#[derive(Default)]
pub struct FakeCollector {
    state: Mutex<CollectorState>,
}

impl FakeCollector {
    pub fn fail_open(&self) {
        self.state.lock().unwrap().fail_open = true;
    }

    pub fn fail_close(&self) {
        self.state.lock().unwrap().fail_close = true;
    }

    /// Reject the submission of measurements for `input`.
    pub fn fail_update_for(&self, input: &str) {
        self.state.lock().unwrap().fail_inputs.insert(input.to_string());
    }

    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    /// Inputs of the measurements accepted so far.
    pub fn submitted(&self) -> Vec<String> {
        self.state.lock().unwrap().submitted.clone()
    }

    /// Base URLs reports were opened on.
    pub fn base_urls(&self) -> Vec<String> {
        self.state.lock().unwrap().base_urls.clone()
    }
}

#[async_trait::async_trait]
impl CollectorClient for FakeCollector {
    async fn open(
        &self,
        ctx: &RunContext,
        base_url: &str,
        _template: &ReportTemplate,
    ) -> ClientResult<String> {
        ctx.guard(async {
            let mut state = self.state.lock().unwrap();
            if state.fail_open {
                return Err(ClientError::Network("connection refused".into()));
            }
            state.opened += 1;
            state.base_urls.push(base_url.to_string());
            Ok(format!("report-{}", state.opened))
        })
        .await
    }

    async fn update(
        &self,
        ctx: &RunContext,
        _base_url: &str,
        _report_id: &str,
        measurement: &Measurement,
    ) -> ClientResult<String> {
        ctx.guard(async {
            let mut state = self.state.lock().unwrap();
            if state.fail_inputs.contains(&measurement.input) {
                return Err(ClientError::Status(500));
            }
            state.submitted.push(measurement.input.clone());
            Ok(format!("measurement-{}", state.submitted.len()))
        })
        .await
    }

    async fn close(&self, ctx: &RunContext, _base_url: &str, _report_id: &str) -> ClientResult<()> {
        ctx.guard(async {
            let mut state = self.state.lock().unwrap();
            if state.fail_close {
                return Err(ClientError::Timeout);
            }
            state.closed += 1;
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Geolocation
// ---------------------------------------------------------------------------

pub struct FakeGeo {
    result: Mutex<Option<GeoInfo>>,
}

impl Default for FakeGeo {
    fn default() -> Self {
        Self {
            result: Mutex::new(Some(GeoInfo {
                probe_ip: "93.147.252.33".into(),
                probe_asn: "AS30722".into(),
                probe_cc: "IT".into(),
                probe_network_name: "Vodafone Italia S.p.A.".into(),
            })),
        }
    }
}

impl FakeGeo {
    pub fn set(&self, info: GeoInfo) {
        *self.result.lock().unwrap() = Some(info);
    }

    pub fn fail(&self) {
        *self.result.lock().unwrap() = None;
    }

    /// The configured answer (placeholder values when failing).
    pub fn info(&self) -> GeoInfo {
        self.result.lock().unwrap().clone().unwrap_or_else(GeoInfo::placeholder)
    }
}

#[async_trait::async_trait]
impl GeoResolver for FakeGeo {
    async fn lookup(&self, ctx: &RunContext, _asn_db_path: &str) -> ClientResult<GeoInfo> {
        ctx.guard(async {
            self.result
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| ClientError::Network("lookup service unreachable".into()))
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Fakes {
    pub bouncer: Arc<FakeBouncer>,
    pub collector: Arc<FakeCollector>,
    pub geo: Arc<FakeGeo>,
}

impl Fakes {
    pub fn context(&self) -> EngineContext {
        self.context_with(EngineConfig::default(), NettestRegistry::new())
    }

    pub fn context_with(&self, config: EngineConfig, nettests: NettestRegistry) -> EngineContext {
        EngineContext::new(
            config,
            self.bouncer.clone(),
            self.collector.clone(),
            self.geo.clone(),
            nettests,
        )
    }
}

/// Everything currently queued, parsed.
pub fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<serde_json::Value> {
    let mut out = Vec::new();
    while let Ok(text) = rx.try_recv() {
        out.push(serde_json::from_str(&text).unwrap());
    }
    out
}

pub fn keys(events: &[serde_json::Value]) -> Vec<String> {
    events
        .iter()
        .map(|e| e["key"].as_str().unwrap_or_default().to_string())
        .collect()
}

pub fn count(events: &[serde_json::Value], key: &str) -> usize {
    events.iter().filter(|e| e["key"] == key).count()
}
