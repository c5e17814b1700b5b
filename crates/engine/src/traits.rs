use crate::context::RunContext;
use crate::measurement::Measurement;
use serde::{Deserialize, Serialize};

/// Result type for collaborator calls.
pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("interrupted")]
    Interrupted,

    #[error("timeout")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("unexpected status code: {0}")]
    Status(u16),

    #[error("cannot decode response: {0}")]
    Decode(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("geoip database error: {0}")]
    GeoDatabase(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Bouncer
// ---------------------------------------------------------------------------

/// One service returned by the bouncer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub address: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Front domain for "cloudfront" entries.
    #[serde(default)]
    pub front: String,
}

impl ServiceEntry {
    pub fn https(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            kind: "https".to_string(),
            front: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    Collectors,
    TestHelpers,
}

impl ServiceKind {
    pub fn path(&self) -> &'static str {
        match self {
            ServiceKind::Collectors => "/api/v1/collectors",
            ServiceKind::TestHelpers => "/api/v1/test-helpers",
        }
    }
}

#[async_trait::async_trait]
pub trait BouncerClient: Send + Sync {
    async fn get(
        &self,
        ctx: &RunContext,
        base_url: &str,
        kind: ServiceKind,
    ) -> ClientResult<Vec<ServiceEntry>>;
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Metadata sent when opening a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportTemplate {
    pub probe_asn: String,
    pub probe_cc: String,
    pub software_name: String,
    pub software_version: String,
    pub test_name: String,
    pub test_version: String,
}

#[async_trait::async_trait]
pub trait CollectorClient: Send + Sync {
    /// Open a report and return its identifier.
    async fn open(
        &self,
        ctx: &RunContext,
        base_url: &str,
        template: &ReportTemplate,
    ) -> ClientResult<String>;

    /// Submit one measurement and return the server-assigned measurement id.
    async fn update(
        &self,
        ctx: &RunContext,
        base_url: &str,
        report_id: &str,
        measurement: &Measurement,
    ) -> ClientResult<String>;

    async fn close(&self, ctx: &RunContext, base_url: &str, report_id: &str) -> ClientResult<()>;
}

// ---------------------------------------------------------------------------
// Geolocation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GeoInfo {
    pub probe_ip: String,
    pub probe_asn: String,
    pub probe_cc: String,
    pub probe_network_name: String,
}

impl GeoInfo {
    /// Values used until (and unless) a lookup succeeds.
    pub fn placeholder() -> Self {
        Self {
            probe_ip: "127.0.0.1".to_string(),
            probe_asn: "AS0".to_string(),
            probe_cc: "ZZ".to_string(),
            probe_network_name: String::new(),
        }
    }
}

#[async_trait::async_trait]
pub trait GeoResolver: Send + Sync {
    async fn lookup(&self, ctx: &RunContext, asn_db_path: &str) -> ClientResult<GeoInfo>;
}

// ---------------------------------------------------------------------------
// Measurement body
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputPolicy {
    /// Takes no input; runs exactly once with the empty string.
    None,
    Optional,
    Required,
}

/// What a measurement body hands back for one input.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyOutput {
    pub test_keys: serde_json::Value,
    /// Empty on success.
    pub failure: String,
}

/// The nettest-specific part of a measurement.
#[async_trait::async_trait]
pub trait MeasurementBody: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn input_policy(&self) -> InputPolicy;
    async fn run(&self, ctx: &RunContext, input: &str) -> BodyOutput;
}
