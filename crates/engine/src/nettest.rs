//! Nettest – the state of one orchestration run.
//!
//! Every step a run performs is a separate operation so the runner can
//! decide, step by step, whether a failure is fatal:
//!
//! - collector and test-helper discovery through the bouncer
//! - collector selection (first `https` entry)
//! - geolocation, starting from placeholder values
//! - report open (at most once), measurement, submission, report close
//!
//! A `Nettest` is owned by the worker running it and never shared.

use crate::context::{EngineContext, RunContext};
use crate::error::NettestError;
use crate::measurement::{format_time_now_utc, Measurement, DATA_FORMAT_VERSION};
use crate::traits::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Report {
    id: String,
    base_url: String,
}

pub struct Nettest {
    body: Arc<dyn MeasurementBody>,
    bouncer: Arc<dyn BouncerClient>,
    collector: Arc<dyn CollectorClient>,
    geo: Arc<dyn GeoResolver>,

    pub software_name: String,
    pub software_version: String,
    pub test_start_time: String,
    pub annotations: BTreeMap<String, String>,

    pub bouncer_base_url: String,
    pub available_collectors: Vec<ServiceEntry>,
    pub available_test_helpers: Vec<ServiceEntry>,
    pub selected_collector: Option<ServiceEntry>,
    /// Set directly by configuration; wins over any discovered collector.
    pub collector_override: Option<String>,
    pub default_collector_url: String,

    pub asn_db_path: String,
    pub geo_info: GeoInfo,
    pub save_real_probe_ip: bool,

    report: Option<Report>,
}

impl Nettest {
    pub fn new(engine: &EngineContext, body: Arc<dyn MeasurementBody>) -> Self {
        let config = engine.config();
        Self {
            body,
            bouncer: engine.bouncer(),
            collector: engine.collector(),
            geo: engine.geo(),
            software_name: String::new(),
            software_version: String::new(),
            test_start_time: format_time_now_utc(),
            annotations: BTreeMap::new(),
            bouncer_base_url: config.default_bouncer_url.clone(),
            available_collectors: Vec::new(),
            available_test_helpers: Vec::new(),
            selected_collector: None,
            collector_override: None,
            default_collector_url: config.default_collector_url.clone(),
            asn_db_path: String::new(),
            geo_info: GeoInfo::placeholder(),
            save_real_probe_ip: false,
            report: None,
        }
    }

    pub fn test_name(&self) -> &str {
        self.body.name()
    }

    pub fn test_version(&self) -> &str {
        self.body.version()
    }

    pub fn input_policy(&self) -> InputPolicy {
        self.body.input_policy()
    }

    // -----------------------------------------------------------------------
    // Bouncer
    // -----------------------------------------------------------------------

    pub async fn discover_collectors(&mut self, ctx: &RunContext) -> Result<(), NettestError> {
        self.available_collectors = self
            .bouncer
            .get(ctx, &self.bouncer_base_url, ServiceKind::Collectors)
            .await?;
        Ok(())
    }

    pub async fn discover_test_helpers(&mut self, ctx: &RunContext) -> Result<(), NettestError> {
        self.available_test_helpers = self
            .bouncer
            .get(ctx, &self.bouncer_base_url, ServiceKind::TestHelpers)
            .await?;
        Ok(())
    }

    /// Pick the first collector reachable over `https`.
    pub fn select_collector(&mut self) -> Result<&ServiceEntry, NettestError> {
        let entry = self
            .available_collectors
            .iter()
            .find(|e| e.kind == "https")
            .cloned()
            .ok_or(NettestError::NoSuitableCollector)?;
        Ok(self.selected_collector.insert(entry))
    }

    /// Where reports are opened: configured override, then the selected
    /// collector, then the default collector.
    pub fn collector_base_url(&self) -> String {
        if let Some(url) = &self.collector_override {
            return url.clone();
        }
        match &self.selected_collector {
            Some(entry) if !entry.address.is_empty() => format!("https://{}/", entry.address),
            _ => self.default_collector_url.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Geolocation
    // -----------------------------------------------------------------------

    /// Resolve probe IP/ASN/CC/network name. On failure the placeholders stay.
    pub async fn geolocate(&mut self, ctx: &RunContext) -> Result<(), NettestError> {
        self.geo_info = GeoInfo::placeholder();
        let found = self.geo.lookup(ctx, &self.asn_db_path).await?;
        let fallback = GeoInfo::placeholder();
        self.geo_info = GeoInfo {
            probe_ip: or_default(found.probe_ip, fallback.probe_ip),
            probe_asn: or_default(found.probe_asn, fallback.probe_asn),
            probe_cc: or_default(found.probe_cc, fallback.probe_cc),
            probe_network_name: found.probe_network_name,
        };
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Report lifecycle
    // -----------------------------------------------------------------------

    pub fn report_id(&self) -> &str {
        self.report.as_ref().map(|r| r.id.as_str()).unwrap_or("")
    }

    pub fn has_report(&self) -> bool {
        self.report.is_some()
    }

    /// Open the report. A report can be opened once per nettest.
    pub async fn open_report(&mut self, ctx: &RunContext) -> Result<&str, NettestError> {
        if self.report.is_some() {
            return Err(NettestError::ReportAlreadyOpen);
        }
        let base_url = self.collector_base_url();
        let template = ReportTemplate {
            probe_asn: self.geo_info.probe_asn.clone(),
            probe_cc: self.geo_info.probe_cc.clone(),
            software_name: self.software_name.clone(),
            software_version: self.software_version.clone(),
            test_name: self.test_name().to_string(),
            test_version: self.test_version().to_string(),
        };
        let id = self.collector.open(ctx, &base_url, &template).await?;
        let report = self.report.insert(Report { id, base_url });
        Ok(&report.id)
    }

    /// Close the report if one is open; returns the closed report id.
    pub async fn close_report(&mut self, ctx: &RunContext) -> Result<Option<String>, NettestError> {
        let Some(report) = self.report.take() else {
            return Ok(None);
        };
        self.collector.close(ctx, &report.base_url, &report.id).await?;
        Ok(Some(report.id))
    }

    // -----------------------------------------------------------------------
    // Measurements
    // -----------------------------------------------------------------------

    /// A measurement with every field set except the body results.
    pub fn new_measurement(&self, input: &str) -> Measurement {
        let probe_ip = if self.save_real_probe_ip {
            self.geo_info.probe_ip.clone()
        } else {
            GeoInfo::placeholder().probe_ip
        };
        let mut test_helpers = BTreeMap::new();
        for helper in &self.available_test_helpers {
            test_helpers
                .entry(helper.kind.clone())
                .or_insert_with(|| helper.address.clone());
        }
        Measurement {
            annotations: self.annotations.clone(),
            data_format_version: DATA_FORMAT_VERSION.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            input: input.to_string(),
            measurement_start_time: format_time_now_utc(),
            probe_asn: self.geo_info.probe_asn.clone(),
            probe_cc: self.geo_info.probe_cc.clone(),
            probe_ip,
            report_id: self.report_id().to_string(),
            software_name: self.software_name.clone(),
            software_version: self.software_version.clone(),
            test_helpers,
            test_keys: serde_json::Value::Null,
            test_name: self.test_name().to_string(),
            test_runtime: 0.0,
            test_start_time: self.test_start_time.clone(),
            test_version: self.test_version().to_string(),
            measurement_id: None,
        }
    }

    /// Run the body for `input`; returns the measurement and the body failure.
    pub async fn measure(&self, ctx: &RunContext, input: &str) -> (Measurement, String) {
        let mut measurement = self.new_measurement(input);
        let start = Instant::now();
        let output = self.body.run(ctx, input).await;
        measurement.test_runtime = start.elapsed().as_secs_f64();
        measurement.set_result(output.test_keys, &output.failure);
        (measurement, output.failure)
    }

    /// Submit to the open report and record the assigned measurement id.
    pub async fn submit(
        &self,
        ctx: &RunContext,
        measurement: &mut Measurement,
    ) -> Result<String, NettestError> {
        let report = self.report.as_ref().ok_or(NettestError::ReportNotOpen)?;
        let id = self
            .collector
            .update(ctx, &report.base_url, &report.id, measurement)
            .await?;
        measurement.measurement_id = Some(id.clone());
        Ok(id)
    }
}

fn or_default(value: String, fallback: String) -> String {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}
