//! Platform implementations of the collaborator traits.
//!
//! - [`HttpBouncer`]: bouncer v1 API over reqwest
//! - [`HttpCollector`]: collector report API over reqwest
//! - [`UbuntuGeoResolver`]: IP/CC via geoip.ubuntu.com, ASN via a MaxMind database

use crate::context::RunContext;
use crate::measurement::Measurement;
use crate::traits::*;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Once;
use std::time::Duration;

// ===========================================================================
// Shared HTTP plumbing
// ===========================================================================

fn install_crypto_provider() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        // Err only means another provider was installed first
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn http_client(timeout_secs: u64) -> ClientResult<reqwest::Client> {
    install_crypto_provider();
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ClientError::Network(format!("failed to build HTTP client: {}", e)))
}

fn map_reqwest(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout
    } else {
        ClientError::Network(e.to_string())
    }
}

/// `base_url` with its path replaced by `path`.
pub(crate) fn endpoint(base_url: &str, path: &str) -> ClientResult<reqwest::Url> {
    let mut url = reqwest::Url::parse(base_url)
        .map_err(|e| ClientError::InvalidAddress(format!("{}: {}", base_url, e)))?;
    url.set_path(path);
    Ok(url)
}

/// Send a request, account for its traffic and return the body of a 2xx response.
async fn fetch(
    ctx: &RunContext,
    request: reqwest::RequestBuilder,
    upload_len: usize,
) -> ClientResult<String> {
    let pending = request.send();
    ctx.guard(async {
        let resp = pending.await.map_err(map_reqwest)?;
        ctx.counters().add_uploaded(upload_len as u64);
        let status = resp.status();
        let body = resp.text().await.map_err(map_reqwest)?;
        ctx.counters().add_downloaded(body.len() as u64);
        if !status.is_success() {
            return Err(ClientError::Status(status.as_u16()));
        }
        Ok(body)
    })
    .await
}

async fn post_json<T: Serialize + ?Sized>(
    ctx: &RunContext,
    client: &reqwest::Client,
    url: reqwest::Url,
    payload: &T,
) -> ClientResult<String> {
    let body = serde_json::to_string(payload)
        .map_err(|e| ClientError::Decode(format!("cannot encode request: {}", e)))?;
    let len = body.len();
    let request = client
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body);
    fetch(ctx, request, len).await
}

fn decode<T: for<'de> Deserialize<'de>>(body: &str) -> ClientResult<T> {
    serde_json::from_str(body).map_err(|e| ClientError::Decode(e.to_string()))
}

// ===========================================================================
// Bouncer
// ===========================================================================

#[derive(Deserialize)]
struct BouncerResults {
    #[serde(default)]
    results: Vec<ServiceEntry>,
}

pub struct HttpBouncer {
    timeout_secs: u64,
}

impl HttpBouncer {
    pub fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }
}

#[async_trait::async_trait]
impl BouncerClient for HttpBouncer {
    async fn get(
        &self,
        ctx: &RunContext,
        base_url: &str,
        kind: ServiceKind,
    ) -> ClientResult<Vec<ServiceEntry>> {
        let url = endpoint(base_url, kind.path())?;
        let client = http_client(self.timeout_secs)?;
        tracing::debug!(url = %url, "querying bouncer");
        let body = fetch(ctx, client.get(url), 0).await?;
        let parsed: BouncerResults = decode(&body)?;
        Ok(parsed.results)
    }
}

// ===========================================================================
// Collector
// ===========================================================================

#[derive(Deserialize)]
struct OpenResponse {
    report_id: String,
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    format: &'static str,
    content: &'a Measurement,
}

#[derive(Deserialize)]
struct UpdateResponse {
    #[serde(default)]
    measurement_id: String,
}

pub struct HttpCollector {
    timeout_secs: u64,
}

impl HttpCollector {
    pub fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }
}

#[async_trait::async_trait]
impl CollectorClient for HttpCollector {
    async fn open(
        &self,
        ctx: &RunContext,
        base_url: &str,
        template: &ReportTemplate,
    ) -> ClientResult<String> {
        let url = endpoint(base_url, "/report")?;
        let client = http_client(self.timeout_secs)?;
        let body = post_json(ctx, &client, url, template).await?;
        let parsed: OpenResponse = decode(&body)?;
        if parsed.report_id.is_empty() {
            return Err(ClientError::Decode("collector returned an empty report_id".into()));
        }
        Ok(parsed.report_id)
    }

    async fn update(
        &self,
        ctx: &RunContext,
        base_url: &str,
        report_id: &str,
        measurement: &Measurement,
    ) -> ClientResult<String> {
        let url = endpoint(base_url, &format!("/report/{}", report_id))?;
        let client = http_client(self.timeout_secs)?;
        let request = UpdateRequest {
            format: "json",
            content: measurement,
        };
        let body = post_json(ctx, &client, url, &request).await?;
        let parsed: UpdateResponse = decode(&body)?;
        Ok(parsed.measurement_id)
    }

    async fn close(&self, ctx: &RunContext, base_url: &str, report_id: &str) -> ClientResult<()> {
        let url = endpoint(base_url, &format!("/report/{}/close", report_id))?;
        let client = http_client(self.timeout_secs)?;
        fetch(ctx, client.post(url), 0).await?;
        Ok(())
    }
}

// ===========================================================================
// Geolocation
// ===========================================================================

pub struct UbuntuGeoResolver {
    lookup_url: String,
    timeout_secs: u64,
}

impl UbuntuGeoResolver {
    pub fn new(lookup_url: String, timeout_secs: u64) -> Self {
        Self {
            lookup_url,
            timeout_secs,
        }
    }
}

#[async_trait::async_trait]
impl GeoResolver for UbuntuGeoResolver {
    async fn lookup(&self, ctx: &RunContext, asn_db_path: &str) -> ClientResult<GeoInfo> {
        let client = http_client(self.timeout_secs)?;
        let body = fetch(ctx, client.get(&self.lookup_url), 0).await?;
        let (ip, cc) = parse_lookup_response(&body)?;

        let mut info = GeoInfo {
            probe_ip: ip.to_string(),
            probe_cc: cc,
            ..GeoInfo::placeholder()
        };
        if !asn_db_path.is_empty() {
            let (asn, org) = lookup_asn(asn_db_path, ip)?;
            info.probe_asn = asn;
            info.probe_network_name = org;
        }
        Ok(info)
    }
}

fn xml_field(body: &str, tag: &str) -> ClientResult<String> {
    let re = regex::Regex::new(&format!("<{tag}>\\s*([^<]*?)\\s*</{tag}>"))
        .map_err(|e| ClientError::Decode(e.to_string()))?;
    re.captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| ClientError::Decode(format!("missing <{}> in lookup response", tag)))
}

/// Extract and validate the probe IP and country code.
pub(crate) fn parse_lookup_response(body: &str) -> ClientResult<(IpAddr, String)> {
    let ip = xml_field(body, "Ip")?;
    let cc = xml_field(body, "CountryCode")?;
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| ClientError::Decode(format!("invalid IP address: {:?}", ip)))?;
    if cc.len() != 2 || !cc.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(ClientError::Decode(format!("invalid country code: {:?}", cc)));
    }
    Ok((ip, cc))
}

fn lookup_asn(path: &str, ip: IpAddr) -> ClientResult<(String, String)> {
    let reader = maxminddb::Reader::open_readfile(path)
        .map_err(|e| ClientError::GeoDatabase(format!("{}: {}", path, e)))?;
    let record: maxminddb::geoip2::Asn = reader
        .lookup(ip)
        .map_err(|e| ClientError::GeoDatabase(e.to_string()))?;
    let asn = record
        .autonomous_system_number
        .ok_or_else(|| ClientError::GeoDatabase(format!("no ASN for {}", ip)))?;
    let org = record.autonomous_system_organization.unwrap_or_default();
    Ok((format!("AS{}", asn), org.to_string()))
}
