//! Engine configuration – endpoints, handle-table sizing and admission bound.

use serde::{Deserialize, Serialize};

pub const DEFAULT_HANDLE_CAPACITY: usize = 256;
pub const DEFAULT_BOUNCER_URL: &str = "https://bouncer.ooni.io/";
pub const DEFAULT_COLLECTOR_URL: &str = "https://a.collector.ooni.io/";
pub const DEFAULT_GEOIP_LOOKUP_URL: &str = "https://geoip.ubuntu.com/lookup";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of handle slots, including the reserved slot 0.
    pub handle_capacity: usize,
    /// How many nettests may hold admission at the same time.
    pub max_concurrent_nettests: usize,
    pub default_bouncer_url: String,
    pub default_collector_url: String,
    pub geoip_lookup_url: String,
    pub http_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handle_capacity: DEFAULT_HANDLE_CAPACITY,
            max_concurrent_nettests: 1,
            default_bouncer_url: DEFAULT_BOUNCER_URL.to_string(),
            default_collector_url: DEFAULT_COLLECTOR_URL.to_string(),
            geoip_lookup_url: DEFAULT_GEOIP_LOOKUP_URL.to_string(),
            http_timeout_secs: 30,
        }
    }
}

impl EngineConfig {
    /// Capacity actually used by the handle table (slot 0 is never handed out).
    pub fn effective_capacity(&self) -> usize {
        self.handle_capacity.max(2)
    }

    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrent_nettests.max(1)
    }
}
