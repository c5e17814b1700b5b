//! Engine context – holds collaborator trait objects and config.

use crate::config::EngineConfig;
use crate::nettests::NettestRegistry;
use crate::platform::{HttpBouncer, HttpCollector, UbuntuGeoResolver};
use crate::traits::*;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a task needs from the outside world.
///
/// Cloned into every task; hosts swap implementations (e.g. fakes in tests,
/// HTTP clients in production) without touching the engine.
#[derive(Clone)]
pub struct EngineContext {
    config: Arc<EngineConfig>,
    bouncer: Arc<dyn BouncerClient>,
    collector: Arc<dyn CollectorClient>,
    geo: Arc<dyn GeoResolver>,
    nettests: Arc<NettestRegistry>,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        bouncer: Arc<dyn BouncerClient>,
        collector: Arc<dyn CollectorClient>,
        geo: Arc<dyn GeoResolver>,
        nettests: NettestRegistry,
    ) -> Self {
        Self {
            config: Arc::new(config),
            bouncer,
            collector,
            geo,
            nettests: Arc::new(nettests),
        }
    }

    /// Context backed by the real HTTP bouncer, collector and geolocation service.
    pub fn default_platform(config: EngineConfig) -> Self {
        let bouncer = Arc::new(HttpBouncer::new(config.http_timeout_secs));
        let collector = Arc::new(HttpCollector::new(config.http_timeout_secs));
        let geo = Arc::new(UbuntuGeoResolver::new(
            config.geoip_lookup_url.clone(),
            config.http_timeout_secs,
        ));
        Self::new(config, bouncer, collector, geo, NettestRegistry::new())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn bouncer(&self) -> Arc<dyn BouncerClient> {
        Arc::clone(&self.bouncer)
    }

    pub fn collector(&self) -> Arc<dyn CollectorClient> {
        Arc::clone(&self.collector)
    }

    pub fn geo(&self) -> Arc<dyn GeoResolver> {
        Arc::clone(&self.geo)
    }

    pub fn nettests(&self) -> &NettestRegistry {
        &self.nettests
    }
}

// ---------------------------------------------------------------------------
// Per-run context
// ---------------------------------------------------------------------------

/// Bytes moved by the collaborators on behalf of one task.
#[derive(Debug, Default)]
pub struct ByteCounters {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
}

impl ByteCounters {
    pub fn add_uploaded(&self, n: u64) {
        self.uploaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, n: u64) {
        self.downloaded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn uploaded_kb(&self) -> f64 {
        self.uploaded.load(Ordering::Relaxed) as f64 / 1024.0
    }

    pub fn downloaded_kb(&self) -> f64 {
        self.downloaded.load(Ordering::Relaxed) as f64 / 1024.0
    }
}

/// Passed to every collaborator call: the task's cancellation token and
/// its byte counters.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    cancel: CancellationToken,
    counters: Arc<ByteCounters>,
}

impl RunContext {
    pub fn new(cancel: CancellationToken, counters: Arc<ByteCounters>) -> Self {
        Self { cancel, counters }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn counters(&self) -> &ByteCounters {
        &self.counters
    }

    /// Run `fut` unless the task is interrupted first.
    pub async fn guard<T, F>(&self, fut: F) -> ClientResult<T>
    where
        F: Future<Output = ClientResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(ClientError::Interrupted);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ClientError::Interrupted),
            res = fut => res,
        }
    }
}
