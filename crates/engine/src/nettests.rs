//! Nettest registry and built-in measurement bodies.
//!
//! Nettests are registered by name; the factory receives the parsed
//! settings and returns the body that measures one input at a time.

use crate::context::RunContext;
use crate::settings::Settings;
use crate::traits::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Signature for all nettest factories.
pub type NettestFactory = fn(&Settings) -> Result<Arc<dyn MeasurementBody>, String>;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct NettestRegistry {
    factories: HashMap<String, NettestFactory>,
}

impl NettestRegistry {
    pub fn new() -> Self {
        let mut reg = Self::empty();
        // Register built-in nettests
        reg.register(EchoNettest::NAME, new_echo);
        reg.register(TcpConnect::NAME, new_tcp_connect);
        reg
    }

    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register (or replace) the factory for `name`.
    pub fn register(&mut self, name: &str, factory: NettestFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    /// Look up `name` and build its body. `None` when the name is unknown.
    pub fn create(
        &self,
        name: &str,
        settings: &Settings,
    ) -> Option<Result<Arc<dyn MeasurementBody>, String>> {
        self.factories.get(name).map(|factory| factory(settings))
    }
}

impl Default for NettestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Built-in nettests
// ===========================================================================

/// `echo-nettest` – echoes its input into the test keys. Proves wiring works.
pub struct EchoNettest;

impl EchoNettest {
    pub const NAME: &'static str = "echo-nettest";
}

fn new_echo(_settings: &Settings) -> Result<Arc<dyn MeasurementBody>, String> {
    Ok(Arc::new(EchoNettest))
}

#[async_trait::async_trait]
impl MeasurementBody for EchoNettest {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn input_policy(&self) -> InputPolicy {
        InputPolicy::Optional
    }

    async fn run(&self, _ctx: &RunContext, input: &str) -> BodyOutput {
        BodyOutput {
            test_keys: serde_json::json!({ "echo": input }),
            failure: String::new(),
        }
    }
}

/// `tcp_connect` – TCP handshake with every `host:port` input.
///
/// Options: `{ "timeout": <seconds> }` (default 10).
pub struct TcpConnect {
    timeout: Duration,
}

impl TcpConnect {
    pub const NAME: &'static str = "tcp_connect";
    const DEFAULT_TIMEOUT_SECS: f64 = 10.0;
}

fn new_tcp_connect(settings: &Settings) -> Result<Arc<dyn MeasurementBody>, String> {
    let secs = match settings.options.extra.get("timeout") {
        None => TcpConnect::DEFAULT_TIMEOUT_SECS,
        Some(v) => v
            .as_f64()
            .filter(|s| *s > 0.0)
            .ok_or_else(|| format!("tcp_connect: invalid timeout option: {}", v))?,
    };
    let timeout = Duration::try_from_secs_f64(secs)
        .map_err(|e| format!("tcp_connect: invalid timeout option {}: {}", secs, e))?;
    Ok(Arc::new(TcpConnect { timeout }))
}

#[async_trait::async_trait]
impl MeasurementBody for TcpConnect {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn input_policy(&self) -> InputPolicy {
        InputPolicy::Required
    }

    async fn run(&self, ctx: &RunContext, input: &str) -> BodyOutput {
        let start = Instant::now();
        let connect = async {
            match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(input)).await {
                Ok(Ok(_stream)) => Ok(()),
                Ok(Err(e)) => Err(ClientError::Network(e.to_string())),
                Err(_) => Err(ClientError::Timeout),
            }
        };
        let result = ctx.guard(connect).await;
        let elapsed = start.elapsed().as_secs_f64();

        let failure = match &result {
            Ok(()) => String::new(),
            Err(ClientError::Timeout) => "generic_timeout_error".to_string(),
            Err(e) => e.to_string(),
        };
        BodyOutput {
            test_keys: serde_json::json!({
                "address": input,
                "connected": result.is_ok(),
                "connect_time": elapsed,
            }),
            failure,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
