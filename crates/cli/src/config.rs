use config::{Config, ConfigError, Environment, File};
use engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Host configuration: the engine settings plus how the CLI logs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub show_time: bool,
    pub show_target: bool,
    /// Mask IPv4 addresses (the probe IP among them) in log output.
    pub redact_ip_addresses: bool,
    pub patterns: Vec<RedactionPattern>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            show_time: true,
            show_target: false,
            redact_ip_addresses: true,
            patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedactionPattern {
    pub name: String,
    pub regex: String,
    pub placeholder: String,
}

/// Layers, lowest precedence first: `nettask.{yaml,toml,json}` in the
/// working directory, the explicit `--config` file, `NETTASK__*` variables.
pub fn load_config(explicit: Option<&Path>) -> Result<CliConfig, ConfigError> {
    let mut builder = Config::builder().add_source(File::with_name("nettask").required(false));
    if let Some(path) = explicit {
        builder = builder.add_source(File::from(path).required(true));
    }
    builder
        // NETTASK__ENGINE__MAX_CONCURRENT_NETTESTS=2
        .add_source(Environment::with_prefix("NETTASK").separator("__"))
        .build()?
        .try_deserialize()
}
