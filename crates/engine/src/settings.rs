//! Task settings – the JSON document a host passes to `start`.
//!
//! Parsed once when the task starts and never mutated afterwards. Every
//! field is optional; missing fields take their zero value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub name: String,
    pub inputs: Vec<String>,
    pub input_filepaths: Vec<String>,
    pub annotations: BTreeMap<String, String>,
    pub disabled_events: Vec<String>,
    pub log_filepath: String,
    pub log_level: LogLevel,
    pub output_filepath: String,
    pub options: Options,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub bouncer_base_url: String,
    pub collector_base_url: String,
    pub config_file_path: String,
    pub geoip_asn_path: String,
    pub geoip_country_path: String,
    pub ignore_bouncer_error: bool,
    pub ignore_open_report_error: bool,
    pub no_bouncer: bool,
    pub no_collector: bool,
    pub save_real_probe_ip: bool,
    pub software_name: String,
    pub software_version: String,
    pub work_dir_path: String,
    /// Nettest-specific options not known to the engine.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Verbosity of `log` events, least verbose first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    #[serde(rename = "ERR")]
    Err,
    #[default]
    #[serde(rename = "WARNING")]
    Warning,
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "DEBUG")]
    Debug,
    #[serde(rename = "DEBUG2")]
    Debug2,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Err => "ERR",
            LogLevel::Warning => "WARNING",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Debug2 => "DEBUG2",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid settings: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cannot read input file {path}: {source}")]
    InputFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Settings {
    pub fn parse(text: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Inline inputs followed by the non-empty lines of every input file.
    pub fn collect_inputs(&self) -> Result<Vec<String>, SettingsError> {
        let mut inputs = self.inputs.clone();
        for path in &self.input_filepaths {
            let content =
                std::fs::read_to_string(path).map_err(|source| SettingsError::InputFile {
                    path: path.clone(),
                    source,
                })?;
            inputs.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from),
            );
        }
        Ok(inputs)
    }

    pub fn disabled_event_set(&self) -> HashSet<String> {
        self.disabled_events.iter().cloned().collect()
    }

    pub fn software_name(&self) -> String {
        non_empty_or(&self.options.software_name, env!("CARGO_PKG_NAME"))
    }

    pub fn software_version(&self) -> String {
        non_empty_or(&self.options.software_version, env!("CARGO_PKG_VERSION"))
    }
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_settings() {
        let s = Settings::parse(
            r#"{
                "name": "echo-nettest",
                "inputs": ["a", "b"],
                "annotations": {"platform": "linux"},
                "disabled_events": ["status.progress"],
                "log_level": "DEBUG",
                "options": {
                    "no_bouncer": true,
                    "no_collector": true,
                    "software_name": "probe-cli",
                    "timeout": 5
                }
            }"#,
        )
        .unwrap();
        assert_eq!(s.name, "echo-nettest");
        assert_eq!(s.inputs, vec!["a", "b"]);
        assert_eq!(s.log_level, LogLevel::Debug);
        assert!(s.options.no_bouncer && s.options.no_collector);
        assert_eq!(s.software_name(), "probe-cli");
        assert_eq!(s.options.extra["timeout"], 5);
        assert!(s.disabled_event_set().contains("status.progress"));
    }

    #[test]
    fn test_empty_object_defaults() {
        let s = Settings::parse("{}").unwrap();
        assert_eq!(s.log_level, LogLevel::Warning);
        assert!(s.inputs.is_empty());
        assert_eq!(s.software_name(), env!("CARGO_PKG_NAME"));
        assert_eq!(s.software_version(), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        assert!(Settings::parse("{ not json").is_err());
        assert!(Settings::parse(r#"{"inputs": "nope"}"#).is_err());
        assert!(Settings::parse(r#"{"log_level": "LOUD"}"#).is_err());
    }

    #[test]
    fn test_collect_inputs_reads_files() {
        let tmp = std::env::temp_dir().join(format!("nettask_inputs_{}.txt", uuid::Uuid::new_v4()));
        std::fs::write(&tmp, "x.org:80\n\n  y.org:443  \n").unwrap();
        let s = Settings {
            inputs: vec!["a:1".into()],
            input_filepaths: vec![tmp.display().to_string()],
            ..Settings::default()
        };
        assert_eq!(s.collect_inputs().unwrap(), vec!["a:1", "x.org:80", "y.org:443"]);
        let _ = std::fs::remove_file(&tmp);
    }

    #[test]
    fn test_collect_inputs_missing_file() {
        let s = Settings {
            input_filepaths: vec!["/nonexistent/nettask/inputs.txt".into()],
            ..Settings::default()
        };
        let err = s.collect_inputs().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/nettask/inputs.txt"));
    }

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Warning < LogLevel::Info);
        assert!(LogLevel::Debug2 > LogLevel::Debug);
        assert_eq!(LogLevel::Info.to_string(), "INFO");
    }
}
