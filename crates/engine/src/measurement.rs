//! Measurement record – one input's result envelope.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Format used for every timestamp inside a measurement.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const DATA_FORMAT_VERSION: &str = "0.2.0";

pub fn format_time_now_utc() -> String {
    chrono::Utc::now().format(DATE_FORMAT).to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub annotations: BTreeMap<String, String>,
    pub data_format_version: String,
    /// Locally generated identifier.
    pub id: String,
    pub input: String,
    pub measurement_start_time: String,
    pub probe_asn: String,
    pub probe_cc: String,
    pub probe_ip: String,
    pub report_id: String,
    pub software_name: String,
    pub software_version: String,
    pub test_helpers: BTreeMap<String, String>,
    pub test_keys: serde_json::Value,
    pub test_name: String,
    pub test_runtime: f64,
    pub test_start_time: String,
    pub test_version: String,
    /// Assigned by the collector after a successful submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement_id: Option<String>,
}

impl Measurement {
    /// Attach the body output, mirroring its failure into the test keys.
    pub fn set_result(&mut self, test_keys: serde_json::Value, failure: &str) {
        let mut test_keys = test_keys;
        if let Some(obj) = test_keys.as_object_mut() {
            let failure = if failure.is_empty() {
                serde_json::Value::Null
            } else {
                serde_json::Value::String(failure.to_string())
            };
            obj.entry("failure").or_insert(failure);
        }
        self.test_keys = test_keys;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_format() {
        let now = format_time_now_utc();
        assert!(chrono::NaiveDateTime::parse_from_str(&now, DATE_FORMAT).is_ok());
        assert_eq!(now.len(), "2006-01-02 15:04:05".len());
    }

    #[test]
    fn test_set_result_mirrors_failure() {
        let mut m = Measurement::default();
        m.set_result(serde_json::json!({"connected": false}), "connection_refused");
        assert_eq!(m.test_keys["failure"], "connection_refused");

        m.set_result(serde_json::json!({"echo": "x"}), "");
        assert!(m.test_keys["failure"].is_null());

        m.set_result(serde_json::json!({"failure": "own"}), "other");
        assert_eq!(m.test_keys["failure"], "own");
    }

    #[test]
    fn test_measurement_id_only_after_submission() {
        let mut m = Measurement {
            report_id: "r-1".into(),
            ..Measurement::default()
        };
        let v = serde_json::to_value(&m).unwrap();
        assert!(v.get("measurement_id").is_none());
        m.measurement_id = Some("m-1".into());
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["measurement_id"], "m-1");
    }
}
