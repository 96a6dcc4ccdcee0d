use std::collections::HashMap;
use std::path::Path;

use errors::{ConfigError, Result};
use serde::{Deserialize, Serialize};

fn default_scratch_dir() -> String {
    "/tmp".to_string()
}

fn default_slot_wait() -> u64 {
    30
}

fn default_legacy_url_hashing() -> bool {
    true
}

/// Process configuration, loaded from a JSON file.
///
/// Field names follow the deployed config format; `Amqp` is kept as an
/// alias for the bus URI so existing config files keep working.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    #[serde(rename = "Amqp")]
    pub bus_uri: String,
    pub queue_suffix: String,
    pub consume_queue: String,
    pub results_queue: String,
    pub failed_queue: String,

    #[serde(default)]
    pub log_file: Option<String>,
    pub log_level: String,
    #[serde(rename = "VerifySSL")]
    pub verify_ssl: bool,

    pub services: HashMap<String, Vec<String>>,

    pub feed_prefetch_count: usize,

    pub check_prefetch_count: usize,
    /// Poll cadence in seconds: slept between sweeps of the watch set
    /// and between every individual task poll.
    pub wait_between_requests: u64,

    pub submit_prefetch_count: usize,

    /// Where downloaded samples are staged between feed and submit.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: String,
    /// Seconds to wait before re-asking an analyzer that reported no
    /// free slots.
    #[serde(default = "default_slot_wait")]
    pub slot_wait_seconds: u64,
    /// When true, non-downloadable samples are hashed as the literal
    /// string `<scratch_dir>/<file_path>`, matching what consumers of
    /// the results exchange have always received. When false the
    /// sample string itself is hashed.
    #[serde(default = "default_legacy_url_hashing")]
    pub legacy_url_hashing: bool,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(Box::new(e)))?;
        let config: Config =
            serde_json::from_str(&raw).map_err(|e| ConfigError::ParseFailed(Box::new(e)))?;

        if config.queue_suffix.is_empty() {
            return Err(ConfigError::MissingSuffix.into());
        }

        Ok(config)
    }

    /// Queue carrying internal requests from feed to check.
    pub fn check_queue(&self) -> String {
        format!("totem-dynamic-check-{}", self.queue_suffix)
    }

    /// Queue carrying completed internal requests from check to submit.
    pub fn submit_queue(&self) -> String {
        format!("totem-dynamic-submit-{}", self.queue_suffix)
    }

    /// Maps the configured level onto a log filter level. Anything
    /// that is not `warning` or `info` means debug.
    pub fn log_filter_level(&self) -> &'static str {
        match self.log_level.as_str() {
            "warning" => "warn",
            "info" => "info",
            _ => "debug",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sample_config() -> &'static str {
        r#"{
            "Amqp": "redis://127.0.0.1:6379/0",
            "QueueSuffix": "mal",
            "ConsumeQueue": "totem_dynamic_input",
            "ResultsQueue": "totem_output",
            "FailedQueue": "totem_dynamic_failed",
            "LogLevel": "info",
            "VerifySSL": false,
            "Services": {"svcA": ["http://analyzer-a:8080"]},
            "FeedPrefetchCount": 5,
            "CheckPrefetchCount": 50,
            "WaitBetweenRequests": 5,
            "SubmitPrefetchCount": 5
        }"#
    }

    #[test]
    fn test_load_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", sample_config()).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.bus_uri, "redis://127.0.0.1:6379/0");
        assert_eq!(config.check_queue(), "totem-dynamic-check-mal");
        assert_eq!(config.submit_queue(), "totem-dynamic-submit-mal");
        assert_eq!(config.scratch_dir, "/tmp");
        assert_eq!(config.slot_wait_seconds, 30);
        assert!(config.legacy_url_hashing);
        assert_eq!(config.log_filter_level(), "info");
    }

    #[test]
    fn test_empty_suffix_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        let raw = sample_config().replace("\"mal\"", "\"\"");
        write!(file, "{}", raw).unwrap();

        let err = Config::load(file.path()).unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_missing_file() {
        assert!(Config::load(Path::new("/nonexistent/totem-dynamic.conf")).is_err());
    }

    #[test]
    fn test_log_filter_fallback_is_debug() {
        let mut file = NamedTempFile::new().unwrap();
        let raw = sample_config().replace("\"info\"", "\"everything\"");
        write!(file, "{}", raw).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.log_filter_level(), "debug");
    }
}
