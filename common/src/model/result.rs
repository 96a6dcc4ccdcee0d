use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The envelope published for downstream consumers once an analysis
/// finished. `data` carries the analyzer's result JSON re-encoded as a
/// string; downstream tooling expects the double encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub filename: String,
    pub data: String,
    pub md5: String,
    pub sha1: String,
    pub sha256: String,
    pub service_name: String,
    pub tags: Vec<String>,
    pub comment: String,
    pub started_date_time: DateTime<Utc>,
    pub finished_date_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_wire_keys() {
        let result = AnalysisResult {
            filename: "x.bin".to_string(),
            data: "{\"k\":\"v\"}".to_string(),
            md5: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
            sha1: "da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string(),
            sha256: "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
                .to_string(),
            service_name: "svcA".to_string(),
            tags: vec!["malware".to_string()],
            comment: "".to_string(),
            started_date_time: Utc::now(),
            finished_date_time: Utc::now(),
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["filename"], "x.bin");
        assert_eq!(json["data"], "{\"k\":\"v\"}");
        assert_eq!(json["service_name"], "svcA");
        assert!(json["started_date_time"].is_string());
        assert!(json["finished_date_time"].is_string());
    }
}
