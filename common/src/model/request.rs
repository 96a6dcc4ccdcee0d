use std::collections::HashMap;

use chrono::{DateTime, Utc};
use errors::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};

/// A job from the upstream dispatcher. One message may name several
/// analyzers in `tasks`; each gets its own analysis run.
///
/// When `download` is true the sample bytes live behind `primary_uri`;
/// otherwise `filename` itself is the sample (typically a URL the
/// analyzer dereferences on its own).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExternalRequest {
    #[serde(rename = "primaryURI")]
    pub primary_uri: String,
    #[serde(rename = "secondaryURI")]
    pub secondary_uri: String,
    pub filename: String,
    pub tasks: HashMap<String, Vec<String>>,
    pub tags: Vec<String>,
    pub comment: String,
    pub download: bool,
    pub source: String,
    pub attempts: i32,
}

impl ExternalRequest {
    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            return Err(Error::with_message(
                ErrorKind::Decode,
                "request names no tasks".to_string(),
                None::<errors::BoxError>,
            ));
        }
        if self.download && self.primary_uri.is_empty() {
            return Err(Error::with_message(
                ErrorKind::Decode,
                "download requested without a primary URI".to_string(),
                None::<errors::BoxError>,
            ));
        }
        Ok(())
    }
}

/// A live analysis ticket flowing feed -> check -> submit.
///
/// `file_path` is the basename of the staged sample on disk (or the
/// literal non-downloadable sample) and doubles as the watch-set key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InternalRequest {
    pub service: String,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "TaskID")]
    pub task_id: String,
    pub file_path: String,
    pub started: DateTime<Utc>,
    pub original_request: ExternalRequest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_request_wire_keys() {
        let body = r#"{
            "primaryURI": "http://files/x.bin",
            "secondaryURI": "",
            "filename": "x.bin",
            "tasks": {"svcA": []},
            "tags": ["malware"],
            "comment": "",
            "download": true,
            "source": "gateway",
            "attempts": 0
        }"#;

        let req: ExternalRequest = serde_json::from_str(body).unwrap();
        assert_eq!(req.primary_uri, "http://files/x.bin");
        assert!(req.download);
        assert!(req.tasks.contains_key("svcA"));
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_external_request_tolerates_missing_fields() {
        let req: ExternalRequest =
            serde_json::from_str(r#"{"filename":"http://target","tasks":{"svcA":[]}}"#).unwrap();
        assert!(!req.download);
        assert!(req.tags.is_empty());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_external_request_validation() {
        let req: ExternalRequest = serde_json::from_str(r#"{"filename":"x"}"#).unwrap();
        assert!(req.validate().is_err());

        let req: ExternalRequest =
            serde_json::from_str(r#"{"download":true,"tasks":{"svcA":[]}}"#).unwrap();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_internal_request_wire_keys() {
        let req = InternalRequest {
            service: "svcA".to_string(),
            url: "http://analyzer:8080".to_string(),
            task_id: "t1".to_string(),
            file_path: "totem-dynamic4217".to_string(),
            started: Utc::now(),
            original_request: ExternalRequest::default(),
        };

        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["Service"], "svcA");
        assert_eq!(json["URL"], "http://analyzer:8080");
        assert_eq!(json["TaskID"], "t1");
        assert_eq!(json["FilePath"], "totem-dynamic4217");
        assert!(json["Started"].is_string());
        assert!(json["OriginalRequest"].is_object());

        let round: InternalRequest = serde_json::from_value(json).unwrap();
        assert_eq!(round.task_id, "t1");
    }
}
