pub mod http;

pub use http::{HttpAnalyzer, HttpProvider, build_client};

use std::sync::Arc;

use async_trait::async_trait;
use errors::Result;
use serde::{Deserialize, Serialize};

/// Reply of a status request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ServiceStatus {
    pub degraded: bool,
    pub error: String,
    pub free_slots: i64,
}

/// Reply of a feed request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct NewTask {
    pub error: String,
    #[serde(rename = "TaskID")]
    pub task_id: String,
}

/// Reply of a check request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct CheckTask {
    pub error: String,
    pub done: bool,
}

/// Reply of a results request. `results` is the analyzer's report,
/// kept opaque until submit stringifies it into the result envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct TaskResults {
    pub error: String,
    pub results: serde_json::Value,
}

/// The uniform contract every analysis back-end is reduced to. The
/// pipeline only ever talks through these four calls; whatever quirks
/// a concrete back-end has stay behind its HTTP facade.
#[async_trait]
pub trait Analyzer: Send + Sync {
    /// The service name this handle was built for.
    fn name(&self) -> &str;

    async fn status(&self) -> Result<ServiceStatus>;

    /// Starts an analysis of `sample` and returns its task id.
    async fn new_task(&self, sample: &str) -> Result<NewTask>;

    async fn check_task(&self, task_id: &str) -> Result<CheckTask>;

    async fn task_results(&self, task_id: &str) -> Result<TaskResults>;
}

/// Hands out analyzer handles for a `(service, URL)` pair. The
/// pipeline stages go through this seam so tests can slide scripted
/// analyzers underneath them.
pub trait AnalyzerProvider: Send + Sync {
    fn analyzer(&self, service: &str, url: &str) -> Arc<dyn Analyzer>;
}
