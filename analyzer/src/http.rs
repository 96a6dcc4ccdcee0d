use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use errors::error::AnalyzerError;
use errors::{Error, Result};
use log::debug;
use reqwest::Client;
use serde::de::DeserializeOwned;

use crate::{Analyzer, AnalyzerProvider, CheckTask, NewTask, ServiceStatus, TaskResults};

/// Builds the process-wide HTTP client. One pooled client is shared by
/// every stage and analyzer handle so connections stay open across
/// calls.
pub fn build_client(verify_ssl: bool) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(120))
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .tcp_nodelay(true)
        .danger_accept_invalid_certs(!verify_ssl)
        .build()
        .map_err(|e| AnalyzerError::Transport(Box::new(e)).into())
}

/// One back-end behind one base URL, spoken to over plain HTTP GETs
/// with JSON replies.
pub struct HttpAnalyzer {
    name: String,
    url: String,
    client: Client,
}

impl HttpAnalyzer {
    pub fn new(name: &str, url: &str, client: Client) -> Self {
        Self {
            name: name.to_string(),
            url: url.trim_end_matches('/').to_string(),
            client,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.url, path);
        debug!("{}: GET {}", self.name, url);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AnalyzerError::Transport(Box::new(e)))?;

        let status = resp.status();
        // Always read the full body, even on errors, so the pooled
        // connection stays reusable.
        let body = resp
            .bytes()
            .await
            .map_err(|e| AnalyzerError::Transport(Box::new(e)))?;

        if status.as_u16() != 200 {
            return Err(AnalyzerError::InvalidStatus(status.as_u16()).into());
        }

        serde_json::from_slice(&body).map_err(|e| AnalyzerError::InvalidReply(Box::new(e)).into())
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn status(&self) -> Result<ServiceStatus> {
        let status: ServiceStatus = self.get("status/").await?;
        if !status.error.is_empty() {
            return Err(Error::analyzer_reported(&status.error));
        }
        Ok(status)
    }

    async fn new_task(&self, sample: &str) -> Result<NewTask> {
        let task: NewTask = self.get(&format!("feed/{}", sample)).await?;
        if !task.error.is_empty() {
            return Err(Error::analyzer_reported(&task.error));
        }
        if task.task_id.is_empty() {
            return Err(AnalyzerError::EmptyTaskId.into());
        }
        Ok(task)
    }

    async fn check_task(&self, task_id: &str) -> Result<CheckTask> {
        let check: CheckTask = self.get(&format!("check/{}", task_id)).await?;
        if !check.error.is_empty() {
            return Err(Error::analyzer_reported(&check.error));
        }
        Ok(check)
    }

    async fn task_results(&self, task_id: &str) -> Result<TaskResults> {
        let results: TaskResults = self.get(&format!("results/{}", task_id)).await?;
        if !results.error.is_empty() {
            return Err(Error::analyzer_reported(&results.error));
        }
        Ok(results)
    }
}

/// Production provider: every `(service, URL)` pair gets an
/// `HttpAnalyzer` sharing the one pooled client.
pub struct HttpProvider {
    client: Client,
}

impl HttpProvider {
    pub fn new(verify_ssl: bool) -> Result<Self> {
        Ok(Self {
            client: build_client(verify_ssl)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl AnalyzerProvider for HttpProvider {
    fn analyzer(&self, service: &str, url: &str) -> Arc<dyn Analyzer> {
        Arc::new(HttpAnalyzer::new(service, url, self.client.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn healthy_backend() -> Router {
        Router::new()
            .route(
                "/status/",
                get(|| async { Json(json!({"Degraded": false, "Error": "", "FreeSlots": 2})) }),
            )
            .route(
                "/feed/{sample}",
                get(|Path(sample): Path<String>| async move {
                    Json(json!({"Error": "", "TaskID": format!("task-{}", sample)}))
                }),
            )
            .route(
                "/check/{id}",
                get(|Path(id): Path<String>| async move {
                    Json(json!({"Error": "", "Done": id == "task-done"}))
                }),
            )
            .route(
                "/results/{id}",
                get(|| async { Json(json!({"Error": "", "Results": {"k": "v"}})) }),
            )
    }

    #[tokio::test]
    async fn test_full_task_cycle() {
        let url = serve(healthy_backend()).await;
        let analyzer = HttpAnalyzer::new("svcA", &url, build_client(true).unwrap());

        let status = analyzer.status().await.unwrap();
        assert_eq!(status.free_slots, 2);

        let task = analyzer.new_task("sample.bin").await.unwrap();
        assert_eq!(task.task_id, "task-sample.bin");

        let check = analyzer.check_task("task-pending").await.unwrap();
        assert!(!check.done);
        let check = analyzer.check_task("task-done").await.unwrap();
        assert!(check.done);

        let results = analyzer.task_results("task-done").await.unwrap();
        assert_eq!(results.results["k"], "v");
    }

    #[tokio::test]
    async fn test_reported_errors_are_failures() {
        let app = Router::new()
            .route(
                "/status/",
                get(|| async {
                    Json(json!({"Degraded": true, "Error": "vm pool down", "FreeSlots": 0}))
                }),
            )
            .route(
                "/feed/{sample}",
                get(|| async { Json(json!({"Error": "busy", "TaskID": ""})) }),
            )
            .route(
                "/check/{id}",
                get(|| async { Json(json!({"Error": "vm crashed", "Done": false})) }),
            );
        let url = serve(app).await;
        let analyzer = HttpAnalyzer::new("svcA", &url, build_client(true).unwrap());

        let err = analyzer.status().await.unwrap_err();
        assert!(err.to_string().contains("vm pool down"));

        let err = analyzer.new_task("x").await.unwrap_err();
        assert!(err.to_string().contains("busy"));

        let err = analyzer.check_task("t1").await.unwrap_err();
        assert!(err.to_string().contains("vm crashed"));
    }

    #[tokio::test]
    async fn test_non_200_is_a_failure() {
        let app = Router::new().route(
            "/status/",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response() }),
        );
        let url = serve(app).await;
        let analyzer = HttpAnalyzer::new("svcA", &url, build_client(true).unwrap());

        let err = analyzer.status().await.unwrap_err();
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_empty_task_id_is_a_failure() {
        let app = Router::new().route(
            "/feed/{sample}",
            get(|| async { Json(json!({"Error": "", "TaskID": ""})) }),
        );
        let url = serve(app).await;
        let analyzer = HttpAnalyzer::new("svcA", &url, build_client(true).unwrap());

        let err = analyzer.new_task("x").await.unwrap_err();
        assert!(err.to_string().contains("empty task id"));
    }
}
