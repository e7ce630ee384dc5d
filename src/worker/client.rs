//! Worker API client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::WorkerError;
use crate::domain::{CheckedVersion, Version};

/// Request body for a resource check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    #[serde(rename = "type")]
    pub type_: String,

    pub source: serde_json::Value,

    /// Latest known version; the check returns versions from here on
    #[serde(default)]
    pub version: Option<Version>,
}

/// Kind of plan step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Get,
    Task,
    Put,
}

/// Request body for executing one plan step on a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRequest {
    /// Lets the worker de-duplicate a step re-sent after a crash
    pub idempotency_key: String,

    pub build_id: i64,

    pub step_index: usize,

    pub kind: StepKind,

    /// Step name (input/output name or task name)
    pub name: String,

    /// Resource type for get/put steps
    #[serde(default)]
    pub resource_type: Option<String>,

    /// Resource source for get/put steps
    #[serde(default)]
    pub source: serde_json::Value,

    /// Step params, or the task config for task steps
    #[serde(default)]
    pub params: serde_json::Value,

    /// Version to fetch (get steps)
    #[serde(default)]
    pub version: Option<Version>,
}

/// Outcome of a plan step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub succeeded: bool,

    /// Version fetched (get) or produced (put)
    #[serde(default)]
    pub version: Option<CheckedVersion>,

    /// Failure detail
    #[serde(default)]
    pub message: Option<String>,
}

impl StepResult {
    pub fn success() -> Self {
        Self {
            succeeded: true,
            version: None,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            version: None,
            message: Some(message.into()),
        }
    }
}

/// Calls a single worker
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Health check
    async fn ping(&self) -> Result<(), WorkerError>;

    /// Run a resource check, returning versions newer than `cursor` in order
    async fn run_check(
        &self,
        resource_type: &str,
        source: &serde_json::Value,
        cursor: Option<&Version>,
    ) -> Result<Vec<CheckedVersion>, WorkerError>;

    /// Execute one plan step
    async fn run_step(&self, request: &StepRequest) -> Result<StepResult, WorkerError>;
}

/// JSON-over-HTTP worker client
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    /// Worker name (for errors and logs)
    name: String,
    /// Base address, without trailing slash
    addr: String,
    /// Shared HTTP client (connection pool, timeouts, keep-alive)
    client: reqwest::Client,
}

impl HttpWorkerClient {
    pub fn new(name: impl Into<String>, addr: &str, client: reqwest::Client) -> Self {
        Self {
            name: name.into(),
            addr: addr.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.addr, path)
    }

    fn transport(&self, err: reqwest::Error) -> WorkerError {
        WorkerError::Transport {
            worker: self.name.clone(),
            message: err.to_string(),
        }
    }

    /// Map a response to an error: 5xx is retryable, anything else is not
    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response, WorkerError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("{}: {}", status, body.trim());
        if status.is_server_error() {
            Err(WorkerError::Transport {
                worker: self.name.clone(),
                message,
            })
        } else {
            Err(WorkerError::Rejected {
                worker: self.name.clone(),
                message,
            })
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, WorkerError> {
        response.json().await.map_err(|e| WorkerError::Rejected {
            worker: self.name.clone(),
            message: format!("invalid response: {}", e),
        })
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn ping(&self) -> Result<(), WorkerError> {
        let response = self
            .client
            .get(self.url("ping"))
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        self.check_status(response).await?;
        Ok(())
    }

    async fn run_check(
        &self,
        resource_type: &str,
        source: &serde_json::Value,
        cursor: Option<&Version>,
    ) -> Result<Vec<CheckedVersion>, WorkerError> {
        let request = CheckRequest {
            type_: resource_type.to_string(),
            source: source.clone(),
            version: cursor.cloned(),
        };
        debug!(worker = %self.name, resource_type, "Running check");

        let response = self
            .client
            .post(self.url("checks"))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let response = self.check_status(response).await?;
        self.decode(response).await
    }

    async fn run_step(&self, request: &StepRequest) -> Result<StepResult, WorkerError> {
        debug!(
            worker = %self.name,
            build_id = request.build_id,
            step = %request.name,
            "Running step"
        );

        let response = self
            .client
            .post(self.url("steps"))
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let response = self.check_status(response).await?;
        self.decode(response).await
    }
}
