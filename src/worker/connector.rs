//! Turning registry entries into clients.

use std::sync::Arc;

use anyhow::{Context, Result};

use super::client::{HttpWorkerClient, WorkerClient};
use crate::config::WorkerSettings;
use crate::domain::WorkerInfo;

/// Builds a client for a registered worker
pub trait WorkerConnector: Send + Sync {
    fn connect(&self, worker: &WorkerInfo) -> Arc<dyn WorkerClient>;
}

/// Connects to workers over HTTP, sharing one connection pool
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    /// Dial with the configured connect timeout and TCP keep-alive idle time
    pub fn new(settings: &WorkerSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(settings.dial_timeout)
            .tcp_keepalive(settings.keepalive_idle)
            .build()
            .context("Failed to build worker HTTP client")?;
        Ok(Self { client })
    }
}

impl WorkerConnector for HttpConnector {
    fn connect(&self, worker: &WorkerInfo) -> Arc<dyn WorkerClient> {
        Arc::new(HttpWorkerClient::new(
            worker.name.clone(),
            &worker.addr,
            self.client.clone(),
        ))
    }
}
