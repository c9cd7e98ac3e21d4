//! HTTP client for a running supervisor's control endpoint.
//!
//! The endpoint URL comes from the lock record, so anything that can read the
//! state directory can find and drive the daemon.

use std::time::Duration;

use tracing::debug;

use crate::errors::DaemonError;
use crate::lock::SingletonLock;
use crate::protocol::{DaemonRequest, DaemonResponse, InstanceInfo};
use crate::types::DaemonStatus;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DaemonClient {
    url: String,
    http: reqwest::Client,
}

impl DaemonClient {
    /// Client for the endpoint at `url` (for example `http://127.0.0.1:5140/api`).
    pub fn new(url: impl Into<String>) -> Result<Self, DaemonError> {
        let http = reqwest::Client::builder()
            .timeout(CLIENT_TIMEOUT)
            .build()
            .map_err(|e| DaemonError::ConnectionFailed(e.to_string()))?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }

    /// Client for whichever supervisor holds `lock`.
    ///
    /// Returns `NotRunning` when there is no readable record.
    pub fn from_lock(lock: &SingletonLock) -> Result<Self, DaemonError> {
        let record = lock.read().ok_or(DaemonError::NotRunning)?;
        Self::new(record.api_url())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send one request. Error responses come back as `DaemonError::Remote`.
    pub async fn request(&self, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
        debug!(event = "daemon.client.request_started", url = %self.url, request = ?request);

        let response = self
            .http
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    DaemonError::NotRunning
                } else {
                    DaemonError::ConnectionFailed(e.to_string())
                }
            })?;

        let body = response
            .bytes()
            .await
            .map_err(|e| DaemonError::ConnectionFailed(e.to_string()))?;
        let decoded: DaemonResponse = serde_json::from_slice(&body)
            .map_err(|e| DaemonError::ProtocolError(format!("invalid response: {e}")))?;

        match decoded {
            DaemonResponse::Error { code, message } => Err(DaemonError::Remote { code, message }),
            other => Ok(other),
        }
    }

    pub async fn ping(&self) -> Result<(), DaemonError> {
        match self.request(&DaemonRequest::Ping).await? {
            DaemonResponse::Pong => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn status(&self) -> Result<DaemonStatus, DaemonError> {
        match self.request(&DaemonRequest::Status).await? {
            DaemonResponse::Status { status } => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn list(&self) -> Result<Vec<InstanceInfo>, DaemonError> {
        match self.request(&DaemonRequest::List).await? {
            DaemonResponse::InstanceList { instances } => Ok(instances),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn start(&self, name: &str) -> Result<InstanceInfo, DaemonError> {
        self.instance_request(DaemonRequest::Start {
            name: name.to_string(),
        })
        .await
    }

    pub async fn stop(&self, name: &str) -> Result<InstanceInfo, DaemonError> {
        self.instance_request(DaemonRequest::Stop {
            name: name.to_string(),
        })
        .await
    }

    /// Schedules a restart; poll [`list`](Self::list) to observe the new run.
    pub async fn restart(&self, name: &str) -> Result<InstanceInfo, DaemonError> {
        self.instance_request(DaemonRequest::Restart {
            name: name.to_string(),
        })
        .await
    }

    pub async fn open_webview(&self, name: &str, url: &str) -> Result<(), DaemonError> {
        self.ack_request(DaemonRequest::OpenWebview {
            name: name.to_string(),
            url: url.to_string(),
        })
        .await
    }

    pub async fn show_about(&self) -> Result<(), DaemonError> {
        self.ack_request(DaemonRequest::ShowAbout).await
    }

    pub async fn shutdown(&self) -> Result<(), DaemonError> {
        self.ack_request(DaemonRequest::Shutdown).await
    }

    async fn instance_request(&self, request: DaemonRequest) -> Result<InstanceInfo, DaemonError> {
        match self.request(&request).await? {
            DaemonResponse::Instance { instance } => Ok(instance),
            other => Err(unexpected(&other)),
        }
    }

    async fn ack_request(&self, request: DaemonRequest) -> Result<(), DaemonError> {
        match self.request(&request).await? {
            DaemonResponse::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &DaemonResponse) -> DaemonError {
    DaemonError::ProtocolError(format!("unexpected response: {response:?}"))
}
