use serde::{Deserialize, Serialize};

use crate::logs::ChannelId;
use crate::types::DaemonStatus;

/// Client -> daemon requests, one JSON object per `POST /api` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonRequest {
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "status")]
    Status,

    #[serde(rename = "list")]
    List,

    #[serde(rename = "start")]
    Start { name: String },

    #[serde(rename = "stop")]
    Stop { name: String },

    /// Stop (escalating to kill after the grace period) then start again.
    #[serde(rename = "restart")]
    Restart { name: String },

    /// Shut the whole supervisor down.
    #[serde(rename = "shutdown")]
    Shutdown,

    #[serde(rename = "open_webview")]
    OpenWebview { name: String, url: String },

    #[serde(rename = "show_about")]
    ShowAbout,
}

/// Daemon -> client responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonResponse {
    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "status")]
    Status { status: DaemonStatus },

    #[serde(rename = "instance_list")]
    InstanceList { instances: Vec<InstanceInfo> },

    #[serde(rename = "instance")]
    Instance { instance: InstanceInfo },

    #[serde(rename = "ack")]
    Ack,

    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl DaemonResponse {
    pub fn error(err: &crate::errors::DaemonError) -> Self {
        DaemonResponse::Error {
            code: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Lifecycle state of a managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Never started, or stopped on request.
    Stopped,
    Running,
    /// The process ended on its own.
    Exited,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Stopped => write!(f, "stopped"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Exited => write!(f, "exited"),
        }
    }
}

/// Snapshot of one instance as reported over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub name: String,
    pub channel: ChannelId,
    pub status: InstanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// RFC 3339 time of the last start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shapes() {
        assert_eq!(
            serde_json::to_value(DaemonRequest::Ping).unwrap(),
            json!({"type": "ping"})
        );
        assert_eq!(
            serde_json::to_value(DaemonRequest::Restart {
                name: "default".to_string()
            })
            .unwrap(),
            json!({"type": "restart", "name": "default"})
        );
        let parsed: DaemonRequest =
            serde_json::from_str(r#"{"type":"open_webview","name":"main","url":"http://x"}"#)
                .unwrap();
        assert_eq!(
            parsed,
            DaemonRequest::OpenWebview {
                name: "main".to_string(),
                url: "http://x".to_string()
            }
        );
    }

    #[test]
    fn test_unknown_request_type_rejected() {
        assert!(serde_json::from_str::<DaemonRequest>(r#"{"type":"explode"}"#).is_err());
    }

    #[test]
    fn test_instance_info_omits_empty_fields() {
        let info = InstanceInfo {
            name: "default".to_string(),
            channel: 1,
            status: InstanceStatus::Stopped,
            pid: None,
            started_at: None,
            exit_code: None,
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(
            value,
            json!({"name": "default", "channel": 1, "status": "stopped"})
        );
        let parsed: InstanceInfo = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_error_response_from_daemon_error() {
        let err = crate::errors::DaemonError::InstanceNotFound("ghost".to_string());
        assert_eq!(
            DaemonResponse::error(&err),
            DaemonResponse::Error {
                code: "instance_not_found".to_string(),
                message: "instance not found: ghost".to_string(),
            }
        );
    }
}
