use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::{RequestBodyTimeoutLayer, TimeoutLayer};
use tracing::{debug, error, info, warn};

use crate::context::DaemonContext;
use crate::errors::DaemonError;
use crate::instance::InstanceManager;
use crate::lock::SupervisorLock;
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::shell::KoiShell;
use crate::types::DaemonStatus;

/// Path of the single control endpoint.
pub const API_PATH: &str = "/api";

/// Everything a request handler can reach.
pub struct ApiState {
    pub ctx: Arc<DaemonContext>,
    pub manager: Arc<InstanceManager>,
    pub shell: Arc<KoiShell>,
    pub record: SupervisorLock,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl ApiState {
    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            pid: self.record.pid,
            uptime_secs: self.started_at.elapsed().as_secs(),
            host: self.record.host.clone(),
            port: self.record.port.clone(),
            instance_count: self.manager.instance_count(),
            running_count: self.manager.running_count(),
            helpers_in_flight: self.shell.in_flight(),
        }
    }
}

/// `POST /api` with every request bounded by the configured timeout.
pub fn router(state: Arc<ApiState>) -> Router {
    let timeout = state.ctx.config.request_timeout();
    Router::new()
        .route(API_PATH, post(handle_api))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            timeout,
        ))
        .layer(RequestBodyTimeoutLayer::new(timeout))
        .with_state(state)
}

async fn handle_api(State(state): State<Arc<ApiState>>, body: Bytes) -> Response {
    let request = match serde_json::from_slice::<DaemonRequest>(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(event = "daemon.api.request_invalid", error = %e);
            let err = DaemonError::ProtocolError(e.to_string());
            return (StatusCode::BAD_REQUEST, Json(DaemonResponse::error(&err))).into_response();
        }
    };
    debug!(event = "daemon.api.request_received", request = ?request);

    match dispatch(&state, request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) => {
            if e.is_user_error() {
                warn!(event = "daemon.api.request_failed", code = e.error_code(), error = %e);
            } else {
                error!(event = "daemon.api.request_failed", code = e.error_code(), error = %e);
            }
            (status_for(&e), Json(DaemonResponse::error(&e))).into_response()
        }
    }
}

async fn dispatch(
    state: &Arc<ApiState>,
    request: DaemonRequest,
) -> Result<DaemonResponse, DaemonError> {
    match request {
        DaemonRequest::Ping => Ok(DaemonResponse::Pong),
        DaemonRequest::Status => Ok(DaemonResponse::Status {
            status: state.status(),
        }),
        DaemonRequest::List => Ok(DaemonResponse::InstanceList {
            instances: state.manager.list(),
        }),
        DaemonRequest::Start { name } => Ok(DaemonResponse::Instance {
            instance: state.manager.start(&name)?,
        }),
        DaemonRequest::Stop { name } => Ok(DaemonResponse::Instance {
            instance: state.manager.stop(&name)?,
        }),
        DaemonRequest::Restart { name } => {
            // The grace period can outlast the request timeout, so the
            // restart runs detached and the caller polls `list`.
            let instance = state.manager.get(&name)?;
            state
                .manager
                .spawn_restart(&name, state.ctx.config.stop_timeout());
            Ok(DaemonResponse::Instance { instance })
        }
        DaemonRequest::Shutdown => {
            info!(event = "daemon.api.shutdown_requested");
            state.shutdown.cancel();
            Ok(DaemonResponse::Ack)
        }
        DaemonRequest::OpenWebview { name, url } => {
            state.shell.webview(&name, &url)?;
            Ok(DaemonResponse::Ack)
        }
        DaemonRequest::ShowAbout => {
            let shell = Arc::clone(&state.shell);
            tokio::spawn(async move {
                let _ = shell.about(env!("CARGO_PKG_VERSION")).await;
            });
            Ok(DaemonResponse::Ack)
        }
    }
}

fn status_for(err: &DaemonError) -> StatusCode {
    match err {
        DaemonError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
        DaemonError::InstanceAlreadyRunning(_) | DaemonError::InstanceNotRunning(_) => {
            StatusCode::CONFLICT
        }
        DaemonError::ShuttingDown | DaemonError::HelperCapacity { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        e if e.is_user_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DaemonConfig, InstanceConfig, InstanceStatus};
    use axum::body::Body;
    use axum::http::Request;
    use koi_paths::KoiPaths;
    use tower::ServiceExt;

    fn state(dir: &tempfile::TempDir, instances: Vec<InstanceConfig>) -> Arc<ApiState> {
        let config = DaemonConfig {
            instances,
            ..DaemonConfig::default()
        };
        let ctx = Arc::new(DaemonContext::new(
            KoiPaths::from_dir(dir.path().to_path_buf()),
            config,
        ));
        Arc::new(ApiState {
            manager: Arc::new(InstanceManager::new(Arc::clone(&ctx))),
            shell: Arc::new(KoiShell::new(
                ctx.helper_path(),
                ctx.paths.config_dir(),
            )),
            ctx,
            record: SupervisorLock::for_current_process("127.0.0.1", 41234),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        })
    }

    async fn call(state: &Arc<ApiState>, body: &str) -> (StatusCode, DaemonResponse) {
        let request = Request::builder()
            .method("POST")
            .uri(API_PATH)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = router(Arc::clone(state)).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_ping() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, Vec::new());
        let (status, response) = call(&state, r#"{"type":"ping"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response, DaemonResponse::Pong);
    }

    #[tokio::test]
    async fn test_status_reports_record() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, Vec::new());
        let (_, response) = call(&state, r#"{"type":"status"}"#).await;
        let DaemonResponse::Status { status } = response else {
            panic!("unexpected response: {response:?}");
        };
        assert_eq!(status.pid, std::process::id());
        assert_eq!(status.port, "41234");
        assert_eq!(status.instance_count, 0);
    }

    #[tokio::test]
    async fn test_malformed_body_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, Vec::new());
        let (status, response) = call(&state, "{nope").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(matches!(
            response,
            DaemonResponse::Error { ref code, .. } if code == "protocol_error"
        ));
    }

    #[tokio::test]
    async fn test_unknown_instance_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, Vec::new());
        let (status, response) = call(&state, r#"{"type":"start","name":"ghost"}"#).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(matches!(
            response,
            DaemonResponse::Error { ref code, .. } if code == "instance_not_found"
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_token() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, Vec::new());
        let (_, response) = call(&state, r#"{"type":"shutdown"}"#).await;
        assert_eq!(response, DaemonResponse::Ack);
        assert!(state.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_webview_without_helper_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir, Vec::new());
        let (status, response) = call(
            &state,
            r#"{"type":"open_webview","name":"main","url":"http://127.0.0.1:5140"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(matches!(
            response,
            DaemonResponse::Error { ref code, .. } if code == "spawn_failed"
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_list_stop() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(
            &dir,
            vec![InstanceConfig {
                name: "default".to_string(),
                command: "sleep".to_string(),
                args: vec!["30".to_string()],
                cwd: None,
                env: Default::default(),
                autostart: true,
            }],
        );

        let (status, response) = call(&state, r#"{"type":"start","name":"default"}"#).await;
        assert_eq!(status, StatusCode::OK);
        let DaemonResponse::Instance { instance } = response else {
            panic!("unexpected response: {response:?}");
        };
        assert_eq!(instance.status, InstanceStatus::Running);

        let (status, _) = call(&state, r#"{"type":"start","name":"default"}"#).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, response) = call(&state, r#"{"type":"list"}"#).await;
        let DaemonResponse::InstanceList { instances } = response else {
            panic!("unexpected response: {response:?}");
        };
        assert_eq!(instances.len(), 1);
        assert!(instances[0].pid.is_some());

        let (status, _) = call(&state, r#"{"type":"stop","name":"default"}"#).await;
        assert_eq!(status, StatusCode::OK);
        state
            .manager
            .stop_all(std::time::Duration::from_secs(5))
            .await;
    }
}
