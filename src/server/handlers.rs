//! HTTP API handlers

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;
use tracing::warn;

use crate::clients::ClientInfo;
use crate::error::RecordingError;
use crate::relay::{Relay, RelayStatus};

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Liveness check
pub async fn health() -> &'static str {
    "OK"
}

/// Get relay status
pub async fn get_status(State(relay): State<Arc<Relay>>) -> Json<ApiResponse<RelayStatus>> {
    Json(ApiResponse::ok(relay.status().await))
}

/// Get connected clients
pub async fn get_clients(State(relay): State<Arc<Relay>>) -> Json<ApiResponse<Vec<ClientInfo>>> {
    Json(ApiResponse::ok(relay.registry().snapshot()))
}

/// POST /api/recording/start
pub async fn start_recording(State(relay): State<Arc<Relay>>) -> (StatusCode, Json<ApiResponse<String>>) {
    recording_reply(relay.recorder().start_recording().await)
}

/// POST /api/recording/stop
pub async fn stop_recording(State(relay): State<Arc<Relay>>) -> (StatusCode, Json<ApiResponse<String>>) {
    recording_reply(relay.recorder().stop_recording().await)
}

fn recording_reply(result: Result<String, RecordingError>) -> (StatusCode, Json<ApiResponse<String>>) {
    match result {
        Ok(filename) => (StatusCode::OK, Json(ApiResponse::ok(filename))),
        Err(e) => {
            let status = match e {
                RecordingError::AlreadyRecording | RecordingError::NotRecording => StatusCode::CONFLICT,
                _ => {
                    warn!(error = %e, "Recording request failed");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            (status, Json(ApiResponse::error(e.code())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_shape() {
        let ok = serde_json::to_value(ApiResponse::ok(3)).unwrap();
        assert_eq!(ok, serde_json::json!({"success": true, "data": 3}));

        let err = serde_json::to_value(ApiResponse::<()>::error("no capture")).unwrap();
        assert_eq!(err, serde_json::json!({"success": false, "error": "no capture"}));
    }

    #[test]
    fn test_recording_reply_status() {
        let (status, Json(body)) = recording_reply(Ok("recording_x.mp4".into()));
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.data.as_deref(), Some("recording_x.mp4"));

        let (status, Json(body)) = recording_reply(Err(RecordingError::NotRecording));
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(!body.success);
        assert_eq!(body.error.as_deref(), Some("not_recording"));

        let spawn = RecordingError::Directory(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"));
        let (status, _) = recording_reply(Err(spawn));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
