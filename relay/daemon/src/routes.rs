//! HTTP Routes
//!
//! Health check and synchronous inference. Streaming goes through the
//! WebSocket listener instead.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use relay_core::{
    inference, ControlMessage, InboundMessage, RelayConfig, RelayError, UpstreamBackend,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub backend: Arc<dyn UpstreamBackend>,
}

/// Success body: `{"code": 200, "message": ..., "data": ...}`
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: u16,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    fn ok(message: &'static str, data: Option<T>) -> Self {
        Self {
            code: StatusCode::OK.as_u16(),
            message,
            data,
        }
    }
}

/// Request failures, rendered as `{"detail": ...}`
#[derive(Debug, Error)]
pub enum ApiError {
    /// The body is not a usable request
    #[error("{0}")]
    Unprocessable(String),

    /// The model is not on the allow-list
    #[error("{0}")]
    ModelNotAllowed(String),

    /// Upstream or internal failure
    #[error("An error occurred: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ModelNotAllowed(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::ModelNotAllowed(reason) => Self::ModelNotAllowed(reason),
            RelayError::Protocol(e) => Self::Unprocessable(e.to_string()),
            RelayError::Upstream(reason) => Self::Internal(reason),
            RelayError::Transport(e) => Self::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Inference request failed");
        } else {
            tracing::debug!(status = %status, error = %self, "Inference request rejected");
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/models/inference", post(inference))
        .with_state(state)
}

/// `GET /`
async fn health() -> Json<ApiResponse<()>> {
    Json(ApiResponse::ok("Check health Done", None))
}

/// `POST /models/inference`
async fn inference(
    State(state): State<AppState>,
    payload: Result<Json<InboundMessage>, JsonRejection>,
) -> Result<Json<ApiResponse<String>>, ApiError> {
    let Json(payload) = payload.map_err(|e| ApiError::Unprocessable(e.body_text()))?;

    let envelope = match payload.into_control().map_err(RelayError::from)? {
        ControlMessage::Request(envelope) => envelope,
        ControlMessage::Cancel => {
            return Err(ApiError::Unprocessable(
                "Cancel is only supported on the streaming endpoint".to_string(),
            ))
        }
    };

    let text = inference::run(&state.config, state.backend.as_ref(), envelope).await?;
    Ok(Json(ApiResponse::ok("Generated success", Some(text))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use relay_core::backend::scripted::ScriptedBackend;
    use relay_core::AllowList;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(backend: ScriptedBackend) -> Router {
        let config = RelayConfig::default().with_allowed_models(AllowList::new(["modelA"]));
        build_router(AppState {
            config: config.into_shared(),
            backend: Arc::new(backend),
        })
    }

    /// Send a request to the app and return (status, JSON body).
    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(request).await.unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn post_json(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/models/inference")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let (status, body) = send(app(ScriptedBackend::echo()), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"code": 200, "message": "Check health Done"}));
    }

    #[tokio::test]
    async fn inference_returns_full_text() {
        let backend = ScriptedBackend::with_fragments(["He", "llo ", "wor", "ld"]);
        let body = json!({
            "model_name": "modelA",
            "conservation": [{"role": "user", "content": "Hi"}],
            "max_token": 64,
        });

        let (status, body) = send(app(backend.clone()), post_json(&body.to_string())).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"code": 200, "message": "Generated success", "data": "Hello world"})
        );
        assert_eq!(backend.requests()[0].max_tokens, 64);
    }

    #[tokio::test]
    async fn inference_rejects_disallowed_model() {
        let backend = ScriptedBackend::with_fragments(["never"]);
        let body = r#"{"model_name": "modelB", "conservation": []}"#;

        let (status, body) = send(app(backend.clone()), post_json(body)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["detail"],
            "Model 'modelB' is not allowed. Accepted models are: modelA"
        );
        assert_eq!(backend.open_count(), 0);
    }

    #[tokio::test]
    async fn inference_reports_upstream_failure() {
        let backend = ScriptedBackend::failing_open("rate limited");
        let body = r#"{"model_name": "modelA", "conservation": []}"#;

        let (status, body) = send(app(backend), post_json(body)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.starts_with("An error occurred: "), "detail: {detail}");
        assert!(detail.contains("rate limited"));
    }

    #[tokio::test]
    async fn inference_rejects_malformed_body() {
        let backend = ScriptedBackend::echo();

        let (status, _) = send(app(backend.clone()), post_json("{not json")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let missing = post_json(r#"{"model_name": "modelA"}"#);
        let (status, body) = send(app(backend.clone()), missing).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"].as_str().unwrap().contains("conservation"));

        let (status, _) = send(app(backend.clone()), post_json(r#"{"action": "cancel"}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        assert_eq!(backend.open_count(), 0);
    }
}
