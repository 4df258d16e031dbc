use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
};
use serde::Serialize;
use studyhall_core::ControllerHealth;
use tokio::sync::watch;

/// Shared state for status handlers
#[derive(Clone)]
pub struct StatusState {
    pub health: watch::Receiver<ControllerHealth>,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub controller: ControllerHealth,
}

/// Create status routes
pub fn status_routes(state: StatusState) -> Router {
    Router::new()
        .route("/", get(|| async { "Studyhall Provisioning Server" }))
        .route("/health", get(health))
        .with_state(state)
}

/// GET /health - Provisioning controller health.
///
/// Answers 503 once the controller has failed or stopped, so a supervisor
/// can restart the process.
pub async fn health(State(state): State<StatusState>) -> impl IntoResponse {
    let controller = state.health.borrow().clone();
    let (code, status) = match &controller {
        ControllerHealth::Starting => (StatusCode::OK, "starting"),
        ControllerHealth::Running { .. } => (StatusCode::OK, "ok"),
        ControllerHealth::Failed { .. } => (StatusCode::SERVICE_UNAVAILABLE, "failed"),
        ControllerHealth::Stopped => (StatusCode::SERVICE_UNAVAILABLE, "stopped"),
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            controller,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    async fn check(health_state: ControllerHealth) -> (StatusCode, Value) {
        let (_tx, rx) = watch::channel(health_state);
        let response = health(State(StatusState { health: rx })).await.into_response();
        let code = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (code, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_running_controller_is_healthy() {
        let (code, body) = check(ControllerHealth::Running {
            processed: 3,
            failed: 1,
            last_seq: 7,
        })
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["controller"]["state"], "running");
        assert_eq!(body["controller"]["processed"], 3);
        assert_eq!(body["controller"]["last_seq"], 7);
    }

    #[tokio::test]
    async fn test_failed_controller_is_unavailable() {
        let (code, body) = check(ControllerHealth::Failed {
            reason: "account event stream ended".into(),
        })
        .await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "failed");
        assert_eq!(body["controller"]["reason"], "account event stream ended");
    }

    #[tokio::test]
    async fn test_health_follows_the_watch_channel() {
        let (tx, rx) = watch::channel(ControllerHealth::Starting);
        let state = StatusState { health: rx };

        let response = health(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        tx.send_replace(ControllerHealth::Stopped);
        let response = health(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
