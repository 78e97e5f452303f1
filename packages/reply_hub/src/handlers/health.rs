use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::warn;

use crate::AppState;
use crate::metrics;

/// Health check endpoint - returns server status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let metrics = state.metrics.snapshot();

    let status = if metrics.errors.persistence == 0 {
        "healthy"
    } else {
        "degraded"
    };

    Json(metrics::HealthStatus {
        status: status.to_string(),
        connections: metrics.connections.active,
        active_sessions: state.hub.sessions().len() as u64,
        uptime_secs: metrics.uptime_secs,
    })
}

/// Metrics endpoint - returns detailed server metrics plus database totals
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let database = match state.db.get_stats().await {
        Ok(stats) => serde_json::to_value(stats).unwrap_or_default(),
        Err(e) => {
            warn!("Failed to read database stats: {:#}", e);
            serde_json::Value::Null
        }
    };
    Json(serde_json::json!({
        "server": state.metrics.snapshot(),
        "database": database,
    }))
}

/// Liveness probe - returns 200 if the server is running
pub async fn health_live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "alive" }))
}

/// Readiness probe - returns 200 if the server is ready to accept requests
pub async fn health_ready_handler(State(state): State<AppState>) -> Response {
    let db_ok = state.db.pool.acquire().await.is_ok();

    if db_ok {
        Json(serde_json::json!({
            "status": "ready",
            "database": "connected"
        }))
        .into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected"
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    use super::*;

    async fn get_json(app: axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_healthy() {
        let (state, _) = crate::test_helpers::test_app_state().await;
        let (status, json) = get_json(crate::build_router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["active_sessions"], 0);
    }

    #[tokio::test]
    async fn test_health_degrades_after_persistence_error() {
        let (state, _) = crate::test_helpers::test_app_state().await;
        state.metrics.persistence_error();
        let (_, json) = get_json(crate::build_router(state), "/health").await;
        assert_eq!(json["status"], "degraded");
    }

    #[tokio::test]
    async fn test_ready_and_live() {
        let (state, _) = crate::test_helpers::test_app_state().await;
        let app = crate::build_router(state);

        let (status, json) = get_json(app.clone(), "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["database"], "connected");

        let (status, json) = get_json(app, "/health/live").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "alive");
    }

    #[tokio::test]
    async fn test_metrics_include_database_totals() {
        let (state, _) = crate::test_helpers::test_app_state().await;
        let (status, json) = get_json(crate::build_router(state), "/api/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["server"]["sessions"].is_object());
        assert_eq!(json["database"]["messages"], 0);
    }
}
