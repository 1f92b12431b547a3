use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

use crate::persistence::DataStore;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub checks: HealthChecks,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthChecks {
    pub database: String,
}

pub struct HealthHandler {
    database: Option<DataStore>,
    start_time: std::time::Instant,
}

impl HealthHandler {
    pub fn new(database: Option<DataStore>) -> Self {
        Self {
            database,
            start_time: std::time::Instant::now(),
        }
    }

    async fn database_check(&self) -> Result<&'static str, String> {
        match &self.database {
            None => Ok("in_memory"),
            Some(store) => store
                .health_check()
                .await
                .map(|_| "ok")
                .map_err(|e| e.to_string()),
        }
    }

    /// Basic health check - returns 200 if server is running
    pub async fn health(&self) -> impl IntoResponse {
        let database = match self.database_check().await {
            Ok(state) => state.to_string(),
            Err(e) => format!("error: {}", e),
        };
        let status = HealthStatus {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            checks: HealthChecks { database },
        };

        (StatusCode::OK, Json(status))
    }

    /// Readiness check - returns 200 once the backing store answers
    pub async fn ready(&self) -> impl IntoResponse {
        match self.database_check().await {
            Ok(_) => (
                StatusCode::OK,
                Json(serde_json::json!({
                    "status": "ready",
                    "message": "Server is ready to accept connections"
                })),
            ),
            Err(e) => {
                tracing::warn!(error = %e, "Readiness check failed");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({
                        "status": "not_ready",
                        "message": format!("Database unavailable: {}", e)
                    })),
                )
            }
        }
    }

    /// Liveness check - returns 200 if server is alive
    pub async fn live(&self) -> impl IntoResponse {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "alive",
                "message": "Server is alive"
            })),
        )
    }
}
