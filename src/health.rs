use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(Option<String>),
}

pub trait HealthCheckable {
    fn health_status(&self) -> HealthStatus;
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        match self {
            HealthStatus::Healthy => StatusCode::OK.into_response(),
            HealthStatus::Unhealthy(message) => {
                let message = message.unwrap_or_else(|| "dashboard unhealthy".to_string());
                (StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "message": message })))
                    .into_response()
            }
        }
    }
}
