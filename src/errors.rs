//! Errors for the operator relay
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("MQTT client error")]
    MqttClientError(#[from] rumqttc::ClientError),

    #[error("Serialization error")]
    SerdeError(#[from] serde_json::Error),

    #[error("Configuration error")]
    ConfigError(#[from] config::ConfigError),

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("WebSocket error")]
    WebSocketError(#[from] axum::Error),

    #[error("IO error")]
    IoError(#[from] std::io::Error),

    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Invalid operator id: {0:?}")]
    InvalidOperatorId(String),

    #[error("Operator not found: {0}")]
    OperatorNotFound(String),

    #[error("Relay task is not running")]
    RelayClosed,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match self {
            RelayError::InvalidOperatorId(_) | RelayError::SerdeError(_) => {
                StatusCode::BAD_REQUEST
            }
            RelayError::OperatorNotFound(_) => StatusCode::NOT_FOUND,
            RelayError::RelayClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
