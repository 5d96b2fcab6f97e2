use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum McpError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Operation timed out after {0:?}")]
    OperationTimeout(Duration),

    #[error("Server {0} is not connected")]
    NotConnected(String),

    #[error("Session is closed")]
    SessionClosed,

    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("Invalid server definition: {0}")]
    InvalidDefinition(String),

    #[error("JSON-RPC error: {message} (code: {code})")]
    Rpc { code: i64, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl McpError {
    /// Whether the failure leaves the underlying channel unusable.
    ///
    /// A JSON-RPC error reply proves the server is alive, so it is not terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            McpError::Transport(_)
                | McpError::HandshakeTimeout(_)
                | McpError::OperationTimeout(_)
                | McpError::SessionClosed
                | McpError::Protocol(_)
        )
    }
}

impl From<reqwest::Error> for McpError {
    fn from(err: reqwest::Error) -> Self {
        McpError::Transport(err.to_string())
    }
}

impl From<std::io::Error> for McpError {
    fn from(err: std::io::Error) -> Self {
        McpError::Transport(err.to_string())
    }
}

impl IntoResponse for McpError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            McpError::Transport(_) => (StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR"),
            McpError::HandshakeTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "HANDSHAKE_TIMEOUT"),
            McpError::OperationTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "OPERATION_TIMEOUT"),
            McpError::NotConnected(_) => (StatusCode::CONFLICT, "NOT_CONNECTED"),
            McpError::SessionClosed => (StatusCode::CONFLICT, "SESSION_CLOSED"),
            McpError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "CANCELLED"),
            McpError::UnsupportedTransport(_) => {
                (StatusCode::BAD_REQUEST, "UNSUPPORTED_TRANSPORT")
            }
            McpError::InvalidDefinition(_) => (StatusCode::BAD_REQUEST, "INVALID_DEFINITION"),
            McpError::Rpc { .. } => (StatusCode::BAD_GATEWAY, "RPC_ERROR"),
            McpError::Protocol(_) => (StatusCode::BAD_GATEWAY, "PROTOCOL_ERROR"),
        };

        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
            "code": code,
        }));

        (status, body).into_response()
    }
}
