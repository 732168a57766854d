//! Error codes and JSON error responses for the control API

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for control API failures
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlErrorCode {
    /// Request body is empty or not valid UTF-8
    InvalidDocument,
    /// The engine rejected the configuration during construction
    EngineCreateFailed,
    /// Unsupported method for the endpoint
    MethodNotAllowed,
    /// Internal control-plane error
    InternalError,
}

impl ControlErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ControlErrorCode::InvalidDocument => StatusCode::BAD_REQUEST,
            ControlErrorCode::EngineCreateFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ControlErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ControlErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Control-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ControlErrorCode::InvalidDocument => "INVALID_DOCUMENT",
            ControlErrorCode::EngineCreateFailed => "ENGINE_CREATE_FAILED",
            ControlErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ControlErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ControlErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ControlErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with an X-Control-Error header
pub fn json_error_response(
    code: ControlErrorCode,
    message: impl Into<String>,
) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Control-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}
