//! HTTP API error handling.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// API error carried to the HTTP edge.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "type": match self.status {
                    StatusCode::BAD_REQUEST => "invalid_request_error",
                    StatusCode::NOT_FOUND => "not_found_error",
                    _ => "server_error",
                },
            }
        }));
        (self.status, body).into_response()
    }
}

impl From<sauti_core::Error> for ApiError {
    fn from(err: sauti_core::Error) -> Self {
        use sauti_core::Error;
        match &err {
            Error::Validation(_) => ApiError::bad_request(err.to_string()),
            Error::BackendNotFound(_) | Error::ModelNotFound(_) => {
                ApiError::not_found(err.to_string())
            }
            _ => ApiError::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sauti_core::Error;

    #[test]
    fn status_mapping_follows_error_kind() {
        let bad: ApiError = Error::Validation("provider is required".into()).into();
        assert_eq!(bad.status, StatusCode::BAD_REQUEST);

        let missing: ApiError = Error::ModelNotFound("m".into()).into();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let missing: ApiError = Error::BackendNotFound("p".into()).into();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let internal: ApiError = Error::Canceled.into();
        assert_eq!(internal.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
