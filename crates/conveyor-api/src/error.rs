//! Mapping of domain errors onto HTTP responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use conveyor_core::Error;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Domain(Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Domain(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            ApiError::Domain(e) => match e {
                Error::ConfigConflict { .. }
                | Error::InvalidWorkerState { .. }
                | Error::ManualTriggerDisabled(_) => StatusCode::CONFLICT,
                Error::InvalidConfig(_) | Error::Compile(_) | Error::Serialization(_) => {
                    StatusCode::BAD_REQUEST
                }
                Error::NoWorkerFits(_) | Error::LockUnavailable(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(msg) => msg,
            ApiError::Domain(e) => {
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    tracing::error!(error = %e, "Request failed");
                }
                e.to_string()
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Domain(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
