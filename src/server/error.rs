//! Maps internal failures to the `{ "error": ..., "statusCode": ..., "code": ... }`
//! JSON body every REST endpoint returns on failure, in the `AppError`/
//! `IntoResponse` shape used across the corpus's axum services. `statusCode`
//! is the wire field the spec's error contract names; `code` is a
//! machine-readable extra the teacher's `AppError` also carries.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("event not found")]
    EventNotFound,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("could not reach sequence counter after retrying: {0}")]
    SequenceConflict(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(rename = "statusCode")]
    status_code: u16,
    code: &'static str,
}

impl ServerError {
    fn parts(&self) -> (StatusCode, &'static str) {
        match self {
            ServerError::RepositoryNotFound(_) => (StatusCode::NOT_FOUND, "repository_not_found"),
            ServerError::EventNotFound => (StatusCode::NOT_FOUND, "event_not_found"),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ServerError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            ServerError::Serde(_) => (StatusCode::BAD_REQUEST, "invalid_json"),
            ServerError::SequenceConflict(_) => (StatusCode::CONFLICT, "sequence_conflict"),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        let body = ErrorBody { error: self.to_string(), status_code: status.as_u16(), code };
        (status, Json(body)).into_response()
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
