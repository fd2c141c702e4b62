use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Unified error type for the API. Every handler maps its failures here;
/// nothing propagates to a framework fallback.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Server error")]
    Internal(#[from] anyhow::Error),

    #[error("Server error")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => ApiError::NotFound("User not found".into()),
            // Unique constraint violation; keeps the duplicate-email contract
            // intact even when two registrations race past the pre-check.
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                ApiError::Conflict("Email already registered".into())
            }
            _ => ApiError::Database(err),
        }
    }
}

/// JSON body sent with every error response.
#[derive(Serialize)]
struct ErrorBody {
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            // Conflict rides on 400 rather than 409: the public contract of
            // this API reports duplicate emails as a plain bad request.
            ApiError::Validation(msg) | ApiError::Conflict(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone())
            }
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg.clone()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Internal(err) => {
                error!(error = %err, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Server error".to_string())
            }
            ApiError::Database(err) => {
                error!(error = %err, "database error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Server error".to_string())
            }
        };

        (status, Json(ErrorBody { message })).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
