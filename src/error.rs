//! API error type and the JSON envelopes it renders to.
//!
//! Single errors render as `{"error": {"message": "..."}}`, field validation
//! failures as `{"errors": {"field": ["..."]}}`.

use std::collections::BTreeMap;

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::users::repo::StoreError;

/// Field name to list of messages. The key `error` holds non-field errors.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

pub const INTERNAL_MESSAGE: &str = "The server encountered an internal error.";

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("validation failed")]
    Validation(FieldErrors),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthenticated(&'static str),

    #[error("Unable to sign in with provided credentials.")]
    InvalidCredentials,

    #[error("Email address has been previously verified.")]
    AlreadyVerified,

    #[error("Invalid or expired token.")]
    InvalidToken,

    #[error("{0}")]
    NotFound(&'static str),

    #[error("Method not allowed.")]
    MethodNotAllowed,

    #[error("Unsupported media type.")]
    UnsupportedMediaType,

    #[error("Request was throttled. Expected available in {retry_after} seconds.")]
    Throttled { retry_after: u64 },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorMessage,
}

#[derive(Serialize)]
struct ErrorMessage {
    message: String,
}

#[derive(Serialize)]
struct FieldErrorBody {
    errors: FieldErrors,
}

impl ApiError {
    pub fn field(field: &str, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field.to_string(), vec![message.into()]);
        ApiError::Validation(errors)
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_)
            | ApiError::BadRequest(_)
            | ApiError::AlreadyVerified
            | ApiError::InvalidToken => StatusCode::BAD_REQUEST,
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::InvalidCredentials => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            ApiError::Validation(errors) => {
                tracing::debug!(fields = ?errors.keys().collect::<Vec<_>>(), "validation failed");
                (status, Json(FieldErrorBody { errors })).into_response()
            }
            ApiError::InvalidToken => {
                let mut errors = FieldErrors::new();
                errors.insert("token".into(), vec![ApiError::InvalidToken.to_string()]);
                (status, Json(FieldErrorBody { errors })).into_response()
            }
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                message_response(status, INTERNAL_MESSAGE.to_string())
            }
            ApiError::Throttled { retry_after } => {
                let message = ApiError::Throttled { retry_after }.to_string();
                let mut res = message_response(status, message);
                if let Ok(v) = retry_after.to_string().parse() {
                    res.headers_mut().insert(header::RETRY_AFTER, v);
                }
                res
            }
            other => message_response(status, other.to_string()),
        }
    }
}

fn message_response(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ErrorBody {
            error: ErrorMessage { message },
        }),
    )
        .into_response()
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::MissingJsonContentType(_) => ApiError::UnsupportedMediaType,
            other => ApiError::BadRequest(format!("JSON parse error - {}", other.body_text())),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { field } => {
                ApiError::field(field, format!("A user with that {field} already exists."))
            }
            StoreError::NotFound => ApiError::NotFound("Not found."),
            StoreError::Database(e) => ApiError::Internal(e.into()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// `Json` extractor whose rejection renders through [`ApiError`].
#[derive(axum::extract::FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// `Query` extractor whose rejection renders through [`ApiError`].
#[derive(axum::extract::FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct ApiQuery<T>(pub T);

/// Router-level 405s carry no body; give them the error envelope and keep
/// the `Allow` header.
pub async fn envelope_method_not_allowed(res: Response) -> Response {
    if res.status() != StatusCode::METHOD_NOT_ALLOWED {
        return res;
    }
    let allow = res.headers().get(header::ALLOW).cloned();
    let mut rewritten = ApiError::MethodNotAllowed.into_response();
    if let Some(allow) = allow {
        rewritten.headers_mut().insert(header::ALLOW, allow);
    }
    rewritten
}
