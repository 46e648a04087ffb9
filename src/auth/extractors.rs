use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use thiserror::Error;
use tracing::debug;

use crate::{
    auth::jwt::{JwtKeys, TokenError},
    error::ApiError,
    state::AppState,
    users::repo_types::User,
};

const NOT_PROVIDED: &str = "Authentication credentials were not provided.";
const INVALID: &str = "Invalid or expired token.";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed Authorization header")]
pub struct MalformedHeader;

/// Pulls the token out of `Bearer <token>`.
pub fn bearer_token(header: &str) -> Result<&str, MalformedHeader> {
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .ok_or(MalformedHeader)?
        .trim();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return Err(MalformedHeader);
    }
    Ok(token)
}

/// The user behind a valid bearer token. Also stored in the request
/// extensions for extractors that run after it.
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .ok_or(ApiError::Unauthenticated(NOT_PROVIDED))?;

        let token = header
            .to_str()
            .map_err(|_| MalformedHeader)
            .and_then(bearer_token)
            .map_err(|e| {
                debug!(reason = %e, "bearer token rejected");
                ApiError::Unauthenticated(INVALID)
            })?;

        let keys = JwtKeys::from_ref(state);
        let user = keys
            .verify(state.store.as_ref(), token)
            .await
            .map_err(|e| match e {
                TokenError::Store(e) => ApiError::Internal(e.into()),
                other => {
                    debug!(reason = %other, "bearer token rejected");
                    ApiError::Unauthenticated(INVALID)
                }
            })?;

        parts.extensions.insert(user.clone());
        Ok(AuthUser(user))
    }
}
