use axum::extract::FromRef;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use crate::{
    auth::claims::Claims,
    state::AppState,
    users::{
        repo::{StoreError, UserStore},
        repo_types::User,
    },
};

/// Why a bearer token was refused. Callers collapse all of these into one
/// 401 response; the variant is only logged.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token signature mismatch")]
    InvalidSignature,
    #[error("token malformed")]
    Malformed,
    #[error("token subject does not exist")]
    UnknownSubject,
    #[error("token subject is deactivated")]
    Inactive,
    #[error("token issued before the last revocation")]
    Stale,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Holds JWT signing and verification keys with config data.
#[derive(Clone)]
pub struct JwtKeys {
    pub encoding: EncodingKey,
    pub decoding: DecodingKey,
    pub issuer: String,
    pub ttl: Duration,
}

impl FromRef<AppState> for JwtKeys {
    fn from_ref(state: &AppState) -> Self {
        let cfg = &state.config.jwt;
        Self::new(&cfg.secret, &cfg.issuer, cfg.ttl_minutes)
    }
}

impl JwtKeys {
    pub fn new(secret: &str, issuer: &str, ttl_minutes: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.to_string(),
            ttl: Duration::minutes(ttl_minutes),
        }
    }

    pub fn issue(&self, user: &User) -> anyhow::Result<String> {
        self.issue_at(user, OffsetDateTime::now_utc())
    }

    pub fn issue_at(&self, user: &User, now: OffsetDateTime) -> anyhow::Result<String> {
        let claims = Claims {
            iss: self.issuer.clone(),
            sub: user.username.clone(),
            iat: now.unix_timestamp(),
            exp: (now + self.ttl).unix_timestamp(),
            jti: user.token_identifier,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?;
        debug!(user_id = %user.id, "jwt signed");
        Ok(token)
    }

    /// Checks signature, issuer and expiry. Does not consult the store.
    pub fn decode(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                _ => TokenError::Malformed,
            })
    }

    /// Resolves a token to its user, rejecting tokens whose `jti` no longer
    /// matches the user's current `token_identifier`.
    pub async fn verify(&self, store: &dyn UserStore, token: &str) -> Result<User, TokenError> {
        let claims = self.decode(token)?;
        let user = store
            .find_by_username(&claims.sub)
            .await?
            .ok_or(TokenError::UnknownSubject)?;
        if !user.is_active {
            return Err(TokenError::Inactive);
        }
        if claims.jti != user.token_identifier {
            return Err(TokenError::Stale);
        }
        debug!(user_id = %user.id, "jwt verified");
        Ok(user)
    }
}
