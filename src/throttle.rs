//! Per-endpoint rate limiting.
//!
//! Each throttled handler names its scope in its signature with
//! `Throttle<SignIn>` etc. Anonymous scopes are keyed by client IP,
//! `VerifyEmail` by the authenticated user, so it must come after `AuthUser`.

use std::{
    collections::{HashMap, VecDeque},
    marker::PhantomData,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use tokio::sync::RwLock;

use crate::{
    config::ThrottleRate, error::ApiError, state::AppState, users::activity,
    users::repo_types::User,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    SignUp,
    SignIn,
    ResetPassword,
    VerifyEmail,
}

impl Scope {
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::SignUp => "sign_up",
            Scope::SignIn => "sign_in",
            Scope::ResetPassword => "reset_password",
            Scope::VerifyEmail => "verify_email",
        }
    }

    fn per_user(self) -> bool {
        matches!(self, Scope::VerifyEmail)
    }
}

pub trait ThrottleScope: Send + Sync + 'static {
    const SCOPE: Scope;
}

pub struct SignUp;
pub struct SignIn;
pub struct ResetPassword;
pub struct VerifyEmail;

impl ThrottleScope for SignUp {
    const SCOPE: Scope = Scope::SignUp;
}
impl ThrottleScope for SignIn {
    const SCOPE: Scope = Scope::SignIn;
}
impl ThrottleScope for ResetPassword {
    const SCOPE: Scope = Scope::ResetPassword;
}
impl ThrottleScope for VerifyEmail {
    const SCOPE: Scope = Scope::VerifyEmail;
}

/// Instants of the admitted requests still inside the window, oldest first.
#[derive(Debug, Clone, Default)]
struct RequestLog {
    history: VecDeque<Instant>,
}

impl RequestLog {
    /// Admits the request if fewer than `limit` were admitted during the
    /// last `window`. On refusal returns seconds until the oldest one ages out.
    fn try_admit(&mut self, limit: usize, window: Duration, now: Instant) -> Result<(), u64> {
        while let Some(&oldest) = self.history.front() {
            if now.duration_since(oldest) >= window {
                self.history.pop_front();
            } else {
                break;
            }
        }

        if self.history.len() < limit {
            self.history.push_back(now);
            return Ok(());
        }
        let oldest = self.history.front().copied().unwrap_or(now);
        let wait = window.saturating_sub(now.duration_since(oldest));
        Err(wait.as_secs_f64().ceil().max(1.0) as u64)
    }

    fn last_seen(&self) -> Option<Instant> {
        self.history.back().copied()
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    logs: Arc<RwLock<HashMap<(Scope, String), RequestLog>>>,
    limit: usize,
    window: Duration,
}

impl RateLimiter {
    pub fn new(rate: ThrottleRate) -> Self {
        Self {
            logs: Arc::new(RwLock::new(HashMap::new())),
            limit: rate.requests as usize,
            window: rate.per,
        }
    }

    pub async fn check(&self, scope: Scope, key: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut logs = self.logs.write().await;
        logs.entry((scope, key.to_string()))
            .or_default()
            .try_admit(self.limit, self.window, now)
    }

    /// Drops clients with no admitted request in the last `max_age`.
    pub async fn cleanup(&self, max_age: Duration) {
        let now = Instant::now();
        self.logs.write().await.retain(|_, log| {
            log.last_seen()
                .is_some_and(|seen| now.duration_since(seen) < max_age)
        });
    }
}

pub struct Throttle<S>(PhantomData<S>);

#[async_trait]
impl<S: ThrottleScope> FromRequestParts<AppState> for Throttle<S> {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let scope = S::SCOPE;
        let key = if scope.per_user() {
            parts.extensions.get::<User>().map(|u| u.id.to_string())
        } else {
            activity::client_ip(&parts.headers, activity::peer_addr(&parts.extensions))
        }
        .unwrap_or_else(|| "anonymous".to_string());

        if let Err(retry_after) = state.throttle.check(scope, &key).await {
            tracing::warn!(scope = scope.as_str(), client = %key, "request throttled");
            return Err(ApiError::Throttled { retry_after });
        }
        Ok(Throttle(PhantomData))
    }
}
