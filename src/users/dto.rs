use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::users::repo_types::{ActivityRecord, PrimaryEmail, Profile, User};

/// Request body for sign-up.
#[derive(Debug, Deserialize)]
pub struct SignUpRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct SignUpResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Returned by sign-in and refresh.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
}

/// PATCH /users/me/. Absent fields are left unchanged.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateMeRequest {
    pub email: Option<String>,
    pub password: Option<String>,
    pub location: Option<String>,
    pub bio: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordConfirmRequest {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailConfirmRequest {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}
fn default_limit() -> i64 {
    20
}

impl Pagination {
    pub const MAX_LIMIT: i64 = 100;

    pub fn clamped(&self) -> (i64, i64) {
        (self.limit.clamp(1, Self::MAX_LIMIT), self.offset.max(0))
    }
}

#[derive(Debug, Serialize)]
pub struct ProfileView {
    pub location: String,
    pub bio: String,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl From<Profile> for ProfileView {
    fn from(p: Profile) -> Self {
        Self {
            location: p.location,
            bio: p.bio,
            updated_at: p.updated_at,
        }
    }
}

/// The caller's own account, as returned by GET and PATCH /users/me/.
#[derive(Debug, Serialize)]
pub struct AccountView {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub email_verified: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub email_verified_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_login: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub date_joined: OffsetDateTime,
    pub profile: ProfileView,
}

impl AccountView {
    pub fn new(user: User, email: PrimaryEmail, profile: Profile) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            email_verified: email.verified,
            email_verified_at: email.verified_at,
            last_login: user.last_login,
            date_joined: user.date_joined,
            profile: profile.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PublicProfileBody {
    pub location: String,
    pub bio: String,
}

/// What anyone can see at GET /users/{username}/.
#[derive(Debug, Serialize)]
pub struct PublicProfile {
    pub username: String,
    #[serde(with = "time::serde::rfc3339")]
    pub date_joined: OffsetDateTime,
    pub profile: PublicProfileBody,
}

#[derive(Debug, Serialize)]
pub struct ActivityView {
    pub id: Uuid,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl From<ActivityRecord> for ActivityView {
    fn from(a: ActivityRecord) -> Self {
        Self {
            id: a.id,
            ip_address: a.ip_address,
            user_agent: a.user_agent,
            created_at: a.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActivityPage {
    pub count: i64,
    pub limit: i64,
    pub offset: i64,
    pub results: Vec<ActivityView>,
}
