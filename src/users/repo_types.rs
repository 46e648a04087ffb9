use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// User record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // Argon2 hash, not exposed in JSON
    pub is_active: bool,
    pub last_login: Option<OffsetDateTime>,
    pub date_joined: OffsetDateTime,
    /// Current `jti`; rotating it revokes every bearer token issued so far.
    #[serde(skip_serializing)]
    pub token_identifier: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PrimaryEmail {
    pub user_id: Uuid,
    pub verified: bool,
    pub verified_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Profile {
    pub user_id: Uuid,
    pub location: String,
    pub bio: String,
    pub updated_at: OffsetDateTime,
}

/// One sign-in. Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct NewActivity {
    pub user_id: Uuid,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Partial update of the caller's own account. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct AccountChanges {
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub location: Option<String>,
    pub bio: Option<String>,
}

impl AccountChanges {
    pub fn touches_user_row(&self) -> bool {
        self.email.is_some() || self.password_hash.is_some()
    }

    pub fn touches_profile(&self) -> bool {
        self.location.is_some() || self.bio.is_some()
    }
}
