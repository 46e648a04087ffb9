use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::users::repo_types::{
    AccountChanges, ActivityRecord, NewActivity, NewUser, PrimaryEmail, Profile, User,
};

#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique column (`username` or `email`) already holds this value.
    #[error("{field} already taken")]
    Conflict { field: &'static str },

    #[error("user not found")]
    NotFound,

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence for users and their dependent records.
///
/// Every mutating method is a single statement or a single transaction, so a
/// concurrent reader never sees a half-applied rotation or password change.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Inserts the user together with an unverified primary email and an
    /// empty profile. Nothing is written if any insert fails.
    async fn create_user(&self, new: NewUser) -> StoreResult<User>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;
    async fn find_by_username(&self, username: &str) -> StoreResult<Option<User>>;
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    /// Replaces `token_identifier` with a fresh value and returns the new row.
    async fn rotate_token_identifier(&self, id: Uuid) -> StoreResult<User>;

    /// Clears `is_active` and rotates `token_identifier`.
    async fn deactivate(&self, id: Uuid) -> StoreResult<User>;

    /// Stores a new password hash and rotates `token_identifier`.
    async fn set_password(&self, id: Uuid, password_hash: &str) -> StoreResult<User>;

    async fn mark_signed_in(&self, id: Uuid, at: OffsetDateTime) -> StoreResult<User>;

    async fn primary_email(&self, user_id: Uuid) -> StoreResult<PrimaryEmail>;
    async fn set_email_verified(&self, user_id: Uuid, at: OffsetDateTime)
        -> StoreResult<PrimaryEmail>;

    async fn profile(&self, user_id: Uuid) -> StoreResult<Profile>;

    /// Applies `changes`. A new email resets the primary email to unverified;
    /// a new password hash rotates `token_identifier`.
    async fn update_account(&self, id: Uuid, changes: AccountChanges) -> StoreResult<User>;

    async fn record_activity(&self, new: NewActivity) -> StoreResult<ActivityRecord>;

    /// Newest first, with the total number of records for the user.
    async fn list_activity(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> StoreResult<(i64, Vec<ActivityRecord>)>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn map_unique(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            match db.constraint() {
                Some(c) if c.contains("username") => {
                    return StoreError::Conflict { field: "username" }
                }
                Some(c) if c.contains("email") => return StoreError::Conflict { field: "email" },
                _ => {}
            }
        }
    }
    StoreError::Database(err)
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn create_user(&self, new: NewUser) -> StoreResult<User> {
        let mut tx = self.db.begin().await?;

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (id, username, email, password_hash, token_identifier)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, username, email, password_hash, is_active,
                      last_login, date_joined, token_identifier
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.username)
        .bind(&new.email)
        .bind(&new.password_hash)
        .bind(Uuid::new_v4())
        .fetch_one(&mut *tx)
        .await
        .map_err(map_unique)?;

        sqlx::query("INSERT INTO users_primary_emails (user_id) VALUES ($1)")
            .bind(user.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO users_profiles (user_id) VALUES ($1)")
            .bind(user.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, is_active,
                   last_login, date_joined, token_identifier
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, is_active,
                   last_login, date_joined, token_identifier
            FROM users
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, is_active,
                   last_login, date_joined, token_identifier
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn rotate_token_identifier(&self, id: Uuid) -> StoreResult<User> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET token_identifier = $2
            WHERE id = $1
            RETURNING id, username, email, password_hash, is_active,
                      last_login, date_joined, token_identifier
            "#,
        )
        .bind(id)
        .bind(Uuid::new_v4())
        .fetch_optional(&self.db)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn deactivate(&self, id: Uuid) -> StoreResult<User> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET is_active = FALSE, token_identifier = $2
            WHERE id = $1
            RETURNING id, username, email, password_hash, is_active,
                      last_login, date_joined, token_identifier
            "#,
        )
        .bind(id)
        .bind(Uuid::new_v4())
        .fetch_optional(&self.db)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn set_password(&self, id: Uuid, password_hash: &str) -> StoreResult<User> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET password_hash = $2, token_identifier = $3
            WHERE id = $1
            RETURNING id, username, email, password_hash, is_active,
                      last_login, date_joined, token_identifier
            "#,
        )
        .bind(id)
        .bind(password_hash)
        .bind(Uuid::new_v4())
        .fetch_optional(&self.db)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn mark_signed_in(&self, id: Uuid, at: OffsetDateTime) -> StoreResult<User> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users SET last_login = $2
            WHERE id = $1
            RETURNING id, username, email, password_hash, is_active,
                      last_login, date_joined, token_identifier
            "#,
        )
        .bind(id)
        .bind(at)
        .fetch_optional(&self.db)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn primary_email(&self, user_id: Uuid) -> StoreResult<PrimaryEmail> {
        sqlx::query_as::<_, PrimaryEmail>(
            r#"
            SELECT user_id, verified, verified_at, updated_at
            FROM users_primary_emails
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn set_email_verified(
        &self,
        user_id: Uuid,
        at: OffsetDateTime,
    ) -> StoreResult<PrimaryEmail> {
        sqlx::query_as::<_, PrimaryEmail>(
            r#"
            UPDATE users_primary_emails
               SET verified = TRUE, verified_at = $2, updated_at = $2
             WHERE user_id = $1
            RETURNING user_id, verified, verified_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(at)
        .fetch_optional(&self.db)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn profile(&self, user_id: Uuid) -> StoreResult<Profile> {
        sqlx::query_as::<_, Profile>(
            r#"
            SELECT user_id, location, bio, updated_at
            FROM users_profiles
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(StoreError::NotFound)
    }

    async fn update_account(&self, id: Uuid, changes: AccountChanges) -> StoreResult<User> {
        let mut tx = self.db.begin().await?;

        if changes.touches_user_row() {
            let rotated = changes.password_hash.as_ref().map(|_| Uuid::new_v4());
            let done = sqlx::query(
                r#"
                UPDATE users
                   SET email = COALESCE($2, email),
                       password_hash = COALESCE($3, password_hash),
                       token_identifier = COALESCE($4, token_identifier)
                 WHERE id = $1
                "#,
            )
            .bind(id)
            .bind(&changes.email)
            .bind(&changes.password_hash)
            .bind(rotated)
            .execute(&mut *tx)
            .await
            .map_err(map_unique)?;
            if done.rows_affected() == 0 {
                return Err(StoreError::NotFound);
            }
        }

        if changes.email.is_some() {
            sqlx::query(
                r#"
                UPDATE users_primary_emails
                   SET verified = FALSE, verified_at = NULL, updated_at = now()
                 WHERE user_id = $1
                "#,
            )
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        if changes.touches_profile() {
            sqlx::query(
                r#"
                UPDATE users_profiles
                   SET location = COALESCE($2, location),
                       bio = COALESCE($3, bio),
                       updated_at = now()
                 WHERE user_id = $1
                "#,
            )
            .bind(id)
            .bind(&changes.location)
            .bind(&changes.bio)
            .execute(&mut *tx)
            .await?;
        }

        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, password_hash, is_active,
                   last_login, date_joined, token_identifier
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound)?;

        tx.commit().await?;
        Ok(user)
    }

    async fn record_activity(&self, new: NewActivity) -> StoreResult<ActivityRecord> {
        let record = sqlx::query_as::<_, ActivityRecord>(
            r#"
            INSERT INTO users_activity (id, user_id, ip_address, user_agent)
            VALUES ($1, $2, $3, $4)
            RETURNING id, user_id, ip_address, user_agent, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(&new.ip_address)
        .bind(&new.user_agent)
        .fetch_one(&self.db)
        .await?;
        Ok(record)
    }

    async fn list_activity(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> StoreResult<(i64, Vec<ActivityRecord>)> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM users_activity WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.db)
                .await?;

        let rows = sqlx::query_as::<_, ActivityRecord>(
            r#"
            SELECT id, user_id, ip_address, user_agent, created_at
            FROM users_activity
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;

        Ok((count, rows))
    }
}
