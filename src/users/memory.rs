use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::users::repo::{StoreError, StoreResult, UserStore};
use crate::users::repo_types::{
    AccountChanges, ActivityRecord, NewActivity, NewUser, PrimaryEmail, Profile, User,
};

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    emails: HashMap<Uuid, PrimaryEmail>,
    profiles: HashMap<Uuid, Profile>,
    activity: Vec<ActivityRecord>,
}

/// In-process [`UserStore`] with the same uniqueness and atomicity rules as
/// the Postgres store.
#[derive(Default)]
pub struct MemoryUserStore {
    tables: Mutex<Tables>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user_count(&self) -> usize {
        self.tables.lock().unwrap().users.len()
    }

    pub fn primary_email_count(&self) -> usize {
        self.tables.lock().unwrap().emails.len()
    }

    pub fn profile_count(&self) -> usize {
        self.tables.lock().unwrap().profiles.len()
    }

    pub fn activity_count(&self, user_id: Uuid) -> usize {
        self.tables
            .lock()
            .unwrap()
            .activity
            .iter()
            .filter(|a| a.user_id == user_id)
            .count()
    }

    fn update_user<F>(&self, id: Uuid, f: F) -> StoreResult<User>
    where
        F: FnOnce(&mut User),
    {
        let mut tables = self.tables.lock().unwrap();
        let user = tables.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        f(user);
        Ok(user.clone())
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create_user(&self, new: NewUser) -> StoreResult<User> {
        let mut tables = self.tables.lock().unwrap();
        if tables.users.values().any(|u| u.username == new.username) {
            return Err(StoreError::Conflict { field: "username" });
        }
        if tables.users.values().any(|u| u.email == new.email) {
            return Err(StoreError::Conflict { field: "email" });
        }

        let now = OffsetDateTime::now_utc();
        let user = User {
            id: Uuid::new_v4(),
            username: new.username,
            email: new.email,
            password_hash: new.password_hash,
            is_active: true,
            last_login: None,
            date_joined: now,
            token_identifier: Uuid::new_v4(),
        };
        tables.emails.insert(
            user.id,
            PrimaryEmail {
                user_id: user.id,
                verified: false,
                verified_at: None,
                updated_at: now,
            },
        );
        tables.profiles.insert(
            user.id,
            Profile {
                user_id: user.id,
                location: String::new(),
                bio: String::new(),
                updated_at: now,
            },
        );
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.tables.lock().unwrap().users.get(&id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.users.values().find(|u| u.username == username).cloned())
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables.users.values().find(|u| u.email == email).cloned())
    }

    async fn rotate_token_identifier(&self, id: Uuid) -> StoreResult<User> {
        self.update_user(id, |u| u.token_identifier = Uuid::new_v4())
    }

    async fn deactivate(&self, id: Uuid) -> StoreResult<User> {
        self.update_user(id, |u| {
            u.is_active = false;
            u.token_identifier = Uuid::new_v4();
        })
    }

    async fn set_password(&self, id: Uuid, password_hash: &str) -> StoreResult<User> {
        self.update_user(id, |u| {
            u.password_hash = password_hash.to_string();
            u.token_identifier = Uuid::new_v4();
        })
    }

    async fn mark_signed_in(&self, id: Uuid, at: OffsetDateTime) -> StoreResult<User> {
        self.update_user(id, |u| u.last_login = Some(at))
    }

    async fn primary_email(&self, user_id: Uuid) -> StoreResult<PrimaryEmail> {
        let tables = self.tables.lock().unwrap();
        tables.emails.get(&user_id).cloned().ok_or(StoreError::NotFound)
    }

    async fn set_email_verified(
        &self,
        user_id: Uuid,
        at: OffsetDateTime,
    ) -> StoreResult<PrimaryEmail> {
        let mut tables = self.tables.lock().unwrap();
        let email = tables.emails.get_mut(&user_id).ok_or(StoreError::NotFound)?;
        email.verified = true;
        email.verified_at = Some(at);
        email.updated_at = at;
        Ok(email.clone())
    }

    async fn profile(&self, user_id: Uuid) -> StoreResult<Profile> {
        let tables = self.tables.lock().unwrap();
        tables.profiles.get(&user_id).cloned().ok_or(StoreError::NotFound)
    }

    async fn update_account(&self, id: Uuid, changes: AccountChanges) -> StoreResult<User> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.users.contains_key(&id) {
            return Err(StoreError::NotFound);
        }
        if let Some(email) = &changes.email {
            if tables.users.values().any(|u| u.id != id && &u.email == email) {
                return Err(StoreError::Conflict { field: "email" });
            }
        }

        let now = OffsetDateTime::now_utc();
        if let Some(email) = changes.email {
            if let Some(primary) = tables.emails.get_mut(&id) {
                primary.verified = false;
                primary.verified_at = None;
                primary.updated_at = now;
            }
            if let Some(user) = tables.users.get_mut(&id) {
                user.email = email;
            }
        }
        if let Some(hash) = changes.password_hash {
            if let Some(user) = tables.users.get_mut(&id) {
                user.password_hash = hash;
                user.token_identifier = Uuid::new_v4();
            }
        }
        if changes.location.is_some() || changes.bio.is_some() {
            if let Some(profile) = tables.profiles.get_mut(&id) {
                if let Some(location) = changes.location {
                    profile.location = location;
                }
                if let Some(bio) = changes.bio {
                    profile.bio = bio;
                }
                profile.updated_at = now;
            }
        }

        tables.users.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn record_activity(&self, new: NewActivity) -> StoreResult<ActivityRecord> {
        let record = ActivityRecord {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            ip_address: new.ip_address,
            user_agent: new.user_agent,
            created_at: OffsetDateTime::now_utc(),
        };
        self.tables.lock().unwrap().activity.push(record.clone());
        Ok(record)
    }

    async fn list_activity(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> StoreResult<(i64, Vec<ActivityRecord>)> {
        let tables = self.tables.lock().unwrap();
        // Appended in time order, so reversing yields newest first.
        let mine: Vec<_> = tables
            .activity
            .iter()
            .rev()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        let count = mine.len() as i64;
        let page = mine
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((count, page))
    }
}
