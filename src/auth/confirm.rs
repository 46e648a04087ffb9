//! Stateless single-use tokens for password reset and email verification.
//!
//! A token is `base64url(timestamp) "-" hex(mac)` where the MAC covers the
//! purpose, a fingerprint of mutable account state, and the timestamp. Any
//! change to the fingerprinted state invalidates every outstanding token of
//! that purpose, which is what makes the tokens single-use.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    state::AppState,
    users::repo_types::{PrimaryEmail, User},
};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    PasswordReset,
    EmailVerification,
}

impl Purpose {
    fn salt(self) -> &'static str {
        match self {
            Purpose::PasswordReset => "accounts.confirm.PasswordReset",
            Purpose::EmailVerification => "accounts.confirm.EmailVerification",
        }
    }

    fn fingerprint(self, user: &User, email: &PrimaryEmail) -> String {
        // Whole seconds, no offset: sub-second precision differs between
        // what was written and what the database hands back.
        let login = user
            .last_login
            .map(|t| t.unix_timestamp().to_string())
            .unwrap_or_default();
        match self {
            Purpose::PasswordReset => format!("{}|{}|{}", user.id, user.password_hash, login),
            Purpose::EmailVerification => {
                format!("{}|{}|{}|{}", user.id, user.email, email.verified, login)
            }
        }
    }
}

#[derive(Clone)]
pub struct ConfirmationTokens {
    purpose: Purpose,
    secret: Vec<u8>,
    max_age_secs: i64,
}

impl ConfirmationTokens {
    pub fn new(purpose: Purpose, secret: &str, max_age_secs: i64) -> Self {
        Self {
            purpose,
            secret: secret.as_bytes().to_vec(),
            max_age_secs,
        }
    }

    pub fn password_reset(state: &AppState) -> Self {
        Self::new(
            Purpose::PasswordReset,
            &state.config.jwt.secret,
            state.config.confirm_token_max_age_secs,
        )
    }

    pub fn email_verification(state: &AppState) -> Self {
        Self::new(
            Purpose::EmailVerification,
            &state.config.jwt.secret,
            state.config.confirm_token_max_age_secs,
        )
    }

    pub fn make(&self, user: &User, email: &PrimaryEmail) -> String {
        self.make_at(user, email, OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn make_at(&self, user: &User, email: &PrimaryEmail, timestamp: i64) -> String {
        let ts = URL_SAFE_NO_PAD.encode(timestamp.to_string());
        let mac = self.mac(user, email, timestamp).finalize().into_bytes();
        format!("{ts}-{}", hex::encode(mac))
    }

    pub fn check(&self, user: &User, email: &PrimaryEmail, token: &str) -> bool {
        self.check_at(user, email, token, OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn check_at(&self, user: &User, email: &PrimaryEmail, token: &str, now: i64) -> bool {
        // The hex digest never contains '-', the base64url timestamp may.
        let Some((ts, digest)) = token.rsplit_once('-') else {
            return false;
        };
        let Some(timestamp) = decode_timestamp(ts) else {
            return false;
        };
        let Ok(digest) = hex::decode(digest) else {
            return false;
        };
        if self.mac(user, email, timestamp).verify_slice(&digest).is_err() {
            return false;
        }
        now - timestamp <= self.max_age_secs
    }

    fn mac(&self, user: &User, email: &PrimaryEmail, timestamp: i64) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts keys of any length");
        mac.update(self.purpose.salt().as_bytes());
        mac.update(b"|");
        mac.update(self.purpose.fingerprint(user, email).as_bytes());
        mac.update(b"|");
        mac.update(timestamp.to_string().as_bytes());
        mac
    }
}

fn decode_timestamp(encoded: &str) -> Option<i64> {
    let raw = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    std::str::from_utf8(&raw).ok()?.parse().ok()
}

/// `uid` carried alongside confirmation tokens in emailed links.
pub fn encode_uid(id: Uuid) -> String {
    URL_SAFE_NO_PAD.encode(id.to_string())
}

pub fn decode_uid(uid: &str) -> Option<Uuid> {
    let raw = URL_SAFE_NO_PAD.decode(uid.trim_end_matches('=')).ok()?;
    Uuid::parse_str(std::str::from_utf8(&raw).ok()?).ok()
}
