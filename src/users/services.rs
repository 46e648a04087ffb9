//! Account lifecycle: everything the HTTP handlers do beyond extracting
//! input and shaping output.

use axum::extract::FromRef;
use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::{
    auth::{
        confirm::{decode_uid, encode_uid, ConfirmationTokens},
        jwt::JwtKeys,
        password::{hash_password_blocking, verify_password_blocking},
        policy,
    },
    error::{ApiError, ApiResult, FieldErrors},
    mailer,
    state::AppState,
    users::{
        activity::{self, ClientMeta},
        dto::{
            AccountView, ActivityPage, Pagination, PublicProfile, PublicProfileBody,
            ResetPasswordConfirmRequest, SignInRequest, SignUpRequest, UpdateMeRequest,
            VerifyEmailConfirmRequest,
        },
        repo::StoreError,
        repo_types::{AccountChanges, NewUser, User},
    },
};

const BLANK: &str = "This field may not be blank.";
const INVALID_EMAIL: &str = "Enter a valid email address.";
const MAX_LOCATION_LEN: usize = 255;
const MAX_BIO_LEN: usize = 2500;

fn push(errors: &mut FieldErrors, field: &str, message: impl Into<String>) {
    errors
        .entry(field.to_string())
        .or_default()
        .push(message.into());
}

fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn check_email(errors: &mut FieldErrors, field: &str, email: &str) {
    if email.is_empty() {
        push(errors, field, BLANK);
    } else if !policy::is_valid_email(email) {
        push(errors, field, INVALID_EMAIL);
    }
}

fn check_max_len(errors: &mut FieldErrors, field: &str, value: &str, max: usize) {
    if value.chars().count() > max {
        push(
            errors,
            field,
            format!("Ensure this field has no more than {max} characters."),
        );
    }
}

fn ensure_valid(errors: FieldErrors) -> ApiResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(ApiError::Validation(errors))
    }
}

pub async fn sign_up(state: &AppState, req: SignUpRequest) -> ApiResult<User> {
    let username = req.username.trim().to_string();
    let email = normalize_email(&req.email);
    let mut errors = FieldErrors::new();

    if let Err(msg) = policy::validate_username(&username) {
        push(&mut errors, "username", msg);
    } else if state.store.find_by_username(&username).await?.is_some() {
        push(&mut errors, "username", "A user with that username already exists.");
    }

    check_email(&mut errors, "email", &email);
    if !errors.contains_key("email") && state.store.find_by_email(&email).await?.is_some() {
        push(&mut errors, "email", "A user with that email already exists.");
    }

    if req.password.is_empty() {
        push(&mut errors, "password", BLANK);
    } else {
        for msg in policy::validate_password(&req.password, &username, &email) {
            push(&mut errors, "password", msg);
        }
    }
    ensure_valid(errors)?;

    let password_hash = hash_password_blocking(req.password).await?;
    let user = state
        .store
        .create_user(NewUser {
            username,
            email,
            password_hash,
        })
        .await?;

    info!(user_id = %user.id, username = %user.username, "user signed up");
    Ok(user)
}

/// Returns a fresh bearer token. Unknown usernames, wrong passwords and
/// deactivated accounts all fail the same way.
pub async fn sign_in(state: &AppState, req: SignInRequest, meta: &ClientMeta) -> ApiResult<String> {
    let username = req.username.trim();
    let mut errors = FieldErrors::new();
    if username.is_empty() {
        push(&mut errors, "username", BLANK);
    }
    if req.password.is_empty() {
        push(&mut errors, "password", BLANK);
    }
    ensure_valid(errors)?;

    let Some(user) = state.store.find_by_username(username).await? else {
        warn!(username = %username, "sign in unknown username");
        return Err(ApiError::InvalidCredentials);
    };

    if !verify_password_blocking(req.password, user.password_hash.clone()).await? {
        warn!(user_id = %user.id, "sign in invalid password");
        return Err(ApiError::InvalidCredentials);
    }
    if !user.is_active {
        warn!(user_id = %user.id, "sign in to deactivated account");
        return Err(ApiError::InvalidCredentials);
    }

    let user = state
        .store
        .mark_signed_in(user.id, OffsetDateTime::now_utc())
        .await?;
    activity::record(state.store.as_ref(), &user, meta).await;

    let token = JwtKeys::from_ref(state).issue(&user)?;
    info!(user_id = %user.id, "user signed in");
    Ok(token)
}

pub async fn sign_out(state: &AppState, user: &User) -> ApiResult<()> {
    state.store.rotate_token_identifier(user.id).await?;
    info!(user_id = %user.id, "user signed out");
    Ok(())
}

/// Rotates the token identifier and issues a token from the rotated row, so
/// the presented token stops working.
pub async fn refresh_token(state: &AppState, user: &User) -> ApiResult<String> {
    let user = state.store.rotate_token_identifier(user.id).await?;
    let token = JwtKeys::from_ref(state).issue(&user)?;
    info!(user_id = %user.id, "token refreshed");
    Ok(token)
}

pub async fn deactivate(state: &AppState, user: &User) -> ApiResult<()> {
    state.store.deactivate(user.id).await?;
    info!(user_id = %user.id, "user deactivated");
    Ok(())
}

pub async fn account(state: &AppState, user: User) -> ApiResult<AccountView> {
    let email = state.store.primary_email(user.id).await?;
    let profile = state.store.profile(user.id).await?;
    Ok(AccountView::new(user, email, profile))
}

pub async fn update_account(
    state: &AppState,
    user: User,
    req: UpdateMeRequest,
) -> ApiResult<AccountView> {
    let mut errors = FieldErrors::new();
    let mut changes = AccountChanges::default();

    if let Some(raw) = req.email.as_deref() {
        let email = normalize_email(raw);
        check_email(&mut errors, "email", &email);
        if !errors.contains_key("email") && email != user.email {
            match state.store.find_by_email(&email).await? {
                Some(other) if other.id != user.id => {
                    push(&mut errors, "email", "A user with that email already exists.");
                }
                _ => changes.email = Some(email),
            }
        }
    }
    if let Some(location) = req.location {
        check_max_len(&mut errors, "location", &location, MAX_LOCATION_LEN);
        changes.location = Some(location);
    }
    if let Some(bio) = req.bio {
        check_max_len(&mut errors, "bio", &bio, MAX_BIO_LEN);
        changes.bio = Some(bio);
    }
    if let Some(password) = req.password.as_deref() {
        let email = changes.email.as_deref().unwrap_or(&user.email);
        if password.is_empty() {
            push(&mut errors, "password", BLANK);
        }
        for msg in policy::validate_password(password, &user.username, email) {
            push(&mut errors, "password", msg);
        }
    }
    ensure_valid(errors)?;

    if let Some(password) = req.password {
        changes.password_hash = Some(hash_password_blocking(password).await?);
    }

    if !changes.touches_user_row() && !changes.touches_profile() {
        return account(state, user).await;
    }

    let password_changed = changes.password_hash.is_some();
    let user = state.store.update_account(user.id, changes).await?;
    info!(user_id = %user.id, password_changed, "account updated");
    account(state, user).await
}

pub async fn activity(state: &AppState, user: &User, page: Pagination) -> ApiResult<ActivityPage> {
    let (limit, offset) = page.clamped();
    let (count, rows) = state.store.list_activity(user.id, limit, offset).await?;
    Ok(ActivityPage {
        count,
        limit,
        offset,
        results: rows.into_iter().map(Into::into).collect(),
    })
}

pub async fn public_profile(state: &AppState, username: &str) -> ApiResult<PublicProfile> {
    let user = state
        .store
        .find_by_username(username)
        .await?
        .filter(|u| u.is_active)
        .ok_or(ApiError::NotFound("Not found."))?;
    let profile = state.store.profile(user.id).await?;
    Ok(PublicProfile {
        username: user.username,
        date_joined: user.date_joined,
        profile: PublicProfileBody {
            location: profile.location,
            bio: profile.bio,
        },
    })
}

/// Emails a reset link. Unknown addresses answer 404.
pub async fn request_password_reset(state: &AppState, raw_email: &str) -> ApiResult<()> {
    let email = normalize_email(raw_email);
    let mut errors = FieldErrors::new();
    check_email(&mut errors, "email", &email);
    ensure_valid(errors)?;

    let user = state
        .store
        .find_by_email(&email)
        .await?
        .filter(|u| u.is_active)
        .ok_or(ApiError::NotFound("Not found."))?;
    let primary = state.store.primary_email(user.id).await?;

    let token = ConfirmationTokens::password_reset(state).make(&user, &primary);
    let message = mailer::password_reset_email(
        &state.config.site,
        &user.username,
        &user.email,
        &encode_uid(user.id),
        &token,
    );
    state.mailer.send(message).await?;

    info!(user_id = %user.id, "password reset requested");
    Ok(())
}

/// Resolves `uid` and checks `token` with the given generator, collapsing
/// every failure into [`ApiError::InvalidToken`].
async fn confirmed_user(
    state: &AppState,
    tokens: &ConfirmationTokens,
    uid: &str,
    token: &str,
) -> ApiResult<User> {
    let user = match decode_uid(uid) {
        Some(id) => state.store.find_by_id(id).await?,
        None => None,
    };
    let Some(user) = user else {
        return Err(ApiError::InvalidToken);
    };
    let primary = match state.store.primary_email(user.id).await {
        Ok(p) => p,
        Err(StoreError::NotFound) => return Err(ApiError::InvalidToken),
        Err(e) => return Err(e.into()),
    };
    if !tokens.check(&user, &primary, token) {
        warn!(user_id = %user.id, "confirmation token rejected");
        return Err(ApiError::InvalidToken);
    }
    Ok(user)
}

pub async fn confirm_password_reset(
    state: &AppState,
    req: ResetPasswordConfirmRequest,
) -> ApiResult<()> {
    let tokens = ConfirmationTokens::password_reset(state);
    let user = confirmed_user(state, &tokens, &req.uid, &req.token).await?;

    let mut errors = FieldErrors::new();
    if req.new_password.is_empty() {
        push(&mut errors, "new_password", BLANK);
    }
    for msg in policy::validate_password(&req.new_password, &user.username, &user.email) {
        push(&mut errors, "new_password", msg);
    }
    ensure_valid(errors)?;

    let hash = hash_password_blocking(req.new_password).await?;
    let user = state.store.set_password(user.id, &hash).await?;
    info!(user_id = %user.id, "password reset");

    // The password is already changed; a lost notice does not undo that.
    let notice = mailer::password_changed_email(&state.config.site, &user.username, &user.email);
    if let Err(e) = state.mailer.send(notice).await {
        error!(error = %e, user_id = %user.id, "failed to send password changed email");
    }
    Ok(())
}

pub async fn request_email_verification(state: &AppState, user: &User) -> ApiResult<()> {
    let primary = state.store.primary_email(user.id).await?;
    if primary.verified {
        return Err(ApiError::AlreadyVerified);
    }

    let token = ConfirmationTokens::email_verification(state).make(user, &primary);
    let message = mailer::email_verification_email(
        &state.config.site,
        &user.username,
        &user.email,
        &encode_uid(user.id),
        &token,
    );
    state.mailer.send(message).await?;

    info!(user_id = %user.id, "email verification requested");
    Ok(())
}

pub async fn confirm_email_verification(
    state: &AppState,
    req: VerifyEmailConfirmRequest,
) -> ApiResult<()> {
    let tokens = ConfirmationTokens::email_verification(state);
    let user = confirmed_user(state, &tokens, &req.uid, &req.token).await?;
    state
        .store
        .set_email_verified(user.id, OffsetDateTime::now_utc())
        .await?;
    info!(user_id = %user.id, "email verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        mailer::fake::{link_params, FailingMailer, RecordingMailer},
        users::{memory::MemoryUserStore, repo::UserStore},
    };

    struct Harness {
        state: AppState,
        store: Arc<MemoryUserStore>,
        mail: Arc<RecordingMailer>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryUserStore::new());
        let mail = Arc::new(RecordingMailer::default());
        let state = AppState::fake_with(store.clone(), mail.clone(), "1000/hour");
        Harness { state, store, mail }
    }

    fn signup(username: &str, email: &str, password: &str) -> SignUpRequest {
        SignUpRequest {
            username: username.into(),
            email: email.into(),
            password: password.into(),
        }
    }

    async fn alice(h: &Harness) -> User {
        sign_up(&h.state, signup("alice", "alice@x.com", "Str0ngPass!23"))
            .await
            .unwrap()
    }

    fn field_errors(err: ApiError) -> FieldErrors {
        match err {
            ApiError::Validation(errors) => errors,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sign_up_creates_user_email_and_profile() {
        let h = harness();
        let user = sign_up(&h.state, signup("alice", "  Alice@X.com ", "Str0ngPass!23"))
            .await
            .unwrap();
        assert_eq!(user.email, "alice@x.com");
        assert!(user.is_active);
        assert!(user.password_hash.starts_with("$argon2"));
        assert!(!h.store.primary_email(user.id).await.unwrap().verified);
        assert_eq!(h.store.profile(user.id).await.unwrap().bio, "");
    }

    #[tokio::test]
    async fn duplicate_username_leaves_no_extra_rows() {
        let h = harness();
        alice(&h).await;
        let err = sign_up(&h.state, signup("alice", "other@x.com", "Str0ngPass!23"))
            .await
            .unwrap_err();
        assert!(field_errors(err).contains_key("username"));
        assert_eq!(h.store.user_count(), 1);
        assert_eq!(h.store.primary_email_count(), 1);
        assert_eq!(h.store.profile_count(), 1);
    }

    #[tokio::test]
    async fn weak_password_reports_every_failure() {
        let h = harness();
        let err = sign_up(&h.state, signup("bob", "bob@x.com", "1234"))
            .await
            .unwrap_err();
        let errors = field_errors(err);
        let password = &errors["password"];
        assert!(password.iter().any(|m| m.contains("too short")));
        assert!(password.iter().any(|m| m.contains("too common")));
        assert!(password.iter().any(|m| m.contains("entirely numeric")));
        assert_eq!(h.store.user_count(), 0);
    }

    #[tokio::test]
    async fn sign_up_rejects_bad_username_and_email_together() {
        let h = harness();
        let err = sign_up(&h.state, signup("no spaces", "not-an-email", "Str0ngPass!23"))
            .await
            .unwrap_err();
        let errors = field_errors(err);
        assert!(errors.contains_key("username"));
        assert_eq!(errors["email"], vec![INVALID_EMAIL.to_string()]);
    }

    #[tokio::test]
    async fn sign_in_records_activity_and_last_login() {
        let h = harness();
        let user = alice(&h).await;
        let meta = ClientMeta {
            ip: Some("203.0.113.7".into()),
            user_agent: Some("test".into()),
        };
        let req = SignInRequest {
            username: "alice".into(),
            password: "Str0ngPass!23".into(),
        };
        let token = sign_in(&h.state, req, &meta).await.unwrap();

        let resolved = JwtKeys::from_ref(&h.state)
            .verify(h.store.as_ref(), &token)
            .await
            .unwrap();
        assert_eq!(resolved.id, user.id);
        assert!(resolved.last_login.is_some());
        assert_eq!(h.store.activity_count(user.id), 1);
    }

    #[tokio::test]
    async fn wrong_password_and_inactive_are_invalid_credentials() {
        let h = harness();
        let user = alice(&h).await;
        let wrong = SignInRequest {
            username: "alice".into(),
            password: "nope-nope-nope".into(),
        };
        let err = sign_in(&h.state, wrong, &ClientMeta::default()).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidCredentials));
        assert_eq!(h.store.activity_count(user.id), 0);

        deactivate(&h.state, &user).await.unwrap();
        let right = SignInRequest {
            username: "alice".into(),
            password: "Str0ngPass!23".into(),
        };
        let err = sign_in(&h.state, right, &ClientMeta::default()).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidCredentials));
    }

    #[tokio::test]
    async fn refresh_invalidates_previous_token() {
        let h = harness();
        let user = alice(&h).await;
        let keys = JwtKeys::from_ref(&h.state);
        let old = keys.issue(&user).unwrap();

        let new = refresh_token(&h.state, &user).await.unwrap();
        assert!(keys.verify(h.store.as_ref(), &old).await.is_err());
        assert!(keys.verify(h.store.as_ref(), &new).await.is_ok());
    }

    #[tokio::test]
    async fn update_email_resets_verification() {
        let h = harness();
        let user = alice(&h).await;
        h.store
            .set_email_verified(user.id, OffsetDateTime::now_utc())
            .await
            .unwrap();

        let req = UpdateMeRequest {
            email: Some("alice@new.example".into()),
            bio: Some("hello".into()),
            ..Default::default()
        };
        let view = update_account(&h.state, user, req).await.unwrap();
        assert_eq!(view.email, "alice@new.example");
        assert!(!view.email_verified);
        assert_eq!(view.profile.bio, "hello");
    }

    #[tokio::test]
    async fn update_rejects_taken_email_and_long_location() {
        let h = harness();
        let user = alice(&h).await;
        sign_up(&h.state, signup("bob", "bob@x.com", "Str0ngPass!23"))
            .await
            .unwrap();

        let req = UpdateMeRequest {
            email: Some("BOB@x.com".into()),
            location: Some("x".repeat(300)),
            ..Default::default()
        };
        let errors = field_errors(update_account(&h.state, user, req).await.unwrap_err());
        assert!(errors.contains_key("email"));
        assert!(errors.contains_key("location"));
    }

    #[tokio::test]
    async fn password_change_revokes_tokens() {
        let h = harness();
        let user = alice(&h).await;
        let keys = JwtKeys::from_ref(&h.state);
        let token = keys.issue(&user).unwrap();

        let req = UpdateMeRequest {
            password: Some("An0ther-Secret".into()),
            ..Default::default()
        };
        update_account(&h.state, user, req).await.unwrap();
        assert!(keys.verify(h.store.as_ref(), &token).await.is_err());
    }

    #[tokio::test]
    async fn activity_is_paginated_newest_first() {
        let h = harness();
        let user = alice(&h).await;
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            let meta = ClientMeta {
                ip: Some(ip.into()),
                user_agent: None,
            };
            activity::record(h.store.as_ref(), &user, &meta).await;
        }
        let page = activity(&h.state, &user, Pagination { limit: 2, offset: 0 })
            .await
            .unwrap();
        assert_eq!(page.count, 3);
        assert_eq!(page.results.len(), 2);
        assert_eq!(page.results[0].ip_address.as_deref(), Some("10.0.0.3"));
    }

    #[tokio::test]
    async fn public_profile_hides_deactivated_users() {
        let h = harness();
        let user = alice(&h).await;
        assert_eq!(public_profile(&h.state, "alice").await.unwrap().username, "alice");
        deactivate(&h.state, &user).await.unwrap();
        assert!(matches!(
            public_profile(&h.state, "alice").await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn password_reset_round_trip_is_single_use() {
        let h = harness();
        alice(&h).await;
        request_password_reset(&h.state, "alice@x.com").await.unwrap();
        let (uid, token) = link_params(&h.mail.last().unwrap().body).unwrap();

        let confirm = |password: &str| ResetPasswordConfirmRequest {
            uid: uid.clone(),
            token: token.clone(),
            new_password: password.into(),
        };
        confirm_password_reset(&h.state, confirm("N3w-Passphrase")).await.unwrap();
        assert!(h.mail.last().unwrap().subject.contains("password was changed"));

        let err = confirm_password_reset(&h.state, confirm("Y3t-Another-One"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InvalidToken));
    }

    #[tokio::test]
    async fn password_reset_checks_token_before_policy() {
        let h = harness();
        let user = alice(&h).await;
        let bad = ResetPasswordConfirmRequest {
            uid: encode_uid(user.id),
            token: "garbage".into(),
            new_password: "1".into(),
        };
        assert!(matches!(
            confirm_password_reset(&h.state, bad).await,
            Err(ApiError::InvalidToken)
        ));

        request_password_reset(&h.state, "alice@x.com").await.unwrap();
        let (uid, token) = link_params(&h.mail.last().unwrap().body).unwrap();
        let weak = ResetPasswordConfirmRequest {
            uid,
            token,
            new_password: "1".into(),
        };
        let errors = field_errors(confirm_password_reset(&h.state, weak).await.unwrap_err());
        assert!(errors.contains_key("new_password"));
    }

    #[tokio::test]
    async fn reset_for_unknown_email_is_not_found() {
        let h = harness();
        assert!(matches!(
            request_password_reset(&h.state, "ghost@x.com").await,
            Err(ApiError::NotFound(_))
        ));
        assert_eq!(h.mail.count(), 0);
    }

    #[tokio::test]
    async fn mail_failure_fails_the_request() {
        let store = Arc::new(MemoryUserStore::new());
        let state = AppState::fake_with(store, Arc::new(FailingMailer), "1000/hour");
        sign_up(&state, signup("alice", "alice@x.com", "Str0ngPass!23"))
            .await
            .unwrap();
        assert!(matches!(
            request_password_reset(&state, "alice@x.com").await,
            Err(ApiError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn verification_link_dies_with_email_change() {
        let h = harness();
        let user = alice(&h).await;
        request_email_verification(&h.state, &user).await.unwrap();
        let (uid, token) = link_params(&h.mail.last().unwrap().body).unwrap();

        let req = UpdateMeRequest {
            email: Some("victim@bank.test".into()),
            ..Default::default()
        };
        update_account(&h.state, user.clone(), req).await.unwrap();

        let confirm = VerifyEmailConfirmRequest { uid, token };
        assert!(matches!(
            confirm_email_verification(&h.state, confirm).await,
            Err(ApiError::InvalidToken)
        ));
        assert!(!h.store.primary_email(user.id).await.unwrap().verified);
    }

    #[tokio::test]
    async fn email_verification_flow() {
        let h = harness();
        let user = alice(&h).await;
        request_email_verification(&h.state, &user).await.unwrap();
        let (uid, token) = link_params(&h.mail.last().unwrap().body).unwrap();

        let req = || VerifyEmailConfirmRequest {
            uid: uid.clone(),
            token: token.clone(),
        };
        confirm_email_verification(&h.state, req()).await.unwrap();
        let primary = h.store.primary_email(user.id).await.unwrap();
        assert!(primary.verified);
        assert!(primary.verified_at.is_some());

        // The verified flag is fingerprinted, so the token is now spent.
        assert!(matches!(
            confirm_email_verification(&h.state, req()).await,
            Err(ApiError::InvalidToken)
        ));
        assert!(matches!(
            request_email_verification(&h.state, &user).await,
            Err(ApiError::AlreadyVerified)
        ));
    }
}
