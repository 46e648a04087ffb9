use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::instrument;

use crate::{
    auth::extractors::AuthUser,
    error::{ApiJson, ApiQuery, ApiResult},
    state::AppState,
    throttle::{ResetPassword, SignIn, SignUp, Throttle, VerifyEmail},
    users::{
        activity::ClientMeta,
        dto::{
            AccountView, ActivityPage, Pagination, PublicProfile, ResetPasswordConfirmRequest,
            ResetPasswordRequest, SignInRequest, SignUpRequest, SignUpResponse, TokenResponse,
            UpdateMeRequest, VerifyEmailConfirmRequest,
        },
        services,
    },
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/users/", post(sign_up))
        .route("/users/signin/", post(sign_in))
        .route("/users/signout/", post(sign_out))
        .route("/users/verify-token/", post(verify_token))
        .route("/users/refresh-token/", post(refresh_token))
}

pub fn account_routes() -> Router<AppState> {
    Router::new()
        .route("/users/me/", get(get_me).patch(update_me).delete(delete_me))
        .route("/users/me/activity/", get(list_activity))
        .route("/users/:username/", get(public_profile))
}

pub fn confirmation_routes() -> Router<AppState> {
    Router::new()
        .route("/users/reset-password/", post(reset_password))
        .route("/users/reset-password/confirm/", post(reset_password_confirm))
        .route("/users/verify-email/", post(verify_email))
        .route("/users/verify-email/confirm/", post(verify_email_confirm))
}

/// Body of endpoints that only report success.
type Done = Json<Option<()>>;

fn done() -> Done {
    Json(None)
}

#[instrument(skip_all)]
pub async fn sign_up(
    _throttle: Throttle<SignUp>,
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<SignUpRequest>,
) -> ApiResult<(StatusCode, Json<SignUpResponse>)> {
    let user = services::sign_up(&state, payload).await?;
    Ok((
        StatusCode::CREATED,
        Json(SignUpResponse {
            id: user.id,
            username: user.username,
            email: user.email,
        }),
    ))
}

#[instrument(skip_all)]
pub async fn sign_in(
    _throttle: Throttle<SignIn>,
    State(state): State<AppState>,
    meta: ClientMeta,
    ApiJson(payload): ApiJson<SignInRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let token = services::sign_in(&state, payload, &meta).await?;
    Ok(Json(TokenResponse { token }))
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn sign_out(State(state): State<AppState>, AuthUser(user): AuthUser) -> ApiResult<Done> {
    services::sign_out(&state, &user).await?;
    Ok(done())
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn verify_token(AuthUser(user): AuthUser) -> Done {
    done()
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn refresh_token(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<TokenResponse>> {
    let token = services::refresh_token(&state, &user).await?;
    Ok(Json(TokenResponse { token }))
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<AccountView>> {
    Ok(Json(services::account(&state, user).await?))
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn update_me(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiJson(payload): ApiJson<UpdateMeRequest>,
) -> ApiResult<Json<AccountView>> {
    Ok(Json(services::update_account(&state, user, payload).await?))
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn delete_me(State(state): State<AppState>, AuthUser(user): AuthUser) -> ApiResult<Done> {
    services::deactivate(&state, &user).await?;
    Ok(done())
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn list_activity(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ApiQuery(page): ApiQuery<Pagination>,
) -> ApiResult<Json<ActivityPage>> {
    Ok(Json(services::activity(&state, &user, page).await?))
}

#[instrument(skip(state))]
pub async fn public_profile(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> ApiResult<Json<PublicProfile>> {
    Ok(Json(services::public_profile(&state, &username).await?))
}

#[instrument(skip_all)]
pub async fn reset_password(
    _throttle: Throttle<ResetPassword>,
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<ResetPasswordRequest>,
) -> ApiResult<Done> {
    services::request_password_reset(&state, &payload.email).await?;
    Ok(done())
}

#[instrument(skip(state, payload))]
pub async fn reset_password_confirm(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<ResetPasswordConfirmRequest>,
) -> ApiResult<Done> {
    services::confirm_password_reset(&state, payload).await?;
    Ok(done())
}

// AuthUser runs first so the throttle can key on the user.
#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn verify_email(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    _throttle: Throttle<VerifyEmail>,
) -> ApiResult<Done> {
    services::request_email_verification(&state, &user).await?;
    Ok(done())
}

#[instrument(skip(state, payload))]
pub async fn verify_email_confirm(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<VerifyEmailConfirmRequest>,
) -> ApiResult<Done> {
    services::confirm_email_verification(&state, payload).await?;
    Ok(done())
}
