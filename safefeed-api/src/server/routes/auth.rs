use crate::server::{
    AuthConfig, Result, ServerError, ServerRouter, auth::AuthenticatedUser, json::Json,
};
use axum::{extract::State, http::StatusCode};
use axum_extra::routing::{RouterExt, TypedPath};
use safefeed_common::model::{
    Id,
    auth::{AuthToken, Authentication, Password, PasswordHash},
    user::{CreateUser, User, UserHandle, UserMarker},
};
use safefeed_db::client::DbClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task;
use tracing::info;

pub fn routes() -> ServerRouter {
    ServerRouter::new()
        .typed_post(signup)
        .typed_post(login)
        .typed_post(logout)
}

#[derive(Deserialize)]
struct SignupRequest {
    handle: UserHandle,
    password: Password,
}

#[derive(Deserialize)]
struct LoginRequest {
    handle: String,
    password: String,
}

#[derive(Serialize)]
struct SessionResponse {
    user: User,
    token: String,
}

/// Stores a fresh token for `user_id` and returns its string form.
async fn issue_token(
    db: &DbClient,
    auth_config: AuthConfig,
    user_id: Id<UserMarker>,
) -> Result<String> {
    let token = AuthToken::generate_random(user_id);
    let authentication = Authentication {
        user: user_id,
        token_hash: token.hash()?,
        created_at: OffsetDateTime::now_utc(),
        expires_after: auth_config.token_lifetime,
    };
    db.create_auth(&authentication).await?;

    Ok(token.as_token_str())
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/auth/signup", rejection(ServerError))]
struct SignupPath();

async fn signup(
    SignupPath(): SignupPath,
    State(db): State<Arc<DbClient>>,
    State(auth_config): State<AuthConfig>,
    Json(SignupRequest { handle, password }): Json<SignupRequest>,
) -> Result<(StatusCode, Json<SessionResponse>)> {
    let password_hash = task::spawn_blocking(move || PasswordHash::generate(&password)).await??;

    let user = CreateUser {
        handle: handle.clone(),
        password_hash,
    };
    let id = db.create_user(&user).await?;
    info!(user = %id, %handle, "User signed up");

    let token = issue_token(&db, auth_config, id).await?;

    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            user: User { id, handle },
            token,
        }),
    ))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/auth/login", rejection(ServerError))]
struct LoginPath();

async fn login(
    LoginPath(): LoginPath,
    State(db): State<Arc<DbClient>>,
    State(auth_config): State<AuthConfig>,
    Json(LoginRequest { handle, password }): Json<LoginRequest>,
) -> Result<Json<SessionResponse>> {
    let handle = UserHandle::new(handle).map_err(|_| ServerError::InvalidCredentials)?;
    let password = Password::new(password).map_err(|_| ServerError::InvalidCredentials)?;

    let (user, password_hash) = db
        .fetch_credentials(&handle)
        .await?
        .ok_or(ServerError::InvalidCredentials)?;

    let verified = task::spawn_blocking(move || password_hash.verify(&password)).await??;
    if !verified {
        return Err(ServerError::InvalidCredentials);
    }

    let token = issue_token(&db, auth_config, user.id).await?;
    info!(user = %user.id, "User logged in");

    Ok(Json(SessionResponse { user, token }))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/auth/logout", rejection(ServerError))]
struct LogoutPath();

async fn logout(
    LogoutPath(): LogoutPath,
    State(db): State<Arc<DbClient>>,
    user: AuthenticatedUser,
) -> Result<StatusCode> {
    db.delete_auth(user.token_hash()).await?;
    info!(user = %user.user_id(), "User logged out");

    Ok(StatusCode::NO_CONTENT)
}
