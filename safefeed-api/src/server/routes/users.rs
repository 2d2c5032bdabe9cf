use crate::server::{Result, ServerError, ServerRouter, auth::AuthenticatedUser, json::Json};
use axum::extract::{Query, State};
use axum_extra::{
    extract::WithRejection,
    routing::{RouterExt, TypedPath},
};
use safefeed_common::model::{
    post::FeedPost,
    user::{User, UserHandle},
};
use safefeed_db::client::DbClient;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub fn routes() -> ServerRouter {
    ServerRouter::new()
        .typed_get(search_users)
        .typed_get(get_profile)
        .typed_post(change_handle)
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/users/search", rejection(ServerError))]
struct SearchUsersPath();

async fn search_users(
    SearchUsersPath(): SearchUsersPath,
    State(db): State<Arc<DbClient>>,
    WithRejection(Query(SearchQuery { q }), _): WithRejection<Query<SearchQuery>, ServerError>,
) -> Result<Json<Vec<User>>> {
    let users = db.search_users(q.trim()).await?;

    Ok(Json(users))
}

#[derive(Serialize)]
struct Profile {
    user: User,
    posts: Vec<FeedPost>,
    /// Only present for authenticated viewers.
    #[serde(skip_serializing_if = "Option::is_none")]
    liked_posts: Option<Vec<FeedPost>>,
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/users/{handle}", rejection(ServerError))]
struct ProfilePath {
    handle: UserHandle,
}

async fn get_profile(
    ProfilePath { handle }: ProfilePath,
    State(db): State<Arc<DbClient>>,
    viewer: Option<AuthenticatedUser>,
) -> Result<Json<Profile>> {
    let user = db
        .fetch_user_by_handle(&handle)
        .await?
        .ok_or(ServerError::UserByHandleNotFound(handle))?;

    let posts = db.fetch_user_posts(user.id).await?;
    let liked_posts = match viewer {
        Some(_) => Some(db.fetch_liked_posts(user.id).await?),
        None => None,
    };

    Ok(Json(Profile {
        user,
        posts,
        liked_posts,
    }))
}

#[derive(Deserialize)]
struct ChangeHandleRequest {
    handle: UserHandle,
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/users/me/username", rejection(ServerError))]
struct ChangeHandlePath();

async fn change_handle(
    ChangeHandlePath(): ChangeHandlePath,
    State(db): State<Arc<DbClient>>,
    user: AuthenticatedUser,
    Json(ChangeHandleRequest { handle }): Json<ChangeHandleRequest>,
) -> Result<Json<User>> {
    let id = user.user_id();
    if !db.update_handle(id, &handle).await? {
        return Err(ServerError::AuthenticatedUserMissing);
    }
    info!(user = %id, %handle, "Handle changed");

    Ok(Json(User { id, handle }))
}
