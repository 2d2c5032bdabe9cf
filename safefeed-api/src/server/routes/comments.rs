use crate::server::{Result, ServerError, ServerRouter, auth::AuthenticatedUser, json::Json};
use axum::{extract::State, http::StatusCode};
use axum_extra::routing::{RouterExt, TypedPath};
use safefeed_common::model::{
    Id,
    comment::{Comment, CommentContent, CommentMarker, CreateComment},
    post::PostMarker,
};
use safefeed_db::client::DbClient;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

pub fn routes() -> ServerRouter {
    ServerRouter::new()
        .typed_post(create_comment)
        .typed_post(delete_comment)
}

#[derive(Deserialize)]
struct CreateCommentRequest {
    content: CommentContent,
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/posts/{id}/comments", rejection(ServerError))]
struct CreateCommentPath {
    id: Id<PostMarker>,
}

async fn create_comment(
    CreateCommentPath { id: post_id }: CreateCommentPath,
    State(db): State<Arc<DbClient>>,
    user: AuthenticatedUser,
    Json(CreateCommentRequest { content }): Json<CreateCommentRequest>,
) -> Result<(StatusCode, Json<Comment>)> {
    let author = db
        .fetch_user(user.user_id())
        .await?
        .ok_or(ServerError::AuthenticatedUserMissing)?;

    let comment = CreateComment {
        post_id,
        author: author.id,
        content,
    };
    let id = db
        .create_comment(&comment)
        .await?
        .ok_or(ServerError::PostByIdNotFound(post_id))?;
    info!(comment = %id, post = %post_id, user = %author.id, "Comment created");

    Ok((
        StatusCode::CREATED,
        Json(Comment {
            id,
            post_id,
            author,
            content: comment.content,
            created_at: id.created_at(),
        }),
    ))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/comments/{id}/delete", rejection(ServerError))]
struct DeleteCommentPath {
    id: Id<CommentMarker>,
}

async fn delete_comment(
    DeleteCommentPath { id }: DeleteCommentPath,
    State(db): State<Arc<DbClient>>,
    user: AuthenticatedUser,
) -> Result<StatusCode> {
    if !db.delete_comment(id, user.user_id()).await? {
        return Err(ServerError::CommentByIdNotFound(id));
    }
    info!(comment = %id, user = %user.user_id(), "Comment deleted");

    Ok(StatusCode::NO_CONTENT)
}
