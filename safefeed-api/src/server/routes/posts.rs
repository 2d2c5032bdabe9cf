use crate::server::{
    Result, ServerError, ServerRouter,
    auth::AuthenticatedUser,
    json::Json,
    submission::{PostSubmission, SubmissionOutcome, submit_post},
};
use axum::{
    extract::{Multipart, State},
    http::{
        StatusCode,
        header::{CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS},
    },
    response::IntoResponse,
};
use axum_extra::{
    extract::WithRejection,
    routing::{RouterExt, TypedPath},
};
use safefeed_classifier::{ImageClassifier, sniff_mime_type};
use safefeed_common::model::{
    Id,
    post::{FeedPost, PostContent, PostImage, PostMarker},
};
use safefeed_db::client::DbClient;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

pub fn routes() -> ServerRouter {
    ServerRouter::new()
        .typed_get(get_feed)
        .typed_post(create_post)
        .typed_get(get_post)
        .typed_get(get_post_image)
        .typed_post(delete_post)
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/feed", rejection(ServerError))]
struct FeedPath();

async fn get_feed(
    FeedPath(): FeedPath,
    State(db): State<Arc<DbClient>>,
) -> Result<Json<Vec<FeedPost>>> {
    let feed = db.fetch_feed().await?;

    Ok(Json(feed))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/posts/create", rejection(ServerError))]
struct CreatePostPath();

/// Reads the `content` and `image` fields. Unknown fields are skipped.
async fn read_submission(multipart: &mut Multipart) -> Result<PostSubmission> {
    let mut content = String::new();
    let mut image = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(ToOwned::to_owned);
        match name.as_deref() {
            Some("content") => content = field.text().await?.trim().to_owned(),
            // The declared content type is ignored, only the bytes decide what gets served.
            Some("image") => {
                let bytes = field.bytes().await?;
                let content_type = sniff_mime_type(&bytes).map(ToOwned::to_owned);
                image = Some(PostImage::new(content_type, bytes.to_vec()));
            }
            _ => {}
        }
    }

    let content = PostContent::new(content)?;

    Ok(PostSubmission { content, image })
}

async fn create_post(
    CreatePostPath(): CreatePostPath,
    State(db): State<Arc<DbClient>>,
    State(classifier): State<Arc<ImageClassifier>>,
    user: AuthenticatedUser,
    WithRejection(mut multipart, _): WithRejection<Multipart, ServerError>,
) -> Result<(StatusCode, Json<FeedPost>)> {
    let submission = read_submission(&mut multipart).await?;

    match submit_post(&db, &classifier, user.user_id(), submission).await? {
        SubmissionOutcome::Persisted(id) => {
            let post = db
                .fetch_post(id)
                .await?
                .ok_or(ServerError::PostByIdNotFound(id))?;
            Ok((StatusCode::CREATED, Json(post)))
        }
        SubmissionOutcome::Rejected(reason) => Err(ServerError::PostRejected(reason)),
    }
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/posts/{id}", rejection(ServerError))]
struct GetPostPath {
    id: Id<PostMarker>,
}

async fn get_post(
    GetPostPath { id }: GetPostPath,
    State(db): State<Arc<DbClient>>,
) -> Result<Json<FeedPost>> {
    let post = db
        .fetch_post(id)
        .await?
        .ok_or(ServerError::PostByIdNotFound(id))?;

    Ok(Json(post))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/posts/{id}/image", rejection(ServerError))]
struct GetPostImagePath {
    id: Id<PostMarker>,
}

async fn get_post_image(
    GetPostImagePath { id }: GetPostImagePath,
    State(db): State<Arc<DbClient>>,
) -> Result<impl IntoResponse> {
    let image = db
        .fetch_post_image(id)
        .await?
        .ok_or(ServerError::PostImageNotFound(id))?;

    Ok((
        [
            (CONTENT_TYPE, image.content_type),
            (X_CONTENT_TYPE_OPTIONS, "nosniff".to_owned()),
        ],
        image.bytes,
    ))
}

#[derive(TypedPath, Deserialize)]
#[typed_path("/posts/{id}/delete", rejection(ServerError))]
struct DeletePostPath {
    id: Id<PostMarker>,
}

async fn delete_post(
    DeletePostPath { id }: DeletePostPath,
    State(db): State<Arc<DbClient>>,
    user: AuthenticatedUser,
) -> Result<StatusCode> {
    if !db.delete_post(id, user.user_id()).await? {
        return Err(ServerError::PostByIdNotFound(id));
    }
    info!(post = %id, user = %user.user_id(), "Post deleted");

    Ok(StatusCode::NO_CONTENT)
}
