//! Post creation with the NSFW gate in front of persistence.
//!
//! `Received -> ClassifyPending (image only) -> ReadyToPersist -> Persisted`,
//! or `Rejected` when the image blocks under the configured error policy.

use axum::http::StatusCode;
use safefeed_classifier::{ClassifierError, ImageClassifier, Verdict};
use safefeed_common::model::{
    Id,
    post::{CreatePost, PostContent, PostImage, PostMarker},
    user::UserMarker,
};
use safefeed_db::client::{DbClient, DbError};
use std::{
    fmt::{Display, Formatter},
    sync::Arc,
};
use thiserror::Error;
use tokio::task::{self, JoinError};
use tracing::{debug, info};

/// A post as submitted, before the image gate.
#[derive(Clone, Eq, PartialEq, Debug, Hash)]
pub struct PostSubmission {
    pub content: PostContent,
    pub image: Option<PostImage>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum SubmissionOutcome {
    Persisted(Id<PostMarker>),
    Rejected(RejectionReason),
}

#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum RejectionReason {
    Nsfw,
    /// Classification failed and the error policy blocks unchecked images.
    Unclassifiable,
}

impl Display for RejectionReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::Nsfw => f.write_str("The image is NSFW and cannot be posted."),
            RejectionReason::Unclassifiable => {
                f.write_str("The image could not be checked and cannot be posted.")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("A post needs text or an image")]
    Empty,
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error("Classification task failed: {0}")]
    Join(#[from] JoinError),
    #[error(transparent)]
    Database(#[from] DbError),
}

impl SubmissionError {
    pub fn status(&self) -> StatusCode {
        match self {
            SubmissionError::Empty => StatusCode::BAD_REQUEST,
            SubmissionError::Classifier(_)
            | SubmissionError::Join(_)
            | SubmissionError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Persists the post unless its image is blocked.
///
/// Posts without an image never reach the classifier. A zero-byte image counts as no image.
pub async fn submit_post(
    db: &DbClient,
    classifier: &Arc<ImageClassifier>,
    author: Id<UserMarker>,
    submission: PostSubmission,
) -> Result<SubmissionOutcome, SubmissionError> {
    let PostSubmission { content, image } = submission;
    let image = image.filter(|image| !image.bytes.is_empty());

    if content.is_blank() && image.is_none() {
        return Err(SubmissionError::Empty);
    }

    let image = match image {
        Some(image) => {
            let (image, verdict) = classify(Arc::clone(classifier), image).await?;
            debug!(%author, ?verdict, "Image classified");

            if verdict.blocks(classifier.error_policy()) {
                let reason = match verdict {
                    Verdict::ClassificationFailed => RejectionReason::Unclassifiable,
                    Verdict::Flagged | Verdict::NotFlagged => RejectionReason::Nsfw,
                };
                info!(%author, ?reason, "Post rejected");
                return Ok(SubmissionOutcome::Rejected(reason));
            }

            Some(image)
        }
        None => None,
    };

    let post = CreatePost {
        author,
        content,
        image,
    };
    let post_id = db.create_post(&post).await?;
    info!(%author, %post_id, has_image = post.image.is_some(), "Post persisted");

    Ok(SubmissionOutcome::Persisted(post_id))
}

/// Runs model loading and inference on the blocking pool.
async fn classify(
    classifier: Arc<ImageClassifier>,
    image: PostImage,
) -> Result<(PostImage, Verdict), SubmissionError> {
    let (image, verdict) = task::spawn_blocking(move || {
        let verdict = classifier.evaluate(&image.bytes);
        (image, verdict)
    })
    .await?;

    Ok((image, verdict?))
}

#[cfg(test)]
mod tests {
    use crate::server::{
        submission::{
            PostSubmission, RejectionReason, SubmissionError, SubmissionOutcome, submit_post,
        },
        testing::{
            blocking_classifier, classifier_with, create_user, failing_classifier, png_bytes,
            test_db,
        },
    };
    use safefeed_classifier::ClassifierError;
    use safefeed_common::model::post::{PostContent, PostImage};
    use std::sync::{Arc, atomic::Ordering};

    fn submission(content: &str, image: Option<Vec<u8>>) -> PostSubmission {
        PostSubmission {
            content: PostContent::new(content.to_owned()).unwrap(),
            image: image.map(|bytes| PostImage::new(Some("image/png".to_owned()), bytes)),
        }
    }

    #[tokio::test]
    async fn text_only_posts_skip_the_classifier() {
        let db = test_db().await;
        let author = create_user(&db, "alice").await;
        let (classifier, model) = classifier_with(&[0.1, 0.9]);

        let outcome = submit_post(&db, &classifier, author, submission("hello world", None))
            .await
            .unwrap();

        let SubmissionOutcome::Persisted(post_id) = outcome else {
            panic!("text post was rejected: {outcome:?}");
        };
        let feed = db.fetch_feed().await.unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0].post.id, post_id);
        assert_eq!(feed[0].post.content.get(), "hello world");
        assert!(!feed[0].post.has_image);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
        assert_eq!(model.loads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn safe_images_are_persisted() {
        let db = test_db().await;
        let author = create_user(&db, "alice").await;
        let (classifier, model) = classifier_with(&[0.9, 0.1]);

        let outcome = submit_post(
            &db,
            &classifier,
            author,
            submission("sunset", Some(png_bytes())),
        )
        .await
        .unwrap();

        let SubmissionOutcome::Persisted(post_id) = outcome else {
            panic!("safe image was rejected: {outcome:?}");
        };
        let image = db.fetch_post_image(post_id).await.unwrap().unwrap();
        assert_eq!(image.bytes, png_bytes());
        assert_eq!(image.content_type, "image/png");
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn flagged_images_are_rejected_without_a_post() {
        let db = test_db().await;
        let author = create_user(&db, "alice").await;
        let (classifier, _) = classifier_with(&[0.1, 0.9]);

        let outcome = submit_post(
            &db,
            &classifier,
            author,
            submission("look", Some(png_bytes())),
        )
        .await
        .unwrap();

        assert_eq!(outcome, SubmissionOutcome::Rejected(RejectionReason::Nsfw));
        assert_eq!(
            RejectionReason::Nsfw.to_string(),
            "The image is NSFW and cannot be posted."
        );
        assert!(db.fetch_feed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_images_follow_the_error_policy() {
        let db = test_db().await;
        let author = create_user(&db, "alice").await;
        let (allow, _) = classifier_with(&[0.1, 0.9]);
        let block = blocking_classifier(&[0.9, 0.1]);

        let allowed = submit_post(
            &db,
            &allow,
            author,
            submission("garbage", Some(b"not an image".to_vec())),
        )
        .await
        .unwrap();
        assert!(matches!(allowed, SubmissionOutcome::Persisted(_)));

        let blocked = submit_post(
            &db,
            &block,
            author,
            submission("garbage", Some(b"not an image".to_vec())),
        )
        .await
        .unwrap();
        assert_eq!(
            blocked,
            SubmissionOutcome::Rejected(RejectionReason::Unclassifiable)
        );

        assert_eq!(db.fetch_feed().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_submissions() {
        let db = test_db().await;
        let author = create_user(&db, "alice").await;
        let (classifier, model) = classifier_with(&[0.9, 0.1]);

        let err = submit_post(&db, &classifier, author, submission("   ", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmissionError::Empty));

        let err = submit_post(&db, &classifier, author, submission("", Some(Vec::new())))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmissionError::Empty));

        let outcome = submit_post(&db, &classifier, author, submission("", Some(png_bytes())))
            .await
            .unwrap();
        assert!(matches!(outcome, SubmissionOutcome::Persisted(_)));
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unloadable_model_fails_the_request() {
        let db = test_db().await;
        let author = create_user(&db, "alice").await;
        let classifier = failing_classifier();

        let err = submit_post(
            &db,
            &classifier,
            author,
            submission("hi", Some(png_bytes())),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            SubmissionError::Classifier(ClassifierError::ModelUnavailable(_))
        ));
        assert_eq!(err.status(), axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        assert!(db.fetch_feed().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_submissions_load_the_model_once() {
        let db = Arc::new(test_db().await);
        let author = create_user(&db, "alice").await;
        let (classifier, model) = classifier_with(&[0.9, 0.1]);

        let mut handles = Vec::new();
        for n in 0..8 {
            let db = Arc::clone(&db);
            let classifier = Arc::clone(&classifier);
            handles.push(tokio::spawn(async move {
                submit_post(
                    &db,
                    &classifier,
                    author,
                    submission(&format!("post {n}"), Some(png_bytes())),
                )
                .await
            }));
        }
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap().unwrap(),
                SubmissionOutcome::Persisted(_)
            ));
        }

        assert_eq!(model.loads.load(Ordering::SeqCst), 1);
        assert_eq!(model.calls.load(Ordering::SeqCst), 8);
        assert_eq!(db.fetch_feed().await.unwrap().len(), 8);
    }
}
