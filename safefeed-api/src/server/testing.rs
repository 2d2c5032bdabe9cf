use crate::server::{AuthConfig, ServerRouter, ServerState};
use axum::Router;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use safefeed_classifier::{
    ClassifierConfig, ErrorPolicy, ImageClassifier, InferenceError, ModelLoadError, NsfwModel,
    preprocess::InputBatch,
};
use safefeed_common::{
    model::{
        Id,
        auth::{Password, PasswordHash},
        user::{CreateUser, UserHandle, UserMarker},
    },
    snowflake::{ProcessId, WorkerId},
};
use safefeed_db::client::DbClient;
use std::{
    io::Cursor,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

pub const TEST_PASSWORD: &str = "correct horse";

/// How often the fake model was loaded and asked for scores.
#[derive(Clone, Debug, Default)]
pub struct ModelCounters {
    pub loads: Arc<AtomicUsize>,
    pub calls: Arc<AtomicUsize>,
}

struct FixedScoresModel {
    scores: Vec<f32>,
    calls: Arc<AtomicUsize>,
}

impl NsfwModel for FixedScoresModel {
    fn predict(&self, _batch: &InputBatch) -> Result<Vec<f32>, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.scores.clone())
    }
}

fn fixed_scores_classifier(
    scores: &[f32],
    on_error: ErrorPolicy,
) -> (Arc<ImageClassifier>, ModelCounters) {
    let counters = ModelCounters::default();
    let scores = scores.to_vec();
    let loader_counters = counters.clone();
    let config = ClassifierConfig {
        on_error,
        ..ClassifierConfig::default()
    };

    let classifier = ImageClassifier::new(config, move || {
        loader_counters.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FixedScoresModel {
            scores: scores.clone(),
            calls: Arc::clone(&loader_counters.calls),
        }) as Box<dyn NsfwModel>)
    });

    (Arc::new(classifier), counters)
}

/// A classifier whose model always returns `scores`, failing open.
pub fn classifier_with(scores: &[f32]) -> (Arc<ImageClassifier>, ModelCounters) {
    fixed_scores_classifier(scores, ErrorPolicy::Allow)
}

pub fn blocking_classifier(scores: &[f32]) -> Arc<ImageClassifier> {
    fixed_scores_classifier(scores, ErrorPolicy::Block).0
}

pub fn failing_classifier() -> Arc<ImageClassifier> {
    Arc::new(ImageClassifier::new(ClassifierConfig::default(), || {
        Err(ModelLoadError::Other("no weights in tests".to_owned()))
    }))
}

pub async fn test_db() -> DbClient {
    DbClient::connect("sqlite::memory:", WorkerId::default(), ProcessId::default())
        .await
        .unwrap()
}

pub async fn create_user(db: &DbClient, handle: &str) -> Id<UserMarker> {
    let password = Password::new(TEST_PASSWORD.to_owned()).unwrap();
    db.create_user(&CreateUser {
        handle: UserHandle::new(handle.to_owned()).unwrap(),
        password_hash: PasswordHash::generate(&password).unwrap(),
    })
    .await
    .unwrap()
}

pub fn png_bytes() -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(6, 6, Rgb([120_u8, 80, 200])));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png).unwrap();
    bytes.into_inner()
}

pub async fn test_app(classifier: Arc<ImageClassifier>) -> (Router, Arc<DbClient>) {
    let db_client = Arc::new(test_db().await);
    let state = ServerState {
        db_client: Arc::clone(&db_client),
        classifier,
        auth_config: AuthConfig::default(),
    };
    let router: ServerRouter = crate::server::routes();

    (router.with_state(state), db_client)
}
