use crate::{
    decision::DecisionRule,
    model::{ModelLoadError, NsfwModel},
    onnx::OnnxModel,
    preprocess::preprocess,
};
use serde::Deserialize;
use std::{
    path::PathBuf,
    sync::{Arc, OnceLock},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

type ModelLoader = Box<dyn Fn() -> Result<Box<dyn NsfwModel>, ModelLoadError> + Send + Sync>;
type LoadedModel = Result<Box<dyn NsfwModel>, Arc<ModelLoadError>>;

/// Three-valued result of checking one image.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Hash)]
pub enum Verdict {
    Flagged,
    NotFlagged,
    /// The image could not be decoded or the model could not score it.
    ClassificationFailed,
}

/// What to do with an image that could not be classified.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    #[default]
    Allow,
    Block,
}

impl Verdict {
    /// Whether an image with this verdict must be kept off the feed.
    #[must_use]
    pub fn blocks(self, policy: ErrorPolicy) -> bool {
        match self {
            Self::Flagged => true,
            Self::NotFlagged => false,
            Self::ClassificationFailed => policy == ErrorPolicy::Block,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub struct ClassifierConfig {
    pub decision_rule: DecisionRule,
    pub on_error: ErrorPolicy,
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("The image classifier is unavailable: {0}")]
    ModelUnavailable(Arc<ModelLoadError>),
}

/// Lazily loaded image classifier, shared by every request of a process.
pub struct ImageClassifier {
    config: ClassifierConfig,
    loader: ModelLoader,
    model: OnceLock<LoadedModel>,
}

impl ImageClassifier {
    pub fn new<F>(config: ClassifierConfig, loader: F) -> Self
    where
        F: Fn() -> Result<Box<dyn NsfwModel>, ModelLoadError> + Send + Sync + 'static,
    {
        Self {
            config,
            loader: Box::new(loader),
            model: OnceLock::new(),
        }
    }

    /// A classifier backed by an ONNX file that is read on first use.
    pub fn from_onnx_file(config: ClassifierConfig, path: PathBuf) -> Self {
        Self::new(config, move || {
            OnnxModel::load(&path).map(|model| Box::new(model) as Box<dyn NsfwModel>)
        })
    }

    #[must_use]
    pub fn error_policy(&self) -> ErrorPolicy {
        self.config.on_error
    }

    /// Loads the model now instead of on the first classified image.
    pub fn warm_up(&self) -> Result<(), ClassifierError> {
        self.model().map(|_| ())
    }

    fn model(&self) -> Result<&dyn NsfwModel, ClassifierError> {
        let loaded = self.model.get_or_init(|| {
            info!("Loading NSFW model");
            (self.loader)().map_err(|err| {
                error!(error = %err, "NSFW model failed to load");
                Arc::new(err)
            })
        });

        match loaded {
            Ok(model) => Ok(model.as_ref()),
            Err(err) => Err(ClassifierError::ModelUnavailable(Arc::clone(err))),
        }
    }

    /// Classifies one image. Blocks the calling thread for the duration of inference.
    ///
    /// Undecodable images and inference failures yield [`Verdict::ClassificationFailed`],
    /// a model that cannot be loaded is an error.
    pub fn evaluate(&self, image_bytes: &[u8]) -> Result<Verdict, ClassifierError> {
        let model = self.model()?;

        let batch = match preprocess(image_bytes) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(error = %err, "Image could not be preprocessed");
                return Ok(Verdict::ClassificationFailed);
            }
        };

        let flagged = model.predict(&batch).and_then(|scores| {
            debug!(?scores, "Image scored");
            self.config.decision_rule.is_flagged(&scores)
        });

        let verdict = match flagged {
            Ok(true) => Verdict::Flagged,
            Ok(false) => Verdict::NotFlagged,
            Err(err) => {
                warn!(error = %err, "Image could not be classified");
                Verdict::ClassificationFailed
            }
        };

        Ok(verdict)
    }

    /// Two-valued check with the configured [`ErrorPolicy`] already applied.
    ///
    /// Never returns [`Verdict::ClassificationFailed`].
    pub fn classify(&self, image_bytes: &[u8]) -> Result<Verdict, ClassifierError> {
        if self.evaluate(image_bytes)?.blocks(self.config.on_error) {
            Ok(Verdict::Flagged)
        } else {
            Ok(Verdict::NotFlagged)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        classifier::{ClassifierConfig, ClassifierError, ErrorPolicy, ImageClassifier, Verdict},
        decision::DecisionRule,
        model::{InferenceError, ModelLoadError, NsfwModel},
        preprocess::InputBatch,
    };
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use std::{
        io::Cursor,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
        time::Duration,
    };

    struct FixedScores(Vec<f32>);

    impl NsfwModel for FixedScores {
        fn predict(&self, _batch: &InputBatch) -> Result<Vec<f32>, InferenceError> {
            Ok(self.0.clone())
        }
    }

    struct Broken;

    impl NsfwModel for Broken {
        fn predict(&self, _batch: &InputBatch) -> Result<Vec<f32>, InferenceError> {
            Err(InferenceError::Runtime("tensor mismatch".to_owned()))
        }
    }

    fn with_scores(scores: &[f32], config: ClassifierConfig) -> ImageClassifier {
        let scores = scores.to_vec();
        ImageClassifier::new(config, move || {
            Ok(Box::new(FixedScores(scores.clone())) as Box<dyn NsfwModel>)
        })
    }

    fn png() -> Vec<u8> {
        let image = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(4, 4, Rgb([10_u8, 200, 30])));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).unwrap();
        bytes.into_inner()
    }

    #[test]
    fn verdicts() {
        let config = ClassifierConfig::default();

        assert_eq!(
            with_scores(&[0.9, 0.1], config).evaluate(&png()).unwrap(),
            Verdict::NotFlagged
        );
        assert_eq!(
            with_scores(&[0.1, 0.9], config).evaluate(&png()).unwrap(),
            Verdict::Flagged
        );
    }

    #[test]
    fn decision_rule_is_configurable() {
        let scores = [0.45, 0.3, 0.25];
        let top_class = with_scores(&scores, ClassifierConfig::default());
        let probability = with_scores(
            &scores,
            ClassifierConfig {
                decision_rule: DecisionRule::NsfwProbability { threshold: 0.5 },
                on_error: ErrorPolicy::Allow,
            },
        );

        assert_eq!(top_class.evaluate(&png()).unwrap(), Verdict::NotFlagged);
        assert_eq!(probability.evaluate(&png()).unwrap(), Verdict::Flagged);
    }

    #[test]
    fn failures_follow_error_policy() {
        let allow = with_scores(&[0.1, 0.9], ClassifierConfig::default());
        let block = with_scores(
            &[0.9, 0.1],
            ClassifierConfig {
                decision_rule: DecisionRule::TopClass,
                on_error: ErrorPolicy::Block,
            },
        );

        assert_eq!(
            allow.evaluate(b"not an image").unwrap(),
            Verdict::ClassificationFailed
        );
        assert_eq!(
            allow.classify(b"not an image").unwrap(),
            Verdict::NotFlagged
        );
        assert_eq!(block.classify(b"not an image").unwrap(), Verdict::Flagged);
        assert_eq!(block.classify(&png()).unwrap(), Verdict::NotFlagged);
    }

    #[test]
    fn inference_errors_are_classification_failures() {
        let classifier = ImageClassifier::new(ClassifierConfig::default(), || {
            Ok(Box::new(Broken) as Box<dyn NsfwModel>)
        });

        assert_eq!(
            classifier.evaluate(&png()).unwrap(),
            Verdict::ClassificationFailed
        );
    }

    #[test]
    fn empty_scores_are_classification_failures() {
        let classifier = with_scores(&[], ClassifierConfig::default());

        assert_eq!(
            classifier.evaluate(&png()).unwrap(),
            Verdict::ClassificationFailed
        );
    }

    #[test]
    fn model_loads_once_under_concurrency() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let classifier = ImageClassifier::new(ClassifierConfig::default(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            Ok(Box::new(FixedScores(vec![0.8, 0.2])) as Box<dyn NsfwModel>)
        });
        let image = png();

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    assert_eq!(classifier.evaluate(&image).unwrap(), Verdict::NotFlagged);
                });
            }
        });

        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn load_failure_is_not_retried() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&loads);
        let classifier = ImageClassifier::new(ClassifierConfig::default(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ModelLoadError::Other("weights missing".to_owned()))
        });

        for _ in 0..3 {
            assert!(matches!(
                classifier.evaluate(&png()),
                Err(ClassifierError::ModelUnavailable(_))
            ));
        }
        assert!(classifier.warm_up().is_err());
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_model_file_is_unavailable() {
        let classifier = ImageClassifier::from_onnx_file(
            ClassifierConfig::default(),
            "/nonexistent/safefeed/model.onnx".into(),
        );

        assert!(matches!(
            classifier.classify(&png()),
            Err(ClassifierError::ModelUnavailable(_))
        ));
    }
}
