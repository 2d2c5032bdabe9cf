//! NSFW gate for uploaded images.
//!
//! [`ImageClassifier`] owns a lazily loaded [`NsfwModel`] and turns one image
//! into a [`Verdict`]. Loading happens on first use, at most once per
//! classifier, and is never retried.

mod classifier;
pub mod decision;
pub mod model;
pub mod onnx;
pub mod preprocess;

pub use classifier::{ClassifierConfig, ClassifierError, ErrorPolicy, ImageClassifier, Verdict};
pub use decision::{DecisionRule, DecisionRuleKind};
pub use model::{InferenceError, ModelLoadError, NsfwModel};
pub use preprocess::sniff_mime_type;
