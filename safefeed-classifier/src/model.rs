use crate::preprocess::InputBatch;
use std::path::PathBuf;
use thiserror::Error;

/// Anything that maps a preprocessed image batch to per-class scores.
///
/// Class 0 is the safe class; every other index is treated as objectionable.
pub trait NsfwModel: Send + Sync {
    fn predict(&self, batch: &InputBatch) -> Result<Vec<f32>, InferenceError>;
}

#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("Model file {} could not be loaded: {message}", path.display())]
    Onnx { path: PathBuf, message: String },
    #[error("Model could not be loaded: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Inference failed: {0}")]
    Runtime(String),
    #[error("Model returned no scores")]
    EmptyScores,
    #[error("Model returned a non-finite score")]
    NonFiniteScore,
}
