use crate::{
    model::{InferenceError, ModelLoadError, NsfwModel},
    preprocess::{INPUT_CHANNELS, INPUT_SIZE, InputBatch},
};
use std::path::Path;
use tracing::info;
use tract_onnx::prelude::{
    DatumExt, Framework, Graph, InferenceModelExt, SimplePlan, Tensor, TractError, TypedFact,
    TypedOp, tvec,
};

type OnnxPlan = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// An image classifier exported to ONNX, run through tract.
pub struct OnnxModel {
    plan: OnnxPlan,
}

impl OnnxModel {
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let to_load_error = |err: TractError| ModelLoadError::Onnx {
            path: path.to_path_buf(),
            message: format!("{err:#}"),
        };

        let side = INPUT_SIZE as usize;
        let plan = tract_onnx::onnx()
            .model_for_path(path)
            .map_err(to_load_error)?
            .with_input_fact(0, f32::fact([1, side, side, INPUT_CHANNELS]).into())
            .map_err(to_load_error)?
            .into_optimized()
            .map_err(to_load_error)?
            .into_runnable()
            .map_err(to_load_error)?;

        info!(path = %path.display(), "Loaded ONNX model");

        Ok(Self { plan })
    }
}

impl NsfwModel for OnnxModel {
    fn predict(&self, batch: &InputBatch) -> Result<Vec<f32>, InferenceError> {
        let input: Tensor = batch.clone().into();
        let outputs = self
            .plan
            .run(tvec!(input.into()))
            .map_err(|err| InferenceError::Runtime(format!("{err:#}")))?;

        let scores = outputs
            .first()
            .ok_or(InferenceError::EmptyScores)?
            .to_array_view::<f32>()
            .map_err(|err| InferenceError::Runtime(format!("{err:#}")))?
            .iter()
            .copied()
            .collect();

        Ok(scores)
    }
}
