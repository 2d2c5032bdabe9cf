use crate::model::InferenceError;
use serde::Deserialize;

/// Index of the safe class in the model's output.
pub const SAFE_CLASS_INDEX: usize = 0;
pub const DEFAULT_NSFW_THRESHOLD: f32 = 0.5;

/// How class scores become a flagged/not flagged decision.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub enum DecisionRule {
    /// Flagged unless the highest scoring class is the safe class.
    #[default]
    TopClass,
    /// Flagged when the probability mass outside the safe class reaches `threshold`.
    NsfwProbability { threshold: f32 },
}

/// The configurable name of a [`DecisionRule`], without parameters.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRuleKind {
    #[default]
    TopClass,
    NsfwProbability,
}

impl DecisionRule {
    #[must_use]
    pub fn from_kind(kind: DecisionRuleKind, threshold: f32) -> Self {
        match kind {
            DecisionRuleKind::TopClass => Self::TopClass,
            DecisionRuleKind::NsfwProbability => Self::NsfwProbability { threshold },
        }
    }

    pub fn is_flagged(self, scores: &[f32]) -> Result<bool, InferenceError> {
        if scores.is_empty() {
            return Err(InferenceError::EmptyScores);
        }
        if scores.iter().any(|score| !score.is_finite()) {
            return Err(InferenceError::NonFiniteScore);
        }

        let flagged = match self {
            Self::TopClass => argmax(scores) != SAFE_CLASS_INDEX,
            Self::NsfwProbability { threshold } => nsfw_probability(scores) >= threshold,
        };

        Ok(flagged)
    }
}

/// First index of the maximum score.
fn argmax(scores: &[f32]) -> usize {
    let mut best = 0;
    for (index, score) in scores.iter().enumerate().skip(1) {
        if *score > scores[best] {
            best = index;
        }
    }
    best
}

/// Probability mass on every class but the safe one.
///
/// Scores that already form a distribution are used as is, anything else is
/// treated as logits.
fn nsfw_probability(scores: &[f32]) -> f32 {
    let probabilities = if is_distribution(scores) {
        scores.to_vec()
    } else {
        softmax(scores)
    };

    probabilities
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != SAFE_CLASS_INDEX)
        .map(|(_, probability)| probability)
        .sum()
}

fn is_distribution(scores: &[f32]) -> bool {
    scores.iter().all(|score| (0.0..=1.0).contains(score))
        && (scores.iter().sum::<f32>() - 1.0).abs() < 1e-3
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|logit| (logit - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|exp| exp / total).collect()
}
