use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::evaluator::{
    require_expected, threshold, EvalContext, Evaluator, EvaluatorRegistry, Score,
};
use crate::error::EngineError;

const DEFAULT_THRESHOLD: f64 = 0.8;

pub(crate) fn register(registry: &mut EvaluatorRegistry) {
    registry.register(
        "semantic_similarity",
        Arc::new(|cfg, _| {
            let threshold = threshold(cfg, DEFAULT_THRESHOLD)?;
            Ok(Arc::new(SemanticSimilarity { threshold }) as Arc<dyn Evaluator>)
        }),
    );
}

/// Cosine similarity between term-frequency vectors of the expected and actual text.
pub struct SemanticSimilarity {
    threshold: f64,
}

#[async_trait]
impl Evaluator for SemanticSimilarity {
    fn kind(&self) -> &'static str {
        "semantic_similarity"
    }

    async fn score(&self, ctx: &EvalContext<'_>) -> Result<Score, EngineError> {
        let expected = require_expected(ctx)?;
        let value = text_similarity(expected, ctx.actual_output);
        Ok(Score::with_pass(value, value >= self.threshold))
    }
}

fn term_frequencies(text: &str) -> HashMap<String, f64> {
    let mut tf = HashMap::new();
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        *tf.entry(token.to_lowercase()).or_insert(0.0) += 1.0;
    }
    tf
}

pub fn text_similarity(a: &str, b: &str) -> f64 {
    let (ta, tb) = (term_frequencies(a), term_frequencies(b));
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }

    let dot: f64 = ta
        .iter()
        .filter_map(|(term, x)| tb.get(term).map(|y| x * y))
        .sum();
    let sq_a: f64 = ta.values().map(|x| x * x).sum();
    let sq_b: f64 = tb.values().map(|x| x * x).sum();

    // One sqrt over the product keeps exact ratios exact (1/sqrt(4) == 0.5).
    if sq_a == 0.0 || sq_b == 0.0 {
        0.0
    } else {
        (dot / (sq_a * sq_b).sqrt()).clamp(0.0, 1.0)
    }
}
